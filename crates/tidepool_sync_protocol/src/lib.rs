//! # Tidepool Sync Protocol
//!
//! Wire types and codecs for Tidepool replication.
//!
//! This crate provides:
//! - Client and server messages (`sync`, `op`, `ack`, presence, heartbeats)
//! - Replica types and presence records
//! - Acknowledgement nonces over server-order ranges
//! - CBOR and JSON framing
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod messages;
mod nonce;
mod replica;

pub use codec::{decode_cbor, decode_json, encode_cbor, encode_json, WireFormat};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{ClientMessage, ServerMessage};
pub use nonce::{AckNonce, ServerOrder};
pub use replica::{ReplicaType, UserInfo};
