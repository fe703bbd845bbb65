//! # Tidepool Sync Engine
//!
//! Client replica for Tidepool libraries.
//!
//! This crate provides:
//! - A local store of baselines, operations and materialized views
//! - Optimistic local edits through the diff engine, with undo and redo
//! - Outbound operation batching
//! - The client side of the sync protocol (sync, live operations, acks)
//! - Local folding once the server reports a global acknowledgement
//! - Peer presence, heartbeats and reconnects with exponential backoff
//! - A transport abstraction with mock and in-process implementations
//!
//! ## Architecture
//!
//! The engine is driven from outside: the owner of the connection feeds
//! server messages to [`SyncEngine::receive`] and calls [`SyncEngine::tick`]
//! periodically. Outbound messages go through a [`SyncTransport`].
//!
//! ## Key Invariants
//!
//! - Local edits are visible immediately and survive until acknowledged
//! - An acknowledged time never precedes an unsent local operation
//! - Nothing is folded at or beyond the oldest unacknowledged local operation
//! - An overwriting sync response replaces all local data

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batcher;
mod config;
mod error;
mod local;
mod state;
mod transport;

pub use batcher::OpBatcher;
pub use config::{BatchConfig, RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use local::LocalStore;
pub use state::{SyncEngine, SyncState, SyncStats};
pub use transport::{ChannelTransport, MockTransport, SyncTransport};
