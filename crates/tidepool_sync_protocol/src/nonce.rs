//! Acknowledgement nonces.
//!
//! The server hands a replica an opaque nonce with every batch of server
//! ordered writes it ships. Echoing the nonce back in an `ack` proves the
//! replica stored that range of server orders.

use crate::error::{ProtocolError, ProtocolResult};
use std::fmt;

/// Position of a write in a library's server log.
pub type ServerOrder = u64;

/// An inclusive range of server orders carried by a nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckNonce {
    /// First server order of the range.
    pub first: ServerOrder,
    /// Last server order of the range.
    pub last: ServerOrder,
}

impl AckNonce {
    /// Creates a nonce for `first..=last`.
    pub fn new(first: ServerOrder, last: ServerOrder) -> Self {
        Self {
            first: first.min(last),
            last: first.max(last),
        }
    }

    /// Creates a nonce covering a single server order.
    pub fn single(order: ServerOrder) -> Self {
        Self::new(order, order)
    }

    /// Encodes the nonce as 32 hex characters.
    pub fn encode(&self) -> String {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.first.to_be_bytes());
        bytes[8..].copy_from_slice(&self.last.to_be_bytes());
        hex::encode(bytes)
    }

    /// Decodes a nonce produced by [`AckNonce::encode`].
    pub fn decode(nonce: &str) -> ProtocolResult<Self> {
        let bytes = hex::decode(nonce).map_err(|_| ProtocolError::invalid_nonce(nonce))?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| ProtocolError::invalid_nonce(nonce))?;
        let mut first = [0u8; 8];
        let mut last = [0u8; 8];
        first.copy_from_slice(&bytes[..8]);
        last.copy_from_slice(&bytes[8..]);
        let (first, last) = (u64::from_be_bytes(first), u64::from_be_bytes(last));
        if first > last {
            return Err(ProtocolError::invalid_nonce(nonce));
        }
        Ok(Self { first, last })
    }

    /// Returns true if acknowledging this range after `acked` leaves no gap.
    pub fn continues(&self, acked: ServerOrder) -> bool {
        self.first <= acked.saturating_add(1)
    }
}

impl fmt::Display for AckNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
