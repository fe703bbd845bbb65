//! Error types for the sync protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while framing or interpreting protocol messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to encode a message.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode a message.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// An acknowledgement nonce could not be parsed.
    #[error("invalid ack nonce: {nonce:?}")]
    InvalidNonce {
        /// The rejected nonce.
        nonce: String,
    },

    /// A replica type name is unknown.
    #[error("unknown replica type: {name:?}")]
    UnknownReplicaType {
        /// The rejected name.
        name: String,
    },
}

impl ProtocolError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Create an invalid nonce error.
    pub fn invalid_nonce(nonce: impl Into<String>) -> Self {
        Self::InvalidNonce {
            nonce: nonce.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::decoding_failed("truncated");
        assert_eq!(err.to_string(), "decoding failed: truncated");

        let err = ProtocolError::invalid_nonce("zz");
        assert!(err.to_string().contains("zz"));
    }
}
