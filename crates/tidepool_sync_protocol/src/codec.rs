//! Message framing.
//!
//! CBOR is the binary framing used between replicas and the server; JSON
//! is accepted for debugging and text transports.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Wire encoding of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// CBOR framing.
    #[default]
    Cbor,
    /// JSON text framing.
    Json,
}

/// Encodes a message to CBOR.
pub fn encode_cbor<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(message, &mut out)
        .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
    Ok(out)
}

/// Decodes a message from CBOR.
pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::decoding_failed(e.to_string()))
}

/// Encodes a message to JSON.
pub fn encode_json<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| ProtocolError::encoding_failed(e.to_string()))
}

/// Decodes a message from JSON.
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::decoding_failed(e.to_string()))
}

impl WireFormat {
    /// Encodes a message in this format.
    pub fn encode<T: Serialize>(self, message: &T) -> ProtocolResult<Vec<u8>> {
        match self {
            WireFormat::Cbor => encode_cbor(message),
            WireFormat::Json => encode_json(message),
        }
    }

    /// Decodes a message in this format.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> ProtocolResult<T> {
        match self {
            WireFormat::Cbor => decode_cbor(bytes),
            WireFormat::Json => decode_json(bytes),
        }
    }

    /// Guesses the format of a frame: JSON frames start with `{`.
    pub fn detect(bytes: &[u8]) -> Self {
        match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => WireFormat::Json,
            _ => WireFormat::Cbor,
        }
    }
}
