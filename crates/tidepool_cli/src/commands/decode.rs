//! Decode command implementation.

use serde::Serialize;
use std::path::Path;
use tidepool_sync_protocol::{ClientMessage, ServerMessage, WireFormat};

/// A decoded frame.
#[derive(Debug, Serialize)]
#[serde(tag = "side", content = "message", rename_all = "lowercase")]
pub enum DecodedFrame {
    /// Sent by a replica.
    Client(ClientMessage),
    /// Sent by the server.
    Server(ServerMessage),
}

/// Runs the decode command.
pub fn run(frame: &Path, side: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = std::fs::read(frame)
        .map_err(|e| format!("cannot read {}: {e}", frame.display()))?;
    let wire = WireFormat::detect(&bytes);
    let decoded = decode(&bytes, side)?;

    match format {
        "text" => {
            println!("Frame ({:?}, {} bytes)", wire, bytes.len());
            println!("================");
            println!("{}", summarize(&decoded));
        }
        _ => {
            println!("{}", serde_json::to_string_pretty(&decoded)?);
        }
    }

    Ok(())
}

/// Decodes a frame sent by `side` (`client`, `server` or `auto`).
pub fn decode(bytes: &[u8], side: &str) -> Result<DecodedFrame, Box<dyn std::error::Error>> {
    let wire = WireFormat::detect(bytes);
    match side {
        "client" => Ok(DecodedFrame::Client(wire.decode(bytes)?)),
        "server" => Ok(DecodedFrame::Server(wire.decode(bytes)?)),
        "auto" => match wire.decode::<ClientMessage>(bytes) {
            Ok(message) => Ok(DecodedFrame::Client(message)),
            Err(_) => Ok(DecodedFrame::Server(wire.decode(bytes)?)),
        },
        other => Err(format!("unknown side {other:?}; expected client, server or auto").into()),
    }
}

/// One-line description of a decoded frame.
pub fn summarize(frame: &DecodedFrame) -> String {
    match frame {
        DecodedFrame::Client(message) => {
            let detail = match message {
                ClientMessage::Sync {
                    since,
                    operations,
                    baselines,
                    ..
                } => format!(
                    " since={} operations={} baselines={}",
                    since.as_ref().map_or("none", |ts| ts.as_str()),
                    operations.len(),
                    baselines.len()
                ),
                ClientMessage::Op { operations, .. } => {
                    format!(" operations={}", operations.len())
                }
                ClientMessage::Ack { nonce, .. } => {
                    format!(" nonce={}", nonce.as_deref().unwrap_or("none"))
                }
                _ => String::new(),
            };
            format!("client {} replica={}{}", message.kind(), message.replica_id(), detail)
        }
        DecodedFrame::Server(message) => {
            let detail = match message {
                ServerMessage::SyncResp {
                    operations,
                    baselines,
                    overwrite_local_data,
                    ..
                } => format!(
                    " operations={} baselines={} overwrite={}",
                    operations.len(),
                    baselines.len(),
                    overwrite_local_data
                ),
                ServerMessage::OpRe {
                    operations,
                    replica_id,
                    ..
                } => format!(" from={replica_id} operations={}", operations.len()),
                ServerMessage::ServerAck { timestamp } | ServerMessage::GlobalAck { timestamp } => {
                    format!(" timestamp={timestamp}")
                }
                _ => String::new(),
            };
            format!("server {}{}", message.kind(), detail)
        }
    }
}
