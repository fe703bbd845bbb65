//! Protocol messages for sync.
//!
//! Messages are internally tagged by `type` with kebab-case names, and
//! their fields are camelCase on the wire.

use crate::replica::UserInfo;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tidepool_core::{DocumentBaseline, Operation, Timestamp};

/// A message sent by a replica to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Reconciles the replica with the library.
    Sync {
        /// Sending replica.
        replica_id: String,
        /// Replica clock at send time.
        timestamp: Timestamp,
        /// Last server state the replica has seen; `None` means nothing.
        since: Option<Timestamp>,
        /// Asks the server to resend everything and reset local data.
        #[serde(default)]
        resync_all: bool,
        /// Unconfirmed local operations.
        #[serde(default)]
        operations: Vec<Operation>,
        /// Local baselines, sent when the replica initializes a library.
        #[serde(default)]
        baselines: Vec<DocumentBaseline>,
        /// Schema version the replica writes with.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema_version: Option<u32>,
    },
    /// Realtime operations.
    Op {
        /// Sending replica.
        replica_id: String,
        /// Replica clock at send time.
        timestamp: Timestamp,
        /// The operations.
        operations: Vec<Operation>,
    },
    /// Confirms receipt of server data.
    Ack {
        /// Sending replica.
        replica_id: String,
        /// Nonce from a `sync-resp` or `op-re`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
        /// Latest logical time the replica has applied.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
    },
    /// Publishes presence.
    PresenceUpdate {
        /// Sending replica.
        replica_id: String,
        /// Application presence payload.
        presence: JsonValue,
        /// Library-maintained presence payload.
        #[serde(default)]
        internal: JsonValue,
    },
    /// Liveness check.
    Heartbeat {
        /// Sending replica.
        replica_id: String,
        /// Replica clock at send time.
        timestamp: Timestamp,
    },
}

impl ClientMessage {
    /// Returns the sending replica.
    pub fn replica_id(&self) -> &str {
        match self {
            ClientMessage::Sync { replica_id, .. }
            | ClientMessage::Op { replica_id, .. }
            | ClientMessage::Ack { replica_id, .. }
            | ClientMessage::PresenceUpdate { replica_id, .. }
            | ClientMessage::Heartbeat { replica_id, .. } => replica_id,
        }
    }

    /// Returns the wire name of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Sync { .. } => "sync",
            ClientMessage::Op { .. } => "op",
            ClientMessage::Ack { .. } => "ack",
            ClientMessage::PresenceUpdate { .. } => "presence-update",
            ClientMessage::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// A message sent by the server to a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Answer to `sync`.
    SyncResp {
        /// Operations the replica is missing.
        operations: Vec<Operation>,
        /// Baselines the replica is missing.
        baselines: Vec<DocumentBaseline>,
        /// Timestamp below which every replica has acknowledged.
        global_ack_timestamp: Option<Timestamp>,
        /// Presence of the other connected replicas, keyed by replica id.
        peer_presence: BTreeMap<String, UserInfo>,
        /// The replica must discard its local data before applying.
        overwrite_local_data: bool,
        /// Logical time the server has on record for the replica.
        acked_timestamp: Option<Timestamp>,
        /// Nonce to echo once the response is stored.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_this_nonce: Option<String>,
    },
    /// Operations written by another replica.
    OpRe {
        /// The operations.
        operations: Vec<Operation>,
        /// Baselines, present when the writer initialized the library.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        baselines: Option<Vec<DocumentBaseline>>,
        /// Writing replica.
        replica_id: String,
        /// Current global acknowledgement.
        global_ack_timestamp: Option<Timestamp>,
        /// Nonce to echo once the operations are stored.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_this_nonce: Option<String>,
    },
    /// The server stored the replica's `op` batch.
    ServerAck {
        /// Latest timestamp of the stored batch.
        timestamp: Timestamp,
    },
    /// The global acknowledgement advanced.
    GlobalAck {
        /// New global acknowledgement.
        timestamp: Timestamp,
    },
    /// The replica may not write.
    Forbidden,
    /// The server needs the replica's full history.
    NeedSince {
        /// Always `None`: resend since the beginning.
        since: Option<Timestamp>,
    },
    /// A peer's presence changed.
    PresenceChanged {
        /// The peer.
        replica_id: String,
        /// Its presence.
        user_info: UserInfo,
    },
    /// A peer went offline.
    PresenceOffline {
        /// The peer.
        replica_id: String,
        /// Its user.
        user_id: String,
    },
    /// Answer to `heartbeat`.
    HeartbeatResponse,
}

impl ServerMessage {
    /// Returns the wire name of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::SyncResp { .. } => "sync-resp",
            ServerMessage::OpRe { .. } => "op-re",
            ServerMessage::ServerAck { .. } => "server-ack",
            ServerMessage::GlobalAck { .. } => "global-ack",
            ServerMessage::Forbidden => "forbidden",
            ServerMessage::NeedSince { .. } => "need-since",
            ServerMessage::PresenceChanged { .. } => "presence-changed",
            ServerMessage::PresenceOffline { .. } => "presence-offline",
            ServerMessage::HeartbeatResponse => "heartbeat-response",
        }
    }
}
