//! Replica types and presence records.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// How a replica participates in a library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicaType {
    /// Pushes and receives changes as they happen.
    #[default]
    Realtime,
    /// Pushes changes; pulls only on sync.
    Push,
    /// Receives changes as they happen; writes on sync only.
    PullRealtime,
    /// Pushes and pulls on sync only.
    Pull,
    /// Reads on sync only; never writes.
    ReadOnlyPull,
    /// Receives changes as they happen; never writes.
    ReadOnlyRealtime,
}

impl ReplicaType {
    /// All replica types.
    pub const ALL: [ReplicaType; 6] = [
        ReplicaType::Realtime,
        ReplicaType::Push,
        ReplicaType::PullRealtime,
        ReplicaType::Pull,
        ReplicaType::ReadOnlyPull,
        ReplicaType::ReadOnlyRealtime,
    ];

    /// Returns true if the replica may write operations.
    pub fn can_write(self) -> bool {
        !matches!(self, ReplicaType::ReadOnlyPull | ReplicaType::ReadOnlyRealtime)
    }

    /// Returns true if the replica receives rebroadcast operations.
    pub fn is_realtime(self) -> bool {
        matches!(
            self,
            ReplicaType::Realtime | ReplicaType::PullRealtime | ReplicaType::ReadOnlyRealtime
        )
    }

    /// Returns true if the replica sends operations as they are made.
    pub fn pushes_immediately(self) -> bool {
        matches!(self, ReplicaType::Realtime | ReplicaType::Push)
    }

    /// Returns the wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            ReplicaType::Realtime => "realtime",
            ReplicaType::Push => "push",
            ReplicaType::PullRealtime => "pull-realtime",
            ReplicaType::Pull => "pull",
            ReplicaType::ReadOnlyPull => "read-only-pull",
            ReplicaType::ReadOnlyRealtime => "read-only-realtime",
        }
    }
}

impl fmt::Display for ReplicaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicaType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReplicaType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownReplicaType { name: s.to_string() })
    }
}

/// Presence of one connected replica as seen by its peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    /// User owning the replica.
    pub id: String,
    /// The replica.
    pub replica_id: String,
    /// Application-defined presence payload.
    pub presence: JsonValue,
    /// Presence fields maintained by the client library itself.
    pub internal: JsonValue,
    /// Profile data attached by the server.
    #[serde(default)]
    pub profile: JsonValue,
}

impl UserInfo {
    /// Creates a presence record with empty payloads.
    pub fn new(id: impl Into<String>, replica_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            replica_id: replica_id.into(),
            presence: JsonValue::Null,
            internal: JsonValue::Null,
            profile: JsonValue::Null,
        }
    }
}
