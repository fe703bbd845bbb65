//! Replica bookkeeping.

use std::time::Duration;
use tidepool_core::Timestamp;
use tidepool_sync_protocol::{ReplicaType, ServerOrder};

/// What the server knows about one replica of a library.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaInfo {
    /// Replica id.
    pub id: String,
    /// User owning the replica.
    pub user_id: String,
    /// How the replica participates.
    pub replica_type: ReplicaType,
    /// Highest server order the replica is known to hold without gaps.
    pub acked_server_order: ServerOrder,
    /// Highest logical time the replica has acknowledged.
    pub acked_logical_time: Option<Timestamp>,
    /// Wall clock time of the last message, in Unix milliseconds.
    pub last_seen_wall_clock_time: u64,
}

/// Classification of a replica at sync time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStatus {
    /// Never seen before.
    New,
    /// Seen within the truant cutoff.
    Existing,
    /// Not seen for longer than the truant cutoff.
    Truant,
}

impl ReplicaInfo {
    /// Creates the record of a replica seen for the first time.
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        replica_type: ReplicaType,
        now_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            replica_type,
            acked_server_order: 0,
            acked_logical_time: None,
            last_seen_wall_clock_time: now_ms,
        }
    }

    /// Classifies an existing replica against the truant cutoff.
    pub fn status(&self, now_ms: u64, truant_cutoff: Duration) -> ReplicaStatus {
        let cutoff = truant_cutoff.as_millis() as u64;
        if now_ms.saturating_sub(self.last_seen_wall_clock_time) > cutoff {
            ReplicaStatus::Truant
        } else {
            ReplicaStatus::Existing
        }
    }

    /// Raises the acknowledged logical time. Returns true if it moved.
    pub fn acknowledge_time(&mut self, timestamp: &Timestamp) -> bool {
        match &self.acked_logical_time {
            Some(current) if current >= timestamp => false,
            _ => {
                self.acked_logical_time = Some(timestamp.clone());
                true
            }
        }
    }
}
