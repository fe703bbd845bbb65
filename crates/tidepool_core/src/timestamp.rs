//! Logical timestamps.
//!
//! Timestamps are strings that sort lexicographically in causal order:
//! `{epoch}:{wall_ms}:{counter}:{replica}` with fixed-width numeric fields.
//! The epoch is the schema version, so operations written under a newer
//! schema always sort after older ones.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest counter value before the clock borrows from the wall field.
pub const MAX_COUNTER: u32 = 99_999;

/// A totally ordered logical timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

/// Decoded fields of a [`Timestamp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampParts {
    /// Schema version epoch.
    pub epoch: u32,
    /// Wall clock component in milliseconds.
    pub wall_ms: u64,
    /// Logical counter within one millisecond.
    pub counter: u32,
    /// Replica that issued the timestamp.
    pub replica_id: String,
}

impl Timestamp {
    /// Builds a timestamp from its parts.
    pub fn new(epoch: u32, wall_ms: u64, counter: u32, replica_id: &str) -> Self {
        Self(format!("{epoch:04}:{wall_ms:015}:{counter:05}:{replica_id}"))
    }

    /// Wraps a raw timestamp string without validation.
    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decodes the timestamp fields.
    pub fn parts(&self) -> CoreResult<TimestampParts> {
        let invalid = || CoreError::InvalidTimestamp {
            value: self.0.clone(),
        };
        let mut fields = self.0.splitn(4, ':');
        let epoch = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
        let wall_ms = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
        let counter = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
        let replica_id = fields.next().ok_or_else(invalid)?.to_string();
        Ok(TimestampParts {
            epoch,
            wall_ms,
            counter,
            replica_id,
        })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Issues timestamps for one replica.
pub trait TimestampProvider: Send + Sync {
    /// Returns a timestamp greater than every timestamp issued or observed so far.
    fn now(&self) -> Timestamp;

    /// Folds a remote timestamp into the clock.
    fn update(&self, remote: &Timestamp);

    /// Returns the schema epoch stamped on new timestamps.
    fn epoch(&self) -> u32;
}

#[derive(Debug, Default)]
struct ClockState {
    wall_ms: u64,
    counter: u32,
}

/// Hybrid logical clock.
///
/// Tracks the highest `(wall, counter)` pair seen locally or remotely and
/// never issues a timestamp at or below it.
pub struct HybridLogicalClock {
    replica_id: String,
    epoch: u32,
    state: Mutex<ClockState>,
    wall_clock: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl HybridLogicalClock {
    /// Creates a clock driven by the system time.
    pub fn new(replica_id: impl Into<String>) -> Self {
        Self::with_wall_clock(replica_id, Arc::new(system_millis))
    }

    /// Creates a clock driven by a custom millisecond source.
    pub fn with_wall_clock(
        replica_id: impl Into<String>,
        wall_clock: Arc<dyn Fn() -> u64 + Send + Sync>,
    ) -> Self {
        Self {
            replica_id: replica_id.into(),
            epoch: 0,
            state: Mutex::new(ClockState::default()),
            wall_clock,
        }
    }

    /// Sets the schema epoch.
    pub fn with_epoch(mut self, epoch: u32) -> Self {
        self.epoch = epoch;
        self
    }

    /// Returns the replica id stamped on issued timestamps.
    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }
}

impl TimestampProvider for HybridLogicalClock {
    fn now(&self) -> Timestamp {
        let physical = (self.wall_clock)();
        let mut state = self.state.lock();
        if physical > state.wall_ms {
            state.wall_ms = physical;
            state.counter = 0;
        } else if state.counter >= MAX_COUNTER {
            state.wall_ms += 1;
            state.counter = 0;
        } else {
            state.counter += 1;
        }
        Timestamp::new(self.epoch, state.wall_ms, state.counter, &self.replica_id)
    }

    fn update(&self, remote: &Timestamp) {
        let Ok(parts) = remote.parts() else {
            tracing::debug!(timestamp = %remote, "ignoring malformed remote timestamp");
            return;
        };
        let mut state = self.state.lock();
        if (parts.wall_ms, parts.counter) > (state.wall_ms, state.counter) {
            state.wall_ms = parts.wall_ms;
            state.counter = parts.counter;
        }
    }

    fn epoch(&self) -> u32 {
        self.epoch
    }
}

impl fmt::Debug for HybridLogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridLogicalClock")
            .field("replica_id", &self.replica_id)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

fn system_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
