//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;
use tidepool_core::DiffOptions;
use tidepool_sync_protocol::ReplicaType;

/// Configuration of one client replica.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Library the replica belongs to.
    pub library_id: String,
    /// Replica id, unique per device and library.
    pub replica_id: String,
    /// How the replica participates.
    pub replica_type: ReplicaType,
    /// Schema version; also the epoch of issued timestamps.
    pub schema_version: Option<u32>,
    /// Outbound operation batching.
    pub batch: BatchConfig,
    /// Options used when diffing local edits.
    pub diff: DiffOptions,
    /// Idle time before a heartbeat is sent.
    pub heartbeat_interval: Duration,
    /// Time to wait for a heartbeat response before reconnecting.
    pub heartbeat_timeout: Duration,
    /// Reconnect backoff.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with default settings.
    pub fn new(library_id: impl Into<String>, replica_id: impl Into<String>) -> Self {
        Self {
            library_id: library_id.into(),
            replica_id: replica_id.into(),
            replica_type: ReplicaType::Realtime,
            schema_version: None,
            batch: BatchConfig::default(),
            diff: DiffOptions::default().with_merge_unknown_objects(true),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the replica type.
    pub fn with_replica_type(mut self, replica_type: ReplicaType) -> Self {
        self.replica_type = replica_type;
        self
    }

    /// Sets the schema version.
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = Some(version);
        self
    }

    /// Sets the batching configuration.
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Sets the diff options.
    pub fn with_diff_options(mut self, diff: DiffOptions) -> Self {
        self.diff = diff;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the heartbeat timeout.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("", "")
    }
}

/// Limits of the outbound operation batch.
///
/// A batch is flushed once it holds `max_size` operations or its oldest
/// operation is `max_age` old.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Maximum number of operations per batch.
    pub max_size: usize,
    /// Maximum time an operation waits in the batch.
    pub max_age: Duration,
}

impl BatchConfig {
    /// Creates a batch configuration.
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            max_age,
        }
    }

    /// Flushes every edit on its own.
    pub fn immediate() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::new(100, Duration::from_millis(50))
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of reconnect attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% on top.
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("notes", "laptop")
            .with_replica_type(ReplicaType::Push)
            .with_schema_version(3)
            .with_batch(BatchConfig::new(10, Duration::from_millis(5)))
            .with_heartbeat_interval(Duration::from_secs(5));

        assert_eq!(config.library_id, "notes");
        assert_eq!(config.replica_id, "laptop");
        assert_eq!(config.replica_type, ReplicaType::Push);
        assert_eq!(config.schema_version, Some(3));
        assert_eq!(config.batch.max_size, 10);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert!(config.diff.merge_unknown_objects);
    }

    #[test]
    fn batch_size_is_at_least_one() {
        assert_eq!(BatchConfig::new(0, Duration::ZERO).max_size, 1);
        assert_eq!(BatchConfig::immediate().max_size, 1);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}
