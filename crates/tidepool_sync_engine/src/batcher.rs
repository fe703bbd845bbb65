//! Outbound operation batching.

use crate::config::BatchConfig;
use std::time::Instant;
use tidepool_core::Operation;

/// Collects local operations until they are due to be sent.
#[derive(Debug)]
pub struct OpBatcher {
    config: BatchConfig,
    pending: Vec<Operation>,
    opened_at: Option<Instant>,
}

impl OpBatcher {
    /// Creates an empty batcher.
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            opened_at: None,
        }
    }

    /// Adds operations. Returns true if the batch is now due.
    pub fn push(&mut self, operations: Vec<Operation>, now: Instant) -> bool {
        if operations.is_empty() {
            return self.is_due(now);
        }
        self.opened_at.get_or_insert(now);
        self.pending.extend(operations);
        self.is_due(now)
    }

    /// True if the batch is full or its oldest operation has waited long enough.
    pub fn is_due(&self, now: Instant) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        self.pending.len() >= self.config.max_size
            || self
                .opened_at
                .is_some_and(|opened| now.saturating_duration_since(opened) >= self.config.max_age)
    }

    /// Removes and returns every pending operation.
    pub fn take(&mut self) -> Vec<Operation> {
        self.opened_at = None;
        std::mem::take(&mut self.pending)
    }

    /// Drops every pending operation.
    pub fn clear(&mut self) {
        self.take();
    }

    /// Operations waiting to be sent.
    pub fn pending(&self) -> &[Operation] {
        &self.pending
    }

    /// Number of pending operations.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
