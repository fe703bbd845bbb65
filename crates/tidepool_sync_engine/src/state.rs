//! Sync engine state machine.

use crate::batcher::OpBatcher;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::local::LocalStore;
use crate::transport::SyncTransport;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tidepool_core::{
    delete_patches, diff_to_patches, initial_to_patches, undo_operations, DocTree,
    DocumentBaseline, HybridLogicalClock, Oid, Operation, RandomSubIds, SubIdSource, Timestamp,
    TimestampProvider,
};
use tidepool_sync_protocol::{ClientMessage, ServerMessage, UserInfo};
use tracing::{debug, info, warn};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is opening the transport.
    Connecting,
    /// A sync request is waiting for its response.
    Syncing,
    /// Engine is caught up and exchanging live operations.
    Synced,
    /// Engine encountered an error.
    Error,
    /// Engine is waiting before reconnecting.
    RetryWait,
}

impl SyncState {
    /// Returns true if the engine is in an active sync state.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Connecting | SyncState::Syncing)
    }

    /// Returns true if the engine can start a new sync.
    pub fn can_start_sync(&self) -> bool {
        matches!(
            self,
            SyncState::Idle | SyncState::Synced | SyncState::Error | SyncState::RetryWait
        )
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of sync responses applied.
    pub cycles_completed: u64,
    /// Total number of remote operations received.
    pub operations_pulled: u64,
    /// Total number of local operations sent.
    pub operations_pushed: u64,
    /// Total number of local folds that compacted something.
    pub folds: u64,
    /// Total number of reconnect attempts.
    pub retries: u64,
    /// Last sync time.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Mutable replica state guarded by one lock.
struct EngineInner {
    local: LocalStore,
    /// Local operations not sent yet.
    batcher: OpBatcher,
    /// Local operations sent but not acknowledged by the server.
    in_flight: Vec<Operation>,
    since: Option<Timestamp>,
    undo: Vec<Vec<Operation>>,
    redo: Vec<Vec<Operation>>,
    peers: BTreeMap<String, UserInfo>,
    presence: Option<JsonValue>,
    last_activity: Option<Instant>,
    sync_sent_at: Option<Instant>,
    heartbeat_sent_at: Option<Instant>,
    sub_ids: Box<dyn SubIdSource + Send>,
}

impl EngineInner {
    /// Oldest local operation the server has not acknowledged.
    fn oldest_unacked(&self) -> Option<&Timestamp> {
        self.in_flight
            .iter()
            .chain(self.batcher.pending())
            .map(|op| &op.timestamp)
            .min()
    }
}

/// Reconnect bookkeeping.
#[derive(Debug, Default)]
struct RetryState {
    attempt: u32,
    retry_at: Option<Instant>,
}

/// The sync engine runs one client replica of a library.
///
/// Local edits are diffed into operations, applied to the local store
/// right away and queued for the server. Server messages are handed to
/// [`SyncEngine::receive`]; time-driven work (batch flushes, heartbeats,
/// reconnects) happens in [`SyncEngine::tick`].
pub struct SyncEngine<T: SyncTransport> {
    config: SyncConfig,
    transport: Arc<T>,
    clock: Arc<dyn TimestampProvider>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    inner: Mutex<EngineInner>,
    retry: Mutex<RetryState>,
}

impl<T: SyncTransport> SyncEngine<T> {
    /// Creates a new sync engine.
    pub fn new(config: SyncConfig, transport: T) -> Self {
        let clock = HybridLogicalClock::new(config.replica_id.clone())
            .with_epoch(config.schema_version.unwrap_or(0));
        let inner = EngineInner {
            local: LocalStore::new(),
            batcher: OpBatcher::new(config.batch),
            in_flight: Vec::new(),
            since: None,
            undo: Vec::new(),
            redo: Vec::new(),
            peers: BTreeMap::new(),
            presence: None,
            last_activity: None,
            sync_sent_at: None,
            heartbeat_sent_at: None,
            sub_ids: Box::new(RandomSubIds),
        };
        Self {
            config,
            transport: Arc::new(transport),
            clock: Arc::new(clock),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            inner: Mutex::new(inner),
            retry: Mutex::new(RetryState::default()),
        }
    }

    /// Replaces the timestamp source.
    pub fn with_clock(mut self, clock: Arc<dyn TimestampProvider>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the source of sub-identifiers for new nested objects.
    pub fn with_sub_ids(self, sub_ids: impl SubIdSource + Send + 'static) -> Self {
        self.inner.lock().sub_ids = Box::new(sub_ids);
        self
    }

    /// Gets the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Gets the transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Current content of a document, with nested objects inlined.
    pub fn get(&self, oid: &Oid) -> Option<JsonValue> {
        self.document(oid).map(|tree| tree.to_json())
    }

    /// Current identified tree of a document.
    pub fn document(&self, oid: &Oid) -> Option<DocTree> {
        self.inner.lock().local.document(&oid.root())
    }

    /// Roots of every live document.
    pub fn documents(&self) -> Vec<Oid> {
        self.inner.lock().local.documents()
    }

    /// Documents that exist but cannot be read.
    pub fn stale_documents(&self) -> Vec<Oid> {
        self.inner.lock().local.stale_documents()
    }

    /// Writes a document, creating it or diffing against its current content.
    pub fn put(&self, oid: &Oid, value: &JsonValue) -> SyncResult<Vec<Operation>> {
        self.ensure_writable()?;
        if !oid.is_root() {
            return Err(SyncError::UnknownDocument(oid.to_string()));
        }
        let mut after = DocTree::from_json(value)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let clock = Arc::clone(&self.clock);
        let mut tick = || clock.now();
        let operations = match inner.local.document(oid) {
            Some(before) => diff_to_patches(
                &before,
                &mut after,
                &mut tick,
                inner.sub_ids.as_mut(),
                &self.config.diff,
            )?,
            None => initial_to_patches(&mut after, oid, &mut tick, inner.sub_ids.as_mut())?,
        };
        self.commit(inner, operations.clone(), true)?;
        Ok(operations)
    }

    /// Edits a document in place.
    ///
    /// Nodes moved within the tree keep their identifiers, so a moved
    /// object becomes a move instead of a delete and re-create.
    pub fn edit<F>(&self, oid: &Oid, edit: F) -> SyncResult<Vec<Operation>>
    where
        F: FnOnce(&mut DocTree),
    {
        self.ensure_writable()?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let before = inner
            .local
            .document(&oid.root())
            .ok_or_else(|| SyncError::UnknownDocument(oid.to_string()))?;
        let mut after = before.clone();
        edit(&mut after);
        let clock = Arc::clone(&self.clock);
        let operations = diff_to_patches(
            &before,
            &mut after,
            &mut || clock.now(),
            inner.sub_ids.as_mut(),
            &self.config.diff,
        )?;
        self.commit(inner, operations.clone(), true)?;
        Ok(operations)
    }

    /// Deletes a document and every nested object.
    pub fn delete(&self, oid: &Oid) -> SyncResult<Vec<Operation>> {
        self.ensure_writable()?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let tree = inner
            .local
            .document(&oid.root())
            .ok_or_else(|| SyncError::UnknownDocument(oid.to_string()))?;
        let clock = Arc::clone(&self.clock);
        let operations = delete_patches(&tree, &mut || clock.now())?;
        self.commit(inner, operations.clone(), true)?;
        Ok(operations)
    }

    /// True if there is a local change to undo.
    pub fn can_undo(&self) -> bool {
        !self.inner.lock().undo.is_empty()
    }

    /// True if there is an undone change to redo.
    pub fn can_redo(&self) -> bool {
        !self.inner.lock().redo.is_empty()
    }

    /// Reverts the most recent local change. Returns false if there was none.
    pub fn undo(&self) -> SyncResult<bool> {
        self.ensure_writable()?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.undo.pop() else {
            return Ok(false);
        };
        let operations = self.restamp(entry);
        let inverse = self.inverse_of(&inner.local, &operations);
        self.commit(inner, operations, false)?;
        inner.redo.push(inverse);
        Ok(true)
    }

    /// Reapplies the most recently undone change. Returns false if there was none.
    pub fn redo(&self) -> SyncResult<bool> {
        self.ensure_writable()?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.redo.pop() else {
            return Ok(false);
        };
        let operations = self.restamp(entry);
        let inverse = self.inverse_of(&inner.local, &operations);
        self.commit(inner, operations, false)?;
        inner.undo.push(inverse);
        Ok(true)
    }

    /// Number of local operations the server has not acknowledged.
    pub fn pending_operations(&self) -> usize {
        let inner = self.inner.lock();
        inner.in_flight.len() + inner.batcher.len()
    }

    /// Local operations not folded yet.
    pub fn operations(&self) -> Vec<Operation> {
        self.inner.lock().local.operations().to_vec()
    }

    /// Local baselines.
    pub fn baselines(&self) -> Vec<DocumentBaseline> {
        self.inner.lock().local.baselines().values().cloned().collect()
    }

    fn ensure_writable(&self) -> SyncResult<()> {
        if self.config.replica_type.can_write() {
            Ok(())
        } else {
            Err(SyncError::ReadOnly)
        }
    }

    /// Inverse of `operations` against the current views, for the undo stacks.
    fn inverse_of(&self, local: &LocalStore, operations: &[Operation]) -> Vec<Operation> {
        let clock = Arc::clone(&self.clock);
        undo_operations(local.views(), operations, &mut || clock.now())
    }

    /// Gives stored undo operations fresh timestamps, keeping their order.
    fn restamp(&self, operations: Vec<Operation>) -> Vec<Operation> {
        operations
            .into_iter()
            .map(|op| Operation::new(op.oid, self.clock.now(), op.data))
            .collect()
    }

    /// Applies local operations and queues them for the server.
    fn commit(
        &self,
        inner: &mut EngineInner,
        operations: Vec<Operation>,
        record_undo: bool,
    ) -> SyncResult<()> {
        if operations.is_empty() {
            return Ok(());
        }
        if record_undo {
            let inverse = self.inverse_of(&inner.local, &operations);
            inner.undo.push(inverse);
            inner.redo.clear();
        }
        inner.local.insert(&operations);
        debug!(
            replica = %self.config.replica_id,
            count = operations.len(),
            "local operations"
        );

        let due = inner.batcher.push(operations, Instant::now());
        if due && self.live_push() {
            self.flush_batch(inner)?;
        }
        Ok(())
    }

    /// True if local operations go out as soon as their batch is due.
    fn live_push(&self) -> bool {
        self.config.replica_type.pushes_immediately() && self.state() == SyncState::Synced
    }

    /// Publishes this replica's presence.
    pub fn set_presence(&self, presence: JsonValue) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        inner.presence = Some(presence.clone());
        if self.state() == SyncState::Synced {
            self.send_presence(presence)?;
        }
        Ok(())
    }

    /// Presence of the other replicas, by replica id.
    pub fn peers(&self) -> BTreeMap<String, UserInfo> {
        self.inner.lock().peers.clone()
    }

    fn send_presence(&self, presence: JsonValue) -> SyncResult<()> {
        self.send(&ClientMessage::PresenceUpdate {
            replica_id: self.config.replica_id.clone(),
            presence,
            internal: JsonValue::Null,
        })
    }

    /// Opens the transport and sends a sync request.
    pub fn start_sync(&self) -> SyncResult<()> {
        self.begin_sync(false)
    }

    /// Asks the server to replace all local data with the library contents.
    pub fn resync_all(&self) -> SyncResult<()> {
        self.begin_sync(true)
    }

    fn begin_sync(&self, resync_all: bool) -> SyncResult<()> {
        let state = self.state();
        if !state.can_start_sync() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{state:?}"),
                to: "sync".into(),
            });
        }
        self.set_state(SyncState::Connecting);
        if let Err(e) = self.transport.connect() {
            self.handle_error(&e);
            return Err(e);
        }

        let mut inner = self.inner.lock();
        let since = inner.since.clone();
        self.send_sync(&mut inner, since, resync_all)
    }

    /// Closes the transport. Unacknowledged operations are kept for the next sync.
    pub fn disconnect(&self) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        inner.peers.clear();
        inner.heartbeat_sent_at = None;
        inner.sync_sent_at = None;
        *self.retry.lock() = RetryState::default();
        self.set_state(SyncState::Idle);
        self.transport.close()
    }

    /// Sends a sync request carrying every unacknowledged local operation.
    fn send_sync(
        &self,
        inner: &mut EngineInner,
        since: Option<Timestamp>,
        resync_all: bool,
    ) -> SyncResult<()> {
        let unsent = inner.batcher.take();
        inner.in_flight.extend(unsent);
        let operations = inner.in_flight.clone();
        let message = ClientMessage::Sync {
            replica_id: self.config.replica_id.clone(),
            timestamp: self.clock.now(),
            since,
            resync_all,
            operations,
            baselines: Vec::new(),
            schema_version: self.config.schema_version,
        };
        self.send_request(inner, &message)
    }

    /// Sends the whole local history so an empty library can be rebuilt.
    fn send_full_history(&self, inner: &mut EngineInner) -> SyncResult<()> {
        let unsent = inner.batcher.take();
        inner.in_flight.extend(unsent);
        let message = ClientMessage::Sync {
            replica_id: self.config.replica_id.clone(),
            timestamp: self.clock.now(),
            since: None,
            resync_all: false,
            operations: inner.local.operations().to_vec(),
            baselines: inner.local.baselines().values().cloned().collect(),
            schema_version: self.config.schema_version,
        };
        info!(
            replica = %self.config.replica_id,
            operations = inner.local.operations().len(),
            "sending full history"
        );
        self.send_request(inner, &message)
    }

    fn send_request(&self, inner: &mut EngineInner, message: &ClientMessage) -> SyncResult<()> {
        if let ClientMessage::Sync { operations, .. } = message {
            self.stats.write().operations_pushed += operations.len() as u64;
        }
        self.send(message)?;
        inner.sync_sent_at = Some(Instant::now());
        self.set_state(SyncState::Syncing);
        Ok(())
    }

    /// Sends pending local operations in one `op` message.
    fn flush_batch(&self, inner: &mut EngineInner) -> SyncResult<()> {
        let operations = inner.batcher.take();
        if operations.is_empty() {
            return Ok(());
        }
        let count = operations.len();
        inner.in_flight.extend(operations.iter().cloned());
        self.send(&ClientMessage::Op {
            replica_id: self.config.replica_id.clone(),
            timestamp: self.clock.now(),
            operations,
        })?;
        self.stats.write().operations_pushed += count as u64;
        Ok(())
    }

    /// Sends pending local operations now, if live pushing is enabled.
    pub fn flush(&self) -> SyncResult<()> {
        if !self.live_push() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        self.flush_batch(&mut inner)
    }

    fn send(&self, message: &ClientMessage) -> SyncResult<()> {
        match self.transport.send(message) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.handle_error(&e);
                Err(e)
            }
        }
    }

    /// Handles one message from the server.
    pub fn receive(&self, message: ServerMessage) -> SyncResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.last_activity = Some(Instant::now());
        debug!(replica = %self.config.replica_id, kind = message.kind(), "server message");

        match message {
            ServerMessage::SyncResp {
                operations,
                baselines,
                global_ack_timestamp,
                peer_presence,
                overwrite_local_data,
                acked_timestamp,
                ack_this_nonce,
            } => {
                if overwrite_local_data {
                    info!(replica = %self.config.replica_id, "server overwrote local data");
                    inner.local.reset();
                    inner.batcher.clear();
                    inner.in_flight.clear();
                    inner.undo.clear();
                    inner.redo.clear();
                }
                self.apply_remote(inner, &operations, Some(baselines.as_slice()));
                if let Some(acked) = acked_timestamp {
                    inner.in_flight.retain(|op| op.timestamp > acked);
                    inner.since = Some(acked);
                }
                inner.peers = peer_presence;
                inner.peers.remove(&self.config.replica_id);
                inner.sync_sent_at = None;
                inner.heartbeat_sent_at = None;
                *self.retry.lock() = RetryState::default();
                self.set_state(SyncState::Synced);
                {
                    let mut stats = self.stats.write();
                    stats.cycles_completed += 1;
                    stats.last_sync_time = Some(Instant::now());
                    stats.last_error = None;
                }

                if let Some(presence) = inner.presence.clone() {
                    self.send_presence(presence)?;
                }
                self.acknowledge(inner, ack_this_nonce)?;
                if let Some(global_ack) = global_ack_timestamp {
                    self.fold(inner, &global_ack);
                }
                Ok(())
            }
            ServerMessage::OpRe {
                operations,
                baselines,
                replica_id,
                global_ack_timestamp,
                ack_this_nonce,
            } => {
                debug!(
                    replica = %self.config.replica_id,
                    from = %replica_id,
                    count = operations.len(),
                    "remote operations"
                );
                self.apply_remote(inner, &operations, baselines.as_deref());
                self.acknowledge(inner, ack_this_nonce)?;
                if let Some(global_ack) = global_ack_timestamp {
                    self.fold(inner, &global_ack);
                }
                Ok(())
            }
            ServerMessage::ServerAck { timestamp } => {
                inner.in_flight.retain(|op| op.timestamp > timestamp);
                if inner.since.as_ref().map_or(true, |since| *since < timestamp) {
                    inner.since = Some(timestamp);
                }
                Ok(())
            }
            ServerMessage::GlobalAck { timestamp } => {
                self.fold(inner, &timestamp);
                Ok(())
            }
            ServerMessage::Forbidden => {
                warn!(replica = %self.config.replica_id, "server refused writes");
                let e = SyncError::Forbidden;
                self.handle_error(&e);
                Err(e)
            }
            ServerMessage::NeedSince { since } => {
                debug!(replica = %self.config.replica_id, ?since, "server needs history");
                self.send_full_history(inner)
            }
            ServerMessage::PresenceChanged {
                replica_id,
                user_info,
            } => {
                if replica_id != self.config.replica_id {
                    inner.peers.insert(replica_id, user_info);
                }
                Ok(())
            }
            ServerMessage::PresenceOffline { replica_id, .. } => {
                inner.peers.remove(&replica_id);
                Ok(())
            }
            ServerMessage::HeartbeatResponse => {
                inner.heartbeat_sent_at = None;
                Ok(())
            }
        }
    }

    /// Stores remote data and moves the clock past it.
    fn apply_remote(
        &self,
        inner: &mut EngineInner,
        operations: &[Operation],
        baselines: Option<&[DocumentBaseline]>,
    ) {
        for op in operations {
            self.clock.update(&op.timestamp);
        }
        if let Some(baselines) = baselines {
            for baseline in baselines {
                self.clock.update(&baseline.timestamp);
            }
            inner.local.apply_baselines(baselines);
        }
        let added = inner.local.insert(operations);
        self.stats.write().operations_pulled += added as u64;
    }

    /// Acknowledges received data.
    ///
    /// Pending local operations are flushed first. The acknowledged time
    /// promises the server that nothing older will come from this replica,
    /// so it is withheld while unsent local operations remain.
    fn acknowledge(&self, inner: &mut EngineInner, nonce: Option<String>) -> SyncResult<()> {
        if self.live_push() {
            self.flush_batch(inner)?;
        }
        let Some(nonce) = nonce else {
            return Ok(());
        };
        let timestamp = inner.batcher.is_empty().then(|| self.clock.now());
        self.send(&ClientMessage::Ack {
            replica_id: self.config.replica_id.clone(),
            nonce: Some(nonce),
            timestamp,
        })
    }

    /// Folds operations older than `global_ack` and every unacknowledged local operation.
    fn fold(&self, inner: &mut EngineInner, global_ack: &Timestamp) {
        let limit = match inner.oldest_unacked() {
            Some(oldest) if oldest < global_ack => oldest.clone(),
            _ => global_ack.clone(),
        };
        let summary = inner.local.fold(&limit);
        if summary.folded > 0 {
            self.stats.write().folds += 1;
        }
    }

    /// Runs time-driven work: batch flushes, heartbeats and reconnects.
    pub fn tick(&self, now: Instant) -> SyncResult<()> {
        match self.state() {
            SyncState::Synced => {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if let Some(sent) = inner.heartbeat_sent_at {
                    if now.saturating_duration_since(sent) >= self.config.heartbeat_timeout {
                        warn!(replica = %self.config.replica_id, "heartbeat timed out");
                        inner.heartbeat_sent_at = None;
                        self.schedule_retry(now, &SyncError::Timeout);
                        return Ok(());
                    }
                }
                if inner.batcher.is_due(now) && self.live_push() {
                    self.flush_batch(inner)?;
                }
                let interval = self.config.heartbeat_interval;
                let idle = inner
                    .last_activity
                    .map_or(true, |last| now.saturating_duration_since(last) >= interval);
                if idle && inner.heartbeat_sent_at.is_none() {
                    self.send(&ClientMessage::Heartbeat {
                        replica_id: self.config.replica_id.clone(),
                        timestamp: self.clock.now(),
                    })?;
                    inner.heartbeat_sent_at = Some(now);
                }
                Ok(())
            }
            SyncState::Syncing => {
                let mut inner = self.inner.lock();
                let timeout = self.config.heartbeat_timeout;
                let expired = inner
                    .sync_sent_at
                    .is_some_and(|sent| now.saturating_duration_since(sent) >= timeout);
                if expired {
                    warn!(replica = %self.config.replica_id, "sync response timed out");
                    inner.sync_sent_at = None;
                    self.schedule_retry(now, &SyncError::Timeout);
                }
                Ok(())
            }
            SyncState::RetryWait => {
                let due = self.retry.lock().retry_at.map_or(true, |at| now >= at);
                if !due {
                    return Ok(());
                }
                self.stats.write().retries += 1;
                match self.start_sync() {
                    // The failure already scheduled the next attempt.
                    Err(e) if e.is_retryable() => Ok(()),
                    other => other,
                }
            }
            SyncState::Idle | SyncState::Connecting | SyncState::Error => Ok(()),
        }
    }

    /// Drops the connection and waits before reconnecting.
    fn schedule_retry(&self, now: Instant, error: &SyncError) {
        if let Err(e) = self.transport.close() {
            debug!(replica = %self.config.replica_id, error = %e, "closing transport failed");
        }
        self.stats.write().last_error = Some(error.to_string());
        let mut retry = self.retry.lock();
        retry.attempt += 1;
        if retry.attempt >= self.config.retry.max_attempts {
            warn!(replica = %self.config.replica_id, attempts = retry.attempt, "giving up reconnecting");
            retry.retry_at = None;
            self.set_state(SyncState::Error);
            return;
        }
        let delay = self.config.retry.delay_for_attempt(retry.attempt);
        debug!(replica = %self.config.replica_id, attempt = retry.attempt, ?delay, "reconnecting later");
        retry.retry_at = Some(now + delay);
        self.set_state(SyncState::RetryWait);
    }

    /// Handles an error by updating state and stats.
    fn handle_error(&self, error: &SyncError) {
        if error.is_retryable() {
            self.schedule_retry(Instant::now(), error);
            return;
        }
        self.set_state(SyncState::Error);
        self.stats.write().last_error = Some(error.to_string());
    }
}
