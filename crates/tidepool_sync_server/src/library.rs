//! The per-library sync state machine.
//!
//! A [`Library`] owns every connection of one sync group. It is driven
//! synchronously: each inbound message is handled to completion, and
//! replies go out through per-connection outboxes. The actor in
//! [`crate::actor`] wraps it in a tokio task.

use crate::clock::{SystemClock, WallClock};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::files::{FileMetadata, FileStorage};
use crate::presence::PresenceTable;
use crate::replicas::{ReplicaInfo, ReplicaStatus};
use crate::storage::LibraryStorage;
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tidepool_core::{fold_operations, DocumentBaseline, Oid, Operation, Ref, Timestamp};
use tidepool_sync_protocol::{AckNonce, ClientMessage, ReplicaType, ServerMessage, ServerOrder, UserInfo};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Identifies one connection to a library.
pub type ClientKey = u64;

/// Identity of an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    /// Authenticated user.
    pub user_id: String,
    /// How the connection may participate.
    pub replica_type: ReplicaType,
}

impl ClientSession {
    /// Creates a session.
    pub fn new(user_id: impl Into<String>, replica_type: ReplicaType) -> Self {
        Self {
            user_id: user_id.into(),
            replica_type,
        }
    }
}

/// Notifications published by a library.
#[derive(Debug, Clone, PartialEq)]
pub enum LibraryEvent {
    /// A replica wrote to the library.
    Changed {
        /// Writing replica.
        replica_id: String,
        /// Number of operations it sent.
        operations: usize,
        /// Number of baselines it sent.
        baselines: usize,
    },
    /// A rebase folded operations into baselines.
    Rebased {
        /// Global acknowledgement used for the fold.
        global_ack: Timestamp,
        /// Number of operations removed from the log.
        folded: usize,
    },
}

/// Totals of one rebase pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebaseReport {
    /// Objects whose baseline changed.
    pub objects: usize,
    /// Operations removed from the log.
    pub folded: usize,
    /// Objects with operations left behind.
    pub hard_stopped: usize,
    /// Files newly flagged for deletion.
    pub files_marked: usize,
}

struct ClientConnection {
    session: ClientSession,
    replica_id: Option<String>,
    outbox: mpsc::UnboundedSender<ServerMessage>,
}

struct SyncRequest {
    replica_id: String,
    timestamp: Timestamp,
    since: Option<Timestamp>,
    resync_all: bool,
    operations: Vec<Operation>,
    baselines: Vec<DocumentBaseline>,
    schema_version: Option<u32>,
}

/// State of one library.
pub struct Library {
    id: String,
    config: ServerConfig,
    storage: Arc<dyn LibraryStorage>,
    files: Arc<dyn FileStorage>,
    clock: Arc<dyn WallClock>,
    clients: HashMap<ClientKey, ClientConnection>,
    next_key: ClientKey,
    presence: PresenceTable,
    events: broadcast::Sender<LibraryEvent>,
    last_global_ack: Option<Timestamp>,
    rebase_requested: bool,
}

impl Library {
    /// Creates a library over `storage`.
    pub fn new(
        id: impl Into<String>,
        config: ServerConfig,
        storage: Arc<dyn LibraryStorage>,
        files: Arc<dyn FileStorage>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            id: id.into(),
            config,
            storage,
            files,
            clock: Arc::new(SystemClock),
            clients: HashMap::new(),
            next_key: 1,
            presence: PresenceTable::new(),
            events,
            last_global_ack: None,
            rebase_requested: false,
        }
    }

    /// Replaces the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Library id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The configuration in effect.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The storage backing the library.
    pub fn storage(&self) -> &Arc<dyn LibraryStorage> {
        &self.storage
    }

    /// Subscribes to library events.
    pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<LibraryEvent> {
        self.events.clone()
    }

    /// Number of open connections.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Registers a connection. Replies are delivered to `outbox`.
    pub fn connect(
        &mut self,
        session: ClientSession,
        outbox: mpsc::UnboundedSender<ServerMessage>,
    ) -> ClientKey {
        let key = self.next_key;
        self.next_key += 1;
        debug!(library = %self.id, user = %session.user_id, key, "client connected");
        self.clients.insert(
            key,
            ClientConnection {
                session,
                replica_id: None,
                outbox,
            },
        );
        key
    }

    /// Closes a connection.
    ///
    /// The replica goes offline once none of its connections remain, and
    /// pending file deletions are swept once nobody is present.
    pub fn disconnect(&mut self, key: ClientKey) -> ServerResult<()> {
        let Some(client) = self.clients.remove(&key) else {
            return Ok(());
        };
        debug!(library = %self.id, key, "client disconnected");
        if let Some(replica_id) = client.replica_id {
            let still_connected = self
                .clients
                .values()
                .any(|c| c.replica_id.as_deref() == Some(replica_id.as_str()));
            if !still_connected {
                if let Some(info) = self.presence.remove(&replica_id) {
                    self.broadcast(None, false, &ServerMessage::PresenceOffline {
                        replica_id: replica_id.clone(),
                        user_id: info.id,
                    });
                    if self.presence.is_empty() {
                        self.sweep_files()?;
                    }
                }
            }
        }
        self.broadcast_global_ack_if_advanced()
    }

    /// Handles one message from a connection.
    pub fn handle_message(&mut self, key: ClientKey, message: ClientMessage) -> ServerResult<()> {
        let client = self
            .clients
            .get_mut(&key)
            .ok_or(ServerError::UnknownClient(key))?;
        let replica_id = message.replica_id().to_string();
        match &client.replica_id {
            Some(bound) if *bound != replica_id => {
                return Err(ServerError::InvalidRequest(format!(
                    "connection is bound to replica {bound}"
                )));
            }
            Some(_) => {}
            None => client.replica_id = Some(replica_id.clone()),
        }
        let session = client.session.clone();
        debug!(library = %self.id, replica = %replica_id, kind = message.kind(), "message");

        match message {
            ClientMessage::Sync {
                timestamp,
                since,
                resync_all,
                operations,
                baselines,
                schema_version,
                ..
            } => self.handle_sync(
                key,
                &session,
                SyncRequest {
                    replica_id,
                    timestamp,
                    since,
                    resync_all,
                    operations,
                    baselines,
                    schema_version,
                },
            ),
            ClientMessage::Op {
                timestamp,
                operations,
                ..
            } => self.handle_op(key, &session, &replica_id, timestamp, operations),
            ClientMessage::Ack {
                nonce, timestamp, ..
            } => self.handle_ack(&replica_id, nonce, timestamp),
            ClientMessage::PresenceUpdate {
                presence, internal, ..
            } => {
                self.handle_presence(key, &session, &replica_id, presence, internal);
                Ok(())
            }
            ClientMessage::Heartbeat { .. } => self.handle_heartbeat(key, &replica_id),
        }
    }

    fn handle_sync(
        &mut self,
        key: ClientKey,
        session: &ClientSession,
        request: SyncRequest,
    ) -> ServerResult<()> {
        let now = self.clock.now_ms();
        let latest = self.storage.latest_server_order()?;
        let library_empty = self.storage.is_empty()?;
        let (mut replica, status) = self.load_replica(&request.replica_id, session, now)?;

        if status == ReplicaStatus::New
            && library_empty
            && request.since.is_some()
            && !request.resync_all
        {
            info!(library = %self.id, replica = %replica.id, "empty library, requesting full history");
            self.send(key, ServerMessage::NeedSince { since: None });
            return Ok(());
        }

        let truant_override =
            status == ReplicaStatus::Truant && replica.acked_server_order != latest;
        let overwrite =
            request.resync_all || truant_override || (!library_empty && request.since.is_none());
        debug!(
            library = %self.id,
            replica = %replica.id,
            ?status,
            overwrite,
            schema_version = ?request.schema_version,
            "sync"
        );

        let mut written = None;
        let mut baselines_written = false;
        if overwrite {
            replica.acked_server_order = 0;
        } else if session.replica_type.can_write() {
            let was_current = replica.acked_server_order == latest;
            let operations = self
                .storage
                .insert_operations(&replica.id, &request.operations)?;
            let baselines = self.storage.insert_baselines(&request.baselines)?;
            baselines_written = baselines.is_some();
            written = merge_ranges(operations, baselines);
            if let Some(range) = written {
                if was_current && range.continues(replica.acked_server_order) {
                    replica.acked_server_order = range.last;
                }
            }
        } else if !request.operations.is_empty() || !request.baselines.is_empty() {
            debug!(library = %self.id, replica = %replica.id, "ignoring writes from read-only replica");
        }

        replica.acknowledge_time(&request.timestamp);
        replica.last_seen_wall_clock_time = now;
        self.storage.put_replica(replica.clone())?;

        if let Some(range) = written {
            let global_ack = self.global_ack()?;
            self.broadcast(
                Some(key),
                true,
                &ServerMessage::OpRe {
                    operations: request.operations.clone(),
                    // The nonce covers the baseline orders, so peers must receive them.
                    baselines: baselines_written.then(|| request.baselines.clone()),
                    replica_id: replica.id.clone(),
                    global_ack_timestamp: global_ack,
                    ack_this_nonce: Some(range.encode()),
                },
            );
            self.publish(LibraryEvent::Changed {
                replica_id: replica.id.clone(),
                operations: request.operations.len(),
                baselines: request.baselines.len(),
            });
            self.rebase_requested = true;
        }

        let acked = replica.acked_server_order;
        let exclude = (!overwrite).then_some(replica.id.as_str());
        let operations = self
            .storage
            .operations_after(acked, exclude)?
            .into_iter()
            .map(|stored| stored.operation)
            .collect();
        let baselines = self
            .storage
            .baselines_after(acked)?
            .into_iter()
            .map(|stored| stored.baseline)
            .collect();
        let latest = self.storage.latest_server_order()?;
        let nonce = (latest > acked).then(|| AckNonce::new(acked + 1, latest).encode());

        let response = ServerMessage::SyncResp {
            operations,
            baselines,
            global_ack_timestamp: self.global_ack()?,
            peer_presence: self.presence.peers_of(&replica.id),
            overwrite_local_data: overwrite,
            acked_timestamp: replica.acked_logical_time.clone(),
            ack_this_nonce: nonce,
        };
        self.send(key, response);
        self.broadcast_global_ack_if_advanced()
    }

    fn handle_op(
        &mut self,
        key: ClientKey,
        session: &ClientSession,
        replica_id: &str,
        timestamp: Timestamp,
        operations: Vec<Operation>,
    ) -> ServerResult<()> {
        if !session.replica_type.can_write() {
            warn!(library = %self.id, replica = %replica_id, "write from read-only replica");
            self.send(key, ServerMessage::Forbidden);
            return Ok(());
        }

        let now = self.clock.now_ms();
        let latest = self.storage.latest_server_order()?;
        let (mut replica, _) = self.load_replica(replica_id, session, now)?;
        let was_current = replica.acked_server_order == latest;
        // Stored before the rebroadcast: the op-re nonce names the orders assigned here.
        let written = self.storage.insert_operations(replica_id, &operations)?;
        if let Some(range) = written {
            if was_current && range.continues(replica.acked_server_order) {
                replica.acked_server_order = range.last;
            }
        }
        replica.acknowledge_time(&timestamp);
        replica.last_seen_wall_clock_time = now;
        self.storage.put_replica(replica)?;

        if let Some(range) = written {
            let global_ack = self.global_ack()?;
            self.broadcast(
                Some(key),
                true,
                &ServerMessage::OpRe {
                    operations: operations.clone(),
                    baselines: None,
                    replica_id: replica_id.to_string(),
                    global_ack_timestamp: global_ack,
                    ack_this_nonce: Some(range.encode()),
                },
            );
            self.publish(LibraryEvent::Changed {
                replica_id: replica_id.to_string(),
                operations: operations.len(),
                baselines: 0,
            });
            self.rebase_requested = true;
        }

        let acked = operations
            .iter()
            .map(|op| &op.timestamp)
            .max()
            .cloned()
            .unwrap_or(timestamp);
        self.send(key, ServerMessage::ServerAck { timestamp: acked });
        self.broadcast_global_ack_if_advanced()
    }

    fn handle_ack(
        &mut self,
        replica_id: &str,
        nonce: Option<String>,
        timestamp: Option<Timestamp>,
    ) -> ServerResult<()> {
        let Some(mut replica) = self.storage.replica(replica_id)? else {
            debug!(library = %self.id, replica = %replica_id, "ack from unknown replica");
            return Ok(());
        };
        replica.last_seen_wall_clock_time = self.clock.now_ms();

        if let Some(nonce) = nonce {
            let latest = self.storage.latest_server_order()?;
            match AckNonce::decode(&nonce) {
                Ok(range) if range.last > latest => {
                    warn!(
                        library = %self.id,
                        replica = %replica_id,
                        last = range.last,
                        latest,
                        "ack beyond the server log"
                    );
                }
                Ok(range) if range.continues(replica.acked_server_order) => {
                    if range.last > replica.acked_server_order {
                        replica.acked_server_order = range.last;
                        self.rebase_requested = true;
                    }
                }
                Ok(range) => {
                    debug!(
                        library = %self.id,
                        replica = %replica_id,
                        first = range.first,
                        acked = replica.acked_server_order,
                        "ack leaves a gap"
                    );
                }
                Err(e) => warn!(library = %self.id, replica = %replica_id, error = %e, "bad ack nonce"),
            }
        }
        if let Some(timestamp) = timestamp {
            if replica.acknowledge_time(&timestamp) {
                self.rebase_requested = true;
            }
        }
        self.storage.put_replica(replica)?;
        self.broadcast_global_ack_if_advanced()
    }

    fn handle_presence(
        &mut self,
        key: ClientKey,
        session: &ClientSession,
        replica_id: &str,
        presence: JsonValue,
        internal: JsonValue,
    ) {
        let info = UserInfo {
            id: session.user_id.clone(),
            replica_id: replica_id.to_string(),
            presence,
            internal,
            profile: JsonValue::Null,
        };
        self.presence.set(info.clone());
        self.broadcast(
            Some(key),
            false,
            &ServerMessage::PresenceChanged {
                replica_id: replica_id.to_string(),
                user_info: info,
            },
        );
    }

    fn handle_heartbeat(&mut self, key: ClientKey, replica_id: &str) -> ServerResult<()> {
        if let Some(mut replica) = self.storage.replica(replica_id)? {
            replica.last_seen_wall_clock_time = self.clock.now_ms();
            self.storage.put_replica(replica)?;
        }
        self.send(key, ServerMessage::HeartbeatResponse);
        Ok(())
    }

    fn load_replica(
        &self,
        replica_id: &str,
        session: &ClientSession,
        now: u64,
    ) -> ServerResult<(ReplicaInfo, ReplicaStatus)> {
        Ok(match self.storage.replica(replica_id)? {
            Some(mut replica) => {
                let status = replica.status(now, self.config.truant_cutoff);
                replica.user_id = session.user_id.clone();
                replica.replica_type = session.replica_type;
                (replica, status)
            }
            None => (
                ReplicaInfo::new(replica_id, &session.user_id, session.replica_type, now),
                ReplicaStatus::New,
            ),
        })
    }

    /// Minimum acknowledged logical time over connected replicas.
    ///
    /// `None` while nobody is connected, or while any connection has not
    /// identified its replica or acknowledged a time yet.
    pub fn global_ack(&self) -> ServerResult<Option<Timestamp>> {
        let mut connected = BTreeSet::new();
        for client in self.clients.values() {
            match client.replica_id.as_deref() {
                Some(replica_id) => connected.insert(replica_id),
                None => return Ok(None),
            };
        }
        let mut minimum: Option<Timestamp> = None;
        for replica_id in connected {
            let Some(replica) = self.storage.replica(replica_id)? else {
                return Ok(None);
            };
            let Some(acked) = replica.acked_logical_time else {
                return Ok(None);
            };
            minimum = Some(match minimum {
                Some(current) if current <= acked => current,
                _ => acked,
            });
        }
        Ok(minimum)
    }

    /// Minimum acknowledged server order over every known replica.
    pub fn global_server_order(&self) -> ServerResult<Option<ServerOrder>> {
        Ok(self
            .storage
            .replicas()?
            .iter()
            .map(|r| r.acked_server_order)
            .min())
    }

    fn broadcast_global_ack_if_advanced(&mut self) -> ServerResult<()> {
        let Some(global_ack) = self.global_ack()? else {
            return Ok(());
        };
        let advanced = self
            .last_global_ack
            .as_ref()
            .map_or(true, |last| global_ack > *last);
        if advanced {
            self.last_global_ack = Some(global_ack.clone());
            self.broadcast(None, false, &ServerMessage::GlobalAck {
                timestamp: global_ack,
            });
        }
        Ok(())
    }

    /// Returns and clears the pending rebase request.
    pub fn take_rebase_request(&mut self) -> bool {
        std::mem::take(&mut self.rebase_requested)
    }

    /// Folds acknowledged operations into baselines.
    ///
    /// Only operations at or below the global server order are candidates,
    /// and each object's fold stops at its first operation that is not
    /// older than the global acknowledgement.
    pub fn rebase(&mut self) -> ServerResult<RebaseReport> {
        self.rebase_requested = false;
        let mut report = RebaseReport::default();
        let Some(global_ack) = self.global_ack()? else {
            debug!(library = %self.id, "no global ack, skipping rebase");
            return Ok(report);
        };
        let Some(global_order) = self.global_server_order()? else {
            return Ok(report);
        };

        let oids: BTreeSet<Oid> = self
            .storage
            .operations_up_to(global_order)?
            .into_iter()
            .map(|stored| stored.operation.oid)
            .collect();

        for oid in oids {
            let mut history = self.storage.operations_for(&oid)?;
            history.sort_by(|a, b| a.operation.timestamp.cmp(&b.operation.timestamp));
            let window = history
                .iter()
                .position(|stored| stored.server_order > global_order)
                .unwrap_or(history.len());
            let operations: Vec<Operation> = history[..window]
                .iter()
                .map(|stored| stored.operation.clone())
                .collect();
            let previous = self.storage.baseline(&oid)?;
            let outcome = fold_operations(
                &oid,
                previous.as_ref().map(|stored| &stored.baseline),
                &operations,
                &global_ack,
            );
            if outcome.folded < history.len() {
                report.hard_stopped += 1;
            }
            if outcome.folded == 0 {
                continue;
            }

            let folded = &history[..outcome.folded];
            let order = folded
                .iter()
                .map(|stored| stored.server_order)
                .chain(previous.map(|stored| stored.server_order))
                .max()
                .unwrap_or_default();
            if let Some(baseline) = outcome.baseline {
                self.storage.put_baseline(baseline, order)?;
            }
            let keys: Vec<(Oid, Timestamp)> = folded
                .iter()
                .map(|stored| (stored.operation.oid.clone(), stored.operation.timestamp.clone()))
                .collect();
            self.storage.delete_operations(&keys)?;

            for reference in outcome.detached {
                if let Ref::File(file_id) = reference {
                    if self.storage.mark_file_pending_delete(&file_id)? {
                        report.files_marked += 1;
                    }
                }
            }
            debug!(library = %self.id, oid = %oid, folded = outcome.folded, "folded object");
            report.objects += 1;
            report.folded += outcome.folded;
        }

        if report.folded > 0 {
            info!(
                library = %self.id,
                objects = report.objects,
                folded = report.folded,
                hard_stopped = report.hard_stopped,
                "rebase complete"
            );
            if self.last_global_ack.as_ref().map_or(true, |last| global_ack > *last) {
                self.last_global_ack = Some(global_ack.clone());
            }
            self.broadcast(None, false, &ServerMessage::GlobalAck {
                timestamp: global_ack.clone(),
            });
            self.publish(LibraryEvent::Rebased {
                global_ack,
                folded: report.folded,
            });
        }
        Ok(report)
    }

    /// Deletes files flagged for deletion.
    ///
    /// Failures are logged per file and retried on the next sweep. Returns
    /// the number of files deleted.
    pub fn sweep_files(&mut self) -> ServerResult<usize> {
        let mut deleted = 0;
        for file in self.storage.pending_delete_files()? {
            match self.files.delete(&file) {
                Ok(()) => {
                    self.storage.delete_file(&file.id)?;
                    deleted += 1;
                }
                Err(e) => {
                    warn!(library = %self.id, file = %file.id, error = %e, "file delete failed");
                }
            }
        }
        if deleted > 0 {
            info!(library = %self.id, deleted, "swept pending files");
        }
        Ok(deleted)
    }

    /// Records file metadata.
    pub fn put_file(&mut self, file: FileMetadata) -> ServerResult<()> {
        self.storage.put_file(file)
    }

    /// Forgets a replica. Returns true if it was known.
    pub fn evict_replica(&mut self, replica_id: &str) -> ServerResult<bool> {
        let removed = self.storage.delete_replica(replica_id)?;
        if removed {
            info!(library = %self.id, replica = %replica_id, "evicted replica");
            self.rebase_requested = true;
        }
        Ok(removed)
    }

    /// Forgets every disconnected truant replica. Returns their ids.
    pub fn evict_truant_replicas(&mut self) -> ServerResult<Vec<String>> {
        let now = self.clock.now_ms();
        let connected: BTreeSet<String> = self
            .clients
            .values()
            .filter_map(|c| c.replica_id.clone())
            .collect();
        let mut evicted = Vec::new();
        for replica in self.storage.replicas()? {
            if connected.contains(&replica.id) {
                continue;
            }
            if replica.status(now, self.config.truant_cutoff) == ReplicaStatus::Truant
                && self.evict_replica(&replica.id)?
            {
                evicted.push(replica.id);
            }
        }
        Ok(evicted)
    }

    fn send(&self, key: ClientKey, message: ServerMessage) {
        if let Some(client) = self.clients.get(&key) {
            if client.outbox.send(message).is_err() {
                debug!(library = %self.id, key, "outbox closed");
            }
        }
    }

    /// Sends to every bound connection except `except`, optionally only to
    /// realtime replicas.
    fn broadcast(&self, except: Option<ClientKey>, realtime_only: bool, message: &ServerMessage) {
        for (key, client) in &self.clients {
            if Some(*key) == except || client.replica_id.is_none() {
                continue;
            }
            if realtime_only && !client.session.replica_type.is_realtime() {
                continue;
            }
            if client.outbox.send(message.clone()).is_err() {
                debug!(library = %self.id, key, "outbox closed");
            }
        }
    }

    fn publish(&self, event: LibraryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn merge_ranges(a: Option<AckNonce>, b: Option<AckNonce>) -> Option<AckNonce> {
    match (a, b) {
        (Some(a), Some(b)) => Some(AckNonce::new(a.first.min(b.first), a.last.max(b.last))),
        (a, b) => a.or(b),
    }
}
