//! Client engines talking to a server library.

use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidepool_core::{HybridLogicalClock, Oid, SequentialSubIds};
use tidepool_sync_engine::{
    BatchConfig, MockTransport, SyncConfig, SyncEngine, SyncError, SyncState,
};
use tidepool_sync_protocol::{ReplicaType, ServerMessage};
use tidepool_sync_server::{
    ClientKey, ClientSession, Library, ManualClock, MemoryFileStorage, MemoryStorage,
    ServerConfig,
};
use tokio::sync::mpsc;

const TRUANT_CUTOFF: Duration = Duration::from_secs(60);

struct Peer {
    engine: SyncEngine<MockTransport>,
    key: Option<ClientKey>,
    inbox: Option<mpsc::UnboundedReceiver<ServerMessage>>,
}

struct Network {
    library: Library,
    server_clock: Arc<ManualClock>,
    time: Arc<AtomicU64>,
    peers: Vec<Peer>,
}

impl Network {
    fn new() -> Self {
        let server_clock = Arc::new(ManualClock::new(0));
        Self {
            library: new_library(&server_clock),
            server_clock,
            time: Arc::new(AtomicU64::new(1_000)),
            peers: Vec::new(),
        }
    }

    /// Adds a replica and returns its index.
    fn add(&mut self, replica: &str, replica_type: ReplicaType) -> usize {
        let time = Arc::clone(&self.time);
        let clock = HybridLogicalClock::with_wall_clock(
            replica,
            Arc::new(move || time.load(Ordering::SeqCst)),
        );
        let config = SyncConfig::new("team", replica)
            .with_replica_type(replica_type)
            .with_batch(BatchConfig::immediate());
        let engine = SyncEngine::new(config, MockTransport::new())
            .with_clock(Arc::new(clock))
            .with_sub_ids(SequentialSubIds::new(format!("{replica}-")));
        self.peers.push(Peer {
            engine,
            key: None,
            inbox: None,
        });
        self.peers.len() - 1
    }

    fn engine(&self, peer: usize) -> &SyncEngine<MockTransport> {
        &self.peers[peer].engine
    }

    /// Opens a server connection for `peer` under the given session type.
    fn connect_as(&mut self, peer: usize, session_type: ReplicaType) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let key = self
            .library
            .connect(ClientSession::new(format!("user-{peer}"), session_type), outbox);
        self.peers[peer].key = Some(key);
        self.peers[peer].inbox = Some(inbox);
    }

    /// Connects and starts a sync.
    fn sync(&mut self, peer: usize) {
        if self.peers[peer].key.is_none() {
            let replica_type = self.peers[peer].engine.config().replica_type;
            self.connect_as(peer, replica_type);
        }
        self.tick_time();
        self.peers[peer].engine.start_sync().unwrap();
    }

    fn disconnect(&mut self, peer: usize) {
        if let Some(key) = self.peers[peer].key.take() {
            self.library.disconnect(key).unwrap();
        }
        self.peers[peer].inbox = None;
        self.peers[peer].engine.disconnect().unwrap();
    }

    fn tick_time(&self) {
        self.time.fetch_add(10, Ordering::SeqCst);
    }

    /// Delivers messages both ways until nothing moves. Returns engine errors.
    fn pump(&mut self) -> Vec<SyncError> {
        let mut errors = Vec::new();
        loop {
            let mut moved = false;
            for peer in &self.peers {
                let Some(key) = peer.key else { continue };
                for message in peer.engine.transport().take_sent() {
                    moved = true;
                    self.library.handle_message(key, message).unwrap();
                }
            }
            for peer in &mut self.peers {
                let Some(inbox) = peer.inbox.as_mut() else {
                    continue;
                };
                while let Ok(message) = inbox.try_recv() {
                    moved = true;
                    if let Err(e) = peer.engine.receive(message) {
                        errors.push(e);
                    }
                }
            }
            if !moved {
                return errors;
            }
            self.tick_time();
        }
    }

    fn put(&self, peer: usize, oid: &Oid, value: JsonValue) {
        self.tick_time();
        self.engine(peer).put(oid, &value).unwrap();
    }
}

fn new_library(clock: &Arc<ManualClock>) -> Library {
    Library::new(
        "team",
        ServerConfig::default().with_truant_cutoff(TRUANT_CUTOFF),
        Arc::new(MemoryStorage::new()),
        Arc::new(MemoryFileStorage::new()),
    )
    .with_clock(clock.clone())
}

fn note() -> Oid {
    Oid::new("notes", "n1")
}

#[test]
fn edits_converge_across_replicas() {
    let mut net = Network::new();
    let a = net.add("a", ReplicaType::Realtime);
    let b = net.add("b", ReplicaType::Realtime);

    net.sync(a);
    assert!(net.pump().is_empty());
    net.put(a, &note(), json!({"title": "draft", "tags": ["x"], "meta": {"words": 1}}));
    assert!(net.pump().is_empty());
    assert_eq!(net.engine(a).pending_operations(), 0);

    net.sync(b);
    assert!(net.pump().is_empty());
    assert_eq!(net.engine(b).state(), SyncState::Synced);
    assert_eq!(net.engine(b).get(&note()), net.engine(a).get(&note()));

    net.put(
        b,
        &note(),
        json!({"title": "final", "tags": ["x", "y"], "meta": {"words": 2}}),
    );
    assert!(net.pump().is_empty());
    let expected = json!({"title": "final", "tags": ["x", "y"], "meta": {"words": 2}});
    assert_eq!(net.engine(a).get(&note()), Some(expected.clone()));
    assert_eq!(net.engine(b).get(&note()), Some(expected));
}

#[test]
fn concurrent_edits_to_different_fields_merge() {
    let mut net = Network::new();
    let a = net.add("a", ReplicaType::Realtime);
    let b = net.add("b", ReplicaType::Realtime);
    net.sync(a);
    net.pump();
    net.put(a, &note(), json!({"title": "t", "body": "b"}));
    net.pump();
    net.sync(b);
    net.pump();

    // Both edit before either hears from the other.
    net.put(a, &note(), json!({"title": "from a", "body": "b"}));
    net.put(b, &note(), json!({"title": "t", "body": "from b"}));
    assert!(net.pump().is_empty());

    let merged = json!({"title": "from a", "body": "from b"});
    assert_eq!(net.engine(a).get(&note()), Some(merged.clone()));
    assert_eq!(net.engine(b).get(&note()), Some(merged));
}

#[test]
fn acknowledged_history_is_folded_locally() {
    let mut net = Network::new();
    let a = net.add("a", ReplicaType::Realtime);
    let b = net.add("b", ReplicaType::Realtime);
    net.sync(a);
    net.pump();
    net.put(a, &note(), json!({"title": "draft"}));
    net.pump();
    net.sync(b);
    net.pump();

    for peer in [a, b] {
        let engine = net.engine(peer);
        assert!(engine.operations().is_empty(), "replica {peer} kept its log");
        assert!(!engine.baselines().is_empty());
        assert_eq!(engine.get(&note()), Some(json!({"title": "draft"})));
    }
}

#[test]
fn empty_library_is_rebuilt_from_client_history() {
    let mut net = Network::new();
    let a = net.add("a", ReplicaType::Realtime);
    net.sync(a);
    net.pump();
    net.put(a, &note(), json!({"title": "kept"}));
    net.put(a, &Oid::new("notes", "n2"), json!({"items": [1, 2]}));
    net.pump();

    // The server loses its data.
    net.disconnect(a);
    net.library = new_library(&net.server_clock);

    net.sync(a);
    assert!(net.pump().is_empty());
    assert_eq!(net.engine(a).state(), SyncState::Synced);

    let b = net.add("b", ReplicaType::Realtime);
    net.sync(b);
    assert!(net.pump().is_empty());
    assert_eq!(net.engine(b).get(&note()), Some(json!({"title": "kept"})));
    assert_eq!(
        net.engine(b).get(&Oid::new("notes", "n2")),
        Some(json!({"items": [1, 2]}))
    );
}

#[test]
fn truant_replica_is_overwritten() {
    let mut net = Network::new();
    let a = net.add("a", ReplicaType::Realtime);
    let b = net.add("b", ReplicaType::Realtime);
    net.sync(a);
    net.pump();
    net.put(a, &note(), json!({"title": "v1"}));
    net.pump();
    net.sync(b);
    net.pump();

    net.disconnect(b);
    net.put(b, &note(), json!({"title": "offline"}));
    net.put(a, &note(), json!({"title": "v2"}));
    net.pump();

    net.server_clock.advance(TRUANT_CUTOFF.as_millis() as u64 + 1);
    net.sync(b);
    assert!(net.pump().is_empty());

    assert_eq!(net.engine(b).get(&note()), Some(json!({"title": "v2"})));
    assert_eq!(net.engine(b).pending_operations(), 0);
    assert_eq!(net.engine(a).get(&note()), Some(json!({"title": "v2"})));
}

#[test]
fn returning_replica_pushes_offline_edits() {
    let mut net = Network::new();
    let a = net.add("a", ReplicaType::Realtime);
    let b = net.add("b", ReplicaType::Realtime);
    net.sync(a);
    net.pump();
    net.put(a, &note(), json!({"title": "v1"}));
    net.pump();
    net.sync(b);
    net.pump();

    net.disconnect(b);
    net.put(b, &note(), json!({"title": "offline"}));
    net.sync(b);
    assert!(net.pump().is_empty());

    assert_eq!(net.engine(a).get(&note()), Some(json!({"title": "offline"})));
    assert_eq!(net.engine(b).pending_operations(), 0);
}

#[test]
fn undo_reaches_peers() {
    let mut net = Network::new();
    let a = net.add("a", ReplicaType::Realtime);
    let b = net.add("b", ReplicaType::Realtime);
    net.sync(a);
    net.sync(b);
    net.pump();

    net.put(a, &note(), json!({"title": "one"}));
    net.pump();
    net.put(a, &note(), json!({"title": "two"}));
    net.pump();
    assert_eq!(net.engine(b).get(&note()), Some(json!({"title": "two"})));

    net.tick_time();
    assert!(net.engine(a).undo().unwrap());
    net.pump();
    assert_eq!(net.engine(b).get(&note()), Some(json!({"title": "one"})));
}

#[test]
fn pull_replica_catches_up_on_next_sync() {
    let mut net = Network::new();
    let a = net.add("a", ReplicaType::Realtime);
    let b = net.add("b", ReplicaType::Pull);
    net.sync(a);
    net.sync(b);
    net.pump();

    net.put(a, &note(), json!({"title": "news"}));
    net.pump();
    assert_eq!(net.engine(b).get(&note()), None);

    net.sync(b);
    assert!(net.pump().is_empty());
    assert_eq!(net.engine(b).get(&note()), Some(json!({"title": "news"})));
}

#[test]
fn read_only_session_is_forbidden() {
    let mut net = Network::new();
    let a = net.add("a", ReplicaType::Realtime);
    net.connect_as(a, ReplicaType::ReadOnlyRealtime);
    net.sync(a);
    net.pump();

    net.put(a, &note(), json!({"title": "sneaky"}));
    let errors = net.pump();
    assert!(matches!(&errors[..], [SyncError::Forbidden]));
    assert_eq!(net.engine(a).state(), SyncState::Error);
}

#[test]
fn presence_is_shared() {
    let mut net = Network::new();
    let a = net.add("a", ReplicaType::Realtime);
    let b = net.add("b", ReplicaType::Realtime);
    net.sync(a);
    net.sync(b);
    net.pump();

    net.engine(a).set_presence(json!({"cursor": 3})).unwrap();
    net.pump();
    let peers = net.engine(b).peers();
    assert_eq!(peers["a"].presence, json!({"cursor": 3}));

    net.disconnect(a);
    net.pump();
    assert!(net.engine(b).peers().is_empty());
}
