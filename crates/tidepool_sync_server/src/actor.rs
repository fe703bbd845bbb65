//! Library actor.
//!
//! Each library runs as one tokio task that owns its [`Library`] state and
//! processes commands in arrival order. Accepted writes schedule a rebase
//! after the configured debounce; requests arriving while one is scheduled
//! are coalesced into it.

use crate::error::{ServerError, ServerResult};
use crate::files::FileMetadata;
use crate::library::{ClientKey, ClientSession, Library, LibraryEvent, RebaseReport};
use tidepool_core::Timestamp;
use tidepool_sync_protocol::{ClientMessage, ServerMessage};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<ServerResult<T>>;

enum LibraryCommand {
    Connect {
        session: ClientSession,
        outbox: mpsc::UnboundedSender<ServerMessage>,
        reply: Reply<ClientKey>,
    },
    Message {
        key: ClientKey,
        message: ClientMessage,
        reply: Reply<()>,
    },
    Disconnect {
        key: ClientKey,
        reply: Option<Reply<()>>,
    },
    Rebase {
        reply: Reply<RebaseReport>,
    },
    EvictReplica {
        replica_id: String,
        reply: Reply<bool>,
    },
    EvictTruant {
        reply: Reply<Vec<String>>,
    },
    PutFile {
        file: FileMetadata,
        reply: Reply<()>,
    },
    GlobalAck {
        reply: Reply<Option<Timestamp>>,
    },
    Shutdown,
}

/// Handle to a running library actor.
#[derive(Clone)]
pub struct LibraryHandle {
    id: String,
    commands: mpsc::Sender<LibraryCommand>,
    events: broadcast::Sender<LibraryEvent>,
}

impl LibraryHandle {
    /// Spawns the actor on the current tokio runtime.
    pub fn spawn(library: Library) -> ServerResult<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ServerError::Internal(format!("no tokio runtime: {e}")))?;
        let (commands, receiver) = mpsc::channel(library.config().command_capacity);
        let handle = Self {
            id: library.id().to_string(),
            commands,
            events: library.event_sender(),
        };
        runtime.spawn(run(library, receiver));
        Ok(handle)
    }

    /// Library id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribes to library events.
    pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
        self.events.subscribe()
    }

    /// True once the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Registers a connection.
    pub async fn connect(
        &self,
        session: ClientSession,
        outbox: mpsc::UnboundedSender<ServerMessage>,
    ) -> ServerResult<ClientKey> {
        self.request(|reply| LibraryCommand::Connect {
            session,
            outbox,
            reply,
        })
        .await
    }

    /// Delivers a client message and waits until it has been handled.
    pub async fn send(&self, key: ClientKey, message: ClientMessage) -> ServerResult<()> {
        self.request(|reply| LibraryCommand::Message {
            key,
            message,
            reply,
        })
        .await
    }

    /// Closes a connection.
    pub async fn disconnect(&self, key: ClientKey) -> ServerResult<()> {
        self.request(|reply| LibraryCommand::Disconnect {
            key,
            reply: Some(reply),
        })
        .await
    }

    /// Closes a connection without waiting. Used from `Drop`.
    pub(crate) fn disconnect_now(&self, key: ClientKey) {
        if self
            .commands
            .try_send(LibraryCommand::Disconnect { key, reply: None })
            .is_err()
        {
            debug!(library = %self.id, key, "could not queue disconnect");
        }
    }

    /// Runs a rebase pass immediately.
    pub async fn rebase(&self) -> ServerResult<RebaseReport> {
        self.request(|reply| LibraryCommand::Rebase { reply }).await
    }

    /// Forgets a replica.
    pub async fn evict_replica(&self, replica_id: impl Into<String>) -> ServerResult<bool> {
        let replica_id = replica_id.into();
        self.request(|reply| LibraryCommand::EvictReplica { replica_id, reply })
            .await
    }

    /// Forgets every disconnected truant replica.
    pub async fn evict_truant_replicas(&self) -> ServerResult<Vec<String>> {
        self.request(|reply| LibraryCommand::EvictTruant { reply })
            .await
    }

    /// Records file metadata.
    pub async fn put_file(&self, file: FileMetadata) -> ServerResult<()> {
        self.request(|reply| LibraryCommand::PutFile { file, reply })
            .await
    }

    /// Current global acknowledgement.
    pub async fn global_ack(&self) -> ServerResult<Option<Timestamp>> {
        self.request(|reply| LibraryCommand::GlobalAck { reply })
            .await
    }

    /// Stops the actor after the commands already queued.
    pub async fn shutdown(&self) {
        if self.commands.send(LibraryCommand::Shutdown).await.is_err() {
            debug!(library = %self.id, "library already stopped");
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> LibraryCommand,
    ) -> ServerResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ServerError::LibraryClosed(self.id.clone()))?;
        response
            .await
            .map_err(|_| ServerError::LibraryClosed(self.id.clone()))?
    }
}

async fn run(mut library: Library, mut commands: mpsc::Receiver<LibraryCommand>) {
    let debounce = library.config().rebase_debounce;
    let mut deadline: Option<Instant> = None;
    info!(library = %library.id(), "library started");

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                if !dispatch(&mut library, command) {
                    break;
                }
                if library.take_rebase_request() && deadline.is_none() {
                    deadline = Some(Instant::now() + debounce);
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                match library.rebase() {
                    Ok(report) => debug!(library = %library.id(), ?report, "scheduled rebase"),
                    Err(e) => warn!(library = %library.id(), error = %e, "rebase failed"),
                }
            }
        }
    }

    info!(library = %library.id(), "library stopped");
}

/// Handles one command. Returns false on shutdown.
fn dispatch(library: &mut Library, command: LibraryCommand) -> bool {
    match command {
        LibraryCommand::Connect {
            session,
            outbox,
            reply,
        } => {
            let _ = reply.send(Ok(library.connect(session, outbox)));
        }
        LibraryCommand::Message {
            key,
            message,
            reply,
        } => {
            let result = library.handle_message(key, message);
            if let Err(e) = &result {
                warn!(library = %library.id(), key, error = %e, "message rejected");
            }
            let _ = reply.send(result);
        }
        LibraryCommand::Disconnect { key, reply } => {
            let result = library.disconnect(key);
            if let Err(e) = &result {
                warn!(library = %library.id(), key, error = %e, "disconnect failed");
            }
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
        LibraryCommand::Rebase { reply } => {
            let _ = reply.send(library.rebase());
        }
        LibraryCommand::EvictReplica { replica_id, reply } => {
            let _ = reply.send(library.evict_replica(&replica_id));
        }
        LibraryCommand::EvictTruant { reply } => {
            let _ = reply.send(library.evict_truant_replicas());
        }
        LibraryCommand::PutFile { file, reply } => {
            let _ = reply.send(library.put_file(file));
        }
        LibraryCommand::GlobalAck { reply } => {
            let _ = reply.send(library.global_ack());
        }
        LibraryCommand::Shutdown => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::files::MemoryFileStorage;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tidepool_core::{Oid, Operation, OperationData};
    use tidepool_sync_protocol::ReplicaType;

    fn spawn(debounce: Duration) -> LibraryHandle {
        let library = Library::new(
            "lib",
            ServerConfig::default().with_rebase_debounce(debounce),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryFileStorage::new()),
        );
        LibraryHandle::spawn(library).unwrap()
    }

    fn ts(n: u64) -> Timestamp {
        Timestamp::new(0, n, 0, "a")
    }

    #[tokio::test]
    async fn commands_are_answered() {
        let handle = spawn(Duration::from_secs(60));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let key = handle
            .connect(ClientSession::new("u", ReplicaType::Realtime), tx)
            .await
            .unwrap();
        handle
            .send(
                key,
                ClientMessage::Heartbeat {
                    replica_id: "a".into(),
                    timestamp: ts(1),
                },
            )
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(ServerMessage::HeartbeatResponse));
        assert!(handle.global_ack().await.unwrap().is_none());

        handle.shutdown().await;
        assert!(matches!(
            handle.rebase().await,
            Err(ServerError::LibraryClosed(_))
        ));
    }

    #[tokio::test]
    async fn writes_schedule_one_rebase() {
        let handle = spawn(Duration::from_millis(20));
        let mut events = handle.subscribe();
        let (tx, _rx) = mpsc::unbounded_channel();
        let key = handle
            .connect(ClientSession::new("u", ReplicaType::Realtime), tx)
            .await
            .unwrap();
        let oid = Oid::new("notes", "n1");
        handle
            .send(
                key,
                ClientMessage::Sync {
                    replica_id: "a".into(),
                    timestamp: ts(10),
                    since: None,
                    resync_all: false,
                    operations: vec![Operation::new(
                        oid.clone(),
                        ts(1),
                        OperationData::Initialize { value: json!({}) },
                    )],
                    baselines: vec![],
                    schema_version: None,
                },
            )
            .await
            .unwrap();
        handle
            .send(
                key,
                ClientMessage::Op {
                    replica_id: "a".into(),
                    timestamp: ts(11),
                    operations: vec![Operation::new(
                        oid,
                        ts(2),
                        OperationData::Set {
                            name: "title".into(),
                            value: json!("hi"),
                        },
                    )],
                },
            )
            .await
            .unwrap();

        let mut rebases = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
            if let LibraryEvent::Rebased { folded, .. } = event {
                assert_eq!(folded, 2);
                rebases += 1;
                break;
            }
        }
        assert_eq!(rebases, 1);
    }
}
