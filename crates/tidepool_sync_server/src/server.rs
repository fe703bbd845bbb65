//! Main sync server.

use crate::actor::LibraryHandle;
use crate::auth::{AuthConfig, TokenValidator};
use crate::clock::{SystemClock, WallClock};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::files::{FileStorage, MemoryFileStorage};
use crate::library::{ClientKey, ClientSession, Library};
use crate::storage::{LibraryStorage, MemoryStorage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tidepool_sync_protocol::{ClientMessage, ReplicaType, ServerMessage, WireFormat};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Creates the storage of a library on first use.
pub type StorageFactory = Arc<dyn Fn(&str) -> Arc<dyn LibraryStorage> + Send + Sync>;

/// How a connection proves who it is.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// A token issued by [`TokenValidator::create_token`].
    Token(String),
    /// Identity vouched for by the embedding application. Rejected when
    /// authentication is required.
    Trusted {
        /// User id.
        user_id: String,
        /// Replica type.
        replica_type: ReplicaType,
    },
}

/// The sync server.
///
/// Keeps a registry of library actors, spawning each on first access, and
/// authenticates connections before handing them to a library.
///
/// # Example
///
/// ```
/// use tidepool_sync_server::{Credentials, ServerConfig, SyncServer};
/// use tidepool_sync_protocol::ReplicaType;
///
/// # tokio_test();
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn tokio_test() {
/// let server = SyncServer::new(ServerConfig::default());
/// let connection = server
///     .connect("library-1", Credentials::Trusted {
///         user_id: "alice".into(),
///         replica_type: ReplicaType::Realtime,
///     })
///     .await
///     .unwrap();
/// assert_eq!(connection.library_id(), "library-1");
/// # }
/// ```
pub struct SyncServer {
    config: ServerConfig,
    validator: Option<TokenValidator>,
    storage: StorageFactory,
    files: Arc<dyn FileStorage>,
    clock: Arc<dyn WallClock>,
    libraries: RwLock<HashMap<String, LibraryHandle>>,
}

impl SyncServer {
    /// Creates a server with in-memory storage.
    pub fn new(config: ServerConfig) -> Self {
        let validator = config.auth_secret.clone().map(|secret| {
            TokenValidator::new(AuthConfig::new(secret).with_expiry(config.token_expiry))
        });
        Self {
            config,
            validator,
            storage: Arc::new(|_: &str| Arc::new(MemoryStorage::new()) as Arc<dyn LibraryStorage>),
            files: Arc::new(MemoryFileStorage::new()),
            clock: Arc::new(SystemClock),
            libraries: RwLock::new(HashMap::new()),
        }
    }

    /// Uses `factory` to create library storage.
    pub fn with_storage(
        mut self,
        factory: impl Fn(&str) -> Arc<dyn LibraryStorage> + Send + Sync + 'static,
    ) -> Self {
        self.storage = Arc::new(factory);
        self
    }

    /// Uses `files` for file contents.
    pub fn with_file_storage(mut self, files: Arc<dyn FileStorage>) -> Self {
        self.files = files;
        self
    }

    /// Replaces the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    /// The configuration in effect.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The token validator, if authentication is configured.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }

    /// Returns the actor of a library, spawning it if needed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn library(&self, library_id: &str) -> ServerResult<LibraryHandle> {
        if library_id.is_empty() {
            return Err(ServerError::InvalidRequest("empty library id".into()));
        }
        if let Some(handle) = self.libraries.read().get(library_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let mut libraries = self.libraries.write();
        if let Some(handle) = libraries.get(library_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }
        let library = Library::new(
            library_id,
            self.config.clone(),
            (self.storage)(library_id),
            Arc::clone(&self.files),
        )
        .with_clock(Arc::clone(&self.clock));
        let handle = LibraryHandle::spawn(library)?;
        libraries.insert(library_id.to_string(), handle.clone());
        debug!(library = %library_id, "spawned library");
        Ok(handle)
    }

    /// Ids of the libraries currently loaded.
    pub fn library_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.libraries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolves credentials to a session on `library_id`.
    pub fn authenticate(
        &self,
        library_id: &str,
        credentials: Credentials,
    ) -> ServerResult<ClientSession> {
        match credentials {
            Credentials::Token(token) => {
                let validator = self.validator.as_ref().ok_or_else(|| {
                    ServerError::AuthenticationFailed("token authentication is not configured".into())
                })?;
                let info = validator.validate_token(&token, library_id)?;
                Ok(ClientSession::new(info.user_id, info.replica_type))
            }
            Credentials::Trusted {
                user_id,
                replica_type,
            } => {
                if self.config.require_auth {
                    return Err(ServerError::AuthenticationFailed(
                        "a token is required".into(),
                    ));
                }
                Ok(ClientSession::new(user_id, replica_type))
            }
        }
    }

    /// Authenticates and opens a connection to a library.
    pub async fn connect(
        &self,
        library_id: &str,
        credentials: Credentials,
    ) -> ServerResult<ServerConnection> {
        let session = self.authenticate(library_id, credentials)?;
        let handle = self.library(library_id)?;
        let (outbox, inbox) = mpsc::unbounded_channel();
        let key = handle.connect(session.clone(), outbox).await?;
        Ok(ServerConnection {
            key,
            session,
            handle,
            inbox,
            closed: false,
        })
    }

    /// Stops every library actor.
    pub async fn shutdown(&self) {
        let handles: Vec<LibraryHandle> = self.libraries.write().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.shutdown().await;
        }
        info!(libraries = handles.len(), "sync server stopped");
    }
}

/// One client connection to a library.
///
/// Dropping the connection disconnects it.
pub struct ServerConnection {
    key: ClientKey,
    session: ClientSession,
    handle: LibraryHandle,
    inbox: mpsc::UnboundedReceiver<ServerMessage>,
    closed: bool,
}

impl ServerConnection {
    /// Connection key within the library.
    pub fn key(&self) -> ClientKey {
        self.key
    }

    /// The authenticated session.
    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    /// Library the connection belongs to.
    pub fn library_id(&self) -> &str {
        self.handle.id()
    }

    /// Sends a message and waits until the library has handled it.
    pub async fn send(&self, message: ClientMessage) -> ServerResult<()> {
        self.handle.send(self.key, message).await
    }

    /// Decodes a wire frame in either format and sends it.
    pub async fn send_frame(&self, frame: &[u8]) -> ServerResult<()> {
        let message: ClientMessage = WireFormat::detect(frame).decode(frame)?;
        self.send(message).await
    }

    /// Waits for the next message from the library.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.inbox.recv().await
    }

    /// Returns the next message if one is waiting.
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.inbox.try_recv().ok()
    }

    /// Waits for the next message and encodes it.
    pub async fn recv_frame(&mut self, format: WireFormat) -> ServerResult<Option<Vec<u8>>> {
        match self.inbox.recv().await {
            Some(message) => Ok(Some(format.encode(&message)?)),
            None => Ok(None),
        }
    }

    /// Disconnects and waits for the library to process it.
    pub async fn close(mut self) -> ServerResult<()> {
        self.closed = true;
        self.handle.disconnect(self.key).await
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.handle.disconnect_now(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenInfo;

    #[tokio::test]
    async fn libraries_are_spawned_once() {
        let server = SyncServer::new(ServerConfig::default());
        let a = server.library("one").unwrap();
        let b = server.library("one").unwrap();
        server.library("two").unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(server.library_ids(), vec!["one".to_string(), "two".to_string()]);
        assert!(server.library("").is_err());

        server.shutdown().await;
        assert!(server.library_ids().is_empty());
    }

    #[test]
    fn library_needs_a_runtime() {
        let server = SyncServer::new(ServerConfig::default());
        assert!(matches!(server.library("one"), Err(ServerError::Internal(_))));
    }

    #[test]
    fn token_authentication() {
        let server = SyncServer::new(ServerConfig::default().with_auth(b"secret".to_vec()));
        let token = server
            .validator()
            .unwrap()
            .create_token(&TokenInfo::new("alice", "lib", ReplicaType::Push))
            .unwrap();

        let session = server
            .authenticate("lib", Credentials::Token(token.clone()))
            .unwrap();
        assert_eq!(session, ClientSession::new("alice", ReplicaType::Push));

        assert!(server
            .authenticate("other", Credentials::Token(token))
            .is_err());
        let trusted = Credentials::Trusted {
            user_id: "mallory".into(),
            replica_type: ReplicaType::Realtime,
        };
        assert!(matches!(
            server.authenticate("lib", trusted),
            Err(ServerError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn tokens_need_a_validator() {
        let server = SyncServer::new(ServerConfig::default());
        assert!(server
            .authenticate("lib", Credentials::Token("abc.def".into()))
            .is_err());
    }
}
