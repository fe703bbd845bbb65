//! # Tidepool Sync Server
//!
//! Library actors and the server-side half of the Tidepool sync protocol.
//!
//! This crate provides:
//! - A registry of libraries, each run as a tokio actor
//! - The server log of operations and baselines, keyed by server order
//! - The replica registry with truancy detection
//! - Presence fan-out and global acknowledgement tracking
//! - Debounced rebase compaction with per-object hard stops
//! - Deferred deletion of files no document references
//! - Authentication middleware (HMAC-SHA256 tokens)
//!
//! # Architecture
//!
//! A library is owned by exactly one task. Connections talk to it through a
//! [`LibraryHandle`]; replies and broadcasts come back on each connection's
//! own channel. Storage and file contents sit behind the [`LibraryStorage`]
//! and [`FileStorage`] traits, with in-memory implementations included.
//!
//! # Authentication
//!
//! Authentication is optional but recommended for production:
//!
//! ```rust
//! use tidepool_sync_server::{ServerConfig, SyncServer, TokenInfo};
//! use tidepool_sync_protocol::ReplicaType;
//!
//! let secret = b"my-secure-secret-32-bytes-long!".to_vec();
//! let server = SyncServer::new(ServerConfig::default().with_auth(secret));
//!
//! // Issue a token for a replica of library "notes"
//! let info = TokenInfo::new("alice", "notes", ReplicaType::Realtime);
//! let token = server.validator().unwrap().create_token(&info).unwrap();
//! assert!(server.validator().unwrap().validate_token(&token, "notes").is_ok());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod actor;
mod auth;
mod clock;
mod config;
mod error;
mod files;
mod library;
mod oplog;
mod presence;
mod replicas;
mod server;
mod storage;

pub use actor::LibraryHandle;
pub use auth::{AuthConfig, TokenInfo, TokenValidator};
pub use clock::{ManualClock, SystemClock, WallClock};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use files::{FileMetadata, FileStorage, MemoryFileStorage};
pub use library::{ClientKey, ClientSession, Library, LibraryEvent, RebaseReport};
pub use oplog::{ServerOplog, StoredBaseline, StoredOperation};
pub use presence::PresenceTable;
pub use replicas::{ReplicaInfo, ReplicaStatus};
pub use server::{Credentials, ServerConnection, StorageFactory, SyncServer};
pub use storage::{LibraryStorage, MemoryStorage};
