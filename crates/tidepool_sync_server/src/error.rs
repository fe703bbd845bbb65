//! Error types for the sync server.

use thiserror::Error;
use tidepool_core::CoreError;
use tidepool_sync_protocol::ProtocolError;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Authorization failed.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Persistence error.
    #[error("storage error: {0}")]
    Storage(String),

    /// The library id is not served here.
    #[error("unknown library: {0:?}")]
    UnknownLibrary(String),

    /// The connection key does not belong to a connected client.
    #[error("unknown client: {0}")]
    UnknownClient(u64),

    /// The library actor has shut down.
    #[error("library {0:?} is closed")]
    LibraryClosed(String),

    /// The file-storage collaborator failed.
    #[error("file storage error: {0}")]
    FileStorage(String),

    /// Wire-level error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Document model error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::NotAuthorized(_)
                | ServerError::UnknownLibrary(_)
                | ServerError::UnknownClient(_)
                | ServerError::Protocol(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            ServerError::Storage(_)
                | ServerError::LibraryClosed(_)
                | ServerError::FileStorage(_)
                | ServerError::Core(_)
                | ServerError::Internal(_)
        )
    }
}
