//! Error types for Tidepool core.

use crate::oid::Oid;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the document model.
///
/// The diff and patch engines tolerate shape mismatches, so these errors
/// describe broken invariants or corrupt stored data rather than user edits.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A node that must carry an object identifier has none.
    #[error("node has no object identifier (parent {parent:?})")]
    MissingOid {
        /// Identifier of the nearest identified ancestor, if any.
        parent: Option<Oid>,
    },

    /// An object identifier string is malformed.
    #[error("invalid object identifier: {value:?}")]
    InvalidOid {
        /// The rejected input.
        value: String,
    },

    /// A timestamp string is malformed.
    #[error("invalid timestamp: {value:?}")]
    InvalidTimestamp {
        /// The rejected input.
        value: String,
    },

    /// A stored view or snapshot has an unusable shape.
    #[error("invalid snapshot for {oid}: {message}")]
    InvalidSnapshot {
        /// The object whose view is broken.
        oid: Oid,
        /// Description of the problem.
        message: String,
    },

    /// The object graph of a document visits the same node twice.
    #[error("reference cycle through {oid}")]
    ReferenceCycle {
        /// The object reached a second time.
        oid: Oid,
    },

    /// A JSON value cannot be turned into a document.
    #[error("invalid document: {message}")]
    InvalidDocument {
        /// Description of the problem.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid snapshot error.
    pub fn invalid_snapshot(oid: &Oid, message: impl Into<String>) -> Self {
        Self::InvalidSnapshot {
            oid: oid.clone(),
            message: message.into(),
        }
    }

    /// Creates an invalid document error.
    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            message: message.into(),
        }
    }

    /// Returns true if the error points at corrupt stored data.
    ///
    /// Corrupt data is skipped by replicas; everything else is a caller bug.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidSnapshot { .. } | CoreError::ReferenceCycle { .. }
        )
    }
}
