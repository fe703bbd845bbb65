//! File metadata and the file-storage collaborator.

use crate::error::{ServerError, ServerResult};
use parking_lot::Mutex;
use std::collections::HashSet;

/// Metadata of an uploaded file referenced from documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// File id, as used in `{"@@type": "file", "id": ...}` references.
    pub id: String,
    /// Original file name.
    pub name: String,
    /// MIME type.
    pub content_type: String,
    /// Set once no document references the file any more.
    pub pending_delete: bool,
}

impl FileMetadata {
    /// Creates metadata for a live file.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            content_type: content_type.into(),
            pending_delete: false,
        }
    }
}

/// Stores file contents on behalf of a library.
pub trait FileStorage: Send + Sync {
    /// Removes the file contents.
    fn delete(&self, file: &FileMetadata) -> ServerResult<()>;

    /// Returns a URL clients can fetch the file from.
    fn url(&self, file: &FileMetadata) -> String;
}

/// In-memory file storage that records deletions.
#[derive(Debug, Default)]
pub struct MemoryFileStorage {
    deleted: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryFileStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes deletions of `id` fail until [`MemoryFileStorage::recover`] is called.
    pub fn fail_on(&self, id: impl Into<String>) {
        self.failing.lock().insert(id.into());
    }

    /// Lets deletions of `id` succeed again.
    pub fn recover(&self, id: &str) {
        self.failing.lock().remove(id);
    }

    /// Returns the ids deleted so far, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }
}

impl FileStorage for MemoryFileStorage {
    fn delete(&self, file: &FileMetadata) -> ServerResult<()> {
        if self.failing.lock().contains(&file.id) {
            return Err(ServerError::FileStorage(format!(
                "cannot delete {}",
                file.id
            )));
        }
        self.deleted.lock().push(file.id.clone());
        Ok(())
    }

    fn url(&self, file: &FileMetadata) -> String {
        format!("memory://files/{}/{}", file.id, file.name)
    }
}
