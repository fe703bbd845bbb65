//! Persistence of a library.

use crate::error::ServerResult;
use crate::files::FileMetadata;
use crate::oplog::{ServerOplog, StoredBaseline, StoredOperation};
use crate::replicas::ReplicaInfo;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tidepool_core::{DocumentBaseline, Oid, Operation, Timestamp};
use tidepool_sync_protocol::{AckNonce, ServerOrder};

/// Storage backing one library.
///
/// Implementations must be internally synchronized; the library actor is
/// the only writer but observers may read concurrently.
pub trait LibraryStorage: Send + Sync {
    /// Highest server order handed out, or 0.
    fn latest_server_order(&self) -> ServerResult<ServerOrder>;

    /// True if the library holds neither operations nor baselines.
    fn is_empty(&self) -> ServerResult<bool>;

    /// Stores new operations; returns the server orders assigned.
    fn insert_operations(
        &self,
        replica_id: &str,
        operations: &[Operation],
    ) -> ServerResult<Option<AckNonce>>;

    /// Stores baselines newer than the ones on record; returns the server
    /// orders assigned.
    fn insert_baselines(&self, baselines: &[DocumentBaseline]) -> ServerResult<Option<AckNonce>>;

    /// Operations after `order`, optionally skipping one writer.
    fn operations_after(
        &self,
        order: ServerOrder,
        exclude_replica: Option<&str>,
    ) -> ServerResult<Vec<StoredOperation>>;

    /// Operations at or before `order`.
    fn operations_up_to(&self, order: ServerOrder) -> ServerResult<Vec<StoredOperation>>;

    /// Every operation targeting `oid`.
    fn operations_for(&self, oid: &Oid) -> ServerResult<Vec<StoredOperation>>;

    /// Removes operations by `(oid, timestamp)`.
    fn delete_operations(&self, keys: &[(Oid, Timestamp)]) -> ServerResult<usize>;

    /// Baselines that became visible after `order`.
    fn baselines_after(&self, order: ServerOrder) -> ServerResult<Vec<StoredBaseline>>;

    /// The baseline of one object.
    fn baseline(&self, oid: &Oid) -> ServerResult<Option<StoredBaseline>>;

    /// Replaces the baseline of one object.
    fn put_baseline(&self, baseline: DocumentBaseline, order: ServerOrder) -> ServerResult<()>;

    /// Looks up a replica.
    fn replica(&self, id: &str) -> ServerResult<Option<ReplicaInfo>>;

    /// Inserts or replaces a replica.
    fn put_replica(&self, replica: ReplicaInfo) -> ServerResult<()>;

    /// Removes a replica. Returns true if it existed.
    fn delete_replica(&self, id: &str) -> ServerResult<bool>;

    /// Every known replica.
    fn replicas(&self) -> ServerResult<Vec<ReplicaInfo>>;

    /// Inserts or replaces file metadata.
    fn put_file(&self, file: FileMetadata) -> ServerResult<()>;

    /// Looks up file metadata.
    fn file(&self, id: &str) -> ServerResult<Option<FileMetadata>>;

    /// Flags a file for deletion. Returns false if the file is unknown.
    fn mark_file_pending_delete(&self, id: &str) -> ServerResult<bool>;

    /// Files flagged for deletion.
    fn pending_delete_files(&self) -> ServerResult<Vec<FileMetadata>>;

    /// Forgets a file.
    fn delete_file(&self, id: &str) -> ServerResult<()>;
}

/// In-memory storage.
#[derive(Default)]
pub struct MemoryStorage {
    oplog: ServerOplog,
    replicas: RwLock<BTreeMap<String, ReplicaInfo>>,
    files: RwLock<BTreeMap<String, FileMetadata>>,
}

impl MemoryStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying log.
    pub fn oplog(&self) -> &ServerOplog {
        &self.oplog
    }
}

impl LibraryStorage for MemoryStorage {
    fn latest_server_order(&self) -> ServerResult<ServerOrder> {
        Ok(self.oplog.latest_server_order())
    }

    fn is_empty(&self) -> ServerResult<bool> {
        Ok(self.oplog.is_empty())
    }

    fn insert_operations(
        &self,
        replica_id: &str,
        operations: &[Operation],
    ) -> ServerResult<Option<AckNonce>> {
        Ok(self.oplog.append(replica_id, operations))
    }

    fn insert_baselines(&self, baselines: &[DocumentBaseline]) -> ServerResult<Option<AckNonce>> {
        Ok(self.oplog.append_baselines(baselines))
    }

    fn operations_after(
        &self,
        order: ServerOrder,
        exclude_replica: Option<&str>,
    ) -> ServerResult<Vec<StoredOperation>> {
        Ok(self.oplog.operations_after(order, exclude_replica))
    }

    fn operations_up_to(&self, order: ServerOrder) -> ServerResult<Vec<StoredOperation>> {
        Ok(self.oplog.operations_up_to(order))
    }

    fn operations_for(&self, oid: &Oid) -> ServerResult<Vec<StoredOperation>> {
        Ok(self.oplog.operations_for(oid))
    }

    fn delete_operations(&self, keys: &[(Oid, Timestamp)]) -> ServerResult<usize> {
        Ok(self.oplog.remove(keys))
    }

    fn baselines_after(&self, order: ServerOrder) -> ServerResult<Vec<StoredBaseline>> {
        Ok(self.oplog.baselines_after(order))
    }

    fn baseline(&self, oid: &Oid) -> ServerResult<Option<StoredBaseline>> {
        Ok(self.oplog.baseline(oid))
    }

    fn put_baseline(&self, baseline: DocumentBaseline, order: ServerOrder) -> ServerResult<()> {
        self.oplog.put_baseline(baseline, order);
        Ok(())
    }

    fn replica(&self, id: &str) -> ServerResult<Option<ReplicaInfo>> {
        Ok(self.replicas.read().get(id).cloned())
    }

    fn put_replica(&self, replica: ReplicaInfo) -> ServerResult<()> {
        self.replicas.write().insert(replica.id.clone(), replica);
        Ok(())
    }

    fn delete_replica(&self, id: &str) -> ServerResult<bool> {
        Ok(self.replicas.write().remove(id).is_some())
    }

    fn replicas(&self) -> ServerResult<Vec<ReplicaInfo>> {
        Ok(self.replicas.read().values().cloned().collect())
    }

    fn put_file(&self, file: FileMetadata) -> ServerResult<()> {
        self.files.write().insert(file.id.clone(), file);
        Ok(())
    }

    fn file(&self, id: &str) -> ServerResult<Option<FileMetadata>> {
        Ok(self.files.read().get(id).cloned())
    }

    fn mark_file_pending_delete(&self, id: &str) -> ServerResult<bool> {
        match self.files.write().get_mut(id) {
            Some(file) => {
                file.pending_delete = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn pending_delete_files(&self) -> ServerResult<Vec<FileMetadata>> {
        Ok(self
            .files
            .read()
            .values()
            .filter(|file| file.pending_delete)
            .cloned()
            .collect())
    }

    fn delete_file(&self, id: &str) -> ServerResult<()> {
        self.files.write().remove(id);
        Ok(())
    }
}
