//! Server-side operation and baseline log.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use tidepool_core::{DocumentBaseline, Oid, Operation, Timestamp};
use tidepool_sync_protocol::{AckNonce, ServerOrder};

/// An operation as stored by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredOperation {
    /// The operation as sent by its replica.
    pub operation: Operation,
    /// Position in the library's server log.
    pub server_order: ServerOrder,
    /// Replica that wrote the operation.
    pub replica_id: String,
}

/// A baseline as stored by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBaseline {
    /// The baseline.
    pub baseline: DocumentBaseline,
    /// Server order at which the baseline became visible.
    pub server_order: ServerOrder,
}

/// Server-side operation log.
///
/// The server oplog maintains:
/// - All operations in server order, deduplicated by `(oid, timestamp)`
/// - One baseline per object
/// - The next server order, shared by operations and baselines
pub struct ServerOplog {
    /// Operations in server order.
    operations: RwLock<Vec<StoredOperation>>,
    /// Keys of stored operations.
    keys: RwLock<HashSet<(Oid, Timestamp)>>,
    /// Baselines by object.
    baselines: RwLock<BTreeMap<Oid, StoredBaseline>>,
    /// Next server order to hand out.
    next_order: RwLock<ServerOrder>,
}

impl ServerOplog {
    /// Creates a new empty oplog.
    pub fn new() -> Self {
        Self {
            operations: RwLock::new(Vec::new()),
            keys: RwLock::new(HashSet::new()),
            baselines: RwLock::new(BTreeMap::new()),
            next_order: RwLock::new(1),
        }
    }

    /// Returns the highest server order handed out, or 0.
    pub fn latest_server_order(&self) -> ServerOrder {
        *self.next_order.read() - 1
    }

    /// Appends operations written by `replica_id`.
    ///
    /// Operations already stored are skipped. Returns the server orders
    /// assigned to the new ones, if any.
    pub fn append(&self, replica_id: &str, operations: &[Operation]) -> Option<AckNonce> {
        let mut keys = self.keys.write();
        let mut stored = self.operations.write();
        let mut next = self.next_order.write();
        let first = *next;
        for op in operations {
            if !keys.insert((op.oid.clone(), op.timestamp.clone())) {
                continue;
            }
            stored.push(StoredOperation {
                operation: op.clone(),
                server_order: *next,
                replica_id: replica_id.to_string(),
            });
            *next += 1;
        }
        (*next > first).then(|| AckNonce::new(first, *next - 1))
    }

    /// Stores baselines that are newer than the ones on record.
    pub fn append_baselines(&self, baselines: &[DocumentBaseline]) -> Option<AckNonce> {
        let mut stored = self.baselines.write();
        let mut next = self.next_order.write();
        let first = *next;
        for baseline in baselines {
            let newer = stored
                .get(&baseline.oid)
                .map_or(true, |current| current.baseline.timestamp < baseline.timestamp);
            if newer {
                stored.insert(
                    baseline.oid.clone(),
                    StoredBaseline {
                        baseline: baseline.clone(),
                        server_order: *next,
                    },
                );
                *next += 1;
            }
        }
        (*next > first).then(|| AckNonce::new(first, *next - 1))
    }

    /// Replaces the baseline of an object, keeping `server_order`.
    pub fn put_baseline(&self, baseline: DocumentBaseline, server_order: ServerOrder) {
        self.baselines.write().insert(
            baseline.oid.clone(),
            StoredBaseline {
                baseline,
                server_order,
            },
        );
    }

    /// Returns the baseline of an object.
    pub fn baseline(&self, oid: &Oid) -> Option<StoredBaseline> {
        self.baselines.read().get(oid).cloned()
    }

    /// Returns operations after a server order, optionally skipping one writer.
    pub fn operations_after(
        &self,
        order: ServerOrder,
        exclude_replica: Option<&str>,
    ) -> Vec<StoredOperation> {
        self.operations
            .read()
            .iter()
            .filter(|op| op.server_order > order)
            .filter(|op| exclude_replica != Some(op.replica_id.as_str()))
            .cloned()
            .collect()
    }

    /// Returns operations at or before a server order.
    pub fn operations_up_to(&self, order: ServerOrder) -> Vec<StoredOperation> {
        self.operations
            .read()
            .iter()
            .take_while(|op| op.server_order <= order)
            .cloned()
            .collect()
    }

    /// Returns every operation targeting `oid`.
    pub fn operations_for(&self, oid: &Oid) -> Vec<StoredOperation> {
        self.operations
            .read()
            .iter()
            .filter(|op| op.operation.oid == *oid)
            .cloned()
            .collect()
    }

    /// Returns baselines that became visible after a server order.
    pub fn baselines_after(&self, order: ServerOrder) -> Vec<StoredBaseline> {
        self.baselines
            .read()
            .values()
            .filter(|b| b.server_order > order)
            .cloned()
            .collect()
    }

    /// Removes operations by key. Returns how many were removed.
    pub fn remove(&self, keys: &[(Oid, Timestamp)]) -> usize {
        let doomed: HashSet<&(Oid, Timestamp)> = keys.iter().collect();
        let mut index = self.keys.write();
        let mut stored = self.operations.write();
        let before = stored.len();
        stored.retain(|op| {
            let key = (op.operation.oid.clone(), op.operation.timestamp.clone());
            if doomed.contains(&key) {
                index.remove(&key);
                false
            } else {
                true
            }
        });
        before - stored.len()
    }

    /// Returns the number of operations.
    pub fn len(&self) -> usize {
        self.operations.read().len()
    }

    /// Returns true if the log holds neither operations nor baselines.
    pub fn is_empty(&self) -> bool {
        self.operations.read().is_empty() && self.baselines.read().is_empty()
    }
}

impl Default for ServerOplog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidepool_core::OperationData;

    fn make_op(doc: &str, n: u64) -> Operation {
        Operation::new(
            Oid::new("posts", doc),
            Timestamp::new(0, n, 0, "r1"),
            OperationData::Set {
                name: "n".into(),
                value: json!(n),
            },
        )
    }

    #[test]
    fn empty_oplog() {
        let oplog = ServerOplog::new();
        assert_eq!(oplog.latest_server_order(), 0);
        assert!(oplog.is_empty());
        assert!(oplog.operations_after(0, None).is_empty());
    }

    #[test]
    fn append_assigns_orders() {
        let oplog = ServerOplog::new();
        let range = oplog.append("r1", &[make_op("a", 1), make_op("b", 2)]);
        assert_eq!(range, Some(AckNonce::new(1, 2)));
        assert_eq!(oplog.latest_server_order(), 2);
        assert_eq!(oplog.len(), 2);
    }

    #[test]
    fn duplicates_are_skipped() {
        let oplog = ServerOplog::new();
        oplog.append("r1", &[make_op("a", 1)]);
        assert_eq!(oplog.append("r1", &[make_op("a", 1)]), None);
        let range = oplog.append("r2", &[make_op("a", 1), make_op("a", 2)]);
        assert_eq!(range, Some(AckNonce::single(2)));
    }

    #[test]
    fn operations_since_order() {
        let oplog = ServerOplog::new();
        oplog.append("r1", &[make_op("a", 1), make_op("a", 2)]);
        oplog.append("r2", &[make_op("b", 3)]);

        assert_eq!(oplog.operations_after(0, None).len(), 3);
        assert_eq!(oplog.operations_after(2, None).len(), 1);
        assert_eq!(oplog.operations_after(0, Some("r1")).len(), 1);
        assert_eq!(oplog.operations_up_to(2).len(), 2);
        assert_eq!(oplog.operations_for(&Oid::new("posts", "a")).len(), 2);
    }

    #[test]
    fn remove_by_key() {
        let oplog = ServerOplog::new();
        let op = make_op("a", 1);
        oplog.append("r1", &[op.clone(), make_op("a", 2)]);
        assert_eq!(oplog.remove(&[(op.oid.clone(), op.timestamp.clone())]), 1);
        assert_eq!(oplog.len(), 1);
        // A removed key may be stored again.
        assert!(oplog.append("r1", &[op]).is_some());
    }

    #[test]
    fn baselines_keep_newest() {
        let oplog = ServerOplog::new();
        let oid = Oid::new("posts", "a");
        let baseline = |n: u64| DocumentBaseline {
            oid: oid.clone(),
            snapshot: json!({"n": n}),
            timestamp: Timestamp::new(0, n, 0, "r1"),
            authz: None,
        };
        assert!(oplog.append_baselines(&[baseline(5)]).is_some());
        assert!(oplog.append_baselines(&[baseline(3)]).is_none());
        assert_eq!(oplog.baselines_after(0).len(), 1);
        assert!(oplog.baselines_after(1).is_empty());

        oplog.put_baseline(baseline(9), 1);
        let stored = oplog.baseline(&oid).unwrap();
        assert_eq!(stored.baseline.snapshot, json!({"n": 9}));
        assert_eq!(stored.server_order, 1);
    }
}
