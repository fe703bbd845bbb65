//! Local replica storage.
//!
//! Keeps the baseline and operation log of every object plus the current
//! view of each, rebuilt from baseline and operations whenever operations
//! arrive out of order.

use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tidepool_core::{
    apply_operations, apply_to_views, fold_into, CoreError, DocTree, DocumentBaseline, Oid,
    Operation, RebaseSummary, Timestamp, ViewMap,
};
use tracing::{debug, warn};

/// In-memory state of one replica.
#[derive(Debug, Default)]
pub struct LocalStore {
    baselines: BTreeMap<Oid, DocumentBaseline>,
    operations: Vec<Operation>,
    keys: HashSet<(Oid, Timestamp)>,
    latest: HashMap<Oid, Timestamp>,
    views: ViewMap,
    stale: BTreeSet<Oid>,
}

impl LocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current view of one object.
    pub fn view(&self, oid: &Oid) -> Option<&JsonValue> {
        self.views.get(oid)
    }

    /// Current views of every object.
    pub fn views(&self) -> &ViewMap {
        &self.views
    }

    /// Baselines by object.
    pub fn baselines(&self) -> &BTreeMap<Oid, DocumentBaseline> {
        &self.baselines
    }

    /// Operations not yet folded, in timestamp order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Roots of every live document.
    pub fn documents(&self) -> Vec<Oid> {
        self.views.keys().filter(|oid| oid.is_root()).cloned().collect()
    }

    /// Documents that could not be materialized.
    pub fn stale_documents(&self) -> Vec<Oid> {
        self.stale.iter().cloned().collect()
    }

    /// Assembles a document.
    ///
    /// A document whose views do not form a valid tree is logged, marked
    /// stale and reported as absent.
    pub fn document(&mut self, root: &Oid) -> Option<DocTree> {
        match DocTree::from_views(root, &self.views) {
            Ok(tree) => tree,
            Err(e) => {
                warn!(oid = %root, error = %e, "document cannot be assembled");
                self.stale.insert(root.clone());
                None
            }
        }
    }

    /// Stores operations. Returns how many were new.
    ///
    /// Operations newer than everything known for their object are applied
    /// directly; others trigger a rebuild of the object's view.
    pub fn insert(&mut self, operations: &[Operation]) -> usize {
        let mut dirty = BTreeSet::new();
        let mut added = 0;
        for op in operations {
            let covered = self
                .baselines
                .get(&op.oid)
                .is_some_and(|baseline| op.timestamp <= baseline.timestamp);
            if covered || !self.keys.insert((op.oid.clone(), op.timestamp.clone())) {
                continue;
            }
            added += 1;
            let in_order = self
                .latest
                .get(&op.oid)
                .map_or(true, |latest| op.timestamp > *latest);
            if in_order && !dirty.contains(&op.oid) {
                apply_to_views(&mut self.views, std::slice::from_ref(op));
                self.check_view(&op.oid);
            } else {
                dirty.insert(op.oid.clone());
            }
            if in_order {
                self.latest.insert(op.oid.clone(), op.timestamp.clone());
            }
            self.operations.push(op.clone());
        }
        if added > 0 {
            self.operations
                .sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        }
        for oid in dirty {
            debug!(oid = %oid, "rebuilding view after out-of-order operation");
            self.materialize(&oid);
        }
        added
    }

    /// Stores baselines newer than the ones held. Returns how many were taken.
    pub fn apply_baselines(&mut self, baselines: &[DocumentBaseline]) -> usize {
        let mut taken = 0;
        for baseline in baselines {
            let newer = self
                .baselines
                .get(&baseline.oid)
                .map_or(true, |current| current.timestamp < baseline.timestamp);
            if !newer {
                continue;
            }
            let oid = baseline.oid.clone();
            let covered = baseline.timestamp.clone();
            self.operations
                .retain(|op| op.oid != oid || op.timestamp > covered);
            self.keys
                .retain(|(key_oid, ts)| *key_oid != oid || *ts > covered);
            let latest = self.latest.entry(oid.clone()).or_insert_with(|| covered.clone());
            if *latest < covered {
                *latest = covered;
            }
            self.baselines.insert(oid.clone(), baseline.clone());
            self.materialize(&oid);
            taken += 1;
        }
        taken
    }

    /// Folds operations older than `global_ack` into baselines.
    pub fn fold(&mut self, global_ack: &Timestamp) -> RebaseSummary {
        let summary = fold_into(&mut self.baselines, &mut self.operations, global_ack);
        if summary.folded > 0 {
            self.keys = self
                .operations
                .iter()
                .map(|op| (op.oid.clone(), op.timestamp.clone()))
                .collect();
            debug!(folded = summary.folded, objects = summary.objects, "folded local log");
        }
        summary
    }

    /// Forgets everything.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Rebuilds the view of one object from its baseline and operations.
    fn materialize(&mut self, oid: &Oid) {
        let baseline = self.baselines.get(oid);
        let covered = baseline.map(|b| b.timestamp.clone());
        let base = baseline.and_then(|b| b.view().cloned());
        let operations: Vec<Operation> = self
            .operations
            .iter()
            .filter(|op| op.oid == *oid)
            .filter(|op| covered.as_ref().map_or(true, |ts| op.timestamp > *ts))
            .cloned()
            .collect();

        match apply_operations(base, &operations) {
            Some(view) => {
                self.views.insert(oid.clone(), view);
                self.check_view(oid);
            }
            None => {
                self.views.remove(oid);
            }
        }
    }

    /// Drops a view that is not an object or list and marks its document stale.
    fn check_view(&mut self, oid: &Oid) {
        let Some(view) = self.views.get(oid) else {
            return;
        };
        if view.is_object() || view.is_array() {
            self.stale.remove(&oid.root());
            return;
        }
        let e = CoreError::invalid_snapshot(oid, "view is not a container");
        warn!(oid = %oid, error = %e, "skipping unreadable object");
        self.views.remove(oid);
        self.stale.insert(oid.root());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidepool_core::{OperationData, Ref};

    fn oid() -> Oid {
        Oid::new("notes", "n1")
    }

    fn ts(n: u64) -> Timestamp {
        Timestamp::new(0, n, 0, "r")
    }

    fn init(n: u64, value: JsonValue) -> Operation {
        Operation::new(oid(), ts(n), OperationData::Initialize { value })
    }

    fn set(n: u64, name: &str, value: JsonValue) -> Operation {
        Operation::new(
            oid(),
            ts(n),
            OperationData::Set {
                name: name.into(),
                value,
            },
        )
    }

    #[test]
    fn applies_in_order_operations() {
        let mut store = LocalStore::new();
        assert_eq!(store.insert(&[init(1, json!({})), set(2, "a", json!(1))]), 2);
        assert_eq!(store.view(&oid()), Some(&json!({"a": 1})));
        assert_eq!(store.insert(&[set(2, "a", json!(1))]), 0);
        assert_eq!(store.documents(), vec![oid()]);
    }

    #[test]
    fn late_operation_rebuilds_view() {
        let mut store = LocalStore::new();
        store.insert(&[init(1, json!({})), set(5, "a", json!("late"))]);
        store.insert(&[set(3, "a", json!("early"))]);
        assert_eq!(store.view(&oid()), Some(&json!({"a": "late"})));
        assert_eq!(store.operations()[1].timestamp, ts(3));
    }

    #[test]
    fn baselines_cover_older_operations() {
        let mut store = LocalStore::new();
        store.insert(&[init(1, json!({})), set(2, "a", json!(1)), set(6, "b", json!(2))]);
        let baseline = DocumentBaseline {
            oid: oid(),
            snapshot: json!({"a": 9}),
            timestamp: ts(4),
            authz: None,
        };
        assert_eq!(store.apply_baselines(&[baseline.clone()]), 1);
        assert_eq!(store.apply_baselines(&[baseline]), 0);
        assert_eq!(store.operations().len(), 1);
        assert_eq!(store.view(&oid()), Some(&json!({"a": 9, "b": 2})));
    }

    #[test]
    fn fold_keeps_views() {
        let mut store = LocalStore::new();
        store.insert(&[init(1, json!({})), set(2, "a", json!(1)), set(6, "b", json!(2))]);
        let summary = store.fold(&ts(5));
        assert_eq!(summary.folded, 2);
        assert_eq!(store.operations().len(), 1);
        assert_eq!(store.baselines()[&oid()].snapshot, json!({"a": 1}));
        assert_eq!(store.view(&oid()), Some(&json!({"a": 1, "b": 2})));
        // Folded keys may not come back.
        store.insert(&[set(2, "a", json!(1))]);
        assert_eq!(store.view(&oid()), Some(&json!({"a": 1, "b": 2})));
    }

    #[test]
    fn unreadable_document_is_stale() {
        let mut store = LocalStore::new();
        store.insert(&[init(1, json!({})), init(3, json!("oops"))]);
        assert!(store.view(&oid()).is_none());
        // Arrives out of order, so the view is rebuilt and found unreadable.
        store.insert(&[set(2, "a", json!(1))]);
        assert_eq!(store.stale_documents(), vec![oid()]);
        store.insert(&[init(4, json!({"ok": true}))]);
        assert_eq!(store.view(&oid()), Some(&json!({"ok": true})));
    }

    #[test]
    fn cyclic_document_is_stale() {
        let mut store = LocalStore::new();
        let child = oid().with_sub_id("c");
        let child_ref = Ref::Object(child.clone()).to_json();
        let root_ref = Ref::Object(oid()).to_json();
        store.insert(&[
            init(1, json!({"child": child_ref})),
            Operation::new(child.clone(), ts(2), OperationData::Initialize {
                value: json!({"back": root_ref}),
            }),
        ]);
        assert!(store.document(&oid()).is_none());
        assert_eq!(store.stale_documents(), vec![oid()]);
    }

    #[test]
    fn delete_removes_view() {
        let mut store = LocalStore::new();
        store.insert(&[init(1, json!({})), Operation::new(oid(), ts(2), OperationData::Delete)]);
        assert!(store.view(&oid()).is_none());
        assert!(store.documents().is_empty());
    }
}
