//! Rebase compaction.
//!
//! Folding replays the acknowledged prefix of an object's history into its
//! baseline so the operations can be dropped. Only operations strictly
//! older than the global acknowledgement take part, and the first operation
//! at or after it stops the fold for that object: nothing later is folded
//! even if it would sort before a missing peer's operations.

use crate::oid::Oid;
use crate::operation::{DocumentBaseline, Operation, Ref};
use crate::patch::{apply_patch, collect_refs};
use crate::timestamp::Timestamp;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};

/// Result of folding one object.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldOutcome {
    /// The new baseline, or `None` if nothing was folded and no baseline existed.
    pub baseline: Option<DocumentBaseline>,
    /// Number of leading operations consumed (including ones already
    /// covered by the previous baseline).
    pub folded: usize,
    /// True if an operation at or after the global acknowledgement was hit.
    pub hard_stopped: bool,
    /// References detached by the folded operations and not present in the
    /// resulting view.
    pub detached: Vec<Ref>,
}

/// Folds the acknowledged prefix of `operations` into `baseline`.
///
/// `operations` must target `oid` and be sorted by ascending timestamp.
pub fn fold_operations(
    oid: &Oid,
    baseline: Option<&DocumentBaseline>,
    operations: &[Operation],
    global_ack: &Timestamp,
) -> FoldOutcome {
    let mut view = baseline.and_then(|b| b.view().cloned());
    let mut timestamp = baseline.map(|b| b.timestamp.clone());
    let mut authz = baseline.and_then(|b| b.authz.clone());
    let mut detached = Vec::new();
    let mut folded = 0;
    let mut hard_stopped = false;

    for op in operations {
        if op.timestamp >= *global_ack {
            hard_stopped = true;
            break;
        }
        folded += 1;
        if baseline.is_some_and(|b| op.timestamp <= b.timestamp) {
            continue;
        }
        view = apply_patch(view, &op.data, Some(&mut detached));
        timestamp = Some(op.timestamp.clone());
        if op.authz.is_some() {
            authz = op.authz.clone();
        }
    }

    let baseline = match timestamp {
        Some(timestamp) if folded > 0 || baseline.is_some() => Some(DocumentBaseline {
            oid: oid.clone(),
            snapshot: view.clone().unwrap_or(JsonValue::Null),
            timestamp,
            authz,
        }),
        _ => None,
    };

    let mut still_held = Vec::new();
    if let Some(view) = &view {
        collect_refs(view, &mut still_held);
    }
    let still_held: HashSet<Ref> = still_held.into_iter().collect();
    let mut seen = HashSet::new();
    detached.retain(|r| !still_held.contains(r) && seen.insert(r.clone()));

    FoldOutcome {
        baseline,
        folded,
        hard_stopped,
        detached,
    }
}

/// Groups operations by object, each group sorted by timestamp.
pub fn group_by_oid(operations: impl IntoIterator<Item = Operation>) -> BTreeMap<Oid, Vec<Operation>> {
    let mut groups: BTreeMap<Oid, Vec<Operation>> = BTreeMap::new();
    for op in operations {
        groups.entry(op.oid.clone()).or_default().push(op);
    }
    for ops in groups.values_mut() {
        ops.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }
    groups
}

/// Totals of a [`fold_into`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebaseSummary {
    /// Objects whose baseline changed.
    pub objects: usize,
    /// Operations removed from the log.
    pub folded: usize,
    /// Objects whose fold stopped at the global acknowledgement.
    pub hard_stopped: usize,
    /// References detached by folded operations.
    pub detached: Vec<Ref>,
}

/// Folds a local operation log into its baselines in place.
///
/// Used by replicas: every object is folded up to `global_ack` and the
/// consumed operations are removed from `operations`.
pub fn fold_into(
    baselines: &mut BTreeMap<Oid, DocumentBaseline>,
    operations: &mut Vec<Operation>,
    global_ack: &Timestamp,
) -> RebaseSummary {
    let mut summary = RebaseSummary::default();
    let groups = group_by_oid(std::mem::take(operations));
    for (oid, ops) in groups {
        let outcome = fold_operations(&oid, baselines.get(&oid), &ops, global_ack);
        if outcome.hard_stopped {
            summary.hard_stopped += 1;
        }
        if outcome.folded > 0 {
            summary.objects += 1;
            summary.folded += outcome.folded;
            if let Some(baseline) = outcome.baseline {
                baselines.insert(oid.clone(), baseline);
            }
            summary.detached.extend(outcome.detached);
        }
        operations.extend(ops.into_iter().skip(outcome.folded));
    }
    operations.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationData;
    use serde_json::json;

    fn oid() -> Oid {
        Oid::new("posts", "a")
    }

    fn ts(n: u64) -> Timestamp {
        Timestamp::new(0, n, 0, "r")
    }

    fn op(n: u64, data: OperationData) -> Operation {
        Operation::new(oid(), ts(n), data)
    }

    fn set(n: u64, name: &str, value: JsonValue) -> Operation {
        op(
            n,
            OperationData::Set {
                name: name.into(),
                value,
            },
        )
    }

    #[test]
    fn folds_acknowledged_prefix() {
        let ops = vec![
            op(1, OperationData::Initialize { value: json!({}) }),
            set(2, "a", json!(1)),
            set(5, "b", json!(2)),
        ];
        let outcome = fold_operations(&oid(), None, &ops, &ts(3));
        assert_eq!(outcome.folded, 2);
        assert!(outcome.hard_stopped);
        let baseline = outcome.baseline.unwrap();
        assert_eq!(baseline.snapshot, json!({"a": 1}));
        assert_eq!(baseline.timestamp, ts(2));
    }

    #[test]
    fn nothing_to_fold() {
        let ops = vec![set(5, "a", json!(1))];
        let outcome = fold_operations(&oid(), None, &ops, &ts(3));
        assert_eq!(outcome.folded, 0);
        assert!(outcome.baseline.is_none());
    }

    #[test]
    fn skips_operations_covered_by_baseline() {
        let baseline = DocumentBaseline {
            oid: oid(),
            snapshot: json!({"a": 2}),
            timestamp: ts(4),
            authz: None,
        };
        let ops = vec![set(3, "a", json!(1)), set(6, "b", json!(true))];
        let outcome = fold_operations(&oid(), Some(&baseline), &ops, &ts(10));
        assert_eq!(outcome.folded, 2);
        let folded = outcome.baseline.unwrap();
        assert_eq!(folded.snapshot, json!({"a": 2, "b": true}));
        assert_eq!(folded.timestamp, ts(6));
    }

    #[test]
    fn delete_yields_null_snapshot() {
        let ops = vec![
            op(1, OperationData::Initialize { value: json!({"f": {"@@type": "file", "id": "x"}}) }),
            op(2, OperationData::Delete),
        ];
        let outcome = fold_operations(&oid(), None, &ops, &ts(9));
        let baseline = outcome.baseline.unwrap();
        assert!(baseline.view().is_none());
        assert_eq!(outcome.detached, vec![Ref::File("x".into())]);
    }

    #[test]
    fn refs_still_in_view_are_not_detached() {
        let file = json!({"@@type": "file", "id": "x"});
        let ops = vec![
            op(1, OperationData::Initialize { value: json!({"a": file.clone()}) }),
            op(2, OperationData::Remove { name: "a".into() }),
            set(3, "b", file),
        ];
        let outcome = fold_operations(&oid(), None, &ops, &ts(9));
        assert!(outcome.detached.is_empty());
    }

    #[test]
    fn hard_stop_is_per_object() {
        let other = Oid::new("posts", "b");
        let mut operations = vec![
            set(1, "a", json!(1)),
            set(4, "a", json!(2)),
            Operation::new(other.clone(), ts(2), OperationData::Initialize { value: json!([]) }),
            Operation::new(other.clone(), ts(3), OperationData::ListPush { value: json!(1) }),
        ];
        let mut baselines = BTreeMap::new();
        baselines.insert(
            oid(),
            DocumentBaseline {
                oid: oid(),
                snapshot: json!({}),
                timestamp: ts(0),
                authz: None,
            },
        );
        let summary = fold_into(&mut baselines, &mut operations, &ts(4));
        assert_eq!(summary.folded, 3);
        assert_eq!(summary.hard_stopped, 1);
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].timestamp, ts(4));
        assert_eq!(baselines[&other].snapshot, json!([1]));
        assert_eq!(baselines[&oid()].snapshot, json!({"a": 1}));
    }

    #[test]
    fn group_by_oid_sorts() {
        let groups = group_by_oid(vec![set(3, "a", json!(1)), set(1, "a", json!(0))]);
        let ops = &groups[&oid()];
        assert_eq!(ops[0].timestamp, ts(1));
    }
}
