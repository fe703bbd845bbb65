//! Patch application and undo.
//!
//! Operations are replayed against per-object views. Every operation whose
//! target no longer exists (missing field, index out of range, wrong shape)
//! is a silent no-op so that concurrently produced patches stay applicable.

use crate::oid::Oid;
use crate::operation::{InsertItems, Operation, OperationData, Ref, RemoveOnly};
use crate::timestamp::Timestamp;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};

/// Views of many objects, keyed by identifier.
pub type ViewMap = BTreeMap<Oid, JsonValue>;

/// Applies one operation to a view.
///
/// Returns the next view, or `None` once the object is deleted. References
/// detached by the operation are appended to `detached` when given.
pub fn apply_patch(
    base: Option<JsonValue>,
    data: &OperationData,
    detached: Option<&mut Vec<Ref>>,
) -> Option<JsonValue> {
    let mut sink = Vec::new();
    let next = apply_inner(base, data, &mut sink);
    if let Some(detached) = detached {
        detached.extend(sink);
    }
    next
}

fn apply_inner(
    base: Option<JsonValue>,
    data: &OperationData,
    sink: &mut Vec<Ref>,
) -> Option<JsonValue> {
    match data {
        OperationData::Initialize { value } => return Some(value.clone()),
        OperationData::Delete => {
            if let Some(view) = &base {
                collect_refs(view, sink);
            }
            return None;
        }
        _ => {}
    }

    let mut view = base?;
    match (data, &mut view) {
        (OperationData::Set { name, value }, JsonValue::Object(fields)) => {
            if let Some(old) = fields.insert(name.clone(), value.clone()) {
                if &old != value {
                    push_ref(&old, sink);
                }
            }
        }
        (OperationData::Remove { name }, JsonValue::Object(fields)) => {
            if let Some(old) = fields.remove(name) {
                push_ref(&old, sink);
            }
        }
        (OperationData::ListPush { value }, JsonValue::Array(items)) => {
            items.push(value.clone());
        }
        (OperationData::ListInsert { index, items: inserted }, JsonValue::Array(items)) => {
            let at = (*index).min(items.len());
            items.splice(at..at, inserted.to_vec());
        }
        (OperationData::ListSet { index, value }, JsonValue::Array(items)) => {
            if let Some(slot) = items.get_mut(*index) {
                let old = std::mem::replace(slot, value.clone());
                if &old != value {
                    push_ref(&old, sink);
                }
            }
        }
        (OperationData::ListDelete { index, count }, JsonValue::Array(items)) => {
            if *index < items.len() {
                let end = index.saturating_add(*count).min(items.len());
                for old in items.drain(*index..end) {
                    push_ref(&old, sink);
                }
            }
        }
        (OperationData::ListAdd { value }, JsonValue::Array(items)) => {
            if !items.contains(value) {
                items.push(value.clone());
            }
        }
        (OperationData::ListRemove { value, only }, JsonValue::Array(items)) => {
            let position = match only {
                None => {
                    let before = items.len();
                    items.retain(|item| item != value);
                    if items.len() != before {
                        push_ref(value, sink);
                    }
                    None
                }
                Some(RemoveOnly::First) => items.iter().position(|item| item == value),
                Some(RemoveOnly::Last) => items.iter().rposition(|item| item == value),
            };
            if let Some(position) = position {
                let old = items.remove(position);
                push_ref(&old, sink);
            }
        }
        (OperationData::ListMoveByIndex { from, to }, JsonValue::Array(items)) => {
            if *from < items.len() {
                let item = items.remove(*from);
                let to = (*to).min(items.len());
                items.insert(to, item);
            }
        }
        (OperationData::ListMoveByRef { value, index }, JsonValue::Array(items)) => {
            if let Some(position) = items.iter().position(|item| item == value) {
                let item = items.remove(position);
                let to = (*index).min(items.len());
                items.insert(to, item);
            }
        }
        _ => {}
    }
    Some(view)
}

fn push_ref(value: &JsonValue, sink: &mut Vec<Ref>) {
    if let Some(reference) = Ref::from_json(value) {
        sink.push(reference);
    }
}

/// Collects the references held directly by a view (not recursively).
pub fn collect_refs(view: &JsonValue, sink: &mut Vec<Ref>) {
    match view {
        JsonValue::Object(fields) => fields.values().for_each(|value| push_ref(value, sink)),
        JsonValue::Array(items) => items.iter().for_each(|value| push_ref(value, sink)),
        _ => {}
    }
}

/// Replays operations for a single object in order.
pub fn apply_operations(base: Option<JsonValue>, operations: &[Operation]) -> Option<JsonValue> {
    operations
        .iter()
        .fold(base, |view, op| apply_patch(view, &op.data, None))
}

/// Applies operations to a set of views in the given order.
///
/// Operations touching the same object must already be in ascending
/// timestamp order.
pub fn apply_to_views(views: &mut ViewMap, operations: &[Operation]) {
    for op in operations {
        let base = views.remove(&op.oid);
        if let Some(next) = apply_patch(base, &op.data, None) {
            views.insert(op.oid.clone(), next);
        }
    }
}

/// Computes operations that revert `operations` when applied after them.
///
/// `views` is the state before `operations` ran. Each operation is inverted
/// against the view it actually saw, and the inverses come back in reverse
/// order with fresh timestamps from `clock`.
pub fn undo_operations(
    views: &ViewMap,
    operations: &[Operation],
    clock: &mut dyn FnMut() -> Timestamp,
) -> Vec<Operation> {
    let mut touched: HashMap<Oid, Option<JsonValue>> = HashMap::new();
    let mut batches = Vec::with_capacity(operations.len());
    for op in operations {
        let prior = match touched.get(&op.oid) {
            Some(view) => view.clone(),
            None => views.get(&op.oid).cloned(),
        };
        batches.push((op.oid.clone(), invert(prior.as_ref(), &op.data)));
        let next = apply_patch(prior, &op.data, None);
        touched.insert(op.oid.clone(), next);
    }

    let mut undo = Vec::new();
    for (oid, inverses) in batches.into_iter().rev() {
        for data in inverses {
            undo.push(Operation::new(oid.clone(), clock(), data));
        }
    }
    undo
}

/// Inverts one operation against the view it is applied to.
fn invert(prior: Option<&JsonValue>, data: &OperationData) -> Vec<OperationData> {
    match (data, prior) {
        (OperationData::Initialize { .. }, Some(view)) | (OperationData::Delete, Some(view)) => {
            vec![OperationData::Initialize {
                value: view.clone(),
            }]
        }
        (OperationData::Initialize { .. }, None) => vec![OperationData::Delete],
        (OperationData::Set { name, .. }, Some(JsonValue::Object(fields))) => {
            match fields.get(name) {
                Some(old) => vec![OperationData::Set {
                    name: name.clone(),
                    value: old.clone(),
                }],
                None => vec![OperationData::Remove { name: name.clone() }],
            }
        }
        (OperationData::Remove { name }, Some(JsonValue::Object(fields))) => fields
            .get(name)
            .map(|old| OperationData::Set {
                name: name.clone(),
                value: old.clone(),
            })
            .into_iter()
            .collect(),
        (OperationData::ListPush { .. }, Some(JsonValue::Array(items))) => {
            vec![OperationData::ListDelete {
                index: items.len(),
                count: 1,
            }]
        }
        (OperationData::ListInsert { index, items: inserted }, Some(JsonValue::Array(items)))
            if !inserted.is_empty() =>
        {
            vec![OperationData::ListDelete {
                index: (*index).min(items.len()),
                count: inserted.len(),
            }]
        }
        (OperationData::ListSet { index, .. }, Some(JsonValue::Array(items))) => items
            .get(*index)
            .map(|old| OperationData::ListSet {
                index: *index,
                value: old.clone(),
            })
            .into_iter()
            .collect(),
        (OperationData::ListDelete { index, count }, Some(JsonValue::Array(items)))
            if *index < items.len() && *count > 0 =>
        {
            let end = index.saturating_add(*count).min(items.len());
            vec![OperationData::ListInsert {
                index: *index,
                items: InsertItems::from_vec(items[*index..end].to_vec()),
            }]
        }
        (OperationData::ListAdd { value }, Some(JsonValue::Array(items)))
            if !items.contains(value) =>
        {
            vec![OperationData::ListDelete {
                index: items.len(),
                count: 1,
            }]
        }
        (OperationData::ListRemove { value, only }, Some(JsonValue::Array(items))) => {
            let matches = items
                .iter()
                .enumerate()
                .filter(|(_, item)| *item == value)
                .map(|(position, _)| position);
            let positions: Vec<usize> = match only {
                None => matches.collect(),
                Some(RemoveOnly::First) => matches.take(1).collect(),
                Some(RemoveOnly::Last) => matches.last().into_iter().collect(),
            };
            positions
                .into_iter()
                .map(|position| OperationData::ListInsert {
                    index: position,
                    items: InsertItems::One {
                        value: value.clone(),
                    },
                })
                .collect()
        }
        (OperationData::ListMoveByIndex { from, to }, Some(JsonValue::Array(items)))
            if *from < items.len() =>
        {
            vec![OperationData::ListMoveByIndex {
                from: (*to).min(items.len() - 1),
                to: *from,
            }]
        }
        (OperationData::ListMoveByRef { value, .. }, Some(JsonValue::Array(items))) => items
            .iter()
            .position(|item| item == value)
            .map(|position| OperationData::ListMoveByRef {
                value: value.clone(),
                index: position,
            })
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}
