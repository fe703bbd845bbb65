//! Snapshot diffing.
//!
//! [`diff_to_patches`] compares two trees of the same document and emits the
//! operations that turn the views of the first into the views of the
//! second. Identity, not structure, decides whether a nested node is edited
//! in place or replaced: nodes are matched by [`Oid`], and a node of the
//! target tree without one is either merged into its predecessor or given a
//! fresh sub-identifier and initialized from scratch.
//!
//! Ordering guarantees of the output:
//! - an `initialize` always precedes the operation attaching its reference;
//! - children are initialized before their parents;
//! - `delete` operations for detached nodes come last;
//! - timestamps are drawn from the clock in emission order.

use crate::error::{CoreError, CoreResult};
use crate::oid::{Oid, SubIdSource};
use crate::operation::{InsertItems, Operation, OperationData, Ref, RemoveOnly};
use crate::timestamp::Timestamp;
use crate::tree::{fresh_oid, DocTree, NodeId, NodeKind, Value};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Options controlling how nested nodes are matched.
#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// Treat keys missing from the target as unchanged instead of removed.
    pub default_undefined: bool,
    /// Merge an unidentified target object into the node it replaces.
    pub merge_unknown_objects: bool,
    /// Always replace nested objects of object fields with fresh nodes.
    pub replace_sub_objects: bool,
}

impl DiffOptions {
    /// Sets `default_undefined`.
    pub fn with_default_undefined(mut self, enabled: bool) -> Self {
        self.default_undefined = enabled;
        self
    }

    /// Sets `merge_unknown_objects`.
    pub fn with_merge_unknown_objects(mut self, enabled: bool) -> Self {
        self.merge_unknown_objects = enabled;
        self
    }

    /// Sets `replace_sub_objects`.
    pub fn with_replace_sub_objects(mut self, enabled: bool) -> Self {
        self.replace_sub_objects = enabled;
        self
    }
}

/// Computes the operations turning `from` into `to`.
///
/// Every node reachable in `from` must carry an identifier. Nodes of `to`
/// that lack one are identified in place, so `to` can serve as the next
/// `from`. The root of `to` always takes the root identifier of `from`.
pub fn diff_to_patches(
    from: &DocTree,
    to: &mut DocTree,
    clock: &mut dyn FnMut() -> Timestamp,
    sub_ids: &mut dyn SubIdSource,
    options: &DiffOptions,
) -> CoreResult<Vec<Operation>> {
    let root_oid = from
        .root_oid()
        .cloned()
        .ok_or(CoreError::MissingOid { parent: None })?;
    let from_index = index_tree(from)?;
    let mut differ = Differ::new(from, from_index, to, clock, sub_ids, options, root_oid.root());

    let to_root = differ.to.root();
    differ.to.set_oid(to_root, root_oid.clone());
    differ.claim(&root_oid);
    differ.pairs.push((from.root(), to_root));
    differ.run()?;
    differ.emit_deletes()?;
    Ok(differ.ops)
}

/// Emits the operations creating a brand-new document.
///
/// The root of `tree` receives `root_oid`; nested nodes are identified as
/// needed.
pub fn initial_to_patches(
    tree: &mut DocTree,
    root_oid: &Oid,
    clock: &mut dyn FnMut() -> Timestamp,
    sub_ids: &mut dyn SubIdSource,
) -> CoreResult<Vec<Operation>> {
    let empty = DocTree::new_object();
    let options = DiffOptions::default();
    let mut differ = Differ::new(
        &empty,
        HashMap::new(),
        tree,
        clock,
        sub_ids,
        &options,
        root_oid.root(),
    );
    let root = differ.to.root();
    differ.to.set_oid(root, root_oid.clone());
    differ.claim(root_oid);
    differ.initialize_subtree(root)?;
    differ.run()?;
    Ok(differ.ops)
}

/// Emits a `delete` for every node of a document.
pub fn delete_patches(
    tree: &DocTree,
    clock: &mut dyn FnMut() -> Timestamp,
) -> CoreResult<Vec<Operation>> {
    let index = index_tree(tree)?;
    let mut ops = Vec::with_capacity(index.len());
    for id in tree.reachable() {
        if let Some(oid) = tree.oid(id) {
            ops.push(Operation::new(oid.clone(), clock(), OperationData::Delete));
        }
    }
    Ok(ops)
}

/// Maps every identifier of a fully identified tree to its node.
fn index_tree(tree: &DocTree) -> CoreResult<HashMap<Oid, NodeId>> {
    let mut index = HashMap::new();
    let mut stack: Vec<(NodeId, Option<Oid>)> = vec![(tree.root(), None)];
    let mut seen = HashSet::new();
    while let Some((id, parent)) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let oid = tree
            .oid(id)
            .cloned()
            .ok_or(CoreError::MissingOid { parent })?;
        if let Some(kind) = tree.kind(id) {
            stack.extend(
                kind.children()
                    .into_iter()
                    .map(|child| (child, Some(oid.clone()))),
            );
        }
        index.insert(oid, id);
    }
    Ok(index)
}

struct Differ<'a> {
    from: &'a DocTree,
    to: &'a mut DocTree,
    clock: &'a mut dyn FnMut() -> Timestamp,
    sub_ids: &'a mut dyn SubIdSource,
    options: &'a DiffOptions,
    doc_root: Oid,
    from_index: HashMap<Oid, NodeId>,
    /// Identifiers already bound to a node of `to`.
    claimed: HashSet<Oid>,
    /// Identifiers that a fresh sub-identifier must avoid.
    taken: HashSet<Oid>,
    /// Nodes of `from` kept although `to` does not reach them.
    retained: HashSet<Oid>,
    pairs: Vec<(NodeId, NodeId)>,
    ops: Vec<Operation>,
}

impl<'a> Differ<'a> {
    fn new(
        from: &'a DocTree,
        from_index: HashMap<Oid, NodeId>,
        to: &'a mut DocTree,
        clock: &'a mut dyn FnMut() -> Timestamp,
        sub_ids: &'a mut dyn SubIdSource,
        options: &'a DiffOptions,
        doc_root: Oid,
    ) -> Self {
        let taken = from_index.keys().cloned().collect();
        Self {
            from,
            to,
            clock,
            sub_ids,
            options,
            doc_root,
            from_index,
            claimed: HashSet::new(),
            taken,
            retained: HashSet::new(),
            pairs: Vec::new(),
            ops: Vec::new(),
        }
    }

    fn emit(&mut self, oid: Oid, data: OperationData) {
        let timestamp = (self.clock)();
        self.ops.push(Operation::new(oid, timestamp, data));
    }

    fn claim(&mut self, oid: &Oid) {
        self.claimed.insert(oid.clone());
        self.taken.insert(oid.clone());
    }

    fn is_free(&self, oid: &Oid) -> bool {
        !self.claimed.contains(oid)
    }

    fn oid_of(&self, id: NodeId) -> CoreResult<Oid> {
        self.to
            .oid(id)
            .cloned()
            .ok_or(CoreError::MissingOid { parent: None })
    }

    fn run(&mut self) -> CoreResult<()> {
        while let Some((from_node, to_node)) = self.pairs.pop() {
            self.diff_pair(from_node, to_node)?;
        }
        Ok(())
    }

    fn diff_pair(&mut self, from_node: NodeId, to_node: NodeId) -> CoreResult<()> {
        let from = self.from;
        let (Some(from_kind), Some(to_kind)) = (from.kind(from_node), self.to.kind(to_node).cloned())
        else {
            return Ok(());
        };
        match (from_kind, to_kind) {
            (NodeKind::Object(from_fields), NodeKind::Object(to_fields)) => {
                self.diff_object(from_node, from_fields, to_node, &to_fields)
            }
            (NodeKind::List(from_items), NodeKind::List(to_items)) => {
                self.diff_list(from_node, from_items, to_node, &to_items)
            }
            // Same identity, different container type: rebuild in place.
            _ => self.initialize_subtree(to_node),
        }
    }

    fn diff_object(
        &mut self,
        from_node: NodeId,
        from_fields: &'a BTreeMap<String, Value>,
        to_node: NodeId,
        to_fields: &BTreeMap<String, Value>,
    ) -> CoreResult<()> {
        let from = self.from;
        let oid = self.oid_of(to_node)?;
        let keys: BTreeSet<&String> = from_fields.keys().chain(to_fields.keys()).collect();
        for key in keys {
            match (from_fields.get(key), to_fields.get(key)) {
                (None, None) => {}
                (Some(old), None) => {
                    if self.options.default_undefined {
                        if let Value::Node(node) = old {
                            self.retain_from(*node);
                        }
                    } else {
                        self.emit(oid.clone(), OperationData::Remove { name: key.clone() });
                    }
                }
                (None, Some(new)) => {
                    let value = self.attach_value(to_node, new)?;
                    self.emit(
                        oid.clone(),
                        OperationData::Set {
                            name: key.clone(),
                            value,
                        },
                    );
                }
                (Some(old), Some(new)) => {
                    let value = match (old, new) {
                        (Value::Node(old_node), Value::Node(new_node)) => {
                            self.field_child(*old_node, *new_node)?
                        }
                        (_, Value::Node(_)) => Some(self.attach_value(to_node, new)?),
                        _ => {
                            let new_json = self.to.value_json(to_node, new)?;
                            let old_json = from.value_json(from_node, old)?;
                            (old_json != new_json).then_some(new_json)
                        }
                    };
                    if let Some(value) = value {
                        self.emit(
                            oid.clone(),
                            OperationData::Set {
                                name: key.clone(),
                                value,
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolves a nested object field present on both sides.
    ///
    /// Returns the value to `set`, or `None` when the child is diffed in place.
    fn field_child(&mut self, old_node: NodeId, new_node: NodeId) -> CoreResult<Option<JsonValue>> {
        let from = self.from;
        let old_oid = from
            .oid(old_node)
            .cloned()
            .ok_or(CoreError::MissingOid { parent: None })?;
        if self.options.replace_sub_objects {
            return self.attach_fresh(new_node).map(Some);
        }
        match self.to.oid(new_node).cloned() {
            None => {
                let same_shape = match (from.kind(old_node), self.to.kind(new_node)) {
                    (Some(old_kind), Some(new_kind)) => old_kind.same_shape(new_kind),
                    _ => false,
                };
                if self.options.merge_unknown_objects && same_shape && self.is_free(&old_oid) {
                    self.to.set_oid(new_node, old_oid.clone());
                    self.claim(&old_oid);
                    self.pairs.push((old_node, new_node));
                    Ok(None)
                } else {
                    self.attach_fresh(new_node).map(Some)
                }
            }
            Some(new_oid) if new_oid == old_oid && self.is_free(&new_oid) => {
                self.claim(&new_oid);
                self.pairs.push((old_node, new_node));
                Ok(None)
            }
            Some(_) => self.attach(new_node).map(Some),
        }
    }

    fn attach_value(&mut self, parent: NodeId, value: &Value) -> CoreResult<JsonValue> {
        match value {
            Value::Node(node) => self.attach(*node),
            other => self.to.value_json(parent, other),
        }
    }

    /// Binds a node of `to` that has no counterpart at its position.
    ///
    /// Known identifiers are matched with their old node (a move); new ones
    /// are initialized. Returns the reference to store in the parent.
    fn attach(&mut self, node: NodeId) -> CoreResult<JsonValue> {
        if let Some(oid) = self.to.oid(node).cloned() {
            if self.is_free(&oid) {
                if let Some(&old_node) = self.from_index.get(&oid) {
                    self.claim(&oid);
                    self.pairs.push((old_node, node));
                    return Ok(Ref::Object(oid).to_json());
                }
                if oid.belongs_to(&self.doc_root) {
                    self.claim(&oid);
                    self.initialize_subtree(node)?;
                    return Ok(Ref::Object(oid).to_json());
                }
            }
        }
        self.attach_fresh(node)
    }

    fn attach_fresh(&mut self, node: NodeId) -> CoreResult<JsonValue> {
        let oid = fresh_oid(&self.doc_root, &mut *self.sub_ids, &self.taken);
        self.claim(&oid);
        self.to.set_oid(node, oid.clone());
        self.initialize_subtree(node)?;
        Ok(Ref::Object(oid).to_json())
    }

    /// Emits `initialize` for a node of `to` and every new node below it.
    ///
    /// `start` must already be identified and claimed. Descendants that match
    /// a node of `from` are paired for diffing instead of initialized.
    fn initialize_subtree(&mut self, start: NodeId) -> CoreResult<()> {
        let mut order = Vec::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            order.push(node);
            let children = self
                .to
                .kind(node)
                .map(NodeKind::children)
                .unwrap_or_default();
            for child in children {
                match self.to.oid(child).cloned() {
                    Some(oid) if self.is_free(&oid) && self.from_index.contains_key(&oid) => {
                        self.claim(&oid);
                        if let Some(&old_node) = self.from_index.get(&oid) {
                            self.pairs.push((old_node, child));
                        }
                    }
                    Some(oid) if self.is_free(&oid) && oid.belongs_to(&self.doc_root) => {
                        self.claim(&oid);
                        stack.push(child);
                    }
                    _ => {
                        let oid = fresh_oid(&self.doc_root, &mut *self.sub_ids, &self.taken);
                        self.claim(&oid);
                        self.to.set_oid(child, oid);
                        stack.push(child);
                    }
                }
            }
        }
        for node in order.into_iter().rev() {
            let oid = self.oid_of(node)?;
            let value = self.to.view(node)?;
            self.emit(oid, OperationData::Initialize { value });
        }
        Ok(())
    }

    fn diff_list(
        &mut self,
        from_node: NodeId,
        from_items: &'a [Value],
        to_node: NodeId,
        to_items: &[Value],
    ) -> CoreResult<()> {
        let from = self.from;
        for item in to_items {
            if let Value::Node(node) = item {
                self.attach(*node)?;
            }
        }
        let old: Vec<JsonValue> = from_items
            .iter()
            .map(|item| from.value_json(from_node, item))
            .collect::<CoreResult<_>>()?;
        let new: Vec<JsonValue> = to_items
            .iter()
            .map(|item| self.to.value_json(to_node, item))
            .collect::<CoreResult<_>>()?;
        let oid = self.oid_of(to_node)?;
        for data in list_patch(&old, &new) {
            self.emit(oid.clone(), data);
        }
        Ok(())
    }

    fn retain_from(&mut self, node: NodeId) {
        let from = self.from;
        for id in from.reachable_from(node) {
            if let Some(oid) = from.oid(id) {
                self.retained.insert(oid.clone());
            }
        }
    }

    /// Deletes every node of `from` that `to` no longer reaches.
    fn emit_deletes(&mut self) -> CoreResult<()> {
        let mut kept: HashSet<Oid> = HashSet::new();
        let mut explicit_refs = Vec::new();
        for id in self.to.reachable() {
            kept.insert(self.oid_of(id)?);
            let values: Vec<Value> = match self.to.kind(id) {
                Some(NodeKind::Object(fields)) => fields.values().cloned().collect(),
                Some(NodeKind::List(items)) => items.clone(),
                None => Vec::new(),
            };
            for value in values {
                if let Value::Ref(Ref::Object(oid)) = value {
                    explicit_refs.push(oid);
                }
            }
        }
        for oid in explicit_refs {
            if let Some(&node) = self.from_index.get(&oid) {
                self.retain_from(node);
            }
        }

        let from = self.from;
        for id in from.reachable() {
            let Some(oid) = from.oid(id) else {
                continue;
            };
            if !kept.contains(oid) && !self.retained.contains(oid) {
                self.emit(oid.clone(), OperationData::Delete);
            }
        }
        Ok(())
    }
}

/// Computes list operations turning `old` into `new`.
///
/// Items are reference-substituted values; two items are the same when
/// their JSON is equal, which for nested nodes means the same identifier.
pub fn list_patch(old: &[JsonValue], new: &[JsonValue]) -> Vec<OperationData> {
    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();
    let old_window = &old[prefix..old.len() - suffix];
    let new_window = &new[prefix..new.len() - suffix];

    match (old_window.is_empty(), new_window.is_empty()) {
        (true, true) => Vec::new(),
        (true, false) => vec![insertion(prefix, new_window, suffix == 0)],
        (false, true) => {
            if old_window.iter().all(is_identity) {
                let mut working = old.to_vec();
                old_window
                    .iter()
                    .map(|_| remove_at(&mut working, prefix))
                    .collect()
            } else {
                vec![OperationData::ListDelete {
                    index: prefix,
                    count: old_window.len(),
                }]
            }
        }
        (false, false) => match reorder(old_window, new_window) {
            Some((old_refs, new_refs)) => moves(prefix, &old_refs, &new_refs),
            None => mixed(old, prefix, old_window, new_window, suffix),
        },
    }
}

fn is_identity(item: &JsonValue) -> bool {
    Ref::from_json(item).is_some()
}

fn insertion(index: usize, items: &[JsonValue], at_end: bool) -> OperationData {
    match items {
        [single] if at_end => OperationData::ListPush {
            value: single.clone(),
        },
        _ => OperationData::ListInsert {
            index,
            items: InsertItems::from_vec(items.to_vec()),
        },
    }
}

/// Removes `working[position]` by value, picking the disambiguator that hits
/// exactly that instance, or by index when neither end is unambiguous.
fn remove_at(working: &mut Vec<JsonValue>, position: usize) -> OperationData {
    let value = working.remove(position);
    let before = working[..position].contains(&value);
    let after = working[position..].contains(&value);
    match (before, after) {
        (false, false) => OperationData::ListRemove { value, only: None },
        (true, false) => OperationData::ListRemove {
            value,
            only: Some(RemoveOnly::Last),
        },
        (false, true) => OperationData::ListRemove {
            value,
            only: Some(RemoveOnly::First),
        },
        (true, true) => OperationData::ListDelete {
            index: position,
            count: 1,
        },
    }
}

/// Returns the windows as references if they hold the same distinct
/// identities in a different order.
fn reorder(old: &[JsonValue], new: &[JsonValue]) -> Option<(Vec<Ref>, Vec<Ref>)> {
    if old.len() != new.len() {
        return None;
    }
    let old_refs: Vec<Ref> = old.iter().map(Ref::from_json).collect::<Option<_>>()?;
    let new_refs: Vec<Ref> = new.iter().map(Ref::from_json).collect::<Option<_>>()?;
    let old_set: HashSet<&Ref> = old_refs.iter().collect();
    let new_set: HashSet<&Ref> = new_refs.iter().collect();
    if old_set.len() != old_refs.len() || old_set != new_set {
        return None;
    }
    Some((old_refs, new_refs))
}

/// Moves every displaced item right behind its target predecessor.
///
/// Items that sit at their target position in `old` never move, and each
/// displaced item ends up glued to its predecessor, so the result is exactly
/// one `list-move-by-ref` per displaced item.
fn moves(offset: usize, old: &[Ref], new: &[Ref]) -> Vec<OperationData> {
    let mut working = old.to_vec();
    let mut ops = Vec::new();
    for (position, item) in new.iter().enumerate() {
        if old[position] == *item {
            continue;
        }
        if let Some(current) = working.iter().position(|r| r == item) {
            working.remove(current);
        }
        let index = match position.checked_sub(1) {
            Some(previous) => working
                .iter()
                .position(|r| *r == new[previous])
                .map_or(0, |at| at + 1),
            None => 0,
        };
        working.insert(index, item.clone());
        ops.push(OperationData::ListMoveByRef {
            value: item.to_json(),
            index: offset + index,
        });
    }
    ops
}

/// Overwrites the overlap and then grows or shrinks the window.
///
/// Not edit-distance optimal: an item moving from the front to the back is
/// rewritten everywhere in between. Value-based removals keep the result
/// correct when concurrent edits have shifted positions.
fn mixed(
    old: &[JsonValue],
    prefix: usize,
    old_window: &[JsonValue],
    new_window: &[JsonValue],
    suffix: usize,
) -> Vec<OperationData> {
    let mut ops = Vec::new();
    let mut working = old.to_vec();
    let overlap = old_window.len().min(new_window.len());
    for position in 0..overlap {
        if old_window[position] != new_window[position] {
            let index = prefix + position;
            working[index] = new_window[position].clone();
            ops.push(OperationData::ListSet {
                index,
                value: new_window[position].clone(),
            });
        }
    }
    if new_window.len() > overlap {
        ops.push(insertion(
            prefix + overlap,
            &new_window[overlap..],
            suffix == 0,
        ));
    } else {
        for _ in overlap..old_window.len() {
            ops.push(remove_at(&mut working, prefix + overlap));
        }
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid::SequentialSubIds;
    use crate::patch::{apply_to_views, ViewMap};
    use serde_json::json;

    fn doc_oid() -> Oid {
        Oid::new("posts", "p1")
    }

    fn counter_clock() -> impl FnMut() -> Timestamp {
        let mut n = 0;
        move || {
            n += 1;
            Timestamp::new(0, n, 0, "t")
        }
    }

    fn identified(json: JsonValue) -> DocTree {
        let mut ids = SequentialSubIds::new("a");
        DocTree::from_json_with_oids(&json, &doc_oid(), &mut ids).unwrap()
    }

    fn diff_with(from: &DocTree, to: &mut DocTree, options: &DiffOptions) -> Vec<Operation> {
        let mut clock = counter_clock();
        let mut ids = SequentialSubIds::new("n");
        diff_to_patches(from, to, &mut clock, &mut ids, options).unwrap()
    }

    fn diff(from: &DocTree, to: &mut DocTree) -> Vec<Operation> {
        diff_with(from, to, &DiffOptions::default())
    }

    /// Applies the patch to the views of `from` and compares with `to`.
    fn assert_round_trip(from: &DocTree, to: &DocTree, ops: &[Operation]) {
        let mut views: ViewMap = from.views().unwrap();
        apply_to_views(&mut views, ops);
        let expected = to.views().unwrap();
        assert_eq!(views, expected);
        let rebuilt = DocTree::from_views(&doc_oid(), &views).unwrap().unwrap();
        assert_eq!(rebuilt.to_json(), to.to_json());
    }

    fn datas(ops: &[Operation]) -> Vec<OperationData> {
        ops.iter().map(|op| op.data.clone()).collect()
    }

    #[test]
    fn object_field_changes() {
        let from = identified(json!({"foo": "bar", "baz": "qux", "zing": 1}));
        let mut to = identified(json!({"foo": "bar", "baz": "pop"}));
        let ops = diff(&from, &mut to);
        assert_eq!(
            datas(&ops),
            vec![
                OperationData::Set {
                    name: "baz".into(),
                    value: json!("pop")
                },
                OperationData::Remove {
                    name: "zing".into()
                },
            ]
        );
        assert!(ops.iter().all(|op| op.oid == doc_oid()));
        assert_round_trip(&from, &to, &ops);
    }

    #[test]
    fn list_insert_in_middle() {
        let from = identified(json!([1, 2, 4, 5]));
        let mut to = identified(json!([1, 2, 3, 4, 5]));
        let ops = diff(&from, &mut to);
        assert_eq!(
            datas(&ops),
            vec![OperationData::ListInsert {
                index: 2,
                items: InsertItems::One { value: json!(3) }
            }]
        );
    }

    #[test]
    fn list_append_is_push() {
        let from = identified(json!([1, 2]));
        let mut to = identified(json!([1, 2, 3]));
        let ops = diff(&from, &mut to);
        assert_eq!(datas(&ops), vec![OperationData::ListPush { value: json!(3) }]);
    }

    #[test]
    fn swapping_objects_emits_two_moves() {
        let from = identified(json!({"items": [{"n": 0}, {"n": 1}, {"n": 2}, {"n": 3}]}));
        let mut to = from.clone();
        let list = to.child(to.root(), "items").unwrap();
        to.move_item(list, 2, 1);

        let ops = diff(&from, &mut to);
        assert_eq!(ops.len(), 2);
        assert!(ops
            .iter()
            .all(|op| matches!(op.data, OperationData::ListMoveByRef { .. })));
        assert_round_trip(&from, &to, &ops);
    }

    #[test]
    fn reorder_counts_displaced_items() {
        let from = identified(json!([{"k": "a"}, {"k": "b"}, {"k": "c"}, {"k": "d"}]));
        let mut to = from.clone();
        let root = to.root();
        // a b c d -> c b d a: three items displaced, b stays put.
        let items: Vec<Value> = to.items(root).unwrap().to_vec();
        let reordered = vec![items[2].clone(), items[1].clone(), items[3].clone(), items[0].clone()];
        if let Some(NodeKind::List(list)) = to.kind_mut(root) {
            *list = reordered;
        }
        let ops = diff(&from, &mut to);
        assert_eq!(ops.len(), 3);
        assert_round_trip(&from, &to, &ops);
    }

    #[test]
    fn identical_trees_produce_nothing() {
        let from = identified(json!({"a": [1, {"b": 2}], "c": {"d": [true]}}));
        let mut to = from.clone();
        assert!(diff(&from, &mut to).is_empty());
    }

    #[test]
    fn unidentified_object_is_replaced() {
        let from = identified(json!({"inner": {"x": 1}}));
        let mut to = from.clone();
        let root = to.root();
        to.set(root, "inner", &json!({"x": 2}));
        let ops = diff(&from, &mut to);
        let names: Vec<&str> = ops.iter().map(|op| op.data.name()).collect();
        assert_eq!(names, vec!["initialize", "set", "delete"]);
        assert_eq!(ops[2].oid, doc_oid().with_sub_id("a0"));
        assert_eq!(ops[0].oid, doc_oid().with_sub_id("n0"));
        assert_round_trip(&from, &to, &ops);
    }

    #[test]
    fn merge_unknown_objects_keeps_identity() {
        let from = identified(json!({"inner": {"x": 1, "y": 1}}));
        let mut to = DocTree::from_json(&json!({"inner": {"x": 2, "y": 1}})).unwrap();
        let options = DiffOptions::default().with_merge_unknown_objects(true);
        let ops = diff_with(&from, &mut to, &options);
        assert_eq!(
            datas(&ops),
            vec![OperationData::Set {
                name: "x".into(),
                value: json!(2)
            }]
        );
        assert_eq!(ops[0].oid, doc_oid().with_sub_id("a0"));
        assert_round_trip(&from, &to, &ops);
    }

    #[test]
    fn replace_sub_objects_always_replaces() {
        let from = identified(json!({"inner": {"x": 1}}));
        let mut to = from.clone();
        let options = DiffOptions::default().with_replace_sub_objects(true);
        let ops = diff_with(&from, &mut to, &options);
        let names: Vec<&str> = ops.iter().map(|op| op.data.name()).collect();
        assert_eq!(names, vec!["initialize", "set", "delete"]);
        assert_round_trip(&from, &to, &ops);
    }

    #[test]
    fn default_undefined_keeps_missing_keys() {
        let from = identified(json!({"a": 1, "nested": {"b": 2}}));
        let mut to = DocTree::from_json(&json!({})).unwrap();
        let options = DiffOptions::default().with_default_undefined(true);
        assert!(diff_with(&from, &mut to, &options).is_empty());
    }

    #[test]
    fn nested_new_subtree_initializes_children_first() {
        let from = identified(json!({}));
        let mut to = from.clone();
        let root = to.root();
        to.set(root, "outer", &json!({"inner": {"leaf": 1}}));
        let ops = diff(&from, &mut to);
        let names: Vec<&str> = ops.iter().map(|op| op.data.name()).collect();
        assert_eq!(names, vec!["initialize", "initialize", "set"]);
        // The leaf object is initialized before the object referencing it.
        assert_eq!(ops[0].data, OperationData::Initialize { value: json!({"leaf": 1}) });
        assert_round_trip(&from, &to, &ops);
    }

    #[test]
    fn moved_node_keeps_identity() {
        let from = identified(json!({"left": {"v": 1}, "right": {}}));
        let mut to = from.clone();
        let root = to.root();
        let left = to.remove(root, "left").unwrap();
        let right = to.child(root, "right").unwrap();
        to.set_value(right, "moved", left);

        let ops = diff(&from, &mut to);
        assert!(ops
            .iter()
            .all(|op| !matches!(op.data, OperationData::Initialize { .. } | OperationData::Delete)));
        assert_round_trip(&from, &to, &ops);
    }

    #[test]
    fn removed_subtree_is_deleted_last() {
        let from = identified(json!({"a": {"b": {"c": 1}}, "keep": 1}));
        let mut to = from.clone();
        let root = to.root();
        to.remove(root, "a");
        to.set(root, "keep", &json!(2));
        let ops = diff(&from, &mut to);
        let names: Vec<&str> = ops.iter().map(|op| op.data.name()).collect();
        assert_eq!(names, vec!["remove", "set", "delete", "delete"]);
        assert_round_trip(&from, &to, &ops);
    }

    #[test]
    fn timestamps_follow_emission_order() {
        let from = identified(json!({"a": 1, "b": [1, 2], "c": {}}));
        let mut to = DocTree::from_json(&json!({"a": 2, "b": [2], "c": {"x": {}}})).unwrap();
        let ops = diff(&from, &mut to);
        assert!(ops.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
        assert_round_trip(&from, &to, &ops);
    }

    #[test]
    fn kind_change_reinitializes() {
        let from = identified(json!({"v": {"a": 1}}));
        let mut to = from.clone();
        let child = to.child(to.root(), "v").unwrap();
        if let Some(kind) = to.kind_mut(child) {
            *kind = NodeKind::List(vec![Value::Bool(true)]);
        }
        let ops = diff(&from, &mut to);
        assert_eq!(
            datas(&ops),
            vec![OperationData::Initialize { value: json!([true]) }]
        );
        assert_round_trip(&from, &to, &ops);
    }

    #[test]
    fn missing_oid_in_from_is_an_error() {
        let from = DocTree::from_json(&json!({"a": {}})).unwrap();
        let mut to = from.clone();
        let mut clock = counter_clock();
        let mut ids = SequentialSubIds::new("n");
        let result = diff_to_patches(&from, &mut to, &mut clock, &mut ids, &DiffOptions::default());
        assert!(matches!(result, Err(CoreError::MissingOid { .. })));
    }

    #[test]
    fn fresh_ids_avoid_existing() {
        // `from` was identified with the same sequence the diff uses.
        let mut ids = SequentialSubIds::new("n");
        let from = DocTree::from_json_with_oids(&json!({"a": {}}), &doc_oid(), &mut ids).unwrap();
        let mut to = from.clone();
        let root = to.root();
        to.set(root, "b", &json!({}));
        let ops = diff(&from, &mut to);
        assert_eq!(ops[0].oid, doc_oid().with_sub_id("n1"));
        assert_round_trip(&from, &to, &ops);
    }

    #[test]
    fn initial_patches_build_document() {
        let mut tree = DocTree::from_json(&json!({"title": "t", "tags": [{"x": 1}]})).unwrap();
        let mut clock = counter_clock();
        let mut ids = SequentialSubIds::new("n");
        let ops = initial_to_patches(&mut tree, &doc_oid(), &mut clock, &mut ids).unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops.last().unwrap().oid, doc_oid());
        let mut views = ViewMap::new();
        apply_to_views(&mut views, &ops);
        let rebuilt = DocTree::from_views(&doc_oid(), &views).unwrap().unwrap();
        assert_eq!(rebuilt.to_json(), json!({"title": "t", "tags": [{"x": 1}]}));
    }

    #[test]
    fn delete_patches_cover_every_node() {
        let tree = identified(json!({"a": {"b": []}}));
        let mut clock = counter_clock();
        let ops = delete_patches(&tree, &mut clock).unwrap();
        assert_eq!(ops.len(), 3);
        assert!(ops.iter().all(|op| op.data == OperationData::Delete));
    }

    #[test]
    fn list_patch_pure_deletion() {
        assert_eq!(
            list_patch(&[json!(1), json!(2), json!(3)], &[json!(1)]),
            vec![OperationData::ListDelete { index: 1, count: 2 }]
        );
        let a = Ref::File("a".into()).to_json();
        let b = Ref::File("b".into()).to_json();
        assert_eq!(
            list_patch(&[a.clone(), b.clone()], &[b]),
            vec![OperationData::ListRemove { value: a, only: None }]
        );
    }

    #[test]
    fn list_patch_mixed_window() {
        let old = [json!("x"), json!("a"), json!("b"), json!("x")];
        let new = [json!("y"), json!("x")];
        let ops = list_patch(&old, &new);
        let mut view = Some(JsonValue::Array(old.to_vec()));
        for data in &ops {
            view = crate::patch::apply_patch(view, data, None);
        }
        assert_eq!(view, Some(JsonValue::Array(new.to_vec())));
        assert!(matches!(ops[0], OperationData::ListSet { index: 0, .. }));
    }

    #[test]
    fn list_patch_ambiguous_removal_falls_back_to_index() {
        let old = [json!(1), json!(9), json!(1), json!(2), json!(1)];
        let new = [json!(1), json!(2), json!(1)];
        let ops = list_patch(&old, &new);
        let mut view = Some(JsonValue::Array(old.to_vec()));
        for data in &ops {
            view = crate::patch::apply_patch(view, data, None);
        }
        assert_eq!(view, Some(JsonValue::Array(new.to_vec())));
    }

    #[test]
    fn list_patch_primitive_reorder_uses_set() {
        let ops = list_patch(&[json!(1), json!(2)], &[json!(2), json!(1)]);
        assert_eq!(
            ops,
            vec![
                OperationData::ListSet { index: 0, value: json!(2) },
                OperationData::ListSet { index: 1, value: json!(1) },
            ]
        );
    }

    #[test]
    fn new_list_objects_are_initialized_before_insert() {
        let from = identified(json!({"todos": []}));
        let mut to = from.clone();
        let list = to.child(to.root(), "todos").unwrap();
        to.push(list, &json!({"done": false}));
        let ops = diff(&from, &mut to);
        let names: Vec<&str> = ops.iter().map(|op| op.data.name()).collect();
        assert_eq!(names, vec!["initialize", "list-push"]);
        assert_round_trip(&from, &to, &ops);
    }
}
