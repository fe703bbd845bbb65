//! In-memory document trees with out-of-band identity.
//!
//! A [`DocTree`] is an arena of nodes. Each node is an object or a list and
//! stores its [`Oid`] beside the payload, never inside it, so cloning a tree
//! and editing the clone keeps identity intact for the diff engine.
//!
//! All walks over the graph use explicit work stacks.

use crate::error::{CoreError, CoreResult};
use crate::oid::{Oid, SubIdSource};
use crate::operation::Ref;
use serde_json::{Map, Number, Value as JsonValue};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Index of a node inside a [`DocTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// A field or list item.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// JSON null.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number.
    Number(Number),
    /// JSON string.
    String(String),
    /// An explicit reference (another document's node or a file).
    Ref(Ref),
    /// A nested object or list owned by this tree.
    Node(NodeId),
}

impl Value {
    /// Converts a JSON scalar or serialized reference.
    ///
    /// Returns `None` for plain objects and arrays.
    pub fn from_scalar(json: &JsonValue) -> Option<Value> {
        match json {
            JsonValue::Null => Some(Value::Null),
            JsonValue::Bool(b) => Some(Value::Bool(*b)),
            JsonValue::Number(n) => Some(Value::Number(n.clone())),
            JsonValue::String(s) => Some(Value::String(s.clone())),
            JsonValue::Object(_) => Ref::from_json(json).map(Value::Ref),
            JsonValue::Array(_) => None,
        }
    }

    /// Returns the nested node, if any.
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Value::Node(id) => Some(*id),
            _ => None,
        }
    }

    fn scalar_json(&self) -> Option<JsonValue> {
        match self {
            Value::Null => Some(JsonValue::Null),
            Value::Bool(b) => Some(JsonValue::Bool(*b)),
            Value::Number(n) => Some(JsonValue::Number(n.clone())),
            Value::String(s) => Some(JsonValue::String(s.clone())),
            Value::Ref(r) => Some(r.to_json()),
            Value::Node(_) => None,
        }
    }
}

/// Payload of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Keyed fields, iterated in sorted key order.
    Object(BTreeMap<String, Value>),
    /// Ordered items.
    List(Vec<Value>),
}

impl NodeKind {
    pub(crate) fn children(&self) -> Vec<NodeId> {
        match self {
            NodeKind::Object(fields) => fields.values().filter_map(Value::as_node).collect(),
            NodeKind::List(items) => items.iter().filter_map(Value::as_node).collect(),
        }
    }

    /// Returns true if both payloads are of the same container type.
    pub fn same_shape(&self, other: &NodeKind) -> bool {
        matches!(
            (self, other),
            (NodeKind::Object(_), NodeKind::Object(_)) | (NodeKind::List(_), NodeKind::List(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Node {
    oid: Option<Oid>,
    kind: NodeKind,
}

/// A document as an arena of identified nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct DocTree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl DocTree {
    /// Creates a tree holding an empty root object.
    pub fn new_object() -> Self {
        Self::with_root(NodeKind::Object(BTreeMap::new()))
    }

    /// Creates a tree holding an empty root list.
    pub fn new_list() -> Self {
        Self::with_root(NodeKind::List(Vec::new()))
    }

    fn with_root(kind: NodeKind) -> Self {
        Self {
            nodes: vec![Node { oid: None, kind }],
            root: NodeId(0),
        }
    }

    /// Builds an unidentified tree from JSON.
    ///
    /// The root must be an object or an array.
    pub fn from_json(json: &JsonValue) -> CoreResult<Self> {
        let mut tree = match json {
            JsonValue::Array(_) => Self::new_list(),
            JsonValue::Object(_) if Ref::from_json(json).is_none() => Self::new_object(),
            _ => {
                return Err(CoreError::invalid_document(
                    "document root must be an object or a list",
                ))
            }
        };
        let root = tree.root;
        tree.fill(root, json);
        Ok(tree)
    }

    /// Builds a tree from JSON and identifies every node.
    pub fn from_json_with_oids(
        json: &JsonValue,
        root_oid: &Oid,
        sub_ids: &mut dyn SubIdSource,
    ) -> CoreResult<Self> {
        let mut tree = Self::from_json(json)?;
        tree.assign_oids(root_oid, sub_ids);
        Ok(tree)
    }

    /// Returns the root node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Returns the identifier of the root node.
    pub fn root_oid(&self) -> Option<&Oid> {
        self.oid(self.root)
    }

    /// Returns a node's identifier.
    pub fn oid(&self, id: NodeId) -> Option<&Oid> {
        self.nodes.get(id.0).and_then(|node| node.oid.as_ref())
    }

    /// Sets a node's identifier.
    pub fn set_oid(&mut self, id: NodeId, oid: Oid) {
        if let Some(node) = self.nodes.get_mut(id.0) {
            node.oid = Some(oid);
        }
    }

    /// Returns a node's payload.
    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.nodes.get(id.0).map(|node| &node.kind)
    }

    /// Returns a node's payload for mutation.
    pub fn kind_mut(&mut self, id: NodeId) -> Option<&mut NodeKind> {
        self.nodes.get_mut(id.0).map(|node| &mut node.kind)
    }

    /// Gives every reachable node without an identifier a fresh one.
    ///
    /// The root receives `root_oid`; nested nodes receive sub-identifiers
    /// under it.
    pub fn assign_oids(&mut self, root_oid: &Oid, sub_ids: &mut dyn SubIdSource) {
        let mut taken: HashSet<Oid> = self
            .reachable()
            .into_iter()
            .filter_map(|id| self.oid(id).cloned())
            .collect();
        if self.oid(self.root).is_none() {
            taken.insert(root_oid.clone());
            self.set_oid(self.root, root_oid.clone());
        }
        for id in self.reachable() {
            if self.oid(id).is_none() {
                let oid = fresh_oid(root_oid, sub_ids, &taken);
                taken.insert(oid.clone());
                self.set_oid(id, oid);
            }
        }
    }

    /// Returns every node reachable from the root, parents before children.
    pub fn reachable(&self) -> Vec<NodeId> {
        self.reachable_from(self.root)
    }

    /// Returns every node reachable from `start`, parents before children.
    pub fn reachable_from(&self, start: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            if let Some(kind) = self.kind(id) {
                let mut children = kind.children();
                children.reverse();
                stack.extend(children);
            }
        }
        order
    }

    /// Imports a JSON value as a detached value of this tree.
    ///
    /// Objects and arrays become new unidentified nodes.
    pub fn import(&mut self, json: &JsonValue) -> Value {
        if let Some(value) = Value::from_scalar(json) {
            return value;
        }
        let id = self.alloc_for(json);
        self.fill(id, json);
        Value::Node(id)
    }

    fn alloc_for(&mut self, json: &JsonValue) -> NodeId {
        let kind = match json {
            JsonValue::Array(_) => NodeKind::List(Vec::new()),
            _ => NodeKind::Object(BTreeMap::new()),
        };
        self.alloc(None, kind)
    }

    fn alloc(&mut self, oid: Option<Oid>, kind: NodeKind) -> NodeId {
        self.nodes.push(Node { oid, kind });
        NodeId(self.nodes.len() - 1)
    }

    /// Populates an allocated node (and its descendants) from JSON.
    fn fill(&mut self, start: NodeId, json: &JsonValue) {
        let mut stack = vec![(start, json)];
        while let Some((id, json)) = stack.pop() {
            let kind = match json {
                JsonValue::Object(map) => {
                    let mut fields = BTreeMap::new();
                    for (key, child) in map {
                        let value = self.child_value(child, &mut stack);
                        fields.insert(key.clone(), value);
                    }
                    NodeKind::Object(fields)
                }
                JsonValue::Array(items) => {
                    let values = items
                        .iter()
                        .map(|child| self.child_value(child, &mut stack))
                        .collect();
                    NodeKind::List(values)
                }
                _ => continue,
            };
            self.nodes[id.0].kind = kind;
        }
    }

    fn child_value<'a>(
        &mut self,
        child: &'a JsonValue,
        stack: &mut Vec<(NodeId, &'a JsonValue)>,
    ) -> Value {
        match Value::from_scalar(child) {
            Some(value) => value,
            None => {
                let id = self.alloc_for(child);
                stack.push((id, child));
                Value::Node(id)
            }
        }
    }

    /// Returns an object field.
    pub fn get(&self, id: NodeId, key: &str) -> Option<&Value> {
        match self.kind(id)? {
            NodeKind::Object(fields) => fields.get(key),
            NodeKind::List(_) => None,
        }
    }

    /// Returns the nested node stored under an object field.
    pub fn child(&self, id: NodeId, key: &str) -> Option<NodeId> {
        self.get(id, key).and_then(Value::as_node)
    }

    /// Sets an object field from JSON. Returns false if `id` is not an object.
    pub fn set(&mut self, id: NodeId, key: &str, json: &JsonValue) -> bool {
        let value = self.import(json);
        self.set_value(id, key, value)
    }

    /// Sets an object field to an existing value (for example a node moved
    /// from elsewhere in the tree).
    pub fn set_value(&mut self, id: NodeId, key: &str, value: Value) -> bool {
        match self.kind_mut(id) {
            Some(NodeKind::Object(fields)) => {
                fields.insert(key.to_string(), value);
                true
            }
            _ => false,
        }
    }

    /// Removes an object field.
    pub fn remove(&mut self, id: NodeId, key: &str) -> Option<Value> {
        match self.kind_mut(id)? {
            NodeKind::Object(fields) => fields.remove(key),
            NodeKind::List(_) => None,
        }
    }

    /// Returns the items of a list node.
    pub fn items(&self, id: NodeId) -> Option<&[Value]> {
        match self.kind(id)? {
            NodeKind::List(items) => Some(items),
            NodeKind::Object(_) => None,
        }
    }

    fn items_mut(&mut self, id: NodeId) -> Option<&mut Vec<Value>> {
        match self.kind_mut(id)? {
            NodeKind::List(items) => Some(items),
            NodeKind::Object(_) => None,
        }
    }

    /// Appends a JSON item to a list node.
    pub fn push(&mut self, id: NodeId, json: &JsonValue) -> bool {
        let value = self.import(json);
        match self.items_mut(id) {
            Some(items) => {
                items.push(value);
                true
            }
            None => false,
        }
    }

    /// Inserts a JSON item into a list node, clamping the index.
    pub fn insert(&mut self, id: NodeId, index: usize, json: &JsonValue) -> bool {
        let value = self.import(json);
        self.insert_value(id, index, value)
    }

    /// Inserts an existing value into a list node, clamping the index.
    pub fn insert_value(&mut self, id: NodeId, index: usize, value: Value) -> bool {
        match self.items_mut(id) {
            Some(items) => {
                let index = index.min(items.len());
                items.insert(index, value);
                true
            }
            None => false,
        }
    }

    /// Removes a list item.
    pub fn remove_item(&mut self, id: NodeId, index: usize) -> Option<Value> {
        let items = self.items_mut(id)?;
        if index < items.len() {
            Some(items.remove(index))
        } else {
            None
        }
    }

    /// Moves a list item, clamping the target index.
    pub fn move_item(&mut self, id: NodeId, from: usize, to: usize) -> bool {
        match self.items_mut(id) {
            Some(items) if from < items.len() => {
                let item = items.remove(from);
                let to = to.min(items.len());
                items.insert(to, item);
                true
            }
            _ => false,
        }
    }

    /// Serializes the whole document.
    pub fn to_json(&self) -> JsonValue {
        self.subtree_json(self.root)
    }

    /// Serializes the subtree rooted at `start`.
    pub fn subtree_json(&self, start: NodeId) -> JsonValue {
        let mut done: HashMap<NodeId, JsonValue> = HashMap::new();
        let mut expanded = HashSet::new();
        let mut stack = vec![(start, false)];
        while let Some((id, ready)) = stack.pop() {
            let Some(kind) = self.kind(id) else {
                continue;
            };
            if !ready {
                if !expanded.insert(id) {
                    continue;
                }
                stack.push((id, true));
                stack.extend(kind.children().into_iter().map(|child| (child, false)));
                continue;
            }
            let resolve = |value: &Value| match value {
                Value::Node(child) => done.get(child).cloned().unwrap_or(JsonValue::Null),
                other => other.scalar_json().unwrap_or(JsonValue::Null),
            };
            let json = match kind {
                NodeKind::Object(fields) => JsonValue::Object(
                    fields
                        .iter()
                        .map(|(key, value)| (key.clone(), resolve(value)))
                        .collect::<Map<_, _>>(),
                ),
                NodeKind::List(items) => JsonValue::Array(items.iter().map(resolve).collect()),
            };
            done.insert(id, json);
        }
        done.remove(&start).unwrap_or(JsonValue::Null)
    }

    /// Serializes a value with nested nodes replaced by references.
    pub fn value_json(&self, parent: NodeId, value: &Value) -> CoreResult<JsonValue> {
        match value {
            Value::Node(child) => match self.oid(*child) {
                Some(oid) => Ok(Ref::Object(oid.clone()).to_json()),
                None => Err(CoreError::MissingOid {
                    parent: self.oid(parent).cloned(),
                }),
            },
            other => Ok(other.scalar_json().unwrap_or(JsonValue::Null)),
        }
    }

    /// Returns the shallow, reference-substituted view of one node.
    pub fn view(&self, id: NodeId) -> CoreResult<JsonValue> {
        let Some(kind) = self.kind(id) else {
            return Ok(JsonValue::Null);
        };
        Ok(match kind {
            NodeKind::Object(fields) => {
                let mut map = Map::new();
                for (key, value) in fields {
                    map.insert(key.clone(), self.value_json(id, value)?);
                }
                JsonValue::Object(map)
            }
            NodeKind::List(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|value| self.value_json(id, value))
                    .collect::<CoreResult<Vec<_>>>()?,
            ),
        })
    }

    /// Returns the views of every reachable node, keyed by identifier.
    pub fn views(&self) -> CoreResult<BTreeMap<Oid, JsonValue>> {
        let mut views = BTreeMap::new();
        for id in self.reachable() {
            let oid = self.oid(id).cloned().ok_or(CoreError::MissingOid { parent: None })?;
            views.insert(oid, self.view(id)?);
        }
        Ok(views)
    }

    /// Assembles a document from per-object views.
    ///
    /// References to nodes of the same document are inlined; references to
    /// other documents, to files, or to objects without a view stay as
    /// [`Value::Ref`]. Returns `Ok(None)` when the root has no view.
    pub fn from_views(root: &Oid, views: &BTreeMap<Oid, JsonValue>) -> CoreResult<Option<Self>> {
        let Some(root_view) = views.get(root) else {
            return Ok(None);
        };
        let kind = container_kind(root, root_view)?;
        let mut tree = Self::with_root(kind);
        tree.set_oid(tree.root, root.clone());

        let mut visited = HashSet::from([root.clone()]);
        let mut stack = vec![(tree.root, root.clone())];
        while let Some((id, oid)) = stack.pop() {
            let Some(view) = views.get(&oid) else {
                continue;
            };
            let kind = match view {
                JsonValue::Object(map) => {
                    let mut fields = BTreeMap::new();
                    for (key, item) in map {
                        let value =
                            tree.view_value(item, root, views, &mut visited, &mut stack)?;
                        fields.insert(key.clone(), value);
                    }
                    NodeKind::Object(fields)
                }
                JsonValue::Array(items) => NodeKind::List(
                    items
                        .iter()
                        .map(|item| tree.view_value(item, root, views, &mut visited, &mut stack))
                        .collect::<CoreResult<Vec<_>>>()?,
                ),
                _ => return Err(CoreError::invalid_snapshot(&oid, "view is not a container")),
            };
            tree.nodes[id.0].kind = kind;
        }
        Ok(Some(tree))
    }

    fn view_value(
        &mut self,
        item: &JsonValue,
        root: &Oid,
        views: &BTreeMap<Oid, JsonValue>,
        visited: &mut HashSet<Oid>,
        stack: &mut Vec<(NodeId, Oid)>,
    ) -> CoreResult<Value> {
        if let Some(Ref::Object(target)) = Ref::from_json(item) {
            if target.belongs_to(root) {
                if let Some(view) = views.get(&target).filter(|view| !view.is_null()) {
                    if !visited.insert(target.clone()) {
                        return Err(CoreError::ReferenceCycle { oid: target });
                    }
                    let kind = container_kind(&target, view)?;
                    let id = self.alloc(Some(target.clone()), kind);
                    stack.push((id, target));
                    return Ok(Value::Node(id));
                }
            }
        }
        Ok(self.import(item))
    }
}

fn container_kind(oid: &Oid, view: &JsonValue) -> CoreResult<NodeKind> {
    match view {
        JsonValue::Array(_) => Ok(NodeKind::List(Vec::new())),
        JsonValue::Object(_) if Ref::from_json(view).is_none() => {
            Ok(NodeKind::Object(BTreeMap::new()))
        }
        _ => Err(CoreError::invalid_snapshot(oid, "view is not a container")),
    }
}

/// Draws a sub-identifier under `root` that is not in `taken`.
pub(crate) fn fresh_oid(root: &Oid, sub_ids: &mut dyn SubIdSource, taken: &HashSet<Oid>) -> Oid {
    loop {
        let oid = root.with_sub_id(&sub_ids.next_sub_id());
        if !taken.contains(&oid) {
            return oid;
        }
    }
}
