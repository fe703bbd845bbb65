//! Test fixtures and document helpers.
//!
//! Provides a deterministic document writer and common test documents.

use serde_json::{json, Value as JsonValue};
use tidepool_core::{
    apply_to_views, delete_patches, diff_to_patches, initial_to_patches, CoreResult, DiffOptions,
    DocTree, Oid, Operation, SequentialSubIds, Timestamp, ViewMap,
};

/// The document most tests write to.
pub fn doc_oid() -> Oid {
    Oid::new("docs", "d1")
}

/// A clock that ticks one millisecond per call.
pub fn tick_clock(replica: &str) -> impl FnMut() -> Timestamp {
    let replica = replica.to_string();
    let mut tick = 0;
    move || {
        tick += 1;
        Timestamp::new(0, tick, 0, &replica)
    }
}

/// Assembles the JSON of a document from per-object views.
///
/// Returns `None` when the root has no view or the views do not form a tree.
pub fn materialize(root: &Oid, views: &ViewMap) -> Option<JsonValue> {
    DocTree::from_views(root, views)
        .ok()
        .flatten()
        .map(|tree| tree.to_json())
}

/// A handful of realistic documents.
pub fn sample_documents() -> Vec<JsonValue> {
    vec![
        json!({"title": "Groceries", "items": ["milk", "eggs"], "done": false}),
        json!({
            "title": "Trip",
            "stops": [{"city": "Lisbon", "nights": 2}, {"city": "Porto", "nights": 1}],
            "costs": {"total": 900, "currency": "EUR"}
        }),
        json!({"board": {"columns": [{"name": "todo", "cards": []}, {"name": "done", "cards": [1, 2]}]}}),
        json!({}),
    ]
}

/// Writes successive versions of one document the way a replica does.
///
/// Every write diffs the new JSON against the previous identified tree,
/// records the operations and applies them to the writer's views.
/// Timestamps and sub-identifiers are deterministic.
pub struct DocumentWriter {
    root: Oid,
    replica: String,
    tick: u64,
    ids: SequentialSubIds,
    tree: Option<DocTree>,
    views: ViewMap,
    operations: Vec<Operation>,
}

impl DocumentWriter {
    /// Creates a writer for `root` issuing timestamps for `replica`.
    pub fn new(root: Oid, replica: &str) -> Self {
        Self {
            root,
            replica: replica.to_string(),
            tick: 0,
            ids: SequentialSubIds::new(format!("{replica}-")),
            tree: None,
            views: ViewMap::new(),
            operations: Vec::new(),
        }
    }

    /// Writes a new version with default diff options.
    pub fn write(&mut self, json: &JsonValue) -> CoreResult<Vec<Operation>> {
        self.write_with(json, &DiffOptions::default())
    }

    /// Writes a new version. Returns the operations it produced.
    pub fn write_with(
        &mut self,
        json: &JsonValue,
        options: &DiffOptions,
    ) -> CoreResult<Vec<Operation>> {
        let mut next = DocTree::from_json(json)?;
        let tick = &mut self.tick;
        let replica = &self.replica;
        let mut clock = || {
            *tick += 1;
            Timestamp::new(0, *tick, 0, replica)
        };
        let ops = match &self.tree {
            Some(previous) => {
                diff_to_patches(previous, &mut next, &mut clock, &mut self.ids, options)?
            }
            None => initial_to_patches(&mut next, &self.root, &mut clock, &mut self.ids)?,
        };
        self.tree = Some(next);
        self.record(&ops);
        Ok(ops)
    }

    /// Deletes the document.
    pub fn delete(&mut self) -> CoreResult<Vec<Operation>> {
        let Some(tree) = self.tree.take() else {
            return Ok(Vec::new());
        };
        let tick = &mut self.tick;
        let replica = &self.replica;
        let mut clock = || {
            *tick += 1;
            Timestamp::new(0, *tick, 0, replica)
        };
        let ops = delete_patches(&tree, &mut clock)?;
        self.record(&ops);
        Ok(ops)
    }

    /// Issues the next timestamp of this writer's clock.
    pub fn next_timestamp(&mut self) -> Timestamp {
        self.tick += 1;
        Timestamp::new(0, self.tick, 0, &self.replica)
    }

    /// The document root.
    pub fn root(&self) -> &Oid {
        &self.root
    }

    /// The latest identified tree.
    pub fn tree(&self) -> Option<&DocTree> {
        self.tree.as_ref()
    }

    /// Views after every write so far.
    pub fn views(&self) -> &ViewMap {
        &self.views
    }

    /// Every operation written, in timestamp order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// The document assembled from the views.
    pub fn current(&self) -> Option<JsonValue> {
        materialize(&self.root, &self.views)
    }

    fn record(&mut self, ops: &[Operation]) {
        apply_to_views(&mut self.views, ops);
        self.operations.extend_from_slice(ops);
    }
}
