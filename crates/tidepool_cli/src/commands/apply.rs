//! Apply command implementation.

use super::LogFile;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::path::Path;
use tidepool_core::{apply_to_views, DocTree, Oid, Operation, ViewMap};
use tracing::warn;

/// Runs the apply command.
pub fn run(log: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let log = super::read_log(log)?;
    let documents = materialize(&log);

    match format {
        "text" => {
            println!("Documents ({} total)", documents.len());
            println!("================");
            println!();
            for (oid, document) in &documents {
                println!("{oid}  {document}");
            }
        }
        _ => {
            let object: Map<String, JsonValue> = documents
                .into_iter()
                .map(|(oid, document)| (oid.to_string(), document))
                .collect();
            println!("{}", serde_json::to_string_pretty(&object)?);
        }
    }

    Ok(())
}

/// Replays a log and assembles every live document.
///
/// Operations already covered by their object's baseline are skipped.
/// Documents whose views do not assemble are reported and left out.
pub fn materialize(log: &LogFile) -> BTreeMap<Oid, JsonValue> {
    let mut views = ViewMap::new();
    let mut covered = BTreeMap::new();
    for baseline in &log.baselines {
        if let Some(view) = baseline.view() {
            views.insert(baseline.oid.clone(), view.clone());
        }
        covered.insert(baseline.oid.clone(), baseline.timestamp.clone());
    }

    let mut operations: Vec<&Operation> = log
        .operations
        .iter()
        .filter(|op| covered.get(&op.oid).map_or(true, |ts| op.timestamp > *ts))
        .collect();
    operations.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    let operations: Vec<Operation> = operations.into_iter().cloned().collect();
    apply_to_views(&mut views, &operations);

    let mut documents = BTreeMap::new();
    for root in views.keys().filter(|oid| oid.is_root()) {
        match DocTree::from_views(root, &views) {
            Ok(Some(tree)) => {
                documents.insert(root.clone(), tree.to_json());
            }
            Ok(None) => {}
            Err(e) => warn!(oid = %root, error = %e, "skipping unreadable document"),
        }
    }
    documents
}
