//! Diff command implementation.

use serde_json::Value as JsonValue;
use std::path::Path;
use tidepool_core::{
    diff_to_patches, initial_to_patches, DiffOptions, DocTree, Oid, Operation, SequentialSubIds,
    Timestamp,
};
use tracing::debug;

/// Replica id stamped on timestamps issued by the CLI.
const CLI_REPLICA: &str = "cli";

/// Runs the diff command.
pub fn run(
    from: &Path,
    to: &Path,
    oid: &str,
    options: &DiffOptions,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let from = super::read_json(from)?;
    let to = super::read_json(to)?;
    let operations = compute(&from, &to, oid, options)?;
    debug!(count = operations.len(), "computed operations");

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&operations)?);
        }
        _ => {
            print_text_output(&operations)?;
        }
    }

    Ok(())
}

/// Computes the operations turning `from` into `to`.
///
/// Nested objects of `from` are identified deterministically, so the same
/// inputs always produce the same output. A `null` source yields the
/// operations creating the document.
pub fn compute(
    from: &JsonValue,
    to: &JsonValue,
    oid: &str,
    options: &DiffOptions,
) -> Result<Vec<Operation>, Box<dyn std::error::Error>> {
    let root = Oid::parse(oid)?;
    if !root.is_root() {
        return Err(format!("{oid} is not a document root").into());
    }
    let mut ids = SequentialSubIds::new("n");
    let mut tick = 0;
    let mut clock = || {
        tick += 1;
        Timestamp::new(0, tick, 0, CLI_REPLICA)
    };

    let mut after = DocTree::from_json(to)?;
    let operations = if from.is_null() {
        initial_to_patches(&mut after, &root, &mut clock, &mut ids)?
    } else {
        let before = DocTree::from_json_with_oids(from, &root, &mut ids)?;
        diff_to_patches(&before, &mut after, &mut clock, &mut ids, options)?
    };
    Ok(operations)
}

fn print_text_output(operations: &[Operation]) -> Result<(), Box<dyn std::error::Error>> {
    println!("Operations ({} total)", operations.len());
    println!("================");
    println!();

    for op in operations {
        println!("{}  {}", op.oid, serde_json::to_string(&op.data)?);
    }
    Ok(())
}
