//! Benchmark utilities.

use rand::Rng;
use serde_json::{json, Map, Value as JsonValue};
use tidepool_core::{
    diff_to_patches, initial_to_patches, CoreResult, DiffOptions, DocTree, Oid, Operation,
    SequentialSubIds, Timestamp,
};

/// Root of the benchmark document.
pub fn bench_oid() -> Oid {
    Oid::new("bench", "doc")
}

/// Generate a random document with `width` fields per object, nested `depth` levels.
pub fn random_document(width: usize, depth: usize) -> JsonValue {
    let mut rng = rand::thread_rng();
    random_object(&mut rng, width, depth)
}

fn random_object(rng: &mut impl Rng, width: usize, depth: usize) -> JsonValue {
    let mut fields = Map::new();
    for i in 0..width {
        let value = match rng.gen_range(0..4) {
            0 if depth > 0 => random_object(rng, width, depth - 1),
            1 if depth > 0 => JsonValue::Array(
                (0..width)
                    .map(|_| random_object(rng, width.min(2), depth - 1))
                    .collect(),
            ),
            2 => JsonValue::from(rng.gen_range(0..1000)),
            _ => JsonValue::from(format!("value-{}", rng.gen_range(0..100))),
        };
        fields.insert(format!("field_{i}"), value);
    }
    JsonValue::Object(fields)
}

/// Change roughly one field in `every` of a document, recursively.
pub fn mutate(doc: &JsonValue, every: u32) -> JsonValue {
    let mut rng = rand::thread_rng();
    mutate_value(&mut rng, doc, every)
}

fn mutate_value(rng: &mut impl Rng, value: &JsonValue, every: u32) -> JsonValue {
    match value {
        JsonValue::Object(fields) => JsonValue::Object(
            fields
                .iter()
                .map(|(key, child)| (key.clone(), mutate_value(rng, child, every)))
                .collect(),
        ),
        JsonValue::Array(items) => JsonValue::Array(
            items
                .iter()
                .map(|child| mutate_value(rng, child, every))
                .collect(),
        ),
        _ if rng.gen_ratio(1, every.max(1)) => json!(rng.gen_range(0..1000)),
        scalar => scalar.clone(),
    }
}

/// A document holding one list of `len` small objects.
pub fn list_document(len: usize) -> JsonValue {
    json!({ "items": (0..len).map(|n| json!({"n": n})).collect::<Vec<_>>() })
}

/// Identify a document under [`bench_oid`].
pub fn identified(doc: &JsonValue) -> CoreResult<DocTree> {
    let mut ids = SequentialSubIds::new("b");
    DocTree::from_json_with_oids(doc, &bench_oid(), &mut ids)
}

/// Write each version in turn and return every operation produced.
pub fn write_history(versions: &[JsonValue]) -> CoreResult<Vec<Operation>> {
    let mut tick = 0;
    let mut clock = || {
        tick += 1;
        Timestamp::new(0, tick, 0, "bench")
    };
    let mut ids = SequentialSubIds::new("h");
    let mut operations = Vec::new();
    let mut previous: Option<DocTree> = None;
    for version in versions {
        let mut next = DocTree::from_json(version)?;
        let ops = match &previous {
            Some(from) => {
                diff_to_patches(from, &mut next, &mut clock, &mut ids, &DiffOptions::default())?
            }
            None => initial_to_patches(&mut next, &bench_oid(), &mut clock, &mut ids)?,
        };
        operations.extend(ops);
        previous = Some(next);
    }
    Ok(operations)
}
