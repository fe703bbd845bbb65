//! CLI command implementations.

pub mod apply;
pub mod decode;
pub mod diff;
pub mod fold;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::path::Path;
use tidepool_core::{DocumentBaseline, Operation};

/// Baselines and operations read from a log file.
#[derive(Debug, Default, Deserialize)]
pub struct LogFile {
    /// Baselines, at most one per object.
    #[serde(default)]
    pub baselines: Vec<DocumentBaseline>,
    /// Operations in any order.
    #[serde(default)]
    pub operations: Vec<Operation>,
}

/// Reads a JSON document.
pub fn read_json(path: &Path) -> Result<JsonValue, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    Ok(serde_json::from_str(&text)?)
}

/// Reads a log file: either a bare array of operations or `{baselines, operations}`.
pub fn read_log(path: &Path) -> Result<LogFile, Box<dyn std::error::Error>> {
    let value = read_json(path)?;
    if value.is_array() {
        return Ok(LogFile {
            baselines: Vec::new(),
            operations: serde_json::from_value(value)?,
        });
    }
    Ok(serde_json::from_value(value)?)
}
