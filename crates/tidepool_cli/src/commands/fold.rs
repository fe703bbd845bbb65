//! Fold command implementation.

use super::LogFile;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::Path;
use tidepool_core::{fold_into, DocumentBaseline, Operation, Timestamp};

/// Result of folding a log.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FoldReport {
    /// Objects whose baseline changed.
    pub objects: usize,
    /// Operations folded away.
    pub folded: usize,
    /// Objects that still hold operations at or after the acknowledgement.
    pub hard_stopped: usize,
    /// References detached by the folded operations.
    pub detached: Vec<JsonValue>,
    /// Baselines after folding.
    pub baselines: Vec<DocumentBaseline>,
    /// Operations left in the log.
    pub operations: Vec<Operation>,
}

/// Runs the fold command.
pub fn run(log: &Path, ack: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let log = super::read_log(log)?;
    let ack = Timestamp::from_raw(ack);
    ack.parts()?;
    let report = fold(log, &ack);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            println!("Fold up to {ack}");
            println!("================");
            println!("  Objects changed:  {}", report.objects);
            println!("  Folded:           {}", report.folded);
            println!("  Hard stops:       {}", report.hard_stopped);
            println!("  Detached refs:    {}", report.detached.len());
            println!("  Baselines:        {}", report.baselines.len());
            println!("  Remaining:        {}", report.operations.len());
        }
    }

    Ok(())
}

/// Folds every operation older than `ack` into its object's baseline.
pub fn fold(log: LogFile, ack: &Timestamp) -> FoldReport {
    let mut baselines: BTreeMap<_, _> = log
        .baselines
        .into_iter()
        .map(|baseline| (baseline.oid.clone(), baseline))
        .collect();
    let mut operations = log.operations;
    let summary = fold_into(&mut baselines, &mut operations, ack);

    FoldReport {
        objects: summary.objects,
        folded: summary.folded,
        hard_stopped: summary.hard_stopped,
        detached: summary.detached.iter().map(|r| r.to_json()).collect(),
        baselines: baselines.into_values().collect(),
        operations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidepool_core::{Oid, OperationData};

    fn ts(n: u64) -> Timestamp {
        Timestamp::new(0, n, 0, "r")
    }

    #[test]
    fn folds_up_to_ack() {
        let doc = Oid::new("notes", "n1");
        let log = LogFile {
            baselines: Vec::new(),
            operations: vec![
                Operation::new(doc.clone(), ts(1), OperationData::Initialize {
                    value: json!({}),
                }),
                Operation::new(doc.clone(), ts(2), OperationData::Set {
                    name: "a".into(),
                    value: json!(1),
                }),
                Operation::new(doc.clone(), ts(9), OperationData::Set {
                    name: "b".into(),
                    value: json!(2),
                }),
            ],
        };
        let report = fold(log, &ts(5));
        assert_eq!(report.folded, 2);
        assert_eq!(report.objects, 1);
        assert_eq!(report.hard_stopped, 1);
        assert_eq!(report.baselines[0].snapshot, json!({"a": 1}));
        assert_eq!(report.baselines[0].timestamp, ts(2));
        assert_eq!(report.operations.len(), 1);
    }

    #[test]
    fn report_serializes_in_camel_case() {
        let report = fold(LogFile::default(), &ts(1));
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["hardStopped"], 0);
        assert!(value["operations"].as_array().unwrap().is_empty());
    }
}
