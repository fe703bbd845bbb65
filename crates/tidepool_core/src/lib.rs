//! # Tidepool Core
//!
//! Document model and change engines for Tidepool.
//!
//! This crate provides:
//! - Object identifiers and logical timestamps
//! - `DocTree`, an arena of identified nodes built from JSON
//! - The diff engine (`diff_to_patches`) producing minimal operations
//! - The patch engine (`apply_patch`) and undo generation
//! - Rebase folding of acknowledged operations into baselines
//!
//! A document is stored as one view per object: the root object and every
//! nested object or list carry their own [`Oid`], and nested values are
//! replaced by references in the parent's view. Operations always target a
//! single view.
//!
//! ```rust
//! use serde_json::json;
//! use tidepool_core::{diff_to_patches, DiffOptions, DocTree, Oid, SequentialSubIds, Timestamp};
//!
//! let root = Oid::new("posts", "p1");
//! let mut ids = SequentialSubIds::new("s");
//! let before = DocTree::from_json_with_oids(&json!({"title": "a"}), &root, &mut ids).unwrap();
//! let mut after = DocTree::from_json(&json!({"title": "b"})).unwrap();
//!
//! let mut tick = 0;
//! let mut clock = || { tick += 1; Timestamp::new(0, tick, 0, "r") };
//! let ops = diff_to_patches(&before, &mut after, &mut clock, &mut ids, &DiffOptions::default()).unwrap();
//! assert_eq!(ops.len(), 1);
//! ```
//!
//! This crate performs no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod diff;
mod error;
mod oid;
mod operation;
mod patch;
mod rebase;
mod timestamp;
mod tree;

pub use diff::{delete_patches, diff_to_patches, initial_to_patches, list_patch, DiffOptions};
pub use error::{CoreError, CoreResult};
pub use oid::{Oid, RandomSubIds, SequentialSubIds, SubIdSource};
pub use operation::{
    DocumentBaseline, InsertItems, Operation, OperationData, Ref, RemoveOnly, REF_TYPE_KEY,
};
pub use patch::{
    apply_operations, apply_patch, apply_to_views, collect_refs, undo_operations, ViewMap,
};
pub use rebase::{fold_into, fold_operations, group_by_oid, FoldOutcome, RebaseSummary};
pub use timestamp::{
    HybridLogicalClock, Timestamp, TimestampParts, TimestampProvider, MAX_COUNTER,
};
pub use tree::{DocTree, NodeId, NodeKind, Value};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
