//! # Tidepool Testkit
//!
//! Test utilities for Tidepool.
//!
//! This crate provides:
//! - Property-based test generators for documents, lists and nonces
//! - A deterministic document writer that records the operations of every edit
//! - Helpers to materialize documents from per-object views
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tidepool_testkit::prelude::*;
//!
//! let mut writer = DocumentWriter::new(doc_oid(), "r");
//! writer.write(&serde_json::json!({"title": "a"})).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Common imports for tests.
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::{doc_oid, materialize, sample_documents, tick_clock, DocumentWriter};
pub use generators::PropTestConfig;
