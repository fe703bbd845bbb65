//! Shared helpers for the Tidepool benchmarks.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod utils;
