// lib.rs — Exposes internal modules for integration tests and embedders.
//
// The CLI entry point lives in main.rs and pulls everything through this
// crate root.

pub mod baseline;
pub mod config_snapshot;
pub mod document;
pub mod engine;
pub mod error;
pub mod invocation;
pub mod process_runner;
pub mod review_cache;
pub mod reviewer;
pub mod runner;
pub mod runners;
pub mod stats;
