//! `sync_loadtest`
//!
//! Load test harness for the sync server, plus the `load_test` binary that
//! drives it from the command line and writes a JSON results file.
//! End-to-end tests for the client and server crates live under `tests/`.

pub mod harness;

pub use harness::{write_summary, LoadTestHarness, LoadTestSummary, TransportFactory};
