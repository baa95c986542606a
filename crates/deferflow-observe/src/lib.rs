//! Observability setup for deferflow.
//!
//! The engine crates emit `tracing` events but never install subscribers;
//! the embedding binary or test harness calls into this crate once at
//! startup, and optionally wraps each manager run in a span.

pub mod spans;
pub mod tracing_setup;

pub use spans::flow_run_span;
pub use tracing_setup::{init_test_tracing, init_tracing, shutdown_tracing};
