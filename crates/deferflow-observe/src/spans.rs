//! Span helpers for embedding harnesses.
//!
//! The engine emits events, not spans, so that the embedding process
//! controls the span topology. Wrapping a manager run in [`flow_run_span`]
//! groups every scheduling decision, graft, and store write of one execution
//! under a single span, whose close timing the fmt layer reports.

use tracing::Span;

/// Span covering one manager run of the named flow.
pub fn flow_run_span(flow: &str, jobs: usize) -> Span {
    tracing::info_span!("flow_run", flow, jobs)
}
