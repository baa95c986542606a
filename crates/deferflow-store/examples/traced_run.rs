//! Run a small two-job flow with tracing collection enabled.
//!
//! ```text
//! RUST_LOG=deferflow_core=debug cargo run -p deferflow-store --example traced_run
//! cargo run -p deferflow-store --example traced_run -- --otel
//! ```

use std::sync::Arc;

use deferflow_core::Manager;
use deferflow_core::registry::{FunctionInput, FunctionRegistry};
use deferflow_core::store::job_store::JobStore;
use deferflow_store::MemoryDocStore;
use deferflow_types::{Flow, FlowOrder, FunctionToken, Job, Response};
use serde_json::{Map, json};
use tracing::Instrument;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // `--otel` additionally exports spans to stdout
    let enable_otel = std::env::args().any(|arg| arg == "--otel");
    deferflow_observe::init_tracing(enable_otel)?;

    let mut registry = FunctionRegistry::new();
    registry.register_fn(
        FunctionToken::new("math", "add"),
        |input: FunctionInput<'_>| {
            let a = input.arg(0).as_i64().unwrap_or(0);
            let b = input.arg(1).as_i64().unwrap_or(0);
            Ok(Response::from_output(json!(a + b)))
        },
    );

    let j1 = Job::new(
        FunctionToken::new("math", "add"),
        vec![json!(1), json!(2)],
        Map::new(),
    );
    let j2 = Job::new(
        FunctionToken::new("math", "add"),
        vec![j1.output().to_value(), json!(3)],
        Map::new(),
    );
    let total = j2.output();
    let flow = Flow::new("sum", vec![j1.into(), j2.into()], None, FlowOrder::Auto)?;

    let store = JobStore::new(Arc::new(MemoryDocStore::new()));
    let mut manager = Manager::new(store, registry);
    let span = deferflow_observe::flow_run_span("sum", 2);
    let report = manager.run(flow).instrument(span).await?;

    println!("total = {:?}", report.output_of(total.uuid()));

    deferflow_observe::shutdown_tracing();
    Ok(())
}
