//! Tracing subscriber initialization for workflow execution.
//!
//! The engine crates emit structured events -- run boundaries, per-job
//! scheduling decisions, graft renames, store writes and splits -- but never
//! install subscribers. This module is where an embedding binary or test
//! harness turns those events into collected output:
//!
//! - [`init_tracing`] -- process-wide setup: fmt layer, engine-focused env
//!   filtering, optional OpenTelemetry export under the `deferflow` service
//!   resource.
//! - [`init_test_tracing`] -- idempotent, capture-per-test setup for
//!   harnesses that run many executions in one process.
//! - [`shutdown_tracing`] -- flush buffered spans before exit.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use std::sync::OnceLock;

/// Filter applied when `RUST_LOG` is unset: the engine and its backends at
/// debug, so scheduling decisions and store writes are visible, everything
/// else at warn.
pub const ENGINE_FILTER: &str = "warn,deferflow_core=debug,deferflow_store=debug";

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

fn engine_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(ENGINE_FILTER))
}

/// Initialize the global tracing subscriber for a process embedding the
/// engine.
///
/// - Always installs a structured `fmt` layer with target visibility and
///   span close timing, so `flow_run` spans report their duration.
/// - `RUST_LOG` overrides the filter; without it, [`ENGINE_FILTER`] keeps
///   the engine loud and dependencies quiet.
/// - When `enable_otel` is true, additionally bridges tracing spans to
///   OpenTelemetry under a `deferflow` service resource, using a stdout
///   exporter (suitable for local development; swap the exporter for OTLP
///   in production).
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set or if
/// the OTel pipeline fails to initialize.
pub fn init_tracing(enable_otel: bool) -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    if enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_resource(Resource::builder().with_service_name("deferflow").build())
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("deferflow-manager");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        // Store the provider for shutdown and register it globally.
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        tracing_subscriber::registry()
            .with(engine_filter())
            .with(fmt_layer)
            .with(otel_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(engine_filter())
            .with(fmt_layer)
            .init();
    }

    Ok(())
}

/// Initialize tracing for a test harness.
///
/// Uses the per-test capture writer so each test's engine events show up in
/// its own failure output, and the engine filter so scheduling and store
/// events are recorded. Idempotent: every test can call it, the first wins.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(engine_filter())
        .with_test_writer()
        .try_init();
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// Call this before process exit to ensure all buffered spans are exported.
/// Safe to call even when OTel was not enabled (no-op in that case).
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
