//! Sets up tracing for the ingest engine, either to stdout or an OTLP collector

use opentelemetry::trace::TraceContextExt;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::Config as TraceConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::prelude::*;

use crate::conf::Tracing;

/// Get the current trace id, if any span is active
#[must_use]
pub fn get_trace() -> Option<String> {
    let context = Span::current().context();
    let span = context.span();
    let span_context = span.span_context();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

/// Setup our OTLP/gRPC tracer on top of the local stdout registry
///
/// # Arguments
///
/// * `name` - The name of the service to trace
/// * `endpoint` - The OTLP collector endpoint to send spans too
/// * `filter` - The level filter to apply to the stdout layer
fn setup_otlp(name: &str, endpoint: &str, filter: tracing_subscriber::filter::LevelFilter) {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            TraceConfig::default().with_resource(Resource::new(vec![KeyValue::new(
                SERVICE_NAME,
                name.to_string(),
            )])),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .expect("failed to install otlp tracer");
    let otlp_layer = tracing_opentelemetry::layer().with_tracer(tracer);
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .with(otlp_layer)
        .try_init()
        .expect("failed to register otlp tracing subscriber");
}

/// Setup the correct tracer for this process
///
/// # Arguments
///
/// * `name` - The name of the service to trace, e.g. `ingest-engine` or `ingest-worker`
/// * `conf` - The tracing settings to use
pub fn setup(name: &str, conf: &Tracing) {
    let filter = conf.level.to_filter();
    match &conf.otlp_endpoint {
        Some(endpoint) => setup_otlp(name, endpoint, filter),
        None => tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(filter))
            .try_init()
            .expect("failed to register stdout tracing subscriber"),
    }
}
