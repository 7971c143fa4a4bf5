use std::time::Duration;

use opentelemetry::trace::{TraceContextExt, TraceError, TraceId, TracerProvider};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::Resource;
use serde::Serialize;
use thiserror::Error;
use tracing::dispatcher::SetGlobalDefaultError;
use tracing_opentelemetry::{OpenTelemetryLayer, OpenTelemetrySpanExt};
use tracing_subscriber::{prelude::*, EnvFilter};

const SERVICE_NAME: &str = "helmop";
const OTLP_EXPORT_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_EVENTS_PER_SPAN: u32 = 16;
const MAX_ATTRIBUTES_PER_SPAN: u32 = 16;

/// Errors during logging/tracing initialization.
#[derive(Error, Debug)]
pub enum Error {
    #[error("TraceError: {0}")]
    TraceError(#[source] TraceError),

    #[error("SetGlobalDefaultError: {0}")]
    SetGlobalDefaultError(#[source] SetGlobalDefaultError),
}

/// The [`TraceId`] of the active span, via its OpenTelemetry context.
/// Yields the invalid trace id when tracing is not initialized, which
/// the metrics exemplars treat as "no exemplar".
pub fn get_trace_id() -> TraceId {
    let context = tracing::Span::current().context();
    let span = context.span();
    span.span_context().trace_id()
}

/// Log output format, selectable from the command line.
#[derive(clap::ValueEnum, Clone, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON-formatted log output.
    Json,

    /// Plain-text log output.
    Text,
}

/// Initialize the global subscriber: an env-filtered log layer in the
/// chosen format, plus an OTLP/gRPC trace layer when `tracing_url` is
/// set. Traces are sampled at `trace_ratio` (1.0 samples everything).
///
/// # Example
///
/// ```rust
/// # use helmop_operator::telemetry::{init, LogFormat};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let tracing_url = std::env::var("OPENTELEMETRY_ENDPOINT_URL").ok();
///     init("info", LogFormat::Text, tracing_url.as_deref(), 0.1).await?;
///     Ok(())
/// }
/// ```
pub async fn init(
    log_filter: &str,
    log_format: LogFormat,
    tracing_url: Option<&str>,
    trace_ratio: f64,
) -> Result<(), Error> {
    let logger = match log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().compact().boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().compact().boxed(),
    };
    let telemetry = tracing_url
        .map(|url| build_tracer(url, trace_ratio).map(OpenTelemetryLayer::new))
        .transpose()?;

    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::new(log_filter))
        .with(logger)
        .with(telemetry);
    tracing::subscriber::set_global_default(subscriber).map_err(Error::SetGlobalDefaultError)
}

/// Batch-exporting OTLP tracer with ratio-based sampling, identified as
/// this service. Must run inside the Tokio runtime.
fn build_tracer(url: &str, trace_ratio: f64) -> Result<Tracer, Error> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(url)
        .with_timeout(OTLP_EXPORT_TIMEOUT);
    let config = trace::Config::default()
        .with_sampler(Sampler::TraceIdRatioBased(trace_ratio))
        .with_id_generator(RandomIdGenerator::default())
        .with_max_events_per_span(MAX_EVENTS_PER_SPAN)
        .with_max_attributes_per_span(MAX_ATTRIBUTES_PER_SPAN)
        .with_resource(Resource::new([
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]));
    let provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(config)
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .map_err(Error::TraceError)?;
    Ok(provider
        .tracer_builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .build())
}

#[cfg(all(test, feature = "integration-tests"))]
mod test {
    // Requires OPENTELEMETRY_ENDPOINT_URL pointing at a live collector.
    #[tokio::test]
    async fn integration_get_trace_id_returns_valid_traces() {
        use super::*;
        let tracing_url = std::env::var("OPENTELEMETRY_ENDPOINT_URL").ok();
        super::init("info", LogFormat::Text, tracing_url.as_deref(), 0.1)
            .await
            .unwrap();
        #[tracing::instrument(name = "test_span")]
        fn test_trace_id() -> TraceId {
            get_trace_id()
        }
        assert_ne!(test_trace_id(), TraceId::INVALID, "valid trace");
    }
}
