//! Tracing subscriber setup.
//!
//! The filter honours `RUST_LOG` and defaults to `info`.
use opentelemetry::sdk::trace::BatchConfig;
use opentelemetry::{global, KeyValue};

use opentelemetry::sdk::propagation::TraceContextPropagator;
use opentelemetry::sdk::{trace, Resource};
use opentelemetry_otlp::WithExportConfig;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry};

use crate::error::{Error, Result};

const SERVICE_NAME: &str = "bucket-guard";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Logs to stdout, either as human readable lines or as bunyan JSON records
pub fn initialize_subscriber(json: bool) {
    let subscriber = Registry::default().with(env_filter());
    if json {
        subscriber
            .with(JsonStorageLayer)
            .with(BunyanFormattingLayer::new(
                SERVICE_NAME.to_string(),
                std::io::stdout,
            ))
            .init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Exports spans through OTLP to `exporter_endpoint`. Must be called from within a tokio runtime.
pub fn initialize_jaeger_subscriber(exporter_endpoint: &str) -> Result<()> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(exporter_endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            trace::config().with_resource(Resource::new(vec![KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                SERVICE_NAME.to_string(),
            )])),
        )
        .with_batch_config(BatchConfig::default().with_max_queue_size(64 * 1024))
        .install_batch(opentelemetry::runtime::Tokio)
        .map_err(|e| Error::Logic {
            reason: format!("Failed to initialize the tracer: {}", e),
        })?;

    let tracing_layer = tracing_opentelemetry::layer().with_tracer(tracer);
    global::set_text_map_propagator(TraceContextPropagator::new());

    Registry::default()
        .with(env_filter())
        .with(tracing_layer)
        .with(JsonStorageLayer)
        .init();

    Ok(())
}
