use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Result;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

use crate::batcher::FlushReason;

const SERVICE_NAME: &str = "coalescer";

/// Keeps log writers and OTLP providers alive; flushes them on drop.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
    logger_provider: Option<SdkLoggerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.meter_provider.take() {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.logger_provider.take() {
            let _ = provider.shutdown();
        }
    }
}

/// Installs the global tracing subscriber.
///
/// - `log_level` is an `EnvFilter` directive (e.g. `"info"` or `"coalescer=debug"`).
/// - `log_dir`, when set, adds a daily rolling plain-text log next to stdout.
/// - `otel_endpoint`, when set, exports logs and metrics over OTLP/gRPC.
pub fn init_tracing(
    log_level: &str,
    log_dir: Option<PathBuf>,
    otel_endpoint: Option<String>,
) -> Result<LogGuard> {
    let env_filter = EnvFilter::try_new(log_level)?;

    let stdout_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

    let (file_layer, file_guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, &dir, "coalescer.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let (logger_provider, meter_provider) = match otel_endpoint.as_deref() {
        Some(endpoint) => {
            let meter_provider = init_metrics(endpoint)?;
            global::set_meter_provider(meter_provider.clone());
            (Some(init_logs(endpoint)?), Some(meter_provider))
        }
        None => (None, None),
    };

    // the exporter's own transport must not feed back into the bridge
    let otel_layer = match logger_provider.as_ref() {
        Some(provider) => {
            let filter = EnvFilter::try_new(log_level)?
                .add_directive("hyper=off".parse()?)
                .add_directive("tonic=off".parse()?)
                .add_directive("h2=off".parse()?);
            Some(OpenTelemetryTracingBridge::new(provider).with_filter(filter))
        }
        None => None,
    };

    Registry::default()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(LogGuard {
        _file_guard: file_guard,
        logger_provider,
        meter_provider,
    })
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_logs(endpoint: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(endpoint: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

/// Counters the batcher reports through. Backed by the global meter, so they
/// are no-ops until `init_tracing` installs an OTLP provider.
#[derive(Clone)]
pub struct BatcherMetrics {
    batches_flushed: Counter<u64>,
    messages_batched: Counter<u64>,
    immediate_dispatches: Counter<u64>,
    handler_failures: Counter<u64>,
    batch_size: Histogram<u64>,
}

impl BatcherMetrics {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            batches_flushed: meter
                .u64_counter("batches_flushed")
                .with_description("Batches handed to the dispatch handlers")
                .build(),
            messages_batched: meter
                .u64_counter("messages_batched")
                .with_description("Messages absorbed into a batch")
                .build(),
            immediate_dispatches: meter
                .u64_counter("immediate_dispatches")
                .with_description("Messages dispatched without batching")
                .build(),
            handler_failures: meter
                .u64_counter("handler_failures")
                .build(),
            batch_size: meter
                .u64_histogram("batch_size")
                .with_description("Messages per flushed batch")
                .build(),
        }
    }

    pub fn batch_flushed(&self, reason: FlushReason, size: usize) {
        let reason: &'static str = reason.into();
        self.batches_flushed.add(1, &[KeyValue::new("reason", reason)]);
        self.batch_size.record(size as u64, &[]);
    }

    pub fn message_batched(&self) {
        self.messages_batched.add(1, &[]);
    }

    pub fn immediate_dispatch(&self) {
        self.immediate_dispatches.add(1, &[]);
    }

    pub fn handler_failed(&self, handler: &str) {
        self.handler_failures
            .add(1, &[KeyValue::new("handler", handler.to_string())]);
    }
}

impl Default for BatcherMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BatcherMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BatcherMetrics")
    }
}
