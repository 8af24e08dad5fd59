use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

const SERVICE_NAME: &str = "sheet-dispatch";

/// Where log output goes.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub log_file: String,
    pub otel_endpoint: Option<String>,
}

impl LogConfig {
    pub fn new(log_level: impl Into<String>, log_dir: Option<PathBuf>, otel_endpoint: Option<String>) -> Self {
        Self {
            log_level: log_level.into(),
            log_dir,
            log_file: "sheet-dispatch.log".to_string(),
            otel_endpoint,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info", None, None)
    }
}

/// Keeps the OTLP providers alive; flushes them on `shutdown`.
#[derive(Default)]
pub struct TelemetryGuard {
    logger_provider: Option<SdkLoggerProvider>,
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let Some(p) = self.logger_provider {
            if let Err(e) = p.shutdown() {
                error!("log provider shutdown failed: {e}");
            }
        }
        if let Some(p) = self.tracer_provider {
            if let Err(e) = p.shutdown() {
                error!("tracer provider shutdown failed: {e}");
            }
        }
        if let Some(p) = self.meter_provider {
            if let Err(e) = p.shutdown() {
                error!("meter provider shutdown failed: {e}");
            }
        }
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber: stdout, an optional daily rolling file under
/// `log_dir`, and OTLP export of logs, traces and metrics when an endpoint is
/// configured.
pub fn init_tracing(config: &LogConfig) -> Result<TelemetryGuard> {
    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_filter(env_filter(&config.log_level));

    let file_layer = match &config.log_dir {
        Some(dir) => Some(file_layer(dir, &config.log_file, &config.log_level)?),
        None => None,
    };

    let mut guard = TelemetryGuard::default();
    let otel_layer = match &config.otel_endpoint {
        Some(endpoint) => {
            let logger_provider = init_logs(endpoint)?;
            let tracer_provider = init_traces(endpoint)?;
            let meter_provider = init_metrics(endpoint)?;

            let filter = env_filter(&config.log_level)
                .add_directive("hyper=off".parse()?)
                .add_directive("tonic=off".parse()?)
                .add_directive("h2=off".parse()?)
                .add_directive("reqwest=off".parse()?);
            let layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(filter);

            global::set_tracer_provider(tracer_provider.clone());
            global::set_meter_provider(meter_provider.clone());

            guard.logger_provider = Some(logger_provider);
            guard.tracer_provider = Some(tracer_provider);
            guard.meter_provider = Some(meter_provider);
            Some(layer)
        }
        None => None,
    };

    Registry::default()
        .with(stdout_layer)
        .with(file_layer)
        .with(otel_layer)
        .try_init()
        .context("could not install tracing subscriber")?;

    info!(
        level = %config.log_level,
        log_dir = ?config.log_dir,
        otel = config.otel_endpoint.is_some(),
        "logging initialised"
    );
    Ok(guard)
}

fn file_layer<S>(
    dir: &Path,
    file_name: &str,
    log_level: &str,
) -> Result<impl tracing_subscriber::Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    let appender = RollingFileAppender::new(Rotation::DAILY, dir, file_name);
    Ok(fmt::layer()
        .with_writer(appender)
        .with_ansi(false)
        .with_filter(env_filter(log_level)))
}

fn init_logs(endpoint: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_traces(endpoint: &str) -> Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("span exporter")?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(endpoint: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

/// Dispatch counters & latency. Without an OTLP endpoint the global meter
/// is a no-op and these cost nothing.
#[derive(Clone)]
pub struct DispatchMetrics {
    started: Counter<u64>,
    succeeded: Counter<u64>,
    failed: Counter<u64>,
    latency_ms: Histogram<f64>,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::from_meter(global::meter(SERVICE_NAME))
    }

    fn from_meter(meter: Meter) -> Self {
        Self {
            started: meter
                .u64_counter("dispatches_started")
                .with_description("Total dispatches started")
                .build(),
            succeeded: meter.u64_counter("dispatches_succeeded").build(),
            failed: meter.u64_counter("dispatches_failed").build(),
            latency_ms: meter
                .f64_histogram("dispatch_latency_ms")
                .with_description("Fetch, prune and push latency in ms")
                .with_unit("ms")
                .build(),
        }
    }

    /// Run `handler`, counting the outcome and recording its latency.
    pub async fn instrument<F, Fut, T, E>(&self, name: &str, handler: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.started.add(1, &[]);
        let start = Instant::now();

        let result = handler().await;

        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;
        self.latency_ms.record(elapsed, &[]);
        match &result {
            Ok(_) => {
                self.succeeded.add(1, &[]);
                info!(target: "dispatch", "dispatch `{}` succeeded in {:.1} ms", name, elapsed);
            }
            Err(err) => {
                self.failed.add(1, &[]);
                error!(target: "dispatch", error = %err, "dispatch `{}` failed in {:.1} ms", name, elapsed);
            }
        }
        result
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instrument_passes_result_through() {
        let metrics = DispatchMetrics::new();
        let ok: Result<u8, String> = metrics.instrument("ok", || async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));
        let err: Result<u8, String> = metrics
            .instrument("err", || async { Err("nope".to_string()) })
            .await;
        assert_eq!(err, Err("nope".to_string()));
    }

    #[test]
    fn file_layer_creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let _layer = file_layer::<Registry>(&logs, "test.log", "debug").unwrap();
        assert!(logs.is_dir());
    }
}
