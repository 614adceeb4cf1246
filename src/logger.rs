use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider};
use panel_protocol::{LogLevel, WorkerId};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

pub const LOG_FILE: &str = "labpanel.log";
pub const EVENT_FILE: &str = "labpanel_requests.log";

/// Installs the global subscriber for the supervisor process.
///
/// With an OTLP endpoint, logs and metrics are exported there and a
/// human-readable copy still goes to stdout. Without one, logs go to a daily
/// rolling text file under `log_dir` and every serviced upward request is
/// also written as one JSON line (target `request`) to a second file.
pub fn init_tracing(log_dir: &Path, log_level: LogLevel, otel_endpoint: Option<&str>) -> Result<()> {
    match otel_endpoint {
        Some(endpoint) => Telemetry::init(log_level.as_filter(), endpoint).map(|_| ()),
        None => FileTelemetry::init_files(
            log_level.as_filter(),
            log_dir.join(LOG_FILE),
            log_dir.join(EVENT_FILE),
        ),
    }
}

/// Logging for a worker process. Stdout carries the protocol, so everything
/// goes to `<log_dir>/worker-<id>.log` (or nowhere when no dir is given).
pub fn init_worker_tracing(worker: WorkerId, log_dir: Option<&Path>, log_level: LogLevel) -> Result<()> {
    let Some(dir) = log_dir else {
        return Ok(());
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create log dir {}", dir.display()))?;
    let appender = tracing_appender::rolling::never(dir, format!("{worker}.log"));
    let layer = fmt::layer()
        .with_writer(appender)
        .with_ansi(false)
        .with_thread_names(true);
    Registry::default()
        .with(EnvFilter::new(log_level.as_filter()))
        .with(layer)
        .try_init()
        .context("a global subscriber is already installed")
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name("labpanel").build())
        .clone()
}

/// OTLP export of logs and request metrics.
pub struct Telemetry {
    pub logger_provider: SdkLoggerProvider,
    pub meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn init(log_level: &str, endpoint: &str) -> Result<Self> {
        // 1) exporters
        let log_exporter = LogExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(endpoint)
            .build()
            .context("log exporter")?;
        let metric_exporter = MetricExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(endpoint)
            .build()
            .context("metric exporter")?;

        let logger_provider = SdkLoggerProvider::builder()
            .with_batch_exporter(log_exporter)
            .with_resource(get_resource())
            .build();
        let meter_provider = SdkMeterProvider::builder()
            .with_periodic_exporter(metric_exporter)
            .with_resource(get_resource())
            .build();

        // 2) bridge tracing events into OTel logs, keep a local printer
        let otel_logs_layer = OpenTelemetryTracingBridge::new(&logger_provider)
            .with_filter(EnvFilter::new(log_level).add_directive("opentelemetry=off".parse()?));
        let fmt_layer = fmt::layer()
            .with_thread_names(true)
            .with_filter(EnvFilter::new(log_level));

        // 3) install subscriber and meter
        Registry::default()
            .with(otel_logs_layer)
            .with(fmt_layer)
            .try_init()
            .context("a global subscriber is already installed")?;
        global::set_meter_provider(meter_provider.clone());

        Ok(Telemetry {
            logger_provider,
            meter_provider,
        })
    }
}

/// File-only logs plus the JSON request log.
pub struct FileTelemetry;

impl FileTelemetry {
    /// - `log_level` is an `EnvFilter` directive (e.g. `"info"`).
    /// - `log_file` is the rolling text log.
    /// - `event_file` receives one JSON line per serviced upward request.
    pub fn init_files(log_level: &str, log_file: PathBuf, event_file: PathBuf) -> Result<()> {
        let (log_dir, log_name) = split_path(&log_file)?;
        let (event_dir, event_name) = split_path(&event_file)?;
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("cannot create log dir {}", log_dir.display()))?;

        let txt_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, log_name);
        let txt_layer = fmt::Layer::default()
            .with_writer(txt_appender)
            .with_ansi(false)
            .with_thread_names(true)
            .with_filter(EnvFilter::new(log_level));

        let json_appender = RollingFileAppender::new(Rotation::DAILY, event_dir, event_name);
        let json_layer = fmt::layer()
            .json()
            .with_writer(json_appender)
            .with_target(true)
            .with_filter(EnvFilter::new("request=info"));

        Registry::default()
            .with(txt_layer)
            .with(json_layer)
            .try_init()
            .context("a global subscriber is already installed")
    }
}

fn split_path(path: &Path) -> Result<(&Path, &std::ffi::OsStr)> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?;
    Ok((dir, name))
}

// -----------------------------------------------------------------------------
// Request metrics
// -----------------------------------------------------------------------------

/// Counters for upward requests serviced on the UI thread. Backed by the
/// global meter provider, which is a no-op unless OTLP export is configured.
pub struct RequestMetrics {
    pub requests_started: Counter<u64>,
    pub requests_succeeded: Counter<u64>,
    pub requests_failed: Counter<u64>,
    pub request_latency_ms: Histogram<f64>,
}

static METRICS: Lazy<RequestMetrics> = Lazy::new(|| {
    let meter = global::meter("labpanel");
    RequestMetrics {
        requests_started: meter
            .u64_counter("requests_started")
            .with_description("Upward requests received from workers")
            .build(),
        requests_succeeded: meter.u64_counter("requests_succeeded").build(),
        requests_failed: meter.u64_counter("requests_failed").build(),
        request_latency_ms: meter
            .f64_histogram("request_latency_ms")
            .with_description("Time spent servicing one upward request")
            .with_unit("ms")
            .build(),
    }
});

pub fn request_metrics() -> &'static RequestMetrics {
    &METRICS
}

impl RequestMetrics {
    /// Counts one serviced request and emits its JSON `request` event.
    pub fn record(&self, op: &'static str, worker: WorkerId, elapsed: Duration, ok: bool) {
        let elapsed_ms = elapsed.as_secs_f64() * 1_000.0;
        let attrs = [KeyValue::new("op", op)];
        self.requests_started.add(1, &attrs);
        self.request_latency_ms.record(elapsed_ms, &attrs);
        if ok {
            self.requests_succeeded.add(1, &attrs);
        } else {
            self.requests_failed.add(1, &attrs);
        }
        tracing::event!(
            target: "request",
            tracing::Level::INFO,
            request = op,
            worker = worker.0,
            latency_ms = elapsed_ms,
            status = if ok { "ok" } else { "error" },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_logging_without_dir_is_a_noop() {
        assert!(init_worker_tracing(WorkerId(1), None, LogLevel::Info).is_ok());
    }

    #[test]
    fn split_path_rejects_bare_root() {
        assert!(split_path(Path::new("/")).is_err());
        let (dir, name) = split_path(Path::new("/tmp/logs/a.log")).unwrap();
        assert_eq!(dir, Path::new("/tmp/logs"));
        assert_eq!(name, "a.log");
    }

    #[test]
    fn metrics_record_without_provider() {
        request_metrics().record("get_attr", WorkerId(3), Duration::from_millis(2), true);
        request_metrics().record("set_attr", WorkerId(3), Duration::from_millis(1), false);
    }
}
