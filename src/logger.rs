use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{KeyValue, global};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider};
use scan_plugin::{ExecutionResult, TaskStatus};
use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub const SERVICE_NAME: &str = "scanhost";

/// Where engine logs go.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// An `EnvFilter` directive, e.g. `info` or `scanhost=debug,plugin=trace`.
    pub log_level: String,
    /// When set, logs go to `<log_dir>/scanhost.log` and task events to
    /// `<log_dir>/tasks.json` instead of stderr.
    pub log_dir: Option<PathBuf>,
    /// OTLP/HTTP endpoint; takes precedence over `log_dir`.
    pub otel_endpoint: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), log_dir: None, otel_endpoint: None }
    }
}

/// Keeps the OpenTelemetry providers alive; flushes them on [`TelemetryGuard::shutdown`].
#[derive(Default)]
pub struct TelemetryGuard {
    providers: Option<(SdkLoggerProvider, SdkTracerProvider, SdkMeterProvider)>,
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let Some((logs, traces, metrics)) = self.providers {
            let _ = logs.shutdown();
            let _ = traces.shutdown();
            let _ = metrics.shutdown();
        }
    }
}

/// Install the global `tracing` subscriber.
pub fn init_tracing(cfg: &LogConfig) -> Result<TelemetryGuard> {
    if let Some(endpoint) = cfg.otel_endpoint.as_deref() {
        return init_otel(&cfg.log_level, endpoint);
    }
    if let Some(dir) = cfg.log_dir.as_ref() {
        init_files(&cfg.log_level, dir.clone())?;
        return Ok(TelemetryGuard::default());
    }

    Registry::default()
        .with(EnvFilter::new(&cfg.log_level))
        .with(fmt::layer().with_writer(std::io::stderr).with_thread_names(true))
        .try_init()
        .context("tracing subscriber already installed")?;
    Ok(TelemetryGuard::default())
}

fn init_files(log_level: &str, dir: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    // 1) plain text log of everything the filter lets through
    let txt_appender = RollingFileAppender::new(Rotation::DAILY, &dir, "scanhost.log");
    let txt_layer = fmt::layer()
        .with_writer(txt_appender)
        .with_ansi(false)
        .with_filter(EnvFilter::new(log_level));

    // 2) newline-delimited JSON of per-task events only
    let json_appender = RollingFileAppender::new(Rotation::DAILY, &dir, "tasks.json");
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new("task=info"));

    Registry::default()
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .context("tracing subscriber already installed")?;
    Ok(())
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();

fn resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_otel(log_level: &str, endpoint: &str) -> Result<TelemetryGuard> {
    // 1) bring up the three SDKs
    let log_exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("building OTLP log exporter")?;
    let logger_provider = SdkLoggerProvider::builder()
        .with_batch_exporter(log_exporter)
        .with_resource(resource())
        .build();

    let span_exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("building OTLP span exporter")?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(span_exporter)
        .with_resource(resource())
        .build();

    let metric_exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("building OTLP metric exporter")?;
    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .with_resource(resource())
        .build();

    // 2) bridge tracing events into OTel logs, minus the exporter's own chatter
    let otel_filter = EnvFilter::new(log_level)
        .add_directive("hyper=off".parse()?)
        .add_directive("tonic=off".parse()?)
        .add_directive("h2=off".parse()?)
        .add_directive("reqwest=off".parse()?);
    let otel_layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(otel_filter);

    // 3) keep a local printer
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_filter(EnvFilter::new(log_level));

    Registry::default()
        .with(otel_layer)
        .with(fmt_layer)
        .try_init()
        .context("tracing subscriber already installed")?;

    // 4) register globally so TaskMetrics picks the real meter up
    global::set_tracer_provider(tracer_provider.clone());
    global::set_meter_provider(meter_provider.clone());

    Ok(TelemetryGuard { providers: Some((logger_provider, tracer_provider, meter_provider)) })
}

/// Counters recorded by the scheduler for every task.
///
/// Built from the global meter, so they are no-ops until an OTLP provider is installed.
#[derive(Clone)]
pub struct TaskMetrics {
    started: Counter<u64>,
    succeeded: Counter<u64>,
    failed: Counter<u64>,
    timed_out: Counter<u64>,
    rejected: Counter<u64>,
    latency_ms: Histogram<f64>,
}

impl std::fmt::Debug for TaskMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TaskMetrics")
    }
}

impl Default for TaskMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskMetrics {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            started: meter.u64_counter("tasks_started").with_description("Tasks admitted").build(),
            succeeded: meter.u64_counter("tasks_succeeded").build(),
            failed: meter.u64_counter("tasks_failed").build(),
            timed_out: meter.u64_counter("tasks_timed_out").build(),
            rejected: meter
                .u64_counter("tasks_rejected")
                .with_description("Submissions refused by admission control")
                .build(),
            latency_ms: meter
                .f64_histogram("task_latency_ms")
                .with_description("Wall time per task")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn started(&self, plugin_id: &str) {
        self.started.add(1, &[KeyValue::new("plugin_id", plugin_id.to_string())]);
    }

    pub fn rejected(&self, plugin_id: &str) {
        self.rejected.add(1, &[KeyValue::new("plugin_id", plugin_id.to_string())]);
        tracing::event!(target: "task", tracing::Level::INFO, plugin_id, status = "rejected");
    }

    /// Record a finished task and emit one `task` event for the JSON log.
    pub fn finished(&self, result: &ExecutionResult) {
        let attrs = [KeyValue::new("plugin_id", result.plugin_id.clone())];
        match result.status {
            TaskStatus::Completed if result.success => self.succeeded.add(1, &attrs),
            TaskStatus::TimedOut => self.timed_out.add(1, &attrs),
            _ => self.failed.add(1, &attrs),
        }
        self.latency_ms.record(result.execution_time_ms as f64, &attrs);

        tracing::event!(
            target: "task",
            tracing::Level::INFO,
            task_id = %result.task_id,
            plugin_id = %result.plugin_id,
            kind = %result.kind,
            status = %result.status,
            latency_ms = result.execution_time_ms,
            findings = result.findings.len(),
            worker_id = ?result.worker_id,
        );
    }
}
