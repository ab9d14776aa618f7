//! Logging and metrics export setup
//!
//! Provides:
//! - text (`fmt`) or JSON structured logging through `tracing-subscriber`
//! - log level from `--log-level` / `LOG_LEVEL`, overridable by `RUST_LOG`
//! - OTLP metrics export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set

use std::str::FromStr;

use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, Resource};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::{Error, Result};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text with full timestamps, no colors
    #[default]
    Fmt,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    /// Parse a format name, falling back to `fmt` for unknown values
    pub fn parse_lenient(value: &str) -> (Self, bool) {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "fmt" | "text" => (Self::Fmt, true),
            "json" => (Self::Json, true),
            _ => (Self::Fmt, false),
        }
    }
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for exported metrics
    pub service_name: String,

    /// Log format name as given by the user (`fmt` or `json`)
    pub log_format: String,

    /// Log level name (`trace`, `debug`, `info`, `warn`, `error`)
    pub log_level: String,

    /// OTLP endpoint for metric export (e.g., "http://otel-collector:4317")
    /// If None, metrics are recorded against a no-op provider
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: env!("CARGO_PKG_NAME").to_string(),
            log_format: "fmt".to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        }
    }
}

/// Parse a log level name
pub fn parse_log_level(level: &str) -> Result<LevelFilter> {
    LevelFilter::from_str(level.trim())
        .map_err(|e| Error::configuration(format!("invalid log level '{}': {}", level, e)))
}

/// Initialize logging and metrics export
///
/// Fails on an invalid log level or when a global subscriber is already set.
/// An unknown log format is not fatal; it is reported and `fmt` is used.
pub fn init_telemetry(config: TelemetryConfig) -> Result<()> {
    let level = parse_log_level(&config.log_level)?;
    let (format, known_format) = LogFormat::parse_lenient(&config.log_format);

    if let Some(endpoint) = &config.otlp_endpoint {
        init_otlp_metrics(endpoint, build_resource(&config.service_name))?;
    }

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let fmt_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed(),
        LogFormat::Fmt => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| Error::configuration(format!("failed to initialize logging: {}", e)))?;

    if !known_format {
        warn!(
            log_format = %config.log_format,
            "Log format not supported - using default fmt"
        );
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        log_level = %level,
        "Log level set"
    );
    Ok(())
}

/// Build OpenTelemetry resource with service info and K8s detection
fn build_resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_string(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ];

    // Set via the Deployment downward API
    if let Ok(pod_name) = std::env::var("POD_NAME") {
        attributes.push(KeyValue::new("k8s.pod.name", pod_name));
    }
    if let Ok(namespace) = std::env::var("POD_NAMESPACE") {
        attributes.push(KeyValue::new("k8s.namespace.name", namespace));
    }
    if let Ok(node_name) = std::env::var("NODE_NAME") {
        attributes.push(KeyValue::new("k8s.node.name", node_name));
    }

    Resource::new(attributes)
}

/// Initialize OTLP metrics exporter with periodic push
fn init_otlp_metrics(endpoint: &str, resource: Resource) -> Result<()> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| {
            Error::configuration(format!("failed to initialize metrics exporter: {}", e))
        })?;

    let reader =
        opentelemetry_sdk::metrics::PeriodicReader::builder(exporter, runtime::Tokio).build();

    let meter_provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(meter_provider);

    Ok(())
}
