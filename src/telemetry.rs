//! Inference telemetry
//!
//! Per-request latency and outcome measurements. The recorder is picked once
//! at startup: Prometheus when a listen address is configured, otherwise a
//! no-op. Recording never blocks and never fails the request.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::config::TelemetryConfig;

pub const INFERENCE_DURATION_MS: &str = "inference_duration_ms";
pub const INFERENCE_COUNT: &str = "inference_count";
pub const INFERENCE_ERROR_COUNT: &str = "inference_error_count";

/// Sink for per-request inference measurements
pub trait InferenceTelemetry: Send + Sync {
    fn record_success(&self, duration_ms: f64, item_count: usize);

    fn record_error(&self, error_kind: &str);
}

/// Used when no telemetry backend is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl InferenceTelemetry for NoopTelemetry {
    fn record_success(&self, _duration_ms: f64, _item_count: usize) {}

    fn record_error(&self, _error_kind: &str) {}
}

/// Records through the `metrics` facade, exported by Prometheus
#[derive(Debug, Clone)]
pub struct PrometheusTelemetry {
    endpoint: &'static str,
}

impl PrometheusTelemetry {
    pub fn new(endpoint: &'static str) -> Self {
        Self { endpoint }
    }
}

impl InferenceTelemetry for PrometheusTelemetry {
    fn record_success(&self, duration_ms: f64, item_count: usize) {
        metrics::histogram!(
            INFERENCE_DURATION_MS,
            "endpoint" => self.endpoint,
            "outcome" => "success"
        )
        .record(duration_ms);
        metrics::counter!(
            INFERENCE_COUNT,
            "endpoint" => self.endpoint,
            "outcome" => "success",
            "item_count" => item_count.to_string()
        )
        .increment(1);
    }

    fn record_error(&self, error_kind: &str) {
        metrics::counter!(
            INFERENCE_ERROR_COUNT,
            "endpoint" => self.endpoint,
            "outcome" => "error",
            "error_kind" => error_kind.to_string()
        )
        .increment(1);
    }
}

/// Build the telemetry recorder for `endpoint`.
///
/// With a connection string, installs the global Prometheus exporter
/// listening on that address. Must run inside the tokio runtime.
pub fn init_telemetry(config: &TelemetryConfig, endpoint: &'static str) -> Result<Arc<dyn InferenceTelemetry>> {
    let Some(connection) = config.connection_string.as_deref() else {
        info!("Telemetry disabled: no connection string configured");
        return Ok(Arc::new(NoopTelemetry));
    };

    let addr: SocketAddr = connection
        .parse()
        .with_context(|| format!("Invalid telemetry listen address: {}", connection))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Prometheus metrics exported on http://{}/metrics", addr);
    Ok(Arc::new(PrometheusTelemetry::new(endpoint)))
}
