//! # Metrics Collection
//!
//! Counters on the `metrics` facade. Recording is a no-op until a recorder is
//! installed, so library code records unconditionally; the long-running
//! commands install the Prometheus exporter through [`init_metrics`].

use crate::config::ObservabilityConfig;
use crate::errors::{Result, SealplaneError};
use ::tracing::{info, warn};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

pub const CLOUD_MUTATIONS: &str = "sealplane_cloud_mutations_total";
pub const RECONCILE_RUNS: &str = "sealplane_reconcile_runs_total";
pub const UNSEAL_ATTEMPTS: &str = "sealplane_unseal_attempts_total";
pub const SECRET_SYNCS: &str = "sealplane_secret_sync_total";
pub const SYNC_FAILING_PATHS: &str = "sealplane_secret_sync_failing_paths";

/// Metrics recorder that tracks application metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    pub fn new() -> Self {
        Self
    }

    pub fn register(&self) {
        describe_counter!(CLOUD_MUTATIONS, "Mutating cloud calls issued, by kind and result");
        describe_counter!(RECONCILE_RUNS, "Plan and apply runs, by operation and result");
        describe_counter!(UNSEAL_ATTEMPTS, "KMS decrypt attempts made by the unseal gate, by result");
        describe_counter!(SECRET_SYNCS, "Secret paths synced, by result");
        describe_gauge!(SYNC_FAILING_PATHS, "Secret paths currently in the Failing condition");
    }

    pub fn record_cloud_mutation(&self, kind: &str, success: bool) {
        let labels = [("kind", kind.to_string()), ("result", result_label(success).to_string())];
        counter!(CLOUD_MUTATIONS, &labels).increment(1);
    }

    pub fn record_reconcile_run(&self, operation: &str, result: &str) {
        let labels = [("operation", operation.to_string()), ("result", result.to_string())];
        counter!(RECONCILE_RUNS, &labels).increment(1);
    }

    pub fn record_unseal_attempt(&self, result: &str) {
        let labels = [("result", result.to_string())];
        counter!(UNSEAL_ATTEMPTS, &labels).increment(1);
    }

    pub fn record_secret_sync(&self, result: &str) {
        let labels = [("result", result.to_string())];
        counter!(SECRET_SYNCS, &labels).increment(1);
    }

    pub fn set_failing_paths(&self, count: usize) {
        gauge!(SYNC_FAILING_PATHS).set(count as f64);
    }
}

fn result_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "error"
    }
}

pub fn record_cloud_mutation(kind: &str, success: bool) {
    MetricsRecorder.record_cloud_mutation(kind, success);
}

pub fn record_reconcile_run(operation: &str, result: &str) {
    MetricsRecorder.record_reconcile_run(operation, result);
}

pub fn record_unseal_attempt(result: &str) {
    MetricsRecorder.record_unseal_attempt(result);
}

pub fn record_secret_sync(result: &str) {
    MetricsRecorder.record_secret_sync(result);
}

pub fn set_failing_paths(count: usize) {
    MetricsRecorder.set_failing_paths(count);
}

/// Install the Prometheus exporter when metrics are enabled.
pub async fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => {
            warn!("Metrics disabled: no bind address configured");
            return Ok(());
        }
    };

    let socket_addr: SocketAddr = metrics_addr
        .parse()
        .map_err(|e| SealplaneError::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| SealplaneError::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    MetricsRecorder::new().register();

    info!(metrics_addr = %metrics_addr, service_name = %config.service_name, "Metrics collection initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter() {
        let recorder = MetricsRecorder::new();
        recorder.register();
        recorder.record_cloud_mutation("create", true);
        recorder.record_reconcile_run("apply", "timeout");
        recorder.record_unseal_attempt("retry");
        recorder.record_secret_sync("success");
        recorder.set_failing_paths(2);
    }

    #[tokio::test]
    async fn test_init_metrics_disabled() {
        let config = ObservabilityConfig { enable_metrics: false, ..Default::default() };
        assert!(init_metrics(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_init_metrics_no_port() {
        let config = ObservabilityConfig { enable_metrics: true, metrics_port: 0, ..Default::default() };
        assert!(init_metrics(&config).await.is_ok());
    }
}
