//! # Observability Infrastructure
//!
//! Structured logging, metrics and health checking for sealplane.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{HealthCheck, HealthChecker, HealthProvider, HealthStatus};
pub use logging::{init_logging, log_config_info};
pub use metrics::{init_metrics, MetricsRecorder};

use crate::config::ObservabilityConfig;
use crate::errors::Result;
use ::tracing::info;

/// Initialize logging and metrics, returning the health checker that
/// long-running components register with.
pub async fn init_observability(config: &ObservabilityConfig, verbose: bool) -> Result<HealthChecker> {
    init_logging(config, verbose)?;
    init_metrics(config).await?;

    let health_checker = HealthChecker::new();

    info!(
        service_name = %config.service_name,
        log_level = %config.log_level,
        metrics_enabled = %config.enable_metrics,
        "Observability initialized"
    );

    Ok(health_checker)
}
