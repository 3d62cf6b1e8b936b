//! # Structured Logging
//!
//! Span macros and subscriber setup on the tracing ecosystem.
//!
//! Every cloud mutation runs inside a `provision_span!` and every sync
//! iteration inside a `sync_span!`, each with a fresh `operation_id` so the
//! calls of one apply or one poll can be grouped. Secret values are never
//! recorded as fields; `SecretString` only ever renders as `[REDACTED]`.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ObservabilityConfig;
use crate::errors::Result;

/// Create a tracing span for one provisioning call.
///
/// ```rust,ignore
/// let span = provision_span!("kms_key.unseal", "create");
/// ```
#[macro_export]
macro_rules! provision_span {
    ($resource:expr, $operation:expr) => {
        tracing::info_span!(
            "provision",
            resource = %$resource,
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($resource:expr, $operation:expr, $($field:tt)*) => {
        tracing::info_span!(
            "provision",
            resource = %$resource,
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for one secret sync iteration.
#[macro_export]
macro_rules! sync_span {
    ($iteration:expr) => {
        tracing::info_span!(
            "secret_sync",
            iteration = $iteration,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($iteration:expr, $($field:tt)*) => {
        tracing::info_span!(
            "secret_sync",
            iteration = $iteration,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level;
/// `verbose` raises the default to `debug`. A subscriber that is already set
/// (integration tests) is left in place.
pub fn init_logging(config: &ObservabilityConfig, verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { config.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let result = if config.json_logging {
        fmt().with_env_filter(filter).json().with_current_span(true).with_target(true).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };

    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
    Ok(())
}

/// Log configuration at startup
pub fn log_config_info(settings: &crate::config::Settings) {
    tracing::info!(
        cluster = %settings.bootstrap.cluster_id,
        region = %settings.bootstrap.region,
        state_dir = %settings.engine.state_dir.display(),
        lock_mode = ?settings.engine.lock_mode,
        metrics_enabled = settings.observability.enable_metrics,
        "Sealplane configuration"
    );
}
