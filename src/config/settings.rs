//! # Configuration Settings
//!
//! Defines the configuration structure for sealplane.

use crate::errors::{Result, SealplaneError};
use crate::provisioning::BootstrapInputs;
use crate::retry::RetrySettings;
use crate::secrets::SecretString;
use crate::state::LockMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct Settings {
    /// Declared bootstrap inputs, validated by the engine before any cloud call
    pub bootstrap: BootstrapInputs,

    #[validate(nested)]
    pub engine: EngineSettings,

    #[validate(nested)]
    pub unseal: UnsealSettings,

    #[validate(nested)]
    pub sync: SyncSettings,

    #[validate(nested)]
    pub dev: DevSettings,

    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(SealplaneError::from)?;
        self.validate_custom()
    }

    /// Cross-field checks the validator derive cannot express
    fn validate_custom(&self) -> Result<()> {
        self.engine.retry.validate("engine.retry")?;
        self.unseal.retry.validate("unseal.retry")?;
        self.sync.retry.validate("sync.retry")?;

        if self.sync.failure_threshold == 0 {
            return Err(SealplaneError::validation_field("failure_threshold must be at least 1", "sync.failure_threshold"));
        }
        if !self.sync.vault_addr.starts_with("http://") && !self.sync.vault_addr.starts_with("https://") {
            return Err(SealplaneError::validation_field(
                "vault_addr must start with 'http://' or 'https://'",
                "sync.vault_addr",
            ));
        }
        if self.observability.enable_metrics {
            if let Some(addr) = self.observability.metrics_bind_address() {
                if addr == self.dev.listen_address {
                    return Err(SealplaneError::validation("Metrics and dev server addresses cannot be the same"));
                }
            }
        }
        Ok(())
    }
}

/// Reconcile engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EngineSettings {
    /// Directory holding the state file and its lock
    pub state_dir: PathBuf,

    /// Behaviour when another run holds the state lock
    pub lock_mode: LockMode,

    #[validate(range(max = 3600, message = "Lock wait timeout must be at most 3600 seconds"))]
    pub lock_wait_timeout_secs: u64,

    #[validate(range(min = 1, max = 600, message = "Call timeout must be between 1 and 600 seconds"))]
    pub call_timeout_secs: u64,

    pub retry: RetrySettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".sealplane"),
            lock_mode: LockMode::Wait,
            lock_wait_timeout_secs: 60,
            call_timeout_secs: 30,
            retry: RetrySettings::default(),
        }
    }
}

/// Runtime unseal gate configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct UnsealSettings {
    /// Key id, ARN or alias the unseal material is encrypted under
    #[validate(length(min = 1, message = "Unseal key id cannot be empty"))]
    pub key_id: String,

    #[validate(range(min = 1, max = 300, message = "Attempt timeout must be between 1 and 300 seconds"))]
    pub attempt_timeout_secs: u64,

    pub retry: RetrySettings,
}

impl Default for UnsealSettings {
    fn default() -> Self {
        Self {
            key_id: "alias/vault-unseal".to_string(),
            attempt_timeout_secs: 10,
            retry: RetrySettings {
                max_attempts: 8,
                initial_backoff_ms: 500,
                max_backoff_ms: 30_000,
                backoff_multiplier: 2.0,
            },
        }
    }
}

impl UnsealSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// Secret Sync Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SyncSettings {
    #[validate(length(min = 1, message = "Vault address cannot be empty"))]
    pub vault_addr: String,

    /// Vault token; falls back to `VAULT_TOKEN` when unset
    pub token: Option<SecretString>,

    /// Secret paths, `secret/data/<prefix>/<service>/<key>`
    pub paths: Vec<String>,

    #[validate(range(min = 5, max = 3600, message = "Sync interval must be between 5 and 3600 seconds"))]
    pub interval_secs: u64,

    /// Consecutive failures before a path reports `Failing`
    pub failure_threshold: u32,

    #[validate(range(min = 1, max = 120, message = "Request timeout must be between 1 and 120 seconds"))]
    pub request_timeout_secs: u64,

    /// Directory the manifest sink writes Kubernetes Secret objects into
    pub output_dir: PathBuf,

    /// Namespace stamped on materialized Secret objects
    #[validate(length(min = 1, max = 63, message = "Namespace must be 1-63 characters"))]
    pub namespace: String,

    pub retry: RetrySettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            vault_addr: "http://127.0.0.1:8200".to_string(),
            token: None,
            paths: Vec::new(),
            interval_secs: 30,
            failure_threshold: 3,
            request_timeout_secs: 10,
            output_dir: PathBuf::from("synced-secrets"),
            namespace: "vault".to_string(),
            retry: RetrySettings::default(),
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Dev-mode Vault server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DevSettings {
    #[validate(length(min = 1, message = "Dev server command cannot be empty"))]
    pub command: String,

    /// Extra arguments; when empty the standard `server -dev` arguments are used
    pub args: Vec<String>,

    #[validate(length(min = 1, message = "Listen address cannot be empty"))]
    pub listen_address: String,

    #[validate(range(min = 1, max = 300, message = "Startup timeout must be between 1 and 300 seconds"))]
    pub startup_timeout_secs: u64,

    #[validate(range(min = 10, max = 10_000, message = "Health poll interval must be between 10 and 10000 ms"))]
    pub health_poll_interval_ms: u64,
}

impl Default for DevSettings {
    fn default() -> Self {
        Self {
            command: "vault".to_string(),
            args: Vec::new(),
            listen_address: "127.0.0.1:8200".to_string(),
            startup_timeout_secs: 30,
            health_poll_interval_ms: 250,
        }
    }
}

impl DevSettings {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Default log level when `RUST_LOG` is unset
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Emit JSON lines instead of human-readable output
    pub json_logging: bool,

    /// Serve Prometheus metrics from the long-running commands
    pub enable_metrics: bool,

    pub metrics_host: String,

    /// Metrics port (0 disables the listener)
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "sealplane".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
            enable_metrics: false,
            metrics_host: "127.0.0.1".to_string(),
            metrics_port: 9090,
        }
    }
}

impl ObservabilityConfig {
    /// Bind address for the metrics listener, if one is configured
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(format!("{}:{}", self.metrics_host, self.metrics_port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.engine.lock_mode, LockMode::Wait);
        assert_eq!(settings.sync.interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_interval_bounds() {
        let mut settings = Settings::default();
        settings.sync.interval_secs = 4;
        assert!(settings.validate().is_err());

        settings.sync.interval_secs = 3601;
        assert!(settings.validate().is_err());

        settings.sync.interval_secs = 3600;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_call_timeout_must_be_positive() {
        let mut settings = Settings::default();
        settings.engine.call_timeout_secs = 0;
        assert!(matches!(settings.validate(), Err(SealplaneError::Validation { .. })));
    }

    #[test]
    fn test_retry_sections_are_checked() {
        let mut settings = Settings::default();
        settings.unseal.retry.max_attempts = 0;
        match settings.validate() {
            Err(SealplaneError::Validation { field, .. }) => {
                assert_eq!(field.as_deref(), Some("unseal.retry.max_attempts"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_metrics_address() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.metrics_bind_address(), Some("127.0.0.1:9090".to_string()));

        let config = ObservabilityConfig { metrics_port: 0, ..Default::default() };
        assert_eq!(config.metrics_bind_address(), None);
    }

    #[test]
    fn test_token_is_redacted_when_serialized() {
        let mut settings = Settings::default();
        settings.sync.token = Some(SecretString::new("hvs.super-secret"));
        let rendered = serde_json::to_string(&settings).unwrap();
        assert!(!rendered.contains("hvs.super-secret"));
    }
}
