//! Exponential backoff shared by the reconcile engine, the unseal gate and the
//! secret sync bridge.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{Result, SealplaneError};

/// Retry configuration for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Initial backoff duration before first retry
    pub initial_backoff: Duration,
    /// Maximum backoff duration (cap for exponential growth)
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 for doubling)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate the backoff duration for a given attempt number (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let multiplier = self.backoff_multiplier.powi(attempt as i32 - 1);
        let backoff_ms = self.initial_backoff.as_millis() as f64 * multiplier;
        let capped_ms = backoff_ms.min(self.max_backoff.as_millis() as f64);

        Duration::from_millis(capped_ms as u64)
    }

    /// A config that never retries.
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }
}

/// Serializable form of [`RetryConfig`] used in settings files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_attempts: 3, initial_backoff_ms: 100, max_backoff_ms: 5_000, backoff_multiplier: 2.0 }
    }
}

impl RetrySettings {
    pub fn validate(&self, section: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SealplaneError::validation_field(
                "max_attempts must be at least 1",
                format!("{}.max_attempts", section),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(SealplaneError::validation_field(
                "backoff_multiplier must be >= 1.0",
                format!("{}.backoff_multiplier", section),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(SealplaneError::validation_field(
                "initial_backoff_ms must not exceed max_backoff_ms",
                format!("{}.initial_backoff_ms", section),
            ));
        }
        Ok(())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            backoff_multiplier: settings.backoff_multiplier,
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// exhausts `config.max_attempts`. The last error is returned.
pub async fn retry<T, F, Fut>(config: &RetryConfig, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let backoff = config.backoff_for_attempt(attempt);
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }

        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt + 1 < max_attempts => {
                warn!(
                    operation = label,
                    attempt = attempt + 1,
                    max_attempts,
                    error = %error,
                    "Transient failure, will retry"
                );
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_retry_config_backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::ZERO);
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_config_backoff_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        };

        assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(5));
        assert_eq!(config.backoff_for_attempt(9), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_settings_validation() {
        assert!(RetrySettings::default().validate("engine.retry").is_ok());
        let settings = RetrySettings { max_attempts: 0, ..RetrySettings::default() };
        assert!(settings.validate("engine.retry").is_err());
        let settings = RetrySettings { initial_backoff_ms: 10_000, ..RetrySettings::default() };
        assert!(settings.validate("engine.retry").is_err());
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast(), "op", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(SealplaneError::provisioning_retryable("x", "throttled"))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_fatal_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&fast(), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SealplaneError::provisioning("x", "access denied"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&fast(), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SealplaneError::timeout("op", 5))
        })
        .await;

        assert!(matches!(result, Err(SealplaneError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
