//! # Runtime Unseal Gate
//!
//! On start the secret store is sealed. The [`Unsealer`] decrypts the unseal
//! material with the managed key, retrying transient KMS failures with
//! exponential backoff, and publishes its progress on a `watch` channel. The
//! [`ReadinessGate`] reads that channel: nothing is served until the status is
//! `Unsealed`, and there is no local fallback when KMS stays unavailable.

use crate::config::UnsealSettings;
use crate::errors::{Result, SealplaneError};
use crate::observability::{metrics, HealthCheck, HealthProvider};
use crate::retry::RetryConfig;
use crate::secrets::SecretBytes;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

/// Decrypts unseal material under a managed key.
#[async_trait]
pub trait KeyDecryptor: Send + Sync + fmt::Debug {
    async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<SecretBytes>;
}

/// Progress of the unseal path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsealStatus {
    Sealed,
    Unsealing { attempt: u32 },
    Unsealed,
    Failed { reason: String, attempts: u32 },
}

impl fmt::Display for UnsealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsealStatus::Sealed => write!(f, "sealed"),
            UnsealStatus::Unsealing { attempt } => write!(f, "unsealing (attempt {})", attempt),
            UnsealStatus::Unsealed => write!(f, "unsealed"),
            UnsealStatus::Failed { reason, attempts } => write!(f, "failed after {} attempt(s): {}", attempts, reason),
        }
    }
}

/// Drives KMS decryption of the unseal material.
#[derive(Debug)]
pub struct Unsealer {
    decryptor: Arc<dyn KeyDecryptor>,
    key_id: String,
    ciphertext: Vec<u8>,
    retry: RetryConfig,
    attempt_timeout: Duration,
    status: watch::Sender<UnsealStatus>,
}

impl Unsealer {
    pub fn new(decryptor: Arc<dyn KeyDecryptor>, ciphertext: Vec<u8>, settings: &UnsealSettings) -> Self {
        let (status, _) = watch::channel(UnsealStatus::Sealed);
        Self {
            decryptor,
            key_id: settings.key_id.clone(),
            ciphertext,
            retry: RetryConfig::from(&settings.retry),
            attempt_timeout: settings.attempt_timeout(),
            status,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// A gate observing this unsealer's status.
    pub fn gate(&self) -> ReadinessGate {
        ReadinessGate { status: self.status.subscribe() }
    }

    pub fn status(&self) -> UnsealStatus {
        self.status.borrow().clone()
    }

    /// Decrypt the unseal material. Returns the plaintext on success; on
    /// failure the status is left at `Failed` and the error carries the number
    /// of attempts made.
    #[instrument(skip(self), fields(key_id = %self.key_id))]
    pub async fn unseal(&self) -> Result<SecretBytes> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let backoff = self.retry.backoff_for_attempt(attempt);
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
            attempt += 1;
            self.status.send_replace(UnsealStatus::Unsealing { attempt });

            let outcome = match tokio::time::timeout(self.attempt_timeout, self.decryptor.decrypt(&self.key_id, &self.ciphertext)).await {
                Ok(result) => result,
                Err(_) => Err(SealplaneError::timeout("kms:Decrypt", self.attempt_timeout.as_millis() as u64)),
            };

            match outcome {
                Ok(plaintext) => {
                    metrics::record_unseal_attempt("success");
                    self.status.send_replace(UnsealStatus::Unsealed);
                    info!(attempt, "Secret store unsealed");
                    return Ok(plaintext);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    metrics::record_unseal_attempt("retry");
                    warn!(attempt, max_attempts, error = %e, "Unseal attempt failed, retrying");
                }
                Err(e) => {
                    let result = if e.is_retryable() { "exhausted" } else { "fatal" };
                    metrics::record_unseal_attempt(result);
                    let reason = e.to_string();
                    error!(attempt, error = %reason, "Unseal failed, secret store stays sealed");
                    self.status.send_replace(UnsealStatus::Failed { reason: reason.clone(), attempts: attempt });
                    return Err(SealplaneError::unseal(reason, attempt));
                }
            }
        }
    }
}

/// Read side of the unseal status; cheap to clone.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    status: watch::Receiver<UnsealStatus>,
}

impl ReadinessGate {
    pub fn status(&self) -> UnsealStatus {
        self.status.borrow().clone()
    }

    /// Refuse to serve until unsealed.
    pub fn ensure_serving(&self) -> Result<()> {
        match self.status() {
            UnsealStatus::Unsealed => Ok(()),
            UnsealStatus::Failed { reason, attempts } => Err(SealplaneError::unseal(reason, attempts)),
            UnsealStatus::Unsealing { attempt } => {
                Err(SealplaneError::unseal("secret store is still sealed", attempt.saturating_sub(1)))
            }
            UnsealStatus::Sealed => Err(SealplaneError::unseal("secret store is sealed", 0)),
        }
    }

    /// Block until the unsealer reaches a terminal status or `timeout` elapses.
    pub async fn wait_until_unsealed(&self, timeout: Duration) -> Result<()> {
        let mut status = self.status.clone();
        let terminal = tokio::time::timeout(timeout, async {
            status.wait_for(|s| matches!(s, UnsealStatus::Unsealed | UnsealStatus::Failed { .. })).await.map(|_| ())
        })
        .await;

        match terminal {
            Ok(Ok(_)) => self.ensure_serving(),
            Ok(Err(_)) => Err(SealplaneError::internal("unsealer dropped before reaching a terminal status")),
            Err(_) => Err(SealplaneError::timeout("wait_until_unsealed", timeout.as_millis() as u64)),
        }
    }
}

#[async_trait]
impl HealthProvider for ReadinessGate {
    async fn health_check(&self) -> Result<HealthCheck> {
        let status = self.status();
        let check = match &status {
            UnsealStatus::Unsealed => HealthCheck::healthy("unseal_gate"),
            UnsealStatus::Sealed | UnsealStatus::Unsealing { .. } => HealthCheck::degraded("unseal_gate", status.to_string()),
            UnsealStatus::Failed { .. } => HealthCheck::unhealthy("unseal_gate", status.to_string()),
        };
        Ok(check.with_metadata("status", status.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::memory::{InMemoryCloud, InjectedFailure};
    use crate::cloud::{CloudProvider, CreateKeyRequest};
    use crate::domain::Tags;
    use crate::observability::HealthStatus;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            backoff_multiplier: 2.0,
        }
    }

    async fn sealed_material(cloud: &InMemoryCloud) -> (UnsealSettings, Vec<u8>) {
        let request = CreateKeyRequest {
            alias: "alias/eks-vault-unseal".to_string(),
            description: "unseal".to_string(),
            policy: "{}".to_string(),
            rotation_enabled: true,
            tags: Tags::new(),
        };
        cloud.create_key(&request).await.unwrap();
        let ciphertext = cloud.encrypt("alias/eks-vault-unseal", b"root-unseal-key").await.unwrap();
        let settings = UnsealSettings { key_id: "alias/eks-vault-unseal".to_string(), ..Default::default() };
        (settings, ciphertext)
    }

    #[tokio::test]
    async fn unseals_and_opens_the_gate() {
        let cloud = Arc::new(InMemoryCloud::default());
        let (settings, ciphertext) = sealed_material(&cloud).await;
        let unsealer = Unsealer::new(cloud.clone(), ciphertext, &settings).with_retry(fast_retry(3));
        let gate = unsealer.gate();

        assert!(gate.ensure_serving().is_err());
        let plaintext = unsealer.unseal().await.unwrap();

        assert_eq!(plaintext.expose_secret(), b"root-unseal-key");
        assert!(gate.ensure_serving().is_ok());
        assert_eq!(gate.status(), UnsealStatus::Unsealed);
    }

    #[tokio::test]
    async fn retries_throttling_then_succeeds() {
        let cloud = Arc::new(InMemoryCloud::default());
        let (settings, ciphertext) = sealed_material(&cloud).await;
        cloud.fail_next("decrypt", InjectedFailure::Throttled, 2).await;

        let unsealer = Unsealer::new(cloud.clone(), ciphertext, &settings).with_retry(fast_retry(5));
        assert!(unsealer.unseal().await.is_ok());
        assert_eq!(unsealer.status(), UnsealStatus::Unsealed);
    }

    #[tokio::test]
    async fn bounded_attempts_then_liveness_failure() {
        let cloud = Arc::new(InMemoryCloud::default());
        let (settings, ciphertext) = sealed_material(&cloud).await;
        cloud.fail_next("decrypt", InjectedFailure::Throttled, 10).await;

        let unsealer = Unsealer::new(cloud.clone(), ciphertext, &settings).with_retry(fast_retry(3));
        let gate = unsealer.gate();
        let err = unsealer.unseal().await.unwrap_err();

        assert!(matches!(err, SealplaneError::Unseal { attempts: 3, .. }));
        assert!(gate.ensure_serving().is_err());
        let check = gate.health_check().await.unwrap();
        assert!(matches!(check.status, HealthStatus::Unhealthy { .. }));
    }

    #[tokio::test]
    async fn access_denied_stops_immediately() {
        let cloud = Arc::new(InMemoryCloud::default());
        let (settings, ciphertext) = sealed_material(&cloud).await;
        cloud.fail_next("decrypt", InjectedFailure::AccessDenied, 1).await;

        let unsealer = Unsealer::new(cloud.clone(), ciphertext, &settings).with_retry(fast_retry(5));
        let err = unsealer.unseal().await.unwrap_err();

        assert!(matches!(err, SealplaneError::Unseal { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn tampered_ciphertext_is_fatal() {
        let cloud = Arc::new(InMemoryCloud::default());
        let (settings, _) = sealed_material(&cloud).await;

        let unsealer = Unsealer::new(cloud.clone(), b"not-a-ciphertext".to_vec(), &settings).with_retry(fast_retry(5));
        let err = unsealer.unseal().await.unwrap_err();

        assert!(matches!(err, SealplaneError::Unseal { attempts: 1, .. }));
        assert!(matches!(unsealer.status(), UnsealStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn slow_kms_times_out_each_attempt() {
        let cloud = Arc::new(InMemoryCloud::default());
        let (settings, ciphertext) = sealed_material(&cloud).await;
        cloud.delay("decrypt", Duration::from_millis(200)).await;

        let unsealer = Unsealer::new(cloud.clone(), ciphertext, &settings)
            .with_retry(fast_retry(2))
            .with_attempt_timeout(Duration::from_millis(10));
        let err = unsealer.unseal().await.unwrap_err();

        assert!(matches!(err, SealplaneError::Unseal { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn sealed_gate_is_degraded_and_waits() {
        let cloud = Arc::new(InMemoryCloud::default());
        let (settings, ciphertext) = sealed_material(&cloud).await;
        let unsealer = Unsealer::new(cloud.clone(), ciphertext, &settings).with_retry(fast_retry(1));
        let gate = unsealer.gate();

        let check = gate.health_check().await.unwrap();
        assert!(matches!(check.status, HealthStatus::Degraded { .. }));
        assert!(matches!(
            gate.wait_until_unsealed(Duration::from_millis(10)).await,
            Err(SealplaneError::Timeout { .. })
        ));

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_until_unsealed(Duration::from_secs(5)).await })
        };
        unsealer.unseal().await.unwrap();
        assert!(waiter.await.unwrap().is_ok());
    }
}
