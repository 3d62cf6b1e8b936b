//! Bounded, recorded cloud calls.
//!
//! Every call the provisioning layer makes goes through an [`Executor`]. Reads
//! run under the per-call timeout and are retried on transient failures.
//! Mutations are recorded as [`PlannedChange`]s; in [`Mode::Plan`] they are
//! recorded and not issued, in [`Mode::Apply`] they are issued under the same
//! timeout and retried only when the action is idempotent.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::{info, Instrument};

use super::graph::ResourceAddress;
use super::plan::{ChangeAction, PlannedChange};
use crate::errors::{Result, SealplaneError};
use crate::observability::metrics;
use crate::retry::{retry, RetryConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Plan,
    Apply,
}

async fn bounded<T, Fut>(timeout: Duration, label: &str, call: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(SealplaneError::timeout(label, timeout.as_millis() as u64)),
    }
}

#[derive(Debug)]
pub struct Executor {
    mode: Mode,
    call_timeout: Duration,
    retry: RetryConfig,
    changes: Vec<PlannedChange>,
}

impl Executor {
    pub fn new(mode: Mode, call_timeout: Duration, retry: RetryConfig) -> Self {
        Self { mode, call_timeout, retry, changes: Vec::new() }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn changes(&self) -> &[PlannedChange] {
        &self.changes
    }

    pub fn into_changes(self) -> Vec<PlannedChange> {
        self.changes
    }

    /// True when a plan has recorded a create for `address`, i.e. the
    /// resource does not exist yet and cannot be observed further.
    pub fn pending_create(&self, address: ResourceAddress) -> bool {
        self.mode == Mode::Plan
            && self.changes.iter().any(|c| c.address == address.as_str() && c.action == ChangeAction::Create)
    }

    /// Run a read-only call under the timeout, retrying transient failures.
    pub async fn observe<T, F, Fut>(&self, scope: impl fmt::Display, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let label = format!("{} {}", scope, operation);
        let timeout = self.call_timeout;
        retry(&self.retry, &label, || bounded(timeout, &label, call())).await
    }

    /// Record a mutation and, in apply mode, issue it. Returns `None` in
    /// plan mode.
    pub async fn mutate<T, F, Fut>(
        &mut self,
        address: ResourceAddress,
        action: ChangeAction,
        detail: impl Into<String>,
        mut call: F,
    ) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let change = PlannedChange { address: address.as_str().to_string(), action, detail: detail.into() };

        if self.mode == Mode::Plan {
            info!(address = %address, action = action.as_str(), detail = %change.detail, "Planned change");
            self.changes.push(change);
            return Ok(None);
        }

        let label = format!("{} {}", address, action.as_str());
        let policy = if action.is_idempotent() { self.retry.clone() } else { RetryConfig::no_retry() };
        let timeout = self.call_timeout;
        let span = crate::provision_span!(address.as_str(), action.as_str());

        let result = retry(&policy, &label, || bounded(timeout, &label, call())).instrument(span).await;
        metrics::record_cloud_mutation(action.as_str(), result.is_ok());

        let value = result?;
        info!(address = %address, action = action.as_str(), detail = %change.detail, "Applied change");
        self.changes.push(change);
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn plan_mode_records_without_calling() {
        let mut exec = Executor::new(Mode::Plan, Duration::from_secs(1), fast_retry());
        let calls = AtomicU32::new(0);

        let result = exec
            .mutate(ResourceAddress::Key, ChangeAction::Create, "create key", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(exec.pending_create(ResourceAddress::Key));
        assert!(!exec.pending_create(ResourceAddress::Bucket));
    }

    #[tokio::test]
    async fn creates_are_not_retried() {
        let mut exec = Executor::new(Mode::Apply, Duration::from_secs(1), fast_retry());
        let calls = AtomicU32::new(0);

        let result: Result<Option<()>> = exec
            .mutate(ResourceAddress::Bucket, ChangeAction::Create, "create bucket", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SealplaneError::provisioning_retryable("s3_bucket.storage", "throttled"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(exec.changes().is_empty());
    }

    #[tokio::test]
    async fn idempotent_updates_are_retried() {
        let mut exec = Executor::new(Mode::Apply, Duration::from_secs(1), fast_retry());
        let calls = AtomicU32::new(0);

        let result = exec
            .mutate(ResourceAddress::Role, ChangeAction::Update, "trust policy", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(SealplaneError::provisioning_retryable("iam_role.vault", "throttled"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(exec.changes().len(), 1);
    }

    #[tokio::test]
    async fn calls_are_bounded_by_timeout() {
        let exec = Executor::new(Mode::Apply, Duration::from_millis(20), RetryConfig::no_retry());
        let result: Result<()> = exec
            .observe(ResourceAddress::Key, "describe_key", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(SealplaneError::Timeout { .. })));
    }
}
