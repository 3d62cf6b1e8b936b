//! Secret Sync Bridge.
//!
//! Polls the secret store on a bounded interval and upserts one platform
//! secret object per configured path. Delivery is at-least-once: every
//! iteration rewrites every object. A path that keeps failing is reported
//! through its `Failing` condition and the loop carries on.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use super::path::SecretPath;
use super::sink::{PathStatus, SecretObject, SecretSink, SyncCondition};
use super::source::{SecretData, SecretSource};
use crate::config::SyncSettings;
use crate::errors::{Result, SealplaneError};
use crate::observability::{metrics, HealthCheck, HealthProvider};
use crate::retry::{retry, RetryConfig};

pub const MIN_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct TrackedPath {
    path: SecretPath,
    status: PathStatus,
    last_data: SecretData,
}

/// Outcome of one polling iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    pub iteration: u64,
    pub synced: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct SecretSyncBridge {
    source: Arc<dyn SecretSource>,
    sink: Arc<dyn SecretSink>,
    namespace: String,
    interval: Duration,
    request_timeout: Duration,
    failure_threshold: u32,
    retry: RetryConfig,
    tracked: RwLock<BTreeMap<String, TrackedPath>>,
    iterations: AtomicU64,
}

impl SecretSyncBridge {
    pub fn new(source: Arc<dyn SecretSource>, sink: Arc<dyn SecretSink>, settings: &SyncSettings) -> Result<Self> {
        let interval = settings.interval();
        if !(MIN_INTERVAL..=MAX_INTERVAL).contains(&interval) {
            return Err(SealplaneError::validation_field(
                format!("sync interval must be between {}s and {}s", MIN_INTERVAL.as_secs(), MAX_INTERVAL.as_secs()),
                "sync.interval_secs",
            ));
        }
        if settings.paths.is_empty() {
            return Err(SealplaneError::validation_field("at least one secret path is required", "sync.paths"));
        }
        if settings.failure_threshold == 0 {
            return Err(SealplaneError::validation_field("failure_threshold must be at least 1", "sync.failure_threshold"));
        }

        let mut tracked = BTreeMap::new();
        let mut object_names = HashSet::new();
        for raw in &settings.paths {
            let path = SecretPath::parse(raw)?;
            if !object_names.insert(path.object_name()) {
                return Err(SealplaneError::validation_field(
                    format!("'{}' maps to an object name already used by another path", path),
                    "sync.paths",
                ));
            }
            let key = path.to_string();
            tracked.insert(key.clone(), TrackedPath { path, status: PathStatus::pending(key), last_data: SecretData::new() });
        }

        Ok(Self {
            source,
            sink,
            namespace: settings.namespace.clone(),
            interval,
            request_timeout: settings.request_timeout(),
            failure_threshold: settings.failure_threshold,
            retry: RetryConfig::from(&settings.retry),
            tracked: RwLock::new(tracked),
            iterations: AtomicU64::new(0),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll every path once. Failures are recorded in the path status.
    pub async fn sync_once(&self) -> SyncReport {
        let iteration = self.iterations.fetch_add(1, Ordering::SeqCst) + 1;
        let paths: Vec<SecretPath> = self.tracked.read().await.values().map(|t| t.path.clone()).collect();
        let span = crate::sync_span!(iteration, paths = paths.len());

        async {
            let mut report = SyncReport { iteration, ..Default::default() };
            for path in &paths {
                if self.sync_path(path).await {
                    report.synced += 1;
                } else {
                    report.failed += 1;
                }
            }

            let failing = self.failing_count().await;
            metrics::set_failing_paths(failing);
            info!(synced = report.synced, failed = report.failed, failing, "Secret sync iteration complete");
            report
        }
        .instrument(span)
        .await
    }

    /// Poll until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), namespace = %self.namespace, "Secret sync bridge started");
        loop {
            self.sync_once().await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Secret sync bridge stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Current status of every path, ordered by path.
    pub async fn status(&self) -> Vec<PathStatus> {
        self.tracked.read().await.values().map(|t| t.status.clone()).collect()
    }

    pub async fn status_for(&self, path: &str) -> Option<PathStatus> {
        self.tracked.read().await.get(path).map(|t| t.status.clone())
    }

    async fn failing_count(&self) -> usize {
        self.tracked.read().await.values().filter(|t| t.status.condition == SyncCondition::Failing).count()
    }

    async fn read_with_retry(&self, path: &SecretPath) -> Result<SecretData> {
        let timeout = self.request_timeout;
        retry(&self.retry, "secret_read", || {
            let source = Arc::clone(&self.source);
            let path = path.clone();
            async move {
                match tokio::time::timeout(timeout, source.read(&path)).await {
                    Ok(result) => result.map_err(SealplaneError::from),
                    Err(_) => Err(SealplaneError::timeout(format!("read {}", path), timeout.as_millis() as u64)),
                }
            }
        })
        .await
    }

    async fn sync_path(&self, path: &SecretPath) -> bool {
        let key = path.to_string();
        let outcome = match self.read_with_retry(path).await {
            Ok(data) => {
                let object = {
                    let mut tracked = self.tracked.write().await;
                    let Some(entry) = tracked.get_mut(&key) else {
                        return false;
                    };
                    let mut status = entry.status.clone();
                    status.condition = SyncCondition::Synced;
                    status.last_synced_at = Some(Utc::now());
                    status.last_error = None;
                    status.consecutive_failures = 0;
                    self.object(path, &data, status)
                };
                match self.sink.apply(&object).await {
                    Ok(()) => {
                        let mut tracked = self.tracked.write().await;
                        if let Some(entry) = tracked.get_mut(&key) {
                            entry.status = object.status;
                            entry.last_data = data;
                        }
                        Ok(())
                    }
                    Err(e) => Err(SealplaneError::from(e)),
                }
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                metrics::record_secret_sync("success");
                true
            }
            Err(error) => {
                metrics::record_secret_sync("error");
                self.record_failure(path, &error).await;
                false
            }
        }
    }

    async fn record_failure(&self, path: &SecretPath, error: &SealplaneError) {
        let key = path.to_string();
        let object = {
            let mut tracked = self.tracked.write().await;
            let Some(entry) = tracked.get_mut(&key) else {
                return;
            };
            entry.status.consecutive_failures += 1;
            entry.status.last_error = Some(error.to_string());
            if entry.status.consecutive_failures >= self.failure_threshold {
                entry.status.condition = SyncCondition::Failing;
            }
            warn!(
                path = %path,
                consecutive_failures = entry.status.consecutive_failures,
                condition = ?entry.status.condition,
                error = %error,
                "Secret sync failed"
            );
            self.object(path, &entry.last_data, entry.status.clone())
        };

        if let Err(e) = self.sink.apply(&object).await {
            warn!(path = %path, error = %e, "Failed to publish sync status");
        }
    }

    fn object(&self, path: &SecretPath, data: &SecretData, status: PathStatus) -> SecretObject {
        SecretObject {
            name: path.object_name(),
            namespace: self.namespace.clone(),
            source_path: path.to_string(),
            data: data.clone(),
            status,
        }
    }
}

#[async_trait]
impl HealthProvider for SecretSyncBridge {
    async fn health_check(&self) -> Result<HealthCheck> {
        let statuses = self.status().await;
        let failing: Vec<String> =
            statuses.iter().filter(|s| s.condition == SyncCondition::Failing).map(|s| s.path.clone()).collect();

        let conditions: HashMap<&str, usize> = statuses.iter().fold(HashMap::new(), |mut acc, s| {
            let label = match s.condition {
                SyncCondition::Pending => "pending",
                SyncCondition::Synced => "synced",
                SyncCondition::Failing => "failing",
            };
            *acc.entry(label).or_default() += 1;
            acc
        });

        let check = if failing.is_empty() {
            HealthCheck::healthy("secret_sync")
        } else {
            HealthCheck::degraded("secret_sync", format!("failing paths: {}", failing.join(", ")))
        };
        Ok(conditions.into_iter().fold(check, |check, (label, count)| check.with_metadata(label, count.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::HealthStatus;
    use crate::secrets::{MemorySecretSink, MemorySecretSource};

    const DB: &str = "secret/data/platform/payments/db";

    fn settings(paths: &[&str]) -> SyncSettings {
        SyncSettings {
            paths: paths.iter().map(|p| p.to_string()).collect(),
            failure_threshold: 2,
            ..Default::default()
        }
    }

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    async fn bridge(source: &MemorySecretSource, sink: &MemorySecretSink) -> SecretSyncBridge {
        SecretSyncBridge::new(Arc::new(source.clone()), Arc::new(sink.clone()), &settings(&[DB])).unwrap().with_retry(fast())
    }

    #[tokio::test]
    async fn materializes_one_object_per_path() {
        let source = MemorySecretSource::new();
        let sink = MemorySecretSink::new();
        source.put(&SecretPath::parse(DB).unwrap(), [("password", "hunter2")]).await;

        let bridge = bridge(&source, &sink).await;
        let report = bridge.sync_once().await;

        assert_eq!(report.synced, 1);
        let object = sink.get("vault", "payments-db").await.unwrap();
        assert_eq!(object.data["password"].expose_secret(), "hunter2");
        assert_eq!(object.status.condition, SyncCondition::Synced);
        assert!(object.status.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn repeated_failure_becomes_failing_condition() {
        let source = MemorySecretSource::new();
        let sink = MemorySecretSink::new();
        source.put(&SecretPath::parse(DB).unwrap(), [("password", "hunter2")]).await;
        let bridge = bridge(&source, &sink).await;
        bridge.sync_once().await;

        source.set_unavailable(true).await;
        bridge.sync_once().await;
        let status = bridge.status_for(DB).await.unwrap();
        assert_eq!(status.condition, SyncCondition::Synced);
        assert_eq!(status.consecutive_failures, 1);

        bridge.sync_once().await;
        let object = sink.get("vault", "payments-db").await.unwrap();
        assert_eq!(object.status.condition, SyncCondition::Failing);
        assert!(object.status.last_error.as_deref().unwrap().contains("connection refused"));
        assert_eq!(object.data["password"].expose_secret(), "hunter2");
        assert!(matches!(bridge.health_check().await.unwrap().status, HealthStatus::Degraded { .. }));

        source.set_unavailable(false).await;
        bridge.sync_once().await;
        let status = bridge.status_for(DB).await.unwrap();
        assert_eq!(status.condition, SyncCondition::Synced);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_an_iteration() {
        let source = MemorySecretSource::new();
        let sink = MemorySecretSink::new();
        source.set_unavailable(true).await;
        let bridge = bridge(&source, &sink).await;

        bridge.sync_once().await;
        assert_eq!(source.read_count(), 2);
        assert_eq!(bridge.status_for(DB).await.unwrap().condition, SyncCondition::Pending);
    }

    #[test]
    fn rejects_out_of_bounds_interval_and_bad_paths() {
        let source: Arc<dyn SecretSource> = Arc::new(MemorySecretSource::new());
        let sink: Arc<dyn SecretSink> = Arc::new(MemorySecretSink::new());

        let mut s = settings(&[DB]);
        s.interval_secs = 1;
        assert!(SecretSyncBridge::new(source.clone(), sink.clone(), &s).is_err());

        assert!(SecretSyncBridge::new(source.clone(), sink.clone(), &settings(&[])).is_err());
        assert!(SecretSyncBridge::new(source.clone(), sink.clone(), &settings(&["secret/platform/db"])).is_err());
        assert!(SecretSyncBridge::new(
            source,
            sink,
            &settings(&["secret/data/platform/payments/db_key", "secret/data/platform/payments/db-key"])
        )
        .is_err());
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let source = MemorySecretSource::new();
        let sink = MemorySecretSink::new();
        source.put(&SecretPath::parse(DB).unwrap(), [("password", "hunter2")]).await;
        let bridge = Arc::new(bridge(&source, &sink).await);

        let cancel = CancellationToken::new();
        let handle = {
            let bridge = Arc::clone(&bridge);
            let cancel = cancel.clone();
            tokio::spawn(async move { bridge.run(cancel).await })
        };

        for _ in 0..100 {
            if sink.len().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(sink.len().await, 1);
    }
}
