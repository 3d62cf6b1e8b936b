//! Exclusive state lock.
//!
//! The lock is a file created with `create_new`, so exactly one process wins.
//! The winner writes its [`LockInfo`] into the file; losers read it back to
//! report who holds the state. The file is removed when the guard drops.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{Result, SealplaneError};

const POLL_INTERVAL_MS: u64 = 250;
const POLL_JITTER_MS: u64 = 150;

/// How to behave when another run holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    FailFast,
    Wait,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub id: String,
    pub pid: u32,
    pub operation: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn new(operation: &str) -> Self {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
            operation: operation.to_string(),
            holder: format!("{} (pid {})", user, std::process::id()),
            acquired_at: Utc::now(),
        }
    }
}

/// Held for the duration of a plan, apply or destroy.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
    info: LockInfo,
    _file: File,
}

impl StateLock {
    /// Acquire the lock at `path`. In [`LockMode::Wait`] the call polls with
    /// jitter until `wait_timeout` elapses.
    pub async fn acquire(path: &Path, operation: &str, mode: LockMode, wait_timeout: Duration) -> Result<Self> {
        let started = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(path, operation)? {
                info!(lock_id = %lock.info.id, operation, "Acquired state lock");
                return Ok(lock);
            }

            let holder = read_lock_info(path)?;
            let (lock_id, holder_desc) = match &holder {
                Some(info) => (info.id.clone(), format!("{} running {}", info.holder, info.operation)),
                None => ("unknown".to_string(), "an unknown process".to_string()),
            };

            if mode == LockMode::FailFast || started.elapsed() >= wait_timeout {
                return Err(SealplaneError::StateLocked { lock_id, holder: holder_desc });
            }

            let jitter = rand::thread_rng().gen_range(0..POLL_JITTER_MS);
            debug!(lock_id = %lock_id, "State is locked, waiting");
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS + jitter)).await;
        }
    }

    fn try_acquire(path: &Path, operation: &str) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SealplaneError::io(e, format!("Failed to create {}", parent.display())))?;
        }

        let info = LockInfo::new(operation);
        let body = serde_json::to_vec_pretty(&info)?;

        let mut file = match OpenOptions::new().create_new(true).read(true).write(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => return Err(SealplaneError::io(err, format!("Failed to create lock {}", path.display()))),
        };

        let written = file.write_all(&body).and_then(|_| file.sync_all());
        discard_on_error(path, written)?;

        Ok(Some(Self { path: path.to_path_buf(), info, _file: file }))
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        // Only remove the file if it is still ours; a force-unlock may have
        // handed it to someone else.
        match read_lock_info(&self.path) {
            Ok(Some(info)) if info.id == self.info.id => {
                let _ = fs::remove_file(&self.path);
            }
            _ => {}
        }
    }
}

/// A lock file without readable metadata would block every later run, so a
/// failed write removes the file it just created.
fn discard_on_error<T>(path: &Path, written: std::io::Result<T>) -> Result<T> {
    written.map_err(|e| {
        if let Err(cleanup) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %cleanup, "Failed to remove half-written lock file");
        }
        SealplaneError::io(e, "Failed to write lock metadata")
    })
}

/// Read the current holder, if any. An unreadable lock file reports `None`.
pub fn read_lock_info(path: &Path) -> Result<Option<LockInfo>> {
    match fs::read(path) {
        Ok(raw) => Ok(serde_json::from_slice(&raw).ok()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(SealplaneError::io(err, format!("Failed to read lock {}", path.display()))),
    }
}

/// Remove a stale lock. Refuses unless `lock_id` matches the recorded holder.
pub fn force_unlock(path: &Path, lock_id: &str) -> Result<()> {
    match read_lock_info(path)? {
        Some(info) if info.id == lock_id => {
            fs::remove_file(path).map_err(|e| SealplaneError::io(e, format!("Failed to remove {}", path.display())))?;
            warn!(lock_id, holder = %info.holder, "State lock forcibly released");
            Ok(())
        }
        Some(info) => Err(SealplaneError::validation_field(
            format!("lock id '{}' does not match current holder '{}'", lock_id, info.id),
            "lock_id",
        )),
        None if path.exists() => Err(SealplaneError::state(format!(
            "lock file {} is unreadable; remove it manually",
            path.display()
        ))),
        None => Err(SealplaneError::state("state is not locked")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.lock");

        let first = StateLock::acquire(&path, "apply", LockMode::FailFast, Duration::ZERO).await.unwrap();
        let err = StateLock::acquire(&path, "plan", LockMode::FailFast, Duration::ZERO).await.unwrap_err();

        match err {
            SealplaneError::StateLocked { lock_id, holder } => {
                assert_eq!(lock_id, first.info().id);
                assert!(holder.contains("apply"));
            }
            other => panic!("expected StateLocked, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.lock");

        {
            let _lock = StateLock::acquire(&path, "apply", LockMode::FailFast, Duration::ZERO).await.unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
        assert!(StateLock::acquire(&path, "apply", LockMode::FailFast, Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn wait_mode_acquires_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.lock");
        let first = StateLock::acquire(&path, "apply", LockMode::FailFast, Duration::ZERO).await.unwrap();

        let waiter_path = path.clone();
        let waiter = tokio::spawn(async move {
            StateLock::acquire(&waiter_path, "apply", LockMode::Wait, Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(first);

        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.info().operation, "apply");
    }

    #[tokio::test]
    async fn wait_mode_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.lock");
        let _first = StateLock::acquire(&path, "apply", LockMode::FailFast, Duration::ZERO).await.unwrap();

        let err = StateLock::acquire(&path, "apply", LockMode::Wait, Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, SealplaneError::StateLocked { .. }));
    }

    #[tokio::test]
    async fn failed_metadata_write_leaves_no_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.lock");
        File::create(&path).unwrap();

        let failed: std::io::Result<()> = Err(std::io::Error::other("no space left on device"));
        let err = discard_on_error(&path, failed).unwrap_err();

        assert!(matches!(err, SealplaneError::Io { .. }), "got {:?}", err);
        assert!(!path.exists());
        assert!(StateLock::acquire(&path, "apply", LockMode::FailFast, Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn force_unlock_requires_matching_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.lock");
        let lock = StateLock::acquire(&path, "apply", LockMode::FailFast, Duration::ZERO).await.unwrap();
        let id = lock.info().id.clone();
        std::mem::forget(lock);

        assert!(force_unlock(&path, "not-the-id").is_err());
        assert!(path.exists());
        force_unlock(&path, &id).unwrap();
        assert!(!path.exists());
        assert!(force_unlock(&path, &id).is_err());
    }
}
