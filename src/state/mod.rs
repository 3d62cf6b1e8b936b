//! # State
//!
//! The state file is the source of truth for every resource sealplane
//! manages: what was created, under which provider id, and whether the last
//! call against it completed. It is rewritten atomically (temp file, fsync,
//! rename) after every node of an apply, so an interrupted run never leaves a
//! torn record behind.

pub mod lock;

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::domain::ResourceHandle;
use crate::errors::{Result, SealplaneError};

pub use lock::{force_unlock, read_lock_info, LockInfo, LockMode, StateLock};

pub const STATE_VERSION: u32 = 1;
const STATE_FILE: &str = "sealplane.state.json";
const LOCK_FILE: &str = "sealplane.state.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Created,
    /// A call timed out; the resource may or may not exist.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub address: String,
    pub kind: String,
    pub status: ResourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    pub fn created(address: &str, handle: &dyn ResourceHandle, spec_hash: Option<String>) -> Self {
        Self {
            address: address.to_string(),
            kind: kind_of(address).to_string(),
            status: ResourceStatus::Created,
            id: Some(handle.id().to_string()),
            arn: Some(handle.arn().to_string()),
            attributes: handle.attributes(),
            spec_hash,
            updated_at: Utc::now(),
        }
    }

    /// Mark `address` as unknown, keeping whatever identifiers were known.
    pub fn unknown(address: &str, prior: Option<&ResourceRecord>) -> Self {
        Self {
            address: address.to_string(),
            kind: kind_of(address).to_string(),
            status: ResourceStatus::Unknown,
            id: prior.and_then(|r| r.id.clone()),
            arn: prior.and_then(|r| r.arn.clone()),
            attributes: prior.map(|r| r.attributes.clone()).unwrap_or_default(),
            spec_hash: None,
            updated_at: Utc::now(),
        }
    }

    /// Equality ignoring the timestamp.
    fn same_content(&self, other: &ResourceRecord) -> bool {
        self.address == other.address
            && self.status == other.status
            && self.id == other.id
            && self.arn == other.arn
            && self.attributes == other.attributes
            && self.spec_hash == other.spec_hash
    }
}

fn kind_of(address: &str) -> &str {
    address.split('.').next().unwrap_or(address)
}

/// Stable digest of a desired-state entity.
pub fn spec_hash<T: Serialize>(spec: &T) -> Result<String> {
    let canonical = serde_json::to_vec(spec)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outputs {
    pub bucket_id: String,
    pub key_id: String,
    pub role_arn: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    pub serial: u64,
    pub lineage: String,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            lineage: uuid::Uuid::new_v4().to_string(),
            resources: BTreeMap::new(),
            outputs: None,
            updated_at: None,
        }
    }
}

impl StateFile {
    pub fn get(&self, address: &str) -> Option<&ResourceRecord> {
        self.resources.get(address)
    }

    /// Recorded provider id for `address`, if it was ever created.
    pub fn recorded_id(&self, address: &str) -> Option<&str> {
        self.get(address).and_then(|r| r.id.as_deref())
    }

    /// Insert or replace a record. Returns true if the content changed.
    pub fn upsert(&mut self, record: ResourceRecord) -> bool {
        match self.resources.get(&record.address) {
            Some(existing) if existing.same_content(&record) => false,
            _ => {
                self.resources.insert(record.address.clone(), record);
                true
            }
        }
    }

    pub fn remove(&mut self, address: &str) -> Option<ResourceRecord> {
        self.resources.remove(address)
    }

    /// Returns true if the outputs changed.
    pub fn set_outputs(&mut self, outputs: Option<Outputs>) -> bool {
        if self.outputs == outputs {
            return false;
        }
        self.outputs = outputs;
        true
    }
}

/// Reads and writes the state file and owns the lock path next to it.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Load the state file; a missing file yields an empty state.
    pub fn load(&self) -> Result<StateFile> {
        let path = self.state_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(StateFile::default()),
            Err(err) => return Err(SealplaneError::io(err, format!("Failed to read {}", path.display()))),
        };

        let state: StateFile = serde_json::from_slice(&raw).map_err(|e| {
            SealplaneError::state_with_source(format!("State file {} is corrupt", path.display()), Box::new(e))
        })?;
        if state.version > STATE_VERSION {
            return Err(SealplaneError::state(format!(
                "State file version {} is newer than supported version {}",
                state.version, STATE_VERSION
            )));
        }
        Ok(state)
    }

    /// Bump the serial and atomically replace the state file.
    pub fn save(&self, state: &mut StateFile) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| SealplaneError::io(e, format!("Failed to create {}", self.dir.display())))?;

        state.serial += 1;
        state.updated_at = Some(Utc::now());
        let body = serde_json::to_vec_pretty(state)?;

        let path = self.state_path();
        let tmp = self.dir.join(format!(".{}.{}.tmp", STATE_FILE, uuid::Uuid::new_v4()));
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        if let Err(err) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(SealplaneError::io(err, format!("Failed to persist {}", path.display())));
        }

        debug!(serial = state.serial, path = %path.display(), "State persisted");
        Ok(())
    }
}
