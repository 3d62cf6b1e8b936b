//! Sinks that materialize synced secrets as platform-native objects.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::error::{Result, SecretsError};
use super::source::SecretData;

/// Annotation recording which secret path an object was synced from.
pub const SOURCE_PATH_ANNOTATION: &str = "sealplane.io/source-path";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Health of one synced path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncCondition {
    /// Never synced successfully and below the failure threshold
    Pending,
    Synced,
    /// Consecutive failures reached the threshold
    Failing,
}

/// Status block carried by every materialized object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathStatus {
    pub path: String,
    pub condition: SyncCondition,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl PathStatus {
    pub fn pending(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            condition: SyncCondition::Pending,
            last_synced_at: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

/// One platform secret object.
#[derive(Clone, PartialEq)]
pub struct SecretObject {
    pub name: String,
    pub namespace: String,
    pub source_path: String,
    pub data: SecretData,
    pub status: PathStatus,
}

impl fmt::Debug for SecretObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretObject")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("source_path", &self.source_path)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .field("status", &self.status)
            .finish()
    }
}

/// Destination for materialized secret objects; `apply` is an upsert.
#[async_trait]
pub trait SecretSink: Send + Sync + fmt::Debug {
    async fn apply(&self, object: &SecretObject) -> Result<()>;
}

/// Keeps objects in memory, keyed by `<namespace>/<name>`.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretSink {
    objects: Arc<RwLock<HashMap<String, SecretObject>>>,
    writes: Arc<RwLock<u64>>,
}

impl MemorySecretSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Option<SecretObject> {
        self.objects.read().await.get(&format!("{}/{}", namespace, name)).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn write_count(&self) -> u64 {
        *self.writes.read().await
    }
}

#[async_trait]
impl SecretSink for MemorySecretSink {
    async fn apply(&self, object: &SecretObject) -> Result<()> {
        self.objects.write().await.insert(format!("{}/{}", object.namespace, object.name), object.clone());
        *self.writes.write().await += 1;
        Ok(())
    }
}

/// Writes Kubernetes `Secret` manifests, one YAML file per object.
#[derive(Debug, Clone)]
pub struct ManifestSecretSink {
    output_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ManifestMetadata,
    #[serde(rename = "type")]
    pub secret_type: String,
    pub data: BTreeMap<String, String>,
    pub status: PathStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl SecretManifest {
    pub fn from_object(object: &SecretObject) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Secret".to_string(),
            metadata: ManifestMetadata {
                name: object.name.clone(),
                namespace: object.namespace.clone(),
                labels: BTreeMap::from([(MANAGED_BY_LABEL.to_string(), "sealplane".to_string())]),
                annotations: BTreeMap::from([(SOURCE_PATH_ANNOTATION.to_string(), object.source_path.clone())]),
            },
            secret_type: "Opaque".to_string(),
            data: object.data.iter().map(|(k, v)| (k.clone(), STANDARD.encode(v.expose_secret()))).collect(),
            status: object.status.clone(),
        }
    }
}

impl ManifestSecretSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self { output_dir: output_dir.into() }
    }

    pub fn manifest_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.output_dir.join(format!("{}-{}.yaml", namespace, name))
    }

    async fn write_atomic(&self, target: &Path, contents: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let tmp = target.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, contents).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
        tokio::fs::rename(&tmp, target).await
    }
}

#[async_trait]
impl SecretSink for ManifestSecretSink {
    async fn apply(&self, object: &SecretObject) -> Result<()> {
        let rendered = serde_yaml::to_string(&SecretManifest::from_object(object))?;
        let target = self.manifest_path(&object.namespace, &object.name);
        self.write_atomic(&target, &rendered)
            .await
            .map_err(|e| SecretsError::sink_error(&object.name, format!("failed to write {}: {}", target.display(), e)))?;
        debug!(object = %object.name, file = %target.display(), "Wrote secret manifest");
        Ok(())
    }
}
