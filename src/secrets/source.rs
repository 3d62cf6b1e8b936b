//! Secret sources the sync bridge reads from.
//!
//! [`VaultSecretSource`] reads the KV v2 engine of the secret store;
//! [`MemorySecretSource`] backs tests and the dev loop.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use vaultrs::client::{VaultClient, VaultClientSettingsBuilder};
use vaultrs::error::ClientError;
use vaultrs::kv2;

use super::error::{Result, SecretsError};
use super::path::SecretPath;
use super::types::SecretString;

/// Key/value pairs stored at one secret path.
pub type SecretData = BTreeMap<String, SecretString>;

/// Read access to versioned secrets.
#[async_trait]
pub trait SecretSource: Send + Sync + fmt::Debug {
    async fn read(&self, path: &SecretPath) -> Result<SecretData>;
}

/// Connection settings for the Vault KV v2 source.
#[derive(Debug, Clone)]
pub struct VaultSourceConfig {
    pub address: String,
    pub token: Option<SecretString>,
}

/// KV v2 reader backed by `vaultrs`.
pub struct VaultSecretSource {
    client: VaultClient,
    address: String,
}

impl fmt::Debug for VaultSecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultSecretSource").field("address", &self.address).finish_non_exhaustive()
    }
}

impl VaultSecretSource {
    pub fn new(config: VaultSourceConfig) -> Result<Self> {
        if config.address.is_empty() {
            return Err(SecretsError::config_error("Vault address cannot be empty"));
        }

        let mut settings_builder = VaultClientSettingsBuilder::default();
        settings_builder.address(&config.address);
        if let Some(ref token) = config.token {
            settings_builder.token(token.expose_secret());
        }

        let settings = settings_builder
            .build()
            .map_err(|e| SecretsError::config_error(format!("Invalid Vault configuration: {}", e)))?;
        let client = VaultClient::new(settings)
            .map_err(|e| SecretsError::connection_failed(format!("Failed to create Vault client: {}", e)))?;

        Ok(Self { client, address: config.address })
    }
}

#[async_trait]
impl SecretSource for VaultSecretSource {
    async fn read(&self, path: &SecretPath) -> Result<SecretData> {
        let secret: HashMap<String, String> =
            kv2::read(&self.client, path.mount(), &path.kv_path()).await.map_err(|e| classify(path, e))?;

        debug!(path = %path, keys = secret.len(), "Read secret from Vault");
        Ok(secret.into_iter().map(|(k, v)| (k, SecretString::new(v))).collect())
    }
}

fn classify(path: &SecretPath, error: ClientError) -> SecretsError {
    match error {
        ClientError::APIError { code: 404, .. } => SecretsError::not_found(path.to_string()),
        ClientError::APIError { code: 401 | 403, .. } => {
            SecretsError::authentication_failed(format!("permission denied reading '{}'", path))
        }
        ClientError::APIError { code: 503, .. } => SecretsError::Sealed,
        ClientError::APIError { code, errors } => {
            SecretsError::backend_error(format!("Vault returned {} for '{}': {}", code, path, errors.join("; ")))
        }
        other => SecretsError::connection_failed(format!("Vault request for '{}' failed: {}", path, other)),
    }
}

/// In-process secret store.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretSource {
    secrets: Arc<RwLock<HashMap<String, SecretData>>>,
    unavailable: Arc<RwLock<bool>>,
    reads: Arc<AtomicU64>,
}

impl MemorySecretSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put<K, V>(&self, path: &SecretPath, data: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        let data = data.into_iter().map(|(k, v)| (k.into(), SecretString::new(v))).collect();
        self.secrets.write().await.insert(path.to_string(), data);
    }

    pub async fn remove(&self, path: &SecretPath) {
        self.secrets.write().await.remove(&path.to_string());
    }

    /// Make every read fail as if the store were unreachable.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretSource for MemorySecretSource {
    async fn read(&self, path: &SecretPath) -> Result<SecretData> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if *self.unavailable.read().await {
            return Err(SecretsError::connection_failed("connection refused"));
        }
        self.secrets.read().await.get(&path.to_string()).cloned().ok_or_else(|| SecretsError::not_found(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_source_reads_what_was_put() {
        let source = MemorySecretSource::new();
        let path = SecretPath::platform("payments", "db").unwrap();
        source.put(&path, [("username", "app"), ("password", "hunter2")]).await;

        let data = source.read(&path).await.unwrap();
        assert_eq!(data["password"].expose_secret(), "hunter2");
        assert_eq!(source.read_count(), 1);
    }

    #[tokio::test]
    async fn memory_source_errors() {
        let source = MemorySecretSource::new();
        let path = SecretPath::platform("payments", "db").unwrap();

        assert!(matches!(source.read(&path).await, Err(SecretsError::NotFound { .. })));

        source.set_unavailable(true).await;
        let err = source.read(&path).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn vault_source_requires_address() {
        let config = VaultSourceConfig { address: String::new(), token: None };
        assert!(VaultSecretSource::new(config).is_err());
    }

    #[test]
    fn classifies_api_errors() {
        let path = SecretPath::platform("payments", "db").unwrap();
        let missing = classify(&path, ClientError::APIError { code: 404, errors: vec![] });
        assert!(matches!(missing, SecretsError::NotFound { .. }));

        let sealed = classify(&path, ClientError::APIError { code: 503, errors: vec!["Vault is sealed".into()] });
        assert!(matches!(sealed, SecretsError::Sealed));

        let denied = classify(&path, ClientError::APIError { code: 403, errors: vec![] });
        assert!(!denied.is_retryable());
    }
}
