//! In-memory cloud simulation.
//!
//! Behaves like the real control plane for everything convergence observes:
//! provider-assigned key ids, globally unique bucket names, policy version
//! limits and tag semantics. It also supports failure and latency injection
//! and counts every mutating call, which is what the idempotence tests assert
//! on. State can be snapshotted to disk so the CLI's `memory` provider
//! survives across invocations.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    CloudProvider, CreateBucketRequest, CreateKeyRequest, CreateOidcProviderRequest, KeyState, ObservedBucket, ObservedKey,
    ObservedPolicy, ObservedProvider, ObservedRole, TagTarget,
};
use crate::domain::tags::ALIAS_TAG;
use crate::domain::{arn, Tags};
use crate::errors::{Result, SealplaneError};
use crate::secrets::SecretBytes;
use crate::unseal::KeyDecryptor;

const POLICY_VERSION_LIMIT: usize = 5;
const CIPHERTEXT_MAGIC: &[u8] = b"spsim1:";

/// Failure modes tests can inject in front of a named operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Retryable, like a throttling or 5xx response
    Throttled,
    /// Fatal permission failure
    AccessDenied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimKey {
    observed: ObservedKey,
    alias: String,
    material: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimPolicy {
    observed: ObservedPolicy,
    versions: Vec<(String, String)>,
    next_version: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CloudState {
    account_id: String,
    region: String,
    keys: BTreeMap<String, SimKey>,
    aliases: BTreeMap<String, String>,
    buckets: BTreeMap<String, ObservedBucket>,
    foreign_buckets: BTreeSet<String>,
    providers: BTreeMap<String, ObservedProvider>,
    roles: BTreeMap<String, ObservedRole>,
    policies: BTreeMap<String, SimPolicy>,
    attachments: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Default)]
struct Faults {
    failures: HashMap<String, (InjectedFailure, u32)>,
    delays: HashMap<String, Duration>,
}

#[derive(Debug, Clone)]
pub struct InMemoryCloud {
    state: Arc<Mutex<CloudState>>,
    faults: Arc<Mutex<Faults>>,
    mutation_log: Arc<Mutex<Vec<String>>>,
    mutations: Arc<AtomicU64>,
}

impl Default for InMemoryCloud {
    fn default() -> Self {
        Self::new("123456789012", "us-east-1")
    }
}

impl InMemoryCloud {
    pub fn new(account_id: &str, region: &str) -> Self {
        let state = CloudState { account_id: account_id.to_string(), region: region.to_string(), ..Default::default() };
        Self::from_state(state)
    }

    fn from_state(state: CloudState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            faults: Arc::new(Mutex::new(Faults::default())),
            mutation_log: Arc::new(Mutex::new(Vec::new())),
            mutations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Load a snapshot written by [`InMemoryCloud::save`], or start empty.
    pub async fn load_or_new(path: &Path, account_id: &str, region: &str) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                let state: CloudState = serde_json::from_str(&raw).map_err(|e| SealplaneError::Serialization {
                    source: e,
                    context: format!("Failed to parse simulated cloud snapshot {}", path.display()),
                })?;
                Ok(Self::from_state(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(account_id, region)),
            Err(e) => Err(SealplaneError::io(e, format!("Failed to read {}", path.display()))),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let raw = {
            let state = self.state.lock().await;
            serde_json::to_string_pretty(&*state)?
        };
        tokio::fs::write(path, raw)
            .await
            .map_err(|e| SealplaneError::io(e, format!("Failed to write {}", path.display())))
    }

    /// Number of mutating calls served so far.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Names of the mutating calls served so far, in order.
    pub async fn mutation_log(&self) -> Vec<String> {
        self.mutation_log.lock().await.clone()
    }

    /// Make `operation` fail `times` times before succeeding again.
    pub async fn fail_next(&self, operation: &str, failure: InjectedFailure, times: u32) {
        self.faults.lock().await.failures.insert(operation.to_string(), (failure, times));
    }

    /// Delay every call to `operation` until cleared.
    pub async fn delay(&self, operation: &str, delay: Duration) {
        self.faults.lock().await.delays.insert(operation.to_string(), delay);
    }

    pub async fn clear_faults(&self) {
        let mut faults = self.faults.lock().await;
        faults.failures.clear();
        faults.delays.clear();
    }

    /// Mark a bucket name as owned by another account.
    pub async fn reserve_foreign_bucket(&self, name: &str) {
        self.state.lock().await.foreign_buckets.insert(name.to_string());
    }

    /// Change a role's trust policy out of band (not counted as a mutation).
    pub async fn overwrite_trust_policy(&self, role_name: &str, trust_policy: &str) {
        if let Some(role) = self.state.lock().await.roles.get_mut(role_name) {
            role.trust_policy = trust_policy.to_string();
        }
    }

    /// Schedule a key for deletion out of band.
    pub async fn schedule_key_deletion(&self, key_id: &str) {
        if let Some(key) = self.state.lock().await.keys.get_mut(key_id) {
            key.observed.state = KeyState::PendingDeletion;
        }
    }

    /// Drop an alias out of band, leaving its key unaliased.
    pub async fn remove_alias(&self, alias: &str) {
        self.state.lock().await.aliases.remove(alias);
    }

    /// Insert a bucket with no public access block and no default encryption,
    /// as created by hand outside sealplane (not counted as a mutation).
    pub async fn insert_unprotected_bucket(&self, name: &str, tags: &Tags) {
        let bucket = ObservedBucket {
            name: name.to_string(),
            arn: arn::bucket(name),
            encryption_key_arn: None,
            public_access_blocked: false,
            tags: tags.clone(),
        };
        self.state.lock().await.buckets.insert(name.to_string(), bucket);
    }

    /// Whether the bucket exists in this account.
    pub async fn has_bucket(&self, name: &str) -> bool {
        self.state.lock().await.buckets.contains_key(name)
    }

    /// Encrypt under a simulated key; the inverse of [`KeyDecryptor::decrypt`].
    pub async fn encrypt(&self, key_ref: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.enter("encrypt").await?;
        let state = self.state.lock().await;
        let key = resolve_key(&state, key_ref)
            .ok_or_else(|| SealplaneError::provisioning("kms_key", format!("NotFoundException: key '{}' does not exist", key_ref)))?;
        if key.observed.state != KeyState::Enabled {
            return Err(SealplaneError::provisioning("kms_key", "KMSInvalidStateException: key is not enabled"));
        }

        let mut ciphertext = CIPHERTEXT_MAGIC.to_vec();
        ciphertext.extend_from_slice(key.observed.key_id.as_bytes());
        ciphertext.push(b':');
        ciphertext.extend(keystream_xor(&key.material, plaintext));
        Ok(ciphertext)
    }

    async fn enter(&self, operation: &str) -> Result<()> {
        let (delay, failure) = {
            let mut faults = self.faults.lock().await;
            let delay = faults.delays.get(operation).copied();
            let failure = match faults.failures.get_mut(operation) {
                Some((failure, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*failure)
                }
                _ => None,
            };
            (delay, failure)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match failure {
            Some(InjectedFailure::Throttled) => {
                Err(SealplaneError::provisioning_retryable(operation, "ThrottlingException: Rate exceeded"))
            }
            Some(InjectedFailure::AccessDenied) => Err(SealplaneError::provisioning(
                operation,
                "AccessDeniedException: caller is not authorized to perform this operation",
            )),
            None => Ok(()),
        }
    }

    async fn mutated(&self, operation: &str) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.mutation_log.lock().await.push(operation.to_string());
        debug!(operation, "simulated cloud mutation");
    }
}

fn resolve_key<'a>(state: &'a CloudState, key_ref: &str) -> Option<&'a SimKey> {
    let key_id = if key_ref.starts_with("alias/") {
        state.aliases.get(key_ref)?.as_str()
    } else {
        key_ref.rsplit('/').next().unwrap_or(key_ref)
    };
    state.keys.get(key_id)
}

fn keystream_xor(material: &str, input: &[u8]) -> Vec<u8> {
    input
        .chunks(32)
        .enumerate()
        .flat_map(|(block, chunk)| {
            let mut hasher = Sha256::new();
            hasher.update(material.as_bytes());
            hasher.update((block as u64).to_be_bytes());
            let pad = hasher.finalize();
            chunk.iter().zip(pad.iter()).map(|(b, p)| b ^ p).collect::<Vec<u8>>()
        })
        .collect()
}

fn not_found(resource: &str, id: &str) -> SealplaneError {
    SealplaneError::provisioning(resource, format!("NoSuchEntity: '{}' does not exist", id))
}

#[async_trait]
impl CloudProvider for InMemoryCloud {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn account_id(&self) -> Result<String> {
        self.enter("account_id").await?;
        Ok(self.state.lock().await.account_id.clone())
    }

    async fn describe_key(&self, key_id: &str) -> Result<Option<ObservedKey>> {
        self.enter("describe_key").await?;
        let state = self.state.lock().await;
        Ok(resolve_key(&state, key_id).map(|k| k.observed.clone()))
    }

    async fn find_key_by_alias(&self, alias: &str) -> Result<Option<ObservedKey>> {
        self.enter("find_key_by_alias").await?;
        let state = self.state.lock().await;
        Ok(state.aliases.get(alias).and_then(|id| state.keys.get(id)).map(|k| k.observed.clone()))
    }

    async fn find_unaliased_key(&self, alias: &str) -> Result<Option<ObservedKey>> {
        self.enter("find_unaliased_key").await?;
        let state = self.state.lock().await;
        let aliased: BTreeSet<&String> = state.aliases.values().collect();
        Ok(state
            .keys
            .values()
            .filter(|k| k.observed.state != KeyState::PendingDeletion)
            .filter(|k| k.observed.tags.get(ALIAS_TAG) == Some(alias))
            .find(|k| !aliased.contains(&k.observed.key_id))
            .map(|k| k.observed.clone()))
    }

    async fn create_key(&self, request: &CreateKeyRequest) -> Result<ObservedKey> {
        self.enter("create_key").await?;
        let observed = {
            let mut state = self.state.lock().await;
            if state.aliases.contains_key(&request.alias) {
                return Err(SealplaneError::name_collision("kms alias", request.alias.clone()));
            }
            let key_id = uuid::Uuid::new_v4().to_string();
            let mut material = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut material);
            let observed = ObservedKey {
                key_id: key_id.clone(),
                arn: arn::key(&state.region, &state.account_id, &key_id),
                state: KeyState::Enabled,
                rotation_enabled: request.rotation_enabled,
                policy: Some(request.policy.clone()),
                tags: request.tags.clone(),
            };
            state.keys.insert(
                key_id.clone(),
                SimKey { observed: observed.clone(), alias: request.alias.clone(), material: hex::encode(material) },
            );
            observed
        };
        self.mutated("create_key").await;

        if let Err(e) = self.enter("create_alias").await {
            if let Some(key) = self.state.lock().await.keys.get_mut(&observed.key_id) {
                key.observed.state = KeyState::PendingDeletion;
            }
            return Err(e);
        }
        self.state.lock().await.aliases.insert(request.alias.clone(), observed.key_id.clone());
        Ok(observed)
    }

    async fn create_alias(&self, alias: &str, key_id: &str) -> Result<()> {
        self.enter("create_alias").await?;
        {
            let mut state = self.state.lock().await;
            if state.aliases.contains_key(alias) {
                return Err(SealplaneError::name_collision("kms alias", alias));
            }
            if !state.keys.contains_key(key_id) {
                return Err(not_found("kms_key", key_id));
            }
            state.aliases.insert(alias.to_string(), key_id.to_string());
        }
        self.mutated("create_alias").await;
        Ok(())
    }

    async fn put_key_policy(&self, key_id: &str, policy: &str) -> Result<()> {
        self.enter("put_key_policy").await?;
        {
            let mut state = self.state.lock().await;
            let key = state.keys.get_mut(key_id).ok_or_else(|| not_found("kms_key", key_id))?;
            key.observed.policy = Some(policy.to_string());
        }
        self.mutated("put_key_policy").await;
        Ok(())
    }

    async fn set_key_rotation(&self, key_id: &str, enabled: bool) -> Result<()> {
        self.enter("set_key_rotation").await?;
        {
            let mut state = self.state.lock().await;
            let key = state.keys.get_mut(key_id).ok_or_else(|| not_found("kms_key", key_id))?;
            key.observed.rotation_enabled = enabled;
        }
        self.mutated("set_key_rotation").await;
        Ok(())
    }

    async fn describe_bucket(&self, name: &str) -> Result<Option<ObservedBucket>> {
        self.enter("describe_bucket").await?;
        let state = self.state.lock().await;
        if state.foreign_buckets.contains(name) {
            return Err(SealplaneError::name_collision("bucket", name));
        }
        Ok(state.buckets.get(name).cloned())
    }

    async fn create_bucket(&self, request: &CreateBucketRequest) -> Result<()> {
        let name = request.name.as_str();
        self.enter("create_bucket").await?;
        {
            let state = self.state.lock().await;
            if state.foreign_buckets.contains(name) {
                return Err(SealplaneError::name_collision("bucket", name));
            }
            if state.buckets.contains_key(name) {
                return Err(SealplaneError::provisioning("s3_bucket", "BucketAlreadyOwnedByYou"));
            }
        }
        // A failure securing the bucket leaves nothing behind.
        self.enter("put_public_access_block").await?;
        self.enter("put_bucket_encryption").await?;
        {
            let mut state = self.state.lock().await;
            state.buckets.insert(
                name.to_string(),
                ObservedBucket {
                    name: name.to_string(),
                    arn: arn::bucket(name),
                    encryption_key_arn: Some(request.key_arn.clone()),
                    public_access_blocked: true,
                    tags: request.tags.clone(),
                },
            );
        }
        self.mutated("create_bucket").await;
        Ok(())
    }

    async fn put_bucket_encryption(&self, name: &str, key_arn: &str) -> Result<()> {
        self.enter("put_bucket_encryption").await?;
        {
            let mut state = self.state.lock().await;
            let bucket = state.buckets.get_mut(name).ok_or_else(|| not_found("s3_bucket", name))?;
            bucket.encryption_key_arn = Some(key_arn.to_string());
        }
        self.mutated("put_bucket_encryption").await;
        Ok(())
    }

    async fn put_public_access_block(&self, name: &str) -> Result<()> {
        self.enter("put_public_access_block").await?;
        {
            let mut state = self.state.lock().await;
            let bucket = state.buckets.get_mut(name).ok_or_else(|| not_found("s3_bucket", name))?;
            bucket.public_access_blocked = true;
        }
        self.mutated("put_public_access_block").await;
        Ok(())
    }

    async fn delete_bucket(&self, name: &str) -> Result<()> {
        self.enter("delete_bucket").await?;
        {
            let mut state = self.state.lock().await;
            state.buckets.remove(name).ok_or_else(|| not_found("s3_bucket", name))?;
        }
        self.mutated("delete_bucket").await;
        Ok(())
    }

    async fn describe_oidc_provider(&self, arn: &str) -> Result<Option<ObservedProvider>> {
        self.enter("describe_oidc_provider").await?;
        Ok(self.state.lock().await.providers.get(arn).cloned())
    }

    async fn create_oidc_provider(&self, request: &CreateOidcProviderRequest) -> Result<String> {
        self.enter("create_oidc_provider").await?;
        let provider_arn = {
            let mut state = self.state.lock().await;
            let without_scheme = request.url.trim_start_matches("https://");
            let provider_arn = arn::oidc_provider(&state.account_id, without_scheme);
            if state.providers.contains_key(&provider_arn) {
                return Err(SealplaneError::provisioning(
                    "oidc_provider",
                    format!("EntityAlreadyExists: provider for {} already exists", request.url),
                ));
            }
            state.providers.insert(
                provider_arn.clone(),
                ObservedProvider {
                    arn: provider_arn.clone(),
                    url: without_scheme.to_string(),
                    client_ids: request.client_ids.clone(),
                    thumbprints: request.thumbprints.clone(),
                    tags: request.tags.clone(),
                },
            );
            provider_arn
        };
        self.mutated("create_oidc_provider").await;
        Ok(provider_arn)
    }

    async fn update_oidc_thumbprints(&self, arn: &str, thumbprints: &[String]) -> Result<()> {
        self.enter("update_oidc_thumbprints").await?;
        {
            let mut state = self.state.lock().await;
            let provider = state.providers.get_mut(arn).ok_or_else(|| not_found("oidc_provider", arn))?;
            provider.thumbprints = thumbprints.to_vec();
        }
        self.mutated("update_oidc_thumbprints").await;
        Ok(())
    }

    async fn add_oidc_client_id(&self, arn: &str, client_id: &str) -> Result<()> {
        self.enter("add_oidc_client_id").await?;
        {
            let mut state = self.state.lock().await;
            let provider = state.providers.get_mut(arn).ok_or_else(|| not_found("oidc_provider", arn))?;
            if !provider.client_ids.iter().any(|c| c == client_id) {
                provider.client_ids.push(client_id.to_string());
            }
        }
        self.mutated("add_oidc_client_id").await;
        Ok(())
    }

    async fn describe_role(&self, name: &str) -> Result<Option<ObservedRole>> {
        self.enter("describe_role").await?;
        Ok(self.state.lock().await.roles.get(name).cloned())
    }

    async fn create_role(&self, name: &str, trust_policy: &str, tags: &Tags) -> Result<ObservedRole> {
        self.enter("create_role").await?;
        let role = {
            let mut state = self.state.lock().await;
            if state.roles.contains_key(name) {
                return Err(SealplaneError::provisioning("iam_role", format!("EntityAlreadyExists: role {}", name)));
            }
            let role = ObservedRole {
                name: name.to_string(),
                arn: arn::role(&state.account_id, name),
                trust_policy: trust_policy.to_string(),
                tags: tags.clone(),
            };
            state.roles.insert(name.to_string(), role.clone());
            role
        };
        self.mutated("create_role").await;
        Ok(role)
    }

    async fn update_trust_policy(&self, name: &str, trust_policy: &str) -> Result<()> {
        self.enter("update_trust_policy").await?;
        {
            let mut state = self.state.lock().await;
            let role = state.roles.get_mut(name).ok_or_else(|| not_found("iam_role", name))?;
            role.trust_policy = trust_policy.to_string();
        }
        self.mutated("update_trust_policy").await;
        Ok(())
    }

    async fn describe_policy(&self, arn: &str) -> Result<Option<ObservedPolicy>> {
        self.enter("describe_policy").await?;
        Ok(self.state.lock().await.policies.get(arn).map(|p| p.observed.clone()))
    }

    async fn create_policy(&self, name: &str, document: &str, tags: &Tags) -> Result<ObservedPolicy> {
        self.enter("create_policy").await?;
        let observed = {
            let mut state = self.state.lock().await;
            let policy_arn = arn::policy(&state.account_id, name);
            if state.policies.contains_key(&policy_arn) {
                return Err(SealplaneError::provisioning("iam_policy", format!("EntityAlreadyExists: policy {}", name)));
            }
            let observed = ObservedPolicy {
                name: name.to_string(),
                arn: policy_arn.clone(),
                default_version_id: "v1".to_string(),
                document: document.to_string(),
                tags: tags.clone(),
            };
            state.policies.insert(
                policy_arn,
                SimPolicy {
                    observed: observed.clone(),
                    versions: vec![("v1".to_string(), document.to_string())],
                    next_version: 2,
                },
            );
            observed
        };
        self.mutated("create_policy").await;
        Ok(observed)
    }

    async fn create_policy_version(&self, arn: &str, document: &str) -> Result<String> {
        self.enter("create_policy_version").await?;
        let version_id = {
            let mut state = self.state.lock().await;
            let policy = state.policies.get_mut(arn).ok_or_else(|| not_found("iam_policy", arn))?;
            if policy.versions.len() >= POLICY_VERSION_LIMIT {
                let default = policy.observed.default_version_id.clone();
                if let Some(oldest) = policy.versions.iter().position(|(id, _)| *id != default) {
                    policy.versions.remove(oldest);
                }
            }
            let version_id = format!("v{}", policy.next_version);
            policy.next_version += 1;
            policy.versions.push((version_id.clone(), document.to_string()));
            policy.observed.default_version_id = version_id.clone();
            policy.observed.document = document.to_string();
            version_id
        };
        self.mutated("create_policy_version").await;
        Ok(version_id)
    }

    async fn list_attached_policies(&self, role_name: &str) -> Result<Vec<String>> {
        self.enter("list_attached_policies").await?;
        let state = self.state.lock().await;
        if !state.roles.contains_key(role_name) {
            return Err(not_found("iam_role", role_name));
        }
        Ok(state.attachments.get(role_name).map(|a| a.iter().cloned().collect()).unwrap_or_default())
    }

    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<()> {
        self.enter("attach_role_policy").await?;
        {
            let mut state = self.state.lock().await;
            if !state.roles.contains_key(role_name) {
                return Err(not_found("iam_role", role_name));
            }
            if !state.policies.contains_key(policy_arn) {
                return Err(not_found("iam_policy", policy_arn));
            }
            state.attachments.entry(role_name.to_string()).or_default().insert(policy_arn.to_string());
        }
        self.mutated("attach_role_policy").await;
        Ok(())
    }

    async fn tag_resource(&self, target: &TagTarget, tags: &Tags) -> Result<()> {
        self.enter("tag_resource").await?;
        {
            let mut state = self.state.lock().await;
            let existing = match target {
                TagTarget::Key(id) => state.keys.get_mut(id).map(|k| &mut k.observed.tags),
                TagTarget::Bucket(name) => state.buckets.get_mut(name).map(|b| &mut b.tags),
                TagTarget::OidcProvider(arn) => state.providers.get_mut(arn).map(|p| &mut p.tags),
                TagTarget::Role(name) => state.roles.get_mut(name).map(|r| &mut r.tags),
                TagTarget::Policy(arn) => state.policies.get_mut(arn).map(|p| &mut p.observed.tags),
            };
            let existing = existing.ok_or_else(|| not_found("tag_resource", &format!("{:?}", target)))?;
            for (key, value) in tags.iter() {
                existing.insert(key.clone(), value.clone());
            }
        }
        self.mutated("tag_resource").await;
        Ok(())
    }
}

#[async_trait]
impl KeyDecryptor for InMemoryCloud {
    async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<SecretBytes> {
        self.enter("decrypt").await?;
        let body = ciphertext
            .strip_prefix(CIPHERTEXT_MAGIC)
            .ok_or_else(|| SealplaneError::unseal("InvalidCiphertextException: unrecognised ciphertext", 0))?;
        let split = body
            .iter()
            .position(|b| *b == b':')
            .ok_or_else(|| SealplaneError::unseal("InvalidCiphertextException: missing key reference", 0))?;
        let embedded_key = std::str::from_utf8(&body[..split])
            .map_err(|_| SealplaneError::unseal("InvalidCiphertextException: malformed key reference", 0))?;

        let state = self.state.lock().await;
        let key = resolve_key(&state, key_id)
            .ok_or_else(|| SealplaneError::provisioning("kms_key", format!("NotFoundException: key '{}'", key_id)))?;
        if key.observed.key_id != embedded_key {
            return Err(SealplaneError::unseal("IncorrectKeyException: ciphertext was encrypted under a different key", 0));
        }
        if key.observed.state != KeyState::Enabled {
            return Err(SealplaneError::provisioning("kms_key", "KMSInvalidStateException: key is not enabled"));
        }
        Ok(SecretBytes::new(keystream_xor(&key.material, &body[split + 1..])))
    }
}
