//! Key Guardian: the KMS key that wraps the secret store's unseal material.
//!
//! The key policy delegates to IAM through the account root and nothing else.
//! Crypto use of the key is granted only by the federated role's scoped policy.

use tracing::{info, instrument, warn};

use super::Provisioner;
use crate::cloud::{CreateKeyRequest, KeyState, ObservedKey, TagTarget};
use crate::domain::tags::ALIAS_TAG;
use crate::domain::{arn, KeyHandle, PolicyDocument, Principal, Statement, StringList, KNOWN_AFTER_APPLY};
use crate::errors::{Result, SealplaneError};
use crate::reconcile::{ChangeAction, ResourceAddress};

const ADDRESS: ResourceAddress = ResourceAddress::Key;

/// Actions that touch key material.
const CRYPTO_ACTIONS: &[&str] = &[
    "*",
    "kms:*",
    "kms:Decrypt",
    "kms:Encrypt",
    "kms:GenerateDataKey",
    "kms:GenerateDataKey*",
    "kms:GenerateDataKeyWithoutPlaintext",
    "kms:ReEncrypt*",
    "kms:ReEncryptFrom",
    "kms:ReEncryptTo",
];

pub fn key_description(cluster_id: &str) -> String {
    format!("Vault auto-unseal key for cluster {}", cluster_id)
}

/// Key policy delegating all access control to IAM in `account_id`.
pub fn key_policy(account_id: &str) -> PolicyDocument {
    PolicyDocument::new(vec![Statement::allow("EnableIamDelegation", ["kms:*"])
        .with_principal(Principal::Aws(StringList::one(arn::account_root(account_id))))
        .on_resources(["*"])])
}

/// Reject key policies that hand key material to anyone but IAM-scoped principals.
pub fn validate_key_policy(policy: &PolicyDocument) -> Result<()> {
    if policy.statements.is_empty() {
        return Err(SealplaneError::provisioning(ADDRESS.as_str(), "key policy has no statements"));
    }
    for statement in &policy.statements {
        let sid = statement.sid.as_deref().unwrap_or("<unnamed>");
        let Some(principal) = &statement.principal else {
            return Err(SealplaneError::policy_validation(format!("key policy statement {} has no principal", sid)));
        };
        if principal.is_wildcard() {
            return Err(SealplaneError::policy_validation(format!(
                "key policy statement {} grants access to a wildcard principal",
                sid
            )));
        }
        if let Principal::Service(services) = principal {
            if statement.actions.iter().any(|a| CRYPTO_ACTIONS.contains(&a.as_str())) {
                return Err(SealplaneError::policy_validation(format!(
                    "key policy statement {} grants crypto actions to service principal(s) {}",
                    sid,
                    services.iter().cloned().collect::<Vec<_>>().join(", ")
                )));
            }
        }
    }
    Ok(())
}

impl Provisioner<'_> {
    /// Create the unseal key or converge an existing one to `policy` and the
    /// requested rotation setting. Identical arguments against a converged key
    /// issue no calls. A key carrying our alias tag but no alias (creation
    /// interrupted between the two calls) is adopted and re-aliased.
    #[instrument(skip(self, policy), fields(alias = %self.ctx.names.key_alias))]
    pub async fn create_or_update_key(&mut self, rotation_enabled: bool, policy: &PolicyDocument) -> Result<KeyHandle> {
        validate_key_policy(policy)?;
        let policy_json = policy.to_json()?;
        let provider = self.provider;
        let alias = self.ctx.names.key_alias.clone();
        let mut tags = self.ctx.tags.clone();
        tags.insert(ALIAS_TAG, alias.clone());

        let mut observed: Option<ObservedKey> = None;
        if let Some(key_id) = self.prior.recorded_id(ADDRESS.as_str()) {
            observed = self.exec.observe(ADDRESS, "describe_key", || provider.describe_key(key_id)).await?;
        }
        if observed.is_none() {
            observed = self.exec.observe(ADDRESS, "find_key_by_alias", || provider.find_key_by_alias(&alias)).await?;
        }
        if observed.is_none() {
            let orphan =
                self.exec.observe(ADDRESS, "find_unaliased_key", || provider.find_unaliased_key(&alias)).await?;
            if let Some(key) = orphan {
                warn!(key_id = %key.key_id, "Found unseal key without its alias; restoring the alias");
                let key_id = key.key_id.clone();
                self.exec
                    .mutate(ADDRESS, ChangeAction::Update, format!("alias {}", alias), || {
                        provider.create_alias(&alias, &key_id)
                    })
                    .await?;
                observed = Some(key);
            }
        }

        let Some(key) = observed else {
            let request = CreateKeyRequest {
                alias: alias.clone(),
                description: key_description(&self.ctx.cluster_id),
                policy: policy_json,
                rotation_enabled,
                tags: tags.clone(),
            };
            let detail = format!("create key {} (rotation {})", alias, if rotation_enabled { "on" } else { "off" });
            let created = self.exec.mutate(ADDRESS, ChangeAction::Create, detail, || provider.create_key(&request)).await?;

            return Ok(match created {
                Some(key) => {
                    info!(key_id = %key.key_id, "Created unseal key");
                    KeyHandle { key_id: key.key_id, arn: key.arn, alias }
                }
                None => KeyHandle { key_id: KNOWN_AFTER_APPLY.to_string(), arn: KNOWN_AFTER_APPLY.to_string(), alias },
            });
        };

        match key.state {
            KeyState::Enabled => {}
            KeyState::PendingDeletion => {
                return Err(SealplaneError::provisioning(
                    ADDRESS.as_str(),
                    format!("key {} is pending deletion; cancel the deletion before applying", key.key_id),
                ))
            }
            KeyState::Disabled => {
                return Err(SealplaneError::provisioning(
                    ADDRESS.as_str(),
                    format!("key {} is disabled; enable it before applying", key.key_id),
                ))
            }
        }

        let key_id = key.key_id.clone();
        if !key.policy.as_deref().map(|p| policy.matches_raw(p)).unwrap_or(false) {
            self.exec
                .mutate(ADDRESS, ChangeAction::Update, "key policy", || provider.put_key_policy(&key_id, &policy_json))
                .await?;
        }
        if key.rotation_enabled != rotation_enabled {
            let detail = format!("rotation {} -> {}", key.rotation_enabled, rotation_enabled);
            self.exec
                .mutate(ADDRESS, ChangeAction::Update, detail, || provider.set_key_rotation(&key_id, rotation_enabled))
                .await?;
        }
        self.converge_tags_to(ADDRESS, TagTarget::Key(key_id.clone()), &tags, &key.tags).await?;

        Ok(KeyHandle { key_id, arn: key.arn, alias })
    }
}
