//! Desired-state entities and the handles convergence returns for them.
//!
//! Entities describe what should exist. Handles identify what does exist (or
//! will, during a plan) and are what downstream nodes in the dependency graph
//! consume.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::identity::{IssuerUrl, Thumbprint, TrustCondition};
use super::policy::PolicyDocument;
use super::tags::Tags;

/// Stands in for provider-assigned identifiers during a plan.
pub const KNOWN_AFTER_APPLY: &str = "(known after apply)";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyResource {
    pub alias: String,
    pub description: String,
    pub rotation_enabled: bool,
    pub policy: PolicyDocument,
    pub tags: Tags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Bucket owner only; public access blocked at bucket level.
    Private,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketResource {
    pub name: String,
    pub access: AccessMode,
    pub encryption_key_arn: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FederatedIdentityProvider {
    pub issuer: IssuerUrl,
    pub client_ids: Vec<String>,
    pub thumbprints: Vec<Thumbprint>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssumableRole {
    pub name: String,
    pub provider_arn: String,
    pub condition: TrustCondition,
    pub trust_policy: PolicyDocument,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthorizationPolicy {
    pub name: String,
    pub document: PolicyDocument,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleBinding {
    pub role_name: String,
    pub policy_arn: String,
}

/// Common view over handles so the engine can record any of them.
pub trait ResourceHandle {
    /// Provider identifier (key id, bucket name, role name...).
    fn id(&self) -> &str;
    fn arn(&self) -> &str;
    fn attributes(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHandle {
    pub key_id: String,
    pub arn: String,
    pub alias: String,
}

impl ResourceHandle for KeyHandle {
    fn id(&self) -> &str {
        &self.key_id
    }
    fn arn(&self) -> &str {
        &self.arn
    }
    fn attributes(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("alias".to_string(), self.alias.clone())])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketHandle {
    pub name: String,
    pub arn: String,
    pub encryption_key_arn: String,
}

impl ResourceHandle for BucketHandle {
    fn id(&self) -> &str {
        &self.name
    }
    fn arn(&self) -> &str {
        &self.arn
    }
    fn attributes(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("encryption_key_arn".to_string(), self.encryption_key_arn.clone())])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderHandle {
    pub arn: String,
    pub issuer: IssuerUrl,
}

impl ResourceHandle for ProviderHandle {
    fn id(&self) -> &str {
        &self.arn
    }
    fn arn(&self) -> &str {
        &self.arn
    }
    fn attributes(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("issuer".to_string(), self.issuer.to_string())])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleHandle {
    pub name: String,
    pub arn: String,
    pub condition: TrustCondition,
}

impl ResourceHandle for RoleHandle {
    fn id(&self) -> &str {
        &self.name
    }
    fn arn(&self) -> &str {
        &self.arn
    }
    fn attributes(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("condition_key".to_string(), self.condition.key.clone()),
            ("condition_value".to_string(), self.condition.value.clone()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyHandle {
    pub name: String,
    pub arn: String,
    pub default_version_id: String,
}

impl ResourceHandle for PolicyHandle {
    fn id(&self) -> &str {
        &self.arn
    }
    fn arn(&self) -> &str {
        &self.arn
    }
    fn attributes(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("default_version_id".to_string(), self.default_version_id.clone())])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingHandle {
    pub role_name: String,
    pub policy_arn: String,
    id: String,
}

impl BindingHandle {
    pub fn new(role_name: &str, policy_arn: &str) -> Self {
        Self {
            role_name: role_name.to_string(),
            policy_arn: policy_arn.to_string(),
            id: format!("{}/{}", role_name, policy_arn),
        }
    }
}

impl ResourceHandle for BindingHandle {
    fn id(&self) -> &str {
        &self.id
    }
    fn arn(&self) -> &str {
        &self.policy_arn
    }
    fn attributes(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("role_name".to_string(), self.role_name.clone())])
    }
}
