//! Cloud provider abstraction.
//!
//! [`CloudProvider`] is the narrow set of KMS, object storage and IAM calls the
//! provisioning layer needs. Every `describe_*` returns `Ok(None)` when the
//! resource does not exist so convergence can distinguish "absent" from
//! "unreachable". Implementations must be thread-safe (`Send + Sync`).
//!
//! - [`memory::InMemoryCloud`]: deterministic simulation for tests and local runs
//! - `aws::AwsCloud` (feature `aws`): the AWS SDK backend

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::Tags;
use crate::errors::Result;

#[cfg(feature = "aws")]
pub mod aws;
pub mod memory;

#[cfg(feature = "aws")]
pub use aws::AwsCloud;
pub use memory::InMemoryCloud;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyState {
    Enabled,
    Disabled,
    PendingDeletion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedKey {
    pub key_id: String,
    pub arn: String,
    pub state: KeyState,
    pub rotation_enabled: bool,
    pub policy: Option<String>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedBucket {
    pub name: String,
    pub arn: String,
    pub encryption_key_arn: Option<String>,
    pub public_access_blocked: bool,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedProvider {
    pub arn: String,
    pub url: String,
    pub client_ids: Vec<String>,
    pub thumbprints: Vec<String>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedRole {
    pub name: String,
    pub arn: String,
    pub trust_policy: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedPolicy {
    pub name: String,
    pub arn: String,
    pub default_version_id: String,
    pub document: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateKeyRequest {
    pub alias: String,
    pub description: String,
    pub policy: String,
    pub rotation_enabled: bool,
    pub tags: Tags,
}

/// A bucket is only ever created private: public access blocked and default
/// encryption under `key_arn` are part of creation, not follow-up calls.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateBucketRequest {
    pub name: String,
    pub key_arn: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateOidcProviderRequest {
    pub url: String,
    pub client_ids: Vec<String>,
    pub thumbprints: Vec<String>,
    pub tags: Tags,
}

/// Resource to (re)tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagTarget {
    Key(String),
    Bucket(String),
    OidcProvider(String),
    Role(String),
    Policy(String),
}

#[async_trait]
pub trait CloudProvider: Send + Sync + std::fmt::Debug {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    async fn account_id(&self) -> Result<String>;

    // Key management
    async fn describe_key(&self, key_id: &str) -> Result<Option<ObservedKey>>;
    async fn find_key_by_alias(&self, alias: &str) -> Result<Option<ObservedKey>>;
    /// A live key tagged with [`ALIAS_TAG`](crate::domain::tags::ALIAS_TAG) = `alias`
    /// that the alias does not point at, left behind when aliasing failed.
    async fn find_unaliased_key(&self, alias: &str) -> Result<Option<ObservedKey>>;
    /// Creates the key, its alias and rotation setting in one step. A key
    /// whose alias cannot be created is scheduled for deletion.
    async fn create_key(&self, request: &CreateKeyRequest) -> Result<ObservedKey>;
    async fn create_alias(&self, alias: &str, key_id: &str) -> Result<()>;
    async fn put_key_policy(&self, key_id: &str, policy: &str) -> Result<()>;
    async fn set_key_rotation(&self, key_id: &str, enabled: bool) -> Result<()>;

    // Object storage
    async fn describe_bucket(&self, name: &str) -> Result<Option<ObservedBucket>>;
    /// Creates the bucket blocked and encrypted. Fails with `NameCollision`
    /// when the name is owned by another account; a bucket that was created
    /// but could not be secured is deleted before the error is returned.
    async fn create_bucket(&self, request: &CreateBucketRequest) -> Result<()>;
    async fn put_bucket_encryption(&self, name: &str, key_arn: &str) -> Result<()>;
    async fn put_public_access_block(&self, name: &str) -> Result<()>;
    async fn delete_bucket(&self, name: &str) -> Result<()>;

    // Federation
    async fn describe_oidc_provider(&self, arn: &str) -> Result<Option<ObservedProvider>>;
    async fn create_oidc_provider(&self, request: &CreateOidcProviderRequest) -> Result<String>;
    async fn update_oidc_thumbprints(&self, arn: &str, thumbprints: &[String]) -> Result<()>;
    async fn add_oidc_client_id(&self, arn: &str, client_id: &str) -> Result<()>;

    // Roles and policies
    async fn describe_role(&self, name: &str) -> Result<Option<ObservedRole>>;
    async fn create_role(&self, name: &str, trust_policy: &str, tags: &Tags) -> Result<ObservedRole>;
    async fn update_trust_policy(&self, name: &str, trust_policy: &str) -> Result<()>;
    async fn describe_policy(&self, arn: &str) -> Result<Option<ObservedPolicy>>;
    async fn create_policy(&self, name: &str, document: &str, tags: &Tags) -> Result<ObservedPolicy>;
    /// Publishes a new default version, pruning the oldest non-default
    /// version when the provider's version limit is reached. Returns the new
    /// version id.
    async fn create_policy_version(&self, arn: &str, document: &str) -> Result<String>;
    async fn list_attached_policies(&self, role_name: &str) -> Result<Vec<String>>;
    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<()>;

    async fn tag_resource(&self, target: &TagTarget, tags: &Tags) -> Result<()>;
}
