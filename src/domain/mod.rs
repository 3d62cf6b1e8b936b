//! Domain layer
//!
//! Pure types for the resources sealplane manages: the unseal key, the
//! storage bucket, the federated identity provider, the assumable role, its
//! authorization policy and the binding between them. Nothing here talks to a
//! cloud API; every constructor validates its input so invalid trust or naming
//! configuration cannot reach the provisioning layer.
//!
//! ## Module Organization
//!
//! - `identity`: issuer URL, thumbprint, workload identity, trust condition
//! - `policy`: IAM-style policy documents
//! - `tags`: tag maps and limits
//! - `naming`: derived resource names and ARNs
//! - `resources`: desired-state entities and handles

pub mod identity;
pub mod naming;
pub mod policy;
pub mod resources;
pub mod tags;

pub use identity::{IssuerUrl, Thumbprint, TrustCondition, WorkloadIdentity};
pub use naming::{arn, validate_bucket_name, validate_cluster_short_name, ResourceNames};
pub use policy::{Effect, PolicyDocument, Principal, Statement, StringList};
pub use resources::{
    AccessMode, AssumableRole, AuthorizationPolicy, BindingHandle, BucketHandle, BucketResource,
    FederatedIdentityProvider, KeyHandle, KeyResource, PolicyHandle, ProviderHandle, ResourceHandle,
    RoleBinding, RoleHandle, KNOWN_AFTER_APPLY,
};
pub use tags::Tags;
