//! # Provisioning
//!
//! The four bootstrap components, each converging one slice of the resource
//! graph through an [`Executor`]:
//!
//! - [`key_guardian`]: the unseal key and its key policy
//! - [`object_store`]: the private, key-encrypted storage bucket
//! - [`federation`]: the cluster's OIDC provider and the workload role
//! - [`policy_binder`]: the least-privilege policy and its attachment
//!
//! Components only see a validated [`ProvisioningContext`]; raw
//! [`BootstrapInputs`] never reach a cloud call.

pub mod federation;
pub mod inputs;
pub mod key_guardian;
pub mod object_store;
pub mod policy_binder;

pub use federation::{trust_policy, validate_trust_policy};
pub use inputs::{BootstrapInputs, ProvisioningContext, DEFAULT_AUDIENCE, MAX_THUMBPRINTS};
pub use key_guardian::{key_description, key_policy, validate_key_policy};
pub use policy_binder::{least_privilege_policy, validate_least_privilege};

use crate::cloud::{CloudProvider, TagTarget};
use crate::domain::Tags;
use crate::errors::Result;
use crate::reconcile::{ChangeAction, Executor, ResourceAddress};
use crate::state::StateFile;

/// Borrowed view over everything one reconcile run needs to converge a
/// resource.
pub struct Provisioner<'a> {
    provider: &'a dyn CloudProvider,
    exec: &'a mut Executor,
    ctx: &'a ProvisioningContext,
    account_id: &'a str,
    prior: &'a StateFile,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        provider: &'a dyn CloudProvider,
        exec: &'a mut Executor,
        ctx: &'a ProvisioningContext,
        account_id: &'a str,
        prior: &'a StateFile,
    ) -> Self {
        Self { provider, exec, ctx, account_id, prior }
    }

    pub fn context(&self) -> &ProvisioningContext {
        self.ctx
    }

    /// Add the managed tags `observed` lacks. Extra tags are left in place.
    async fn converge_tags(&mut self, address: ResourceAddress, target: TagTarget, observed: &Tags) -> Result<()> {
        let ctx = self.ctx;
        self.converge_tags_to(address, target, &ctx.tags, observed).await
    }

    async fn converge_tags_to(
        &mut self,
        address: ResourceAddress,
        target: TagTarget,
        desired: &Tags,
        observed: &Tags,
    ) -> Result<()> {
        let missing = desired.missing_from(observed);
        if missing.is_empty() {
            return Ok(());
        }
        let provider = self.provider;
        let keys: Vec<&str> = missing.iter().map(|(k, _)| k.as_str()).collect();
        let detail = format!("tags {}", keys.join(", "));
        self.exec.mutate(address, ChangeAction::Tag, detail, || provider.tag_resource(&target, &missing)).await?;
        Ok(())
    }
}
