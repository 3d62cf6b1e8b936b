//! The reconcile engine.
//!
//! A run validates the declared inputs, takes the state lock, loads the state
//! file and converges the bootstrap graph node by node in topological order.
//! During an apply the state file is persisted after every node whose record
//! changed, so a run interrupted between nodes resumes where it stopped. A
//! call that times out marks its resource `unknown` and halts the run; the
//! next run rediscovers the resource by its deterministic name.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, info_span, warn, Instrument};

use super::executor::{Executor, Mode};
use super::graph::{DependencyGraph, ResourceAddress};
use super::plan::{ApplyReport, ChangeAction, Plan, PlannedChange};
use crate::cloud::CloudProvider;
use crate::config::EngineSettings;
use crate::domain::{
    arn, AccessMode, AssumableRole, AuthorizationPolicy, BucketHandle, BucketResource,
    FederatedIdentityProvider, KeyHandle, KeyResource, PolicyHandle, ProviderHandle, ResourceHandle, RoleBinding,
    RoleHandle, TrustCondition,
};
use crate::errors::{Result, SealplaneError};
use crate::observability::metrics;
use crate::provisioning::{
    key_description, key_policy, least_privilege_policy, trust_policy, validate_least_privilege,
    validate_trust_policy, BootstrapInputs, Provisioner, ProvisioningContext,
};
use crate::retry::RetryConfig;
use crate::state::{self, Outputs, ResourceRecord, StateFile, StateLock, StateStore};

const PLACEHOLDER_ACCOUNT: &str = "000000000000";
const PLACEHOLDER_KEY_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Render the scoped policy and the trust policy against placeholder ids and
/// validate both, so an input that would produce an unsafe document fails
/// before the lock is taken.
fn preflight_policies(ctx: &ProvisioningContext) -> Result<()> {
    let key_arn = arn::key(&ctx.region, PLACEHOLDER_ACCOUNT, PLACEHOLDER_KEY_ID);
    let key = KeyHandle { key_id: PLACEHOLDER_KEY_ID.to_string(), arn: key_arn.clone(), alias: ctx.names.key_alias.clone() };
    let bucket = BucketHandle {
        name: ctx.bucket_name.clone(),
        arn: arn::bucket(&ctx.bucket_name),
        encryption_key_arn: key_arn,
    };
    validate_least_privilege(&least_privilege_policy(&key, &bucket), &key, &bucket)?;

    let provider_arn = arn::oidc_provider(PLACEHOLDER_ACCOUNT, ctx.issuer.without_scheme());
    let condition = TrustCondition::for_workload(&ctx.issuer, &ctx.identity);
    validate_trust_policy(&trust_policy(&provider_arn, &condition, &ctx.audience))
}

/// Handles resolved so far in a run, consumed by dependent nodes.
#[derive(Debug, Default)]
struct Resolved {
    key: Option<KeyHandle>,
    bucket: Option<BucketHandle>,
    provider: Option<ProviderHandle>,
    role: Option<RoleHandle>,
    policy: Option<PolicyHandle>,
}

impl Resolved {
    fn outputs(&self) -> Option<Outputs> {
        Some(Outputs {
            bucket_id: self.bucket.as_ref()?.name.clone(),
            key_id: self.key.as_ref()?.key_id.clone(),
            role_arn: self.role.as_ref()?.arn.clone(),
        })
    }
}

fn unresolved(address: ResourceAddress) -> SealplaneError {
    SealplaneError::internal(format!("dependency {} was not resolved", address))
}

struct RunOutcome {
    changes: Vec<PlannedChange>,
    outputs: Option<Outputs>,
    serial: u64,
}

pub struct Engine {
    provider: Arc<dyn CloudProvider>,
    store: StateStore,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(provider: Arc<dyn CloudProvider>, settings: EngineSettings) -> Self {
        let store = StateStore::new(settings.state_dir.clone());
        Self { provider, store, settings }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Compute the changes an apply would make without mutating anything.
    pub async fn plan(&self, inputs: &BootstrapInputs) -> Result<Plan> {
        let outcome = self.run(inputs, Mode::Plan).await?;
        Ok(Plan { changes: outcome.changes })
    }

    /// Converge the cloud to `inputs`.
    pub async fn apply(&self, inputs: &BootstrapInputs) -> Result<ApplyReport> {
        let outcome = self.run(inputs, Mode::Apply).await?;
        let outputs = outcome
            .outputs
            .ok_or_else(|| SealplaneError::internal("apply completed without resolving outputs"))?;
        Ok(ApplyReport { changes: outcome.changes, outputs, serial: outcome.serial })
    }

    /// Outputs recorded by the last successful apply.
    pub fn outputs(&self) -> Result<Option<Outputs>> {
        Ok(self.store.load()?.outputs)
    }

    pub fn state(&self) -> Result<StateFile> {
        self.store.load()
    }

    /// Delete the managed bucket. `confirmation` must repeat the bucket name.
    /// The unseal key is never touched; data encrypted under it stays
    /// decryptable.
    pub async fn destroy_bucket(&self, name: &str, confirmation: &str) -> Result<()> {
        if confirmation != name {
            return Err(SealplaneError::validation_field(
                format!("confirmation '{}' does not match bucket '{}'", confirmation, name),
                "confirm",
            ));
        }

        let _lock = self.lock("destroy-bucket").await?;
        let mut state = self.store.load()?;
        let address = ResourceAddress::Bucket;
        if state.recorded_id(address.as_str()) != Some(name) {
            return Err(SealplaneError::validation_field(
                format!("bucket '{}' is not managed by this state", name),
                "bucket",
            ));
        }

        let mut exec = Executor::new(Mode::Apply, self.call_timeout(), RetryConfig::from(&self.settings.retry));
        let provider = self.provider.as_ref();
        exec.mutate(address, ChangeAction::Delete, format!("delete bucket {}", name), || provider.delete_bucket(name))
            .await?;

        state.remove(address.as_str());
        state.set_outputs(None);
        self.store.save(&mut state)?;
        warn!(bucket = %name, "Bucket destroyed; the unseal key was left in place");
        Ok(())
    }

    /// Break a stale lock. Refuses unless `lock_id` names the current holder.
    pub fn force_unlock(&self, lock_id: &str) -> Result<()> {
        state::force_unlock(&self.store.lock_path(), lock_id)
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.call_timeout_secs)
    }

    async fn lock(&self, operation: &str) -> Result<StateLock> {
        StateLock::acquire(
            &self.store.lock_path(),
            operation,
            self.settings.lock_mode,
            Duration::from_secs(self.settings.lock_wait_timeout_secs),
        )
        .await
    }

    async fn run(&self, inputs: &BootstrapInputs, mode: Mode) -> Result<RunOutcome> {
        let operation = match mode {
            Mode::Plan => "plan",
            Mode::Apply => "apply",
        };

        // Nothing is locked, read or called until the inputs are valid.
        let ctx = inputs.validate()?;
        preflight_policies(&ctx)?;
        let span = info_span!("reconcile", operation, cluster = %ctx.cluster_id, provider = self.provider.name());

        let result = self.converge_all(&ctx, mode, operation).instrument(span).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(SealplaneError::Timeout { .. }) => "timeout",
            Err(_) => "error",
        };
        metrics::record_reconcile_run(operation, outcome);
        result
    }

    async fn converge_all(&self, ctx: &ProvisioningContext, mode: Mode, operation: &str) -> Result<RunOutcome> {
        let _lock = self.lock(operation).await?;
        let mut state = self.store.load()?;
        check_bucket_rename(&state, ctx)?;

        let order = DependencyGraph::bootstrap().topological_order()?;
        let mut exec = Executor::new(mode, self.call_timeout(), RetryConfig::from(&self.settings.retry));
        let provider = self.provider.as_ref();
        let account_id = exec.observe("account", "account_id", || provider.account_id()).await?;
        let prior = state.clone();
        let mut resolved = Resolved::default();

        info!(nodes = order.len(), serial = state.serial, "Reconcile started");

        for address in order {
            let result = {
                let mut provisioner = Provisioner::new(provider, &mut exec, ctx, &account_id, &prior);
                converge_node(&mut provisioner, address, &account_id, &mut resolved).await
            };

            match result {
                Ok(record) => {
                    if mode == Mode::Apply && state.upsert(record) {
                        self.store.save(&mut state)?;
                    }
                }
                Err(err @ SealplaneError::Timeout { .. }) => {
                    error!(address = %address, error = %err, "Cloud call timed out; resource state is unknown");
                    if mode == Mode::Apply {
                        state.upsert(ResourceRecord::unknown(address.as_str(), prior.get(address.as_str())));
                        self.store.save(&mut state)?;
                    }
                    return Err(err);
                }
                Err(err) => {
                    error!(address = %address, error = %err, "Reconcile halted");
                    return Err(err);
                }
            }
        }

        let outputs = resolved.outputs();
        if mode == Mode::Apply && state.set_outputs(outputs.clone()) {
            self.store.save(&mut state)?;
        }

        let changes = exec.into_changes();
        info!(changes = changes.len(), serial = state.serial, "Reconcile finished");
        Ok(RunOutcome { changes, outputs, serial: state.serial })
    }
}

/// A recorded bucket is never renamed in place; the old one must be destroyed
/// explicitly first.
fn check_bucket_rename(state: &StateFile, ctx: &ProvisioningContext) -> Result<()> {
    match state.recorded_id(ResourceAddress::Bucket.as_str()) {
        Some(recorded) if recorded != ctx.bucket_name => Err(SealplaneError::validation_field(
            format!(
                "bucket is recorded as '{}'; destroy it with destroy-bucket before switching to '{}'",
                recorded, ctx.bucket_name
            ),
            "bucket_name",
        )),
        _ => Ok(()),
    }
}

fn record_for(address: ResourceAddress, handle: &dyn ResourceHandle, spec: &impl serde::Serialize) -> Result<ResourceRecord> {
    Ok(ResourceRecord::created(address.as_str(), handle, Some(state::spec_hash(spec)?)))
}

async fn converge_node(
    p: &mut Provisioner<'_>,
    address: ResourceAddress,
    account_id: &str,
    resolved: &mut Resolved,
) -> Result<ResourceRecord> {
    let ctx = p.context().clone();

    match address {
        ResourceAddress::Key => {
            let policy = key_policy(account_id);
            let handle = p.create_or_update_key(ctx.rotation_enabled, &policy).await?;
            let spec = KeyResource {
                alias: ctx.names.key_alias.clone(),
                description: key_description(&ctx.cluster_id),
                rotation_enabled: ctx.rotation_enabled,
                policy,
                tags: ctx.tags.clone(),
            };
            let record = record_for(address, &handle, &spec)?;
            resolved.key = Some(handle);
            Ok(record)
        }
        ResourceAddress::Bucket => {
            let key = resolved.key.as_ref().ok_or_else(|| unresolved(ResourceAddress::Key))?;
            let handle = p.create_private_bucket(&ctx.bucket_name, key).await?;
            let spec = BucketResource {
                name: ctx.bucket_name.clone(),
                access: AccessMode::Private,
                encryption_key_arn: key.arn.clone(),
                tags: ctx.tags.clone(),
            };
            let record = record_for(address, &handle, &spec)?;
            resolved.bucket = Some(handle);
            Ok(record)
        }
        ResourceAddress::Provider => {
            let handle = p.register_federated_provider(&ctx.issuer, &ctx.audience, &ctx.thumbprints).await?;
            let spec = FederatedIdentityProvider {
                issuer: ctx.issuer.clone(),
                client_ids: vec![ctx.audience.clone()],
                thumbprints: ctx.thumbprints.clone(),
                tags: ctx.tags.clone(),
            };
            let record = record_for(address, &handle, &spec)?;
            resolved.provider = Some(handle);
            Ok(record)
        }
        ResourceAddress::Role => {
            let provider = resolved.provider.as_ref().ok_or_else(|| unresolved(ResourceAddress::Provider))?;
            let handle = p
                .create_assumable_role(provider, ctx.identity.namespace(), ctx.identity.service_account())
                .await?;
            let spec = AssumableRole {
                name: handle.name.clone(),
                provider_arn: provider.arn.clone(),
                condition: handle.condition.clone(),
                trust_policy: trust_policy(&provider.arn, &handle.condition, &ctx.audience),
                tags: ctx.tags.clone(),
            };
            let record = record_for(address, &handle, &spec)?;
            resolved.role = Some(handle);
            Ok(record)
        }
        ResourceAddress::Policy => {
            let handle = p.define_policy(resolved.key.as_ref(), resolved.bucket.as_ref()).await?;
            let key = resolved.key.as_ref().ok_or_else(|| unresolved(ResourceAddress::Key))?;
            let bucket = resolved.bucket.as_ref().ok_or_else(|| unresolved(ResourceAddress::Bucket))?;
            let spec = AuthorizationPolicy {
                name: handle.name.clone(),
                document: least_privilege_policy(key, bucket),
                tags: ctx.tags.clone(),
            };
            let record = record_for(address, &handle, &spec)?;
            resolved.policy = Some(handle);
            Ok(record)
        }
        ResourceAddress::Attachment => {
            let handle = p.attach_policy(resolved.role.as_ref(), resolved.policy.as_ref()).await?;
            let spec = RoleBinding { role_name: handle.role_name.clone(), policy_arn: handle.policy_arn.clone() };
            record_for(address, &handle, &spec)
        }
    }
}
