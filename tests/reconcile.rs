//! End-to-end convergence against the simulated cloud.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sealplane::cloud::memory::InjectedFailure;
use sealplane::cloud::{CloudProvider, InMemoryCloud};
use sealplane::config::EngineSettings;
use sealplane::domain::PolicyDocument;
use sealplane::reconcile::{ResourceAction, ResourceAddress};
use sealplane::state::{LockMode, ResourceStatus, StateLock};
use sealplane::{BootstrapInputs, Engine, SealplaneError};

const BUCKET: &str = "acme-eks-vault-storage";

fn inputs() -> BootstrapInputs {
    BootstrapInputs {
        region: "eu-west-1".to_string(),
        cluster_id: "prod-eks-1".to_string(),
        cluster_short_name: "eks".to_string(),
        bucket_name: BUCKET.to_string(),
        issuer_url: "https://oidc.eks.eu-west-1.amazonaws.com/id/EXAMPLED539D4633E53DE1B71EXAMPLE".to_string(),
        thumbprints: vec!["9e99a48a9960b14926bb7f3b02e22da2b0ab7280".to_string()],
        namespace: "vault".to_string(),
        service_account: "vault".to_string(),
        ..BootstrapInputs::default()
    }
}

fn engine_with(cloud: &InMemoryCloud, dir: &Path, call_timeout_secs: u64) -> Engine {
    let settings = EngineSettings {
        state_dir: dir.to_path_buf(),
        lock_mode: LockMode::FailFast,
        lock_wait_timeout_secs: 0,
        call_timeout_secs,
        ..EngineSettings::default()
    };
    Engine::new(Arc::new(cloud.clone()), settings)
}

fn engine(cloud: &InMemoryCloud, dir: &Path) -> Engine {
    engine_with(cloud, dir, 5)
}

#[tokio::test]
async fn rerun_with_unchanged_inputs_makes_no_mutations() {
    let cloud = InMemoryCloud::default();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&cloud, dir.path());

    let first = engine.apply(&inputs()).await.unwrap();
    let after_first = cloud.mutation_count();
    assert!(after_first > 0);

    let second = engine.apply(&inputs()).await.unwrap();
    assert_eq!(cloud.mutation_count(), after_first);
    assert!(second.changes.is_empty());
    assert_eq!(second.outputs, first.outputs);
    assert_eq!(second.serial, first.serial);

    assert!(engine.plan(&inputs()).await.unwrap().is_empty());
}

#[tokio::test]
async fn issuer_without_scheme_is_rejected_before_any_mutation() {
    let cloud = InMemoryCloud::default();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&cloud, dir.path());

    let bad = BootstrapInputs {
        issuer_url: "oidc.eks.eu-west-1.amazonaws.com/id/EXAMPLED539D4633E53DE1B71EXAMPLE".to_string(),
        ..inputs()
    };
    let err = engine.apply(&bad).await.unwrap_err();

    assert!(matches!(err, SealplaneError::TrustConfiguration { .. }), "got {:?}", err);
    assert_eq!(cloud.mutation_count(), 0);
    assert!(!engine.store().state_path().exists());
}

#[tokio::test]
async fn policy_scope_is_exactly_key_and_bucket() {
    let cloud = InMemoryCloud::default();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&cloud, dir.path());
    engine.apply(&inputs()).await.unwrap();

    let state = engine.state().unwrap();
    let key_arn = state.get(ResourceAddress::Key.as_str()).and_then(|r| r.arn.clone()).unwrap();
    let bucket_arn = state.get(ResourceAddress::Bucket.as_str()).and_then(|r| r.arn.clone()).unwrap();
    let policy_arn = state.get(ResourceAddress::Policy.as_str()).and_then(|r| r.arn.clone()).unwrap();

    let observed = cloud.describe_policy(&policy_arn).await.unwrap().unwrap();
    let document = PolicyDocument::parse(&observed.document).unwrap();

    assert_eq!(document.statements.len(), 2);
    assert_eq!(document.referenced_resources(), BTreeSet::from([key_arn, bucket_arn]));
}

#[tokio::test]
async fn role_trust_is_pinned_to_the_service_account() {
    let cloud = InMemoryCloud::default();
    let dir = tempfile::tempdir().unwrap();
    let report = engine(&cloud, dir.path()).apply(&inputs()).await.unwrap();

    assert!(report.outputs.role_arn.contains("eks-vault-irsa-role"));
    let role = cloud.describe_role("eks-vault-irsa-role").await.unwrap().unwrap();
    assert!(role.trust_policy.contains("system:serviceaccount:vault:vault"));
    assert!(!role.trust_policy.contains('*'));
}

#[tokio::test]
async fn timed_out_call_is_recorded_unknown_and_rerun_converges() {
    let cloud = InMemoryCloud::default();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(&cloud, dir.path(), 1);

    cloud.delay("create_bucket", Duration::from_millis(1500)).await;
    let err = engine.apply(&inputs()).await.unwrap_err();
    assert!(matches!(err, SealplaneError::Timeout { .. }), "got {:?}", err);

    let state = engine.state().unwrap();
    assert_eq!(state.get(ResourceAddress::Key.as_str()).unwrap().status, ResourceStatus::Created);
    assert_eq!(state.get(ResourceAddress::Bucket.as_str()).unwrap().status, ResourceStatus::Unknown);
    assert!(state.get(ResourceAddress::Role.as_str()).is_none());

    cloud.clear_faults().await;
    engine.apply(&inputs()).await.unwrap();

    let state = engine.state().unwrap();
    for address in ResourceAddress::ALL {
        assert_eq!(state.get(address.as_str()).unwrap().status, ResourceStatus::Created, "{}", address);
    }
    assert!(cloud.has_bucket(BUCKET).await);
}

#[tokio::test]
async fn concurrent_apply_fails_fast_on_held_lock() {
    let cloud = InMemoryCloud::default();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&cloud, dir.path());

    let held = StateLock::acquire(&engine.store().lock_path(), "apply", LockMode::FailFast, Duration::ZERO)
        .await
        .unwrap();

    let err = engine.apply(&inputs()).await.unwrap_err();
    match err {
        SealplaneError::StateLocked { lock_id, .. } => assert_eq!(lock_id, held.info().id),
        other => panic!("expected StateLocked, got {:?}", other),
    }
    assert_eq!(cloud.mutation_count(), 0);

    drop(held);
    engine.apply(&inputs()).await.unwrap();
}

#[tokio::test]
async fn stale_lock_can_be_forced_open() {
    let cloud = InMemoryCloud::default();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&cloud, dir.path());

    let held = StateLock::acquire(&engine.store().lock_path(), "apply", LockMode::FailFast, Duration::ZERO)
        .await
        .unwrap();
    let lock_id = held.info().id.clone();
    std::mem::forget(held);

    assert!(engine.force_unlock("not-the-holder").is_err());
    engine.force_unlock(&lock_id).unwrap();
    engine.apply(&inputs()).await.unwrap();
}

#[tokio::test]
async fn bucket_destroy_requires_matching_confirmation() {
    let cloud = InMemoryCloud::default();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&cloud, dir.path());
    let report = engine.apply(&inputs()).await.unwrap();
    let before = cloud.mutation_count();

    let err = engine.destroy_bucket(BUCKET, "yes").await.unwrap_err();
    assert!(matches!(err, SealplaneError::Validation { .. }));
    assert_eq!(cloud.mutation_count(), before);
    assert!(cloud.has_bucket(BUCKET).await);

    engine.destroy_bucket(BUCKET, BUCKET).await.unwrap();
    assert!(!cloud.has_bucket(BUCKET).await);
    assert!(cloud.describe_key(&report.outputs.key_id).await.unwrap().is_some());
}

#[tokio::test]
async fn foreign_bucket_name_is_a_collision() {
    let cloud = InMemoryCloud::default();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&cloud, dir.path());
    cloud.reserve_foreign_bucket(BUCKET).await;

    let err = engine.apply(&inputs()).await.unwrap_err();
    assert!(matches!(err, SealplaneError::NameCollision { .. }), "got {:?}", err);

    let state = engine.state().unwrap();
    assert!(state.get(ResourceAddress::Key.as_str()).is_some());
    assert!(state.get(ResourceAddress::Bucket.as_str()).is_none());

    let renamed = BootstrapInputs { bucket_name: "acme-eks-vault-storage-2".to_string(), ..inputs() };
    let report = engine.apply(&renamed).await.unwrap();
    assert_eq!(report.outputs.bucket_id, "acme-eks-vault-storage-2");
}

#[tokio::test]
async fn trust_policy_drift_is_planned_and_repaired() {
    let cloud = InMemoryCloud::default();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&cloud, dir.path());
    engine.apply(&inputs()).await.unwrap();

    let widened = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Principal":{"Federated":"*"},"Action":"sts:AssumeRoleWithWebIdentity"}]}"#;
    cloud.overwrite_trust_policy("eks-vault-irsa-role", widened).await;

    let plan = engine.plan(&inputs()).await.unwrap();
    assert!(matches!(plan.action_for(ResourceAddress::Role), ResourceAction::Update(_)));
    assert_eq!(plan.action_for(ResourceAddress::Key), ResourceAction::NoOp);

    engine.apply(&inputs()).await.unwrap();
    let role = cloud.describe_role("eks-vault-irsa-role").await.unwrap().unwrap();
    assert!(role.trust_policy.contains("system:serviceaccount:vault:vault"));
    assert!(engine.plan(&inputs()).await.unwrap().is_empty());
}

#[tokio::test]
async fn fatal_provisioning_error_halts_at_the_failed_node() {
    let cloud = InMemoryCloud::default();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&cloud, dir.path());
    cloud.fail_next("create_role", InjectedFailure::AccessDenied, 1).await;

    let err = engine.apply(&inputs()).await.unwrap_err();
    assert!(matches!(err, SealplaneError::Provisioning { retryable: false, .. }));

    let state = engine.state().unwrap();
    assert!(state.get(ResourceAddress::Provider.as_str()).is_some());
    assert!(state.get(ResourceAddress::Role.as_str()).is_none());
    assert!(state.get(ResourceAddress::Policy.as_str()).is_none());
    assert!(state.outputs.is_none());

    let report = engine.apply(&inputs()).await.unwrap();
    assert!(report.outputs.role_arn.ends_with("role/eks-vault-irsa-role"));
}

#[tokio::test]
async fn bucket_that_cannot_be_secured_is_never_left_behind() {
    let cloud = InMemoryCloud::default();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&cloud, dir.path());
    cloud.fail_next("put_public_access_block", InjectedFailure::AccessDenied, 1).await;

    let err = engine.apply(&inputs()).await.unwrap_err();
    assert!(matches!(err, SealplaneError::Provisioning { retryable: false, .. }), "got {:?}", err);
    assert!(!cloud.has_bucket(BUCKET).await);
    assert!(engine.state().unwrap().get(ResourceAddress::Bucket.as_str()).is_none());

    engine.apply(&inputs()).await.unwrap();
    let bucket = cloud.describe_bucket(BUCKET).await.unwrap().unwrap();
    assert!(bucket.public_access_blocked);
    assert!(bucket.encryption_key_arn.is_some());
}
