//! Least-Privilege Policy Binder.
//!
//! The workload role gets exactly two grants: crypto operations on the unseal
//! key, and object operations on the storage bucket. Nothing else, and never
//! a `*` resource.

use std::collections::BTreeSet;

use tracing::{info, instrument};

use super::Provisioner;
use crate::cloud::{ObservedPolicy, TagTarget};
use crate::domain::{
    arn, BindingHandle, BucketHandle, KeyHandle, PolicyDocument, PolicyHandle, RoleHandle, Statement,
    KNOWN_AFTER_APPLY,
};
use crate::errors::{Result, SealplaneError};
use crate::reconcile::{ChangeAction, ResourceAddress};

pub const KEY_ACTIONS: [&str; 4] = ["kms:Encrypt", "kms:Decrypt", "kms:DescribeKey", "kms:GenerateDataKey"];
pub const BUCKET_ACTIONS: [&str; 4] = ["s3:GetObject", "s3:PutObject", "s3:DeleteObject", "s3:ListBucket"];

/// The two-statement policy scoped to `key` and `bucket`.
pub fn least_privilege_policy(key: &KeyHandle, bucket: &BucketHandle) -> PolicyDocument {
    PolicyDocument::new(vec![
        Statement::allow("VaultKmsUnseal", KEY_ACTIONS).on_resources([key.arn.clone()]),
        Statement::allow("VaultS3Storage", BUCKET_ACTIONS)
            .on_resources([bucket.arn.clone(), arn::bucket_objects(&bucket.name)]),
    ])
}

/// Check that `policy` grants nothing beyond `key` and `bucket`. The KMS
/// statement may name only the key; the S3 statement may name only the
/// bucket and its objects.
pub fn validate_least_privilege(policy: &PolicyDocument, key: &KeyHandle, bucket: &BucketHandle) -> Result<()> {
    if policy.statements.len() != 2 {
        return Err(SealplaneError::policy_validation(format!(
            "policy must have exactly two statements, found {}",
            policy.statements.len()
        )));
    }
    for statement in &policy.statements {
        let Some(resources) = &statement.resources else {
            return Err(SealplaneError::policy_validation("every statement must name its resources"));
        };
        if resources.iter().any(|r| r == "*") {
            return Err(SealplaneError::policy_validation("policy must not grant access to all resources"));
        }
        if statement.actions.iter().any(|a| a == "*" || a.ends_with(":*")) {
            return Err(SealplaneError::policy_validation("policy must not use wildcard actions"));
        }

        let allowed: Vec<String> = if statement.actions.iter().all(|a| a.starts_with("kms:")) {
            vec![key.arn.clone()]
        } else if statement.actions.iter().all(|a| a.starts_with("s3:")) {
            vec![bucket.arn.clone(), arn::bucket_objects(&bucket.name)]
        } else {
            return Err(SealplaneError::policy_validation("a statement must grant either KMS or S3 actions, not both"));
        };
        if let Some(stray) = resources.iter().find(|r| !allowed.contains(r)) {
            let kind = if stray.contains('*') { "wildcard resource" } else { "resource" };
            return Err(SealplaneError::policy_validation(format!(
                "statement {} names {} {} outside its scope",
                statement.sid.as_deref().unwrap_or("<unnamed>"),
                kind,
                stray
            )));
        }
    }

    let expected: BTreeSet<String> = [key.arn.clone(), bucket.arn.clone()].into_iter().collect();
    let referenced = policy.referenced_resources();
    if referenced != expected {
        return Err(SealplaneError::policy_validation(format!(
            "policy resources {:?} must be exactly the key and bucket {:?}",
            referenced, expected
        )));
    }
    Ok(())
}

impl Provisioner<'_> {
    /// Define the scoped policy and attach it to `role`.
    pub async fn bind_policy(
        &mut self,
        role: Option<&RoleHandle>,
        key: Option<&KeyHandle>,
        bucket: Option<&BucketHandle>,
    ) -> Result<BindingHandle> {
        let policy = self.define_policy(key, bucket).await?;
        self.attach_policy(role, Some(&policy)).await
    }

    /// Create or revise the scoped authorization policy. Revisions publish a
    /// new default version, so the existing attachment picks them up.
    #[instrument(skip_all, fields(policy = %self.ctx.names.policy_name))]
    pub async fn define_policy(&mut self, key: Option<&KeyHandle>, bucket: Option<&BucketHandle>) -> Result<PolicyHandle> {
        const ADDRESS: ResourceAddress = ResourceAddress::Policy;

        let key = key.ok_or_else(|| SealplaneError::policy_validation("key handle is unset"))?;
        let bucket = bucket.ok_or_else(|| SealplaneError::policy_validation("bucket handle is unset"))?;

        let document = least_privilege_policy(key, bucket);
        validate_least_privilege(&document, key, bucket)?;
        let document_json = document.to_json()?;

        let provider = self.provider;
        let name = self.ctx.names.policy_name.clone();
        let policy_arn = arn::policy(self.account_id, &name);

        let observed: Option<ObservedPolicy> =
            self.exec.observe(ADDRESS, "describe_policy", || provider.describe_policy(&policy_arn)).await?;

        match observed {
            None => {
                let tags = self.ctx.tags.clone();
                let created = self
                    .exec
                    .mutate(ADDRESS, ChangeAction::Create, format!("create policy {}", name), || {
                        provider.create_policy(&name, &document_json, &tags)
                    })
                    .await?;
                let version = match created {
                    Some(policy) => {
                        info!(arn = %policy.arn, "Created least-privilege policy");
                        policy.default_version_id
                    }
                    None => KNOWN_AFTER_APPLY.to_string(),
                };
                Ok(PolicyHandle { name, arn: policy_arn, default_version_id: version })
            }
            Some(existing) => {
                let mut version = existing.default_version_id.clone();
                if !document.matches_raw(&existing.document) {
                    let published = self
                        .exec
                        .mutate(ADDRESS, ChangeAction::Update, "publish new default version", || {
                            provider.create_policy_version(&policy_arn, &document_json)
                        })
                        .await?;
                    version = published.unwrap_or_else(|| KNOWN_AFTER_APPLY.to_string());
                }
                self.converge_tags(ADDRESS, TagTarget::Policy(policy_arn.clone()), &existing.tags).await?;
                Ok(PolicyHandle { name, arn: policy_arn, default_version_id: version })
            }
        }
    }

    /// Attach `policy` to `role` unless it is already attached.
    #[instrument(skip_all)]
    pub async fn attach_policy(&mut self, role: Option<&RoleHandle>, policy: Option<&PolicyHandle>) -> Result<BindingHandle> {
        const ADDRESS: ResourceAddress = ResourceAddress::Attachment;

        let role = role.ok_or_else(|| SealplaneError::policy_validation("role handle is unset"))?;
        let policy = policy.ok_or_else(|| SealplaneError::policy_validation("policy handle is unset"))?;
        let provider = self.provider;

        // A role or policy that a plan is about to create has no attachments yet.
        let attached = if self.exec.pending_create(ResourceAddress::Role) || self.exec.pending_create(ResourceAddress::Policy) {
            Vec::new()
        } else {
            self.exec
                .observe(ADDRESS, "list_attached_policies", || provider.list_attached_policies(&role.name))
                .await?
        };

        if !attached.iter().any(|a| a == &policy.arn) {
            self.exec
                .mutate(ADDRESS, ChangeAction::Attach, format!("attach {} to {}", policy.name, role.name), || {
                    provider.attach_role_policy(&role.name, &policy.arn)
                })
                .await?;
        }

        Ok(BindingHandle::new(&role.name, &policy.arn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudProvider, InMemoryCloud};
    use crate::domain::{validate_bucket_name, IssuerUrl, StringList, TrustCondition, WorkloadIdentity};
    use crate::provisioning::testing::Harness;
    use proptest::prelude::*;

    fn key() -> KeyHandle {
        KeyHandle {
            key_id: "k-1".to_string(),
            arn: "arn:aws:kms:eu-west-1:123456789012:key/k-1".to_string(),
            alias: "alias/eks-vault-unseal".to_string(),
        }
    }

    fn bucket() -> BucketHandle {
        BucketHandle {
            name: "acme-vault-storage".to_string(),
            arn: "arn:aws:s3:::acme-vault-storage".to_string(),
            encryption_key_arn: key().arn,
        }
    }

    #[test]
    fn resources_are_exactly_key_and_bucket() {
        let policy = least_privilege_policy(&key(), &bucket());
        assert_eq!(policy.statements.len(), 2);
        assert_eq!(
            policy.referenced_resources(),
            BTreeSet::from([key().arn, bucket().arn])
        );
        assert!(validate_least_privilege(&policy, &key(), &bucket()).is_ok());
        assert!(!policy.allowed_actions().iter().any(|a| a.ends_with('*')));
    }

    #[test]
    fn wildcard_resource_is_rejected() {
        let mut policy = least_privilege_policy(&key(), &bucket());
        policy.statements[0].resources = Some(StringList::one("*"));
        assert!(matches!(
            validate_least_privilege(&policy, &key(), &bucket()),
            Err(SealplaneError::PolicyValidation { .. })
        ));
    }

    #[test]
    fn wildcard_suffixes_outside_bucket_objects_are_rejected() {
        let mut key_children = least_privilege_policy(&key(), &bucket());
        key_children.statements[0].resources = Some(StringList::many([key().arn, format!("{}/*", key().arn)]));
        assert!(matches!(
            validate_least_privilege(&key_children, &key(), &bucket()),
            Err(SealplaneError::PolicyValidation { .. })
        ));

        let objects_under_kms = PolicyDocument::new(vec![
            Statement::allow("VaultKmsUnseal", KEY_ACTIONS)
                .on_resources([key().arn, arn::bucket_objects(&bucket().name)]),
            Statement::allow("VaultS3Storage", BUCKET_ACTIONS).on_resources([bucket().arn]),
        ]);
        assert!(matches!(
            validate_least_privilege(&objects_under_kms, &key(), &bucket()),
            Err(SealplaneError::PolicyValidation { .. })
        ));

        let other_bucket = PolicyDocument::new(vec![
            Statement::allow("VaultKmsUnseal", KEY_ACTIONS).on_resources([key().arn]),
            Statement::allow("VaultS3Storage", BUCKET_ACTIONS)
                .on_resources([bucket().arn, arn::bucket_objects(&bucket().name), "arn:aws:s3:::other/*".to_string()]),
        ]);
        assert!(validate_least_privilege(&other_bucket, &key(), &bucket()).is_err());
    }

    proptest! {
        #[test]
        fn generated_policy_names_exactly_key_and_bucket(
            account_id in "[0-9]{12}",
            region in "(us|eu|ap)-(east|west|central)-[1-3]",
            key_id in "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
            bucket_name in "[a-z0-9][a-z0-9-]{1,40}[a-z0-9]"
                .prop_filter("valid bucket name", |n| validate_bucket_name(n).is_ok()),
        ) {
            let key = KeyHandle {
                key_id: key_id.clone(),
                arn: arn::key(&region, &account_id, &key_id),
                alias: "alias/vault-unseal".to_string(),
            };
            let bucket = BucketHandle {
                name: bucket_name.clone(),
                arn: arn::bucket(&bucket_name),
                encryption_key_arn: key.arn.clone(),
            };

            let policy = least_privilege_policy(&key, &bucket);
            prop_assert!(validate_least_privilege(&policy, &key, &bucket).is_ok());
            prop_assert_eq!(policy.referenced_resources(), BTreeSet::from([key.arn.clone(), bucket.arn.clone()]));
        }
    }

    #[tokio::test]
    async fn unset_handles_are_policy_errors() {
        let cloud = InMemoryCloud::default();
        let mut harness = Harness::apply(&cloud).await;

        let err = harness.provisioner().bind_policy(None, Some(&key()), Some(&bucket())).await.unwrap_err();
        assert!(matches!(err, SealplaneError::PolicyValidation { .. }));

        let err = harness.provisioner().define_policy(Some(&key()), None).await.unwrap_err();
        assert!(matches!(err, SealplaneError::PolicyValidation { .. }));
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn bind_attaches_once() {
        let cloud = InMemoryCloud::default();
        let mut harness = Harness::apply(&cloud).await;
        let issuer = IssuerUrl::parse("https://oidc.example.com/id/abc").unwrap();
        let condition = TrustCondition::for_workload(&issuer, &WorkloadIdentity::new("vault", "vault").unwrap());
        let created = cloud.create_role("eks-vault-irsa-role", "{}", &harness.ctx.tags).await.unwrap();
        let role = RoleHandle { name: created.name, arn: created.arn, condition };

        let binding = harness.provisioner().bind_policy(Some(&role), Some(&key()), Some(&bucket())).await.unwrap();
        assert_eq!(binding.role_name, "eks-vault-irsa-role");

        let count = cloud.mutation_count();
        harness.provisioner().bind_policy(Some(&role), Some(&key()), Some(&bucket())).await.unwrap();
        assert_eq!(cloud.mutation_count(), count);
        assert_eq!(cloud.list_attached_policies(&role.name).await.unwrap(), vec![binding.policy_arn]);
    }

    #[tokio::test]
    async fn changed_bucket_publishes_new_version() {
        let cloud = InMemoryCloud::default();
        let mut harness = Harness::apply(&cloud).await;

        let first = harness.provisioner().define_policy(Some(&key()), Some(&bucket())).await.unwrap();
        let moved = BucketHandle {
            name: "acme-vault-storage-2".to_string(),
            arn: "arn:aws:s3:::acme-vault-storage-2".to_string(),
            encryption_key_arn: key().arn,
        };
        let second = harness.provisioner().define_policy(Some(&key()), Some(&moved)).await.unwrap();

        assert_eq!(first.arn, second.arn);
        assert_ne!(first.default_version_id, second.default_version_id);
    }
}
