//! Identity Federation Bridge.
//!
//! Registers the cluster's OIDC issuer with the cloud IAM service and creates
//! the one role the secret store's service account may assume. The trust
//! policy binds the role to exactly one `system:serviceaccount:<ns>:<sa>`
//! subject, never a wildcard.

use std::collections::BTreeSet;

use tracing::{info, instrument};

use super::Provisioner;
use crate::cloud::{CreateOidcProviderRequest, ObservedRole, TagTarget};
use crate::domain::{
    arn, IssuerUrl, PolicyDocument, Principal, ProviderHandle, RoleHandle, StringList, Statement, Thumbprint,
    TrustCondition, WorkloadIdentity, KNOWN_AFTER_APPLY,
};
use crate::errors::{Result, SealplaneError};
use crate::reconcile::{ChangeAction, ResourceAddress};

const ASSUME_ACTION: &str = "sts:AssumeRoleWithWebIdentity";
const STRING_EQUALS: &str = "StringEquals";

/// Trust policy letting exactly one workload assume the role through `provider_arn`.
pub fn trust_policy(provider_arn: &str, condition: &TrustCondition, audience: &str) -> PolicyDocument {
    let audience_key = match condition.key.strip_suffix(":sub") {
        Some(issuer) => format!("{}:aud", issuer),
        None => format!("{}:aud", condition.key),
    };
    PolicyDocument::new(vec![Statement::allow("AllowVaultServiceAccount", [ASSUME_ACTION])
        .with_principal(Principal::Federated(StringList::one(provider_arn)))
        .with_condition(STRING_EQUALS, &condition.key, &condition.value)
        .with_condition(STRING_EQUALS, &audience_key, audience)])
}

/// A trust policy must name a federated principal and pin the subject with
/// `StringEquals`. Wildcard principals and pattern operators are rejected.
pub fn validate_trust_policy(policy: &PolicyDocument) -> Result<()> {
    if policy.statements.len() != 1 {
        return Err(SealplaneError::trust_configuration(format!(
            "trust policy must have exactly one statement, found {}",
            policy.statements.len()
        )));
    }
    let statement = &policy.statements[0];
    match &statement.principal {
        Some(Principal::Federated(arns)) if !arns.is_empty() && !arns.iter().any(|a| a.contains('*')) => {}
        _ => return Err(SealplaneError::trust_configuration("trust policy principal must be a single federated provider")),
    }
    if statement.actions.len() != 1 || !statement.actions.contains(ASSUME_ACTION) {
        return Err(SealplaneError::trust_configuration(format!("trust policy may only allow {}", ASSUME_ACTION)));
    }
    if statement.conditions.keys().any(|op| op != STRING_EQUALS) {
        return Err(SealplaneError::trust_configuration("trust policy conditions must use StringEquals"));
    }
    let subjects: Vec<&String> = statement
        .conditions
        .get(STRING_EQUALS)
        .into_iter()
        .flat_map(|entries| entries.iter())
        .filter(|(key, _)| key.ends_with(":sub"))
        .flat_map(|(_, values)| values.iter())
        .collect();
    if subjects.len() != 1 {
        return Err(SealplaneError::trust_configuration("trust policy must bind exactly one subject"));
    }
    if subjects[0].contains('*') || subjects[0].contains('?') {
        return Err(SealplaneError::trust_configuration(format!(
            "trust policy subject '{}' must not contain wildcards",
            subjects[0]
        )));
    }
    Ok(())
}

impl Provisioner<'_> {
    /// Register `issuer` as a federated identity provider trusted for `audience`.
    #[instrument(skip(self, thumbprints), fields(issuer = %issuer))]
    pub async fn register_federated_provider(
        &mut self,
        issuer: &IssuerUrl,
        audience: &str,
        thumbprints: &[Thumbprint],
    ) -> Result<ProviderHandle> {
        const ADDRESS: ResourceAddress = ResourceAddress::Provider;

        if thumbprints.is_empty() {
            return Err(SealplaneError::trust_configuration_field("thumbprint is empty", "thumbprints"));
        }
        if audience.trim().is_empty() {
            return Err(SealplaneError::trust_configuration_field("audience is empty", "audience"));
        }

        let provider = self.provider;
        let provider_arn = arn::oidc_provider(self.account_id, issuer.without_scheme());
        let desired: Vec<String> = thumbprints.iter().map(|t| t.as_str().to_string()).collect();

        let observed =
            self.exec.observe(ADDRESS, "describe_oidc_provider", || provider.describe_oidc_provider(&provider_arn)).await?;

        match observed {
            None => {
                let request = CreateOidcProviderRequest {
                    url: issuer.as_str().to_string(),
                    client_ids: vec![audience.to_string()],
                    thumbprints: desired,
                    tags: self.ctx.tags.clone(),
                };
                let created = self
                    .exec
                    .mutate(ADDRESS, ChangeAction::Create, format!("register issuer {}", issuer), || {
                        provider.create_oidc_provider(&request)
                    })
                    .await?;
                if let Some(created_arn) = created {
                    info!(arn = %created_arn, "Registered federated identity provider");
                }
            }
            Some(existing) => {
                let want: BTreeSet<String> = desired.iter().cloned().collect();
                let have: BTreeSet<String> = existing.thumbprints.iter().map(|t| t.to_ascii_lowercase()).collect();
                if want != have {
                    self.exec
                        .mutate(ADDRESS, ChangeAction::Update, "thumbprints", || {
                            provider.update_oidc_thumbprints(&provider_arn, &desired)
                        })
                        .await?;
                }
                if !existing.client_ids.iter().any(|c| c == audience) {
                    self.exec
                        .mutate(ADDRESS, ChangeAction::Update, format!("add client id {}", audience), || {
                            provider.add_oidc_client_id(&provider_arn, audience)
                        })
                        .await?;
                }
                self.converge_tags(ADDRESS, TagTarget::OidcProvider(provider_arn.clone()), &existing.tags).await?;
            }
        }

        Ok(ProviderHandle { arn: provider_arn, issuer: issuer.clone() })
    }

    /// Create the role `namespace/service_account` assumes through `provider`.
    #[instrument(skip(self, provider_handle), fields(role = %self.ctx.names.role_name))]
    pub async fn create_assumable_role(
        &mut self,
        provider_handle: &ProviderHandle,
        namespace: &str,
        service_account: &str,
    ) -> Result<RoleHandle> {
        const ADDRESS: ResourceAddress = ResourceAddress::Role;

        let identity = WorkloadIdentity::new(namespace, service_account)?;
        let condition = TrustCondition::for_workload(&provider_handle.issuer, &identity);
        let policy = trust_policy(&provider_handle.arn, &condition, &self.ctx.audience);
        validate_trust_policy(&policy)?;
        let policy_json = policy.to_json()?;

        let provider = self.provider;
        let name = self.ctx.names.role_name.clone();

        let observed: Option<ObservedRole> =
            self.exec.observe(ADDRESS, "describe_role", || provider.describe_role(&name)).await?;

        let role_arn = match observed {
            None => {
                let tags = self.ctx.tags.clone();
                let detail = format!("create role {} for {}", name, condition.value);
                let created = self
                    .exec
                    .mutate(ADDRESS, ChangeAction::Create, detail, || provider.create_role(&name, &policy_json, &tags))
                    .await?;
                match created {
                    Some(role) => {
                        info!(arn = %role.arn, "Created assumable role");
                        role.arn
                    }
                    None => KNOWN_AFTER_APPLY.to_string(),
                }
            }
            Some(role) => {
                if !policy.matches_raw(&role.trust_policy) {
                    self.exec
                        .mutate(ADDRESS, ChangeAction::Update, "trust policy", || {
                            provider.update_trust_policy(&name, &policy_json)
                        })
                        .await?;
                }
                self.converge_tags(ADDRESS, TagTarget::Role(name.clone()), &role.tags).await?;
                role.arn
            }
        };

        Ok(RoleHandle { name, arn: role_arn, condition })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudProvider, InMemoryCloud};
    use crate::provisioning::testing::Harness;

    fn condition() -> TrustCondition {
        let issuer = IssuerUrl::parse("https://oidc.eks.eu-west-1.amazonaws.com/id/ABC").unwrap();
        TrustCondition::for_workload(&issuer, &WorkloadIdentity::new("vault", "vault").unwrap())
    }

    #[test]
    fn trust_policy_binds_exact_subject() {
        let policy = trust_policy("arn:aws:iam::123456789012:oidc-provider/x", &condition(), "sts.amazonaws.com");
        let json: serde_json::Value = serde_json::from_str(&policy.to_json().unwrap()).unwrap();
        let equals = &json["Statement"][0]["Condition"]["StringEquals"];

        assert_eq!(
            equals["oidc.eks.eu-west-1.amazonaws.com/id/ABC:sub"],
            "system:serviceaccount:vault:vault"
        );
        assert_eq!(equals["oidc.eks.eu-west-1.amazonaws.com/id/ABC:aud"], "sts.amazonaws.com");
        assert_eq!(json["Statement"][0]["Action"], "sts:AssumeRoleWithWebIdentity");
        assert!(validate_trust_policy(&policy).is_ok());
    }

    #[test]
    fn wildcard_subject_is_rejected() {
        let mut wildcard = condition();
        wildcard.value = "system:serviceaccount:vault:*".to_string();
        let policy = trust_policy("arn:aws:iam::123456789012:oidc-provider/x", &wildcard, "sts.amazonaws.com");
        assert!(matches!(validate_trust_policy(&policy), Err(SealplaneError::TrustConfiguration { .. })));

        let like = PolicyDocument::new(vec![Statement::allow("Any", [ASSUME_ACTION])
            .with_principal(Principal::Federated(StringList::one("arn:x")))
            .with_condition("StringLike", &condition().key, "system:serviceaccount:*")]);
        assert!(validate_trust_policy(&like).is_err());
    }

    #[tokio::test]
    async fn empty_thumbprints_are_rejected_before_any_call() {
        let cloud = InMemoryCloud::default();
        let mut harness = Harness::apply(&cloud).await;
        let issuer = harness.ctx.issuer.clone();

        let err = harness.provisioner().register_federated_provider(&issuer, "sts.amazonaws.com", &[]).await.unwrap_err();
        assert!(matches!(err, SealplaneError::TrustConfiguration { .. }));
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn provider_and_role_converge() {
        let cloud = InMemoryCloud::default();
        let mut harness = Harness::apply(&cloud).await;
        let issuer = harness.ctx.issuer.clone();
        let thumbprints = harness.ctx.thumbprints.clone();

        let provider = harness
            .provisioner()
            .register_federated_provider(&issuer, "sts.amazonaws.com", &thumbprints)
            .await
            .unwrap();
        assert_eq!(
            provider.arn,
            "arn:aws:iam::123456789012:oidc-provider/oidc.eks.eu-west-1.amazonaws.com/id/EXAMPLED539D4633E53DE1B71EXAMPLE"
        );

        let role = harness.provisioner().create_assumable_role(&provider, "vault", "vault").await.unwrap();
        assert_eq!(role.condition.value, "system:serviceaccount:vault:vault");
        assert_eq!(role.arn, "arn:aws:iam::123456789012:role/eks-vault-irsa-role");

        let count = cloud.mutation_count();
        harness.provisioner().register_federated_provider(&issuer, "sts.amazonaws.com", &thumbprints).await.unwrap();
        harness.provisioner().create_assumable_role(&provider, "vault", "vault").await.unwrap();
        assert_eq!(cloud.mutation_count(), count);
    }

    #[tokio::test]
    async fn drifted_trust_policy_is_restored() {
        let cloud = InMemoryCloud::default();
        let mut harness = Harness::apply(&cloud).await;
        let issuer = harness.ctx.issuer.clone();
        let thumbprints = harness.ctx.thumbprints.clone();
        let provider = harness
            .provisioner()
            .register_federated_provider(&issuer, "sts.amazonaws.com", &thumbprints)
            .await
            .unwrap();
        let role = harness.provisioner().create_assumable_role(&provider, "vault", "vault").await.unwrap();

        cloud.overwrite_trust_policy(&role.name, r#"{"Version":"2012-10-17","Statement":[]}"#).await;
        harness.provisioner().create_assumable_role(&provider, "vault", "vault").await.unwrap();

        let observed = cloud.describe_role(&role.name).await.unwrap().unwrap();
        let expected = trust_policy(&provider.arn, &role.condition, "sts.amazonaws.com");
        assert!(expected.matches_raw(&observed.trust_policy));
    }

    #[tokio::test]
    async fn rotated_thumbprint_updates_provider() {
        let cloud = InMemoryCloud::default();
        let mut harness = Harness::apply(&cloud).await;
        let issuer = harness.ctx.issuer.clone();
        let original = harness.ctx.thumbprints.clone();
        harness.provisioner().register_federated_provider(&issuer, "sts.amazonaws.com", &original).await.unwrap();

        let rotated = vec![Thumbprint::parse("06b25927c42a721631c1efd9431e648fa62e1e39").unwrap()];
        harness.provisioner().register_federated_provider(&issuer, "sts.amazonaws.com", &rotated).await.unwrap();

        assert_eq!(cloud.mutation_log().await.last().map(String::as_str), Some("update_oidc_thumbprints"));
    }
}
