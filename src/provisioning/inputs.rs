//! Declared bootstrap inputs and their validation.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{validate_bucket_name, IssuerUrl, ResourceNames, Tags, Thumbprint, WorkloadIdentity};
use crate::errors::{Result, SealplaneError};

static REGION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z]{2}(-[a-z]+)+-\d+$").expect("valid regex"));

pub const DEFAULT_AUDIENCE: &str = "sts.amazonaws.com";
pub const MAX_THUMBPRINTS: usize = 5;

/// Everything an operator declares about one cluster's secret store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapInputs {
    pub region: String,
    pub cluster_id: String,
    pub cluster_short_name: String,
    pub bucket_name: String,
    pub issuer_url: String,
    pub audience: String,
    pub thumbprints: Vec<String>,
    pub namespace: String,
    pub service_account: String,
    pub key_rotation_enabled: bool,
    pub tags: BTreeMap<String, String>,
}

impl Default for BootstrapInputs {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            cluster_id: String::new(),
            cluster_short_name: String::new(),
            bucket_name: String::new(),
            issuer_url: String::new(),
            audience: DEFAULT_AUDIENCE.to_string(),
            thumbprints: Vec::new(),
            namespace: "vault".to_string(),
            service_account: "vault".to_string(),
            key_rotation_enabled: true,
            tags: BTreeMap::new(),
        }
    }
}

/// Validated, normalized inputs. Only this type reaches the provisioning
/// layer, so no cloud call can be made with unchecked configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisioningContext {
    pub region: String,
    pub cluster_id: String,
    pub bucket_name: String,
    pub issuer: IssuerUrl,
    pub audience: String,
    pub thumbprints: Vec<Thumbprint>,
    pub identity: WorkloadIdentity,
    pub rotation_enabled: bool,
    pub names: ResourceNames,
    pub tags: Tags,
}

impl BootstrapInputs {
    pub fn validate(&self) -> Result<ProvisioningContext> {
        let issuer = IssuerUrl::parse(&self.issuer_url)?;

        if self.thumbprints.is_empty() {
            return Err(SealplaneError::trust_configuration_field("at least one thumbprint is required", "thumbprints"));
        }
        if self.thumbprints.len() > MAX_THUMBPRINTS {
            return Err(SealplaneError::trust_configuration_field(
                format!("at most {} thumbprints are allowed", MAX_THUMBPRINTS),
                "thumbprints",
            ));
        }
        let mut thumbprints = self.thumbprints.iter().map(|t| Thumbprint::parse(t)).collect::<Result<Vec<_>>>()?;
        thumbprints.sort();
        thumbprints.dedup();

        let audience = self.audience.trim();
        if audience.is_empty() {
            return Err(SealplaneError::trust_configuration_field("audience is empty", "audience"));
        }

        let identity = WorkloadIdentity::new(&self.namespace, &self.service_account)?;

        if !REGION.is_match(&self.region) {
            return Err(SealplaneError::validation_field(format!("region '{}' is not valid", self.region), "region"));
        }
        if self.cluster_id.trim().is_empty() {
            return Err(SealplaneError::validation_field("cluster_id is required", "cluster_id"));
        }
        let names = ResourceNames::for_cluster(&self.cluster_short_name)?;
        validate_bucket_name(&self.bucket_name)?;

        let user_tags = Tags::from(self.tags.clone());
        user_tags.validate()?;

        Ok(ProvisioningContext {
            region: self.region.clone(),
            cluster_id: self.cluster_id.trim().to_string(),
            bucket_name: self.bucket_name.clone(),
            issuer,
            audience: audience.to_string(),
            thumbprints,
            identity,
            rotation_enabled: self.key_rotation_enabled,
            names,
            tags: Tags::managed(&user_tags, self.cluster_id.trim()),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::eks_inputs;
    use super::*;

    #[test]
    fn valid_inputs_produce_context() {
        let ctx = eks_inputs().validate().unwrap();
        assert_eq!(ctx.names.role_name, "eks-vault-irsa-role");
        assert_eq!(ctx.identity.subject(), "system:serviceaccount:vault:vault");
        assert_eq!(ctx.tags.get("sealplane:cluster"), Some("prod-eks-1"));
        assert_eq!(ctx.audience, "sts.amazonaws.com");
    }

    #[test]
    fn missing_scheme_is_trust_error() {
        let inputs = BootstrapInputs {
            issuer_url: "oidc.eks.eu-west-1.amazonaws.com/id/ABC".to_string(),
            ..eks_inputs()
        };
        assert!(matches!(inputs.validate(), Err(SealplaneError::TrustConfiguration { .. })));
    }

    #[test]
    fn empty_thumbprint_is_trust_error() {
        let inputs = BootstrapInputs { thumbprints: vec![], ..eks_inputs() };
        assert!(matches!(inputs.validate(), Err(SealplaneError::TrustConfiguration { .. })));

        let inputs = BootstrapInputs { thumbprints: vec!["".to_string()], ..eks_inputs() };
        assert!(matches!(inputs.validate(), Err(SealplaneError::TrustConfiguration { .. })));
    }

    #[test]
    fn thumbprints_are_normalized_and_deduplicated() {
        let inputs = BootstrapInputs {
            thumbprints: vec![
                "9E99A48A9960B14926BB7F3B02E22DA2B0AB7280".to_string(),
                "9e99a48a9960b14926bb7f3b02e22da2b0ab7280".to_string(),
            ],
            ..eks_inputs()
        };
        assert_eq!(inputs.validate().unwrap().thumbprints.len(), 1);
    }

    #[test]
    fn naming_and_tag_errors_are_validation_errors() {
        let inputs = BootstrapInputs { bucket_name: "Bad_Bucket".to_string(), ..eks_inputs() };
        assert!(matches!(inputs.validate(), Err(SealplaneError::Validation { .. })));

        let inputs = BootstrapInputs { region: "mars".to_string(), ..eks_inputs() };
        assert!(inputs.validate().is_err());

        let mut inputs = eks_inputs();
        inputs.tags.insert("aws:owner".to_string(), "x".to_string());
        assert!(inputs.validate().is_err());
    }
}
