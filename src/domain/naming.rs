//! Deterministic resource names and ARNs.

use std::net::Ipv4Addr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{Result, SealplaneError};

static CLUSTER_SHORT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));

static BUCKET_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9.-]*[a-z0-9]$").expect("valid regex"));

const MAX_CLUSTER_SHORT_NAME_LEN: usize = 32;

/// Names derived from the cluster short name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub key_alias: String,
    pub role_name: String,
    pub policy_name: String,
}

impl ResourceNames {
    pub fn for_cluster(short_name: &str) -> Result<Self> {
        validate_cluster_short_name(short_name)?;
        Ok(Self {
            key_alias: format!("alias/{}-vault-unseal", short_name),
            role_name: format!("{}-vault-irsa-role", short_name),
            policy_name: format!("{}-vault-irsa-policy", short_name),
        })
    }
}

pub fn validate_cluster_short_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_CLUSTER_SHORT_NAME_LEN || !CLUSTER_SHORT_NAME.is_match(name) {
        return Err(SealplaneError::validation_field(
            format!(
                "cluster short name '{}' must be a lowercase DNS label of at most {} characters",
                name, MAX_CLUSTER_SHORT_NAME_LEN
            ),
            "cluster_short_name",
        ));
    }
    Ok(())
}

/// Object storage bucket naming rules.
pub fn validate_bucket_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| -> Result<()> {
        Err(SealplaneError::validation_field(format!("bucket name '{}' {}", name, reason), "bucket_name"))
    };

    if name.len() < 3 || name.len() > 63 {
        return invalid("must be 3-63 characters");
    }
    if !BUCKET_NAME.is_match(name) {
        return invalid("may contain only lowercase letters, digits, '.' and '-', and must start and end with a letter or digit");
    }
    if name.contains("..") || name.contains(".-") || name.contains("-.") {
        return invalid("must not contain adjacent separators");
    }
    if name.parse::<Ipv4Addr>().is_ok() {
        return invalid("must not be formatted as an IP address");
    }
    if name.starts_with("xn--") || name.ends_with("-s3alias") {
        return invalid("uses a reserved prefix or suffix");
    }
    Ok(())
}

pub mod arn {
    //! ARN builders. Only the key ARN is assigned by the provider; the rest
    //! are derivable up front, which is what lets an interrupted run adopt
    //! resources it created but never recorded.

    pub fn bucket(name: &str) -> String {
        format!("arn:aws:s3:::{}", name)
    }

    pub fn bucket_objects(name: &str) -> String {
        format!("arn:aws:s3:::{}/*", name)
    }

    pub fn account_root(account_id: &str) -> String {
        format!("arn:aws:iam::{}:root", account_id)
    }

    pub fn oidc_provider(account_id: &str, issuer_without_scheme: &str) -> String {
        format!("arn:aws:iam::{}:oidc-provider/{}", account_id, issuer_without_scheme)
    }

    pub fn role(account_id: &str, name: &str) -> String {
        format!("arn:aws:iam::{}:role/{}", account_id, name)
    }

    pub fn policy(account_id: &str, name: &str) -> String {
        format!("arn:aws:iam::{}:policy/{}", account_id, name)
    }

    pub fn key(region: &str, account_id: &str, key_id: &str) -> String {
        format!("arn:aws:kms:{}:{}:key/{}", region, account_id, key_id)
    }
}
