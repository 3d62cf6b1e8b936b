//! Workload identity federation primitives.
//!
//! An [`IssuerUrl`] and a [`WorkloadIdentity`] together produce the single
//! [`TrustCondition`] an assumable role is allowed to carry. All three are
//! validated on construction, so a value of these types is always usable in a
//! trust policy.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

use crate::errors::{Result, SealplaneError};

/// DNS-1123 label (Kubernetes namespace).
static DNS_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));

/// DNS-1123 subdomain (Kubernetes service account name).
static DNS_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("valid regex")
});

const MAX_NAMESPACE_LEN: usize = 63;
const MAX_SERVICE_ACCOUNT_LEN: usize = 253;
const THUMBPRINT_LEN: usize = 40;

/// Cluster workload-identity issuer, normalized to `https://host[/path]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IssuerUrl(String);

impl IssuerUrl {
    /// Parse and validate an issuer URL.
    ///
    /// Rejects empty input, a missing or non-`https` scheme, userinfo, query,
    /// fragment and wildcard characters.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SealplaneError::trust_configuration_field("issuer URL is empty", "issuer_url"));
        }
        if trimmed.contains('*') || trimmed.contains('?') {
            return Err(SealplaneError::trust_configuration_field(
                format!("issuer URL '{}' must not contain wildcard or query characters", trimmed),
                "issuer_url",
            ));
        }

        let url = Url::parse(trimmed).map_err(|e| {
            SealplaneError::trust_configuration_field(
                format!("issuer URL '{}' is malformed ({}); an https:// scheme is required", trimmed, e),
                "issuer_url",
            )
        })?;

        if url.scheme() != "https" {
            return Err(SealplaneError::trust_configuration_field(
                format!("issuer URL '{}' must use the https scheme", trimmed),
                "issuer_url",
            ));
        }
        match url.host_str() {
            Some(host) if !host.is_empty() => {}
            _ => {
                return Err(SealplaneError::trust_configuration_field(
                    format!("issuer URL '{}' has no host", trimmed),
                    "issuer_url",
                ))
            }
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(SealplaneError::trust_configuration_field(
                "issuer URL must not carry credentials",
                "issuer_url",
            ));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(SealplaneError::trust_configuration_field(
                "issuer URL must not have a query or fragment",
                "issuer_url",
            ));
        }

        Ok(Self(url.as_str().trim_end_matches('/').to_string()))
    }

    /// Full normalized URL, e.g. `https://oidc.eks.eu-west-1.amazonaws.com/id/ABC`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Issuer without its scheme. This is the prefix of every trust condition
    /// key and the suffix of the provider ARN.
    pub fn without_scheme(&self) -> &str {
        self.0.trim_start_matches("https://")
    }
}

impl fmt::Display for IssuerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IssuerUrl {
    type Err = SealplaneError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for IssuerUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for IssuerUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// SHA-1 fingerprint of the issuer's TLS certificate chain, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Thumbprint(String);

impl Thumbprint {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SealplaneError::trust_configuration_field("thumbprint is empty", "thumbprints"));
        }
        if trimmed.len() != THUMBPRINT_LEN || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SealplaneError::trust_configuration_field(
                format!("thumbprint '{}' must be {} hex characters", trimmed, THUMBPRINT_LEN),
                "thumbprints",
            ));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The one namespace/service-account pair allowed to assume the role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    namespace: String,
    service_account: String,
}

impl WorkloadIdentity {
    pub fn new(namespace: &str, service_account: &str) -> Result<Self> {
        validate_component(namespace, "namespace", MAX_NAMESPACE_LEN, &DNS_LABEL)?;
        validate_component(service_account, "service_account", MAX_SERVICE_ACCOUNT_LEN, &DNS_SUBDOMAIN)?;
        Ok(Self { namespace: namespace.to_string(), service_account: service_account.to_string() })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn service_account(&self) -> &str {
        &self.service_account
    }

    /// The token subject the cluster issues for this service account.
    pub fn subject(&self) -> String {
        format!("system:serviceaccount:{}:{}", self.namespace, self.service_account)
    }
}

fn validate_component(value: &str, field: &str, max_len: usize, pattern: &Regex) -> Result<()> {
    if value.is_empty() {
        return Err(SealplaneError::trust_configuration_field(format!("{} is empty", field), field));
    }
    if value.contains('*') || value.contains('?') {
        return Err(SealplaneError::trust_configuration_field(
            format!("{} '{}' must not contain wildcards", field, value),
            field,
        ));
    }
    if value.len() > max_len || !pattern.is_match(value) {
        return Err(SealplaneError::trust_configuration_field(
            format!("{} '{}' is not a valid DNS-1123 name (max {} chars)", field, value, max_len),
            field,
        ));
    }
    Ok(())
}

/// `StringEquals` condition binding the role to exactly one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustCondition {
    pub key: String,
    pub value: String,
}

impl TrustCondition {
    pub fn for_workload(issuer: &IssuerUrl, identity: &WorkloadIdentity) -> Self {
        Self { key: format!("{}:sub", issuer.without_scheme()), value: identity.subject() }
    }
}
