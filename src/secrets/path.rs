//! Secret path convention: `<mount>/data/<prefix>/<service>/<key>`.
//!
//! Platform secrets live at `secret/data/platform/<service>/<key>`. Each path
//! maps to exactly one materialized platform secret object named
//! `<service>-<key>`.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use super::error::{Result, SecretsError};

/// KV v2 mount used when the path convention is followed.
pub const DEFAULT_MOUNT: &str = "secret";
/// Namespace prefix used for platform secrets.
pub const PLATFORM_PREFIX: &str = "platform";

const MAX_OBJECT_NAME_LEN: usize = 253;

static SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("valid regex"));

/// A parsed and validated secret path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretPath {
    mount: String,
    prefix: String,
    service: String,
    key: String,
}

impl SecretPath {
    /// Build a path under the platform prefix of the default mount.
    pub fn platform(service: &str, key: &str) -> Result<Self> {
        Self::parse(&format!("{}/data/{}/{}/{}", DEFAULT_MOUNT, PLATFORM_PREFIX, service, key))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim().trim_matches('/');
        let segments: Vec<&str> = trimmed.split('/').collect();

        if segments.len() != 5 {
            return Err(SecretsError::invalid_path(
                raw,
                format!("expected <mount>/data/<prefix>/<service>/<key>, got {} segment(s)", segments.len()),
            ));
        }
        if segments[1] != "data" {
            return Err(SecretsError::invalid_path(raw, "second segment must be 'data' (KV v2)"));
        }
        for segment in segments.iter() {
            if segment.contains("..") || !SEGMENT.is_match(segment) {
                return Err(SecretsError::invalid_path(raw, format!("invalid segment '{}'", segment)));
            }
        }

        let path = Self {
            mount: segments[0].to_string(),
            prefix: segments[2].to_string(),
            service: segments[3].to_string(),
            key: segments[4].to_string(),
        };
        if path.object_name().len() > MAX_OBJECT_NAME_LEN {
            return Err(SecretsError::invalid_path(raw, "object name exceeds 253 characters"));
        }
        Ok(path)
    }

    pub fn mount(&self) -> &str {
        &self.mount
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Path relative to the mount, as the KV v2 API expects it.
    pub fn kv_path(&self) -> String {
        format!("{}/{}/{}", self.prefix, self.service, self.key)
    }

    /// DNS-1123 name of the materialized secret object.
    pub fn object_name(&self) -> String {
        let raw = format!("{}-{}", self.service, self.key).to_ascii_lowercase();
        let mut name: String = raw.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' }).collect();
        while name.ends_with('-') {
            name.pop();
        }
        name
    }
}

impl fmt::Display for SecretPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/data/{}/{}/{}", self.mount, self.prefix, self.service, self.key)
    }
}

impl FromStr for SecretPath {
    type Err = SecretsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
