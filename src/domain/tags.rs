//! Resource tags applied to everything sealplane creates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SealplaneError};

pub const MAX_TAGS: usize = 50;
pub const MAX_KEY_LEN: usize = 128;
pub const MAX_VALUE_LEN: usize = 256;

pub const CLUSTER_TAG: &str = "sealplane:cluster";
pub const MANAGED_BY_TAG: &str = "sealplane:managed-by";
pub const MANAGED_BY_VALUE: &str = "sealplane";
/// Set on keys at creation so a key whose alias was never created can be found.
pub const ALIAS_TAG: &str = "sealplane:alias";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// User tags plus the ownership tags every managed resource carries.
    pub fn managed(user: &Tags, cluster_id: &str) -> Self {
        let mut tags = user.clone();
        tags.insert(CLUSTER_TAG, cluster_id);
        tags.insert(MANAGED_BY_TAG, MANAGED_BY_VALUE);
        tags
    }

    /// Tags present in `self` but missing or different in `observed`.
    /// Extra tags on the observed resource are left alone.
    pub fn missing_from(&self, observed: &Tags) -> Tags {
        Tags(
            self.0
                .iter()
                .filter(|(k, v)| observed.0.get(*k) != Some(*v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Validate user-supplied tags. The `aws:` prefix is reserved by the
    /// provider and `sealplane:` by this tool.
    pub fn validate(&self) -> Result<()> {
        if self.0.len() > MAX_TAGS - 2 {
            return Err(SealplaneError::validation_field(
                format!("at most {} user tags are allowed", MAX_TAGS - 2),
                "tags",
            ));
        }
        for (key, value) in &self.0 {
            if key.is_empty() || key.len() > MAX_KEY_LEN {
                return Err(SealplaneError::validation_field(
                    format!("tag key '{}' must be 1-{} characters", key, MAX_KEY_LEN),
                    "tags",
                ));
            }
            let lowered = key.to_ascii_lowercase();
            if lowered.starts_with("aws:") || lowered.starts_with("sealplane:") {
                return Err(SealplaneError::validation_field(
                    format!("tag key '{}' uses a reserved prefix", key),
                    "tags",
                ));
            }
            if value.len() > MAX_VALUE_LEN {
                return Err(SealplaneError::validation_field(
                    format!("tag '{}' value exceeds {} characters", key, MAX_VALUE_LEN),
                    "tags",
                ));
            }
        }
        Ok(())
    }
}

impl From<BTreeMap<String, String>> for Tags {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
