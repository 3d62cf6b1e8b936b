//! IAM-style policy documents.
//!
//! The same document type models key policies, role trust policies and the
//! role's authorization policy. Serialization follows the cloud's JSON grammar,
//! so `Action`, `Resource` and condition values accept either a string or an
//! array.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SealplaneError};

pub const POLICY_VERSION: &str = "2012-10-17";

/// A string or list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StringList(Vec<String>);

impl StringList {
    pub fn one(value: impl Into<String>) -> Self {
        Self(vec![value.into()])
    }

    pub fn many<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(values.into_iter().map(Into::into).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn contains(&self, value: &str) -> bool {
        self.0.iter().any(|v| v == value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn sorted(&self) -> Self {
        let mut values = self.0.clone();
        values.sort();
        values.dedup();
        Self(values)
    }
}

impl Serialize for StringList {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.0.len() == 1 {
            serializer.serialize_str(&self.0[0])
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for StringList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::One(value) => Self(vec![value]),
            Raw::Many(values) => Self(values),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// Statement principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// `"*"`: anyone. Never produced by this crate; recognised so validation can reject it.
    Any,
    Aws(StringList),
    Service(StringList),
    Federated(StringList),
}

impl Principal {
    fn key(&self) -> Option<&'static str> {
        match self {
            Principal::Any => None,
            Principal::Aws(_) => Some("AWS"),
            Principal::Service(_) => Some("Service"),
            Principal::Federated(_) => Some("Federated"),
        }
    }

    fn values(&self) -> Option<&StringList> {
        match self {
            Principal::Any => None,
            Principal::Aws(v) | Principal::Service(v) | Principal::Federated(v) => Some(v),
        }
    }

    /// True for `"*"` or `{"AWS": "*"}`.
    pub fn is_wildcard(&self) -> bool {
        match self {
            Principal::Any => true,
            other => other.values().map(|v| v.contains("*")).unwrap_or(false),
        }
    }

    fn sorted(&self) -> Self {
        match self {
            Principal::Any => Principal::Any,
            Principal::Aws(v) => Principal::Aws(v.sorted()),
            Principal::Service(v) => Principal::Service(v.sorted()),
            Principal::Federated(v) => Principal::Federated(v.sorted()),
        }
    }
}

impl Serialize for Principal {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match (self.key(), self.values()) {
            (Some(key), Some(values)) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(key, values)?;
                map.end()
            }
            _ => serializer.serialize_str("*"),
        }
    }
}

impl<'de> Deserialize<'de> for Principal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct PrincipalVisitor;

        impl<'de> Visitor<'de> for PrincipalVisitor {
            type Value = Principal;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("\"*\" or a single-entry principal map")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Principal, E> {
                if v == "*" {
                    Ok(Principal::Any)
                } else {
                    Err(E::custom(format!("unsupported principal '{}'", v)))
                }
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Principal, A::Error> {
                let (key, values): (String, StringList) = map
                    .next_entry()?
                    .ok_or_else(|| de::Error::custom("principal map is empty"))?;
                if map.next_key::<String>()?.is_some() {
                    return Err(de::Error::custom("multi-type principals are not supported"));
                }
                match key.as_str() {
                    "AWS" => Ok(Principal::Aws(values)),
                    "Service" => Ok(Principal::Service(values)),
                    "Federated" => Ok(Principal::Federated(values)),
                    other => Err(de::Error::custom(format!("unknown principal type '{}'", other))),
                }
            }
        }

        deserializer.deserialize_any(PrincipalVisitor)
    }
}

/// Condition block: operator -> condition key -> values.
pub type Conditions = BTreeMap<String, BTreeMap<String, StringList>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    #[serde(rename = "Sid", default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(rename = "Effect")]
    pub effect: Effect,
    #[serde(rename = "Principal", default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    #[serde(rename = "Action")]
    pub actions: StringList,
    #[serde(rename = "Resource", default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<StringList>,
    #[serde(rename = "Condition", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conditions: Conditions,
}

impl Statement {
    /// An `Allow` statement with no principal, resources or conditions yet.
    pub fn allow<I, S>(sid: &str, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sid: Some(sid.to_string()),
            effect: Effect::Allow,
            principal: None,
            actions: StringList::many(actions),
            resources: None,
            conditions: BTreeMap::new(),
        }
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn on_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = Some(StringList::many(resources));
        self
    }

    pub fn with_condition(mut self, operator: &str, key: &str, value: &str) -> Self {
        self.conditions
            .entry(operator.to_string())
            .or_default()
            .insert(key.to_string(), StringList::one(value));
        self
    }

    fn normalized(&self) -> Self {
        Self {
            sid: self.sid.clone(),
            effect: self.effect,
            principal: self.principal.as_ref().map(Principal::sorted),
            actions: self.actions.sorted(),
            resources: self.resources.as_ref().map(StringList::sorted),
            conditions: self
                .conditions
                .iter()
                .map(|(op, entries)| {
                    (op.clone(), entries.iter().map(|(k, v)| (k.clone(), v.sorted())).collect())
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Statement")]
    pub statements: Vec<Statement>,
}

impl PolicyDocument {
    pub fn new(statements: Vec<Statement>) -> Self {
        Self { version: POLICY_VERSION.to_string(), statements }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| SealplaneError::Serialization {
            source: e,
            context: "Failed to parse policy document".to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SealplaneError::Serialization {
            source: e,
            context: "Failed to serialize policy document".to_string(),
        })
    }

    /// Order-insensitive comparison of action, resource and principal lists.
    pub fn equivalent(&self, other: &PolicyDocument) -> bool {
        self.version == other.version
            && self.statements.len() == other.statements.len()
            && self
                .statements
                .iter()
                .zip(other.statements.iter())
                .all(|(a, b)| a.normalized() == b.normalized())
    }

    /// Whether the raw JSON the provider reports matches this document.
    /// Unparseable documents never match.
    pub fn matches_raw(&self, raw: &str) -> bool {
        PolicyDocument::parse(raw).map(|observed| self.equivalent(&observed)).unwrap_or(false)
    }

    /// Every resource ARN named by any statement, with S3 object wildcards
    /// (`arn:aws:s3:::bucket/*`) folded onto their bucket. Any other wildcard
    /// resource is reported verbatim.
    pub fn referenced_resources(&self) -> BTreeSet<String> {
        self.statements
            .iter()
            .filter_map(|s| s.resources.as_ref())
            .flat_map(|r| r.iter())
            .map(|r| fold_bucket_objects(r).to_string())
            .collect()
    }

    /// Every action granted by an `Allow` statement.
    pub fn allowed_actions(&self) -> BTreeSet<String> {
        self.statements
            .iter()
            .filter(|s| s.effect == Effect::Allow)
            .flat_map(|s| s.actions.iter().cloned())
            .collect()
    }
}

fn fold_bucket_objects(resource: &str) -> &str {
    match resource.strip_prefix("arn:aws:s3:::").and_then(|r| r.strip_suffix("/*")) {
        Some(bucket) if !bucket.is_empty() && !bucket.contains(['/', '*']) => &resource[..resource.len() - 2],
        _ => resource,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_in_cloud_grammar() {
        let doc = PolicyDocument::new(vec![Statement::allow("Read", ["s3:GetObject"])
            .on_resources(["arn:aws:s3:::b/*"])]);
        let json: serde_json::Value = serde_json::from_str(&doc.to_json().unwrap()).unwrap();

        assert_eq!(json["Version"], "2012-10-17");
        assert_eq!(json["Statement"][0]["Action"], "s3:GetObject");
        assert_eq!(json["Statement"][0]["Resource"], "arn:aws:s3:::b/*");
        assert!(json["Statement"][0].get("Condition").is_none());
    }

    #[test]
    fn parses_string_or_array_forms() {
        let raw = r#"{
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": {"Federated": "arn:aws:iam::1:oidc-provider/x"},
                "Action": ["sts:AssumeRoleWithWebIdentity"],
                "Condition": {"StringEquals": {"x:sub": ["system:serviceaccount:a:b"]}}
            }]
        }"#;
        let doc = PolicyDocument::parse(raw).unwrap();
        let statement = &doc.statements[0];

        assert_eq!(statement.principal, Some(Principal::Federated(StringList::one("arn:aws:iam::1:oidc-provider/x"))));
        assert_eq!(statement.conditions["StringEquals"]["x:sub"], StringList::one("system:serviceaccount:a:b"));
    }

    #[test]
    fn wildcard_principal_round_trips() {
        let raw = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Principal":"*","Action":"kms:*","Resource":"*"}]}"#;
        let doc = PolicyDocument::parse(raw).unwrap();
        assert_eq!(doc.statements[0].principal, Some(Principal::Any));
        assert!(doc.statements[0].principal.as_ref().unwrap().is_wildcard());
        assert!(Principal::Aws(StringList::one("*")).is_wildcard());
        assert!(!Principal::Aws(StringList::one("arn:aws:iam::1:root")).is_wildcard());
    }

    #[test]
    fn equivalence_ignores_list_order() {
        let a = PolicyDocument::new(vec![Statement::allow("S", ["b", "a"]).on_resources(["r2", "r1"])]);
        let b = PolicyDocument::new(vec![Statement::allow("S", ["a", "b"]).on_resources(["r1", "r2"])]);
        let c = PolicyDocument::new(vec![Statement::allow("S", ["a"]).on_resources(["r1", "r2"])]);

        assert!(a.equivalent(&b));
        assert!(!a.equivalent(&c));
        assert!(a.matches_raw(&b.to_json().unwrap()));
        assert!(!a.matches_raw("not json"));
    }

    #[test]
    fn referenced_resources_fold_object_wildcards() {
        let doc = PolicyDocument::new(vec![
            Statement::allow("K", ["kms:Decrypt"]).on_resources(["arn:aws:kms:r:1:key/k"]),
            Statement::allow("B", ["s3:GetObject"]).on_resources(["arn:aws:s3:::b", "arn:aws:s3:::b/*"]),
        ]);

        let resources: Vec<_> = doc.referenced_resources().into_iter().collect();
        assert_eq!(resources, vec!["arn:aws:kms:r:1:key/k".to_string(), "arn:aws:s3:::b".to_string()]);
    }

    #[test]
    fn only_bucket_object_wildcards_are_folded() {
        let doc = PolicyDocument::new(vec![Statement::allow("K", ["kms:Decrypt"])
            .on_resources(["arn:aws:kms:r:1:key/k/*", "arn:aws:s3:::b/prefix/*"])]);

        let resources = doc.referenced_resources();
        assert!(resources.contains("arn:aws:kms:r:1:key/k/*"));
        assert!(resources.contains("arn:aws:s3:::b/prefix/*"));
        assert!(!resources.contains("arn:aws:kms:r:1:key/k"));
    }

    #[test]
    fn rejects_multi_type_principal() {
        let raw = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Principal":{"AWS":"a","Service":"b"},"Action":"x"}]}"#;
        assert!(PolicyDocument::parse(raw).is_err());
    }
}
