//! AWS backend: KMS, S3, IAM and STS through the official SDK.
//!
//! Credentials come from the default provider chain (environment, profile,
//! IRSA web identity, instance metadata). Service errors are classified into
//! retryable and fatal [`SealplaneError`]s from their error codes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_kms::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_kms::primitives::Blob;
use tracing::{debug, info, warn};

use super::{
    CloudProvider, CreateBucketRequest, CreateKeyRequest, CreateOidcProviderRequest, KeyState, ObservedBucket, ObservedKey,
    ObservedPolicy, ObservedProvider, ObservedRole, TagTarget,
};
use crate::domain::tags::ALIAS_TAG;
use crate::domain::{arn, Tags};
use crate::errors::{Result, SealplaneError};
use crate::secrets::SecretBytes;
use crate::unseal::KeyDecryptor;

const RETRYABLE_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "SlowDown",
    "ServiceUnavailable",
    "InternalError",
    "InternalFailure",
    "ServiceFailure",
    "KMSInternalException",
    "DependencyTimeoutException",
];

/// Classify an SDK failure. Transport failures and throttling are retryable;
/// everything else (access denied, malformed policy, conflicts) is fatal.
fn classify<E, R>(resource: &str, operation: &str, err: SdkError<E, R>) -> SealplaneError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::ServiceError(_) => {
            let code = err.code().unwrap_or("Unknown").to_string();
            let message = format!("{} failed: {}: {}", operation, code, err.message().unwrap_or("no message"));
            if RETRYABLE_CODES.contains(&code.as_str()) {
                SealplaneError::provisioning_retryable(resource, message)
            } else {
                SealplaneError::provisioning(resource, message)
            }
        }
        SdkError::TimeoutError(_) => SealplaneError::timeout(format!("{} {}", resource, operation), 0),
        _ => SealplaneError::provisioning_retryable(resource, format!("{} failed: {:?}", operation, err)),
    }
}

fn decode_policy(raw: &str) -> String {
    urlencoding::decode(raw).map(|d| d.into_owned()).unwrap_or_else(|_| raw.to_string())
}

fn build_error(resource: &str, e: impl std::fmt::Display) -> SealplaneError {
    SealplaneError::provisioning(resource, format!("invalid request: {}", e))
}

#[derive(Debug, Clone)]
pub struct AwsCloud {
    region: String,
    kms: aws_sdk_kms::Client,
    s3: aws_sdk_s3::Client,
    iam: aws_sdk_iam::Client,
    sts: aws_sdk_sts::Client,
}

impl AwsCloud {
    /// Build clients from the ambient configuration for `region`.
    pub async fn from_env(region: &str) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        info!(region, "Loaded AWS configuration");
        Self::new(region, &config)
    }

    pub fn new(region: &str, config: &aws_config::SdkConfig) -> Self {
        Self {
            region: region.to_string(),
            kms: aws_sdk_kms::Client::new(config),
            s3: aws_sdk_s3::Client::new(config),
            iam: aws_sdk_iam::Client::new(config),
            sts: aws_sdk_sts::Client::new(config),
        }
    }

    fn kms_tags(tags: &Tags) -> Result<Vec<aws_sdk_kms::types::Tag>> {
        tags.iter()
            .map(|(k, v)| {
                aws_sdk_kms::types::Tag::builder().tag_key(k).tag_value(v).build().map_err(|e| build_error("kms_key", e))
            })
            .collect()
    }

    fn iam_tags(tags: &Tags) -> Result<Vec<aws_sdk_iam::types::Tag>> {
        tags.iter()
            .map(|(k, v)| aws_sdk_iam::types::Tag::builder().key(k).value(v).build().map_err(|e| build_error("iam", e)))
            .collect()
    }

    fn from_iam_tags(tags: &[aws_sdk_iam::types::Tag]) -> Tags {
        tags.iter().map(|t| (t.key(), t.value())).collect()
    }

    async fn observe_key(&self, key_ref: &str) -> Result<Option<ObservedKey>> {
        let described = match self.kms.describe_key().key_id(key_ref).send().await {
            Ok(output) => output,
            Err(err) => {
                let not_found = matches!(&err, SdkError::ServiceError(e) if e.err().is_not_found_exception());
                if not_found {
                    return Ok(None);
                }
                return Err(classify("kms_key", "DescribeKey", err));
            }
        };
        let Some(metadata) = described.key_metadata() else {
            return Ok(None);
        };

        let key_id = metadata.key_id().to_string();
        let state = match metadata.key_state() {
            Some(aws_sdk_kms::types::KeyState::Enabled) => KeyState::Enabled,
            Some(aws_sdk_kms::types::KeyState::PendingDeletion)
            | Some(aws_sdk_kms::types::KeyState::PendingReplicaDeletion) => KeyState::PendingDeletion,
            _ => KeyState::Disabled,
        };

        let rotation_enabled = self
            .kms
            .get_key_rotation_status()
            .key_id(&key_id)
            .send()
            .await
            .map_err(|e| classify("kms_key", "GetKeyRotationStatus", e))?
            .key_rotation_enabled();

        let policy = self
            .kms
            .get_key_policy()
            .key_id(&key_id)
            .policy_name("default")
            .send()
            .await
            .map_err(|e| classify("kms_key", "GetKeyPolicy", e))?
            .policy()
            .map(str::to_string);

        let tags = self
            .kms
            .list_resource_tags()
            .key_id(&key_id)
            .send()
            .await
            .map_err(|e| classify("kms_key", "ListResourceTags", e))?
            .tags()
            .iter()
            .map(|t| (t.tag_key(), t.tag_value()))
            .collect();

        Ok(Some(ObservedKey {
            arn: metadata.arn().map(str::to_string).unwrap_or_else(|| key_id.clone()),
            key_id,
            state,
            rotation_enabled,
            policy,
            tags,
        }))
    }
}

#[async_trait]
impl CloudProvider for AwsCloud {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn account_id(&self) -> Result<String> {
        let identity = self
            .sts
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| classify("sts", "GetCallerIdentity", e))?;
        identity
            .account()
            .map(str::to_string)
            .ok_or_else(|| SealplaneError::provisioning("sts", "GetCallerIdentity returned no account"))
    }

    async fn describe_key(&self, key_id: &str) -> Result<Option<ObservedKey>> {
        self.observe_key(key_id).await
    }

    async fn find_key_by_alias(&self, alias: &str) -> Result<Option<ObservedKey>> {
        self.observe_key(alias).await
    }

    async fn find_unaliased_key(&self, alias: &str) -> Result<Option<ObservedKey>> {
        let mut marker: Option<String> = None;
        loop {
            let page = self
                .kms
                .list_keys()
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| classify("kms_key", "ListKeys", e))?;

            for entry in page.keys() {
                let Some(key_id) = entry.key_id() else { continue };
                let tags = self
                    .kms
                    .list_resource_tags()
                    .key_id(key_id)
                    .send()
                    .await
                    .map_err(|e| classify("kms_key", "ListResourceTags", e))?;
                if !tags.tags().iter().any(|t| t.tag_key() == ALIAS_TAG && t.tag_value() == alias) {
                    continue;
                }
                let aliases = self
                    .kms
                    .list_aliases()
                    .key_id(key_id)
                    .send()
                    .await
                    .map_err(|e| classify("kms_key", "ListAliases", e))?;
                if !aliases.aliases().is_empty() {
                    continue;
                }
                if let Some(key) = self.observe_key(key_id).await? {
                    if key.state != KeyState::PendingDeletion {
                        return Ok(Some(key));
                    }
                }
            }

            if !page.truncated() {
                return Ok(None);
            }
            marker = page.next_marker().map(str::to_string);
        }
    }

    async fn create_key(&self, request: &CreateKeyRequest) -> Result<ObservedKey> {
        let created = self
            .kms
            .create_key()
            .description(&request.description)
            .policy(&request.policy)
            .key_usage(aws_sdk_kms::types::KeyUsageType::EncryptDecrypt)
            .key_spec(aws_sdk_kms::types::KeySpec::SymmetricDefault)
            .set_tags(Some(Self::kms_tags(&request.tags)?))
            .send()
            .await
            .map_err(|e| classify("kms_key", "CreateKey", e))?;
        let metadata = created
            .key_metadata()
            .ok_or_else(|| SealplaneError::provisioning("kms_key", "CreateKey returned no key metadata"))?;
        let key_id = metadata.key_id().to_string();
        debug!(key_id = %key_id, "Created KMS key");

        if let Err(err) = self.create_alias(&request.alias, &key_id).await {
            warn!(key_id = %key_id, error = %err, "CreateAlias failed; scheduling the new key for deletion");
            if let Err(cleanup) =
                self.kms.schedule_key_deletion().key_id(&key_id).pending_window_in_days(7).send().await
            {
                warn!(key_id = %key_id, error = ?cleanup, "Failed to schedule deletion of unaliased key");
            }
            return Err(err);
        }

        if request.rotation_enabled {
            self.set_key_rotation(&key_id, true).await?;
        }

        Ok(ObservedKey {
            arn: metadata.arn().map(str::to_string).unwrap_or_else(|| key_id.clone()),
            key_id,
            state: KeyState::Enabled,
            rotation_enabled: request.rotation_enabled,
            policy: Some(request.policy.clone()),
            tags: request.tags.clone(),
        })
    }

    async fn create_alias(&self, alias: &str, key_id: &str) -> Result<()> {
        match self.kms.create_alias().alias_name(alias).target_key_id(key_id).send().await {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(e)) if e.err().is_already_exists_exception() => {
                Err(SealplaneError::name_collision("kms alias", alias))
            }
            Err(err) => Err(classify("kms_key", "CreateAlias", err)),
        }
    }

    async fn put_key_policy(&self, key_id: &str, policy: &str) -> Result<()> {
        self.kms
            .put_key_policy()
            .key_id(key_id)
            .policy_name("default")
            .policy(policy)
            .send()
            .await
            .map_err(|e| classify("kms_key", "PutKeyPolicy", e))?;
        Ok(())
    }

    async fn set_key_rotation(&self, key_id: &str, enabled: bool) -> Result<()> {
        if enabled {
            self.kms
                .enable_key_rotation()
                .key_id(key_id)
                .send()
                .await
                .map_err(|e| classify("kms_key", "EnableKeyRotation", e))?;
        } else {
            self.kms
                .disable_key_rotation()
                .key_id(key_id)
                .send()
                .await
                .map_err(|e| classify("kms_key", "DisableKeyRotation", e))?;
        }
        Ok(())
    }

    async fn describe_bucket(&self, name: &str) -> Result<Option<ObservedBucket>> {
        if let Err(err) = self.s3.head_bucket().bucket(name).send().await {
            if let SdkError::ServiceError(service) = &err {
                if service.err().is_not_found() {
                    return Ok(None);
                }
                if service.raw().status().as_u16() == 403 {
                    return Err(SealplaneError::name_collision("bucket", name));
                }
            }
            return Err(classify("s3_bucket", "HeadBucket", err));
        }

        let encryption_key_arn = match self.s3.get_bucket_encryption().bucket(name).send().await {
            Ok(output) => output
                .server_side_encryption_configuration()
                .and_then(|c| c.rules().first())
                .and_then(|r| r.apply_server_side_encryption_by_default())
                .and_then(|d| d.kms_master_key_id())
                .map(str::to_string),
            Err(err) if err.code() == Some("ServerSideEncryptionConfigurationNotFoundError") => None,
            Err(err) => return Err(classify("s3_bucket", "GetBucketEncryption", err)),
        };

        let public_access_blocked = match self.s3.get_public_access_block().bucket(name).send().await {
            Ok(output) => output
                .public_access_block_configuration()
                .map(|c| {
                    c.block_public_acls().unwrap_or(false)
                        && c.ignore_public_acls().unwrap_or(false)
                        && c.block_public_policy().unwrap_or(false)
                        && c.restrict_public_buckets().unwrap_or(false)
                })
                .unwrap_or(false),
            Err(err) if err.code() == Some("NoSuchPublicAccessBlockConfiguration") => false,
            Err(err) => return Err(classify("s3_bucket", "GetPublicAccessBlock", err)),
        };

        let tags = match self.s3.get_bucket_tagging().bucket(name).send().await {
            Ok(output) => output.tag_set().iter().map(|t| (t.key(), t.value())).collect(),
            Err(err) if err.code() == Some("NoSuchTagSet") => Tags::new(),
            Err(err) => return Err(classify("s3_bucket", "GetBucketTagging", err)),
        };

        Ok(Some(ObservedBucket {
            name: name.to_string(),
            arn: arn::bucket(name),
            encryption_key_arn,
            public_access_blocked,
            tags,
        }))
    }

    async fn create_bucket(&self, request: &CreateBucketRequest) -> Result<()> {
        let name = request.name.as_str();
        let mut create = self
            .s3
            .create_bucket()
            .bucket(name)
            .acl(aws_sdk_s3::types::BucketCannedAcl::Private)
            .object_ownership(aws_sdk_s3::types::ObjectOwnership::BucketOwnerEnforced);
        if self.region != "us-east-1" {
            create = create.create_bucket_configuration(
                aws_sdk_s3::types::CreateBucketConfiguration::builder()
                    .location_constraint(aws_sdk_s3::types::BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        if let Err(err) = create.send().await {
            let collision = matches!(&err, SdkError::ServiceError(e) if e.err().is_bucket_already_exists());
            if collision {
                return Err(SealplaneError::name_collision("bucket", name));
            }
            return Err(classify("s3_bucket", "CreateBucket", err));
        }

        let secured = async {
            self.put_public_access_block(name).await?;
            self.put_bucket_encryption(name, &request.key_arn).await?;
            self.tag_resource(&TagTarget::Bucket(name.to_string()), &request.tags).await
        }
        .await;
        if let Err(err) = secured {
            warn!(bucket = %name, error = %err, "Failed to secure new bucket; deleting it");
            if let Err(cleanup) = self.delete_bucket(name).await {
                warn!(bucket = %name, error = %cleanup, "Failed to delete unsecured bucket");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn put_bucket_encryption(&self, name: &str, key_arn: &str) -> Result<()> {
        use aws_sdk_s3::types::{
            ServerSideEncryption, ServerSideEncryptionByDefault, ServerSideEncryptionConfiguration,
            ServerSideEncryptionRule,
        };

        let default = ServerSideEncryptionByDefault::builder()
            .sse_algorithm(ServerSideEncryption::AwsKms)
            .kms_master_key_id(key_arn)
            .build()
            .map_err(|e| build_error("s3_bucket", e))?;
        let rule = ServerSideEncryptionRule::builder()
            .apply_server_side_encryption_by_default(default)
            .bucket_key_enabled(true)
            .build();
        let configuration = ServerSideEncryptionConfiguration::builder()
            .rules(rule)
            .build()
            .map_err(|e| build_error("s3_bucket", e))?;

        self.s3
            .put_bucket_encryption()
            .bucket(name)
            .server_side_encryption_configuration(configuration)
            .send()
            .await
            .map_err(|e| classify("s3_bucket", "PutBucketEncryption", e))?;
        Ok(())
    }

    async fn put_public_access_block(&self, name: &str) -> Result<()> {
        let configuration = aws_sdk_s3::types::PublicAccessBlockConfiguration::builder()
            .block_public_acls(true)
            .ignore_public_acls(true)
            .block_public_policy(true)
            .restrict_public_buckets(true)
            .build();
        self.s3
            .put_public_access_block()
            .bucket(name)
            .public_access_block_configuration(configuration)
            .send()
            .await
            .map_err(|e| classify("s3_bucket", "PutPublicAccessBlock", e))?;
        Ok(())
    }

    async fn delete_bucket(&self, name: &str) -> Result<()> {
        self.s3
            .delete_bucket()
            .bucket(name)
            .send()
            .await
            .map_err(|e| classify("s3_bucket", "DeleteBucket", e))?;
        Ok(())
    }

    async fn describe_oidc_provider(&self, arn: &str) -> Result<Option<ObservedProvider>> {
        match self.iam.get_open_id_connect_provider().open_id_connect_provider_arn(arn).send().await {
            Ok(output) => Ok(Some(ObservedProvider {
                arn: arn.to_string(),
                url: output.url().unwrap_or_default().trim_start_matches("https://").to_string(),
                client_ids: output.client_id_list().to_vec(),
                thumbprints: output.thumbprint_list().iter().map(|t| t.to_ascii_lowercase()).collect(),
                tags: Self::from_iam_tags(output.tags()),
            })),
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_entity_exception() => Ok(None),
            Err(err) => Err(classify("oidc_provider", "GetOpenIDConnectProvider", err)),
        }
    }

    async fn create_oidc_provider(&self, request: &CreateOidcProviderRequest) -> Result<String> {
        let created = self
            .iam
            .create_open_id_connect_provider()
            .url(&request.url)
            .set_client_id_list(Some(request.client_ids.clone()))
            .set_thumbprint_list(Some(request.thumbprints.clone()))
            .set_tags(Some(Self::iam_tags(&request.tags)?))
            .send()
            .await
            .map_err(|e| classify("oidc_provider", "CreateOpenIDConnectProvider", e))?;
        created
            .open_id_connect_provider_arn()
            .map(str::to_string)
            .ok_or_else(|| SealplaneError::provisioning("oidc_provider", "CreateOpenIDConnectProvider returned no ARN"))
    }

    async fn update_oidc_thumbprints(&self, arn: &str, thumbprints: &[String]) -> Result<()> {
        self.iam
            .update_open_id_connect_provider_thumbprint()
            .open_id_connect_provider_arn(arn)
            .set_thumbprint_list(Some(thumbprints.to_vec()))
            .send()
            .await
            .map_err(|e| classify("oidc_provider", "UpdateOpenIDConnectProviderThumbprint", e))?;
        Ok(())
    }

    async fn add_oidc_client_id(&self, arn: &str, client_id: &str) -> Result<()> {
        self.iam
            .add_client_id_to_open_id_connect_provider()
            .open_id_connect_provider_arn(arn)
            .client_id(client_id)
            .send()
            .await
            .map_err(|e| classify("oidc_provider", "AddClientIDToOpenIDConnectProvider", e))?;
        Ok(())
    }

    async fn describe_role(&self, name: &str) -> Result<Option<ObservedRole>> {
        match self.iam.get_role().role_name(name).send().await {
            Ok(output) => Ok(output.role().map(|role| ObservedRole {
                name: role.role_name().to_string(),
                arn: role.arn().to_string(),
                trust_policy: role.assume_role_policy_document().map(decode_policy).unwrap_or_default(),
                tags: Self::from_iam_tags(role.tags()),
            })),
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_entity_exception() => Ok(None),
            Err(err) => Err(classify("iam_role", "GetRole", err)),
        }
    }

    async fn create_role(&self, name: &str, trust_policy: &str, tags: &Tags) -> Result<ObservedRole> {
        let created = self
            .iam
            .create_role()
            .role_name(name)
            .assume_role_policy_document(trust_policy)
            .description("Vault workload identity (managed by sealplane)")
            .set_tags(Some(Self::iam_tags(tags)?))
            .send()
            .await
            .map_err(|e| classify("iam_role", "CreateRole", e))?;
        let role = created
            .role()
            .ok_or_else(|| SealplaneError::provisioning("iam_role", "CreateRole returned no role"))?;
        Ok(ObservedRole {
            name: role.role_name().to_string(),
            arn: role.arn().to_string(),
            trust_policy: trust_policy.to_string(),
            tags: tags.clone(),
        })
    }

    async fn update_trust_policy(&self, name: &str, trust_policy: &str) -> Result<()> {
        self.iam
            .update_assume_role_policy()
            .role_name(name)
            .policy_document(trust_policy)
            .send()
            .await
            .map_err(|e| classify("iam_role", "UpdateAssumeRolePolicy", e))?;
        Ok(())
    }

    async fn describe_policy(&self, arn: &str) -> Result<Option<ObservedPolicy>> {
        let output = match self.iam.get_policy().policy_arn(arn).send().await {
            Ok(output) => output,
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_entity_exception() => return Ok(None),
            Err(err) => return Err(classify("iam_policy", "GetPolicy", err)),
        };
        let Some(policy) = output.policy() else {
            return Ok(None);
        };
        let default_version_id = policy.default_version_id().unwrap_or("v1").to_string();

        let document = self
            .iam
            .get_policy_version()
            .policy_arn(arn)
            .version_id(&default_version_id)
            .send()
            .await
            .map_err(|e| classify("iam_policy", "GetPolicyVersion", e))?
            .policy_version()
            .and_then(|v| v.document())
            .map(decode_policy)
            .unwrap_or_default();

        Ok(Some(ObservedPolicy {
            name: policy.policy_name().unwrap_or_default().to_string(),
            arn: arn.to_string(),
            default_version_id,
            document,
            tags: Self::from_iam_tags(policy.tags()),
        }))
    }

    async fn create_policy(&self, name: &str, document: &str, tags: &Tags) -> Result<ObservedPolicy> {
        let created = self
            .iam
            .create_policy()
            .policy_name(name)
            .policy_document(document)
            .description("Vault unseal and storage access (managed by sealplane)")
            .set_tags(Some(Self::iam_tags(tags)?))
            .send()
            .await
            .map_err(|e| classify("iam_policy", "CreatePolicy", e))?;
        let policy = created
            .policy()
            .ok_or_else(|| SealplaneError::provisioning("iam_policy", "CreatePolicy returned no policy"))?;
        Ok(ObservedPolicy {
            name: name.to_string(),
            arn: policy.arn().unwrap_or_default().to_string(),
            default_version_id: policy.default_version_id().unwrap_or("v1").to_string(),
            document: document.to_string(),
            tags: tags.clone(),
        })
    }

    async fn create_policy_version(&self, arn: &str, document: &str) -> Result<String> {
        let versions = self
            .iam
            .list_policy_versions()
            .policy_arn(arn)
            .send()
            .await
            .map_err(|e| classify("iam_policy", "ListPolicyVersions", e))?;

        if versions.versions().len() >= 5 {
            let oldest = versions
                .versions()
                .iter()
                .filter(|v| !v.is_default_version())
                .min_by_key(|v| v.create_date().map(|d| d.secs()).unwrap_or(i64::MAX))
                .and_then(|v| v.version_id());
            if let Some(version_id) = oldest {
                debug!(policy_arn = arn, version_id, "Pruning oldest policy version");
                self.iam
                    .delete_policy_version()
                    .policy_arn(arn)
                    .version_id(version_id)
                    .send()
                    .await
                    .map_err(|e| classify("iam_policy", "DeletePolicyVersion", e))?;
            }
        }

        let created = self
            .iam
            .create_policy_version()
            .policy_arn(arn)
            .policy_document(document)
            .set_as_default(true)
            .send()
            .await
            .map_err(|e| classify("iam_policy", "CreatePolicyVersion", e))?;
        created
            .policy_version()
            .and_then(|v| v.version_id())
            .map(str::to_string)
            .ok_or_else(|| SealplaneError::provisioning("iam_policy", "CreatePolicyVersion returned no version"))
    }

    async fn list_attached_policies(&self, role_name: &str) -> Result<Vec<String>> {
        let output = self
            .iam
            .list_attached_role_policies()
            .role_name(role_name)
            .send()
            .await
            .map_err(|e| classify("iam_role_policy_attachment", "ListAttachedRolePolicies", e))?;
        Ok(output.attached_policies().iter().filter_map(|p| p.policy_arn()).map(str::to_string).collect())
    }

    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<()> {
        self.iam
            .attach_role_policy()
            .role_name(role_name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(|e| classify("iam_role_policy_attachment", "AttachRolePolicy", e))?;
        Ok(())
    }

    async fn tag_resource(&self, target: &TagTarget, tags: &Tags) -> Result<()> {
        match target {
            TagTarget::Key(key_id) => {
                self.kms
                    .tag_resource()
                    .key_id(key_id)
                    .set_tags(Some(Self::kms_tags(tags)?))
                    .send()
                    .await
                    .map_err(|e| classify("kms_key", "TagResource", e))?;
            }
            TagTarget::Bucket(name) => {
                // Bucket tagging replaces the whole set, so merge with what is there.
                let mut merged: BTreeMap<String, String> = match self.s3.get_bucket_tagging().bucket(name).send().await {
                    Ok(output) => output.tag_set().iter().map(|t| (t.key().to_string(), t.value().to_string())).collect(),
                    Err(err) if err.code() == Some("NoSuchTagSet") => BTreeMap::new(),
                    Err(err) => return Err(classify("s3_bucket", "GetBucketTagging", err)),
                };
                merged.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
                let tag_set = merged
                    .iter()
                    .map(|(k, v)| aws_sdk_s3::types::Tag::builder().key(k).value(v).build().map_err(|e| build_error("s3_bucket", e)))
                    .collect::<Result<Vec<_>>>()?;
                let tagging = aws_sdk_s3::types::Tagging::builder()
                    .set_tag_set(Some(tag_set))
                    .build()
                    .map_err(|e| build_error("s3_bucket", e))?;
                self.s3
                    .put_bucket_tagging()
                    .bucket(name)
                    .tagging(tagging)
                    .send()
                    .await
                    .map_err(|e| classify("s3_bucket", "PutBucketTagging", e))?;
            }
            TagTarget::OidcProvider(arn) => {
                self.iam
                    .tag_open_id_connect_provider()
                    .open_id_connect_provider_arn(arn)
                    .set_tags(Some(Self::iam_tags(tags)?))
                    .send()
                    .await
                    .map_err(|e| classify("oidc_provider", "TagOpenIDConnectProvider", e))?;
            }
            TagTarget::Role(name) => {
                self.iam
                    .tag_role()
                    .role_name(name)
                    .set_tags(Some(Self::iam_tags(tags)?))
                    .send()
                    .await
                    .map_err(|e| classify("iam_role", "TagRole", e))?;
            }
            TagTarget::Policy(arn) => {
                self.iam
                    .tag_policy()
                    .policy_arn(arn)
                    .set_tags(Some(Self::iam_tags(tags)?))
                    .send()
                    .await
                    .map_err(|e| classify("iam_policy", "TagPolicy", e))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KeyDecryptor for AwsCloud {
    async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<SecretBytes> {
        let output = match self.kms.decrypt().key_id(key_id).ciphertext_blob(Blob::new(ciphertext.to_vec())).send().await {
            Ok(output) => output,
            Err(err) => {
                let invalid = matches!(
                    &err,
                    SdkError::ServiceError(e)
                        if e.err().is_invalid_ciphertext_exception() || e.err().is_incorrect_key_exception()
                );
                if invalid {
                    return Err(SealplaneError::unseal(format!("KMS rejected the unseal ciphertext: {:?}", err.code()), 0));
                }
                return Err(classify("kms_key", "Decrypt", err));
            }
        };
        let plaintext = output
            .plaintext()
            .ok_or_else(|| SealplaneError::unseal("KMS decrypt response contained no plaintext", 0))?;
        Ok(SecretBytes::new(plaintext.as_ref().to_vec()))
    }
}
