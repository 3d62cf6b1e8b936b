//! Encrypted Object Store: the private bucket that backs the secret store.

use tracing::{info, instrument};

use super::Provisioner;
use crate::cloud::{CreateBucketRequest, TagTarget};
use crate::domain::{arn, BucketHandle, KeyHandle, KNOWN_AFTER_APPLY};
use crate::errors::{Result, SealplaneError};
use crate::reconcile::{ChangeAction, Mode, ResourceAddress};

const ADDRESS: ResourceAddress = ResourceAddress::Bucket;

impl Provisioner<'_> {
    /// Create `name` as a private bucket encrypted with `key`, or converge an
    /// existing one. Blocking public access and default encryption are part
    /// of the create call itself, so no bucket is ever observable unblocked.
    #[instrument(skip(self, key), fields(bucket = %name))]
    pub async fn create_private_bucket(&mut self, name: &str, key: &KeyHandle) -> Result<BucketHandle> {
        if self.exec.mode() == Mode::Apply && key.arn == KNOWN_AFTER_APPLY {
            return Err(SealplaneError::internal("bucket encryption key is unresolved during apply"));
        }
        let provider = self.provider;

        let observed = self.exec.observe(ADDRESS, "describe_bucket", || provider.describe_bucket(name)).await?;

        match observed {
            None => {
                let request =
                    CreateBucketRequest { name: name.to_string(), key_arn: key.arn.clone(), tags: self.ctx.tags.clone() };
                let detail = format!("create private bucket {} encrypted with {}", name, key.alias);
                self.exec.mutate(ADDRESS, ChangeAction::Create, detail, || provider.create_bucket(&request)).await?;
                if self.exec.mode() == Mode::Apply {
                    info!("Created private bucket");
                }
            }
            Some(bucket) => {
                if !bucket.public_access_blocked {
                    self.exec
                        .mutate(ADDRESS, ChangeAction::Update, "block public access", || {
                            provider.put_public_access_block(name)
                        })
                        .await?;
                }
                if bucket.encryption_key_arn.as_deref() != Some(key.arn.as_str()) {
                    let detail = format!(
                        "encryption key {} -> {}",
                        bucket.encryption_key_arn.as_deref().unwrap_or("none"),
                        key.alias
                    );
                    self.exec
                        .mutate(ADDRESS, ChangeAction::Update, detail, || provider.put_bucket_encryption(name, &key.arn))
                        .await?;
                }
                self.converge_tags(ADDRESS, TagTarget::Bucket(name.to_string()), &bucket.tags).await?;
            }
        }

        Ok(BucketHandle { name: name.to_string(), arn: arn::bucket(name), encryption_key_arn: key.arn.clone() })
    }
}
