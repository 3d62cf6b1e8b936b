//! # Secrets
//!
//! Secret handling for sealplane: redacting wrapper types for key material
//! and tokens, and the Secret Sync Bridge that mirrors secret store paths into
//! platform-native secret objects.
//!
//! Paths follow `secret/data/<prefix>/<service>/<key>` ([`SecretPath`]). A
//! [`SecretSource`] reads them, a [`SecretSink`] materializes them, and
//! [`SecretSyncBridge`] polls between the two.

pub mod error;
pub mod path;
pub mod sink;
pub mod source;
pub mod sync;
pub mod types;

pub use error::{Result, SecretsError};
pub use path::SecretPath;
pub use sink::{ManifestSecretSink, MemorySecretSink, PathStatus, SecretObject, SecretSink, SyncCondition};
pub use source::{MemorySecretSource, SecretData, SecretSource, VaultSecretSource, VaultSourceConfig};
pub use sync::{SecretSyncBridge, SyncReport};
pub use types::{SecretBytes, SecretString};
