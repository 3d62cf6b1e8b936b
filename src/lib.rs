//! # Sealplane
//!
//! Bootstraps KMS auto-unseal for a Vault cluster running on Kubernetes and
//! keeps it honest at runtime.
//!
//! ## Architecture
//!
//! ```text
//! BootstrapInputs → validation → Reconcile Engine → CloudProvider (memory | aws)
//!                                     ↓
//!                          state file + exclusive lock
//!
//! Unsealer → KeyDecryptor (KMS) → ReadinessGate → HealthChecker
//! SecretSyncBridge: SecretSource (Vault KV v2) → SecretSink (Kubernetes Secret)
//! ```
//!
//! ## Core Components
//!
//! - **Key Guardian**: the customer-managed unseal key, rotation on, scoped key policy
//! - **Encrypted Object Store**: private bucket, default encryption under the unseal key
//! - **Identity Federation Bridge**: OIDC provider plus a role assumable by exactly one service account
//! - **Policy Binder**: a two-statement grant over exactly the key and the bucket
//! - **Reconcile Engine**: desired → observed → minimal patch, in dependency order, with per-call timeouts
//! - **Unseal Gate**: KMS decrypt with bounded backoff; nothing is served while sealed
//! - **Secret Sync Bridge**: polls secret paths into platform secret objects

pub mod cli;
pub mod cloud;
pub mod config;
pub mod dev;
pub mod domain;
pub mod errors;
pub mod observability;
pub mod provisioning;
pub mod reconcile;
pub mod retry;
pub mod secrets;
pub mod state;
pub mod unseal;

pub use config::Settings;
pub use errors::{Result, SealplaneError};
pub use provisioning::BootstrapInputs;
pub use reconcile::{ApplyReport, Engine, Plan};
pub use state::Outputs;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
