//! # Error Handling
//!
//! Error taxonomy for sealplane provisioning, reconciliation, runtime unseal and
//! secret synchronisation, built on `thiserror`.
//!
//! The provisioning variants map one-to-one onto the failure modes operators
//! act on: a [`SealplaneError::NameCollision`] needs operator input, a
//! [`SealplaneError::TrustConfiguration`] or [`SealplaneError::PolicyValidation`]
//! blocks the run before any cloud mutation, and a retryable
//! [`SealplaneError::Provisioning`] may be retried for idempotent calls only.

use crate::secrets::SecretsError;

/// Custom result type for sealplane operations
pub type Result<T> = std::result::Result<T, SealplaneError>;

/// Main error type for sealplane
#[derive(thiserror::Error, Debug)]
pub enum SealplaneError {
    /// The cloud API rejected a create/update call
    #[error("Provisioning error on {resource}: {message}")]
    Provisioning { resource: String, message: String, retryable: bool },

    /// A globally-unique name is already taken by someone else
    #[error("Name collision: {resource_type} '{name}' is already taken")]
    NameCollision { resource_type: String, name: String },

    /// Malformed issuer URL, thumbprint or workload identity
    #[error("Trust configuration error: {message}")]
    TrustConfiguration { message: String, field: Option<String> },

    /// A grant statement references an unexpected resource
    #[error("Policy validation error: {message}")]
    PolicyValidation { message: String },

    /// Runtime failure to decrypt unseal material
    #[error("Unseal error after {attempts} attempt(s): {message}")]
    Unseal { message: String, attempts: u32 },

    /// The state record is held by another convergence run
    #[error("State is locked by {holder} (lock id {lock_id})")]
    StateLocked { lock_id: String, holder: String },

    /// State file is unreadable or inconsistent
    #[error("State error: {context}")]
    State {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A bounded cloud call did not complete in time
    #[error("Operation timed out: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Input validation errors
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Secret source or sink failures
    #[error(transparent)]
    Secrets(#[from] SecretsError),

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SealplaneError {
    /// Create a provisioning error that must not be retried
    pub fn provisioning<R: Into<String>, M: Into<String>>(resource: R, message: M) -> Self {
        Self::Provisioning { resource: resource.into(), message: message.into(), retryable: false }
    }

    /// Create a provisioning error for a transient failure (throttling, 5xx)
    pub fn provisioning_retryable<R: Into<String>, M: Into<String>>(
        resource: R,
        message: M,
    ) -> Self {
        Self::Provisioning { resource: resource.into(), message: message.into(), retryable: true }
    }

    /// Create a name collision error
    pub fn name_collision<R: Into<String>, N: Into<String>>(resource_type: R, name: N) -> Self {
        Self::NameCollision { resource_type: resource_type.into(), name: name.into() }
    }

    /// Create a trust configuration error
    pub fn trust_configuration<S: Into<String>>(message: S) -> Self {
        Self::TrustConfiguration { message: message.into(), field: None }
    }

    /// Create a trust configuration error naming the offending input
    pub fn trust_configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::TrustConfiguration { message: message.into(), field: Some(field.into()) }
    }

    /// Create a policy validation error
    pub fn policy_validation<S: Into<String>>(message: S) -> Self {
        Self::PolicyValidation { message: message.into() }
    }

    /// Create an unseal error
    pub fn unseal<S: Into<String>>(message: S, attempts: u32) -> Self {
        Self::Unseal { message: message.into(), attempts }
    }

    /// Create a state error
    pub fn state<S: Into<String>>(context: S) -> Self {
        Self::State { context: context.into(), source: None }
    }

    /// Create a state error with source
    pub fn state_with_source<S: Into<String>>(
        context: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::State { context: context.into(), source: Some(source) }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), duration_ms }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create an I/O error with context
    pub fn io<S: Into<String>>(source: std::io::Error, context: S) -> Self {
        Self::Io { source, context: context.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            SealplaneError::Provisioning { retryable, .. } => *retryable,
            SealplaneError::Timeout { .. } => true,
            SealplaneError::Io { .. } => true,
            SealplaneError::Secrets(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether this error was raised by input validation, before any mutation
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            SealplaneError::TrustConfiguration { .. }
                | SealplaneError::PolicyValidation { .. }
                | SealplaneError::Validation { .. }
                | SealplaneError::Config { .. }
        )
    }

    /// Short label used for metrics and structured logs
    pub fn category(&self) -> &'static str {
        match self {
            SealplaneError::Provisioning { .. } => "provisioning",
            SealplaneError::NameCollision { .. } => "name_collision",
            SealplaneError::TrustConfiguration { .. } => "trust_configuration",
            SealplaneError::PolicyValidation { .. } => "policy_validation",
            SealplaneError::Unseal { .. } => "unseal",
            SealplaneError::StateLocked { .. } => "state_locked",
            SealplaneError::State { .. } => "state",
            SealplaneError::Timeout { .. } => "timeout",
            SealplaneError::Config { .. } => "config",
            SealplaneError::Validation { .. } => "validation",
            SealplaneError::Io { .. } => "io",
            SealplaneError::Serialization { .. } => "serialization",
            SealplaneError::Secrets(_) => "secrets",
            SealplaneError::Internal { .. } => "internal",
        }
    }
}

impl From<std::io::Error> for SealplaneError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<serde_json::Error> for SealplaneError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { source: error, context: "JSON serialization failed".to_string() }
    }
}

impl From<config::ConfigError> for SealplaneError {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("Configuration loading failed", Box::new(error))
    }
}

impl From<validator::ValidationErrors> for SealplaneError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string()))
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        Self::validation(format!("Validation failed: {}", message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = SealplaneError::config("Test configuration error");
        assert!(matches!(error, SealplaneError::Config { .. }));
        assert_eq!(error.to_string(), "Configuration error: Test configuration error");
    }

    #[test]
    fn test_trust_configuration_field() {
        let error = SealplaneError::trust_configuration_field("issuer is empty", "issuer_url");
        if let SealplaneError::TrustConfiguration { field, .. } = error {
            assert_eq!(field, Some("issuer_url".to_string()));
        } else {
            panic!("expected trust configuration error");
        }
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SealplaneError::timeout("create_key", 1000).is_retryable());
        assert!(SealplaneError::provisioning_retryable("kms_key.unseal", "throttled").is_retryable());
        assert!(!SealplaneError::provisioning("kms_key.unseal", "access denied").is_retryable());
        assert!(!SealplaneError::name_collision("bucket", "taken").is_retryable());
        assert!(!SealplaneError::policy_validation("wildcard").is_retryable());
    }

    #[test]
    fn test_validation_failures_block_apply() {
        assert!(SealplaneError::trust_configuration("bad issuer").is_validation_failure());
        assert!(SealplaneError::policy_validation("wildcard").is_validation_failure());
        assert!(!SealplaneError::provisioning("x", "y").is_validation_failure());
    }

    #[test]
    fn test_error_conversions() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: SealplaneError = io_error.into();
        assert!(matches!(error, SealplaneError::Io { .. }));

        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: SealplaneError = json_error.into();
        assert!(matches!(error, SealplaneError::Serialization { .. }));
        assert_eq!(error.category(), "serialization");
    }
}
