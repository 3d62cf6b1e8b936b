//! Error types for the secret sync bridge.

use thiserror::Error;

/// Result type for secrets operations.
pub type Result<T> = std::result::Result<T, SecretsError>;

/// Errors that can occur while reading from the secret store or materializing
/// platform secret objects.
#[derive(Error, Debug)]
pub enum SecretsError {
    /// Secret not found in the backend.
    #[error("Secret not found: {key}")]
    NotFound { key: String },

    /// Failed to connect to the secrets backend.
    #[error("Backend connection failed: {message}")]
    ConnectionFailed { message: String },

    /// The secret store is sealed and refuses reads.
    #[error("Secret store is sealed")]
    Sealed,

    /// Authentication with the secrets backend failed.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// Invalid secret path format.
    #[error("Invalid secret path: {path} - {reason}")]
    InvalidPath { path: String, reason: String },

    /// Backend-specific error.
    #[error("Backend error: {message}")]
    BackendError { message: String },

    /// Failed to write a materialized secret object.
    #[error("Sink error for '{name}': {message}")]
    SinkError { name: String, message: String },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML rendering error.
    #[error("Manifest rendering error: {0}")]
    ManifestError(#[from] serde_yaml::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SecretsError {
    /// Create a not found error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed { message: message.into() }
    }

    /// Create an authentication failed error.
    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed { message: message.into() }
    }

    /// Create an invalid path error.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath { path: path.into(), reason: reason.into() }
    }

    /// Create a backend error.
    pub fn backend_error(message: impl Into<String>) -> Self {
        Self::BackendError { message: message.into() }
    }

    /// Create a sink error.
    pub fn sink_error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkError { name: name.into(), message: message.into() }
    }

    /// Create a config error.
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError { message: message.into() }
    }

    /// Transient failures the sync loop retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SecretsError::ConnectionFailed { .. }
                | SecretsError::Sealed
                | SecretsError::BackendError { .. }
                | SecretsError::IoError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let err = SecretsError::not_found("platform/billing/db-password");
        assert!(matches!(err, SecretsError::NotFound { .. }));
        assert_eq!(err.to_string(), "Secret not found: platform/billing/db-password");

        let err = SecretsError::invalid_path("secret/data/x", "too few segments");
        assert!(err.to_string().contains("too few segments"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SecretsError::connection_failed("refused").is_retryable());
        assert!(SecretsError::Sealed.is_retryable());
        assert!(!SecretsError::not_found("x").is_retryable());
        assert!(!SecretsError::authentication_failed("denied").is_retryable());
        assert!(!SecretsError::invalid_path("x", "y").is_retryable());
    }
}
