//! Error types for azsecrets operations.

use thiserror::Error;

/// Result type alias using [`AzSecretsError`].
pub type Result<T> = std::result::Result<T, AzSecretsError>;

/// Errors that can occur while configuring the engine, issuing credentials
/// or rotating the root credential.
///
/// All errors implement `std::error::Error` and can be chained with `source()`.
#[derive(Debug, Error)]
pub enum AzSecretsError {
    /// Malformed input, mutually-exclusive fields, unknown environment or
    /// missing identifiers for the selected authentication mode.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Referenced role does not exist.
    #[error("role not found: {0}")]
    RoleNotFound(String),

    /// Remote cloud object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Lease has reached its maximum TTL and cannot be extended.
    #[error("lease expired: {0}")]
    LeaseExpired(String),

    /// Cloud control-plane call failed (network, auth, throttling).
    #[error("upstream unavailable: {operation}: {reason}")]
    UpstreamUnavailable {
        /// Control-plane operation that failed
        operation: String,
        /// Underlying failure
        reason: String,
    },

    /// Operation aborted by cancellation or deadline.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Storage collaborator failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error (catch-all).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AzSecretsError {
    /// Creates an upstream failure with the control-plane operation name.
    ///
    /// # Example
    ///
    /// ```
    /// use azsecrets::AzSecretsError;
    ///
    /// let err = AzSecretsError::upstream("create application", "429 Too Many Requests");
    /// assert_eq!(
    ///     err.to_string(),
    ///     "upstream unavailable: create application: 429 Too Many Requests"
    /// );
    /// assert!(err.is_retryable());
    /// ```
    pub fn upstream(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::UpstreamUnavailable {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for [`AzSecretsError::InvalidConfiguration`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Returns true when the caller (typically the lease manager) may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable { .. } | Self::Cancelled(_))
    }

    /// Returns true for errors caused by the request itself rather than by
    /// the engine or its collaborators. These are reported inside the
    /// response instead of failing the request.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfiguration(_) | Self::RoleNotFound(_) | Self::LeaseExpired(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AzSecretsError::RoleNotFound("web".to_string());
        assert_eq!(err.to_string(), "role not found: web");
    }

    #[test]
    fn test_upstream_error() {
        let err = AzSecretsError::upstream("add password", "connection reset");
        let msg = err.to_string();
        assert!(msg.contains("add password"));
        assert!(msg.contains("connection reset"));
        assert!(err.is_retryable());
        assert!(!err.is_user_error());
    }

    #[test]
    fn test_classification() {
        assert!(AzSecretsError::Cancelled("deadline".into()).is_retryable());
        assert!(!AzSecretsError::invalid("bad").is_retryable());
        assert!(AzSecretsError::invalid("bad").is_user_error());
        assert!(AzSecretsError::LeaseExpired("x".into()).is_user_error());
        assert!(!AzSecretsError::NotFound("x".into()).is_user_error());
    }

    #[test]
    fn test_json_conversion() {
        let err: AzSecretsError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, AzSecretsError::Json(_)));
    }
}
