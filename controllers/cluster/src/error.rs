//! Controller-specific error types.

use crds::ValidationError;
use host_client::ClientError;
use pki::PkiError;
use thiserror::Error;

/// Errors that can occur in the Cluster Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error outside the client seam (watches, client setup)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Host API call failed
    #[error("Host API error: {0}")]
    Client(#[from] ClientError),

    /// Certificate or bootstrap failure
    #[error("PKI error: {0}")]
    Pki(#[from] PkiError),

    /// Cluster spec or name rejected
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Object (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An object lacks a field the reconciler needs
    #[error("Missing field: {0}")]
    MissingField(String),

    /// The virtual control plane did not become reachable in time
    #[error("Cluster unavailable: {0}")]
    Unavailable(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Metric registration or the metrics listener failed
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// The leader lease was lost while running
    #[error("Leadership lost")]
    LeadershipLost,
}

impl From<prometheus::Error> for ControllerError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}

impl ControllerError {
    /// Whether requeueing can fix the error. Bad user input never heals on its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Validation(_) | Self::InvalidConfig(_) | Self::MissingField(_)
        )
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Client(e) if e.is_not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_is_not_retryable() {
        let err = ControllerError::from(ValidationError::InvalidName("system".to_string()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        let not_found = ControllerError::from(ClientError::NotFound {
            kind: "Secret".to_string(),
            name: "x".to_string(),
        });
        assert!(not_found.is_retryable());
        assert!(not_found.is_not_found());

        let conflict = ControllerError::from(ClientError::Conflict {
            kind: "Service".to_string(),
            name: "x".to_string(),
            message: "stale".to_string(),
        });
        assert!(conflict.is_retryable());
        assert!(!conflict.is_not_found());
    }
}
