//! Bridge error types.

use host_client::ClientError;
use pki::PkiError;
use thiserror::Error;

use crate::syncer::SyncError;

/// Errors that end a bridge task
#[derive(Debug, Error)]
pub enum KubeletError {
    /// Kubernetes API error outside the client seam (watches, client setup)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Host or virtual API call failed
    #[error("API error: {0}")]
    Client(#[from] ClientError),

    /// Certificate or bootstrap failure
    #[error("PKI error: {0}")]
    Pki(#[from] PkiError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Kubeconfig could not be loaded
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A host object the bridge depends on is missing or incomplete
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// TLS listener setup or serving failed
    #[error("Server error: {0}")]
    Server(String),

    /// Metric registration or the metrics listener failed
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// The virtual node did not report ready in time
    #[error("Node {0} not ready after {1:?}")]
    NodeNotReady(String, std::time::Duration),

    /// The leader lease was lost while running
    #[error("Leadership lost for {0}")]
    LeadershipLost(String),

    /// A supervised task exited
    #[error("Task {0} stopped: {1}")]
    TaskStopped(String, String),
}

impl From<prometheus::Error> for KubeletError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}

impl From<kube::config::KubeconfigError> for KubeletError {
    fn from(err: kube::config::KubeconfigError) -> Self {
        Self::Kubeconfig(err.to_string())
    }
}

impl From<kube::config::InferConfigError> for KubeletError {
    fn from(err: kube::config::InferConfigError) -> Self {
        Self::Kubeconfig(err.to_string())
    }
}
