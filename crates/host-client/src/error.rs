//! Client errors

use thiserror::Error;

/// Errors raised by [`crate::ClusterClient`] implementations
#[derive(Debug, Error)]
pub enum ClientError {
    /// The object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        kind: String,
        name: String,
    },

    /// The write raced with another writer or the object already exists
    #[error("conflict on {kind} {name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    /// Any other API server error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Object could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Object is missing fields the caller relies on
    #[error("Invalid object: {0}")]
    InvalidObject(String),
}

impl ClientError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Kube(kube::Error::Api(e)) => e.code == 409,
            _ => false,
        }
    }

    /// Maps 404 and 409 responses onto the typed variants
    pub(crate) fn from_kube(kind: &str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref e) if e.code == 404 => Self::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(ref e) if e.code == 409 => Self::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                message: e.message.clone(),
            },
            other => Self::Kube(other),
        }
    }
}
