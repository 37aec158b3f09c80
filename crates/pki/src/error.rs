//! PKI errors

use thiserror::Error;

/// Errors raised while generating, issuing or fetching certificate material
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate generation or signing failed
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// PEM or DER input could not be parsed
    #[error("certificate parsing error: {0}")]
    Parse(String),

    /// A bootstrap field is missing or malformed
    #[error("invalid bootstrap data: {0}")]
    InvalidBootstrap(String),

    /// The bootstrap endpoint could not be reached or answered with an error
    #[error("bootstrap request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The bootstrap endpoint rejected the join token
    #[error("bootstrap endpoint returned {status}: {body}")]
    BootstrapStatus {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Kubeconfig serialization failed
    #[error("kubeconfig serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;
