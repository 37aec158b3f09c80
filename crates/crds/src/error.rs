//! Validation errors for Cluster resources.

use thiserror::Error;

/// Reasons a Cluster spec or name is rejected. Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The name is reserved
    #[error("invalid cluster name: {0}")]
    InvalidName(String),

    /// A replica count is out of range
    #[error("invalid {field} count: {value}")]
    Replicas {
        /// Offending field
        field: &'static str,
        /// Offending value
        value: i32,
    },

    /// The storage size is not a quantity
    #[error("invalid storage request size: {0}")]
    StorageSize(String),
}
