//! PKI for virtual clusters
//!
//! CA generation, leaf issuance, join-token bootstrap and kubeconfig documents
//! shared by the cluster controller, the kubelet bridge and the CLI.

pub mod bootstrap;
pub mod ca;
pub mod error;
pub mod kubeconfig;
pub mod retry;

use std::time::Duration;

pub use bootstrap::{BootstrapData, BootstrapDecoder, HttpBootstrapDecoder};
#[cfg(any(test, feature = "test-util"))]
pub use bootstrap::MockBootstrapDecoder;
pub use ca::{CertificateAuthority, CertificateInfo, KeyUsage, issue_leaf_cert};
pub use error::{PkiError, Result};
pub use kubeconfig::KubeconfigDocument;
pub use retry::{RetryConfig, retry_with_backoff, retry_with_backoff_if};

/// Common name of the cluster admin identity
pub const ADMIN_COMMON_NAME: &str = "system:admin";

/// Group granting cluster-admin through the default RBAC bindings
pub const SYSTEM_PRIVILEGED_GROUP: &str = "system:masters";

/// Default lifetime of generated kubeconfig client certificates, in days
pub const DEFAULT_KUBECONFIG_EXPIRY_DAYS: u64 = 356;

/// `n` days as a duration
#[must_use]
pub fn days(n: u64) -> Duration {
    Duration::from_secs(n * 24 * 60 * 60)
}
