//! k3k CRD Definitions
//!
//! Kubernetes Custom Resource Definitions and shared naming rules for the
//! cluster controller, the kubelet bridge and the CLI.

pub mod cluster;
pub mod error;
pub mod names;

pub use cluster::*;
pub use error::ValidationError;
