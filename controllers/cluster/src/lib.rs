//! k3k Cluster Controller
//!
//! Reconciles `Cluster` resources into k3s control planes running on the
//! host cluster:
//! - a bootstrap Secret holding the join token and cluster CAs, created once
//! - server StatefulSet, headless and exposed Services, NetworkPolicy and PVCs
//! - the kubelet bridge (shared mode) or k3s agents (virtual mode)
//!
//! Deletion and kubeconfig generation are exposed for the CLI.

pub mod backoff;
pub mod config;
pub mod controller;
pub mod delete;
pub mod error;
pub mod exposure;
pub mod kubeconfig;
pub mod metrics;
pub mod ownership;
pub mod reconcile_helpers;
pub mod reconciler;
pub mod resources;

#[cfg(test)]
mod delete_test;
#[cfg(test)]
mod reconcile_helpers_test;
#[cfg(test)]
mod test_utils;

pub use config::ControllerConfig;
pub use controller::Controller;
pub use delete::delete_cluster;
pub use error::ControllerError;
pub use kubeconfig::{CredentialsRequest, extract_credentials};
pub use reconciler::ClusterReconciler;
