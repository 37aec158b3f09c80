//! Kubernetes API client layer
//!
//! A typed seam over the kube client used by the cluster controller and the
//! kubelet bridge for both host and virtual clusters, plus Lease-based leader
//! election.
//!
//! # Features
//!
//! - **test-util**: in-memory [`MockClusterClient`] with write recording

pub mod client;
pub mod diff;
pub mod error;
pub mod lease;
pub mod time;
#[path = "trait.rs"]
pub mod client_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::KubeClusterClient;
pub use client_trait::{ClusterClient, ClusterScopedObject, NamespacedObject};
pub use error::ClientError;
pub use lease::{LeaderElector, LeaderGuard};
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockClusterClient;
