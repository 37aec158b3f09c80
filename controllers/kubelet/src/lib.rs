//! k3k kubelet bridge
//!
//! Registers a virtual node in a shared-mode virtual cluster and runs its
//! pods as host pods in the cluster namespace:
//! - node registration, heartbeat and the kubelet HTTPS API
//! - Service, PersistentVolumeClaim and PriorityClass mirroring
//! - the pod admission mutator pinning pods to the node

pub mod bridge;
pub mod config;
pub mod credentials;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod node;
pub mod provider;
pub mod server;
pub mod supervisor;
pub mod syncer;
pub mod webhook;

pub use bridge::Bridge;
pub use config::KubeletConfig;
pub use error::KubeletError;
