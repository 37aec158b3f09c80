//! Controller configuration, read once from the environment.

use std::env;
use std::net::SocketAddr;

use crate::error::ControllerError;

/// Namespace holding the controller lease when `POD_NAMESPACE` is unset
pub const DEFAULT_POD_NAMESPACE: &str = "k3k-system";

/// Name of the controller leader lease
pub const LEADER_LEASE_NAME: &str = "k3k-controller";

pub const DEFAULT_K3S_IMAGE: &str = "rancher/k3s";
pub const DEFAULT_KUBELET_IMAGE: &str = "rancher/k3k-kubelet:latest";

/// Immutable controller settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Restrict the watch to one namespace; all namespaces when `None`
    pub watch_namespace: Option<String>,
    /// Namespace of the leader lease
    pub pod_namespace: String,
    /// Identity used in the leader lease
    pub pod_name: String,
    pub leader_election: bool,
    /// k3s image repository, tagged per cluster
    pub k3s_image: String,
    /// Image of the kubelet bridge deployed for shared-mode clusters
    pub kubelet_image: String,
    pub metrics_addr: SocketAddr,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            pod_namespace: DEFAULT_POD_NAMESPACE.to_string(),
            pod_name: "cluster-controller".to_string(),
            leader_election: true,
            k3s_image: DEFAULT_K3S_IMAGE.to_string(),
            kubelet_image: DEFAULT_KUBELET_IMAGE.to_string(),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let leader_election = match non_empty("LEADER_ELECTION") {
            None => defaults.leader_election,
            Some(v) => v.parse::<bool>().map_err(|_| {
                ControllerError::InvalidConfig(format!("LEADER_ELECTION must be true or false, got {v}"))
            })?,
        };

        let metrics_addr = match non_empty("METRICS_ADDR") {
            None => defaults.metrics_addr,
            Some(v) => v.parse().map_err(|e| {
                ControllerError::InvalidConfig(format!("METRICS_ADDR {v} is not a socket address: {e}"))
            })?,
        };

        Ok(Self {
            watch_namespace: non_empty("WATCH_NAMESPACE"),
            pod_namespace: non_empty("POD_NAMESPACE").unwrap_or(defaults.pod_namespace),
            pod_name: non_empty("POD_NAME")
                .or_else(|| non_empty("HOSTNAME"))
                .unwrap_or_else(|| format!("cluster-controller-{}", uuid::Uuid::new_v4())),
            leader_election,
            k3s_image: non_empty("K3S_IMAGE").unwrap_or(defaults.k3s_image),
            kubelet_image: non_empty("KUBELET_IMAGE").unwrap_or(defaults.kubelet_image),
            metrics_addr,
        })
    }
}
