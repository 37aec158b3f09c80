//! Bridge configuration, read once from the environment.

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use crate::error::KubeletError;

pub const DEFAULT_KUBELET_PORT: u16 = 10250;
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;

/// Namespace of the virtual manager lease inside the virtual cluster
pub const VIRTUAL_LEASE_NAMESPACE: &str = "kube-system";

const HOST_METRICS_PORT: u16 = 8083;
const VIRTUAL_METRICS_PORT: u16 = 8084;

/// Immutable bridge settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeletConfig {
    pub cluster_name: String,
    /// Host namespace of the Cluster and of every shadow object
    pub cluster_namespace: String,
    /// Name of the virtual node
    pub agent_hostname: String,
    /// Host service fronting this bridge; its ClusterIP is the agent IP
    pub service_name: String,
    /// Join token for the bootstrap endpoint
    pub token: String,
    pub host_kubeconfig: Option<PathBuf>,
    /// Skips the bootstrap decode when set
    pub virtual_kubeconfig: Option<PathBuf>,
    pub server_ip: Option<String>,
    pub kubelet_port: u16,
    pub webhook_port: u16,
    /// Reported as the node's kubelet version
    pub version: String,
    /// Mirror host node capacity instead of the fixed figures
    pub mirror_host_nodes: bool,
    pub pod_ip: Option<IpAddr>,
    /// Name of the bridge pod, used as the leader election identity
    pub pod_name: Option<String>,
}

fn parse_port(key: &str, value: Option<String>, default: u16) -> Result<u16, KubeletError> {
    match value {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|e| KubeletError::InvalidConfig(format!("{key} {v} is not a port: {e}"))),
    }
}

impl KubeletConfig {
    pub fn from_env() -> Result<Self, KubeletError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, KubeletError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let required = |key: &str| {
            non_empty(key).ok_or_else(|| KubeletError::InvalidConfig(format!("{key} must be set")))
        };

        let mirror_host_nodes = match non_empty("MIRROR_HOST_NODES") {
            None => false,
            Some(v) => v.parse::<bool>().map_err(|_| {
                KubeletError::InvalidConfig(format!("MIRROR_HOST_NODES must be true or false, got {v}"))
            })?,
        };

        let pod_ip = match non_empty("POD_IP") {
            None => None,
            Some(v) => Some(v.parse().map_err(|e| {
                KubeletError::InvalidConfig(format!("POD_IP {v} is not an IP address: {e}"))
            })?),
        };

        Ok(Self {
            cluster_name: required("CLUSTER_NAME")?,
            cluster_namespace: required("CLUSTER_NAMESPACE")?,
            agent_hostname: required("AGENT_HOSTNAME")?,
            service_name: required("SERVICE_NAME")?,
            token: required("TOKEN")?,
            host_kubeconfig: non_empty("HOST_KUBECONFIG").map(PathBuf::from),
            virtual_kubeconfig: non_empty("VIRT_KUBECONFIG").map(PathBuf::from),
            server_ip: non_empty("SERVER_IP"),
            kubelet_port: parse_port("KUBELET_PORT", non_empty("KUBELET_PORT"), DEFAULT_KUBELET_PORT)?,
            webhook_port: parse_port("WEBHOOK_PORT", non_empty("WEBHOOK_PORT"), DEFAULT_WEBHOOK_PORT)?,
            version: non_empty("VERSION").unwrap_or_default(),
            mirror_host_nodes,
            pod_ip,
            pod_name: non_empty("POD_NAME").or_else(|| non_empty("HOSTNAME")),
        })
    }

    /// Name of the virtual node, which is also the kubelet certificate CN
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.agent_hostname
    }

    /// Holder identity written to both leader leases
    #[must_use]
    pub fn identity(&self) -> &str {
        self.pod_name.as_deref().unwrap_or(&self.agent_hostname)
    }

    /// Metrics listener of the host manager, `None` when mirroring host nodes
    #[must_use]
    pub fn host_metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr(HOST_METRICS_PORT)
    }

    /// Metrics listener of the virtual manager, `None` when mirroring host nodes
    #[must_use]
    pub fn virtual_metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr(VIRTUAL_METRICS_PORT)
    }

    fn metrics_addr(&self, port: u16) -> Option<SocketAddr> {
        (!self.mirror_host_nodes).then(|| SocketAddr::from(([0, 0, 0, 0], port)))
    }

    #[must_use]
    pub fn kubelet_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.kubelet_port))
    }

    #[must_use]
    pub fn webhook_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.webhook_port))
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> KubeletConfig {
    KubeletConfig {
        cluster_name: "demo".to_string(),
        cluster_namespace: "tenant".to_string(),
        agent_hostname: "k3k-demo-kubelet".to_string(),
        service_name: "k3k-demo-kubelet".to_string(),
        token: "secret-token".to_string(),
        host_kubeconfig: None,
        virtual_kubeconfig: None,
        server_ip: Some("10.43.0.10".to_string()),
        kubelet_port: DEFAULT_KUBELET_PORT,
        webhook_port: DEFAULT_WEBHOOK_PORT,
        version: "v1.30.2-k3s1".to_string(),
        mirror_host_nodes: false,
        pod_ip: Some(IpAddr::from([10, 42, 0, 7])),
        pod_name: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const REQUIRED: [(&str, &str); 5] = [
        ("CLUSTER_NAME", "demo"),
        ("CLUSTER_NAMESPACE", "tenant"),
        ("AGENT_HOSTNAME", "k3k-demo-kubelet"),
        ("SERVICE_NAME", "k3k-demo-kubelet"),
        ("TOKEN", "t0k3n"),
    ];

    fn lookup(extra: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = REQUIRED
            .iter()
            .chain(extra)
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = KubeletConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.cluster_name, "demo");
        assert_eq!(config.kubelet_port, 10250);
        assert_eq!(config.webhook_port, 9443);
        assert!(!config.mirror_host_nodes);
        assert!(config.virtual_kubeconfig.is_none());
        assert_eq!(config.host_metrics_addr().map(|a| a.port()), Some(8083));
        assert_eq!(config.virtual_metrics_addr().map(|a| a.port()), Some(8084));
        assert_eq!(config.identity(), "k3k-demo-kubelet");
    }

    #[test]
    fn test_identity_prefers_pod_name() {
        let config = KubeletConfig::from_lookup(lookup(&[("HOSTNAME", "k3k-demo-kubelet-7d9f")])).unwrap();
        assert_eq!(config.identity(), "k3k-demo-kubelet-7d9f");
        let config = KubeletConfig::from_lookup(lookup(&[("HOSTNAME", "node"), ("POD_NAME", "bridge-0")])).unwrap();
        assert_eq!(config.identity(), "bridge-0");
    }

    #[test]
    fn test_mirror_mode_disables_metrics() {
        let config = KubeletConfig::from_lookup(lookup(&[
            ("MIRROR_HOST_NODES", "true"),
            ("KUBELET_PORT", "11250"),
            ("POD_IP", "10.42.1.5"),
        ]))
        .unwrap();
        assert!(config.mirror_host_nodes);
        assert_eq!(config.kubelet_addr().port(), 11250);
        assert_eq!(config.pod_ip, Some(IpAddr::from([10, 42, 1, 5])));
        assert!(config.host_metrics_addr().is_none());
        assert!(config.virtual_metrics_addr().is_none());
    }

    #[test]
    fn test_missing_required_value() {
        let vars: HashMap<&str, &str> = REQUIRED.iter().copied().filter(|(k, _)| *k != "TOKEN").collect();
        let err = KubeletConfig::from_lookup(|key| vars.get(key).map(|v| (*v).to_string())).unwrap_err();
        assert!(matches!(err, KubeletError::InvalidConfig(ref m) if m.contains("TOKEN")));
    }

    #[test]
    fn test_bad_values_are_rejected() {
        assert!(KubeletConfig::from_lookup(lookup(&[("WEBHOOK_PORT", "99999")])).is_err());
        assert!(KubeletConfig::from_lookup(lookup(&[("POD_IP", "pod")])).is_err());
        assert!(KubeletConfig::from_lookup(lookup(&[("MIRROR_HOST_NODES", "yes")])).is_err());
    }
}
