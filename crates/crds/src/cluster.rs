//! Cluster CRD
//!
//! Declares a virtual cluster hosted inside the current (host) cluster.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::names::CLUSTER_INVALID_NAME;

/// Default size requested for each server volume.
pub const DEFAULT_STORAGE_REQUEST_SIZE: &str = "1G";

/// Default number of server replicas.
pub const DEFAULT_SERVERS: i32 = 1;

/// Default number of agent replicas.
pub const DEFAULT_AGENTS: i32 = 0;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "k3k.io",
    version = "v1alpha1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Servers","type":"integer","jsonPath":".spec.servers"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// How workloads of the virtual cluster run on the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ClusterMode>,

    /// Number of k3s server replicas (must be >= 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<i32>,

    /// Number of k3s agent replicas (virtual mode only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents: Option<i32>,

    /// k3s version pin, e.g. "v1.30.2-k3s1". Empty means "match the host".
    #[serde(default)]
    pub version: String,

    /// Storage for the server datastore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceConfig>,

    /// How the server API is exposed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose: Option<ExposeConfig>,

    /// Extra arguments for the k3s server process
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server_args: Vec<String>,

    /// Extra arguments for the k3s agent process
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_args: Vec<String>,

    /// Additional TLS SANs for the server certificate
    #[serde(default, rename = "tlsSANs", skip_serializing_if = "Vec::is_empty")]
    pub tls_sans: Vec<String>,

    /// Node selector applied to every host pod generated for this cluster
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Priority class applied to server and agent pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class: Option<String>,

    /// Pod CIDR of the virtual cluster
    #[serde(default, rename = "clusterCIDR", skip_serializing_if = "Option::is_none")]
    pub cluster_cidr: Option<String>,

    /// Service CIDR of the virtual cluster
    #[serde(default, rename = "serviceCIDR", skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// Virtual pods run as host pods through the kubelet bridge
    #[default]
    Shared,

    /// Virtual pods run on dedicated k3s agents
    Virtual,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceConfig {
    /// dynamic (PVC backed) or ephemeral (emptyDir)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub persistence_type: Option<PersistenceMode>,

    /// Storage class for dynamic volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Requested volume size, as a Kubernetes quantity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_request_size: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    #[default]
    Dynamic,
    Ephemeral,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExposeConfig {
    /// Plain in-cluster ClusterIP service (same as leaving expose unset)
    #[serde(default, rename = "clusterIP", skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<ClusterIPConfig>,

    /// NodePort service, optionally with explicit node ports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<NodePortConfig>,

    /// LoadBalancer service, optionally with explicit service ports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ClusterIPConfig {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePortConfig {
    /// Node port for the API server, in [30000, 32767]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<i32>,

    /// Node port for etcd, in [30000, 32767]
    #[serde(default, rename = "etcdPort", skip_serializing_if = "Option::is_none")]
    pub etcd_port: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerConfig {
    /// Service port for the API server (default 443)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<i32>,

    /// Service port for etcd (default 2379)
    #[serde(default, rename = "etcdPort", skip_serializing_if = "Option::is_none")]
    pub etcd_port: Option<i32>,
}

/// Exposure selected for a cluster after precedence is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exposure {
    ClusterIP,
    NodePort(NodePortConfig),
    LoadBalancer(LoadBalancerConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Level-triggered lifecycle phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Host API server version with the k3s suffix, e.g. "v1.30.2-k3s1"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_version: String,

    /// Explanation for the Failed phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterPhase {
    #[default]
    Unknown,
    Provisioning,
    Ready,
    Failed,
    Terminating,
}

impl ClusterSpec {
    /// Fills every unset defaulted field. Returns true if anything changed.
    pub fn apply_defaults(&mut self) -> bool {
        let mut changed = false;

        if self.mode.is_none() {
            self.mode = Some(ClusterMode::default());
            changed = true;
        }
        if self.servers.is_none() {
            self.servers = Some(DEFAULT_SERVERS);
            changed = true;
        }
        if self.agents.is_none() {
            self.agents = Some(DEFAULT_AGENTS);
            changed = true;
        }

        let persistence = self.persistence.get_or_insert_with(|| {
            changed = true;
            PersistenceConfig::default()
        });
        if persistence.persistence_type.is_none() {
            persistence.persistence_type = Some(PersistenceMode::default());
            changed = true;
        }
        if persistence.storage_request_size.is_none() {
            persistence.storage_request_size = Some(DEFAULT_STORAGE_REQUEST_SIZE.to_string());
            changed = true;
        }

        changed
    }

    /// Checks the invariants the reconciler relies on.
    pub fn validate(&self, name: &str) -> Result<(), ValidationError> {
        if name == CLUSTER_INVALID_NAME {
            return Err(ValidationError::InvalidName(name.to_string()));
        }
        if self.servers() < 1 {
            return Err(ValidationError::Replicas {
                field: "servers",
                value: self.servers(),
            });
        }
        if self.agents() < 0 {
            return Err(ValidationError::Replicas {
                field: "agents",
                value: self.agents(),
            });
        }
        let size = self.storage_request_size();
        if !is_valid_quantity(size) {
            return Err(ValidationError::StorageSize(size.to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn mode(&self) -> ClusterMode {
        self.mode.unwrap_or_default()
    }

    #[must_use]
    pub fn servers(&self) -> i32 {
        self.servers.unwrap_or(DEFAULT_SERVERS)
    }

    #[must_use]
    pub fn agents(&self) -> i32 {
        self.agents.unwrap_or(DEFAULT_AGENTS)
    }

    #[must_use]
    pub fn persistence_mode(&self) -> PersistenceMode {
        self.persistence
            .as_ref()
            .and_then(|p| p.persistence_type)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn storage_request_size(&self) -> &str {
        self.persistence
            .as_ref()
            .and_then(|p| p.storage_request_size.as_deref())
            .unwrap_or(DEFAULT_STORAGE_REQUEST_SIZE)
    }

    #[must_use]
    pub fn storage_class_name(&self) -> Option<&str> {
        self.persistence
            .as_ref()
            .and_then(|p| p.storage_class_name.as_deref())
    }

    /// Resolves the exposure kind. NodePort wins over LoadBalancer when both are set.
    #[must_use]
    pub fn exposure(&self) -> Exposure {
        match &self.expose {
            Some(ExposeConfig { node_port: Some(np), .. }) => Exposure::NodePort(np.clone()),
            Some(ExposeConfig { load_balancer: Some(lb), .. }) => {
                Exposure::LoadBalancer(lb.clone())
            }
            _ => Exposure::ClusterIP,
        }
    }
}

/// Accepts the plain and suffixed quantity forms used for storage sizes.
fn is_valid_quantity(value: &str) -> bool {
    const SUFFIXES: [&str; 13] = [
        "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "k", "M", "G", "T", "P", "E", "",
    ];
    SUFFIXES.iter().any(|suffix| {
        value
            .strip_suffix(suffix)
            .filter(|number| !number.is_empty())
            .is_some_and(|number| {
                number.chars().all(|c| c.is_ascii_digit() || c == '.')
                    && number.chars().filter(|c| *c == '.').count() <= 1
                    && !number.starts_with('.')
            })
    })
}

impl Cluster {
    /// Observed phase, Unknown when no status was written yet.
    #[must_use]
    pub fn phase(&self) -> ClusterPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Observed host version, empty until resolved.
    #[must_use]
    pub fn host_version(&self) -> &str {
        self.status.as_ref().map_or("", |s| s.host_version.as_str())
    }
}
