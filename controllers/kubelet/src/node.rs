//! The virtual node standing in for the host inside the virtual cluster.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use host_client::ClusterClient;
use host_client::time::{micro_time, time};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{
    DaemonEndpoint, Node, NodeAddress, NodeCondition, NodeDaemonEndpoints, NodeSpec, NodeStatus, NodeSystemInfo,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::config::KubeletConfig;
use crate::error::KubeletError;

/// Namespace of the per-node heartbeat leases
pub const NODE_LEASE_NAMESPACE: &str = "kube-node-lease";

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long startup waits for the node to report ready
pub const READY_TIMEOUT: Duration = Duration::from_secs(60);

const READY_POLL: Duration = Duration::from_secs(2);
const NODE_LEASE_SECONDS: i32 = 40;

const FIXED_CPU: &str = "8";
const FIXED_MEMORY: &str = "32Gi";
const FIXED_PODS: &str = "110";

/// Capacity advertised when host nodes are not mirrored
#[must_use]
pub fn fixed_capacity() -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(FIXED_CPU.to_string())),
        ("memory".to_string(), Quantity(FIXED_MEMORY.to_string())),
        ("pods".to_string(), Quantity(FIXED_PODS.to_string())),
    ])
}

/// Quantity in thousandths of its base unit ("500m" is 500, "1Ki" is 1024000)
#[must_use]
pub fn parse_milli(quantity: &str) -> Option<i128> {
    let quantity = quantity.trim();
    if let Some(stripped) = quantity.strip_suffix('m') {
        return stripped.parse::<i128>().ok();
    }
    let suffixes: [(&str, i128); 12] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("Pi", 1 << 50),
        ("Ei", 1 << 60),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("P", 1_000_000_000_000_000),
        ("E", 1_000_000_000_000_000_000),
    ];
    let (number, multiplier) = suffixes
        .iter()
        .find_map(|(suffix, m)| quantity.strip_suffix(suffix).map(|n| (n, *m)))
        .unwrap_or((quantity, 1));

    if let Ok(whole) = number.parse::<i128>() {
        return whole.checked_mul(multiplier)?.checked_mul(1000);
    }
    // Fractional values such as "0.5" or "1.5Gi"
    let value = number.parse::<f64>().ok()?;
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    Some((value * multiplier as f64 * 1000.0).round() as i128)
}

/// Inverse of [`parse_milli`], in the plainest unit that is exact
#[must_use]
pub fn format_milli(milli: i128) -> Quantity {
    if milli % 1000 == 0 {
        Quantity((milli / 1000).to_string())
    } else {
        Quantity(format!("{milli}m"))
    }
}

/// Per-resource sum over a set of resource lists; unparseable entries are skipped
#[must_use]
pub fn sum_resources<'a>(lists: impl IntoIterator<Item = &'a BTreeMap<String, Quantity>>) -> BTreeMap<String, Quantity> {
    let mut totals: BTreeMap<String, i128> = BTreeMap::new();
    for list in lists {
        for (name, quantity) in list {
            match parse_milli(&quantity.0) {
                Some(value) => *totals.entry(name.clone()).or_default() += value,
                None => debug!(resource = %name, quantity = %quantity.0, "Skipping unparseable quantity"),
            }
        }
    }
    totals.into_iter().map(|(name, total)| (name, format_milli(total))).collect()
}

/// Ready plus the three pressure conditions, all stamped with `now`
pub fn node_conditions(now: DateTime<Utc>) -> Result<Vec<NodeCondition>, KubeletError> {
    let stamp = time(now)?;
    let condition = |type_: &str, status: &str, reason: &str, message: &str| NodeCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_heartbeat_time: Some(stamp.clone()),
        last_transition_time: Some(stamp.clone()),
    };
    Ok(vec![
        condition("Ready", "True", "KubeletReady", "kubelet is ready."),
        condition("MemoryPressure", "False", "KubeletHasSufficientMemory", "kubelet has sufficient memory available"),
        condition("DiskPressure", "False", "KubeletHasNoDiskPressure", "kubelet has no disk pressure"),
        condition("PIDPressure", "False", "KubeletHasSufficientPID", "kubelet has sufficient PID available"),
    ])
}

/// Conditions for a heartbeat at `now`. A condition whose status did not
/// change keeps its previous transition time.
pub fn refreshed_conditions(previous: &[NodeCondition], now: DateTime<Utc>) -> Result<Vec<NodeCondition>, KubeletError> {
    let mut conditions = node_conditions(now)?;
    for condition in &mut conditions {
        let unchanged = previous
            .iter()
            .find(|p| p.type_ == condition.type_ && p.status == condition.status)
            .and_then(|p| p.last_transition_time.clone());
        if unchanged.is_some() {
            condition.last_transition_time = unchanged;
        }
    }
    Ok(conditions)
}

fn node_labels(config: &KubeletConfig) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("kubernetes.io/role".to_string(), "agent".to_string()),
        ("kubernetes.io/os".to_string(), "linux".to_string()),
        ("kubernetes.io/hostname".to_string(), config.agent_hostname.clone()),
        (
            "node.kubernetes.io/exclude-from-external-load-balancers".to_string(),
            "true".to_string(),
        ),
    ])
}

/// Node object for the virtual cluster.
///
/// With `host_nodes` the capacity and allocatable are the sums over those
/// nodes and the system info of the first one is reused. Otherwise a fixed
/// capacity is advertised.
pub fn build_node(
    config: &KubeletConfig,
    agent_ip: &str,
    host_nodes: Option<&[Node]>,
    now: DateTime<Utc>,
) -> Result<Node, KubeletError> {
    let (capacity, allocatable, node_info) = match host_nodes {
        Some(nodes) => {
            let statuses: Vec<&NodeStatus> = nodes.iter().filter_map(|n| n.status.as_ref()).collect();
            let capacity = sum_resources(statuses.iter().filter_map(|s| s.capacity.as_ref()));
            let allocatable = sum_resources(statuses.iter().filter_map(|s| s.allocatable.as_ref()));
            let node_info = statuses.iter().find_map(|s| s.node_info.clone()).unwrap_or_default();
            (capacity, allocatable, node_info)
        }
        None => (
            fixed_capacity(),
            fixed_capacity(),
            NodeSystemInfo {
                operating_system: "linux".to_string(),
                architecture: std::env::consts::ARCH.to_string(),
                ..Default::default()
            },
        ),
    };

    Ok(Node {
        metadata: ObjectMeta {
            name: Some(config.node_name().to_string()),
            labels: Some(node_labels(config)),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            taints: None,
            ..Default::default()
        }),
        status: Some(NodeStatus {
            addresses: Some(vec![
                NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: agent_ip.to_string(),
                },
                NodeAddress {
                    type_: "Hostname".to_string(),
                    address: config.agent_hostname.clone(),
                },
            ]),
            daemon_endpoints: Some(NodeDaemonEndpoints {
                kubelet_endpoint: Some(DaemonEndpoint {
                    port: i32::from(config.kubelet_port),
                }),
            }),
            capacity: Some(capacity),
            allocatable: Some(allocatable),
            conditions: Some(node_conditions(now)?),
            node_info: Some(NodeSystemInfo {
                kubelet_version: config.version.clone(),
                ..node_info
            }),
            ..Default::default()
        }),
    })
}

#[must_use]
pub fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

/// Create or replace the node object, then publish its status
#[instrument(skip_all, fields(node = %node.metadata.name.as_deref().unwrap_or_default()))]
pub async fn register<V: ClusterClient>(virt: &V, node: &Node) -> Result<(), KubeletError> {
    let name = node.metadata.name.clone().unwrap_or_default();
    match virt.get_global::<Node>(&name).await? {
        None => {
            info!("Registering node");
            virt.create_global(node).await?;
        }
        Some(existing) => {
            info!("Node exists, replacing it");
            let mut desired = node.clone();
            desired.metadata.resource_version = existing.metadata.resource_version;
            virt.replace_global(&desired).await?;
        }
    }
    // The API server drops status on create and replace
    let status = json!({ "status": node.status });
    virt.merge_patch_global_status::<Node>(&name, &status).await?;
    Ok(())
}

/// Refresh the heartbeat of every node condition
pub async fn heartbeat<V: ClusterClient>(virt: &V, node_name: &str, now: DateTime<Utc>) -> Result<(), KubeletError> {
    let previous = virt
        .get_global::<Node>(node_name)
        .await?
        .and_then(|node| node.status)
        .and_then(|status| status.conditions)
        .unwrap_or_default();
    let patch = json!({ "status": { "conditions": refreshed_conditions(&previous, now)? } });
    virt.merge_patch_global_status::<Node>(node_name, &patch).await?;
    Ok(())
}

/// Create or renew the node lease in `kube-node-lease`
pub async fn renew_node_lease<V: ClusterClient>(virt: &V, node_name: &str, now: DateTime<Utc>) -> Result<(), KubeletError> {
    let renew_time = micro_time(now)?;
    if virt.get::<Lease>(NODE_LEASE_NAMESPACE, node_name).await?.is_some() {
        let patch = json!({ "spec": { "renewTime": renew_time, "holderIdentity": node_name } });
        virt.merge_patch::<Lease>(NODE_LEASE_NAMESPACE, node_name, &patch).await?;
        return Ok(());
    }
    let lease = Lease {
        metadata: ObjectMeta {
            name: Some(node_name.to_string()),
            namespace: Some(NODE_LEASE_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(node_name.to_string()),
            lease_duration_seconds: Some(NODE_LEASE_SECONDS),
            renew_time: Some(renew_time),
            ..Default::default()
        }),
    };
    virt.create(NODE_LEASE_NAMESPACE, &lease).await?;
    Ok(())
}

/// Poll until the node reports Ready, failing after `timeout`
pub async fn wait_ready<V: ClusterClient>(virt: &V, node_name: &str, timeout: Duration) -> Result<(), KubeletError> {
    let poll = async {
        loop {
            match virt.get_global::<Node>(node_name).await {
                Ok(Some(node)) if is_ready(&node) => return,
                Ok(_) => debug!(node = %node_name, "Node not ready yet"),
                Err(e) => warn!(node = %node_name, error = %e, "Failed to read node"),
            }
            tokio::time::sleep(READY_POLL.min(timeout)).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| KubeletError::NodeNotReady(node_name.to_string(), timeout))
}

/// Heartbeat loop; returns only when a heartbeat fails
pub async fn run_heartbeat<V: ClusterClient>(virt: &V, node_name: &str) -> Result<(), KubeletError> {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        ticker.tick().await;
        let now = Utc::now();
        heartbeat(virt, node_name, now).await?;
        renew_node_lease(virt, node_name, now).await?;
        debug!(node = %node_name, "Heartbeat sent");
    }
}
