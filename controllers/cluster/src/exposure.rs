//! Service and NetworkPolicy shapes derived from a cluster's exposure settings.
//!
//! Everything here is pure: no API calls, no owner references. The reconciler
//! stamps ownership before writing.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use crds::Exposure;
use crds::names::{self, SERVER_ROLE};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::warn;

pub const SERVER_PORT_NAME: &str = "k3s-server-port";
pub const ETCD_PORT_NAME: &str = "k3s-etcd-port";

/// Service port of the API server
pub const SERVER_PORT: i32 = 443;
/// Container port of the API server
pub const SERVER_TARGET_PORT: i32 = 6443;
pub const ETCD_PORT: i32 = 2379;

/// Node ports accepted by the API server's default range
pub const NODE_PORT_RANGE: RangeInclusive<i32> = 30000..=32767;

fn port(name: &str, port: i32, target: i32, node_port: Option<i32>) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        port,
        target_port: Some(IntOrString::Int(target)),
        node_port,
        ..Default::default()
    }
}

/// Explicit node port, `Ok(None)` for auto-assignment, `Err` when out of range
fn node_port(requested: Option<i32>) -> Result<Option<i32>, i32> {
    match requested {
        None => Ok(None),
        Some(p) if NODE_PORT_RANGE.contains(&p) => Ok(Some(p)),
        Some(p) => Err(p),
    }
}

#[must_use]
pub fn service_type(exposure: &Exposure) -> &'static str {
    match exposure {
        Exposure::ClusterIP => "ClusterIP",
        Exposure::NodePort(_) => "NodePort",
        Exposure::LoadBalancer(_) => "LoadBalancer",
    }
}

/// Ports of the server service, server port first.
///
/// A node port outside [`NODE_PORT_RANGE`] drops only that port.
#[must_use]
pub fn service_ports(exposure: &Exposure) -> Vec<ServicePort> {
    match exposure {
        Exposure::ClusterIP => vec![
            port(SERVER_PORT_NAME, SERVER_PORT, SERVER_TARGET_PORT, None),
            port(ETCD_PORT_NAME, ETCD_PORT, ETCD_PORT, None),
        ],
        Exposure::NodePort(config) => {
            let requested = [
                (SERVER_PORT_NAME, SERVER_PORT, SERVER_TARGET_PORT, config.server_port),
                (ETCD_PORT_NAME, ETCD_PORT, ETCD_PORT, config.etcd_port),
            ];
            requested
                .into_iter()
                .filter_map(|(name, service_port, target, requested)| {
                    match node_port(requested) {
                        Ok(np) => Some(port(name, service_port, target, np)),
                        Err(bad) => {
                            warn!(
                                port = name,
                                node_port = bad,
                                "Node port outside 30000-32767, omitting it from the service"
                            );
                            None
                        }
                    }
                })
                .collect()
        }
        Exposure::LoadBalancer(config) => vec![
            port(
                SERVER_PORT_NAME,
                config.server_port.unwrap_or(SERVER_PORT),
                SERVER_TARGET_PORT,
                None,
            ),
            port(
                ETCD_PORT_NAME,
                config.etcd_port.unwrap_or(ETCD_PORT),
                ETCD_PORT,
                None,
            ),
        ],
    }
}

/// Server service `k3k-<cluster>-service`
#[must_use]
pub fn server_service(cluster: &str, namespace: &str, exposure: &Exposure) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(names::service_name(cluster)),
            namespace: Some(namespace.to_string()),
            labels: Some(names::cluster_labels(cluster)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(service_type(exposure).to_string()),
            selector: Some(names::role_labels(cluster, SERVER_ROLE)),
            ports: Some(service_ports(exposure)),
            ..Default::default()
        }),
        status: None,
    }
}

/// Port the API is reachable on from outside the host cluster.
///
/// For NodePort this is the node port the platform actually assigned, read
/// from the live service.
#[must_use]
pub fn external_server_port(exposure: &Exposure, live: Option<&Service>) -> Option<i32> {
    match exposure {
        Exposure::ClusterIP => Some(SERVER_PORT),
        Exposure::LoadBalancer(config) => Some(config.server_port.unwrap_or(SERVER_PORT)),
        Exposure::NodePort(_) => live
            .and_then(|svc| svc.spec.as_ref())
            .and_then(|spec| spec.ports.as_ref())
            .and_then(|ports| {
                ports
                    .iter()
                    .find(|p| p.name.as_deref() == Some(SERVER_PORT_NAME))
            })
            .and_then(|p| p.node_port),
    }
}

fn namespace_peer(namespace: &str) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        namespace_selector: Some(LabelSelector {
            match_labels: Some(BTreeMap::from([(
                "kubernetes.io/metadata.name".to_string(),
                namespace.to_string(),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Policy `k3k-<cluster>`: any ingress, egress to the own namespace, cluster DNS
/// and the outside world.
#[must_use]
pub fn network_policy(cluster: &str, namespace: &str) -> NetworkPolicy {
    let dns = NetworkPolicyPeer {
        pod_selector: Some(LabelSelector {
            match_labels: Some(BTreeMap::from([(
                "k8s-app".to_string(),
                "kube-dns".to_string(),
            )])),
            ..Default::default()
        }),
        ..namespace_peer("kube-system")
    };
    let internet = NetworkPolicyPeer {
        ip_block: Some(IPBlock {
            cidr: "0.0.0.0/0".to_string(),
            except: None,
        }),
        ..Default::default()
    };

    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(names::network_policy_name(cluster)),
            namespace: Some(namespace.to_string()),
            labels: Some(names::cluster_labels(cluster)),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: Some(LabelSelector {
                match_labels: Some(names::cluster_labels(cluster)),
                ..Default::default()
            }),
            policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule::default()]),
            egress: Some(vec![NetworkPolicyEgressRule {
                to: Some(vec![namespace_peer(namespace), dns, internet]),
                ports: None,
            }]),
        }),
    }
}
