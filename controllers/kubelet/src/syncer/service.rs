//! Service shadows.
//!
//! The shadow selects host pods of this cluster, so the virtual selector gets
//! the cluster label added. Addresses are allocated by the host.

use crds::names::CLUSTER_LABEL;
use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use kube::ResourceExt;
use serde_json::{Value, json};

use super::{Mirror, ShadowKey};

/// Virtual API server service, which is served by k3s itself
const KUBERNETES_SERVICE: (&str, &str) = ("default", "kubernetes");

/// `clusterIP` value of a headless service
const HEADLESS: &str = "None";

fn is_headless(spec: &ServiceSpec) -> bool {
    spec.cluster_ip.as_deref() == Some(HEADLESS)
}

fn keeps_node_ports(spec: &ServiceSpec) -> bool {
    matches!(spec.type_.as_deref(), Some("NodePort" | "LoadBalancer"))
}

fn shadow_spec(spec: &ServiceSpec, cluster: &str) -> ServiceSpec {
    let mut shadow = spec.clone();
    if is_headless(spec) {
        shadow.cluster_ip = Some(HEADLESS.to_string());
        shadow.cluster_ips = Some(vec![HEADLESS.to_string()]);
    } else {
        shadow.cluster_ip = None;
        shadow.cluster_ips = None;
    }
    shadow.health_check_node_port = None;

    if let Some(selector) = shadow.selector.as_mut().filter(|s| !s.is_empty()) {
        selector.insert(CLUSTER_LABEL.to_string(), cluster.to_string());
    }
    if !keeps_node_ports(spec) {
        for port in shadow.ports.iter_mut().flatten() {
            port.node_port = None;
        }
    }
    shadow
}

impl Mirror for Service {
    fn skip(&self) -> bool {
        self.namespace().as_deref() == Some(KUBERNETES_SERVICE.0) && self.name_any() == KUBERNETES_SERVICE.1
    }

    fn to_shadow(&self, key: &ShadowKey, host_namespace: &str) -> Self {
        Service {
            metadata: key.shadow_meta(Some(host_namespace), &self.metadata),
            spec: self.spec.as_ref().map(|spec| shadow_spec(spec, &key.cluster)),
            status: None,
        }
    }

    fn status_patch(shadow: &Self) -> Option<Value> {
        let load_balancer = shadow.status.as_ref()?.load_balancer.as_ref()?;
        Some(json!({ "status": { "loadBalancer": load_balancer } }))
    }
}
