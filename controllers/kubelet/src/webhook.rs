//! Pod admission mutator of the virtual cluster.
//!
//! Every pod created in the virtual cluster is pinned to the bridge node and
//! pointed at the cluster DNS service before it is scheduled.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use host_client::ClusterClient;
use host_client::diff::is_subset;
use json_patch::{AddOperation, PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use k8s_openapi::ByteString;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, WebhookClientConfig,
};
use k8s_openapi::api::core::v1::{Pod, PodDNSConfig, PodDNSConfigOption};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use rustls::server::ServerConfig;
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use crate::error::KubeletError;

pub const MUTATE_PATH: &str = "/mutate--v1-pod";

/// Annotation naming the virtual cluster a pod was admitted into
pub const CLUSTER_ANNOTATION: &str = "k3k.io/cluster";

const CLUSTER_DOMAIN: &str = "cluster.local";
const NDOTS: &str = "5";

/// Facts the mutator stamps onto pods
#[derive(Debug, Clone)]
pub struct PodMutator {
    pub cluster: String,
    pub node_name: String,
    /// Host ClusterIP of the virtual cluster DNS service
    pub dns_ip: String,
}

fn add(tokens: &[&str], value: Value) -> PatchOperation {
    PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(tokens.iter().copied()),
        value,
    })
}

fn uses_cluster_dns(pod: &Pod) -> bool {
    matches!(
        pod.spec.as_ref().and_then(|s| s.dns_policy.as_deref()),
        None | Some("ClusterFirst")
    )
}

impl PodMutator {
    #[must_use]
    pub fn dns_config(&self, namespace: &str) -> PodDNSConfig {
        PodDNSConfig {
            nameservers: Some(vec![self.dns_ip.clone()]),
            searches: Some(vec![
                format!("{namespace}.svc.{CLUSTER_DOMAIN}"),
                format!("svc.{CLUSTER_DOMAIN}"),
                CLUSTER_DOMAIN.to_string(),
            ]),
            options: Some(vec![PodDNSConfigOption {
                name: Some("ndots".to_string()),
                value: Some(NDOTS.to_string()),
            }]),
        }
    }

    /// JSON patch applied to a pod being created in `namespace`.
    ///
    /// The priority class is left alone: builtin classes exist in the
    /// virtual cluster and tenant classes are remapped on the host side.
    pub fn mutate(&self, pod: &Pod, namespace: &str) -> Result<Vec<PatchOperation>, serde_json::Error> {
        let mut ops = Vec::new();

        let node_set = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .is_some_and(|n| !n.is_empty());
        if !node_set {
            ops.push(add(&["spec", "nodeName"], Value::String(self.node_name.clone())));
        }

        if uses_cluster_dns(pod) {
            ops.push(add(&["spec", "dnsPolicy"], Value::String("None".to_string())));
            ops.push(add(&["spec", "dnsConfig"], serde_json::to_value(self.dns_config(namespace))?));
        }

        let cluster = Value::String(self.cluster.clone());
        match &pod.metadata.annotations {
            None => ops.push(add(
                &["metadata", "annotations"],
                serde_json::json!({ CLUSTER_ANNOTATION: self.cluster }),
            )),
            Some(a) if a.contains_key(CLUSTER_ANNOTATION) => ops.push(PatchOperation::Replace(ReplaceOperation {
                path: PointerBuf::from_tokens(["metadata", "annotations", CLUSTER_ANNOTATION]),
                value: cluster,
            })),
            Some(_) => ops.push(add(&["metadata", "annotations", CLUSTER_ANNOTATION], cluster)),
        }

        Ok(ops)
    }

    /// Admission decision for one request
    #[instrument(skip_all, fields(uid = %request.uid))]
    pub fn review(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let allow = AdmissionResponse::from(request);
        if request.kind.kind != "Pod" {
            debug!(kind = %request.kind.kind, "Not a pod, allowing unchanged");
            return allow;
        }
        let Some(object) = request.object.as_ref() else {
            return allow;
        };
        let pod: Pod = match serde_json::to_value(object).and_then(serde_json::from_value) {
            Ok(pod) => pod,
            Err(e) => {
                debug!(error = %e, "Malformed pod, allowing unchanged");
                return allow;
            }
        };
        let namespace = request
            .namespace
            .clone()
            .or_else(|| pod.namespace())
            .unwrap_or_else(|| "default".to_string());

        let ops = match self.mutate(&pod, &namespace) {
            Ok(ops) => ops,
            Err(e) => {
                error!(error = %e, "Failed to build pod patch");
                return allow.deny(format!("patch serialization error: {e}"));
            }
        };
        info!(pod = %pod.name_any(), namespace = %namespace, patch_ops = ops.len(), "Mutating pod");

        match AdmissionResponse::from(request).with_patch(json_patch::Patch(ops)) {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Failed to serialize patch");
                AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
            }
        }
    }
}

async fn mutate_handler(
    State(mutator): State<Arc<PodMutator>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let response = match body.try_into() {
        Ok(request) => mutator.review(&request),
        Err(e) => {
            error!(error = %e, "Invalid admission review");
            AdmissionResponse::invalid(e.to_string())
        }
    };
    Json(response.into_review())
}

pub fn router(mutator: Arc<PodMutator>) -> Router {
    Router::new()
        .route(MUTATE_PATH, post(mutate_handler))
        .with_state(mutator)
}

/// Serve the mutator until the listener fails
pub async fn serve(addr: SocketAddr, tls: Arc<ServerConfig>, mutator: Arc<PodMutator>) -> Result<(), KubeletError> {
    info!(addr = %addr, "Pod mutator listening");
    axum_server::bind_rustls(addr, RustlsConfig::from_config(tls))
        .serve(router(mutator).into_make_service())
        .await
        .map_err(|e| KubeletError::Server(format!("pod mutator: {e}")))
}

#[must_use]
pub fn configuration_name(cluster: &str) -> String {
    format!("k3k-{cluster}-pod-mutator")
}

/// Webhook registration pointing the virtual API server at the bridge
#[must_use]
pub fn webhook_configuration(cluster: &str, agent_ip: &str, port: u16, ca_pem: &str) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(configuration_name(cluster)),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: format!("{cluster}.pods.k3k.io"),
            admission_review_versions: vec!["v1".to_string()],
            side_effects: "None".to_string(),
            failure_policy: Some("Ignore".to_string()),
            rules: Some(vec![RuleWithOperations {
                operations: Some(vec!["CREATE".to_string()]),
                api_groups: Some(vec![String::new()]),
                api_versions: Some(vec!["v1".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                scope: None,
            }]),
            client_config: WebhookClientConfig {
                url: Some(format!("https://{agent_ip}:{port}{MUTATE_PATH}")),
                ca_bundle: Some(ByteString(ca_pem.as_bytes().to_vec())),
                service: None,
            },
            ..Default::default()
        }]),
    }
}

/// Create or refresh the webhook registration in the virtual cluster
pub async fn ensure_webhook_configuration<V: ClusterClient>(
    virt: &V,
    desired: MutatingWebhookConfiguration,
) -> Result<(), KubeletError> {
    let name = desired.name_any();
    match virt.get_global::<MutatingWebhookConfiguration>(&name).await? {
        None => {
            virt.create_global(&desired).await?;
            info!(webhook = %name, "Registered pod mutator");
        }
        Some(existing) => {
            // The server fills in defaults, so only the fields set here are compared
            let wanted = serde_json::to_value(&desired.webhooks)?;
            if is_subset(&wanted, &serde_json::to_value(&existing.webhooks)?) {
                debug!(webhook = %name, "Pod mutator registration up to date");
                return Ok(());
            }
            let mut updated = desired;
            updated.metadata.resource_version = existing.metadata.resource_version;
            virt.replace_global(&updated).await?;
            info!(webhook = %name, "Updated pod mutator registration");
        }
    }
    Ok(())
}
