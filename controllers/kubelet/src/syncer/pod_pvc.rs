//! Virtual volumes for claims used by pods on the bridge node.
//!
//! The virtual cluster has no provisioner, so its claims would stay pending
//! forever. For every claim mounted by a pod scheduled here, a volume is
//! created that points at the claim's host shadow, which lets the claim bind.

use std::collections::BTreeMap;
use std::sync::Arc;

use crds::names;
use futures::StreamExt;
use host_client::ClusterClient;
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeSpec, Pod,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use kube_runtime::{Controller, watcher};
use tracing::{debug, info, instrument, warn};

use super::{SyncError, requeue_after_error, runtime_config};
use crate::metrics::SyncMetrics;

/// CSI driver named by the virtual volumes; nothing in the virtual cluster serves it
pub const CSI_DRIVER: &str = "pvc-sync.k3k.io";

#[derive(Debug)]
pub struct PodVolumeContext<V> {
    pub cluster: String,
    pub node_name: String,
    pub virt: V,
    pub metrics: SyncMetrics,
}

/// Claim names mounted by `pod`
#[must_use]
pub fn claim_names(pod: &Pod) -> Vec<String> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.volumes.iter().flatten())
        .filter_map(|volume| volume.persistent_volume_claim.as_ref())
        .map(|source| source.claim_name.clone())
        .collect()
}

/// Volume name bound to `pvc`, derived from its uid
#[must_use]
pub fn volume_name(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.metadata.uid.as_ref().map(|uid| format!("pvc-{uid}"))
}

/// Virtual volume pre-bound to `pvc`; `None` until the claim has a uid
#[must_use]
pub fn virtual_volume(cluster: &str, pvc: &PersistentVolumeClaim) -> Option<PersistentVolume> {
    let name = volume_name(pvc)?;
    let namespace = pvc.namespace().unwrap_or_default();
    let spec = pvc.spec.clone().unwrap_or_default();
    let capacity = spec
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .map(|q| BTreeMap::from([("storage".to_string(), q.clone())]));

    Some(PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(names::cluster_labels(cluster)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: spec.access_modes,
            capacity,
            claim_ref: Some(ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("PersistentVolumeClaim".to_string()),
                namespace: Some(namespace.clone()),
                name: Some(pvc.name_any()),
                uid: pvc.metadata.uid.clone(),
                ..Default::default()
            }),
            csi: Some(CSIPersistentVolumeSource {
                driver: CSI_DRIVER.to_string(),
                volume_handle: names::shadow_name(cluster, &namespace, &pvc.name_any()),
                ..Default::default()
            }),
            storage_class_name: spec.storage_class_name,
            volume_mode: spec.volume_mode,
            persistent_volume_reclaim_policy: Some("Retain".to_string()),
            ..Default::default()
        }),
        status: None,
    })
}

/// Ensure a virtual volume exists for every claim `pod` mounts
#[instrument(skip_all, fields(pod = %pod.name_any()))]
pub async fn sync_pod_volumes<V: ClusterClient>(ctx: &PodVolumeContext<V>, pod: &Pod) -> Result<(), SyncError> {
    let on_node = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .is_some_and(|n| n == ctx.node_name);
    if !on_node || pod.metadata.deletion_timestamp.is_some() {
        return Ok(());
    }

    let namespace = pod.namespace().unwrap_or_default();
    for claim in claim_names(pod) {
        let Some(pvc) = ctx.virt.get::<PersistentVolumeClaim>(&namespace, &claim).await? else {
            debug!(claim = %claim, "Claim not found yet");
            continue;
        };
        if pvc.spec.as_ref().and_then(|s| s.volume_name.as_ref()).is_some() {
            continue;
        }
        let Some(volume) = virtual_volume(&ctx.cluster, &pvc) else {
            continue;
        };
        let volume_name = volume.name_any();
        if ctx.virt.get_global::<PersistentVolume>(&volume_name).await?.is_some() {
            continue;
        }
        info!(claim = %claim, volume = %volume_name, "Creating virtual volume");
        match ctx.virt.create_global(&volume).await {
            Err(e) if !e.is_conflict() => return Err(e.into()),
            _ => {}
        }
    }
    Ok(())
}

async fn reconcile<V: ClusterClient + 'static>(pod: Arc<Pod>, ctx: Arc<PodVolumeContext<V>>) -> Result<Action, SyncError> {
    let result = sync_pod_volumes(ctx.as_ref(), pod.as_ref()).await;
    ctx.metrics.record("PersistentVolume", result.is_ok());
    result.map(|()| Action::await_change())
}

fn error_policy<V>(pod: Arc<Pod>, error: &SyncError, _ctx: Arc<PodVolumeContext<V>>) -> Action {
    requeue_after_error("Pod", &pod.name_any(), error)
}

/// Watch virtual pods bound to the bridge node
pub async fn run<V: ClusterClient + 'static>(virtual_pods: Api<Pod>, ctx: Arc<PodVolumeContext<V>>) {
    info!(node = %ctx.node_name, "Starting pod volume controller");
    let selector = format!("spec.nodeName={}", ctx.node_name);
    Controller::new(virtual_pods, watcher::Config::default().fields(&selector))
        .with_config(runtime_config())
        .run(reconcile::<V>, error_policy::<V>, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = %e, "Pod volume controller error");
            }
        })
        .await;
}
