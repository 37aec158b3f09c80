//! Pod provider: virtual pods bound to the bridge node run as host pods.
//!
//! Spec flows virtual to host once, at creation, since pods are immutable.
//! Status flows host to virtual for as long as both exist.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crds::Cluster;
use futures::StreamExt;
use host_client::ClusterClient;
use host_client::diff::is_subset;
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec};
use kube::api::Api;
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use kube_runtime::{Controller, watcher};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::config::KubeletConfig;
use crate::metrics::SyncMetrics;
use crate::syncer::priority_class::{host_class_name, is_builtin};
use crate::syncer::{ShadowKey, SyncError, requeue_after_error, runtime_config};

const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";
/// Port of the virtual API server service
const SERVICE_PORT: &str = "443";

/// Host pods carry the uid of their virtual pod here
pub const VIRTUAL_UID_ANNOTATION: &str = "k3k.io/uid";

/// Recheck interval while a previous host pod of the same name goes away
const HOST_POD_RECHECK: Duration = Duration::from_secs(5);

/// Rewrites virtual pods into their host form
#[derive(Debug, Clone)]
pub struct PodTranslator {
    pub cluster: String,
    pub host_namespace: String,
    /// Address of the virtual API server, injected into every container
    pub server_ip: Option<String>,
    /// Host node selector of the cluster, replacing the virtual one
    pub node_selector: BTreeMap<String, String>,
    /// Host priority class of the cluster, used when the pod names none
    pub priority_class: Option<String>,
}

impl PodTranslator {
    #[must_use]
    pub fn new(config: &KubeletConfig, cluster: &Cluster) -> Self {
        Self {
            cluster: config.cluster_name.clone(),
            host_namespace: config.cluster_namespace.clone(),
            server_ip: config.server_ip.clone(),
            node_selector: cluster.spec.node_selector.clone(),
            priority_class: cluster.spec.priority_class.clone(),
        }
    }

    /// Host name of virtual pod `namespace/name`
    #[must_use]
    pub fn host_name(&self, namespace: &str, name: &str) -> String {
        crds::names::shadow_name(&self.cluster, namespace, name)
    }

    /// Host class for a virtual class.
    ///
    /// Builtin classes are reserved to host system namespaces, so they fall
    /// back to the cluster class like pods without one.
    #[must_use]
    pub fn priority_class_name(&self, virtual_class: Option<&str>) -> Option<String> {
        match virtual_class {
            Some(class) if !class.is_empty() && !is_builtin(class) => Some(host_class_name(&self.cluster, class)),
            _ => self.priority_class.clone(),
        }
    }

    fn translate_containers(&self, containers: &mut [Container]) {
        let Some(server_ip) = &self.server_ip else {
            return;
        };
        for container in containers {
            let env = container.env.get_or_insert_with(Vec::new);
            env.retain(|e| e.name != SERVICE_HOST_ENV && e.name != SERVICE_PORT_ENV);
            env.push(EnvVar {
                name: SERVICE_HOST_ENV.to_string(),
                value: Some(server_ip.clone()),
                value_from: None,
            });
            env.push(EnvVar {
                name: SERVICE_PORT_ENV.to_string(),
                value: Some(SERVICE_PORT.to_string()),
                value_from: None,
            });
        }
    }

    fn translate_spec(&self, namespace: &str, pod_name: &str, spec: &PodSpec) -> PodSpec {
        let mut spec = spec.clone();
        spec.node_name = None;
        spec.node_selector = (!self.node_selector.is_empty()).then(|| self.node_selector.clone());
        spec.priority_class_name = self.priority_class_name(spec.priority_class_name.as_deref());
        // Admission on the host derives the value from the class
        spec.priority = None;
        spec.automount_service_account_token = Some(false);
        spec.service_account_name = None;
        spec.service_account = None;
        if spec.hostname.is_none() && pod_name.len() <= 63 {
            spec.hostname = Some(pod_name.to_string());
        }

        for volume in spec.volumes.iter_mut().flatten() {
            if let Some(claim) = volume.persistent_volume_claim.as_mut() {
                claim.claim_name = crds::names::shadow_name(&self.cluster, namespace, &claim.claim_name);
            }
        }
        self.translate_containers(&mut spec.containers);
        if let Some(init) = spec.init_containers.as_mut() {
            self.translate_containers(init);
        }
        spec
    }

    /// Host pod running virtual `pod`
    #[must_use]
    pub fn host_pod(&self, pod: &Pod) -> Pod {
        let key = ShadowKey::of(&self.cluster, pod);
        let namespace = pod.namespace().unwrap_or_default();
        let mut metadata = key.shadow_meta(Some(&self.host_namespace), &pod.metadata);
        if let (Some(uid), Some(annotations)) = (&pod.metadata.uid, metadata.annotations.as_mut()) {
            annotations.insert(VIRTUAL_UID_ANNOTATION.to_string(), uid.clone());
        }
        Pod {
            metadata,
            spec: pod
                .spec
                .as_ref()
                .map(|spec| self.translate_spec(&namespace, &pod.name_any(), spec)),
            status: None,
        }
    }
}

/// False when `host_pod` was created for an earlier virtual pod of the same name
fn same_incarnation(host_pod: &Pod, virtual_pod: &Pod) -> bool {
    let recorded = host_pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(VIRTUAL_UID_ANNOTATION));
    match (recorded, virtual_pod.metadata.uid.as_ref()) {
        (Some(recorded), Some(uid)) => recorded == uid,
        _ => true,
    }
}

/// Status patch copying the host pod status onto its virtual pod
#[must_use]
pub fn status_patch(host_pod: &Pod) -> Option<Value> {
    host_pod.status.as_ref().map(|status| json!({ "status": status }))
}

#[derive(Debug)]
pub struct ProviderContext<V, H> {
    pub translator: PodTranslator,
    pub node_name: String,
    pub virt: V,
    pub host: H,
    pub metrics: SyncMetrics,
}

impl<V: ClusterClient, H: ClusterClient> ProviderContext<V, H> {
    fn owns(&self, pod: &Pod) -> bool {
        pod.spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .is_some_and(|n| n == self.node_name)
    }

    async fn delete_host_pod(&self, key: &ShadowKey) -> Result<(), SyncError> {
        let host_name = key.host_name();
        let ns = &self.translator.host_namespace;
        let Some(host_pod) = self.host.get::<Pod>(ns, &host_name).await? else {
            return Ok(());
        };
        if ShadowKey::from_shadow(&self.translator.cluster, host_pod.meta()).as_ref() != Some(key) {
            warn!(pod = %host_name, "Host pod is not ours, leaving it");
            return Ok(());
        }
        match self.host.delete::<Pod>(ns, &host_name).await {
            Err(e) if !e.is_not_found() => Err(e.into()),
            _ => {
                info!(pod = %host_name, key = %key, "Deleted host pod");
                Ok(())
            }
        }
    }
}

/// Converge the host pod of a virtual pod bound to this node
#[instrument(skip_all, fields(pod = %pod.name_any(), namespace = %pod.namespace().unwrap_or_default()))]
pub async fn sync_virtual_pod<V, H>(ctx: &ProviderContext<V, H>, pod: &Pod) -> Result<Action, SyncError>
where
    V: ClusterClient,
    H: ClusterClient,
{
    if !ctx.owns(pod) {
        return Ok(Action::await_change());
    }
    let key = ShadowKey::of(&ctx.translator.cluster, pod);
    let namespace = pod.namespace().unwrap_or_default();

    if pod.metadata.deletion_timestamp.is_some() {
        ctx.delete_host_pod(&key).await?;
        // Confirms the graceful deletion, as a kubelet does once containers stop
        match ctx.virt.force_delete::<Pod>(&namespace, &key.name).await {
            Err(e) if !e.is_not_found() => return Err(e.into()),
            _ => return Ok(Action::await_change()),
        }
    }

    let host_name = key.host_name();
    let ns = &ctx.translator.host_namespace;
    match ctx.host.get::<Pod>(ns, &host_name).await? {
        None => {
            info!(host_pod = %host_name, "Creating host pod");
            ctx.host.create(ns, &ctx.translator.host_pod(pod)).await?;
        }
        Some(existing) => {
            let owner = ShadowKey::from_shadow(&ctx.translator.cluster, existing.meta());
            if owner.as_ref() != Some(&key) {
                return Err(SyncError::Conflict {
                    host_name,
                    owner: owner.map_or_else(|| "an unmanaged object".to_string(), |o| o.to_string()),
                });
            }
            if existing.metadata.deletion_timestamp.is_some() {
                debug!(host_pod = %host_name, "Previous host pod still terminating");
                return Ok(Action::requeue(HOST_POD_RECHECK));
            }
            if !same_incarnation(&existing, pod) {
                info!(host_pod = %host_name, "Host pod belongs to a previous virtual pod, replacing it");
                ctx.delete_host_pod(&key).await?;
                return Ok(Action::requeue(HOST_POD_RECHECK));
            }
            debug!(host_pod = %host_name, "Host pod exists");
        }
    }
    Ok(Action::await_change())
}

/// Copy host pod status back, or remove host pods whose virtual pod is gone
#[instrument(skip_all, fields(host_pod = %host_pod.name_any()))]
pub async fn sync_host_pod<V, H>(ctx: &ProviderContext<V, H>, host_pod: &Pod) -> Result<(), SyncError>
where
    V: ClusterClient,
    H: ClusterClient,
{
    let Some(key) = ShadowKey::from_shadow(&ctx.translator.cluster, host_pod.meta()) else {
        return Ok(());
    };
    let (Some(namespace), true) = (key.namespace.as_deref(), key.kind == Pod::kind(&())) else {
        return Ok(());
    };
    if host_pod.metadata.deletion_timestamp.is_some() {
        return Ok(());
    }

    let Some(virtual_pod) = ctx.virt.get::<Pod>(namespace, &key.name).await? else {
        info!(key = %key, "Virtual pod is gone, removing host pod");
        return ctx.delete_host_pod(&key).await;
    };
    if !same_incarnation(host_pod, &virtual_pod) {
        info!(key = %key, "Virtual pod was recreated, removing stale host pod");
        return ctx.delete_host_pod(&key).await;
    }
    let Some(patch) = status_patch(host_pod) else {
        return Ok(());
    };
    if is_subset(&patch, &serde_json::to_value(&virtual_pod)?) {
        return Ok(());
    }
    debug!(key = %key, "Copying host pod status");
    ctx.virt
        .merge_patch_status::<Pod>(namespace, &key.name, &patch)
        .await?;
    Ok(())
}

async fn reconcile_virtual<V, H>(pod: Arc<Pod>, ctx: Arc<ProviderContext<V, H>>) -> Result<Action, SyncError>
where
    V: ClusterClient + 'static,
    H: ClusterClient + 'static,
{
    let result = sync_virtual_pod(ctx.as_ref(), pod.as_ref()).await;
    ctx.metrics.record("Pod", result.is_ok());
    result
}

async fn reconcile_host<V, H>(pod: Arc<Pod>, ctx: Arc<ProviderContext<V, H>>) -> Result<Action, SyncError>
where
    V: ClusterClient + 'static,
    H: ClusterClient + 'static,
{
    let result = sync_host_pod(ctx.as_ref(), pod.as_ref()).await;
    ctx.metrics.record("PodStatus", result.is_ok());
    result.map(|()| Action::await_change())
}

fn error_policy<V, H>(pod: Arc<Pod>, error: &SyncError, _ctx: Arc<ProviderContext<V, H>>) -> Action {
    requeue_after_error("Pod", &pod.name_any(), error)
}

/// Run both pod watches until one of them ends
pub async fn run<V, H>(virtual_pods: Api<Pod>, host_pods: Api<Pod>, ctx: Arc<ProviderContext<V, H>>)
where
    V: ClusterClient + 'static,
    H: ClusterClient + 'static,
{
    info!(node = %ctx.node_name, "Starting pod provider");
    let node_selector = format!("spec.nodeName={}", ctx.node_name);
    let virtual_side = Controller::new(virtual_pods, watcher::Config::default().fields(&node_selector))
        .with_config(runtime_config())
        .run(reconcile_virtual::<V, H>, error_policy::<V, H>, Arc::clone(&ctx))
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = %e, "Virtual pod controller error");
            }
        });

    let shadow_selector = ShadowKey::selector(&ctx.translator.cluster);
    let host_side = Controller::new(host_pods, watcher::Config::default().labels(&shadow_selector))
        .with_config(runtime_config())
        .run(reconcile_host::<V, H>, error_policy::<V, H>, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = %e, "Host pod controller error");
            }
        });

    tokio::select! {
        () = virtual_side => {}
        () = host_side => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::ClusterSpec;
    use host_client::MockClusterClient;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimVolumeSource, PodStatus, Volume};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const NODE: &str = "k3k-demo-kubelet";

    fn translator() -> PodTranslator {
        let cluster = Cluster::new(
            "demo",
            ClusterSpec {
                node_selector: BTreeMap::from([("pool".to_string(), "tenants".to_string())]),
                priority_class: Some("tenant-default".to_string()),
                ..Default::default()
            },
        );
        PodTranslator::new(&crate::config::test_config(), &cluster)
    }

    fn pod(name: &str, class: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("apps".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(NODE.to_string()),
                node_selector: Some(BTreeMap::from([("kubernetes.io/hostname".to_string(), NODE.to_string())])),
                priority_class_name: class.map(str::to_string),
                priority: Some(1000),
                service_account_name: Some("builder".to_string()),
                containers: vec![Container {
                    name: "app".to_string(),
                    image: Some("nginx".to_string()),
                    env: Some(vec![EnvVar {
                        name: "KUBERNETES_SERVICE_HOST".to_string(),
                        value: Some("10.0.0.1".to_string()),
                        value_from: None,
                    }]),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: "data".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: "data".to_string(),
                        read_only: None,
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn context(virt: MockClusterClient, host: MockClusterClient) -> ProviderContext<MockClusterClient, MockClusterClient> {
        ProviderContext {
            translator: translator(),
            node_name: NODE.to_string(),
            virt,
            host,
            metrics: SyncMetrics::new().unwrap(),
        }
    }

    #[test]
    fn test_host_pod_translation() {
        let host = translator().host_pod(&pod("web-0", Some("batch")));
        assert_eq!(host.metadata.name.as_deref(), Some("web-0-apps-demo"));
        assert_eq!(host.metadata.namespace.as_deref(), Some("tenant"));
        let labels = host.metadata.labels.unwrap();
        assert_eq!(labels["app"], "web");
        assert_eq!(labels["cluster"], "demo");
        assert_eq!(labels["role"], "shadow");
        assert_eq!(host.metadata.annotations.unwrap()["k3k.io/name"], "web-0");

        let spec = host.spec.unwrap();
        assert!(spec.node_name.is_none());
        assert_eq!(spec.node_selector.unwrap()["pool"], "tenants");
        assert_eq!(spec.priority_class_name.as_deref(), Some("k3k-demo-batch"));
        assert!(spec.priority.is_none());
        assert_eq!(spec.automount_service_account_token, Some(false));
        assert!(spec.service_account_name.is_none());
        assert_eq!(spec.hostname.as_deref(), Some("web-0"));
        assert_eq!(
            spec.volumes.unwrap()[0].persistent_volume_claim.as_ref().unwrap().claim_name,
            "data-apps-demo"
        );

        let env = spec.containers[0].env.clone().unwrap();
        let host_env: Vec<_> = env.iter().filter(|e| e.name == "KUBERNETES_SERVICE_HOST").collect();
        assert_eq!(host_env.len(), 1);
        assert_eq!(host_env[0].value.as_deref(), Some("10.43.0.10"));
        assert!(env.iter().any(|e| e.name == "KUBERNETES_SERVICE_PORT" && e.value.as_deref() == Some("443")));
    }

    #[test]
    fn test_builtin_and_missing_classes_use_the_cluster_class() {
        let t = translator();
        assert_eq!(t.priority_class_name(Some("system-node-critical")).as_deref(), Some("tenant-default"));
        assert_eq!(t.priority_class_name(None).as_deref(), Some("tenant-default"));
    }

    #[tokio::test]
    async fn test_virtual_pod_lifecycle() {
        let virt = MockClusterClient::new();
        let host = MockClusterClient::new();
        let ctx = context(virt.clone(), host.clone());
        let virtual_pod = pod("web-0", None);
        virt.insert("apps", &virtual_pod);

        sync_virtual_pod(&ctx, &virtual_pod).await.unwrap();
        sync_virtual_pod(&ctx, &virtual_pod).await.unwrap();
        assert_eq!(host.operations(), vec!["create Pod tenant/web-0-apps-demo".to_string()]);

        // Status flows back once
        let mut running: Pod = host.peek("tenant", "web-0-apps-demo").unwrap();
        running.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some("10.42.3.4".to_string()),
            ..Default::default()
        });
        sync_host_pod(&ctx, &running).await.unwrap();
        let synced: Pod = virt.peek("apps", "web-0").unwrap();
        assert_eq!(synced.status.unwrap().phase.as_deref(), Some("Running"));
        virt.clear_operations();
        sync_host_pod(&ctx, &running).await.unwrap();
        assert_eq!(virt.write_count(), 0);

        // Graceful deletion removes the host pod and confirms the virtual one
        let mut terminating: Pod = virt.peek("apps", "web-0").unwrap();
        terminating.metadata.deletion_timestamp = Some(host_client::time::time(chrono::Utc::now()).unwrap());
        sync_virtual_pod(&ctx, &terminating).await.unwrap();
        assert!(host.peek::<Pod>("tenant", "web-0-apps-demo").is_none());
        assert!(virt.operations().contains(&"force-delete Pod apps/web-0".to_string()));
    }

    #[tokio::test]
    async fn test_recreated_pod_waits_for_terminating_host_pod() {
        let virt = MockClusterClient::new();
        let host = MockClusterClient::new();
        let ctx = context(virt.clone(), host.clone());
        let mut first = pod("web-0", None);
        first.metadata.uid = Some("uid-a".to_string());
        sync_virtual_pod(&ctx, &first).await.unwrap();

        // A finalizer keeps the old host pod around while it terminates
        let mut old: Pod = host.peek("tenant", "web-0-apps-demo").unwrap();
        old.metadata.finalizers = Some(vec!["example.com/drain".to_string()]);
        host.insert("tenant", &old);
        first.metadata.deletion_timestamp = Some(host_client::time::time(chrono::Utc::now()).unwrap());
        sync_virtual_pod(&ctx, &first).await.unwrap();
        let old: Pod = host.peek("tenant", "web-0-apps-demo").unwrap();
        assert!(old.metadata.deletion_timestamp.is_some());

        let mut second = pod("web-0", None);
        second.metadata.uid = Some("uid-b".to_string());
        host.clear_operations();
        let action = sync_virtual_pod(&ctx, &second).await.unwrap();
        assert_eq!(action, Action::requeue(HOST_POD_RECHECK));
        assert_eq!(host.write_count(), 0);

        // Old host pod finishes terminating
        let mut old = old;
        old.metadata.finalizers = None;
        host.insert("tenant", &old);
        host.delete::<Pod>("tenant", "web-0-apps-demo").await.unwrap();
        assert!(host.peek::<Pod>("tenant", "web-0-apps-demo").is_none());

        sync_virtual_pod(&ctx, &second).await.unwrap();
        let created: Pod = host.peek("tenant", "web-0-apps-demo").unwrap();
        assert_eq!(created.metadata.annotations.unwrap()[VIRTUAL_UID_ANNOTATION], "uid-b");
    }

    #[tokio::test]
    async fn test_stale_host_pod_is_replaced() {
        let virt = MockClusterClient::new();
        let host = MockClusterClient::new();
        let ctx = context(virt.clone(), host.clone());
        let mut first = pod("web-0", None);
        first.metadata.uid = Some("uid-a".to_string());
        host.insert("tenant", &translator().host_pod(&first));

        let mut second = pod("web-0", None);
        second.metadata.uid = Some("uid-b".to_string());
        virt.insert("apps", &second);

        // Status of the old host pod is not copied onto the new virtual pod
        let stale: Pod = host.peek("tenant", "web-0-apps-demo").unwrap();
        sync_host_pod(&ctx, &stale).await.unwrap();
        assert_eq!(virt.write_count(), 0);
        assert!(host.peek::<Pod>("tenant", "web-0-apps-demo").is_none());

        host.insert("tenant", &stale);
        let action = sync_virtual_pod(&ctx, &second).await.unwrap();
        assert_eq!(action, Action::requeue(HOST_POD_RECHECK));
        assert!(host.peek::<Pod>("tenant", "web-0-apps-demo").is_none());

        sync_virtual_pod(&ctx, &second).await.unwrap();
        let created: Pod = host.peek("tenant", "web-0-apps-demo").unwrap();
        assert_eq!(created.metadata.annotations.unwrap()[VIRTUAL_UID_ANNOTATION], "uid-b");
    }

    #[tokio::test]
    async fn test_pods_for_other_nodes_are_ignored() {
        let host = MockClusterClient::new();
        let ctx = context(MockClusterClient::new(), host.clone());
        let mut elsewhere = pod("web-0", None);
        if let Some(spec) = elsewhere.spec.as_mut() {
            spec.node_name = Some("other".to_string());
        }
        sync_virtual_pod(&ctx, &elsewhere).await.unwrap();
        assert_eq!(host.write_count(), 0);
    }

    #[tokio::test]
    async fn test_orphaned_host_pod_is_removed() {
        let virt = MockClusterClient::new();
        let host = MockClusterClient::new();
        let ctx = context(virt, host.clone());
        let host_pod = translator().host_pod(&pod("web-0", None));
        host.insert("tenant", &host_pod);
        let stored: Pod = host.peek("tenant", "web-0-apps-demo").unwrap();

        sync_host_pod(&ctx, &stored).await.unwrap();
        assert_eq!(host.count::<Pod>(), 0);
    }

    #[tokio::test]
    async fn test_foreign_host_pod_is_a_conflict() {
        let host = MockClusterClient::new();
        host.insert(
            "tenant",
            &Pod {
                metadata: ObjectMeta {
                    name: Some("web-0-apps-demo".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let ctx = context(MockClusterClient::new(), host.clone());
        host.clear_operations();

        let err = sync_virtual_pod(&ctx, &pod("web-0", None)).await.unwrap_err();
        assert!(matches!(err, SyncError::Conflict { .. }));
        assert_eq!(host.write_count(), 0);
    }
}
