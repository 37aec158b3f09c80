//! Virtual to host object mirroring.
//!
//! Every synced virtual object has exactly one host shadow. The shadow is
//! linked back through the `k3k.io/name`, `k3k.io/namespace` and `k3k.io/kind`
//! annotations, which is how a name collision with someone else's object is
//! told apart from our own shadow.
//!
//! Spec flows virtual to host in the virtual manager. Status flows host to
//! virtual in the host manager. Both run as `kube_runtime` controllers.

pub mod pod_pvc;
pub mod priority_class;
pub mod pvc;
pub mod service;


use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crds::names::{self, SHADOW_KIND_ANNOTATION, SHADOW_NAME_ANNOTATION, SHADOW_NAMESPACE_ANNOTATION, SHADOW_ROLE};
use futures::StreamExt;
use host_client::diff::{is_subset, overlay};
use host_client::{ClientError, ClusterClient, NamespacedObject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use kube::{Resource, ResourceExt};
use kube_runtime::controller::{Action, Config as RuntimeConfig};
use kube_runtime::{Controller, watcher};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::metrics::SyncMetrics;

/// Finalizer holding a virtual object until its shadow is gone
pub const FINALIZER: &str = "k3k.io/shadow-sync";

/// Set on a virtual object once its shadow was created
pub const SYNCED_ANNOTATION: &str = "k3k.io/synced";

/// Delay before a conflicting or drifted object is looked at again
pub const SYNC_RETRY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SyncError {
    /// The shadow name is taken by an object that is not our shadow
    #[error("shadow {host_name} is linked to {owner}")]
    Conflict { host_name: String, owner: String },

    /// A previously created shadow was removed on the host
    #[error("shadow {host_name} of {key} is missing on the host")]
    Drift { host_name: String, key: String },

    #[error("API error: {0}")]
    Client(#[from] ClientError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Identity of a virtual object, as recorded on its shadow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShadowKey {
    pub cluster: String,
    pub kind: String,
    /// `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    pub name: String,
}

impl ShadowKey {
    #[must_use]
    pub fn of<K: Resource<DynamicType = ()>>(cluster: &str, obj: &K) -> Self {
        Self {
            cluster: cluster.to_string(),
            kind: K::kind(&()).to_string(),
            namespace: obj.meta().namespace.clone(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }

    /// Reads the link annotations of a host object
    #[must_use]
    pub fn from_shadow(cluster: &str, meta: &ObjectMeta) -> Option<Self> {
        let annotations = meta.annotations.as_ref()?;
        let labels = meta.labels.as_ref()?;
        if labels.get(names::CLUSTER_LABEL).map(String::as_str) != Some(cluster) {
            return None;
        }
        Some(Self {
            cluster: cluster.to_string(),
            kind: annotations.get(SHADOW_KIND_ANNOTATION)?.clone(),
            namespace: annotations.get(SHADOW_NAMESPACE_ANNOTATION).cloned(),
            name: annotations.get(SHADOW_NAME_ANNOTATION)?.clone(),
        })
    }

    /// Name of the shadow on the host
    #[must_use]
    pub fn host_name(&self) -> String {
        match &self.namespace {
            Some(ns) => names::shadow_name(&self.cluster, ns, &self.name),
            None => names::cluster_scoped_shadow_name(&self.cluster, &self.name),
        }
    }

    #[must_use]
    pub fn labels(&self) -> BTreeMap<String, String> {
        names::role_labels(&self.cluster, SHADOW_ROLE)
    }

    #[must_use]
    pub fn annotations(&self) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::from([
            (SHADOW_NAME_ANNOTATION.to_string(), self.name.clone()),
            (SHADOW_KIND_ANNOTATION.to_string(), self.kind.clone()),
        ]);
        if let Some(ns) = &self.namespace {
            annotations.insert(SHADOW_NAMESPACE_ANNOTATION.to_string(), ns.clone());
        }
        annotations
    }

    /// Selector matching every shadow of `cluster`
    #[must_use]
    pub fn selector(cluster: &str) -> String {
        names::label_selector(&names::role_labels(cluster, SHADOW_ROLE))
    }

    /// Shadow metadata: the virtual labels and annotations plus the link
    #[must_use]
    pub fn shadow_meta(&self, host_namespace: Option<&str>, source: &ObjectMeta) -> ObjectMeta {
        let mut labels = source.labels.clone().unwrap_or_default();
        labels.extend(self.labels());
        let mut annotations = source.annotations.clone().unwrap_or_default();
        annotations.remove(SYNCED_ANNOTATION);
        annotations.extend(self.annotations());
        ObjectMeta {
            name: Some(self.host_name()),
            namespace: host_namespace.map(str::to_string),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        }
    }
}

impl fmt::Display for ShadowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {ns}/{}", self.kind, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// What to do with the shadow of a live virtual object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowAction {
    Create,
    Update,
    InSync,
}

/// Decide the shadow write for `key`.
///
/// `shadow` is the host object currently holding the shadow name, if any.
pub fn plan_shadow(
    key: &ShadowKey,
    synced: bool,
    shadow: Option<(&ObjectMeta, &Value)>,
    desired: &Value,
) -> Result<ShadowAction, SyncError> {
    let Some((meta, actual)) = shadow else {
        if synced {
            return Err(SyncError::Drift {
                host_name: key.host_name(),
                key: key.to_string(),
            });
        }
        return Ok(ShadowAction::Create);
    };

    match ShadowKey::from_shadow(&key.cluster, meta) {
        Some(owner) if owner == *key => {}
        owner => {
            return Err(SyncError::Conflict {
                host_name: key.host_name(),
                owner: owner.map_or_else(|| "an unmanaged object".to_string(), |o| o.to_string()),
            });
        }
    }

    if is_subset(desired, actual) {
        Ok(ShadowAction::InSync)
    } else {
        Ok(ShadowAction::Update)
    }
}

#[must_use]
pub fn is_synced(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(SYNCED_ANNOTATION))
        .is_some_and(|v| v == "true")
}

#[must_use]
pub fn has_finalizer(meta: &ObjectMeta) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == FINALIZER))
}

/// Patch adding the finalizer and the synced mark, `None` when both are set
#[must_use]
pub fn tracking_patch(meta: &ObjectMeta) -> Option<Value> {
    if has_finalizer(meta) && is_synced(meta) {
        return None;
    }
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    if !has_finalizer(meta) {
        finalizers.push(FINALIZER.to_string());
    }
    Some(json!({
        "metadata": {
            "finalizers": finalizers,
            "annotations": { SYNCED_ANNOTATION: "true" },
        }
    }))
}

/// Patch removing our finalizer
#[must_use]
pub fn release_patch(meta: &ObjectMeta) -> Value {
    let finalizers: Vec<_> = meta
        .finalizers
        .iter()
        .flatten()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    json!({ "metadata": { "finalizers": finalizers } })
}

/// Both API clients plus the identity of the cluster being bridged
#[derive(Debug)]
pub struct SyncContext<V, H> {
    pub cluster: String,
    /// Host namespace holding the shadows
    pub host_namespace: String,
    pub virt: V,
    pub host: H,
    pub metrics: SyncMetrics,
}

impl<V, H> SyncContext<V, H> {
    #[must_use]
    pub fn key_of<K: Resource<DynamicType = ()>>(&self, obj: &K) -> ShadowKey {
        ShadowKey::of(&self.cluster, obj)
    }
}

/// A namespaced kind mirrored under the same kind on the host
pub trait Mirror: NamespacedObject {
    /// Objects that must never be mirrored
    fn skip(&self) -> bool {
        false
    }

    /// Host shadow of `self` in `host_namespace`
    fn to_shadow(&self, key: &ShadowKey, host_namespace: &str) -> Self;

    /// Merge patch carrying host-only status back to the virtual object
    fn status_patch(shadow: &Self) -> Option<Value>;
}

async fn delete_shadow<K, V, H>(ctx: &SyncContext<V, H>, key: &ShadowKey) -> Result<(), SyncError>
where
    K: Mirror,
    V: ClusterClient,
    H: ClusterClient,
{
    let host_name = key.host_name();
    let Some(shadow) = ctx.host.get::<K>(&ctx.host_namespace, &host_name).await? else {
        return Ok(());
    };
    if ShadowKey::from_shadow(&ctx.cluster, shadow.meta()).as_ref() != Some(key) {
        warn!(shadow = %host_name, key = %key, "Host object is not our shadow, leaving it");
        return Ok(());
    }
    match ctx.host.delete::<K>(&ctx.host_namespace, &host_name).await {
        Ok(()) => {
            info!(shadow = %host_name, key = %key, "Deleted shadow");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Converge the host shadow of virtual object `obj`
#[instrument(skip_all, fields(kind = %K::kind(&()), name = %obj.name_any()))]
pub async fn sync_to_host<K, V, H>(ctx: &SyncContext<V, H>, obj: &K) -> Result<(), SyncError>
where
    K: Mirror,
    V: ClusterClient,
    H: ClusterClient,
{
    if obj.skip() {
        return Ok(());
    }
    let key = ctx.key_of(obj);
    let namespace = obj.namespace().unwrap_or_default();
    let meta = obj.meta();

    if meta.deletion_timestamp.is_some() {
        if has_finalizer(meta) {
            delete_shadow::<K, V, H>(ctx, &key).await?;
            ctx.virt
                .merge_patch::<K>(&namespace, &key.name, &release_patch(meta))
                .await?;
        }
        return Ok(());
    }

    let desired = obj.to_shadow(&key, &ctx.host_namespace);
    let desired_value = serde_json::to_value(&desired)?;
    let host_name = key.host_name();
    let existing = ctx.host.get::<K>(&ctx.host_namespace, &host_name).await?;
    let existing_value = existing.as_ref().map(serde_json::to_value).transpose()?;
    let shadow = existing.as_ref().zip(existing_value.as_ref()).map(|(o, v)| (o.meta(), v));

    match plan_shadow(&key, is_synced(meta), shadow, &desired_value)? {
        ShadowAction::Create => {
            info!(shadow = %host_name, key = %key, "Creating shadow");
            ctx.host.create(&ctx.host_namespace, &desired).await?;
        }
        ShadowAction::Update => {
            if let Some(actual) = &existing {
                info!(shadow = %host_name, key = %key, "Updating shadow");
                ctx.host
                    .replace(&ctx.host_namespace, &overlay(&desired, actual)?)
                    .await?;
            }
        }
        ShadowAction::InSync => debug!(shadow = %host_name, "Shadow up to date"),
    }

    if let Some(patch) = tracking_patch(meta) {
        ctx.virt.merge_patch::<K>(&namespace, &key.name, &patch).await?;
    }
    Ok(())
}

/// Copy host-only status of `shadow` onto its virtual object
#[instrument(skip_all, fields(kind = %K::kind(&()), shadow = %shadow.name_any()))]
pub async fn sync_status_from_host<K, V, H>(ctx: &SyncContext<V, H>, shadow: &K) -> Result<(), SyncError>
where
    K: Mirror,
    V: ClusterClient,
    H: ClusterClient,
{
    let Some(key) = ShadowKey::from_shadow(&ctx.cluster, shadow.meta()) else {
        return Ok(());
    };
    let (Some(namespace), true) = (key.namespace.as_deref(), key.kind == K::kind(&())) else {
        return Ok(());
    };
    let Some(patch) = K::status_patch(shadow) else {
        return Ok(());
    };
    let Some(virtual_obj) = ctx.virt.get::<K>(namespace, &key.name).await? else {
        debug!(key = %key, "Virtual object gone, skipping status");
        return Ok(());
    };
    if is_subset(&patch, &serde_json::to_value(&virtual_obj)?) {
        return Ok(());
    }
    info!(key = %key, "Copying host status");
    ctx.virt
        .merge_patch_status::<K>(namespace, &key.name, &patch)
        .await?;
    Ok(())
}

/// Requeue decision after a failed sync
pub fn requeue_after_error(kind: &str, name: &str, error: &SyncError) -> Action {
    warn!(kind = %kind, name = %name, error = %error, "Sync failed, requeueing");
    Action::requeue(SYNC_RETRY)
}

pub(crate) fn runtime_config() -> RuntimeConfig {
    RuntimeConfig::default()
        .debounce(Duration::from_secs(1))
        .concurrency(3)
}

async fn reconcile_to_host<K, V, H>(obj: Arc<K>, ctx: Arc<SyncContext<V, H>>) -> Result<Action, SyncError>
where
    K: Mirror,
    V: ClusterClient + 'static,
    H: ClusterClient + 'static,
{
    let kind = K::kind(&());
    let result = sync_to_host(ctx.as_ref(), obj.as_ref()).await;
    ctx.metrics.record(&kind, result.is_ok());
    result.map(|()| Action::await_change())
}

async fn reconcile_from_host<K, V, H>(shadow: Arc<K>, ctx: Arc<SyncContext<V, H>>) -> Result<Action, SyncError>
where
    K: Mirror,
    V: ClusterClient + 'static,
    H: ClusterClient + 'static,
{
    sync_status_from_host(ctx.as_ref(), shadow.as_ref()).await?;
    Ok(Action::await_change())
}

fn error_policy<K, V, H>(obj: Arc<K>, error: &SyncError, _ctx: Arc<SyncContext<V, H>>) -> Action
where
    K: Mirror,
{
    requeue_after_error(&K::kind(&()), &obj.name_any(), error)
}

/// Mirror every virtual `K` to the host until the watch ends
pub async fn run_to_host<K, V, H>(virtual_api: Api<K>, ctx: Arc<SyncContext<V, H>>)
where
    K: Mirror,
    V: ClusterClient + 'static,
    H: ClusterClient + 'static,
{
    info!(kind = %K::kind(&()), "Starting virtual to host syncer");
    Controller::new(virtual_api, watcher::Config::default())
        .with_config(runtime_config())
        .run(reconcile_to_host::<K, V, H>, error_policy::<K, V, H>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(object = %obj.name, "Synced"),
                Err(e) => warn!(error = %e, "Syncer error"),
            }
        })
        .await;
}

/// Copy status from host shadows of `K` until the watch ends
pub async fn run_from_host<K, V, H>(host_api: Api<K>, ctx: Arc<SyncContext<V, H>>)
where
    K: Mirror,
    V: ClusterClient + 'static,
    H: ClusterClient + 'static,
{
    info!(kind = %K::kind(&()), "Starting host status syncer");
    let selector = ShadowKey::selector(&ctx.cluster);
    Controller::new(host_api, watcher::Config::default().labels(&selector))
        .with_config(runtime_config())
        .run(reconcile_from_host::<K, V, H>, error_policy::<K, V, H>, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = %e, "Status syncer error");
            }
        })
        .await;
}
