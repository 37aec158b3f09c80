//! PriorityClass shadows.
//!
//! Priority classes are cluster scoped on both sides, so the host name is
//! prefixed with the cluster to keep tenants apart.

use std::sync::Arc;

use futures::StreamExt;
use host_client::ClusterClient;
use host_client::diff::overlay;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use kube::api::Api;
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use kube_runtime::{Controller, watcher};
use tracing::{debug, info, instrument, warn};

use super::{
    ShadowAction, ShadowKey, SyncContext, SyncError, has_finalizer, is_synced, plan_shadow, release_patch,
    requeue_after_error, runtime_config, tracking_patch,
};

/// Prefix of the classes every cluster ships with
pub const SYSTEM_PREFIX: &str = "system-";

#[must_use]
pub fn is_builtin(name: &str) -> bool {
    name.starts_with(SYSTEM_PREFIX)
}

/// Host name of virtual class `name`
#[must_use]
pub fn host_class_name(cluster: &str, name: &str) -> String {
    crds::names::cluster_scoped_shadow_name(cluster, name)
}

/// Host shadow of a virtual class; never the host default
#[must_use]
pub fn shadow_class(key: &ShadowKey, class: &PriorityClass) -> PriorityClass {
    PriorityClass {
        metadata: key.shadow_meta(None, &class.metadata),
        value: class.value,
        preemption_policy: class.preemption_policy.clone(),
        description: class.description.clone(),
        global_default: Some(false),
    }
}

async fn delete_shadow<V, H>(ctx: &SyncContext<V, H>, key: &ShadowKey) -> Result<(), SyncError>
where
    V: ClusterClient,
    H: ClusterClient,
{
    let host_name = key.host_name();
    let Some(shadow) = ctx.host.get_global::<PriorityClass>(&host_name).await? else {
        return Ok(());
    };
    if ShadowKey::from_shadow(&ctx.cluster, shadow.meta()).as_ref() != Some(key) {
        warn!(shadow = %host_name, "Host class is not our shadow, leaving it");
        return Ok(());
    }
    match ctx.host.delete_global::<PriorityClass>(&host_name).await {
        Err(e) if !e.is_not_found() => Err(e.into()),
        _ => {
            info!(shadow = %host_name, "Deleted priority class shadow");
            Ok(())
        }
    }
}

#[instrument(skip_all, fields(name = %class.name_any()))]
pub async fn sync_priority_class<V, H>(ctx: &SyncContext<V, H>, class: &PriorityClass) -> Result<(), SyncError>
where
    V: ClusterClient,
    H: ClusterClient,
{
    let name = class.name_any();
    if is_builtin(&name) {
        return Ok(());
    }
    let key = ctx.key_of(class);
    let meta = class.meta();

    if meta.deletion_timestamp.is_some() {
        if has_finalizer(meta) {
            delete_shadow(ctx, &key).await?;
            ctx.virt
                .merge_patch_global::<PriorityClass>(&name, &release_patch(meta))
                .await?;
        }
        return Ok(());
    }

    let desired = shadow_class(&key, class);
    let desired_value = serde_json::to_value(&desired)?;
    let host_name = key.host_name();
    let existing = ctx.host.get_global::<PriorityClass>(&host_name).await?;
    let existing_value = existing.as_ref().map(serde_json::to_value).transpose()?;
    let shadow = existing.as_ref().zip(existing_value.as_ref()).map(|(o, v)| (o.meta(), v));

    match plan_shadow(&key, is_synced(meta), shadow, &desired_value)? {
        ShadowAction::Create => {
            info!(shadow = %host_name, "Creating priority class shadow");
            ctx.host.create_global(&desired).await?;
        }
        ShadowAction::Update => {
            if let Some(actual) = &existing {
                info!(shadow = %host_name, "Updating priority class shadow");
                ctx.host.replace_global(&overlay(&desired, actual)?).await?;
            }
        }
        ShadowAction::InSync => debug!(shadow = %host_name, "Priority class up to date"),
    }

    if let Some(patch) = tracking_patch(meta) {
        ctx.virt
            .merge_patch_global::<PriorityClass>(&name, &patch)
            .await?;
    }
    Ok(())
}

async fn reconcile<V, H>(class: Arc<PriorityClass>, ctx: Arc<SyncContext<V, H>>) -> Result<Action, SyncError>
where
    V: ClusterClient + 'static,
    H: ClusterClient + 'static,
{
    let result = sync_priority_class(ctx.as_ref(), class.as_ref()).await;
    ctx.metrics.record("PriorityClass", result.is_ok());
    result.map(|()| Action::await_change())
}

fn error_policy<V, H>(class: Arc<PriorityClass>, error: &SyncError, _ctx: Arc<SyncContext<V, H>>) -> Action {
    requeue_after_error("PriorityClass", &class.name_any(), error)
}

pub async fn run<V, H>(virtual_api: Api<PriorityClass>, ctx: Arc<SyncContext<V, H>>)
where
    V: ClusterClient + 'static,
    H: ClusterClient + 'static,
{
    info!("Starting priority class syncer");
    Controller::new(virtual_api, watcher::Config::default())
        .with_config(runtime_config())
        .run(reconcile::<V, H>, error_policy::<V, H>, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = %e, "Priority class syncer error");
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn class(name: &str, value: i32, global_default: bool) -> PriorityClass {
        PriorityClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            value,
            global_default: Some(global_default),
            description: Some("batch jobs".to_string()),
            preemption_policy: Some("Never".to_string()),
        }
    }

    #[test]
    fn test_shadow_is_prefixed_and_never_default() {
        let virtual_class = class("batch", 1000, true);
        let key = ShadowKey::of("demo", &virtual_class);
        let shadow = shadow_class(&key, &virtual_class);

        assert_eq!(shadow.metadata.name.as_deref(), Some("k3k-demo-batch"));
        assert_eq!(host_class_name("demo", "batch"), "k3k-demo-batch");
        assert_eq!(shadow.value, 1000);
        assert_eq!(shadow.global_default, Some(false));
        assert_eq!(shadow.preemption_policy.as_deref(), Some("Never"));
        assert!(shadow.metadata.namespace.is_none());
        assert!(!shadow.metadata.annotations.unwrap().contains_key("k3k.io/namespace"));
    }

    #[test]
    fn test_builtin_classes() {
        assert!(is_builtin("system-node-critical"));
        assert!(!is_builtin("batch"));
    }
}
