//! Cluster deletion, optionally keeping the data needed to recreate it.

use crds::names::{self, CLUSTER_INVALID_NAME, SERVER_ROLE};
use crds::{Cluster, ValidationError};
use host_client::{ClusterClient, NamespacedObject};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use kube::{Resource, ResourceExt};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::error::ControllerError;
use crate::ownership::{DeletionPlan, ObjectRef, OwnershipGraph};

/// Delete cluster `name`.
///
/// With `keep_data` the token secret, the webhook secret and the server
/// volumes are released from the Cluster first so garbage collection leaves
/// them behind. Otherwise the server volumes are deleted before the Cluster.
/// Objects that are already gone count as deleted.
#[instrument(skip(client))]
pub async fn delete_cluster<C: ClusterClient>(
    client: &C,
    namespace: &str,
    name: &str,
    keep_data: bool,
) -> Result<(), ControllerError> {
    if name == CLUSTER_INVALID_NAME {
        return Err(ValidationError::InvalidName(name.to_string()).into());
    }

    if keep_data {
        release_data(client, namespace, name).await?;
    } else {
        let selector = names::label_selector(&names::role_labels(name, SERVER_ROLE));
        match client
            .delete_collection::<PersistentVolumeClaim>(namespace, &selector)
            .await
        {
            Ok(()) => info!(selector = %selector, "Deleted server volumes"),
            Err(e) if e.is_not_found() => warn!(selector = %selector, "No server volumes to delete"),
            Err(e) => return Err(e.into()),
        }
    }

    match client.delete::<Cluster>(namespace, name).await {
        Ok(()) => info!("Cluster deleted"),
        Err(e) if e.is_not_found() => warn!("Cluster already deleted"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn retained(obj: &ObjectRef, token: &str, webhook: &str) -> bool {
    match obj.kind.as_str() {
        "Secret" => obj.name == token || obj.name == webhook,
        "PersistentVolumeClaim" => true,
        _ => false,
    }
}

async fn release_data<C: ClusterClient>(client: &C, namespace: &str, name: &str) -> Result<(), ControllerError> {
    let token = names::token_secret_name(name);
    let webhook = names::webhook_secret_name(name);

    let mut graph = OwnershipGraph::new();
    let mut secrets = Vec::new();
    for secret_name in [&token, &webhook] {
        match client.get::<Secret>(namespace, secret_name).await? {
            Some(secret) => {
                graph.add(&secret);
                secrets.push(secret);
            }
            None => warn!(secret = %secret_name, "Secret not found, nothing to keep"),
        }
    }
    let selector = names::label_selector(&names::role_labels(name, SERVER_ROLE));
    let volumes = client
        .list::<PersistentVolumeClaim>(namespace, &selector)
        .await?;
    for pvc in &volumes {
        graph.add(pvc);
    }

    let owner = ObjectRef::new(Cluster::kind(&()), name);
    let plan = DeletionPlan::for_owner(&graph, &owner, |obj| retained(obj, &token, &webhook));
    for obj in &plan.orphan {
        if let Some(secret) = secrets.iter().find(|s| ObjectRef::of(*s) == *obj) {
            release(client, namespace, secret, &owner).await?;
        } else if let Some(pvc) = volumes.iter().find(|p| ObjectRef::of(*p) == *obj) {
            release(client, namespace, pvc, &owner).await?;
        }
    }
    Ok(())
}

/// Drop the owner references pointing at `owner`
async fn release<C: ClusterClient, K: NamespacedObject>(
    client: &C,
    namespace: &str,
    obj: &K,
    owner: &ObjectRef,
) -> Result<(), ControllerError> {
    let remaining: Vec<_> = obj
        .owner_references()
        .iter()
        .filter(|r| !(r.kind == owner.kind && r.name == owner.name))
        .cloned()
        .collect();
    let refs = if remaining.is_empty() {
        Value::Null
    } else {
        serde_json::to_value(&remaining)?
    };

    info!(object = %ObjectRef::of(obj), "Releasing object from its cluster");
    client
        .merge_patch::<K>(namespace, &obj.name_any(), &json!({ "metadata": { "ownerReferences": refs } }))
        .await?;
    Ok(())
}
