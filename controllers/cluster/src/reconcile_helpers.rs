//! Helper functions for common reconciliation patterns
//!
//! Every generated object goes through [`ensure`]: read, compare the fields the
//! reconciler owns, then create, replace or leave alone.

use crds::{ClusterPhase, ClusterStatus};
pub use host_client::diff::is_subset;
use host_client::{ClusterClient, NamespacedObject};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::ControllerError;

/// Top-level fields compared between desired and live objects
const OWNED_FIELDS: &[&str] = &[
    "/spec",
    "/rules",
    "/subjects",
    "/roleRef",
    "/metadata/labels",
    "/metadata/ownerReferences",
];

/// Outcome of [`ensure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Replaced,
    Unchanged,
}

/// Whether the live object differs from the desired one on an owned field
#[must_use]
pub fn needs_update(desired: &Value, actual: &Value) -> bool {
    OWNED_FIELDS.iter().any(|pointer| {
        let wanted = desired.pointer(pointer).unwrap_or(&Value::Null);
        let live = actual.pointer(pointer).unwrap_or(&Value::Null);
        !is_subset(wanted, live)
    })
}

/// Desired object laid over the live one, keeping server-populated fields
/// such as `resourceVersion` or an allocated `clusterIP`.
pub fn merged_for_replace<K: NamespacedObject>(desired: &K, actual: &K) -> Result<K, ControllerError> {
    Ok(host_client::diff::overlay(desired, actual)?)
}

fn name_of<K: NamespacedObject>(obj: &K) -> Result<String, ControllerError> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| ControllerError::MissingField(format!("{}.metadata.name", K::kind(&()))))
}

/// Create `desired` if missing, replace it when an owned field drifted.
///
/// Returns the live object after the call.
pub async fn ensure<C, K>(client: &C, namespace: &str, desired: &K) -> Result<(K, Applied), ControllerError>
where
    C: ClusterClient,
    K: NamespacedObject,
{
    let name = name_of(desired)?;
    let kind = K::kind(&());

    let Some(actual) = client.get::<K>(namespace, &name).await? else {
        info!(kind = %kind, namespace = %namespace, name = %name, "Creating object");
        let created = client.create(namespace, desired).await?;
        return Ok((created, Applied::Created));
    };

    if !needs_update(&serde_json::to_value(desired)?, &serde_json::to_value(&actual)?) {
        debug!(kind = %kind, namespace = %namespace, name = %name, "Object up to date");
        return Ok((actual, Applied::Unchanged));
    }

    info!(kind = %kind, namespace = %namespace, name = %name, "Object drifted, replacing");
    let merged = merged_for_replace(desired, &actual)?;
    let replaced = client.replace(namespace, &merged).await?;
    Ok((replaced, Applied::Replaced))
}

/// Create the object named `name` once; an existing object is never touched again.
///
/// `build` only runs when the object is missing.
pub async fn ensure_created<C, K, F>(
    client: &C,
    namespace: &str,
    name: &str,
    build: F,
) -> Result<(K, Applied), ControllerError>
where
    C: ClusterClient,
    K: NamespacedObject,
    F: FnOnce() -> Result<K, ControllerError> + Send,
{
    if let Some(existing) = client.get::<K>(namespace, name).await? {
        return Ok((existing, Applied::Unchanged));
    }
    let obj = build()?;
    info!(kind = %K::kind(&()), namespace = %namespace, name = %name, "Creating object");
    Ok((client.create(namespace, &obj).await?, Applied::Created))
}

fn phase_str(phase: ClusterPhase) -> &'static str {
    match phase {
        ClusterPhase::Unknown => "Unknown",
        ClusterPhase::Provisioning => "Provisioning",
        ClusterPhase::Ready => "Ready",
        ClusterPhase::Failed => "Failed",
        ClusterPhase::Terminating => "Terminating",
    }
}

/// Check if a Cluster status needs updating
#[must_use]
pub fn status_needs_update(current: Option<&ClusterStatus>, desired: &ClusterStatus) -> bool {
    current != Some(desired)
}

/// Merge patch body for the status subresource.
///
/// `message` is always present so a stale failure message gets cleared.
#[must_use]
pub fn status_patch(status: &ClusterStatus) -> Value {
    json!({
        "status": {
            "phase": phase_str(status.phase),
            "hostVersion": status.host_version,
            "message": status.message,
        }
    })
}
