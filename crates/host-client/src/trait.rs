//! ClusterClient trait for mocking
//!
//! Both the host cluster and a virtual cluster are reached through this trait.
//! The kube-backed [`crate::KubeClusterClient`] implements it for real API
//! servers and [`crate::MockClusterClient`] keeps objects in memory for tests.

use std::fmt::Debug;

use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ClientError;

/// Namespaced object the client can read and write
pub trait NamespacedObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Serialize
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
}

impl<K> NamespacedObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static
{
}

/// Cluster-scoped object the client can read and write
pub trait ClusterScopedObject:
    Resource<DynamicType = (), Scope = ClusterResourceScope>
    + Clone
    + Serialize
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterScopedObject for K where
    K: Resource<DynamicType = (), Scope = ClusterResourceScope>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static
{
}

/// Typed Kubernetes API operations
///
/// Reads return `Ok(None)` for missing objects. Writes on missing objects
/// return [`ClientError::NotFound`], and callers that treat deletion of a
/// missing object as success check [`ClientError::is_not_found`].
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    // Namespaced objects
    async fn get<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>, ClientError>;
    async fn list<K: NamespacedObject>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, ClientError>;
    async fn create<K: NamespacedObject>(&self, namespace: &str, obj: &K) -> Result<K, ClientError>;
    /// Replace the object named by `obj.metadata.name`
    async fn replace<K: NamespacedObject>(&self, namespace: &str, obj: &K) -> Result<K, ClientError>;
    /// JSON merge patch (RFC 7386)
    async fn merge_patch<K: NamespacedObject>(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<K, ClientError>;
    /// JSON merge patch against the status subresource
    async fn merge_patch_status<K: NamespacedObject>(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<K, ClientError>;
    async fn delete<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<(), ClientError>;
    /// Delete with a zero grace period, confirming a graceful deletion already in progress
    async fn force_delete<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<(), ClientError>;
    /// Delete every object matching `label_selector`; matching nothing is not an error
    async fn delete_collection<K: NamespacedObject>(&self, namespace: &str, label_selector: &str) -> Result<(), ClientError>;

    // Cluster-scoped objects
    async fn get_global<K: ClusterScopedObject>(&self, name: &str) -> Result<Option<K>, ClientError>;
    async fn list_global<K: ClusterScopedObject>(&self, label_selector: &str) -> Result<Vec<K>, ClientError>;
    async fn create_global<K: ClusterScopedObject>(&self, obj: &K) -> Result<K, ClientError>;
    async fn replace_global<K: ClusterScopedObject>(&self, obj: &K) -> Result<K, ClientError>;
    async fn merge_patch_global<K: ClusterScopedObject>(&self, name: &str, patch: &serde_json::Value) -> Result<K, ClientError>;
    async fn merge_patch_global_status<K: ClusterScopedObject>(&self, name: &str, patch: &serde_json::Value) -> Result<K, ClientError>;
    async fn delete_global<K: ClusterScopedObject>(&self, name: &str) -> Result<(), ClientError>;

    /// `gitVersion` reported by the API server, e.g. `v1.30.2`
    async fn server_version(&self) -> Result<String, ClientError>;
}
