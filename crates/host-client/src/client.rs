//! kube-backed [`ClusterClient`]

use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::debug;

use crate::client_trait::{ClusterClient, ClusterScopedObject, NamespacedObject};
use crate::error::ClientError;

/// [`ClusterClient`] talking to a real API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Underlying kube client, for watches and subresources
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }

    fn namespaced<K: NamespacedObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn global<K: ClusterScopedObject>(&self) -> Api<K> {
        Api::all(self.client.clone())
    }
}

fn kind_of<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).to_string()
}

fn name_of<K: Resource>(obj: &K) -> Result<String, ClientError> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| ClientError::InvalidObject("object has no metadata.name".to_string()))
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>, ClientError> {
        self.namespaced::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| ClientError::from_kube(&kind_of::<K>(), name, e))
    }

    async fn list<K: NamespacedObject>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, ClientError> {
        let params = ListParams::default().labels(label_selector);
        let list = self.namespaced::<K>(namespace).list(&params).await?;
        Ok(list.items)
    }

    async fn create<K: NamespacedObject>(&self, namespace: &str, obj: &K) -> Result<K, ClientError> {
        let name = name_of(obj)?;
        debug!(kind = %kind_of::<K>(), namespace = %namespace, name = %name, "Creating object");
        self.namespaced::<K>(namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| ClientError::from_kube(&kind_of::<K>(), &name, e))
    }

    async fn replace<K: NamespacedObject>(&self, namespace: &str, obj: &K) -> Result<K, ClientError> {
        let name = name_of(obj)?;
        debug!(kind = %kind_of::<K>(), namespace = %namespace, name = %name, "Replacing object");
        self.namespaced::<K>(namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| ClientError::from_kube(&kind_of::<K>(), &name, e))
    }

    async fn merge_patch<K: NamespacedObject>(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<K, ClientError> {
        self.namespaced::<K>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| ClientError::from_kube(&kind_of::<K>(), name, e))
    }

    async fn merge_patch_status<K: NamespacedObject>(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<K, ClientError> {
        self.namespaced::<K>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| ClientError::from_kube(&kind_of::<K>(), name, e))
    }

    async fn delete<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        debug!(kind = %kind_of::<K>(), namespace = %namespace, name = %name, "Deleting object");
        self.namespaced::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| ClientError::from_kube(&kind_of::<K>(), name, e))
    }

    async fn force_delete<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        debug!(kind = %kind_of::<K>(), namespace = %namespace, name = %name, "Force deleting object");
        self.namespaced::<K>(namespace)
            .delete(name, &DeleteParams::default().grace_period(0))
            .await
            .map(|_| ())
            .map_err(|e| ClientError::from_kube(&kind_of::<K>(), name, e))
    }

    async fn delete_collection<K: NamespacedObject>(&self, namespace: &str, label_selector: &str) -> Result<(), ClientError> {
        debug!(kind = %kind_of::<K>(), namespace = %namespace, selector = %label_selector, "Deleting collection");
        self.namespaced::<K>(namespace)
            .delete_collection(&DeleteParams::default(), &ListParams::default().labels(label_selector))
            .await
            .map(|_| ())
            .map_err(|e| ClientError::from_kube(&kind_of::<K>(), label_selector, e))
    }

    async fn get_global<K: ClusterScopedObject>(&self, name: &str) -> Result<Option<K>, ClientError> {
        self.global::<K>()
            .get_opt(name)
            .await
            .map_err(|e| ClientError::from_kube(&kind_of::<K>(), name, e))
    }

    async fn list_global<K: ClusterScopedObject>(&self, label_selector: &str) -> Result<Vec<K>, ClientError> {
        let params = ListParams::default().labels(label_selector);
        let list = self.global::<K>().list(&params).await?;
        Ok(list.items)
    }

    async fn create_global<K: ClusterScopedObject>(&self, obj: &K) -> Result<K, ClientError> {
        let name = name_of(obj)?;
        self.global::<K>()
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| ClientError::from_kube(&kind_of::<K>(), &name, e))
    }

    async fn replace_global<K: ClusterScopedObject>(&self, obj: &K) -> Result<K, ClientError> {
        let name = obj.name_any();
        self.global::<K>()
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| ClientError::from_kube(&kind_of::<K>(), &name, e))
    }

    async fn merge_patch_global<K: ClusterScopedObject>(&self, name: &str, patch: &serde_json::Value) -> Result<K, ClientError> {
        self.global::<K>()
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| ClientError::from_kube(&kind_of::<K>(), name, e))
    }

    async fn merge_patch_global_status<K: ClusterScopedObject>(&self, name: &str, patch: &serde_json::Value) -> Result<K, ClientError> {
        self.global::<K>()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| ClientError::from_kube(&kind_of::<K>(), name, e))
    }

    async fn delete_global<K: ClusterScopedObject>(&self, name: &str) -> Result<(), ClientError> {
        self.global::<K>()
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| ClientError::from_kube(&kind_of::<K>(), name, e))
    }

    async fn server_version(&self) -> Result<String, ClientError> {
        Ok(self.client.apiserver_version().await?.git_version)
    }
}
