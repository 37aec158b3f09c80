//! Mock ClusterClient for unit testing
//!
//! Objects are stored as JSON keyed by kind, namespace and name. Every write
//! is appended to an operation log so tests can assert both the number and
//! the order of API calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::client_trait::{ClusterClient, ClusterScopedObject, NamespacedObject};
use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ObjectKey {
    kind: String,
    namespace: String,
    name: String,
}

/// In-memory [`ClusterClient`]
#[derive(Debug, Clone)]
pub struct MockClusterClient {
    objects: Arc<Mutex<HashMap<ObjectKey, Value>>>,
    operations: Arc<Mutex<Vec<String>>>,
    hidden_reads: Arc<AtomicUsize>,
    next_version: Arc<AtomicU64>,
    server_version: Arc<Mutex<String>>,
}

impl Default for MockClusterClient {
    fn default() -> Self {
        Self::new()
    }
}

fn key<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> ObjectKey {
    ObjectKey {
        kind: K::kind(&()).to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn labels_match(obj: &Value, selector: &str) -> bool {
    let labels = obj
        .pointer("/metadata/labels")
        .and_then(Value::as_object);
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| {
            let (k, v) = term.split_once('=').unwrap_or((term, ""));
            labels
                .and_then(|l| l.get(k))
                .and_then(Value::as_str)
                .is_some_and(|actual| actual == v)
        })
}

fn has_finalizers(obj: &Value) -> bool {
    obj.pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

fn is_terminating(obj: &Value) -> bool {
    obj.pointer("/metadata/deletionTimestamp")
        .is_some_and(|t| !t.is_null())
}

impl MockClusterClient {
    /// Create an empty mock reporting `v1.30.2` as the server version
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: Arc::new(Mutex::new(HashMap::new())),
            operations: Arc::new(Mutex::new(Vec::new())),
            hidden_reads: Arc::new(AtomicUsize::new(0)),
            next_version: Arc::new(AtomicU64::new(1)),
            server_version: Arc::new(Mutex::new("v1.30.2".to_string())),
        }
    }

    pub fn set_server_version(&self, version: &str) {
        *self.server_version.lock().unwrap() = version.to_string();
    }

    /// Store an object without recording a write (for test setup)
    pub fn insert<K: NamespacedObject>(&self, namespace: &str, obj: &K) {
        let name = obj.meta().name.clone().unwrap_or_default();
        let value = self.stamp(serde_json::to_value(obj).unwrap(), namespace, true);
        self.objects
            .lock()
            .unwrap()
            .insert(key::<K>(namespace, &name), value);
    }

    /// Store a cluster-scoped object without recording a write
    pub fn insert_global<K: ClusterScopedObject>(&self, obj: &K) {
        let name = obj.meta().name.clone().unwrap_or_default();
        let value = self.stamp(serde_json::to_value(obj).unwrap(), "", true);
        self.objects.lock().unwrap().insert(key::<K>("", &name), value);
    }

    /// Read an object without recording anything
    #[must_use]
    pub fn peek<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&key::<K>(namespace, name))
            .cloned()
            .map(|v| serde_json::from_value(v).unwrap())
    }

    #[must_use]
    pub fn peek_global<K: ClusterScopedObject>(&self, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&key::<K>("", name))
            .cloned()
            .map(|v| serde_json::from_value(v).unwrap())
    }

    /// Number of stored objects of kind `K`
    #[must_use]
    pub fn count<K: Resource<DynamicType = ()>>(&self) -> usize {
        let kind = K::kind(&());
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.kind == kind)
            .count()
    }

    /// Make the next `n` reads report the object as missing
    pub fn hide_next_reads(&self, n: usize) {
        self.hidden_reads.store(n, Ordering::SeqCst);
    }

    /// Writes recorded so far, e.g. `create Secret ns/name`
    #[must_use]
    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }

    #[must_use]
    pub fn write_count(&self) -> usize {
        self.operations.lock().unwrap().len()
    }

    pub fn clear_operations(&self) {
        self.operations.lock().unwrap().clear();
    }

    fn record(&self, op: &str, key: &ObjectKey) {
        let target = if key.namespace.is_empty() {
            key.name.clone()
        } else {
            format!("{}/{}", key.namespace, key.name)
        };
        self.operations
            .lock()
            .unwrap()
            .push(format!("{op} {} {target}", key.kind));
    }

    fn take_hidden_read(&self) -> bool {
        self.hidden_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn stamp(&self, mut value: Value, namespace: &str, fresh: bool) -> Value {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
            if !namespace.is_empty() {
                meta.insert("namespace".to_string(), json!(namespace));
            }
            if fresh && meta.get("uid").is_none_or(Value::is_null) {
                meta.insert("uid".to_string(), json!(format!("uid-{version}")));
            }
            meta.insert("resourceVersion".to_string(), json!(version.to_string()));
        }
        value
    }

    fn read<K: DeserializeOwned>(&self, key: &ObjectKey) -> Result<Option<K>, ClientError> {
        if self.take_hidden_read() {
            return Ok(None);
        }
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(ClientError::from)
    }

    fn write_new<K: Serialize + DeserializeOwned>(&self, key: ObjectKey, obj: &K) -> Result<K, ClientError> {
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(ClientError::Conflict {
                kind: key.kind,
                name: key.name,
                message: "already exists".to_string(),
            });
        }
        let value = self.stamp(serde_json::to_value(obj)?, &key.namespace, true);
        self.record("create", &key);
        objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    fn write_existing<K: Serialize + DeserializeOwned>(&self, key: ObjectKey, obj: &K) -> Result<K, ClientError> {
        let mut objects = self.objects.lock().unwrap();
        let Some(current) = objects.get(&key) else {
            return Err(ClientError::NotFound { kind: key.kind, name: key.name });
        };
        let mut value = serde_json::to_value(obj)?;
        let sent_version = value.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        let stored_version = current.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        if sent_version.is_some() && sent_version != stored_version {
            return Err(ClientError::Conflict {
                kind: key.kind,
                name: key.name,
                message: "resourceVersion mismatch".to_string(),
            });
        }
        if let (Some(uid), Some(meta)) = (
            current.pointer("/metadata/uid").cloned(),
            value.get_mut("metadata").and_then(Value::as_object_mut),
        ) {
            meta.insert("uid".to_string(), uid);
        }
        let value = self.stamp(value, &key.namespace, false);
        self.record("replace", &key);
        objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    fn patch_existing<K: DeserializeOwned>(&self, op: &str, key: ObjectKey, patch: &Value) -> Result<K, ClientError> {
        let mut objects = self.objects.lock().unwrap();
        let Some(current) = objects.get(&key).cloned() else {
            return Err(ClientError::NotFound { kind: key.kind, name: key.name });
        };
        let mut doc = current;
        json_patch::merge(&mut doc, patch);
        let doc = self.stamp(doc, &key.namespace, false);
        self.record(op, &key);
        // A terminating object goes away once its last finalizer is removed
        if is_terminating(&doc) && !has_finalizers(&doc) {
            objects.remove(&key);
        } else {
            objects.insert(key, doc.clone());
        }
        Ok(serde_json::from_value(doc)?)
    }

    fn list_in<K: Resource<DynamicType = ()> + DeserializeOwned>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, ClientError> {
        let kind = K::kind(&());
        let objects = self.objects.lock().unwrap();
        let sorted: BTreeMap<_, _> = objects
            .iter()
            .filter(|(k, v)| k.kind == kind && k.namespace == namespace && labels_match(v, label_selector))
            .collect();
        sorted
            .into_values()
            .map(|v| serde_json::from_value(v.clone()).map_err(ClientError::from))
            .collect()
    }

    fn remove(&self, op: &str, key: ObjectKey) -> Result<(), ClientError> {
        let mut objects = self.objects.lock().unwrap();
        let Some(current) = objects.get_mut(&key) else {
            return Err(ClientError::NotFound { kind: key.kind, name: key.name });
        };
        self.record(op, &key);
        if has_finalizers(current) {
            if let Some(meta) = current.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.insert(
                    "deletionTimestamp".to_string(),
                    json!(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
                );
            }
        } else {
            objects.remove(&key);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterClient for MockClusterClient {
    async fn get<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>, ClientError> {
        self.read(&key::<K>(namespace, name))
    }

    async fn list<K: NamespacedObject>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, ClientError> {
        self.list_in::<K>(namespace, label_selector)
    }

    async fn create<K: NamespacedObject>(&self, namespace: &str, obj: &K) -> Result<K, ClientError> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.write_new(key::<K>(namespace, &name), obj)
    }

    async fn replace<K: NamespacedObject>(&self, namespace: &str, obj: &K) -> Result<K, ClientError> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.write_existing(key::<K>(namespace, &name), obj)
    }

    async fn merge_patch<K: NamespacedObject>(&self, namespace: &str, name: &str, patch: &Value) -> Result<K, ClientError> {
        self.patch_existing("patch", key::<K>(namespace, name), patch)
    }

    async fn merge_patch_status<K: NamespacedObject>(&self, namespace: &str, name: &str, patch: &Value) -> Result<K, ClientError> {
        self.patch_existing("patch-status", key::<K>(namespace, name), patch)
    }

    async fn delete<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.remove("delete", key::<K>(namespace, name))
    }

    async fn force_delete<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.remove("force-delete", key::<K>(namespace, name))
    }

    async fn delete_collection<K: NamespacedObject>(&self, namespace: &str, label_selector: &str) -> Result<(), ClientError> {
        let kind = K::kind(&()).to_string();
        self.operations
            .lock()
            .unwrap()
            .push(format!("delete-collection {kind} {namespace} {label_selector}"));
        self.objects
            .lock()
            .unwrap()
            .retain(|k, v| !(k.kind == kind && k.namespace == namespace && labels_match(v, label_selector)));
        Ok(())
    }

    async fn get_global<K: ClusterScopedObject>(&self, name: &str) -> Result<Option<K>, ClientError> {
        self.read(&key::<K>("", name))
    }

    async fn list_global<K: ClusterScopedObject>(&self, label_selector: &str) -> Result<Vec<K>, ClientError> {
        self.list_in::<K>("", label_selector)
    }

    async fn create_global<K: ClusterScopedObject>(&self, obj: &K) -> Result<K, ClientError> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.write_new(key::<K>("", &name), obj)
    }

    async fn replace_global<K: ClusterScopedObject>(&self, obj: &K) -> Result<K, ClientError> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.write_existing(key::<K>("", &name), obj)
    }

    async fn merge_patch_global<K: ClusterScopedObject>(&self, name: &str, patch: &Value) -> Result<K, ClientError> {
        self.patch_existing("patch", key::<K>("", name), patch)
    }

    async fn merge_patch_global_status<K: ClusterScopedObject>(&self, name: &str, patch: &Value) -> Result<K, ClientError> {
        self.patch_existing("patch-status", key::<K>("", name), patch)
    }

    async fn delete_global<K: ClusterScopedObject>(&self, name: &str) -> Result<(), ClientError> {
        self.remove("delete", key::<K>("", name))
    }

    async fn server_version(&self) -> Result<String, ClientError> {
        Ok(self.server_version.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
    use k8s_openapi::api::scheduling::v1::PriorityClass;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn secret(name: &str, labels: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_get_and_conflict() {
        let client = MockClusterClient::new();
        let created = client.create("ns", &secret("a", &[])).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert_eq!(created.metadata.namespace.as_deref(), Some("ns"));

        let fetched: Option<Secret> = client.get("ns", "a").await.unwrap();
        assert!(fetched.is_some());

        let err = client.create("ns", &secret("a", &[])).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(client.write_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_replace_conflicts() {
        let client = MockClusterClient::new();
        let first = client.create("ns", &secret("a", &[])).await.unwrap();
        client.replace("ns", &first).await.unwrap();
        assert!(client.replace("ns", &first).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_delete_collection_by_label() {
        let client = MockClusterClient::new();
        client.insert("ns", &secret("a", &[("cluster", "x"), ("role", "server")]));
        client.insert("ns", &secret("b", &[("cluster", "x")]));
        client.insert("ns", &secret("c", &[("cluster", "y"), ("role", "server")]));

        client
            .delete_collection::<Secret>("ns", "cluster=x,role=server")
            .await
            .unwrap();

        let left: Vec<Secret> = client.list("ns", "").await.unwrap();
        let names: Vec<_> = left.iter().filter_map(|s| s.metadata.name.clone()).collect();
        assert_eq!(names, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(client.count::<PersistentVolumeClaim>(), 0);
    }

    #[tokio::test]
    async fn test_finalizers_delay_removal() {
        let client = MockClusterClient::new();
        let mut s = secret("a", &[]);
        s.metadata.finalizers = Some(vec!["k3k.io/shadow-sync".to_string()]);
        client.insert("ns", &s);

        client.delete::<Secret>("ns", "a").await.unwrap();
        let terminating: Secret = client.peek("ns", "a").unwrap();
        assert!(terminating.metadata.deletion_timestamp.is_some());

        client
            .merge_patch::<Secret>("ns", "a", &json!({"metadata": {"finalizers": null}}))
            .await
            .unwrap();
        assert!(client.peek::<Secret>("ns", "a").is_none());
    }

    #[tokio::test]
    async fn test_hidden_reads() {
        let client = MockClusterClient::new();
        client.insert("ns", &secret("a", &[]));
        client.hide_next_reads(1);
        assert!(client.get::<Secret>("ns", "a").await.unwrap().is_none());
        assert!(client.get::<Secret>("ns", "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cluster_scoped_objects() {
        let client = MockClusterClient::new();
        let pc = PriorityClass {
            metadata: ObjectMeta {
                name: Some("k3k-c-high".to_string()),
                ..Default::default()
            },
            value: 1000,
            ..Default::default()
        };
        client.create_global(&pc).await.unwrap();
        let fetched: PriorityClass = client.get_global("k3k-c-high").await.unwrap().unwrap();
        assert_eq!(fetched.value, 1000);
        client.delete_global::<PriorityClass>("k3k-c-high").await.unwrap();
        assert!(client.delete_global::<PriorityClass>("k3k-c-high").await.unwrap_err().is_not_found());
    }
}
