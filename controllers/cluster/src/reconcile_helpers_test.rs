//! Unit tests for reconcile_helpers module

#[cfg(test)]
mod tests {
    use crate::reconcile_helpers::*;
    use crate::test_utils::{create_test_cluster, test_owner_reference};
    use crds::{ClusterPhase, ClusterSpec, ClusterStatus};
    use host_client::MockClusterClient;
    use k8s_openapi::api::core::v1::{Secret, Service, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    fn service(name: &str, type_: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn test_is_subset_ignores_server_defaults() {
        let desired = json!({"spec": {"type": "ClusterIP", "ports": [{"port": 443}]}});
        let actual = json!({"spec": {
            "type": "ClusterIP",
            "clusterIP": "10.0.0.1",
            "ports": [{"port": 443, "protocol": "TCP"}]
        }});
        assert!(is_subset(&desired, &actual));
        assert!(!needs_update(&desired, &actual));
    }

    #[test]
    fn test_is_subset_detects_changes() {
        let desired = json!({"spec": {"ports": [{"port": 443}, {"port": 2379}]}});
        let fewer = json!({"spec": {"ports": [{"port": 443}]}});
        let changed = json!({"spec": {"ports": [{"port": 443}, {"port": 2380}]}});
        assert!(!is_subset(&desired, &fewer));
        assert!(!is_subset(&desired, &changed));
    }

    #[test]
    fn test_needs_update_on_labels_and_owners() {
        let desired = json!({"metadata": {"labels": {"cluster": "a"}, "ownerReferences": [{"uid": "1"}]}});
        let missing_owner = json!({"metadata": {"labels": {"cluster": "a", "extra": "x"}}});
        let complete = json!({"metadata": {"labels": {"cluster": "a", "extra": "x"}, "ownerReferences": [{"uid": "1"}]}});
        assert!(needs_update(&desired, &missing_owner));
        assert!(!needs_update(&desired, &complete));
    }

    #[tokio::test]
    async fn test_ensure_creates_then_leaves_alone() {
        let client = MockClusterClient::new();
        let desired = service("svc", "ClusterIP");

        let (_, applied) = ensure(&client, "ns", &desired).await.unwrap();
        assert_eq!(applied, Applied::Created);

        let (_, applied) = ensure(&client, "ns", &desired).await.unwrap();
        assert_eq!(applied, Applied::Unchanged);
        assert_eq!(client.operations(), vec!["create Service ns/svc"]);
    }

    #[tokio::test]
    async fn test_ensure_replaces_drifted_object_keeping_live_fields() {
        let client = MockClusterClient::new();
        let mut live = service("svc", "ClusterIP");
        live.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.9".to_string());
        client.insert("ns", &live);

        let (replaced, applied) = ensure(&client, "ns", &service("svc", "NodePort")).await.unwrap();
        assert_eq!(applied, Applied::Replaced);
        let spec = replaced.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(client.operations(), vec!["replace Service ns/svc"]);
    }

    #[tokio::test]
    async fn test_ensure_created_never_rebuilds() {
        let client = MockClusterClient::new();
        let build = || {
            Ok(Secret {
                metadata: ObjectMeta {
                    name: Some("tok".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
        };
        let (_, applied) = ensure_created(&client, "ns", "tok", build).await.unwrap();
        assert_eq!(applied, Applied::Created);

        let (_, applied) = ensure_created::<_, Secret, _>(&client, "ns", "tok", || {
            panic!("must not rebuild an existing object")
        })
        .await
        .unwrap();
        assert_eq!(applied, Applied::Unchanged);
        assert_eq!(client.write_count(), 1);
    }

    #[test]
    fn test_status_patch_clears_message() {
        let status = ClusterStatus {
            phase: ClusterPhase::Ready,
            host_version: "v1.30.2-k3s1".to_string(),
            message: None,
        };
        let patch = status_patch(&status);
        assert_eq!(patch["status"]["phase"], "Ready");
        assert!(patch["status"]["message"].is_null());
        assert!(patch["status"].as_object().unwrap().contains_key("message"));
    }

    #[test]
    fn test_status_needs_update() {
        let status = ClusterStatus {
            phase: ClusterPhase::Provisioning,
            ..Default::default()
        };
        assert!(status_needs_update(None, &status));
        assert!(!status_needs_update(Some(&status.clone()), &status));

        let cluster = create_test_cluster("demo", "tenant", ClusterSpec::default());
        assert!(cluster.status.is_none());
        assert_eq!(test_owner_reference(&cluster).kind, "Cluster");
    }
}
