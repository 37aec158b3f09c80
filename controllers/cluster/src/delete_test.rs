//! Unit tests for cluster deletion

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::delete::delete_cluster;
    use crate::error::ControllerError;
    use crate::test_utils::{create_test_cluster, test_owner_reference};
    use crds::names;
    use crds::{Cluster, ClusterSpec, ValidationError};
    use host_client::MockClusterClient;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    const NS: &str = "tenant";

    fn owned_meta(name: &str, labels: BTreeMap<String, String>, owners: Vec<OwnerReference>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            labels: Some(labels),
            owner_references: Some(owners),
            ..Default::default()
        }
    }

    /// A cluster with its token secret, webhook secret and two server volumes
    fn seed(client: &MockClusterClient, name: &str) -> Cluster {
        let cluster = create_test_cluster(name, NS, ClusterSpec::default());
        let owner = test_owner_reference(&cluster);
        client.insert(NS, &cluster);
        for secret in [names::token_secret_name(name), names::webhook_secret_name(name)] {
            client.insert(
                NS,
                &Secret {
                    metadata: owned_meta(&secret, names::cluster_labels(name), vec![owner.clone()]),
                    ..Default::default()
                },
            );
        }
        for ordinal in 0..2 {
            client.insert(
                NS,
                &PersistentVolumeClaim {
                    metadata: owned_meta(
                        &names::server_pvc_name(name, ordinal),
                        names::role_labels(name, names::SERVER_ROLE),
                        vec![owner.clone()],
                    ),
                    ..Default::default()
                },
            );
        }
        cluster
    }

    #[tokio::test]
    async fn test_delete_removes_volumes_before_cluster() {
        let client = MockClusterClient::new();
        seed(&client, "demo");

        delete_cluster(&client, NS, "demo", false).await.unwrap();

        assert_eq!(
            client.operations(),
            vec![
                "delete-collection PersistentVolumeClaim tenant cluster=demo,role=server".to_string(),
                "delete Cluster tenant/demo".to_string(),
            ]
        );
        assert_eq!(client.count::<PersistentVolumeClaim>(), 0);
        assert!(client.peek::<Cluster>(NS, "demo").is_none());
    }

    #[tokio::test]
    async fn test_keep_data_releases_secrets_and_volumes() {
        let client = MockClusterClient::new();
        seed(&client, "demo");

        delete_cluster(&client, NS, "demo", true).await.unwrap();

        let ops = client.operations();
        assert_eq!(ops.last().map(String::as_str), Some("delete Cluster tenant/demo"));
        assert!(ops.iter().all(|op| !op.starts_with("delete-collection")));

        for secret in ["k3k-demo-token", "k3k-demo-webhook"] {
            let kept: Secret = client.peek(NS, secret).unwrap();
            assert!(kept.metadata.owner_references.unwrap_or_default().is_empty(), "{secret} still owned");
        }
        let volumes: PersistentVolumeClaim = client
            .peek(NS, &names::server_pvc_name("demo", 1))
            .unwrap();
        assert!(volumes.metadata.owner_references.unwrap_or_default().is_empty());
        assert_eq!(client.count::<PersistentVolumeClaim>(), 2);
    }

    #[tokio::test]
    async fn test_keep_data_preserves_foreign_owners() {
        let client = MockClusterClient::new();
        let cluster = seed(&client, "demo");
        let foreign = OwnerReference {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            name: "keeper".to_string(),
            uid: "uid-keeper".to_string(),
            ..Default::default()
        };
        client.insert(
            NS,
            &Secret {
                metadata: owned_meta(
                    "k3k-demo-token",
                    names::cluster_labels("demo"),
                    vec![test_owner_reference(&cluster), foreign.clone()],
                ),
                ..Default::default()
            },
        );

        delete_cluster(&client, NS, "demo", true).await.unwrap();

        let kept: Secret = client.peek(NS, "k3k-demo-token").unwrap();
        assert_eq!(kept.metadata.owner_references, Some(vec![foreign]));
    }

    #[tokio::test]
    async fn test_keep_data_tolerates_missing_webhook_secret() {
        let client = MockClusterClient::new();
        let cluster = create_test_cluster("demo", NS, ClusterSpec::default());
        client.insert(NS, &cluster);
        client.insert(
            NS,
            &Secret {
                metadata: owned_meta(
                    "k3k-demo-token",
                    names::cluster_labels("demo"),
                    vec![test_owner_reference(&cluster)],
                ),
                ..Default::default()
            },
        );

        delete_cluster(&client, NS, "demo", true).await.unwrap();
        assert!(client.peek::<Secret>(NS, "k3k-demo-token").is_some());
        assert!(client.peek::<Cluster>(NS, "demo").is_none());
    }

    #[tokio::test]
    async fn test_missing_cluster_is_not_an_error() {
        let client = MockClusterClient::new();
        delete_cluster(&client, NS, "ghost", false).await.unwrap();
    }

    #[tokio::test]
    async fn test_reserved_name_is_rejected() {
        let client = MockClusterClient::new();
        let err = delete_cluster(&client, NS, "system", false).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Validation(ValidationError::InvalidName(ref n)) if n == "system"
        ));
        assert!(client.operations().is_empty());
    }
}
