//! Admin credentials for a virtual cluster.
//!
//! Issues a client certificate from the cluster's client CA and bundles it
//! with the server CA and the externally reachable endpoint.

use std::collections::BTreeMap;
use std::time::Duration;

use crds::Cluster;
use crds::names;
use host_client::ClusterClient;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::ResourceExt;
use pki::{
    ADMIN_COMMON_NAME, BootstrapData, DEFAULT_KUBECONFIG_EXPIRY_DAYS, KeyUsage, KubeconfigDocument,
    RetryConfig, SYSTEM_PRIVILEGED_GROUP, retry_with_backoff_if,
};
use tracing::{info, instrument};

use crate::error::ControllerError;
use crate::exposure;

/// Identity and endpoint options of a generated kubeconfig
#[derive(Debug, Clone)]
pub struct CredentialsRequest {
    pub common_name: String,
    pub organizations: Vec<String>,
    pub alt_names: Vec<String>,
    pub expiry: Duration,
    /// Replaces the endpoint host and is added to the certificate SANs
    pub host_override: Option<String>,
}

impl Default for CredentialsRequest {
    fn default() -> Self {
        Self {
            common_name: ADMIN_COMMON_NAME.to_string(),
            organizations: vec![SYSTEM_PRIVILEGED_GROUP.to_string()],
            alt_names: Vec::new(),
            expiry: pki::days(DEFAULT_KUBECONFIG_EXPIRY_DAYS),
            host_override: None,
        }
    }
}

struct Sources {
    cluster: Cluster,
    bootstrap: BootstrapData,
    service: Service,
}

fn not_found(kind: &str, name: &str) -> ControllerError {
    host_client::ClientError::NotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
    .into()
}

async fn read_sources<C: ClusterClient>(client: &C, namespace: &str, name: &str) -> Result<Sources, ControllerError> {
    let cluster = client
        .get::<Cluster>(namespace, name)
        .await?
        .ok_or_else(|| not_found("Cluster", name))?;

    let token_name = names::token_secret_name(name);
    let secret = client
        .get::<Secret>(namespace, &token_name)
        .await?
        .ok_or_else(|| not_found("Secret", &token_name))?;
    let data: BTreeMap<String, Vec<u8>> = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.0))
        .collect();
    let bootstrap = BootstrapData::from_secret_data(&data)?;

    let service_name = names::service_name(name);
    let service = client
        .get::<Service>(namespace, &service_name)
        .await?
        .ok_or_else(|| not_found("Service", &service_name))?;

    Ok(Sources {
        cluster,
        bootstrap,
        service,
    })
}

/// Host part of an API URL such as `https://10.0.0.1:6443`
fn url_host(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or(rest);
    if let Some(v6) = authority.strip_prefix('[') {
        return v6.split(']').next().unwrap_or(v6);
    }
    authority.split(':').next().unwrap_or(authority)
}

fn load_balancer_ingress(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .find_map(|ingress| ingress.ip.clone().or_else(|| ingress.hostname.clone()))
}

/// Generate an admin kubeconfig for cluster `name`.
///
/// Waits for the Cluster, its token secret and its server Service to exist,
/// retrying only while they are missing. A cluster that never shows up is
/// reported as [`ControllerError::Unavailable`].
#[instrument(skip(client, request, retry))]
pub async fn extract_credentials<C: ClusterClient>(
    client: &C,
    namespace: &str,
    name: &str,
    host_api_url: &str,
    request: &CredentialsRequest,
    retry: &RetryConfig,
) -> Result<KubeconfigDocument, ControllerError> {
    info!("Waiting for cluster to be available");
    let sources = retry_with_backoff_if(retry, "read cluster credentials", ControllerError::is_not_found, || {
        read_sources(client, namespace, name)
    })
    .await
    .map_err(|e| {
        if e.is_not_found() {
            ControllerError::Unavailable(format!("cluster {namespace}/{name}: {e}"))
        } else {
            e
        }
    })?;

    let exposure = sources.cluster.spec.exposure();
    let host = request
        .host_override
        .clone()
        .or_else(|| load_balancer_ingress(&sources.service))
        .unwrap_or_else(|| url_host(host_api_url).to_string());
    let port = exposure::external_server_port(&exposure, Some(&sources.service)).ok_or_else(|| {
        ControllerError::Unavailable(format!("no node port assigned to {}", sources.service.name_any()))
    })?;
    let server_url = format!("https://{host}:{port}");

    let mut alt_names = request.alt_names.clone();
    if let Some(host) = &request.host_override {
        alt_names.push(host.clone());
    }
    let (cert_pem, key_pem) = sources.bootstrap.client_ca.issue(
        &request.common_name,
        &request.organizations,
        &alt_names,
        &[KeyUsage::ClientAuth],
        request.expiry,
    )?;

    info!(server = %server_url, common_name = %request.common_name, "Issued admin credentials");
    Ok(KubeconfigDocument::build(
        name,
        &server_url,
        sources.bootstrap.server_ca.cert_pem(),
        &cert_pem,
        &key_pem,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_cluster;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use crds::{ClusterSpec, ExposeConfig, LoadBalancerConfig, NodePortConfig};
    use host_client::MockClusterClient;
    use k8s_openapi::ByteString;
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use pki::CertificateInfo;

    const NS: &str = "tenant";
    const HOST_API: &str = "https://10.0.0.1:6443";

    fn seed(client: &MockClusterClient, spec: ClusterSpec) -> BootstrapData {
        let cluster = create_test_cluster("demo", NS, spec);
        let bootstrap = BootstrapData::generate().unwrap();
        client.insert(NS, &cluster);
        client.insert(
            NS,
            &Secret {
                metadata: ObjectMeta {
                    name: Some("k3k-demo-token".to_string()),
                    ..Default::default()
                },
                data: Some(
                    bootstrap
                        .to_secret_data()
                        .into_iter()
                        .map(|(k, v)| (k, ByteString(v)))
                        .collect(),
                ),
                ..Default::default()
            },
        );
        let mut service = exposure::server_service("demo", NS, &cluster.spec.exposure());
        if let Some(ports) = service.spec.as_mut().and_then(|s| s.ports.as_mut()) {
            for (port, assigned) in ports.iter_mut().zip([31443, 32379]) {
                port.node_port.get_or_insert(assigned);
            }
        }
        client.insert(NS, &service);
        bootstrap
    }

    fn client_cert(doc: &KubeconfigDocument) -> CertificateInfo {
        let pem = STANDARD
            .decode(&doc.users[0].user.client_certificate_data)
            .unwrap();
        CertificateInfo::from_pem(&String::from_utf8(pem).unwrap()).unwrap()
    }

    #[test]
    fn test_url_host() {
        assert_eq!(url_host("https://10.0.0.1:6443"), "10.0.0.1");
        assert_eq!(url_host("https://api.example.com"), "api.example.com");
        assert_eq!(url_host("https://[fd00::1]:6443/"), "fd00::1");
    }

    #[tokio::test]
    async fn test_defaults_use_host_api_address() {
        let client = MockClusterClient::new();
        let bootstrap = seed(&client, ClusterSpec::default());

        let doc = extract_credentials(
            &client,
            NS,
            "demo",
            HOST_API,
            &CredentialsRequest::default(),
            &RetryConfig::fast(3),
        )
        .await
        .unwrap();

        assert_eq!(doc.server(), Some("https://10.0.0.1:443"));
        assert_eq!(doc.current_context, "demo");
        let ca = STANDARD
            .decode(&doc.clusters[0].cluster.certificate_authority_data)
            .unwrap();
        assert_eq!(String::from_utf8(ca).unwrap(), bootstrap.server_ca.cert_pem());

        let cert = client_cert(&doc);
        assert_eq!(cert.common_name, "system:admin");
        assert_eq!(cert.organizations, vec!["system:masters".to_string()]);
        assert_eq!(cert.lifetime_secs(), 356 * 24 * 60 * 60);
    }

    #[tokio::test]
    async fn test_override_replaces_host_and_extends_sans() {
        let client = MockClusterClient::new();
        seed(&client, ClusterSpec::default());
        let request = CredentialsRequest {
            alt_names: vec!["internal.example".to_string()],
            host_override: Some("k3k.example.com".to_string()),
            ..Default::default()
        };

        let doc = extract_credentials(&client, NS, "demo", HOST_API, &request, &RetryConfig::fast(3))
            .await
            .unwrap();

        assert_eq!(doc.server(), Some("https://k3k.example.com:443"));
        let cert = client_cert(&doc);
        assert!(cert.alt_names.contains(&"internal.example".to_string()));
        assert!(cert.alt_names.contains(&"k3k.example.com".to_string()));
    }

    #[tokio::test]
    async fn test_node_port_uses_assigned_port() {
        let client = MockClusterClient::new();
        seed(
            &client,
            ClusterSpec {
                expose: Some(ExposeConfig {
                    node_port: Some(NodePortConfig::default()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        let doc = extract_credentials(
            &client,
            NS,
            "demo",
            HOST_API,
            &CredentialsRequest::default(),
            &RetryConfig::fast(3),
        )
        .await
        .unwrap();
        assert_eq!(doc.server(), Some("https://10.0.0.1:31443"));
    }

    #[tokio::test]
    async fn test_load_balancer_ingress_wins_over_host_api() {
        let client = MockClusterClient::new();
        seed(
            &client,
            ClusterSpec {
                expose: Some(ExposeConfig {
                    load_balancer: Some(LoadBalancerConfig::default()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        let mut service: Service = client.peek(NS, "k3k-demo-service").unwrap();
        service.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some("203.0.113.7".to_string()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        client.insert(NS, &service);

        let doc = extract_credentials(
            &client,
            NS,
            "demo",
            HOST_API,
            &CredentialsRequest::default(),
            &RetryConfig::fast(3),
        )
        .await
        .unwrap();
        assert_eq!(doc.server(), Some("https://203.0.113.7:443"));
    }

    #[tokio::test]
    async fn test_retries_until_cluster_appears() {
        let client = MockClusterClient::new();
        seed(&client, ClusterSpec::default());
        client.hide_next_reads(2);

        let doc = extract_credentials(
            &client,
            NS,
            "demo",
            HOST_API,
            &CredentialsRequest::default(),
            &RetryConfig::fast(5),
        )
        .await
        .unwrap();
        assert_eq!(doc.current_context, "demo");
    }

    #[tokio::test]
    async fn test_missing_cluster_is_unavailable() {
        let client = MockClusterClient::new();
        let err = extract_credentials(
            &client,
            NS,
            "ghost",
            HOST_API,
            &CredentialsRequest::default(),
            &RetryConfig::fast(2),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ControllerError::Unavailable(_)));
        assert!(!err.is_not_found());
    }
}
