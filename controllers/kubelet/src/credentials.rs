//! API clients and TLS material of the bridge.
//!
//! The virtual cluster is reached either through an explicit kubeconfig or
//! with an admin certificate issued from the bootstrap CA material. The same
//! bootstrap data signs the kubelet and webhook serving certificates.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crds::Cluster;
use crds::names;
use host_client::ClusterClient;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource};
use pki::{
    ADMIN_COMMON_NAME, BootstrapData, BootstrapDecoder, DEFAULT_KUBECONFIG_EXPIRY_DAYS, KeyUsage, KubeconfigDocument,
    RetryConfig, SYSTEM_PRIVILEGED_GROUP, retry_with_backoff,
};
use tracing::{info, instrument, warn};

use crate::config::KubeletConfig;
use crate::error::KubeletError;

/// Name used for the cluster, user and context of the generated kubeconfig
const KUBECONFIG_NAME: &str = "default";

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";

/// Certificate and key served by a listener, plus the CA its clients trust
#[derive(Clone)]
pub struct ServingMaterial {
    pub cert_pem: String,
    pub key_pem: String,
    /// Issuer of `cert_pem`
    pub ca_pem: String,
}

impl std::fmt::Debug for ServingMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServingMaterial")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish_non_exhaustive()
    }
}

async fn client_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Client, KubeletError> {
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(config)?)
}

/// Host client from `HOST_KUBECONFIG`, in-cluster config otherwise
pub async fn host_client(path: Option<&Path>) -> Result<Client, KubeletError> {
    match path {
        Some(path) => {
            info!(path = %path.display(), "Loading host kubeconfig");
            client_from_kubeconfig(Kubeconfig::read_from(path)?).await
        }
        None => Ok(Client::try_from(Config::infer().await?)?),
    }
}

/// Server service of the virtual cluster as seen from the host namespace
#[must_use]
pub fn bootstrap_endpoint(config: &KubeletConfig) -> String {
    format!("{}.{}", names::service_name(&config.cluster_name), config.cluster_namespace)
}

/// Fetch CA material with the join token, retrying every failure
#[instrument(skip_all, fields(cluster = %config.cluster_name))]
pub async fn decode_bootstrap<D>(decoder: &D, config: &KubeletConfig, retry: &RetryConfig) -> Result<BootstrapData, KubeletError>
where
    D: BootstrapDecoder + ?Sized,
{
    let endpoint = bootstrap_endpoint(config);
    let data = retry_with_backoff(retry, "decode bootstrap", || decoder.decode(&config.token, &endpoint)).await?;
    info!(endpoint = %endpoint, "Decoded bootstrap data");
    Ok(data)
}

/// Admin kubeconfig for the virtual API server
pub fn admin_kubeconfig(config: &KubeletConfig, bootstrap: &BootstrapData) -> Result<KubeconfigDocument, KubeletError> {
    let (cert_pem, key_pem) = bootstrap.client_ca.issue(
        ADMIN_COMMON_NAME,
        &[SYSTEM_PRIVILEGED_GROUP.to_string()],
        &[],
        &[KeyUsage::ClientAuth],
        pki::days(DEFAULT_KUBECONFIG_EXPIRY_DAYS),
    )?;
    let url = format!("https://{}", names::service_name(&config.cluster_name));
    Ok(KubeconfigDocument::build(
        KUBECONFIG_NAME,
        &url,
        bootstrap.server_ca.cert_pem(),
        &cert_pem,
        &key_pem,
    ))
}

/// Virtual cluster client from `VIRT_KUBECONFIG`, or from the bootstrap CA
pub async fn virtual_client(config: &KubeletConfig, bootstrap: &BootstrapData) -> Result<Client, KubeletError> {
    if let Some(path) = &config.virtual_kubeconfig {
        info!(path = %path.display(), "Loading virtual kubeconfig");
        return client_from_kubeconfig(Kubeconfig::read_from(path)?).await;
    }
    let yaml = admin_kubeconfig(config, bootstrap)?.to_yaml()?;
    client_from_kubeconfig(Kubeconfig::from_yaml(&yaml)?).await
}

/// Serving certificate of the kubelet API.
///
/// Valid for the node name, the agent IP and the pod IP.
pub fn kubelet_tls(config: &KubeletConfig, agent_ip: &str, bootstrap: &BootstrapData) -> Result<ServingMaterial, KubeletError> {
    let mut alt_names = vec![config.agent_hostname.clone(), agent_ip.to_string()];
    if let Some(pod_ip) = config.pod_ip {
        alt_names.push(pod_ip.to_string());
    }
    let (cert_pem, key_pem) = bootstrap.server_ca.issue(
        config.node_name(),
        &[],
        &alt_names,
        &[KeyUsage::ServerAuth],
        Duration::ZERO,
    )?;
    Ok(ServingMaterial {
        cert_pem,
        key_pem,
        ca_pem: bootstrap.server_ca.cert_pem().to_string(),
    })
}

/// DNS names and address the webhook certificate must cover
#[must_use]
pub fn webhook_alt_names(config: &KubeletConfig, agent_ip: &str) -> Vec<String> {
    let service = &config.service_name;
    let ns = &config.cluster_namespace;
    vec![
        service.clone(),
        format!("{service}.{ns}"),
        format!("{service}.{ns}.svc"),
        format!("{service}.{ns}.svc.cluster.local"),
        agent_ip.to_string(),
    ]
}

fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    let bytes = secret.data.as_ref()?.get(key)?;
    String::from_utf8(bytes.0.clone()).ok()
}

/// Webhook serving material, created once and kept in the webhook secret
#[instrument(skip_all, fields(cluster = %cluster.metadata.name.as_deref().unwrap_or_default()))]
pub async fn ensure_webhook_secret<H: ClusterClient>(
    host: &H,
    config: &KubeletConfig,
    cluster: &Cluster,
    agent_ip: &str,
    bootstrap: &BootstrapData,
) -> Result<ServingMaterial, KubeletError> {
    let name = names::webhook_secret_name(&config.cluster_name);
    let ca_pem = bootstrap.server_ca.cert_pem().to_string();

    if let Some(secret) = host.get::<Secret>(&config.cluster_namespace, &name).await? {
        if let (Some(cert_pem), Some(key_pem)) = (secret_value(&secret, TLS_CERT_KEY), secret_value(&secret, TLS_KEY_KEY)) {
            return Ok(ServingMaterial { cert_pem, key_pem, ca_pem });
        }
        warn!(secret = %name, "Webhook secret has no certificate, replacing it");
        host.delete::<Secret>(&config.cluster_namespace, &name).await?;
    }

    let (cert_pem, key_pem) = bootstrap.server_ca.issue(
        &config.service_name,
        &[],
        &webhook_alt_names(config, agent_ip),
        &[KeyUsage::ServerAuth],
        Duration::ZERO,
    )?;
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(config.cluster_namespace.clone()),
            labels: Some(names::cluster_labels(&config.cluster_name)),
            owner_references: cluster.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(BTreeMap::from([
            (TLS_CERT_KEY.to_string(), ByteString(cert_pem.clone().into_bytes())),
            (TLS_KEY_KEY.to_string(), ByteString(key_pem.clone().into_bytes())),
        ])),
        ..Default::default()
    };
    host.create(&config.cluster_namespace, &secret).await?;
    info!(secret = %name, "Created webhook secret");
    Ok(ServingMaterial { cert_pem, key_pem, ca_pem })
}

/// Host-side facts the bridge needs before it can start
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub cluster: Cluster,
    /// ClusterIP of the bridge service, advertised as the node address
    pub agent_ip: String,
    /// ClusterIP of the virtual cluster DNS service on the host
    pub dns_ip: String,
}

async fn cluster_ip<H: ClusterClient>(host: &H, namespace: &str, service: &str) -> Result<String, KubeletError> {
    let svc = host
        .get::<k8s_openapi::api::core::v1::Service>(namespace, service)
        .await?
        .ok_or_else(|| KubeletError::MissingDependency(format!("service {namespace}/{service}")))?;
    svc.spec
        .and_then(|s| s.cluster_ip)
        .filter(|ip| !ip.is_empty() && ip != "None")
        .ok_or_else(|| KubeletError::MissingDependency(format!("service {namespace}/{service} has no cluster IP")))
}

/// Reads the agent IP, the DNS IP and the Cluster from the host
pub async fn lookup_cluster<H: ClusterClient>(host: &H, config: &KubeletConfig) -> Result<ClusterInfo, KubeletError> {
    let ns = &config.cluster_namespace;
    let agent_ip = cluster_ip(host, ns, &config.service_name).await?;
    let dns_ip = cluster_ip(host, ns, &names::dns_service_name(&config.cluster_name)).await?;
    let cluster = host
        .get::<Cluster>(ns, &config.cluster_name)
        .await?
        .ok_or_else(|| KubeletError::MissingDependency(format!("cluster {ns}/{}", config.cluster_name)))?;
    Ok(ClusterInfo {
        cluster,
        agent_ip,
        dns_ip,
    })
}

/// Parses `agent_ip`, accepting only literal addresses
pub fn parse_ip(agent_ip: &str) -> Result<IpAddr, KubeletError> {
    agent_ip
        .parse()
        .map_err(|e| KubeletError::MissingDependency(format!("agent IP {agent_ip}: {e}")))
}
