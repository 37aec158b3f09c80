use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use cluster_controller::{CredentialsRequest, delete_cluster, extract_credentials};
use host_client::ClusterClient;
use pki::RetryConfig;
use tracing::info;

use crate::cli::GenerateArgs;

/// Delete cluster `namespace/name`; a cluster that is already gone is not an error
pub async fn delete<C: ClusterClient>(client: &C, namespace: &str, name: &str, keep_data: bool) -> Result<()> {
    info!(cluster = %name, namespace = %namespace, keep_data, "Deleting cluster");
    match delete_cluster(client, namespace, name, keep_data).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            info!(cluster = %name, "Cluster already deleted");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn credentials_request(args: &GenerateArgs) -> CredentialsRequest {
    CredentialsRequest {
        common_name: args.cn.clone(),
        organizations: args.orgs.clone(),
        alt_names: args.alt_names.clone(),
        expiry: pki::days(args.expiration_days),
        host_override: args.kubeconfig_server.clone().filter(|s| !s.is_empty()),
    }
}

fn write_kubeconfig(path: &Path, yaml: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(yaml.as_bytes())
        .with_context(|| format!("writing {}", path.display()))
}

/// Issue an admin kubeconfig for cluster `namespace/args.name` and write it out
pub async fn generate<C: ClusterClient>(
    client: &C,
    namespace: &str,
    host_api_url: &str,
    args: &GenerateArgs,
    retry: &RetryConfig,
) -> Result<()> {
    let request = credentials_request(args);
    let kubeconfig = extract_credentials(client, namespace, &args.name, host_api_url, &request, retry)
        .await?;

    let path = args.output_file(namespace);
    write_kubeconfig(&path, &kubeconfig.to_yaml()?)?;
    info!(
        "You can start using the cluster with:\n\n\texport KUBECONFIG={}\n\tkubectl cluster-info\n",
        path.canonicalize().unwrap_or_else(|_| path.clone()).display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Args;
    use clap::Parser;
    use crds::{Cluster, ClusterSpec};
    use host_client::MockClusterClient;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use cluster_controller::exposure;
    use k8s_openapi::ByteString;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use pki::{BootstrapData, CertificateInfo, KubeconfigDocument};
    use std::os::unix::fs::PermissionsExt;

    const NS: &str = "k3k-demo";

    fn seed(client: &MockClusterClient) {
        let mut cluster = Cluster::new("demo", ClusterSpec::default());
        cluster.metadata.namespace = Some(NS.to_string());
        client.insert(NS, &cluster);

        let bootstrap = BootstrapData::generate().unwrap();
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
        client.insert(NS, &exposure::server_service("demo", NS, &cluster.spec.exposure()));
    }

    fn generate_args(dir: &Path, extra: &[&str]) -> GenerateArgs {
        let out = dir.join("demo.yaml").to_string_lossy().into_owned();
        let mut argv = vec!["k3kcli", "kubeconfig", "generate", "--name", "demo", "--config-name", out.as_str()];
        argv.extend_from_slice(extra);
        match Args::try_parse_from(argv).unwrap().command {
            crate::cli::Command::Kubeconfig(crate::cli::KubeconfigCommand::Generate(args)) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_writes_readable_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let client = MockClusterClient::new();
        seed(&client);
        let args = generate_args(dir.path(), &["--cn", "alice", "--org", "dev", "--kubeconfig-server", "demo.example.com"]);

        generate(&client, NS, "https://10.0.0.1:6443", &args, &RetryConfig::fast(1)).await.unwrap();

        let path = dir.path().join("demo.yaml");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode & 0o644, 0o644);
        let doc = KubeconfigDocument::from_yaml(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc.server(), Some("https://demo.example.com:443"));

        let pem = STANDARD.decode(&doc.users[0].user.client_certificate_data).unwrap();
        let cert = CertificateInfo::from_pem(&String::from_utf8(pem).unwrap()).unwrap();
        assert_eq!(cert.common_name, "alice");
        assert_eq!(cert.organizations, vec!["dev"]);
        assert!(cert.alt_names.iter().any(|n| n == "demo.example.com"));
    }

    #[tokio::test]
    async fn test_generate_for_missing_cluster_fails() {
        let dir = tempfile::tempdir().unwrap();
        let client = MockClusterClient::new();
        let args = generate_args(dir.path(), &[]);
        let err = generate(&client, NS, "https://10.0.0.1:6443", &args, &RetryConfig::fast(2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("demo"));
        assert!(!dir.path().join("demo.yaml").exists());
    }

    #[tokio::test]
    async fn test_delete_missing_cluster_succeeds() {
        let client = MockClusterClient::new();
        delete(&client, NS, "demo", false).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_rejects_reserved_name() {
        let client = MockClusterClient::new();
        assert!(delete(&client, NS, "system", false).await.is_err());
    }
}
