//! k3k kubelet bridge
//!
//! Joins a shared-mode virtual cluster as a node and runs its pods on the
//! host cluster.

use kubelet_bridge::{Bridge, KubeletConfig, KubeletError};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), KubeletError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        info!("rustls crypto provider already installed");
    }

    let config = KubeletConfig::from_env()?;
    info!("Starting kubelet bridge");
    info!("  Cluster: {}/{}", config.cluster_namespace, config.cluster_name);
    info!("  Node: {}", config.node_name());
    info!("  Kubelet port: {}", config.kubelet_port);
    info!("  Webhook port: {}", config.webhook_port);
    info!("  Mirror host nodes: {}", config.mirror_host_nodes);

    Bridge::connect(config).await?.run().await
}
