//! Cluster Controller
//!
//! Watches `Cluster` resources and provisions a k3s control plane for each of
//! them on the host cluster.

use cluster_controller::{Controller, ControllerConfig, ControllerError};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube and axum both pull rustls; pick the provider explicitly
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        info!("rustls crypto provider already installed");
    }

    info!("Starting Cluster Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Leader election: {} (lease {}/{})", config.leader_election, config.pod_namespace, cluster_controller::config::LEADER_LEASE_NAME);
    info!("  k3s image: {}", config.k3s_image);
    info!("  Kubelet image: {}", config.kubelet_image);
    info!("  Metrics: {}", config.metrics_addr);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
