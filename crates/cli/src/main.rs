//! k3kcli
//!
//! Deletes virtual clusters and writes admin kubeconfigs for them.

mod cli;
mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use host_client::KubeClusterClient;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use pki::RetryConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::{Args, ClusterCommand, Command, KubeconfigCommand};

async fn load_config(args: &Args) -> Result<Config> {
    match &args.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).with_context(|| format!("reading {}", path.display()))?;
            Ok(Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?)
        }
        None => Ok(Config::infer().await?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        info!("rustls crypto provider already installed");
    }

    let args = Args::parse();
    let config = load_config(&args).await?;
    let host_api_url = config.cluster_url.to_string();
    let client = KubeClusterClient::new(Client::try_from(config)?);

    match &args.command {
        Command::Cluster(ClusterCommand::Delete { name, keep_data }) => {
            commands::delete(&client, &args.namespace_for(name), name, *keep_data).await
        }
        Command::Kubeconfig(KubeconfigCommand::Generate(generate)) => {
            let namespace = args.namespace_for(&generate.name);
            commands::generate(&client, &namespace, &host_api_url, generate, &RetryConfig::default()).await
        }
    }
}
