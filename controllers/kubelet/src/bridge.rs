//! Bridge process: startup sequence and the supervised tasks.

use std::sync::Arc;

use chrono::Utc;
use host_client::{ClusterClient, KubeClusterClient};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Client;
use kube::api::Api;
use pki::{BootstrapData, HttpBootstrapDecoder, RetryConfig};
use prometheus::Registry;
use rustls::server::ServerConfig;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::KubeletConfig;
use crate::credentials::{self, ClusterInfo};
use crate::error::KubeletError;
use crate::manager::{HostManager, VirtualManager};
use crate::metrics::SyncMetrics;
use crate::node::{self, READY_TIMEOUT};
use crate::provider::{self, PodTranslator, ProviderContext};
use crate::server::{self, ServerState, tls};
use crate::supervisor::Supervisor;
use crate::webhook::{self, PodMutator};

/// Everything resolved before the supervised tasks start
pub struct Bridge {
    config: Arc<KubeletConfig>,
    host: Client,
    virt: Client,
    info: ClusterInfo,
    bootstrap: BootstrapData,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .field("agent_ip", &self.info.agent_ip)
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Connect to both clusters and fetch the bootstrap material
    pub async fn connect(config: KubeletConfig) -> Result<Self, KubeletError> {
        let host = credentials::host_client(config.host_kubeconfig.as_deref()).await?;
        let info = credentials::lookup_cluster(&KubeClusterClient::new(host.clone()), &config).await?;
        credentials::parse_ip(&info.agent_ip)?;
        info!(agent_ip = %info.agent_ip, dns_ip = %info.dns_ip, "Resolved cluster services");

        let decoder = HttpBootstrapDecoder::new()?;
        let bootstrap = credentials::decode_bootstrap(&decoder, &config, &RetryConfig::default()).await?;
        let virt = credentials::virtual_client(&config, &bootstrap).await?;

        Ok(Self {
            config: Arc::new(config),
            host,
            virt,
            info,
            bootstrap,
        })
    }

    /// Run until the first supervised task stops
    pub async fn run(self) -> Result<(), KubeletError> {
        let host = KubeClusterClient::new(self.host.clone());
        let agent_ip = self.info.agent_ip.clone();

        let kubelet_material = credentials::kubelet_tls(&self.config, &agent_ip, &self.bootstrap)?;
        let kubelet_tls = tls::mutual_tls(&kubelet_material, self.bootstrap.client_ca.cert_pem())?;
        let webhook_material =
            credentials::ensure_webhook_secret(&host, &self.config, &self.info.cluster, &agent_ip, &self.bootstrap)
                .await?;
        let webhook_tls = tls::server_only(&webhook_material)?;

        let mutator = Arc::new(PodMutator {
            cluster: self.config.cluster_name.clone(),
            node_name: self.config.node_name().to_string(),
            dns_ip: self.info.dns_ip.clone(),
        });
        let registration = webhook::webhook_configuration(
            &self.config.cluster_name,
            &agent_ip,
            self.config.webhook_port,
            &webhook_material.ca_pem,
        );

        let host_registry = Registry::new();
        let host_metrics = SyncMetrics::new()?.register(&host_registry)?;

        let mut supervisor = Supervisor::new();
        supervisor.spawn(
            "host-manager",
            HostManager {
                config: Arc::clone(&self.config),
                host: self.host.clone(),
                virt: self.virt.clone(),
                registry: host_registry,
                metrics: host_metrics.clone(),
            }
            .run(),
        );
        supervisor.spawn(
            "virtual-manager",
            VirtualManager {
                config: Arc::clone(&self.config),
                host: self.host.clone(),
                virt: self.virt.clone(),
                mutator,
                webhook_tls,
                webhook: registration,
            }
            .run(),
        );
        supervisor.spawn(
            "node",
            run_node(
                Arc::clone(&self.config),
                self.host.clone(),
                self.virt.clone(),
                self.info,
                kubelet_tls,
                host_metrics,
            ),
        );
        supervisor.wait_until(shutdown_signal()).await
    }
}

/// Flips to true on Ctrl-C or SIGTERM
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        let _ = tx.send(true);
    });
    rx
}

/// Register the node, then serve pods until something fails
async fn run_node(
    config: Arc<KubeletConfig>,
    host_kube: Client,
    virt_kube: Client,
    info: ClusterInfo,
    kubelet_tls: Arc<ServerConfig>,
    metrics: SyncMetrics,
) -> Result<(), KubeletError> {
    let host = KubeClusterClient::new(host_kube.clone());
    let virt = KubeClusterClient::new(virt_kube.clone());
    let node_name = config.node_name().to_string();

    let host_nodes = if config.mirror_host_nodes {
        Some(host.list_global::<Node>("").await?)
    } else {
        None
    };
    let node = node::build_node(&config, &info.agent_ip, host_nodes.as_deref(), Utc::now())?;
    node::register(&virt, &node).await?;
    node::wait_ready(&virt, &node_name, READY_TIMEOUT).await?;

    let translator = PodTranslator::new(&config, &info.cluster);
    let ctx = Arc::new(ProviderContext {
        translator: translator.clone(),
        node_name: node_name.clone(),
        virt: virt.clone(),
        host: host.clone(),
        metrics,
    });
    let state = ServerState {
        host,
        pods: Api::namespaced(host_kube.clone(), &config.cluster_namespace),
        translator: Arc::new(translator),
        node_name: node_name.clone(),
        started: Utc::now(),
    };

    let virtual_pods: Api<Pod> = Api::all(virt_kube);
    let host_pods: Api<Pod> = Api::namespaced(host_kube, &config.cluster_namespace);

    tokio::select! {
        res = node::run_heartbeat(&virt, &node_name) => res,
        () = provider::run(virtual_pods, host_pods, ctx) => {
            Err(KubeletError::TaskStopped("pod provider".to_string(), "watch ended".to_string()))
        }
        res = server::serve(config.kubelet_addr(), kubelet_tls, state) => res,
    }
}
