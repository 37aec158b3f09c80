//! Host and virtual managers.
//!
//! Each manager holds a Lease on its side and runs that side's controllers
//! while it leads. Losing the lease, a watch ending or the metrics listener
//! failing ends the manager with an error.

use std::future::Future;
use std::sync::Arc;

use host_client::{KubeClusterClient, LeaderElector};
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::scheduling::v1::PriorityClass;
use kube::Client;
use kube::api::Api;
use prometheus::Registry;
use rustls::server::ServerConfig;
use tracing::{error, info};

use crate::config::{KubeletConfig, VIRTUAL_LEASE_NAMESPACE};
use crate::error::KubeletError;
use crate::metrics::{self, SyncMetrics};
use crate::syncer::pod_pvc::{self, PodVolumeContext};
use crate::syncer::{self, SyncContext, priority_class};
use crate::webhook::{self, PodMutator};

type Bridged = SyncContext<KubeClusterClient, KubeClusterClient>;

fn sync_context(config: &KubeletConfig, host: &Client, virt: &Client, metrics: SyncMetrics) -> Arc<Bridged> {
    Arc::new(SyncContext {
        cluster: config.cluster_name.clone(),
        host_namespace: config.cluster_namespace.clone(),
        virt: KubeClusterClient::new(virt.clone()),
        host: KubeClusterClient::new(host.clone()),
        metrics,
    })
}

async fn watch<F: Future<Output = ()>>(name: &str, watch: F) -> Result<(), KubeletError> {
    watch.await;
    Err(KubeletError::TaskStopped(name.to_string(), "watch ended".to_string()))
}

/// Run `managed` while holding the lease of `elector`, serving metrics throughout
async fn lead<F>(
    elector: LeaderElector,
    lease: String,
    metrics_addr: Option<std::net::SocketAddr>,
    registry: Registry,
    managed: F,
) -> Result<(), KubeletError>
where
    F: Future<Output = Result<(), KubeletError>>,
{
    let leading = async {
        let mut guard = Arc::new(elector).acquire().await;
        tokio::select! {
            res = managed => res,
            () = guard.lost() => {
                error!(lease = %lease, "Leadership lost, stopping");
                Err(KubeletError::LeadershipLost(lease.clone()))
            }
        }
    };

    tokio::select! {
        res = leading => res,
        res = metrics::serve(metrics_addr, registry) => {
            res?;
            Err(KubeletError::Metrics("metrics listener exited".to_string()))
        }
    }
}

/// Status flow from host shadows back to virtual objects
#[derive(Clone)]
pub struct HostManager {
    pub config: Arc<KubeletConfig>,
    pub host: Client,
    pub virt: Client,
    /// Served on the host metrics address; the pod provider records into it too
    pub registry: Registry,
    pub metrics: SyncMetrics,
}

impl std::fmt::Debug for HostManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostManager").field("config", &self.config).finish_non_exhaustive()
    }
}

impl HostManager {
    pub async fn run(self) -> Result<(), KubeletError> {
        let ctx = sync_context(&self.config, &self.host, &self.virt, self.metrics.clone());
        let ns = &self.config.cluster_namespace;

        let elector = LeaderElector::new(self.host.clone(), &self.config.cluster_name, ns, self.config.identity());
        let services: Api<Service> = Api::namespaced(self.host.clone(), ns);
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.host.clone(), ns);

        info!(cluster = %self.config.cluster_name, "Starting host manager");
        let managed = async {
            tokio::select! {
                res = watch("host service status", syncer::run_from_host(services, Arc::clone(&ctx))) => res,
                res = watch("host claim status", syncer::run_from_host(claims, Arc::clone(&ctx))) => res,
            }
        };
        let lease = format!("{ns}/{}", self.config.cluster_name);
        lead(elector, lease, self.config.host_metrics_addr(), self.registry.clone(), managed).await
    }
}

/// Spec flow from virtual objects to host shadows, plus the pod mutator
pub struct VirtualManager {
    pub config: Arc<KubeletConfig>,
    pub host: Client,
    pub virt: Client,
    pub mutator: Arc<PodMutator>,
    pub webhook_tls: Arc<ServerConfig>,
    pub webhook: MutatingWebhookConfiguration,
}

impl std::fmt::Debug for VirtualManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualManager")
            .field("config", &self.config)
            .field("mutator", &self.mutator)
            .finish_non_exhaustive()
    }
}

impl VirtualManager {
    pub async fn run(self) -> Result<(), KubeletError> {
        let registry = Registry::new();
        let metrics = SyncMetrics::new()?.register(&registry)?;
        let ctx = sync_context(&self.config, &self.host, &self.virt, metrics.clone());
        let volumes = Arc::new(PodVolumeContext {
            cluster: self.config.cluster_name.clone(),
            node_name: self.config.node_name().to_string(),
            virt: KubeClusterClient::new(self.virt.clone()),
            metrics,
        });

        let elector = LeaderElector::new(
            self.virt.clone(),
            &self.config.cluster_name,
            VIRTUAL_LEASE_NAMESPACE,
            self.config.identity(),
        );
        let lease = format!("{VIRTUAL_LEASE_NAMESPACE}/{}", self.config.cluster_name);
        let virt = self.virt.clone();
        let webhook = self.webhook;
        let registration = KubeClusterClient::new(self.virt.clone());

        info!(cluster = %self.config.cluster_name, "Starting virtual manager");
        let managed = async {
            webhook::ensure_webhook_configuration(&registration, webhook).await?;
            tokio::select! {
                res = watch("service syncer", syncer::run_to_host(Api::<Service>::all(virt.clone()), Arc::clone(&ctx))) => res,
                res = watch("claim syncer", syncer::run_to_host(Api::<PersistentVolumeClaim>::all(virt.clone()), Arc::clone(&ctx))) => res,
                res = watch("pod volume controller", pod_pvc::run(Api::<Pod>::all(virt.clone()), volumes)) => res,
                res = watch("priority class syncer", priority_class::run(Api::<PriorityClass>::all(virt.clone()), Arc::clone(&ctx))) => res,
            }
        };

        // Any replica answers admission requests, leader or not
        tokio::select! {
            res = lead(elector, lease, self.config.virtual_metrics_addr(), registry, managed) => res,
            res = webhook::serve(self.config.webhook_addr(), self.webhook_tls, self.mutator) => {
                res?;
                Err(KubeletError::TaskStopped("pod mutator".to_string(), "listener exited".to_string()))
            }
        }
    }
}
