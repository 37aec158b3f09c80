//! Main controller implementation.
//!
//! Wires the Cluster watch, leader election and the metrics listener together.
//! Server StatefulSets are watched as owned objects so a server becoming ready
//! triggers a reconcile of its Cluster without waiting for the requeue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crds::Cluster;
use futures::StreamExt;
use host_client::{KubeClusterClient, LeaderElector, LeaderGuard};
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{Action, Config as RuntimeConfig};
use kube_runtime::{Controller as KubeController, watcher};
use prometheus::Registry;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffTracker;
use crate::config::{ControllerConfig, LEADER_LEASE_NAME};
use crate::error::ControllerError;
use crate::metrics::{self, Metrics};
use crate::reconciler::ClusterReconciler;

/// Shared state handed to every reconcile
pub struct Context {
    reconciler: ClusterReconciler<KubeClusterClient>,
    backoff: BackoffTracker,
    metrics: Metrics,
}

fn object_key(cluster: &Cluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

/// Requeue decision after a failed reconcile
pub fn requeue_after_error(backoff: &BackoffTracker, key: &str, error: &ControllerError) -> Action {
    if error.is_retryable() {
        let delay = backoff.on_error(key);
        warn!(cluster = %key, error = %error, delay_secs = delay.as_secs(), "Reconcile failed, requeueing");
        Action::requeue(delay)
    } else {
        error!(cluster = %key, error = %error, "Reconcile failed permanently");
        Action::await_change()
    }
}

async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    let started = Instant::now();
    let result = ctx.reconciler.reconcile(&cluster).await;
    match &result {
        Ok(_) => {
            ctx.backoff.on_success(&object_key(&cluster));
            ctx.metrics.reconcile_success(started.elapsed());
        }
        Err(_) => ctx.metrics.reconcile_failure(started.elapsed()),
    }
    result
}

fn error_policy(cluster: Arc<Cluster>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    requeue_after_error(&ctx.backoff, &object_key(&cluster), error)
}

async fn watch_clusters(client: Client, namespace: Option<String>, ctx: Arc<Context>) -> Result<(), ControllerError> {
    let (clusters, statefulsets): (Api<Cluster>, Api<StatefulSet>) = match namespace.as_deref() {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client, ns)),
        None => (Api::all(client.clone()), Api::all(client)),
    };

    info!(namespace = namespace.as_deref().unwrap_or("all namespaces"), "Starting Cluster watcher");
    let runtime_config = RuntimeConfig::default()
        .debounce(Duration::from_secs(1))
        .concurrency(3);

    KubeController::new(clusters, watcher::Config::default())
        .owns(statefulsets, watcher::Config::default().labels("role=server"))
        .with_config(runtime_config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(cluster = %obj.name, "Reconciled"),
                Err(e) => warn!(error = %e, "Cluster controller error"),
            }
        })
        .await;

    info!("Cluster watcher stopped");
    Ok(())
}

async fn leadership_lost(guard: Option<&mut LeaderGuard>) {
    match guard {
        Some(guard) => guard.lost().await,
        None => std::future::pending().await,
    }
}

/// Cluster controller process
pub struct Controller {
    client: Client,
    config: Arc<ControllerConfig>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        let client = Client::try_default().await?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    /// Run until a signal stops the watch or leadership is lost
    pub async fn run(self) -> Result<(), ControllerError> {
        let registry = Registry::new();
        let metrics = Metrics::new()?.register(&registry)?;
        let mut metrics_server: JoinHandle<Result<(), ControllerError>> =
            tokio::spawn(metrics::serve(self.config.metrics_addr, registry));

        let mut guard = if self.config.leader_election {
            let elector = Arc::new(LeaderElector::new(
                self.client.clone(),
                LEADER_LEASE_NAME,
                &self.config.pod_namespace,
                &self.config.pod_name,
            ));
            Some(elector.acquire().await)
        } else {
            info!("Leader election disabled");
            None
        };

        let ctx = Arc::new(Context {
            reconciler: ClusterReconciler::new(
                KubeClusterClient::new(self.client.clone()),
                Arc::clone(&self.config),
            ),
            backoff: BackoffTracker::default(),
            metrics,
        });
        let mut watcher = tokio::spawn(watch_clusters(
            self.client.clone(),
            self.config.watch_namespace.clone(),
            ctx,
        ));

        let result = tokio::select! {
            res = &mut watcher => match res {
                Ok(result) => result,
                Err(e) => Err(ControllerError::Watch(format!("Cluster watcher task failed: {e}"))),
            },
            res = &mut metrics_server => match res {
                Ok(Ok(())) => Err(ControllerError::Metrics("metrics listener exited".to_string())),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(ControllerError::Metrics(format!("metrics task failed: {e}"))),
            },
            () = leadership_lost(guard.as_mut()) => {
                error!("Leadership lost, stopping");
                Err(ControllerError::LeadershipLost)
            }
        };

        watcher.abort();
        metrics_server.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::ValidationError;
    use host_client::ClientError;

    #[test]
    fn test_transient_errors_back_off_per_cluster() {
        let backoff = BackoffTracker::default();
        let conflict = ControllerError::from(ClientError::Conflict {
            kind: "Service".to_string(),
            name: "k3k-a-service".to_string(),
            message: "stale".to_string(),
        });

        assert_eq!(
            requeue_after_error(&backoff, "ns/a", &conflict),
            Action::requeue(Duration::from_secs(60))
        );
        assert_eq!(
            requeue_after_error(&backoff, "ns/a", &conflict),
            Action::requeue(Duration::from_secs(60))
        );
        assert_eq!(
            requeue_after_error(&backoff, "ns/a", &conflict),
            Action::requeue(Duration::from_secs(120))
        );
        // Another cluster starts from the beginning
        assert_eq!(
            requeue_after_error(&backoff, "ns/b", &conflict),
            Action::requeue(Duration::from_secs(60))
        );

        backoff.on_success("ns/a");
        assert_eq!(
            requeue_after_error(&backoff, "ns/a", &conflict),
            Action::requeue(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_validation_errors_wait_for_a_change() {
        let backoff = BackoffTracker::default();
        let invalid = ControllerError::from(ValidationError::InvalidName("system".to_string()));
        assert_eq!(requeue_after_error(&backoff, "ns/system", &invalid), Action::await_change());
    }
}
