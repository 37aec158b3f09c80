//! Reconciliation logic for Cluster resources.
//!
//! One pass drives every generated host object to its desired state and then
//! re-evaluates the phase from what it observed:
//! - `status`: phase predicate and host version
//!
//! A pass over a converged cluster performs reads only.

pub mod status;


use std::sync::Arc;
use std::time::Duration;

use crds::names;
use crds::{Cluster, ClusterMode, ClusterPhase, ClusterStatus};
use host_client::{ClusterClient, NamespacedObject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use pki::BootstrapData;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::exposure;
use crate::reconcile_helpers::{Applied, ensure, ensure_created, status_needs_update, status_patch};
use crate::resources::{self, BuildContext};

/// Requeue interval of a Ready cluster
pub const READY_REQUEUE: Duration = Duration::from_secs(5 * 60);

/// Requeue interval while provisioning
pub const PROVISIONING_REQUEUE: Duration = Duration::from_secs(10);

/// Reconciles Cluster resources against the host API.
pub struct ClusterReconciler<C> {
    client: C,
    config: Arc<ControllerConfig>,
}

fn owned<K: Resource>(mut obj: K, owner: &OwnerReference) -> K {
    obj.meta_mut().owner_references = Some(vec![owner.clone()]);
    obj
}

impl<C: ClusterClient> ClusterReconciler<C> {
    pub fn new(client: C, config: Arc<ControllerConfig>) -> Self {
        Self { client, config }
    }

    #[must_use]
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Converge one cluster and decide when to look at it again
    #[instrument(skip(self, cluster), fields(cluster = %cluster.name_any(), namespace = cluster.namespace().as_deref().unwrap_or("")))]
    pub async fn reconcile(&self, cluster: &Cluster) -> Result<Action, ControllerError> {
        let name = cluster.name_any();
        let namespace = cluster
            .namespace()
            .ok_or_else(|| ControllerError::MissingField("Cluster.metadata.namespace".to_string()))?;

        if cluster.meta().deletion_timestamp.is_some() {
            info!("Cluster is being deleted");
            let desired = status::status(ClusterPhase::Terminating, cluster.host_version(), None);
            self.update_status(cluster, &namespace, &desired).await?;
            return Ok(Action::await_change());
        }

        let mut cluster = cluster.clone();
        if cluster.spec.apply_defaults() {
            info!("Persisting defaulted spec");
            let patch = json!({ "spec": serde_json::to_value(&cluster.spec)? });
            self.client
                .merge_patch::<Cluster>(&namespace, &name, &patch)
                .await?;
        }

        if let Err(err) = cluster.spec.validate(&name) {
            warn!(error = %err, "Cluster spec rejected");
            let desired = status::status(
                ClusterPhase::Failed,
                cluster.host_version(),
                Some(err.to_string()),
            );
            self.update_status(&cluster, &namespace, &desired).await?;
            return Ok(Action::await_change());
        }

        let host_version = status::host_version(&self.client.server_version().await?);
        let phase = self
            .apply_resources(&cluster, &name, &namespace, &host_version)
            .await?;

        let desired = status::status(phase, &host_version, None);
        self.update_status(&cluster, &namespace, &desired).await?;

        Ok(match phase {
            ClusterPhase::Ready => Action::requeue(READY_REQUEUE),
            _ => Action::requeue(PROVISIONING_REQUEUE),
        })
    }

    /// Ensure every generated object and return the converging phase
    async fn apply_resources(
        &self,
        cluster: &Cluster,
        name: &str,
        namespace: &str,
        host_version: &str,
    ) -> Result<ClusterPhase, ControllerError> {
        let owner = cluster
            .controller_owner_ref(&())
            .ok_or_else(|| ControllerError::MissingField("Cluster.metadata.uid".to_string()))?;
        let ctx = BuildContext {
            cluster,
            name: name.to_string(),
            namespace: namespace.to_string(),
            host_version: host_version.to_string(),
            k3s_image: &self.config.k3s_image,
            kubelet_image: &self.config.kubelet_image,
        };

        let mut changes = 0usize;
        let mut track = |applied: Applied| {
            if applied != Applied::Unchanged {
                changes += 1;
            }
        };

        let token_name = names::token_secret_name(name);
        let (token_secret, applied) = ensure_created(&self.client, namespace, &token_name, || {
            let bootstrap = BootstrapData::generate()?;
            Ok(owned(resources::token_secret(&ctx, &bootstrap), &owner))
        })
        .await?;
        track(applied);
        let token_ready = status::has_join_token(&token_secret);

        track(self.apply(namespace, owned(resources::headless_service(&ctx), &owner)).await?);
        let exposure = cluster.spec.exposure();
        track(
            self.apply(
                namespace,
                owned(exposure::server_service(name, namespace, &exposure), &owner),
            )
            .await?,
        );
        track(
            self.apply(namespace, owned(exposure::network_policy(name, namespace), &owner))
                .await?,
        );
        for pvc in resources::server_pvcs(&ctx) {
            track(self.apply(namespace, owned(pvc, &owner)).await?);
        }

        let (statefulset, applied) = ensure(
            &self.client,
            namespace,
            &owned(resources::server_statefulset(&ctx), &owner),
        )
        .await?;
        track(applied);

        match cluster.spec.mode() {
            ClusterMode::Shared => {
                track(self.apply(namespace, owned(resources::kubelet_service_account(&ctx), &owner)).await?);
                track(self.apply(namespace, owned(resources::kubelet_role(&ctx), &owner)).await?);
                track(self.apply(namespace, owned(resources::kubelet_role_binding(&ctx), &owner)).await?);
                track(self.apply(namespace, owned(resources::kubelet_service(&ctx), &owner)).await?);
                track(self.apply(namespace, owned(resources::dns_service(&ctx), &owner)).await?);
                track(self.apply(namespace, owned(resources::kubelet_deployment(&ctx), &owner)).await?);
            }
            ClusterMode::Virtual => {
                if let Some(agents) = resources::agent_deployment(&ctx) {
                    track(self.apply(namespace, owned(agents, &owner)).await?);
                }
            }
        }

        if changes > 0 {
            info!(changes, "Host objects updated");
        } else {
            debug!("Host objects converged");
        }

        Ok(status::converging_phase(token_ready, status::ready_servers(&statefulset)))
    }

    async fn apply<K: NamespacedObject>(&self, namespace: &str, desired: K) -> Result<Applied, ControllerError> {
        let (_, applied) = ensure(&self.client, namespace, &desired).await?;
        Ok(applied)
    }

    /// Patch status only when it differs from the observed one
    async fn update_status(
        &self,
        cluster: &Cluster,
        namespace: &str,
        desired: &ClusterStatus,
    ) -> Result<(), ControllerError> {
        if !status_needs_update(cluster.status.as_ref(), desired) {
            return Ok(());
        }
        info!(phase = ?desired.phase, host_version = %desired.host_version, "Updating cluster status");
        self.client
            .merge_patch_status::<Cluster>(namespace, &cluster.name_any(), &status_patch(desired))
            .await?;
        Ok(())
    }
}
