//! Lease-based leader election
//!
//! Updates go through `replace` with the lease's resourceVersion, so two
//! candidates racing for an expired lease cannot both win: the loser gets a
//! 409 and goes back to waiting.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, PostParams};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::time::{micro_time, micro_time_to_utc};

/// Lease lifetime without renewal
pub const LEASE_DURATION: Duration = Duration::from_secs(30);
/// Renewal period while leading
pub const RENEW_INTERVAL: Duration = Duration::from_secs(10);
/// Poll period while waiting for the lease
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// What a candidate should do with the lease it just read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAction {
    /// No lease yet
    Create,
    /// We already hold it
    Renew,
    /// Held by someone else but expired
    TakeOver { transitions: i32 },
    /// Held by someone else and still valid
    Wait,
}

/// Decide the next step for `identity` given the current lease
#[must_use]
pub fn lease_action(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(lease) = lease else {
        return LeaseAction::Create;
    };
    let spec = lease.spec.as_ref();

    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseAction::Renew;
    }

    let renewed = spec
        .and_then(|s| s.renew_time.as_ref())
        .and_then(micro_time_to_utc);
    let duration = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (renewed, duration) {
        (Some(renewed), Some(secs)) => now > renewed + chrono::Duration::seconds(i64::from(secs)),
        _ => true,
    };
    // A released lease has no holder and can be taken right away
    let vacant = spec.and_then(|s| s.holder_identity.as_ref()).is_none();

    if expired || vacant {
        LeaseAction::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    } else {
        LeaseAction::Wait
    }
}

/// Leader elector for one Lease
#[derive(Clone)]
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("lease_name", &self.lease_name)
            .field("namespace", &self.namespace)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    #[must_use]
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Block until the lease is held, then keep renewing it in the background.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            namespace = %self.namespace,
            "Waiting for leadership"
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, lease = %self.lease_name, "Leadership acquired");
                    return self.guard();
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "Lease held elsewhere");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to acquire lease");
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    fn guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal = tokio::spawn(async move {
            loop {
                tokio::time::sleep(RENEW_INTERVAL).await;
                match elector.try_acquire_or_renew().await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => {
                        warn!(identity = %elector.identity, lease = %elector.lease_name, "Leadership lost");
                        let _ = lost_tx.send(());
                        return;
                    }
                }
            }
        });

        LeaderGuard {
            renewal,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, ClientError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();
        let current = api.get_opt(&self.lease_name).await?;

        let lease = match lease_action(current.as_ref(), &self.identity, now) {
            LeaseAction::Wait => return Ok(false),
            LeaseAction::Create => {
                let lease = self.lease(None, now, 0)?;
                return match api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                    Err(e) => Err(e.into()),
                };
            }
            LeaseAction::Renew => {
                let mut lease = current.unwrap_or_default();
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(micro_time(now)?);
                }
                lease
            }
            LeaseAction::TakeOver { transitions } => {
                let version = current.and_then(|l| l.metadata.resource_version);
                self.lease(version, now, transitions + 1)?
            }
        };

        match api.replace(&self.lease_name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn lease(&self, resource_version: Option<String>, now: DateTime<Utc>, transitions: i32) -> Result<Lease, ClientError> {
        Ok(Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: i32::try_from(LEASE_DURATION.as_secs()).ok(),
                acquire_time: Some(micro_time(now)?),
                renew_time: Some(micro_time(now)?),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        })
    }
}

/// Held leadership; renewal stops when dropped
#[derive(Debug)]
pub struct LeaderGuard {
    renewal: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Resolves once a renewal fails
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}
