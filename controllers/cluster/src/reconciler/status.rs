//! Level-triggered phase evaluation.

use crds::{ClusterPhase, ClusterStatus};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Secret;
use pki::bootstrap::TOKEN_KEY;

/// Suffix appended to the host `gitVersion`
pub const K3S_VERSION_SUFFIX: &str = "-k3s1";

/// `v1.30.2` becomes `v1.30.2-k3s1`
#[must_use]
pub fn host_version(git_version: &str) -> String {
    format!("{git_version}{K3S_VERSION_SUFFIX}")
}

/// Ready servers reported by the StatefulSet, zero when unknown
#[must_use]
pub fn ready_servers(statefulset: &StatefulSet) -> i32 {
    statefulset
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

/// True when the token secret carries a non-empty join token
#[must_use]
pub fn has_join_token(secret: &Secret) -> bool {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(TOKEN_KEY))
        .is_some_and(|token| !token.0.is_empty())
}

/// Phase of a converging cluster: Ready once the join token exists and at
/// least one server is ready, Provisioning until then.
#[must_use]
pub fn converging_phase(token_ready: bool, ready_servers: i32) -> ClusterPhase {
    if token_ready && ready_servers >= 1 {
        ClusterPhase::Ready
    } else {
        ClusterPhase::Provisioning
    }
}

/// Status to write, carrying over the known host version
#[must_use]
pub fn status(phase: ClusterPhase, host_version: &str, message: Option<String>) -> ClusterStatus {
    ClusterStatus {
        phase,
        host_version: host_version.to_string(),
        message,
    }
}
