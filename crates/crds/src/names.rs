//! Derived object names and well-known labels.
//!
//! Every host object generated for a cluster has a name derived here, so the
//! controller, the kubelet bridge and the CLI always agree on it.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Prefix for every generated host object.
pub const NAME_PREFIX: &str = "k3k";

/// Reserved cluster name that is never accepted.
pub const CLUSTER_INVALID_NAME: &str = "system";

/// Label carrying the owning cluster name.
pub const CLUSTER_LABEL: &str = "cluster";

/// Label carrying the role of a generated object.
pub const ROLE_LABEL: &str = "role";

/// Role of k3s server pods and their volumes.
pub const SERVER_ROLE: &str = "server";

/// Role of k3s agent pods.
pub const AGENT_ROLE: &str = "agent";

/// Role of host objects mirroring a virtual object.
pub const SHADOW_ROLE: &str = "shadow";

/// Annotation holding the virtual object name on a shadow.
pub const SHADOW_NAME_ANNOTATION: &str = "k3k.io/name";

/// Annotation holding the virtual object namespace on a shadow.
pub const SHADOW_NAMESPACE_ANNOTATION: &str = "k3k.io/namespace";

/// Annotation holding the virtual object kind on a shadow.
pub const SHADOW_KIND_ANNOTATION: &str = "k3k.io/kind";

/// Volume claim template used by the server StatefulSet.
pub const SERVER_VOLUME_NAME: &str = "varlibrancherk3s";

const MAX_NAME_LEN: usize = 63;
const TRUNCATED_LEN: usize = 57;

/// Joins `parts` with `-`, hashing the tail when the result would exceed 63 chars.
#[must_use]
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.len() <= MAX_NAME_LEN {
        return full;
    }

    let digest = Sha256::digest(full.as_bytes());
    let hash: String = digest.iter().map(|b| format!("{b:02x}")).collect();

    let mut cut = TRUNCATED_LEN;
    while !full.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}-{}", &full[..cut], &hash[..5]).replace(".-", "-")
}

/// Same as [`safe_concat_name`] with the `k3k` prefix.
#[must_use]
pub fn safe_concat_name_with_prefix(parts: &[&str]) -> String {
    let mut all = Vec::with_capacity(parts.len() + 1);
    all.push(NAME_PREFIX);
    all.extend_from_slice(parts);
    safe_concat_name(&all)
}

/// Server service fronting the k3s API.
#[must_use]
pub fn service_name(cluster: &str) -> String {
    safe_concat_name_with_prefix(&[cluster, "service"])
}

/// Headless service backing the server StatefulSet.
#[must_use]
pub fn headless_service_name(cluster: &str) -> String {
    safe_concat_name_with_prefix(&[cluster, "service", "headless"])
}

#[must_use]
pub fn server_statefulset_name(cluster: &str) -> String {
    safe_concat_name_with_prefix(&[cluster, "server"])
}

/// Volume claim adopted by server replica `ordinal`.
#[must_use]
pub fn server_pvc_name(cluster: &str, ordinal: i32) -> String {
    format!(
        "{SERVER_VOLUME_NAME}-{}-{ordinal}",
        server_statefulset_name(cluster)
    )
}

/// Secret holding the join token and CA material.
#[must_use]
pub fn token_secret_name(cluster: &str) -> String {
    safe_concat_name_with_prefix(&[cluster, "token"])
}

/// Secret holding the admission webhook serving certificate.
#[must_use]
pub fn webhook_secret_name(cluster: &str) -> String {
    safe_concat_name_with_prefix(&[cluster, "webhook"])
}

#[must_use]
pub fn network_policy_name(cluster: &str) -> String {
    safe_concat_name_with_prefix(&[cluster])
}

/// Service and Deployment of the shared-mode kubelet bridge.
#[must_use]
pub fn kubelet_name(cluster: &str) -> String {
    safe_concat_name_with_prefix(&[cluster, "kubelet"])
}

/// Host service that fronts the virtual cluster DNS pods.
#[must_use]
pub fn dns_service_name(cluster: &str) -> String {
    safe_concat_name_with_prefix(&[cluster, "kube-dns"])
}

/// Virtual-mode agent Deployment.
#[must_use]
pub fn agent_deployment_name(cluster: &str) -> String {
    safe_concat_name_with_prefix(&[cluster, "agent"])
}

/// Host name of a namespaced virtual object.
#[must_use]
pub fn shadow_name(cluster: &str, namespace: &str, name: &str) -> String {
    safe_concat_name(&[name, namespace, cluster])
}

/// Host name of a cluster-scoped virtual object.
#[must_use]
pub fn cluster_scoped_shadow_name(cluster: &str, name: &str) -> String {
    safe_concat_name_with_prefix(&[cluster, name])
}

/// Namespace used by the CLI when none is given.
#[must_use]
pub fn default_namespace(cluster: &str) -> String {
    format!("{NAME_PREFIX}-{cluster}")
}

/// `{cluster: <cluster>}`
#[must_use]
pub fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(CLUSTER_LABEL.to_string(), cluster.to_string())])
}

/// `{cluster: <cluster>, role: <role>}`
#[must_use]
pub fn role_labels(cluster: &str, role: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster);
    labels.insert(ROLE_LABEL.to_string(), role.to_string());
    labels
}

/// Renders labels as a selector string, e.g. `cluster=a,role=server`.
#[must_use]
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_names_are_joined() {
        assert_eq!(service_name("mycluster"), "k3k-mycluster-service");
        assert_eq!(token_secret_name("mycluster"), "k3k-mycluster-token");
        assert_eq!(webhook_secret_name("mycluster"), "k3k-mycluster-webhook");
        assert_eq!(network_policy_name("mycluster"), "k3k-mycluster");
        assert_eq!(dns_service_name("mycluster"), "k3k-mycluster-kube-dns");
        assert_eq!(
            server_pvc_name("mycluster", 0),
            "varlibrancherk3s-k3k-mycluster-server-0"
        );
    }

    #[test]
    fn test_long_names_are_hashed() {
        let long = "a".repeat(80);
        let name = safe_concat_name(&[&long, "ns", "cluster"]);
        assert_eq!(name.len(), 63);
        assert!(name.starts_with(&"a".repeat(57)));

        // Stable across calls
        assert_eq!(name, safe_concat_name(&[&long, "ns", "cluster"]));
        // Different input, different hash
        assert_ne!(name, safe_concat_name(&[&long, "ns", "other"]));
    }

    #[test]
    fn test_exactly_63_chars_is_kept() {
        let part = "b".repeat(63);
        assert_eq!(safe_concat_name(&[&part]), part);
    }

    #[test]
    fn test_dot_before_hash_is_collapsed() {
        let mut base = "c".repeat(56);
        base.push('.');
        base.push_str(&"d".repeat(20));
        let name = safe_concat_name(&[&base]);
        assert!(!name.contains(".-"));
    }

    #[test]
    fn test_label_selector() {
        let labels = role_labels("x", SERVER_ROLE);
        assert_eq!(label_selector(&labels), "cluster=x,role=server");
    }
}
