//! Test utilities for unit testing reconcilers
//!
//! This module provides helpers for creating test data and setting up test scenarios.

#[cfg(test)]
use crds::{Cluster, ClusterSpec};
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
#[cfg(test)]
use kube::Resource;

/// Helper to create a test Cluster with a fixed uid
#[cfg(test)]
pub fn create_test_cluster(name: &str, namespace: &str, spec: ClusterSpec) -> Cluster {
    Cluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-cluster-{name}")),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// Controller owner reference pointing at `cluster`
#[cfg(test)]
pub fn test_owner_reference(cluster: &Cluster) -> OwnerReference {
    cluster.controller_owner_ref(&()).unwrap()
}
