//! Owner-to-owned adjacency between host objects.
//!
//! Built from `ownerReferences` of objects already read from the API, so a
//! deletion can be planned (which objects cascade, which are released) before
//! anything is written.

use std::collections::{BTreeMap, BTreeSet};

use kube::{Resource, ResourceExt};

/// Kind and name of an object within one namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub kind: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn of<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        Self::new(K::kind(&()), obj.name_any())
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OwnershipGraph {
    edges: BTreeMap<ObjectRef, BTreeSet<ObjectRef>>,
}

impl OwnershipGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every owner of `obj`
    pub fn add<K: Resource<DynamicType = ()>>(&mut self, obj: &K) {
        let owned = ObjectRef::of(obj);
        for owner in obj.owner_references() {
            self.edges
                .entry(ObjectRef::new(owner.kind.clone(), owner.name.clone()))
                .or_default()
                .insert(owned.clone());
        }
    }

    /// Objects directly owned by `owner`, in name order
    pub fn owned_by<'a>(&'a self, owner: &ObjectRef) -> impl Iterator<Item = &'a ObjectRef> + 'a {
        self.edges.get(owner).into_iter().flatten()
    }

    #[must_use]
    pub fn owners_of(&self, obj: &ObjectRef) -> Vec<&ObjectRef> {
        self.edges
            .iter()
            .filter(|(_, owned)| owned.contains(obj))
            .map(|(owner, _)| owner)
            .collect()
    }
}

/// What happens to the dependents of a deleted owner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionPlan {
    /// Released before the owner goes away
    pub orphan: Vec<ObjectRef>,
    /// Left to garbage collection
    pub cascade: Vec<ObjectRef>,
}

impl DeletionPlan {
    /// Split the dependents of `owner`; those matching `retain` are orphaned
    pub fn for_owner(graph: &OwnershipGraph, owner: &ObjectRef, retain: impl Fn(&ObjectRef) -> bool) -> Self {
        let (orphan, cascade) = graph
            .owned_by(owner)
            .cloned()
            .partition(|obj| retain(obj));
        Self { orphan, cascade }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn owner_ref(kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: "k3k.io/v1alpha1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            ..Default::default()
        }
    }

    fn secret(name: &str, owners: Vec<OwnerReference>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                owner_references: Some(owners),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_edges_follow_owner_references() {
        let mut graph = OwnershipGraph::new();
        graph.add(&secret("token", vec![owner_ref("Cluster", "a")]));
        graph.add(&secret("shared", vec![owner_ref("Cluster", "a"), owner_ref("Cluster", "b")]));
        graph.add(&secret("orphan", vec![]));

        let a = ObjectRef::new("Cluster", "a");
        let owned: Vec<_> = graph.owned_by(&a).map(ToString::to_string).collect();
        assert_eq!(owned, vec!["Secret/shared", "Secret/token"]);

        let owners = graph.owners_of(&ObjectRef::new("Secret", "shared"));
        assert_eq!(owners.len(), 2);
        assert!(graph.owners_of(&ObjectRef::new("Secret", "orphan")).is_empty());
    }

    #[test]
    fn test_plan_splits_retained_dependents() {
        let mut graph = OwnershipGraph::new();
        graph.add(&secret("token", vec![owner_ref("Cluster", "a")]));
        graph.add(&PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data-0".to_string()),
                owner_references: Some(vec![owner_ref("Cluster", "a")]),
                ..Default::default()
            },
            ..Default::default()
        });

        let plan = DeletionPlan::for_owner(&graph, &ObjectRef::new("Cluster", "a"), |r| r.kind == "Secret");
        assert_eq!(plan.orphan, vec![ObjectRef::new("Secret", "token")]);
        assert_eq!(plan.cascade, vec![ObjectRef::new("PersistentVolumeClaim", "data-0")]);

        let unknown = DeletionPlan::for_owner(&graph, &ObjectRef::new("Cluster", "z"), |_| true);
        assert_eq!(unknown, DeletionPlan::default());
    }
}
