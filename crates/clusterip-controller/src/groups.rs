//! Node group enumeration
//!
//! A node group is one value of the spread label on a node that can run a
//! probe agent: no taints and not cordoned. Groups are recomputed on every
//! pass and never cached.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use tracing::debug;

use clusterip_common::Error;

use crate::kube_client::KubeClient;

/// Distinct values of `label_key` over schedulable, untainted nodes, in
/// first-seen order
pub fn enumerate_groups(nodes: &[Node], label_key: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut groups = Vec::new();

    for node in nodes {
        if !is_probe_capable(node) {
            continue;
        }
        let Some(value) = node.metadata.labels.as_ref().and_then(|l| l.get(label_key)) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        if seen.insert(value.as_str()) {
            groups.push(value.clone());
        }
    }
    groups
}

fn is_probe_capable(node: &Node) -> bool {
    let Some(spec) = node.spec.as_ref() else {
        return true;
    };
    let tainted = spec.taints.as_ref().is_some_and(|t| !t.is_empty());
    let cordoned = spec.unschedulable.unwrap_or(false);
    !tainted && !cordoned
}

/// Hash of the node fields that affect grouping (labels, taints, cordon).
///
/// Node heartbeats change the object constantly; comparing fingerprints lets
/// a node watcher trigger reconciles only when grouping could change.
pub fn node_fingerprint(node: &Node) -> u64 {
    let mut hasher = DefaultHasher::new();
    let empty = BTreeMap::new();
    node.metadata.labels.as_ref().unwrap_or(&empty).hash(&mut hasher);
    if let Some(spec) = node.spec.as_ref() {
        spec.unschedulable.unwrap_or(false).hash(&mut hasher);
        for taint in spec.taints.iter().flatten() {
            taint.key.hash(&mut hasher);
            taint.value.hash(&mut hasher);
            taint.effect.hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Lists nodes and groups them by a label
pub struct NodeGroupEnumerator {
    kube: Arc<dyn KubeClient>,
}

impl NodeGroupEnumerator {
    /// Create an enumerator over the given client
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }

    /// Current node groups for `label_key`. A listing failure is returned
    /// unchanged so the caller can abort the pass.
    pub async fn enumerate(&self, label_key: &str) -> Result<Vec<String>, Error> {
        let nodes = self.kube.list_nodes().await?;
        let groups = enumerate_groups(&nodes, label_key);
        debug!(nodes = nodes.len(), groups = groups.len(), label_key, "enumerated node groups");
        Ok(groups)
    }
}
