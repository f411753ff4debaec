//! ClusterIP CRD types
//!
//! A `ClusterIP` asks the operator to publish the external IPv4 address seen
//! from every node group, where a group is the set of schedulable nodes that
//! share one value of `spec.nodeSpreadLabel`.
//!
//! Field names and state strings are consumed by other components and must
//! stay stable: `status.state`, `status.info`, `status.nodeIPs[].nodeLabel`,
//! `status.nodeIPs[].ip`, `status.nodeIPs[].lastUpdateTime`.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::net::is_valid_ipv4;
use crate::DEFAULT_NODE_SPREAD_LABEL;

fn default_node_spread_label() -> String {
    DEFAULT_NODE_SPREAD_LABEL.to_string()
}

/// Request to publish the external IP of every node group
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.kyma-project.io",
    version = "v1alpha1",
    kind = "ClusterIP",
    plural = "clusterips",
    namespaced,
    status = "ClusterIPStatus",
    printcolumn = r#"{"name":"Label","type":"string","jsonPath":".spec.nodeSpreadLabel"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIPSpec {
    /// Node label whose distinct values define the node groups
    ///
    /// Probe agents are keyed by the label value alone. Two ClusterIPs
    /// grouping by different labels must not share a value: the agent keeps
    /// the first label and the other resource reports a probe failure.
    #[serde(default = "default_node_spread_label")]
    pub node_spread_label: String,

    /// Remove status entries for groups that no longer exist
    ///
    /// Off by default: a decommissioned zone keeps its last known IP.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub prune_stale_entries: bool,
}

impl Default for ClusterIPSpec {
    fn default() -> Self {
        Self {
            node_spread_label: default_node_spread_label(),
            prune_stale_entries: false,
        }
    }
}

impl ClusterIPSpec {
    /// The label key to group nodes by, falling back to the topology zone
    pub fn label_key(&self) -> &str {
        let key = self.node_spread_label.trim();
        if key.is_empty() {
            DEFAULT_NODE_SPREAD_LABEL
        } else {
            key
        }
    }

    /// Validate the label key against Kubernetes qualified-name rules
    ///
    /// Accepts `name` or `prefix/name`, where the prefix is a DNS subdomain
    /// (at most 253 chars) and the name is at most 63 alphanumeric chars with
    /// `-`, `_`, `.` allowed in the middle.
    pub fn validate(&self) -> Result<(), String> {
        let key = self.label_key();
        let (prefix, name) = match key.split_once('/') {
            Some((prefix, name)) => (Some(prefix), name),
            None => (None, key),
        };

        if let Some(prefix) = prefix {
            if prefix.is_empty() || prefix.len() > 253 {
                return Err(format!("label prefix of {key:?} must be 1-253 characters"));
            }
            let valid_prefix = prefix.split('.').all(|part| {
                !part.is_empty()
                    && part
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                    && !part.starts_with('-')
                    && !part.ends_with('-')
            });
            if !valid_prefix {
                return Err(format!("label prefix of {key:?} must be a DNS subdomain"));
            }
        }

        if name.is_empty() || name.len() > 63 {
            return Err(format!("label name of {key:?} must be 1-63 characters"));
        }
        let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
        if !edge_ok(name.chars().next()) || !edge_ok(name.chars().last()) {
            return Err(format!(
                "label name of {key:?} must start and end with an alphanumeric character"
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(format!("label name of {key:?} contains invalid characters"));
        }
        Ok(())
    }
}

/// Aggregate state of a ClusterIP
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ClusterIPState {
    /// Some node groups have no confirmed IP yet
    Processing,
    /// Every node group has a fresh, valid IP
    Ready,
    /// The resource needs operator intervention
    Error,
    /// The resource is being torn down
    Deleting,
}

impl fmt::Display for ClusterIPState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterIPState::Processing => "Processing",
            ClusterIPState::Ready => "Ready",
            ClusterIPState::Error => "Error",
            ClusterIPState::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}

/// External IP observed from one node group
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeIP {
    /// Value of the node spread label identifying the group
    pub node_label: String,
    /// External IPv4 address seen from the group
    pub ip: String,
    /// When a probe last confirmed `ip`
    pub last_update_time: DateTime<Utc>,
}

impl NodeIP {
    /// Whether the entry was written after `epoch`
    pub fn is_fresh(&self, epoch: DateTime<Utc>) -> bool {
        self.last_update_time > epoch
    }

    /// Valid IPv4 and fresh relative to `epoch`
    pub fn is_confirmed(&self, epoch: DateTime<Utc>) -> bool {
        is_valid_ipv4(&self.ip) && self.is_fresh(epoch)
    }
}

/// Observed state of a ClusterIP
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIPStatus {
    /// Aggregate state; absent until first reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ClusterIPState>,

    /// Latest diagnostic message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,

    /// Per-group IPs, in insertion order, unique by `nodeLabel`
    #[serde(default, rename = "nodeIPs")]
    pub node_ips: Vec<NodeIP>,
}

impl ClusterIPStatus {
    /// Look up the entry for a node group
    pub fn entry(&self, node_label: &str) -> Option<&NodeIP> {
        self.node_ips.iter().find(|e| e.node_label == node_label)
    }

    /// Insert or update the entry for a node group.
    ///
    /// New groups are appended; existing ones are updated in place. The
    /// timestamp never moves backwards, even if `now` is behind the stored
    /// value because of clock skew between writers. Returns true if anything
    /// changed.
    pub fn upsert_entry(&mut self, node_label: &str, ip: &str, now: DateTime<Utc>) -> bool {
        match self.node_ips.iter_mut().find(|e| e.node_label == node_label) {
            Some(entry) => {
                let time = entry.last_update_time.max(now);
                let changed = entry.ip != ip || entry.last_update_time != time;
                entry.ip = ip.to_string();
                entry.last_update_time = time;
                changed
            }
            None => {
                self.node_ips.push(NodeIP {
                    node_label: node_label.to_string(),
                    ip: ip.to_string(),
                    last_update_time: now,
                });
                true
            }
        }
    }

    /// Drop entries whose group is not in `groups`. Returns the removed labels.
    pub fn retain_groups(&mut self, groups: &[String]) -> Vec<String> {
        let keep: HashSet<&str> = groups.iter().map(String::as_str).collect();
        let mut removed = Vec::new();
        self.node_ips.retain(|e| {
            let kept = keep.contains(e.node_label.as_str());
            if !kept {
                removed.push(e.node_label.clone());
            }
            kept
        });
        removed
    }
}
