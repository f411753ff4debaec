//! Reconcilers for ClusterIP resources
//!
//! Two controllers share this crate:
//!
//! - [`controller`]: the convergence reconciler. It runs once per cluster,
//!   enumerates node groups, keeps one probe agent per unconfirmed group, and
//!   derives the aggregate state.
//! - [`probe_agent`]: the reconcile path of a probe agent. It runs on one
//!   node group, resolves the external IP, and writes its own status entry.

pub mod controller;
pub mod groups;
pub mod kube_client;
pub mod probe;
pub mod probe_agent;
pub mod status;

pub use clusterip_common::Error;
pub use controller::{
    error_policy, plan_convergence, reconcile, Context, ContextBuilder, ConvergencePlan, GroupPlan,
    PendingReason,
};
pub use groups::{enumerate_groups, NodeGroupEnumerator};
pub use kube_client::{KubeClient, KubeClientImpl};
pub use probe::{DeploymentProbeRuntime, ProbeAction, ProbeAgentHandle, ProbeManager, ProbeRuntime};
pub use probe_agent::{ProbeConfig, ProbeContext};
