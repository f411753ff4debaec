//! Common types for the cluster-ip operator: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod backoff;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod net;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Node label used for grouping when a ClusterIP does not name one
pub const DEFAULT_NODE_SPREAD_LABEL: &str = "topology.kubernetes.io/zone";

/// Namespace the operator and its probe agents run in when not overridden
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "kyma-system";

/// Finalizer guarding probe teardown when a ClusterIP is deleted
pub const CLUSTER_IP_FINALIZER: &str = "operator.kyma-project.io/cluster-ip";

/// Label carrying the hashed node group on probe agents
pub const PROBE_GROUP_LABEL: &str = "operator.kyma-project.io/probe-group";

/// Annotation carrying the raw (unhashed) node group on probe agents
pub const PROBE_NODE_LABEL_ANNOTATION: &str = "operator.kyma-project.io/node-label";

/// Annotation naming the controller instance (its start epoch) that last
/// applied a probe agent
pub const PROBE_OWNER_EPOCH_ANNOTATION: &str = "operator.kyma-project.io/controller-epoch";

/// Label marking objects managed by this operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on objects created by this operator
pub const MANAGER_NAME: &str = "cluster-ip-operator";

/// Field manager used for server-side apply and status writes
pub const FIELD_MANAGER: &str = "cluster-ip-controller";

/// Default minimum number of agreeing IP sources
pub const DEFAULT_MIN_AGREE: usize = 2;
