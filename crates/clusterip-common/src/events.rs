//! Kubernetes Event recording
//!
//! Events show convergence progress in `kubectl describe clusterip`. They
//! are fire-and-forget: a failed publish is logged and never fails a pass.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about a resource
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`; failures are logged, not returned
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (REASON column of `kubectl get events`)
pub mod reasons {
    /// A probe agent was created or updated for a node group
    pub const PROBE_CREATED: &str = "ProbeCreated";
    /// A probe agent was removed after its group converged
    pub const PROBE_DELETED: &str = "ProbeDeleted";
    /// A probe agent operation failed
    pub const PROBE_FAILED: &str = "ProbeFailed";
    /// A node group has a fresh, valid IP
    pub const GROUP_CONVERGED: &str = "GroupConverged";
    /// Every node group converged
    pub const CLUSTER_IP_READY: &str = "ClusterIPReady";
    /// The ClusterIP cannot be reconciled until a user edits it
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Event actions (ACTION column of `kubectl get events`)
pub mod actions {
    /// Regular reconcile pass
    pub const RECONCILE: &str = "Reconcile";
    /// Probe agent create/update/delete
    pub const MANAGE_PROBE: &str = "ManageProbe";
    /// Teardown on deletion
    pub const DELETE: &str = "Delete";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_constants_are_pascal_case() {
        for reason in [
            reasons::PROBE_CREATED,
            reasons::PROBE_DELETED,
            reasons::PROBE_FAILED,
            reasons::GROUP_CONVERGED,
            reasons::CLUSTER_IP_READY,
            reasons::VALIDATION_FAILED,
        ] {
            assert!(reason.chars().next().is_some_and(|c| c.is_ascii_uppercase()));
            assert!(!reason.contains(' '));
        }
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Normal,
                reasons::CLUSTER_IP_READY,
                actions::RECONCILE,
                None,
            )
            .await;
    }
}
