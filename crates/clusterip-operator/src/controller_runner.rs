//! Controller runner - builds controller futures for each process mode
//!
//! Each `build_*` function returns a Vec of boxed futures that the caller
//! drives. The controller mode watches ClusterIPs and Nodes; the probe mode
//! watches ClusterIPs only.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, ResourceExt};

use clusterip_common::crd::ClusterIP;
use clusterip_controller::groups::node_fingerprint;
use clusterip_controller::{error_policy, probe_agent, reconcile, Context, KubeClientImpl};
use clusterip_controller::{ProbeConfig, ProbeContext};
use clusterip_resolver::IpResolver;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client gives up.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Settings for the convergence controller
#[derive(Clone, Debug)]
pub struct ConvergenceSettings {
    /// Namespace probe agents are created in
    pub namespace: String,
    /// Service account probe agents run as
    pub service_account: String,
    /// Image probe agents run
    pub probe_image: String,
}

/// Build the convergence controller future
///
/// ClusterIPs are reconciled on their own changes, on requeue, and whenever
/// a node change could alter the set of node groups.
pub fn build_convergence_controllers(
    client: Client,
    settings: ConvergenceSettings,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(
        Context::builder(client.clone(), settings.probe_image)
            .namespace(settings.namespace)
            .service_account(settings.service_account)
            .build(),
    );
    let cluster_ips: Api<ClusterIP> = Api::all(client.clone());

    tracing::info!("- ClusterIP convergence controller");

    vec![Box::pin(
        Controller::new(
            cluster_ips,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .reconcile_all_on(node_grouping_changes(client))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("ClusterIP")),
    )]
}

/// Build the probe agent controller future for one node group
pub fn build_probe_controllers(
    client: Client,
    resolver: Arc<dyn IpResolver>,
    config: ProbeConfig,
) -> Vec<ControllerFuture> {
    tracing::info!(
        label = %config.label_key,
        group = %config.group,
        min_agree = config.min_agree,
        "- ClusterIP probe controller"
    );
    let ctx = Arc::new(ProbeContext::new(
        Arc::new(KubeClientImpl::new(client.clone())),
        resolver,
        config,
    ));
    let cluster_ips: Api<ClusterIP> = Api::all(client);

    vec![Box::pin(
        Controller::new(
            cluster_ips,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .shutdown_on_signal()
        .run(probe_agent::reconcile, probe_agent::error_policy, ctx)
        .for_each(log_reconcile_result("Probe")),
    )]
}

/// Tracks node fingerprints and reports events that may change grouping
///
/// Node status heartbeats arrive every few seconds and never matter here;
/// only label, taint, and cordon changes plus node removal do.
#[derive(Debug, Default)]
pub struct NodeGroupingTrigger {
    fingerprints: HashMap<String, u64>,
}

impl NodeGroupingTrigger {
    /// Record a watch event; true when ClusterIPs should be re-reconciled
    pub fn observe(&mut self, event: &Event<Node>) -> bool {
        match event {
            Event::Init => {
                self.fingerprints.clear();
                false
            }
            Event::InitApply(node) => {
                self.record(node);
                false
            }
            Event::InitDone => true,
            Event::Apply(node) => self.record(node),
            Event::Delete(node) => self.fingerprints.remove(&node.name_any()).is_some(),
        }
    }

    fn record(&mut self, node: &Node) -> bool {
        let fingerprint = node_fingerprint(node);
        self.fingerprints.insert(node.name_any(), fingerprint) != Some(fingerprint)
    }
}

/// Stream of reconcile-all triggers driven by a background node watch
fn node_grouping_changes(client: Client) -> impl Stream<Item = ()> + Send + Sync + 'static {
    // Capacity 1: a queued trigger already covers any later change.
    let (mut tx, rx) = mpsc::channel(1);
    let nodes: Api<Node> = Api::all(client);

    tokio::spawn(async move {
        let mut trigger = NodeGroupingTrigger::default();
        let events =
            watcher::watcher(nodes, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
                .default_backoff();
        let mut events = std::pin::pin!(events);

        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    if !trigger.observe(&event) {
                        continue;
                    }
                    tracing::debug!("Node grouping may have changed, reconciling all ClusterIPs");
                    if let Err(e) = tx.try_send(()) {
                        if e.is_disconnected() {
                            break;
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Node watch error"),
            }
        }
    });

    rx
}

/// Create a logging closure for controller reconciliation results
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeSpec, NodeStatus, Taint};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn node(name: &str, zone: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    "topology.kubernetes.io/zone".to_string(),
                    zone.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: None,
        }
    }

    /// Story: after the initial list, heartbeats are ignored while a
    /// relabel, a taint, and a removal each trigger exactly once.
    #[test]
    fn story_only_grouping_changes_trigger_reconciles() {
        let mut trigger = NodeGroupingTrigger::default();

        assert!(!trigger.observe(&Event::Init));
        assert!(!trigger.observe(&Event::InitApply(node("w1", "a"))));
        assert!(!trigger.observe(&Event::InitApply(node("w2", "b"))));
        assert!(trigger.observe(&Event::InitDone));

        let mut heartbeat = node("w1", "a");
        heartbeat.status = Some(NodeStatus::default());
        heartbeat.metadata.resource_version = Some("100".to_string());
        assert!(!trigger.observe(&Event::Apply(heartbeat)));

        assert!(trigger.observe(&Event::Apply(node("w1", "c"))));
        assert!(!trigger.observe(&Event::Apply(node("w1", "c"))));

        let mut tainted = node("w2", "b");
        tainted.spec = Some(NodeSpec {
            taints: Some(vec![Taint {
                key: "dedicated".to_string(),
                effect: "NoSchedule".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(trigger.observe(&Event::Apply(tainted)));

        assert!(trigger.observe(&Event::Delete(node("w2", "b"))));
        assert!(!trigger.observe(&Event::Delete(node("w2", "b"))));
    }

    #[test]
    fn new_node_triggers() {
        let mut trigger = NodeGroupingTrigger::default();
        assert!(trigger.observe(&Event::Apply(node("w9", "z"))));
    }

    #[test]
    fn relist_forgets_previous_nodes() {
        let mut trigger = NodeGroupingTrigger::default();
        trigger.observe(&Event::Apply(node("w1", "a")));
        trigger.observe(&Event::Init);
        assert!(!trigger.observe(&Event::Delete(node("w1", "a"))));
    }
}
