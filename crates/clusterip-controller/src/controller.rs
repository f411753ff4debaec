//! ClusterIP convergence reconciler
//!
//! Level-triggered: every pass recomputes the node groups, compares them
//! with the status entries, and drives one probe agent per group that has
//! no fresh, valid IP. Once a group's entry is confirmed its probe is
//! deleted. The aggregate state is `Ready` when every group is confirmed.
//!
//! Freshness is judged against the start time of this process: an entry
//! written before the controller started is not trusted until a probe
//! confirms it again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use clusterip_common::backoff::ReconcileBackoff;
use clusterip_common::crd::{ClusterIP, ClusterIPState, ClusterIPStatus};
use clusterip_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use clusterip_common::metrics::record_reconcile;
use clusterip_common::net::is_valid_ipv4;
use clusterip_common::{Error, CLUSTER_IP_FINALIZER, DEFAULT_SYSTEM_NAMESPACE};

use crate::groups::NodeGroupEnumerator;
use crate::kube_client::{KubeClient, KubeClientImpl};
use crate::probe::{DeploymentProbeRuntime, ProbeAction, ProbeManager, ProbeRuntime};
use crate::status::{update_status, StatusWrite};

/// Requeue interval once every group is confirmed
pub const READY_REQUEUE: Duration = Duration::from_secs(300);
/// Requeue interval while groups are still pending
pub const PROCESSING_REQUEUE: Duration = Duration::from_secs(15);

/// Service account probe agents run as unless configured otherwise
pub const DEFAULT_PROBE_SERVICE_ACCOUNT: &str = "cluster-ip-controller-manager";

const CONTROLLER_NAME: &str = "cluster-ip-controller";

// =============================================================================
// Context
// =============================================================================

/// Shared state of the convergence reconciler
pub struct Context {
    /// Kubernetes access
    pub kube: Arc<dyn KubeClient>,
    /// Node group lookup
    pub groups: NodeGroupEnumerator,
    /// Probe agent lifecycle
    pub probes: ProbeManager,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Per-object requeue delays after failed passes
    pub backoff: ReconcileBackoff,
    /// Image probe agents run
    pub probe_image: String,
    /// Entries must be newer than this to count as confirmed
    pub epoch: DateTime<Utc>,
}

impl Context {
    /// Start building a context around a kube client
    pub fn builder(client: Client, probe_image: impl Into<String>) -> ContextBuilder {
        ContextBuilder::new(client, probe_image.into())
    }

    /// Assemble a context from explicit collaborators
    pub fn from_parts(
        kube: Arc<dyn KubeClient>,
        runtime: Arc<dyn ProbeRuntime>,
        events: Arc<dyn EventPublisher>,
        probe_image: impl Into<String>,
        epoch: DateTime<Utc>,
    ) -> Self {
        Self {
            groups: NodeGroupEnumerator::new(kube.clone()),
            kube,
            probes: ProbeManager::new(runtime, epoch),
            events,
            backoff: ReconcileBackoff::default(),
            probe_image: probe_image.into(),
            epoch,
        }
    }

    /// Context with mocks, no events, and a fixed epoch
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        runtime: Arc<dyn ProbeRuntime>,
        epoch: DateTime<Utc>,
    ) -> Self {
        Self::from_parts(
            kube,
            runtime,
            Arc::new(clusterip_common::events::NoopEventPublisher),
            "registry.example/cluster-ip:test",
            epoch,
        )
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    probe_image: String,
    namespace: String,
    service_account: String,
    epoch: Option<DateTime<Utc>>,
    kube: Option<Arc<dyn KubeClient>>,
    runtime: Option<Arc<dyn ProbeRuntime>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client, probe_image: String) -> Self {
        Self {
            client,
            probe_image,
            namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            service_account: DEFAULT_PROBE_SERVICE_ACCOUNT.to_string(),
            epoch: None,
            kube: None,
            runtime: None,
            events: None,
        }
    }

    /// Namespace probe agents are created in
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Service account probe agents run as
    pub fn service_account(mut self, service_account: impl Into<String>) -> Self {
        self.service_account = service_account.into();
        self
    }

    /// Override the freshness epoch (defaults to now)
    pub fn epoch(mut self, epoch: DateTime<Utc>) -> Self {
        self.epoch = Some(epoch);
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the probe runtime (primarily for testing)
    pub fn probe_runtime(mut self, runtime: Arc<dyn ProbeRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone())));
        let runtime = self.runtime.unwrap_or_else(|| {
            Arc::new(DeploymentProbeRuntime::new(
                self.client.clone(),
                self.namespace,
                self.service_account,
            ))
        });
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME)));
        Context::from_parts(
            kube,
            runtime,
            events,
            self.probe_image,
            self.epoch.unwrap_or_else(Utc::now),
        )
    }
}

// =============================================================================
// Planning
// =============================================================================

/// Why a group has no confirmed IP
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingReason {
    /// No entry for the group
    NoEntry,
    /// Valid IP, but written before the epoch
    Stale,
    /// Empty or malformed IP
    InvalidIp,
}

/// Decision for one node group
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupPlan {
    /// Fresh, valid IP; the probe agent is no longer needed
    Converged {
        /// The confirmed address
        ip: String,
    },
    /// A probe agent must run for this group
    Pending {
        /// What is missing
        reason: PendingReason,
    },
}

/// Per-pass decision for every desired group, in enumeration order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConvergencePlan {
    /// `(group, decision)` pairs
    pub groups: Vec<(String, GroupPlan)>,
}

impl ConvergencePlan {
    /// Every desired group converged (true when there are none)
    pub fn is_ready(&self) -> bool {
        self.groups
            .iter()
            .all(|(_, plan)| matches!(plan, GroupPlan::Converged { .. }))
    }

    /// Number of converged groups
    pub fn converged_count(&self) -> usize {
        self.groups
            .iter()
            .filter(|(_, plan)| matches!(plan, GroupPlan::Converged { .. }))
            .count()
    }

    /// Confirmed `(group, ip)` pairs of this pass
    pub fn confirmed(&self) -> impl Iterator<Item = (&str, &str)> {
        self.groups.iter().filter_map(|(group, plan)| match plan {
            GroupPlan::Converged { ip } => Some((group.as_str(), ip.as_str())),
            GroupPlan::Pending { .. } => None,
        })
    }
}

/// Decide, for each desired group, whether its entry is confirmed
pub fn plan_convergence(
    desired: &[String],
    status: Option<&ClusterIPStatus>,
    epoch: DateTime<Utc>,
) -> ConvergencePlan {
    let groups = desired
        .iter()
        .map(|group| {
            let plan = match status.and_then(|s| s.entry(group)) {
                None => GroupPlan::Pending {
                    reason: PendingReason::NoEntry,
                },
                Some(entry) if !is_valid_ipv4(&entry.ip) => GroupPlan::Pending {
                    reason: PendingReason::InvalidIp,
                },
                Some(entry) if !entry.is_fresh(epoch) => GroupPlan::Pending {
                    reason: PendingReason::Stale,
                },
                Some(entry) => GroupPlan::Converged {
                    ip: entry.ip.clone(),
                },
            };
            (group.clone(), plan)
        })
        .collect();
    ConvergencePlan { groups }
}

fn summarize(plan: &ConvergencePlan, label_key: &str, failures: &[Error]) -> String {
    let total = plan.groups.len();
    if total == 0 {
        return format!("no schedulable node carries label {label_key}");
    }
    let mut info = format!("{} of {total} node groups converged", plan.converged_count());
    if !failures.is_empty() {
        let details: Vec<String> = failures.iter().map(|e| e.to_string()).collect();
        info.push_str("; ");
        info.push_str(&details.join("; "));
    }
    info
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile one ClusterIP
#[instrument(skip(cluster_ip, ctx), fields(cluster_ip = %cluster_ip.name_any(), namespace = ?cluster_ip.namespace()))]
pub async fn reconcile(cluster_ip: Arc<ClusterIP>, ctx: Arc<Context>) -> Result<Action, Error> {
    let started = Instant::now();
    let result = reconcile_pass(&cluster_ip, &ctx).await;
    record_reconcile("convergence", started.elapsed().as_secs_f64(), result.is_ok());
    if result.is_ok() {
        ctx.backoff.reset(&object_key(&cluster_ip));
    }
    result
}

/// Requeue with per-object exponential backoff, or wait for a spec change
/// when retrying cannot help
pub fn error_policy(cluster_ip: Arc<ClusterIP>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(&cluster_ip);
    if !error.is_retryable() {
        error!(?error, cluster_ip = %key, "reconciliation failed permanently");
        return Action::await_change();
    }
    let delay = ctx.backoff.next_delay(&key);
    error!(
        ?error,
        cluster_ip = %key,
        delay_secs = delay.as_secs(),
        "reconciliation failed, backing off"
    );
    Action::requeue(delay)
}

fn object_key(cluster_ip: &ClusterIP) -> String {
    format!(
        "{}/{}",
        cluster_ip.namespace().unwrap_or_default(),
        cluster_ip.name_any()
    )
}

async fn reconcile_pass(cluster_ip: &ClusterIP, ctx: &Context) -> Result<Action, Error> {
    let name = cluster_ip.name_any();
    let namespace = cluster_ip.namespace().ok_or_else(|| {
        Error::validation_for_field(&name, "metadata.namespace", "ClusterIP has no namespace")
    })?;
    let label_key = cluster_ip.spec.label_key().to_string();

    if cluster_ip.metadata.deletion_timestamp.is_some() {
        return handle_deletion(cluster_ip, ctx, &namespace, &name, &label_key).await;
    }

    if !cluster_ip.finalizers().iter().any(|f| f == CLUSTER_IP_FINALIZER) {
        debug!("adding finalizer");
        ctx.kube
            .add_finalizer(&namespace, &name, CLUSTER_IP_FINALIZER)
            .await?;
    }

    let obj_ref = cluster_ip.object_ref(&());

    if let Err(message) = cluster_ip.spec.validate() {
        warn!(%message, "invalid ClusterIP spec");
        let write = update_status(ctx.kube.as_ref(), &namespace, &name, |status| {
            set_state(status, ClusterIPState::Error, Some(message.clone()))
        })
        .await?;
        if write == StatusWrite::Written {
            ctx.events
                .publish(
                    &obj_ref,
                    EventType::Warning,
                    reasons::VALIDATION_FAILED,
                    actions::RECONCILE,
                    Some(message),
                )
                .await;
        }
        return Ok(Action::await_change());
    }

    let groups = ctx.groups.enumerate(&label_key).await?;
    let plan = plan_convergence(&groups, cluster_ip.status.as_ref(), ctx.epoch);
    debug!(
        groups = groups.len(),
        converged = plan.converged_count(),
        "planned convergence"
    );

    let mut failures = Vec::new();
    for (group, group_plan) in &plan.groups {
        if let Err(e) = converge_group(ctx, &obj_ref, &label_key, group, group_plan).await {
            warn!(group = %group, error = %e, "probe agent operation failed");
            ctx.events
                .publish(
                    &obj_ref,
                    EventType::Warning,
                    reasons::PROBE_FAILED,
                    actions::MANAGE_PROBE,
                    Some(e.to_string()),
                )
                .await;
            failures.push(e);
        }
    }

    let state = if plan.is_ready() {
        ClusterIPState::Ready
    } else {
        ClusterIPState::Processing
    };
    let info = summarize(&plan, &label_key, &failures);
    let prune = cluster_ip.spec.prune_stale_entries;

    let write = update_status(ctx.kube.as_ref(), &namespace, &name, |status| {
        let mut changed = false;
        if prune {
            let removed = status.retain_groups(&groups);
            if !removed.is_empty() {
                info!(?removed, "pruned entries of vanished node groups");
                changed = true;
            }
        }
        set_state(status, state, Some(info.clone())) || changed
    })
    .await?;

    let previous = cluster_ip.status.as_ref().and_then(|s| s.state);
    if write == StatusWrite::Written && state == ClusterIPState::Ready && previous != Some(state) {
        info!(groups = groups.len(), "ClusterIP ready");
        ctx.events
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::CLUSTER_IP_READY,
                actions::RECONCILE,
                Some(info.clone()),
            )
            .await;
    }

    match (write, state) {
        (StatusWrite::ConflictsExhausted, _) => Ok(Action::requeue(PROCESSING_REQUEUE)),
        (_, ClusterIPState::Ready) => Ok(Action::requeue(READY_REQUEUE)),
        _ => Ok(Action::requeue(PROCESSING_REQUEUE)),
    }
}

/// Set state and info, reporting whether either changed
fn set_state(status: &mut ClusterIPStatus, state: ClusterIPState, info: Option<String>) -> bool {
    let mut changed = false;
    if status.state != Some(state) {
        status.state = Some(state);
        changed = true;
    }
    if status.info != info {
        status.info = info;
        changed = true;
    }
    changed
}

async fn converge_group(
    ctx: &Context,
    obj_ref: &k8s_openapi::api::core::v1::ObjectReference,
    label_key: &str,
    group: &str,
    plan: &GroupPlan,
) -> Result<(), Error> {
    match plan {
        GroupPlan::Converged { ip } => {
            let Some(handle) = ctx.probes.find_agent(group).await? else {
                return Ok(());
            };
            ctx.probes.delete_agent(&handle).await?;
            info!(group, %ip, probe = %handle.name, "node group converged, probe agent deleted");
            ctx.events
                .publish(
                    obj_ref,
                    EventType::Normal,
                    reasons::GROUP_CONVERGED,
                    actions::RECONCILE,
                    Some(format!("node group {group} resolved to {ip}")),
                )
                .await;
            ctx.events
                .publish(
                    obj_ref,
                    EventType::Normal,
                    reasons::PROBE_DELETED,
                    actions::MANAGE_PROBE,
                    Some(format!("deleted probe agent {}", handle.name)),
                )
                .await;
            Ok(())
        }
        GroupPlan::Pending { reason } => {
            let image = ctx.probe_image.as_str();
            let mut action = None;

            // A probe applied by an earlier controller may hold an entry it
            // considers fresh while we do not; only a new probe rewrites it.
            if *reason == PendingReason::Stale {
                if let Some(existing) = ctx.probes.find_agent(group).await? {
                    if !ctx.probes.is_owned(&existing) {
                        action = Some(
                            ctx.probes
                                .replace_agent(&existing, label_key, group, image)
                                .await?,
                        );
                    }
                }
            }
            let action = match action {
                Some(action) => action,
                None => ctx.probes.ensure_agent(label_key, group, image).await?,
            };

            if action != ProbeAction::Unchanged {
                info!(group, ?reason, ?action, "probe agent scheduled");
                ctx.events
                    .publish(
                        obj_ref,
                        EventType::Normal,
                        reasons::PROBE_CREATED,
                        actions::MANAGE_PROBE,
                        Some(format!("probe agent for node group {group}: {action:?}")),
                    )
                    .await;
            }
            Ok(())
        }
    }
}

async fn handle_deletion(
    cluster_ip: &ClusterIP,
    ctx: &Context,
    namespace: &str,
    name: &str,
    label_key: &str,
) -> Result<Action, Error> {
    if !cluster_ip.finalizers().iter().any(|f| f == CLUSTER_IP_FINALIZER) {
        return Ok(Action::await_change());
    }
    info!("ClusterIP deleted, tearing down probe agents");

    if let Err(e) = update_status(ctx.kube.as_ref(), namespace, name, |status| {
        let info = status.info.clone();
        set_state(status, ClusterIPState::Deleting, info)
    })
    .await
    {
        warn!(error = %e, "failed to mark ClusterIP as deleting");
    }

    let mut groups: Vec<String> = cluster_ip
        .status
        .iter()
        .flat_map(|s| s.node_ips.iter().map(|e| e.node_label.clone()))
        .collect();
    match ctx.groups.enumerate(label_key).await {
        Ok(live) => {
            for group in live {
                if !groups.contains(&group) {
                    groups.push(group);
                }
            }
        }
        Err(e) => warn!(error = %e, "node listing failed, deleting probes of known groups only"),
    }

    for group in &groups {
        if let Some(handle) = ctx.probes.find_agent(group).await? {
            ctx.probes.delete_agent(&handle).await?;
            debug!(group = %group, probe = %handle.name, "deleted probe agent");
        }
    }

    ctx.kube
        .remove_finalizer(namespace, name, CLUSTER_IP_FINALIZER)
        .await?;
    ctx.events
        .publish(
            &cluster_ip.object_ref(&()),
            EventType::Normal,
            reasons::PROBE_DELETED,
            actions::DELETE,
            Some(format!("removed probe agents of {} node groups", groups.len())),
        )
        .await;
    Ok(Action::await_change())
}
