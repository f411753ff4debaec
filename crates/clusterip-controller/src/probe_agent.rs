//! Probe agent reconcile path
//!
//! A probe agent is bound to one `(label key, group)` pair by its command
//! line. On every trigger it resolves the external IP seen from its node and
//! upserts only its own status entry. It never creates or deletes agents and
//! never touches another group's entry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use clusterip_common::backoff::ReconcileBackoff;
use clusterip_common::crd::{ClusterIP, ClusterIPState};
use clusterip_common::metrics::record_reconcile;
use clusterip_common::{Error, DEFAULT_MIN_AGREE};
use clusterip_resolver::IpResolver;

use crate::kube_client::KubeClient;
use crate::status::{update_status, StatusWrite};

/// Re-check interval, so IP changes are noticed without resource events
pub const PROBE_REQUEUE: Duration = Duration::from_secs(60);

/// Retry delay when every status write attempt conflicted
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(5);

/// Which group this probe reports for
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Node spread label key the probe was started for
    pub label_key: String,
    /// Value of that label on the probe's node
    pub group: String,
    /// Sources that must agree on the IP
    pub min_agree: usize,
}

impl ProbeConfig {
    /// Config for `group` of `label_key` with the default quorum
    pub fn new(label_key: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            label_key: label_key.into(),
            group: group.into(),
            min_agree: DEFAULT_MIN_AGREE,
        }
    }

    /// Override the quorum size
    pub fn with_min_agree(mut self, min_agree: usize) -> Self {
        self.min_agree = min_agree;
        self
    }
}

/// Shared state of a probe agent
pub struct ProbeContext {
    /// Kubernetes access
    pub kube: Arc<dyn KubeClient>,
    /// External IP lookup
    pub resolver: Arc<dyn IpResolver>,
    /// The group this probe reports for
    pub config: ProbeConfig,
    /// Start of this probe process; older entries are rewritten
    pub epoch: DateTime<Utc>,
    /// Per-object requeue delays after failed passes
    pub backoff: ReconcileBackoff,
}

impl ProbeContext {
    /// Create a context whose epoch is now
    pub fn new(
        kube: Arc<dyn KubeClient>,
        resolver: Arc<dyn IpResolver>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            kube,
            resolver,
            config,
            epoch: Utc::now(),
            backoff: ReconcileBackoff::default(),
        }
    }

    /// Override the epoch
    pub fn with_epoch(mut self, epoch: DateTime<Utc>) -> Self {
        self.epoch = epoch;
        self
    }
}

/// Resolve this node group's IP and record it on the ClusterIP
#[instrument(
    skip(cluster_ip, ctx),
    fields(cluster_ip = %cluster_ip.name_any(), group = %ctx.config.group)
)]
pub async fn reconcile(cluster_ip: Arc<ClusterIP>, ctx: Arc<ProbeContext>) -> Result<Action, Error> {
    let started = Instant::now();
    let result = probe_pass(&cluster_ip, &ctx).await;
    record_reconcile("probe", started.elapsed().as_secs_f64(), result.is_ok());
    if result.is_ok() {
        ctx.backoff.reset(&cluster_ip.name_any());
    }
    result
}

/// Back off per object on retryable errors
pub fn error_policy(cluster_ip: Arc<ClusterIP>, error: &Error, ctx: Arc<ProbeContext>) -> Action {
    let name = cluster_ip.name_any();
    if !error.is_retryable() {
        error!(?error, cluster_ip = %name, "probe pass failed permanently");
        return Action::await_change();
    }
    let delay = ctx.backoff.next_delay(&name);
    error!(?error, cluster_ip = %name, delay_secs = delay.as_secs(), "probe pass failed, backing off");
    Action::requeue(delay)
}

async fn probe_pass(cluster_ip: &ClusterIP, ctx: &ProbeContext) -> Result<Action, Error> {
    let config = &ctx.config;

    if cluster_ip.metadata.deletion_timestamp.is_some() {
        debug!("ClusterIP is being deleted, skipping");
        return Ok(Action::await_change());
    }
    if cluster_ip.spec.label_key() != config.label_key {
        debug!(
            expected = %config.label_key,
            actual = %cluster_ip.spec.label_key(),
            "ClusterIP groups by another label, skipping"
        );
        return Ok(Action::await_change());
    }

    let ip = ctx.resolver.resolve_ip(config.min_agree).await?;

    let current = cluster_ip.status.as_ref().and_then(|s| s.entry(&config.group));
    if current.is_some_and(|e| e.ip == ip && e.is_fresh(ctx.epoch)) {
        debug!(%ip, "entry already up to date");
        return Ok(Action::requeue(PROBE_REQUEUE));
    }

    let name = cluster_ip.name_any();
    let namespace = cluster_ip.namespace().ok_or_else(|| {
        Error::validation_for_field(&name, "metadata.namespace", "ClusterIP has no namespace")
    })?;

    let write = update_status(ctx.kube.as_ref(), &namespace, &name, |status| {
        let mut changed = status.upsert_entry(&config.group, &ip, Utc::now());
        if status.state.is_none() {
            status.state = Some(ClusterIPState::Processing);
            changed = true;
        }
        changed
    })
    .await?;

    match write {
        StatusWrite::Written | StatusWrite::Unchanged => {
            info!(%ip, ?write, "reported external IP");
            Ok(Action::requeue(PROBE_REQUEUE))
        }
        StatusWrite::ConflictsExhausted => {
            warn!(%ip, "external IP not recorded, status writes kept conflicting");
            Ok(Action::requeue(CONFLICT_REQUEUE))
        }
        StatusWrite::Gone => {
            debug!(%ip, "ClusterIP disappeared before the IP was recorded");
            Ok(Action::await_change())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::MockKubeClient;
    use crate::status::MAX_STATUS_ATTEMPTS;
    use async_trait::async_trait;
    use clusterip_common::crd::{ClusterIPSpec, ClusterIPStatus};
    use clusterip_resolver::ResolveError;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const ZONE: &str = "topology.kubernetes.io/zone";

    struct StaticResolver {
        answer: Result<String, ResolveError>,
        calls: AtomicUsize,
    }

    impl StaticResolver {
        fn ok(ip: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: Ok(ip.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(err: ResolveError) -> Arc<Self> {
            Arc::new(Self {
                answer: Err(err),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl IpResolver for StaticResolver {
        async fn resolve_ip(&self, _min_agree: usize) -> Result<String, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    fn sample(status: Option<ClusterIPStatus>) -> ClusterIP {
        let mut cip = ClusterIP::new("sample", ClusterIPSpec::default());
        cip.metadata.namespace = Some("default".to_string());
        cip.status = status;
        cip
    }

    /// Mock kube client over one stored ClusterIP; returns the store
    fn stored_kube(cip: &ClusterIP) -> (MockKubeClient, Arc<Mutex<ClusterIP>>) {
        let store = Arc::new(Mutex::new(cip.clone()));
        let mut mock = MockKubeClient::new();
        let s = store.clone();
        mock.expect_get_cluster_ip().returning(move |_, _| {
            Ok(Some(s.lock().expect("mutex should not be poisoned").clone()))
        });
        let s = store.clone();
        mock.expect_replace_status().returning(move |cip| {
            let mut stored = s.lock().expect("mutex should not be poisoned");
            stored.status = cip.status.clone();
            Ok(stored.clone())
        });
        (mock, store)
    }

    fn context(kube: MockKubeClient, resolver: Arc<StaticResolver>, epoch: DateTime<Utc>) -> Arc<ProbeContext> {
        Arc::new(
            ProbeContext::new(Arc::new(kube), resolver, ProbeConfig::new(ZONE, "zone-a"))
                .with_epoch(epoch),
        )
    }

    fn stored_status(store: &Arc<Mutex<ClusterIP>>) -> ClusterIPStatus {
        store
            .lock()
            .expect("mutex should not be poisoned")
            .status
            .clone()
            .unwrap_or_default()
    }

    /// Story: the first report of a group creates its entry and marks the
    /// resource Processing, leaving other groups alone.
    #[tokio::test]
    async fn story_first_report_creates_entry() {
        let before = Utc::now() - chrono::Duration::seconds(1);
        let mut status = ClusterIPStatus::default();
        status.upsert_entry("zone-b", "198.51.100.2", before);
        let cip = sample(Some(status));
        let (kube, store) = stored_kube(&cip);
        let ctx = context(kube, StaticResolver::ok("203.0.113.7"), before);

        let action = reconcile(Arc::new(cip), ctx).await.expect("probe pass");

        assert_eq!(action, Action::requeue(PROBE_REQUEUE));
        let status = stored_status(&store);
        assert_eq!(status.state, Some(ClusterIPState::Processing));
        let entry = status.entry("zone-a").expect("own entry written");
        assert_eq!(entry.ip, "203.0.113.7");
        assert!(entry.is_fresh(before));
        assert_eq!(status.entry("zone-b").map(|e| e.ip.as_str()), Some("198.51.100.2"));
        assert_eq!(status.entry("zone-b").map(|e| e.last_update_time), Some(before));
    }

    /// Story: the IP is unchanged and was written by this probe process.
    /// Nothing is written.
    #[tokio::test]
    async fn story_fresh_identical_entry_is_left_alone() {
        let epoch = Utc::now() - chrono::Duration::seconds(60);
        let mut status = ClusterIPStatus::default();
        status.upsert_entry("zone-a", "203.0.113.7", epoch + chrono::Duration::seconds(30));
        let cip = sample(Some(status));
        let mut kube = MockKubeClient::new();
        kube.expect_replace_status().never();
        kube.expect_get_cluster_ip().never();
        let ctx = context(kube, StaticResolver::ok("203.0.113.7"), epoch);

        let action = reconcile(Arc::new(cip), ctx).await.expect("probe pass");
        assert_eq!(action, Action::requeue(PROBE_REQUEUE));
    }

    #[tokio::test]
    async fn stale_entry_is_refreshed() {
        let epoch = Utc::now() - chrono::Duration::seconds(5);
        let old = epoch - chrono::Duration::seconds(600);
        let mut status = ClusterIPStatus::default();
        status.upsert_entry("zone-a", "203.0.113.7", old);
        status.state = Some(ClusterIPState::Ready);
        let cip = sample(Some(status));
        let (kube, store) = stored_kube(&cip);
        let ctx = context(kube, StaticResolver::ok("203.0.113.7"), epoch);

        reconcile(Arc::new(cip), ctx).await.expect("probe pass");

        let status = stored_status(&store);
        let entry = status.entry("zone-a").expect("entry kept");
        assert!(entry.is_fresh(epoch));
        assert_eq!(status.state, Some(ClusterIPState::Ready));
    }

    #[tokio::test]
    async fn changed_ip_is_rewritten() {
        let epoch = Utc::now() - chrono::Duration::seconds(60);
        let mut status = ClusterIPStatus::default();
        status.upsert_entry("zone-a", "203.0.113.7", epoch + chrono::Duration::seconds(30));
        let cip = sample(Some(status));
        let (kube, store) = stored_kube(&cip);
        let ctx = context(kube, StaticResolver::ok("203.0.113.99"), epoch);

        reconcile(Arc::new(cip), ctx).await.expect("probe pass");

        let status = stored_status(&store);
        assert_eq!(status.node_ips.len(), 1);
        assert_eq!(status.entry("zone-a").map(|e| e.ip.as_str()), Some("203.0.113.99"));
    }

    #[tokio::test]
    async fn other_label_key_is_ignored() {
        let mut cip = sample(None);
        cip.spec.node_spread_label = "kubernetes.io/hostname".to_string();
        let mut kube = MockKubeClient::new();
        kube.expect_replace_status().never();
        let resolver = StaticResolver::ok("203.0.113.7");
        let ctx = context(kube, resolver.clone(), Utc::now());

        let action = reconcile(Arc::new(cip), ctx).await.expect("probe pass");
        assert_eq!(action, Action::await_change());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deleting_resource_is_ignored() {
        let mut cip = sample(None);
        cip.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let mut kube = MockKubeClient::new();
        kube.expect_replace_status().never();
        let resolver = StaticResolver::ok("203.0.113.7");
        let ctx = context(kube, resolver.clone(), Utc::now());

        let action = reconcile(Arc::new(cip), ctx).await.expect("probe pass");
        assert_eq!(action, Action::await_change());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    /// Story: the IP sources disagree. Nothing is written and the error is
    /// retried with backoff.
    #[tokio::test]
    async fn story_resolution_failure_writes_nothing() {
        let cip = sample(None);
        let mut kube = MockKubeClient::new();
        kube.expect_replace_status().never();
        let ctx = context(
            kube,
            StaticResolver::failing(ResolveError::Disagreement {
                first: "1.1.1.1".to_string(),
                second: "2.2.2.2".to_string(),
            }),
            Utc::now(),
        );

        let cip = Arc::new(cip);
        let err = reconcile(cip.clone(), ctx.clone())
            .await
            .expect_err("disagreement fails the pass");
        assert!(matches!(err, Error::Resolution { .. }));

        assert_eq!(
            error_policy(cip.clone(), &err, ctx.clone()),
            Action::requeue(Duration::from_secs(5))
        );
        assert_eq!(
            error_policy(cip, &err, ctx),
            Action::requeue(Duration::from_secs(10))
        );
    }

    /// Story: the controller keeps rewriting the status while this agent
    /// reports. Nothing lands, so the agent retries soon instead of waiting
    /// for its regular re-check.
    #[tokio::test]
    async fn story_exhausted_conflicts_retry_soon() {
        let cip = sample(None);
        let mut kube = MockKubeClient::new();
        let stored = cip.clone();
        kube.expect_get_cluster_ip()
            .times(MAX_STATUS_ATTEMPTS)
            .returning(move |_, _| Ok(Some(stored.clone())));
        kube.expect_replace_status()
            .times(MAX_STATUS_ATTEMPTS)
            .returning(|_| {
                Err(Error::Conflict {
                    resource: "sample".to_string(),
                    message: "the object has been modified".to_string(),
                })
            });
        let ctx = context(kube, StaticResolver::ok("203.0.113.7"), Utc::now());

        let action = reconcile(Arc::new(cip), ctx).await.expect("probe pass");
        assert_eq!(action, Action::requeue(CONFLICT_REQUEUE));
    }

    #[tokio::test]
    async fn vanished_resource_waits_for_change() {
        let cip = sample(None);
        let mut kube = MockKubeClient::new();
        kube.expect_get_cluster_ip().returning(|_, _| Ok(None));
        kube.expect_replace_status().never();
        let ctx = context(kube, StaticResolver::ok("203.0.113.7"), Utc::now());

        let action = reconcile(Arc::new(cip), ctx).await.expect("probe pass");
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn config_defaults_to_two_sources() {
        let config = ProbeConfig::new(ZONE, "zone-a");
        assert_eq!(config.min_agree, 2);
        assert_eq!(config.with_min_agree(3).min_agree, 3);
    }
}
