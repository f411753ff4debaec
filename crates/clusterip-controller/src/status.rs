//! Optimistic read-modify-write of ClusterIP status
//!
//! Both reconcilers write the same status object: the convergence reconciler
//! owns `state`, `info` and the entry set, each probe agent owns one entry.
//! Writes always start from a fresh read and carry its resourceVersion, so a
//! concurrent writer causes a conflict instead of a lost update.

use clusterip_common::crd::ClusterIPStatus;
use clusterip_common::metrics::STATUS_CONFLICTS;
use clusterip_common::Error;
use tracing::{debug, warn};

use crate::kube_client::KubeClient;

/// Attempts per status write before giving up until the next pass
pub const MAX_STATUS_ATTEMPTS: usize = 5;

/// What happened to a status write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusWrite {
    /// The status was replaced
    Written,
    /// The mutation found nothing to change; no request was sent
    Unchanged,
    /// The resource no longer exists
    Gone,
    /// Every attempt hit a conflict
    ConflictsExhausted,
}

/// Apply `mutate` to a fresh copy of the status and write it back.
///
/// `mutate` returns whether it changed anything. It may run several times,
/// once per attempt, always on the latest stored status.
pub async fn update_status<F>(
    kube: &dyn KubeClient,
    namespace: &str,
    name: &str,
    mut mutate: F,
) -> Result<StatusWrite, Error>
where
    F: FnMut(&mut ClusterIPStatus) -> bool + Send,
{
    for attempt in 1..=MAX_STATUS_ATTEMPTS {
        let Some(mut current) = kube.get_cluster_ip(namespace, name).await? else {
            debug!("ClusterIP disappeared before status write");
            return Ok(StatusWrite::Gone);
        };

        let mut status = current.status.clone().unwrap_or_default();
        if !mutate(&mut status) {
            return Ok(StatusWrite::Unchanged);
        }
        current.status = Some(status);

        match kube.replace_status(&current).await {
            Ok(_) => return Ok(StatusWrite::Written),
            Err(e) if e.is_conflict() => {
                STATUS_CONFLICTS.add(1, &[]);
                debug!(attempt, error = %e, "status write conflicted, re-reading");
            }
            Err(e) => return Err(e),
        }
    }

    warn!(
        attempts = MAX_STATUS_ATTEMPTS,
        "status write kept conflicting, deferring to next pass"
    );
    Ok(StatusWrite::ConflictsExhausted)
}
