//! OpenTelemetry metrics for IP resolution and reconciliation
//!
//! Instruments are created lazily from the global meter provider. Without an
//! OTLP endpoint the provider is a no-op, so recording is always safe.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("cluster-ip"));

// ============================================================================
// IP resolution
// ============================================================================

/// Counter of quorum resolutions
///
/// Labels:
/// - `result`: resolved, disagreement, quorum_not_met, invalid_quorum
pub static IP_RESOLUTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("clusterip_ip_resolutions_total")
        .with_description("Quorum IP resolutions by outcome")
        .with_unit("{resolutions}")
        .build()
});

/// Counter of IP source failures
///
/// Labels:
/// - `source`: source name (e.g. "ipinfo.io")
/// - `kind`: transport, status, decode, missing_field, not_a_string, invalid_ip
pub static IP_SOURCE_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("clusterip_ip_source_failures_total")
        .with_description("Failed or invalid answers from IP sources")
        .with_unit("{failures}")
        .build()
});

/// Histogram of quorum resolution latency
pub static IP_RESOLUTION_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("clusterip_ip_resolution_duration_seconds")
        .with_description("Time to reach (or fail) quorum")
        .with_unit("s")
        .build()
});

// ============================================================================
// Reconciliation
// ============================================================================

/// Histogram of reconcile pass duration
///
/// Labels:
/// - `controller`: convergence, probe
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("clusterip_reconcile_duration_seconds")
        .with_description("Duration of reconcile passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of probe agent lifecycle operations
///
/// Labels:
/// - `operation`: create, update, delete
/// - `result`: success, error
pub static PROBE_OPERATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("clusterip_probe_operations_total")
        .with_description("Probe agent create/update/delete operations")
        .with_unit("{operations}")
        .build()
});

/// Counter of status write conflicts that were retried
pub static STATUS_CONFLICTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("clusterip_status_conflicts_total")
        .with_description("Optimistic concurrency conflicts on status writes")
        .with_unit("{conflicts}")
        .build()
});

/// Record one reconcile pass
pub fn record_reconcile(controller: &'static str, seconds: f64, ok: bool) {
    RECONCILE_DURATION.record(
        seconds,
        &[
            KeyValue::new("controller", controller),
            KeyValue::new("result", if ok { "success" } else { "error" }),
        ],
    );
}

/// Record one probe lifecycle operation
pub fn record_probe_operation(operation: &'static str, ok: bool) {
    PROBE_OPERATIONS.add(
        1,
        &[
            KeyValue::new("operation", operation),
            KeyValue::new("result", if ok { "success" } else { "error" }),
        ],
    );
}
