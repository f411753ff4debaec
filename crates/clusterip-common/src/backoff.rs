//! Exponential backoff for failed reconciles and startup calls.
//!
//! Reconcilers have no internal retry loop: a failed pass is retried when the
//! controller requeues it. [`ReconcileBackoff`] spaces those requeues out per
//! object. [`retry_with_backoff`] is for one-shot startup work (CRD install,
//! image discovery) where there is no requeue to lean on.

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::{error, warn};

/// Per-object requeue delays: `base * 2^failures`, capped at `max`
#[derive(Debug)]
pub struct ReconcileBackoff {
    base: Duration,
    max: Duration,
    failures: DashMap<String, u32>,
}

impl Default for ReconcileBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl ReconcileBackoff {
    /// Create a backoff with the given base and cap
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: DashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut count = self.failures.entry(key.to_string()).or_insert(0);
        let delay = self.delay_for(*count);
        *count = count.saturating_add(1);
        delay
    }

    /// Forget failures for `key` after a successful pass
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Retry policy for [`retry_with_backoff`]
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = until success or a non-retryable error)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(15),
        }
    }
}

/// Run `operation` until it succeeds, `is_retryable` rejects the error, or
/// `max_attempts` is exhausted. Delays double each time with 0.5x-1.5x jitter.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        let exhausted = config.max_attempts > 0 && attempt >= config.max_attempts;
        if exhausted || !is_retryable(&err) {
            error!(operation = %operation_name, attempt, error = %err, "Operation failed");
            return Err(err);
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let sleep_for = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = sleep_for.as_millis(),
            "Operation failed, retrying"
        );
        tokio::time::sleep(sleep_for).await;
        delay = delay.saturating_mul(2).min(config.max_delay);
    }
}
