//! Quorum resolution over unreliable IP sources
//!
//! All sources are queried concurrently and answers are taken in completion
//! order. The first valid IPv4 becomes the candidate; any later valid answer
//! that differs fails the resolution outright, so a result is only returned
//! when every valid answer seen so far is identical. As soon as `min_agree`
//! answers match, the remaining requests are cancelled.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use clusterip_common::metrics::{IP_RESOLUTIONS, IP_RESOLUTION_DURATION, IP_SOURCE_FAILURES};
use clusterip_common::net::parse_ipv4;
use opentelemetry::KeyValue;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::source::IpSource;

/// Why a quorum resolution produced no IP
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// `min_agree` is zero or exceeds the number of sources
    #[error("min_agree must be between 1 and {sources}, got {min_agree}")]
    InvalidQuorum {
        /// Requested agreement count
        min_agree: usize,
        /// Number of configured sources
        sources: usize,
    },

    /// Two sources returned different valid addresses
    #[error("IP sources disagree: {first} vs {second}")]
    Disagreement {
        /// The candidate address
        first: String,
        /// The conflicting address
        second: String,
    },

    /// Every source answered but too few returned a valid address
    #[error("only {valid} of {required} required IP sources returned a valid address")]
    QuorumNotMet {
        /// Valid, agreeing answers received
        valid: usize,
        /// Answers required
        required: usize,
    },
}

impl ResolveError {
    fn result_label(&self) -> &'static str {
        match self {
            ResolveError::InvalidQuorum { .. } => "invalid_quorum",
            ResolveError::Disagreement { .. } => "disagreement",
            ResolveError::QuorumNotMet { .. } => "quorum_not_met",
        }
    }
}

/// Resolves the external IPv4 address of the calling host
#[async_trait]
pub trait IpResolver: Send + Sync {
    /// Return an address confirmed by at least `min_agree` sources
    async fn resolve_ip(&self, min_agree: usize) -> Result<String, ResolveError>;
}

/// [`IpResolver`] that races a fixed set of [`IpSource`]s
pub struct QuorumResolver {
    sources: Vec<Arc<dyn IpSource>>,
}

impl QuorumResolver {
    /// Create a resolver over `sources`
    pub fn new(sources: Vec<Arc<dyn IpSource>>) -> Self {
        Self { sources }
    }

    /// Number of configured sources
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    async fn race(&self, min_agree: usize) -> Result<String, ResolveError> {
        if min_agree == 0 || min_agree > self.sources.len() {
            return Err(ResolveError::InvalidQuorum {
                min_agree,
                sources: self.sources.len(),
            });
        }

        let mut tasks = JoinSet::new();
        for source in &self.sources {
            let source = Arc::clone(source);
            tasks.spawn(async move {
                let answer = source.fetch().await;
                (source.name().to_string(), answer)
            });
        }

        let mut candidate = None;
        let mut agreeing = 0usize;

        // Returning early drops `tasks`, which aborts the requests still in flight.
        while let Some(joined) = tasks.join_next().await {
            let (name, answer) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "IP source task did not complete");
                    record_source_failure("unknown", "task");
                    continue;
                }
            };

            let raw = match answer {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(source = %name, error = %e, "IP source failed");
                    record_source_failure(&name, e.kind());
                    continue;
                }
            };

            let Some(ip) = parse_ipv4(&raw) else {
                debug!(source = %name, answer = %raw, "IP source returned an invalid address");
                record_source_failure(&name, "invalid_ip");
                continue;
            };

            match candidate {
                None => candidate = Some(ip),
                Some(first) if first != ip => {
                    return Err(ResolveError::Disagreement {
                        first: first.to_string(),
                        second: ip.to_string(),
                    });
                }
                Some(_) => {}
            }

            agreeing += 1;
            debug!(source = %name, %ip, agreeing, required = min_agree, "IP source agreed");
            if agreeing >= min_agree {
                return Ok(ip.to_string());
            }
        }

        Err(ResolveError::QuorumNotMet {
            valid: agreeing,
            required: min_agree,
        })
    }
}

#[async_trait]
impl IpResolver for QuorumResolver {
    #[instrument(skip(self), fields(sources = self.sources.len()))]
    async fn resolve_ip(&self, min_agree: usize) -> Result<String, ResolveError> {
        let started = Instant::now();
        let result = self.race(min_agree).await;

        let label = match &result {
            Ok(_) => "resolved",
            Err(e) => e.result_label(),
        };
        IP_RESOLUTIONS.add(1, &[KeyValue::new("result", label)]);
        IP_RESOLUTION_DURATION.record(
            started.elapsed().as_secs_f64(),
            &[KeyValue::new("result", label)],
        );
        result
    }
}

fn record_source_failure(source: &str, kind: &'static str) {
    IP_SOURCE_FAILURES.add(
        1,
        &[
            KeyValue::new("source", source.to_string()),
            KeyValue::new("kind", kind),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceError;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Canned answer after an optional delay, counting calls
    struct FakeSource {
        name: String,
        answer: Result<String, SourceError>,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl IpSource for FakeSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch(&self) -> Result<String, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.answer.clone()
        }
    }

    struct PanickingSource;

    #[async_trait]
    impl IpSource for PanickingSource {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn fetch(&self) -> Result<String, SourceError> {
            panic!("source blew up")
        }
    }

    fn answering(ip: &str) -> Arc<dyn IpSource> {
        answering_after(ip, Duration::ZERO)
    }

    fn answering_after(ip: &str, delay: Duration) -> Arc<dyn IpSource> {
        Arc::new(FakeSource {
            name: format!("echo-{ip}"),
            answer: Ok(ip.to_string()),
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn unreachable(calls: Arc<AtomicUsize>) -> Arc<dyn IpSource> {
        Arc::new(FakeSource {
            name: "down".to_string(),
            answer: Err(SourceError::Transport {
                name: "down".to_string(),
                message: "connection refused".to_string(),
            }),
            delay: Duration::ZERO,
            calls,
        })
    }

    /// Story: three services report the same address and two are required.
    #[tokio::test]
    async fn story_agreeing_sources_resolve() {
        let resolver = QuorumResolver::new(vec![
            answering("203.0.113.7"),
            answering("203.0.113.7"),
            answering("203.0.113.7"),
        ]);
        assert_eq!(resolver.resolve_ip(2).await, Ok("203.0.113.7".to_string()));
    }

    /// Story: two services see different egress addresses. Trusting either
    /// would publish a wrong IP, so the resolution fails.
    #[tokio::test]
    async fn story_disagreement_is_an_error() {
        let resolver = QuorumResolver::new(vec![answering("1.1.1.1"), answering("2.2.2.2")]);
        match resolver.resolve_ip(2).await {
            Err(ResolveError::Disagreement { first, second }) => {
                let mut seen = vec![first, second];
                seen.sort();
                assert_eq!(seen, vec!["1.1.1.1".to_string(), "2.2.2.2".to_string()]);
            }
            other => panic!("expected disagreement, got {other:?}"),
        }
    }

    /// Story: the node has no egress at all. Every source fails and the
    /// resolver reports it instead of hanging or panicking.
    #[tokio::test]
    async fn story_all_unreachable_does_not_meet_quorum() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = QuorumResolver::new(vec![
            unreachable(calls.clone()),
            unreachable(calls.clone()),
            unreachable(calls.clone()),
        ]);
        assert_eq!(
            resolver.resolve_ip(2).await,
            Err(ResolveError::QuorumNotMet {
                valid: 0,
                required: 2
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalid_answers_count_as_failures() {
        let resolver = QuorumResolver::new(vec![
            answering("not-an-ip"),
            answering("256.1.1.1"),
            answering(" 203.0.113.7 "),
            answering("203.0.113.7"),
        ]);
        assert_eq!(resolver.resolve_ip(2).await, Ok("203.0.113.7".to_string()));
    }

    #[tokio::test]
    async fn one_valid_answer_is_not_enough_for_two() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = QuorumResolver::new(vec![answering("203.0.113.7"), unreachable(calls)]);
        assert_eq!(
            resolver.resolve_ip(2).await,
            Err(ResolveError::QuorumNotMet {
                valid: 1,
                required: 2
            })
        );
    }

    #[tokio::test]
    async fn quorum_returns_without_waiting_for_slow_sources() {
        let resolver = QuorumResolver::new(vec![
            answering("203.0.113.7"),
            answering_after("9.9.9.9", Duration::from_secs(30)),
            answering("203.0.113.7"),
        ]);
        let result = tokio::time::timeout(Duration::from_secs(5), resolver.resolve_ip(2))
            .await
            .expect("quorum reached before the slow source answered");
        assert_eq!(result, Ok("203.0.113.7".to_string()));
    }

    #[tokio::test]
    async fn panicking_source_counts_as_failed() {
        let resolver = QuorumResolver::new(vec![
            Arc::new(PanickingSource),
            answering("203.0.113.7"),
            answering("203.0.113.7"),
        ]);
        assert_eq!(resolver.resolve_ip(2).await, Ok("203.0.113.7".to_string()));
    }

    #[rstest]
    #[case::zero(0)]
    #[case::more_than_sources(4)]
    #[tokio::test]
    async fn invalid_quorum_does_no_io(#[case] min_agree: usize) {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = QuorumResolver::new(vec![
            unreachable(calls.clone()),
            unreachable(calls.clone()),
            unreachable(calls.clone()),
        ]);
        assert_eq!(
            resolver.resolve_ip(min_agree).await,
            Err(ResolveError::InvalidQuorum {
                min_agree,
                sources: 3
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn single_source_quorum_of_one() {
        let resolver = QuorumResolver::new(vec![answering("198.51.100.1")]);
        assert_eq!(resolver.source_count(), 1);
        assert_eq!(resolver.resolve_ip(1).await, Ok("198.51.100.1".to_string()));
    }
}
