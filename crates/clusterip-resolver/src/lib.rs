//! External IPv4 resolution for cluster-ip probe agents
//!
//! A probe agent asks several public "what is my IP" services and only
//! trusts an answer once enough of them agree. [`source`] adapts one HTTP
//! service into an [`IpSource`]; [`quorum`] races the sources and applies
//! the agreement rule.

#![deny(missing_docs)]

pub mod quorum;
pub mod source;

pub use quorum::{IpResolver, QuorumResolver, ResolveError};
pub use source::{default_sources, HttpIpSource, IpSource, SourceError, SourceSpec};

impl From<ResolveError> for clusterip_common::Error {
    fn from(err: ResolveError) -> Self {
        clusterip_common::Error::resolution(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_errors_become_retryable_resolution_errors() {
        let err: clusterip_common::Error = ResolveError::Disagreement {
            first: "1.1.1.1".to_string(),
            second: "2.2.2.2".to_string(),
        }
        .into();
        assert!(matches!(err, clusterip_common::Error::Resolution { .. }));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("2.2.2.2"));
    }
}
