//! Error types for the cluster-ip operator
//!
//! Errors carry enough context (resource name, node group, source) to be
//! useful in logs without a debugger attached. Each variant maps onto one
//! failure class of the reconcilers: listing failures abort a pass, lifecycle
//! failures stay local to one node group, write conflicts are retried with a
//! fresh read.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for cluster-ip operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Optimistic concurrency conflict on a write (HTTP 409)
    #[error("write conflict on {resource}: {message}")]
    Conflict {
        /// Resource that was modified concurrently
        resource: String,
        /// Server message
        message: String,
    },

    /// Invalid ClusterIP spec or configuration
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.nodeSpreadLabel")
        field: Option<String>,
    },

    /// External IP resolution failed (disagreement, quorum not met, bad config)
    #[error("ip resolution failed: {message}")]
    Resolution {
        /// Description of what failed
        message: String,
    },

    /// Probe agent lifecycle failure for one node group
    #[error("probe error for node group {group}: {message}")]
    Probe {
        /// Raw node group label value
        group: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "startup")
        context: String,
    },
}

impl Error {
    /// Map a kube error from a write call, turning 409 into [`Error::Conflict`]
    pub fn from_write(resource: impl Into<String>, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                resource: resource.into(),
                message: ae.message,
            },
            other => Self::Kube { source: other },
        }
    }

    /// Create a validation error without resource context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a resolution error
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution {
            message: msg.into(),
        }
    }

    /// Create a probe lifecycle error for a node group
    pub fn probe(group: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Probe {
            group: group.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec or code change.
    /// Kubernetes 4xx responses other than conflicts are not retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Conflict { .. } => true,
            Error::Validation { .. } => false,
            Error::Resolution { .. } => true,
            Error::Probe { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Node group this error is about, if any
    pub fn group(&self) -> Option<&str> {
        match self {
            Error::Probe { group, .. } => Some(group),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: "Test".to_string(),
            code,
        })
    }

    /// Story: a probe writing status while the controller writes too gets a
    /// 409, which must be distinguishable so the caller re-reads and retries.
    #[test]
    fn story_write_conflicts_are_recognised() {
        let err = Error::from_write("default/sample", api_error(409));
        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("default/sample"));

        let err = Error::from_write("default/sample", api_error(500));
        assert!(!err.is_conflict());
        assert!(err.is_retryable());
    }

    #[test]
    fn story_client_errors_are_not_retried() {
        let err = Error::from_write("default/sample", api_error(422));
        assert!(!err.is_retryable());
    }

    /// Story: a bad label key needs a user to edit the resource, so it is
    /// never retried and names the offending field.
    #[test]
    fn story_validation_errors_point_at_the_field() {
        let err = Error::validation_for_field("sample", "spec.nodeSpreadLabel", "must not be empty");
        assert!(!err.is_retryable());
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.nodeSpreadLabel"))
            }
            _ => panic!("Expected Validation variant"),
        }
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn probe_errors_carry_the_group() {
        let err = Error::probe("eu-west-1a", "deployment apply failed");
        assert_eq!(err.group(), Some("eu-west-1a"));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("eu-west-1a"));
        assert_eq!(Error::resolution("x").group(), None);
    }

    #[test]
    fn internal_errors_default_to_unknown_context() {
        let err = Error::internal("boom");
        assert!(err.to_string().contains("[unknown]"));
        let err = Error::internal_with_context("startup", "boom");
        assert!(err.to_string().contains("[startup]"));
    }
}
