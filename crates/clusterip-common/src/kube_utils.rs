//! Kubernetes helpers shared by the controller and the probe agents

use std::time::Duration;

use kube::{Client, Config};

use crate::Error;

/// Connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for kube clients; watches are closed server-side before this
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from the in-cluster or local config with default timeouts
pub async fn create_client() -> Result<Client, Error> {
    let mut config = Config::infer().await.map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
    })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Whether a kube error is a 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Compute a deterministic hash of the input string as 16 hex chars.
///
/// Truncated SHA-256, so the value is stable across processes, restarts and
/// toolchains (`DefaultHasher` is not). Safe to embed in object names and
/// label values whatever characters the input contains.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    use std::fmt::Write;

    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_label_safe() {
        let first = deterministic_hash("zone-a");
        assert_eq!(first, deterministic_hash("zone-a"));
        assert_eq!(first.len(), 16);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(first, deterministic_hash("zone-b"));
    }

    #[test]
    fn hash_matches_known_sha256_prefix() {
        // sha256("") = e3b0c44298fc1c149afbf4c8996fb924...
        assert_eq!(deterministic_hash(""), "e3b0c44298fc1c14");
    }

    #[test]
    fn hash_accepts_characters_invalid_in_names() {
        let hash = deterministic_hash("eu-west/1a:weird value");
        assert_eq!(hash.len(), 16);
    }

    #[test]
    fn not_found_detection() {
        let err = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(is_not_found(&err));
    }
}
