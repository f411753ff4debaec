//! HTTP IP echo services
//!
//! Each service answers a GET with a JSON document holding the caller's
//! address in some string field. The field is addressed with a dotted path
//! (`ip`, `ip_addr`, `data.ip`) and looked up without guessing: a missing
//! field or a non-string value is an error of its own kind.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde_json::Value;
use thiserror::Error;

/// Default per-request timeout for IP sources
pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why one IP source failed to produce an answer
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Connection, TLS, or timeout failure
    #[error("{name}: request failed: {message}")]
    Transport {
        /// Source name
        name: String,
        /// Underlying error
        message: String,
    },

    /// Non-2xx response
    #[error("{name}: unexpected HTTP status {status}")]
    Status {
        /// Source name
        name: String,
        /// HTTP status code
        status: u16,
    },

    /// Body is not JSON
    #[error("{name}: response is not JSON: {message}")]
    Decode {
        /// Source name
        name: String,
        /// Parser error
        message: String,
    },

    /// The configured field is absent
    #[error("{name}: response has no field {field:?}")]
    MissingField {
        /// Source name
        name: String,
        /// Dotted field path
        field: String,
    },

    /// The configured field holds something other than a string
    #[error("{name}: field {field:?} is not a string")]
    NotAString {
        /// Source name
        name: String,
        /// Dotted field path
        field: String,
    },
}

impl SourceError {
    /// Short failure class, used as a metric label
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Transport { .. } => "transport",
            SourceError::Status { .. } => "status",
            SourceError::Decode { .. } => "decode",
            SourceError::MissingField { .. } => "missing_field",
            SourceError::NotAString { .. } => "not_a_string",
        }
    }
}

/// One service that reports the caller's external IP as text
#[async_trait]
pub trait IpSource: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &str;

    /// Ask the service once. The returned text is not validated.
    async fn fetch(&self) -> Result<String, SourceError>;
}

/// Where to find an IP source and which field to read
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceSpec {
    /// Name used in logs and metrics
    pub name: String,
    /// URL to GET
    pub url: String,
    /// Dotted path of the string field holding the IP
    pub field_path: String,
}

impl SourceSpec {
    /// Create a source spec
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        field_path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            field_path: field_path.into(),
        }
    }
}

/// Parses `name=url#field`; `#field` may be omitted and defaults to `ip`
impl FromStr for SourceSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("expected name=url#field, got {s:?}"))?;
        let (url, field) = match rest.rsplit_once('#') {
            Some((url, field)) => (url, field),
            None => (rest, "ip"),
        };

        let name = name.trim();
        if name.is_empty() {
            return Err(format!("source name is empty in {s:?}"));
        }
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(format!("source url must be http(s), got {url:?}"));
        }
        if field.is_empty() || field.split('.').any(str::is_empty) {
            return Err(format!("invalid field path {field:?}"));
        }
        Ok(Self::new(name, url, field))
    }
}

/// The public services queried when none are configured
pub fn default_sources() -> Vec<SourceSpec> {
    vec![
        SourceSpec::new("ipwho.is", "https://ipwho.is", "ip"),
        SourceSpec::new("jsonip.com", "https://jsonip.com", "ip"),
        SourceSpec::new("ifconfig.me", "https://ifconfig.me/all.json", "ip_addr"),
        SourceSpec::new("ipinfo.io", "https://ipinfo.io/json", "ip"),
    ]
}

/// [`IpSource`] backed by one HTTPS GET
pub struct HttpIpSource {
    spec: SourceSpec,
    client: reqwest::Client,
}

impl HttpIpSource {
    /// Wrap `spec` using a shared HTTP client
    pub fn new(spec: SourceSpec, client: reqwest::Client) -> Self {
        Self { spec, client }
    }

    /// Build one source per spec, sharing a client with the given timeout
    pub fn build_all(
        specs: Vec<SourceSpec>,
        timeout: Duration,
    ) -> Result<Vec<Arc<dyn IpSource>>, clusterip_common::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cluster-ip/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                clusterip_common::Error::internal_with_context(
                    "ip_sources",
                    format!("failed to build HTTP client: {e}"),
                )
            })?;
        Ok(specs
            .into_iter()
            .map(|spec| Arc::new(Self::new(spec, client.clone())) as Arc<dyn IpSource>)
            .collect())
    }
}

#[async_trait]
impl IpSource for HttpIpSource {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn fetch(&self) -> Result<String, SourceError> {
        let name = &self.spec.name;
        let response = self
            .client
            .get(&self.spec.url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| SourceError::Transport {
                name: name.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                name: name.clone(),
                status: status.as_u16(),
            });
        }

        let body: Value = response.json().await.map_err(|e| SourceError::Decode {
            name: name.clone(),
            message: e.to_string(),
        })?;
        extract_field(name, &body, &self.spec.field_path)
    }
}

fn extract_field(name: &str, body: &Value, path: &str) -> Result<String, SourceError> {
    let mut current = body;
    for segment in path.split('.') {
        current = current
            .get(segment)
            .ok_or_else(|| SourceError::MissingField {
                name: name.to_string(),
                field: path.to_string(),
            })?;
    }
    current
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| SourceError::NotAString {
            name: name.to_string(),
            field: path.to_string(),
        })
}
