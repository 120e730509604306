//! Policy source backends.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::{ErrorCode, GatewayError, Result};
use crate::policy::EndpointPolicy;

// ═══════════════════════════════════════════════════════════════════════════════
// Policy Source Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Where the authoritative policy list lives.
///
/// Implementations return the complete list on every fetch; the refresher
/// replaces the snapshot wholesale rather than merging deltas.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Fetch the complete policy list.
    async fn fetch(&self) -> Result<Vec<EndpointPolicy>>;

    /// Source name for logging.
    fn name(&self) -> &str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP Policy Source
// ═══════════════════════════════════════════════════════════════════════════════

/// Fetches policies from the administrative service's internal endpoint.
pub struct HttpPolicySource {
    client: reqwest::Client,
    url: String,
}

impl HttpPolicySource {
    /// Create a source against `{base_url}/api/internal/policies`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base = base_url.into();
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            url: format!("{}/api/internal/policies", base.trim_end_matches('/')),
        }
    }

    /// Set custom HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// The fully resolved endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PolicySource for HttpPolicySource {
    async fn fetch(&self) -> Result<Vec<EndpointPolicy>> {
        debug!(url = %self.url, "Fetching endpoint policies");

        let response = self.client.get(&self.url).send().await.map_err(|e| {
            GatewayError::with_internal(
                ErrorCode::PolicySourceUnavailable,
                "Policy source is unreachable",
                format!("GET {}: {}", self.url, e),
            )
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::with_internal(
                ErrorCode::PolicySourceUnavailable,
                "Policy source returned an error status",
                format!("GET {} -> {}", self.url, status),
            ));
        }

        let policies = response.json::<Vec<EndpointPolicy>>().await.map_err(|e| {
            GatewayError::with_internal(
                ErrorCode::SerializationError,
                "Policy source returned a malformed payload",
                format!("GET {}: {}", self.url, e),
            )
        })?;

        Ok(policies)
    }

    fn name(&self) -> &str {
        "http"
    }
}
