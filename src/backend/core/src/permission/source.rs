//! Authoritative identity backends.

use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

use crate::error::{ErrorCode, GatewayError, Result};

/// The system of record for subject permissions.
///
/// Consulted only when every cache tier misses; results are cached by the
/// resolver, failures are not.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Fetch the full permission set for a subject.
    async fn fetch_permissions(&self, subject: &str) -> Result<HashSet<String>>;

    /// Source name for logging.
    fn name(&self) -> &str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP Identity Source
// ═══════════════════════════════════════════════════════════════════════════════

/// Fetches permission sets from the identity service's internal endpoint.
pub struct HttpIdentitySource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIdentitySource {
    /// Create a source against `{base_url}/api/internal/permissions/user/{subject}`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base = base_url.into();
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base.trim_end_matches('/').to_string(),
        }
    }

    /// Set custom HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn permissions_url(&self, subject: &str) -> String {
        format!("{}/api/internal/permissions/user/{}", self.base_url, subject)
    }
}

#[async_trait]
impl IdentitySource for HttpIdentitySource {
    async fn fetch_permissions(&self, subject: &str) -> Result<HashSet<String>> {
        let url = self.permissions_url(subject);
        debug!(subject, url = %url, "Fetching subject permissions");

        let response = self.client.get(&url).send().await.map_err(|e| {
            GatewayError::with_internal(
                ErrorCode::IdentitySourceUnavailable,
                "Identity source is unreachable",
                format!("GET {}: {}", url, e),
            )
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::with_internal(
                ErrorCode::IdentitySourceUnavailable,
                "Identity source returned an error status",
                format!("GET {} -> {}", url, status),
            ));
        }

        let permissions = response.json::<Vec<String>>().await.map_err(|e| {
            GatewayError::with_internal(
                ErrorCode::SerializationError,
                "Identity source returned a malformed payload",
                format!("GET {}: {}", url, e),
            )
        })?;

        Ok(permissions.into_iter().collect())
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissions_url_shape() {
        let source = HttpIdentitySource::new("http://localhost:8082/", Duration::from_secs(3));
        assert_eq!(
            source.permissions_url("subject-42"),
            "http://localhost:8082/api/internal/permissions/user/subject-42"
        );
    }
}
