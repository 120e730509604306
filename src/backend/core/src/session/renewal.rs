//! Access-token renewal against the external token endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{ErrorCode, GatewayError, Result};

/// Tokens returned by a successful renewal.
#[derive(Debug, Clone, Deserialize)]
pub struct RenewedTokens {
    pub access_token: String,

    /// Some token endpoints rotate the refresh token, some omit it.
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Access-token lifetime in seconds.
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
}

/// Exchanges a refresh token for fresh tokens.
#[async_trait]
pub trait TokenRenewer: Send + Sync {
    async fn renew(&self, refresh_token: &str) -> Result<RenewedTokens>;

    /// Renewer name for logging.
    fn name(&self) -> &str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP Token Renewer
// ═══════════════════════════════════════════════════════════════════════════════

/// Standard OAuth refresh-token grant over a form-encoded POST.
pub struct HttpTokenRenewer {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl HttpTokenRenewer {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Set custom HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl TokenRenewer for HttpTokenRenewer {
    async fn renew(&self, refresh_token: &str) -> Result<RenewedTokens> {
        debug!(url = %self.token_url, "Renewing access token");

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                GatewayError::with_internal(
                    ErrorCode::TokenRenewalFailed,
                    "Your session could not be renewed",
                    format!("POST {}: {}", self.token_url, e),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::with_internal(
                ErrorCode::TokenRenewalFailed,
                "Your session could not be renewed",
                format!("POST {} -> {}", self.token_url, status),
            ));
        }

        let tokens = response.json::<RenewedTokens>().await.map_err(|e| {
            GatewayError::with_internal(
                ErrorCode::TokenRenewalFailed,
                "Your session could not be renewed",
                format!("token endpoint returned a malformed payload: {}", e),
            )
        })?;

        if tokens.access_token.is_empty() {
            return Err(GatewayError::with_internal(
                ErrorCode::TokenRenewalFailed,
                "Your session could not be renewed",
                "token endpoint returned an empty access token",
            ));
        }

        Ok(tokens)
    }

    fn name(&self) -> &str {
        "http"
    }
}

// Default value functions

fn default_expires_in() -> u64 {
    3600
}
