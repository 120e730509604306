//! Buffered forwarding of permitted requests to the upstream application.
//!
//! Requests reaching this handler have already passed the authorization
//! layer and carry their identity headers. The forwarder buffers the body
//! (bounded by `upstream.max_body_bytes`), replays the request against the
//! upstream base URL, and relays the response verbatim minus hop-by-hop
//! headers. Redirects are passed through to the client, never followed.

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    response::Response,
};
use metrics::histogram;
use std::time::Instant;
use tracing::debug;

use super::AppState;
use crate::authz::Grant;
use crate::config::UpstreamConfig;
use crate::error::{ErrorCode, GatewayError, Result};

/// Headers that describe the client connection rather than the request;
/// they must not be replayed on the upstream connection.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handler
// ═══════════════════════════════════════════════════════════════════════════════

/// Fallback handler for everything the gateway does not serve itself.
pub async fn forward(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Result<Response> {
    state.upstream.forward(request).await
}

// ═══════════════════════════════════════════════════════════════════════════════
// Upstream Client
// ═══════════════════════════════════════════════════════════════════════════════

/// HTTP client for the single configured upstream.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    max_body_bytes: usize,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_body_bytes: config.max_body_bytes,
        }
    }

    /// Replace the HTTP client (for tests).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn target_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }

    /// Forward one request and relay the upstream's response.
    pub async fn forward(&self, request: Request<Body>) -> Result<Response> {
        let (parts, body) = request.into_parts();

        let subject = parts
            .extensions
            .get::<Grant>()
            .and_then(|grant| grant.subject_id.clone());

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = self.target_url(path_and_query);

        let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
            .map_err(|_| GatewayError::internal("Unsupported HTTP method"))?;

        let bytes = to_bytes(body, self.max_body_bytes).await.map_err(|e| {
            GatewayError::with_internal(
                ErrorCode::RequestTooLarge,
                "Request body exceeds the configured limit",
                e.to_string(),
            )
        })?;

        let started = Instant::now();
        let upstream_response = self
            .client
            .request(method, &url)
            .headers(outbound_headers(&parts.headers))
            .body(bytes)
            .send()
            .await?;
        let elapsed = started.elapsed();
        histogram!("gateway_upstream_duration_seconds").record(elapsed.as_secs_f64());

        debug!(
            method = %parts.method,
            path = %parts.uri.path(),
            subject = subject.as_deref().unwrap_or("-"),
            status = upstream_response.status().as_u16(),
            duration_ms = elapsed.as_millis() as u64,
            "Forwarded request"
        );

        into_axum_response(upstream_response, self.max_body_bytes).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Header and Response Bridging
// ═══════════════════════════════════════════════════════════════════════════════

// axum and reqwest sit on different `http` major versions, so headers are
// bridged through their byte representation in both directions.

fn outbound_headers(inbound: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut outbound = reqwest::header::HeaderMap::with_capacity(inbound.len());

    for (name, value) in inbound {
        // Host is rewritten for the upstream and Content-Length re-derived
        // from the buffered body.
        if is_hop_by_hop(name.as_str())
            || name == &header::HOST
            || name == &header::CONTENT_LENGTH
        {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            outbound.append(n, v);
        }
    }

    outbound
}

async fn into_axum_response(
    upstream: reqwest::Response,
    max_body_bytes: usize,
) -> Result<Response> {
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(n, v);
        }
    }

    if let Some(declared) = upstream.content_length() {
        if declared > max_body_bytes as u64 {
            return Err(response_too_large());
        }
    }

    let bytes = upstream.bytes().await?;
    if bytes.len() > max_body_bytes {
        return Err(response_too_large());
    }

    builder
        .body(Body::from(bytes))
        .map_err(|e| GatewayError::internal(format!("Failed to assemble upstream response: {}", e)))
}

fn response_too_large() -> GatewayError {
    GatewayError::new(
        ErrorCode::UpstreamUnavailable,
        "Upstream response exceeds the configured size limit",
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn client(base_url: &str) -> UpstreamClient {
        UpstreamClient::new(&UpstreamConfig {
            base_url: base_url.to_string(),
            timeout: Duration::from_secs(5),
            max_body_bytes: 1024,
        })
    }

    #[test]
    fn test_target_url_joins_path_and_query() {
        let client = client("http://backend:8090/");

        assert_eq!(
            client.target_url("/api/orders?page=2"),
            "http://backend:8090/api/orders?page=2"
        );
        assert_eq!(client.target_url("/"), "http://backend:8090/");
    }

    #[test]
    fn test_hop_by_hop_detection_is_case_insensitive() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-user-id"));
    }

    #[test]
    fn test_outbound_headers_drop_connection_scoped_fields() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, HeaderValue::from_static("gateway.local"));
        inbound.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        inbound.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        inbound.insert("x-user-id", HeaderValue::from_static("alice"));
        inbound.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        let outbound = outbound_headers(&inbound);

        assert!(outbound.get("host").is_none());
        assert!(outbound.get("connection").is_none());
        assert!(outbound.get("content-length").is_none());
        assert_eq!(outbound.get("x-user-id").unwrap(), "alice");
        assert_eq!(outbound.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn test_outbound_headers_preserve_repeated_values() {
        let mut inbound = HeaderMap::new();
        inbound.append(header::COOKIE, HeaderValue::from_static("a=1"));
        inbound.append(header::COOKIE, HeaderValue::from_static("b=2"));

        let outbound = outbound_headers(&inbound);

        let values: Vec<_> = outbound.get_all("cookie").iter().collect();
        assert_eq!(values.len(), 2);
    }
}
