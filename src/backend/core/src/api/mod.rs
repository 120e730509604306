//! HTTP surface of the gateway.
//!
//! Three groups of routes share one listener:
//!
//! 1. **Gateway-local endpoints**: `/health`, `/metrics`, and the `/auth/*`
//!    session endpoints. These are served by the gateway itself and are not
//!    subject to endpoint policies.
//! 2. **Operator endpoints** under `/internal/*`: forced policy refresh,
//!    permission invalidation, and session minting. Guarded by a shared
//!    secret when one is configured.
//! 3. **Everything else**: forwarded to the upstream after passing the
//!    authorization middleware. Unmatched routes are denied there, so the
//!    proxy fallback only ever sees permitted traffic.

mod auth;
mod internal;
pub mod proxy;

pub use proxy::UpstreamClient;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::authz::{AuthzLayer, Decider};
use crate::config::Config;
use crate::permission::PermissionResolver;
use crate::policy::{PolicyRefresher, PolicyStore};
use crate::session::SessionStore;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub policies: Arc<PolicyStore>,
    pub refresher: Arc<PolicyRefresher>,
    pub permissions: PermissionResolver,
    pub sessions: Arc<SessionStore>,
    pub upstream: UpstreamClient,
    /// Prometheus render handle. `None` when no exporter is installed
    /// (tests); the `/metrics` endpoint then serves an empty body.
    pub metrics: Option<PrometheusHandle>,
}

/// Build the gateway router.
///
/// The authorization layer wraps only the proxy fallback: gateway-local
/// endpoints must stay reachable even when the policy snapshot is empty,
/// otherwise a failed refresh could lock operators out of the controls
/// needed to fix it.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let authz = AuthzLayer::new(
        Decider::new(state.policies.clone(), state.permissions.clone()),
        state.sessions.clone(),
        &state.config.session,
    );

    let local = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/auth/me", get(auth::me))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/internal/policies/refresh", post(internal::refresh_policies))
        .route(
            "/internal/permissions/:subject/invalidate",
            post(internal::invalidate_permissions),
        )
        .route("/internal/sessions", post(internal::create_session))
        .with_state(state.clone());

    let proxied = Router::new()
        .fallback(proxy::forward)
        .layer(authz)
        .with_state(state);

    local
        .merge(proxied)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health and Metrics
// ═══════════════════════════════════════════════════════════════════════════════

/// Ceiling on the health check's ping round trip to the session backend.
const BACKEND_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Liveness and readiness snapshot.
///
/// Degrades while the policy snapshot is empty or the refresher is failing;
/// with deny-by-default matching an empty snapshot means all proxied
/// traffic answers 403. The session backend is pinged under
/// [`BACKEND_PING_TIMEOUT`] and folds into the same verdict.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.policies.snapshot();
    let refresh = state.refresher.status();

    let started = Instant::now();
    let backend =
        match tokio::time::timeout(BACKEND_PING_TIMEOUT, state.sessions.ping_backend()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("ping timed out after {:?}", BACKEND_PING_TIMEOUT)),
        };
    let backend_latency_ms = started.elapsed().as_millis() as u64;

    let degraded = snapshot.is_empty() || refresh.consecutive_failures > 0 || backend.is_err();
    let status = if degraded { "degraded" } else { "healthy" };

    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "policies": {
            "count": snapshot.len(),
            "version": snapshot.version(),
            "loaded_at": snapshot.loaded_at().map(|t| t.to_rfc3339()),
        },
        "refresh": {
            "cycles": refresh.cycles,
            "consecutive_failures": refresh.consecutive_failures,
            "last_success": refresh.last_success.map(|t| t.to_rfc3339()),
            "last_error": refresh.last_error,
        },
        "sessions": {
            "backend": state.sessions.backend_name(),
            "healthy": backend.is_ok(),
            "latency_ms": backend_latency_ms,
            "error": backend.err(),
        },
    }))
}

async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Response Envelope
// ═══════════════════════════════════════════════════════════════════════════════

/// Success envelope for gateway-local endpoints. Errors render through
/// [`crate::error::ErrorResponse`] instead, keeping the `success`
/// discriminator consistent across both shapes.
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_success_shape() {
        let response = ApiResponse::success(serde_json::json!({"id": 7}));
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["id"], 7);
    }

    #[test]
    fn test_api_response_skips_missing_data() {
        let response = ApiResponse::<i32> {
            success: true,
            data: None,
        };
        let json = serde_json::to_string(&response).unwrap();

        assert!(!json.contains("data"));
    }
}
