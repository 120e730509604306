//! Operator endpoints under `/internal/*`.
//!
//! Callers are other backend services (deploy hooks, the login callback
//! service, admin tooling), not browsers. When `internal.token` is set every
//! request must present it in `X-Internal-Token`; when unset the surface is
//! open, which is only acceptable in development.

use axum::{
    extract::{Path, State},
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{AppendHeaders, IntoResponse},
    Json,
};
use serde::Deserialize;
use tracing::info;

use super::{auth, ApiResponse, AppState};
use crate::error::{ErrorCode, GatewayError};
use crate::policy::RefreshOutcome;

/// Header carrying the shared operator secret.
pub const HEADER_INTERNAL_TOKEN: &str = "x-internal-token";

/// Upper bound on `expires_in` when minting a session: one year. Larger
/// values are a caller unit mix-up, not a real token lifetime.
const MAX_EXPIRES_IN_SECONDS: u64 = 31_536_000;

// ═══════════════════════════════════════════════════════════════════════════════
// Handlers
// ═══════════════════════════════════════════════════════════════════════════════

/// `POST /internal/policies/refresh`: pull a fresh policy snapshot now
/// instead of waiting for the next scheduled cycle.
pub async fn refresh_policies(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, GatewayError> {
    require_internal_token(state.config.internal.token.as_deref(), &headers)?;

    match state.refresher.refresh().await {
        RefreshOutcome::Refreshed { count, version } => {
            info!(count, version, "Policy refresh forced via internal API");
            Ok(Json(ApiResponse::success(serde_json::json!({
                "refreshed": true,
                "count": count,
                "version": version,
            }))))
        }
        RefreshOutcome::Coalesced => Ok(Json(ApiResponse::success(serde_json::json!({
            "refreshed": false,
            "coalesced": true,
        })))),
        RefreshOutcome::Failed { attempts } => Err(GatewayError::with_internal(
            ErrorCode::PolicySourceUnavailable,
            "Policy refresh failed; the previous snapshot remains active",
            format!("refresh gave up after {} attempts", attempts),
        )),
    }
}

/// `POST /internal/permissions/:subject/invalidate`: drop the subject's
/// cached permissions so the next request refetches them.
pub async fn invalidate_permissions(
    State(state): State<AppState>,
    Path(subject): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, GatewayError> {
    require_internal_token(state.config.internal.token.as_deref(), &headers)?;

    state.permissions.invalidate(&subject).await;

    Ok(Json(ApiResponse::success(serde_json::json!({
        "invalidated": subject,
    }))))
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub subject_id: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

fn validate_create_session(req: &CreateSessionRequest) -> Result<(), GatewayError> {
    if req.subject_id.trim().is_empty() {
        return Err(GatewayError::invalid_request("subject_id cannot be empty"));
    }
    if req.access_token.is_empty() {
        return Err(GatewayError::invalid_request("access_token cannot be empty"));
    }
    if req.expires_in > MAX_EXPIRES_IN_SECONDS {
        return Err(GatewayError::invalid_request(
            "expires_in exceeds the one-year maximum",
        ));
    }
    Ok(())
}

/// `POST /internal/sessions`: mint a session after the login callback has
/// exchanged the authorization code. Returns the id and the Set-Cookie
/// header the callback relays to the browser.
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    require_internal_token(state.config.internal.token.as_deref(), &headers)?;
    validate_create_session(&req)?;

    let session = state
        .sessions
        .create(
            req.subject_id,
            req.access_token,
            req.refresh_token,
            req.expires_in,
        )
        .await?;

    let cookie = auth::session_cookie(
        &state.config.session.cookie_name,
        &session.session_id,
        state.config.session.ttl.as_secs() as i64,
    );

    Ok((
        StatusCode::CREATED,
        AppendHeaders([(SET_COOKIE, cookie)]),
        Json(ApiResponse::success(serde_json::json!({
            "session_id": session.session_id,
        }))),
    ))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Token Guard
// ═══════════════════════════════════════════════════════════════════════════════

fn require_internal_token(expected: Option<&str>, headers: &HeaderMap) -> Result<(), GatewayError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let presented = headers
        .get(HEADER_INTERNAL_TOKEN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if presented != expected {
        return Err(GatewayError::forbidden(
            "Internal endpoints require a valid operator token",
        ));
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use crate::error::ErrorCode;

    #[test]
    fn test_guard_open_when_no_token_configured() {
        let headers = HeaderMap::new();
        assert!(require_internal_token(None, &headers).is_ok());
    }

    #[test]
    fn test_guard_accepts_matching_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HEADER_INTERNAL_TOKEN,
            HeaderValue::from_static("s3cret"),
        );

        assert!(require_internal_token(Some("s3cret"), &headers).is_ok());
    }

    #[test]
    fn test_guard_rejects_missing_or_wrong_token() {
        let empty = HeaderMap::new();
        let err = require_internal_token(Some("s3cret"), &empty).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);

        let mut wrong = HeaderMap::new();
        wrong.insert(HEADER_INTERNAL_TOKEN, HeaderValue::from_static("nope"));
        assert!(require_internal_token(Some("s3cret"), &wrong).is_err());
    }

    #[test]
    fn test_create_session_request_defaults() {
        let req: CreateSessionRequest = serde_json::from_str(
            r#"{"subject_id": "alice", "access_token": "tok-1"}"#,
        )
        .unwrap();

        assert_eq!(req.subject_id, "alice");
        assert!(req.refresh_token.is_none());
        assert_eq!(req.expires_in, 3600);
    }

    fn create_request(expires_in: u64) -> CreateSessionRequest {
        CreateSessionRequest {
            subject_id: "alice".to_string(),
            access_token: "tok-1".to_string(),
            refresh_token: None,
            expires_in,
        }
    }

    #[test]
    fn test_create_session_rejects_out_of_range_expires_in() {
        assert!(validate_create_session(&create_request(3600)).is_ok());
        assert!(validate_create_session(&create_request(MAX_EXPIRES_IN_SECONDS)).is_ok());

        // a token endpoint answering in nanoseconds instead of seconds
        let err = validate_create_session(&create_request(31_536_000_000_000_000)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
    }

    #[test]
    fn test_create_session_rejects_blank_identity_fields() {
        let mut req = create_request(3600);
        req.subject_id = "   ".to_string();
        assert!(validate_create_session(&req).is_err());

        let mut req = create_request(3600);
        req.access_token = String::new();
        assert!(validate_create_session(&req).is_err());
    }
}
