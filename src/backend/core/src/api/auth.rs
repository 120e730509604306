//! Session endpoints served by the gateway itself.
//!
//! These live outside the policy-checked proxy path: a client with a dying
//! session still needs `/auth/refresh` and `/auth/logout` to work.

use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{AppendHeaders, IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::{ApiResponse, AppState};
use crate::authz::middleware::extract_session_id;
use crate::error::{ErrorCode, ErrorResponse, GatewayError};
use crate::session::Session;

// ═══════════════════════════════════════════════════════════════════════════════
// Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
pub struct MeResponse {
    pub subject_id: String,
    pub access_expires_at: String,
    pub created_at: String,
    pub last_accessed_at: String,
    /// Whether the access token is inside the early-renewal window.
    pub renewal_due: bool,
}

impl MeResponse {
    fn from_session(session: &Session) -> Self {
        Self {
            subject_id: session.subject_id.clone(),
            access_expires_at: session.access_expires_at.to_rfc3339(),
            created_at: session.created_at.to_rfc3339(),
            last_accessed_at: session.last_accessed_at.to_rfc3339(),
            renewal_due: session.needs_renewal(),
        }
    }
}

/// `GET /auth/me`: who the session belongs to.
pub async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, GatewayError> {
    let session = resolve_session(&state, &headers).await?;
    Ok(Json(ApiResponse::success(MeResponse::from_session(&session))))
}

/// `POST /auth/refresh`: renew the session's tokens immediately.
///
/// A session that cannot be renewed is already destroyed by the store, so
/// the 401 here also clears the cookie to stop the client retrying with a
/// dead id.
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let cookie_name = state.config.session.cookie_name.clone();
    let Some(session_id) = extract_session_id(
        &headers,
        &cookie_name,
        &state.config.session.header_name,
    ) else {
        return Err(GatewayError::unauthenticated("No active session"));
    };

    match state.sessions.refresh_now(&session_id).await? {
        Some(session) => {
            Ok(Json(ApiResponse::success(MeResponse::from_session(&session))).into_response())
        }
        None => {
            let error = GatewayError::new(
                ErrorCode::TokenRenewalFailed,
                "Your session could not be renewed, please sign in again",
            );
            error.log();
            Ok((
                error.http_status(),
                AppendHeaders([(SET_COOKIE, clear_session_cookie(&cookie_name))]),
                Json(ErrorResponse::from(&error)),
            )
                .into_response())
        }
    }
}

/// `POST /auth/logout`: destroy the session and clear the cookie.
///
/// Succeeds even without a session so clients can call it unconditionally.
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, GatewayError> {
    let cookie_name = state.config.session.cookie_name.clone();
    if let Some(session_id) = extract_session_id(
        &headers,
        &cookie_name,
        &state.config.session.header_name,
    ) {
        state.sessions.destroy(&session_id).await?;
    }

    Ok((
        StatusCode::OK,
        AppendHeaders([(SET_COOKIE, clear_session_cookie(&cookie_name))]),
        Json(ApiResponse::success(serde_json::json!({ "logged_out": true }))),
    ))
}

async fn resolve_session(state: &AppState, headers: &HeaderMap) -> Result<Session, GatewayError> {
    let Some(session_id) = extract_session_id(
        headers,
        &state.config.session.cookie_name,
        &state.config.session.header_name,
    ) else {
        return Err(GatewayError::unauthenticated("No active session"));
    };

    state
        .sessions
        .resolve(&session_id)
        .await?
        .ok_or_else(|| GatewayError::unauthenticated("Session is no longer valid"))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cookie Building
// ═══════════════════════════════════════════════════════════════════════════════

/// Session cookies are HttpOnly so scripts cannot read the id, and SameSite
/// Lax so ordinary navigation keeps working.
pub(super) fn session_cookie(name: &str, value: &str, max_age_secs: i64) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age={}",
        name, value, max_age_secs
    )
}

pub(super) fn clear_session_cookie(name: &str) -> String {
    session_cookie(name, "", 0)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = session_cookie("SESSION_ID", "abc-123", 86400);

        assert!(cookie.starts_with("SESSION_ID=abc-123;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Max-Age=86400"));
        assert!(cookie.contains("Path=/"));
    }

    #[test]
    fn test_clear_session_cookie_expires_immediately() {
        let cookie = clear_session_cookie("SESSION_ID");

        assert!(cookie.starts_with("SESSION_ID=;"));
        assert!(cookie.contains("Max-Age=0"));
    }

    #[test]
    fn test_me_response_reflects_renewal_window() {
        let week = std::time::Duration::from_secs(7 * 86_400);

        let fresh = Session::new("alice", "tok", None, 3600, week);
        assert!(!MeResponse::from_session(&fresh).renewal_due);

        let dying = Session::new("alice", "tok", None, 5, week);
        assert!(MeResponse::from_session(&dying).renewal_due);
    }
}
