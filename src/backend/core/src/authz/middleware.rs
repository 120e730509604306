//! Tower middleware enforcing authorization on proxied requests.
//!
//! For every request the service, in order:
//! 1. strips inbound identity headers so clients cannot forge them
//! 2. restores the caller's session from the cookie (or fallback header)
//! 3. runs the [`Decider`]
//! 4. on allow: injects the subject, permission, and bearer headers and
//!    forwards to the inner service, with the [`Grant`] available as a
//!    request extension
//! 5. on deny: answers with the JSON error envelope without touching upstream

use crate::authz::{Decider, Decision, Grant};
use crate::config::SessionConfig;
use crate::error::GatewayError;
use crate::session::SessionStore;
use axum::body::Body;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};
use tracing::{debug, info};

/// Header carrying the authenticated subject id to the upstream.
pub const HEADER_SUBJECT: &str = "x-user-id";

/// Header carrying the permission code that satisfied the matched rule.
pub const HEADER_PERMISSION: &str = "x-authz-perm";

// ═══════════════════════════════════════════════════════════════════════════════
// Layer
// ═══════════════════════════════════════════════════════════════════════════════

struct AuthzShared {
    decider: Decider,
    sessions: Arc<SessionStore>,
    cookie_name: String,
    header_name: String,
}

/// Tower layer wrapping a service with session restoration and authorization.
#[derive(Clone)]
pub struct AuthzLayer {
    shared: Arc<AuthzShared>,
}

impl AuthzLayer {
    pub fn new(decider: Decider, sessions: Arc<SessionStore>, config: &SessionConfig) -> Self {
        Self {
            shared: Arc::new(AuthzShared {
                decider,
                sessions,
                cookie_name: config.cookie_name.clone(),
                header_name: config.header_name.clone(),
            }),
        }
    }
}

impl<S> Layer<S> for AuthzLayer {
    type Service = AuthzService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthzService {
            inner,
            shared: self.shared.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Service
// ═══════════════════════════════════════════════════════════════════════════════

/// The middleware service produced by [`AuthzLayer`].
#[derive(Clone)]
pub struct AuthzService<S> {
    inner: S,
    shared: Arc<AuthzShared>,
}

impl<S> Service<Request<Body>> for AuthzService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let shared = self.shared.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let started = Instant::now();
            let method = request.method().as_str().to_string();
            let path = request.uri().path().to_string();

            strip_trust_headers(request.headers_mut());

            let session_id =
                extract_session_id(request.headers(), &shared.cookie_name, &shared.header_name);

            let session = match &session_id {
                Some(id) => match shared.sessions.resolve(id).await {
                    Ok(session) => session,
                    Err(e) => {
                        // Session backend trouble is a gateway fault, not a
                        // client fault: answer 503 rather than denying.
                        counter!("gateway_decisions_total", "outcome" => "error").increment(1);
                        return Ok(e.into_response());
                    }
                },
                None => None,
            };

            let decision = shared
                .decider
                .decide(&method, &path, session.as_ref())
                .await;
            histogram!("gateway_decision_duration_seconds").record(started.elapsed().as_secs_f64());

            match decision {
                Decision::Allow(grant) => {
                    if let Err(e) = apply_grant(&mut request, &grant) {
                        counter!("gateway_decisions_total", "outcome" => "error").increment(1);
                        return Ok(e.into_response());
                    }

                    counter!("gateway_decisions_total", "outcome" => "allow").increment(1);
                    debug!(
                        method = %method,
                        path = %path,
                        subject = grant.subject_id.as_deref().unwrap_or("-"),
                        permission = grant.permission_code.as_deref().unwrap_or("-"),
                        "Request allowed"
                    );

                    request.extensions_mut().insert(grant);
                    inner.call(request).await
                }
                Decision::Deny(denial) => {
                    counter!(
                        "gateway_decisions_total",
                        "outcome" => "deny",
                        "reason" => denial.reason
                    )
                    .increment(1);
                    info!(
                        method = %method,
                        path = %path,
                        code = ?denial.code,
                        reason = denial.reason,
                        "Request denied"
                    );
                    Ok(denial.to_error().into_response())
                }
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Header Handling
// ═══════════════════════════════════════════════════════════════════════════════

/// Remove identity headers from the inbound request. Whatever the client sent
/// in them is untrusted; identity is re-derived from the session alone.
fn strip_trust_headers(headers: &mut HeaderMap) {
    headers.remove(HEADER_SUBJECT);
    headers.remove(HEADER_PERMISSION);
    headers.remove(AUTHORIZATION);
}

/// Locate the caller's session id: the session cookie first, then the
/// fallback header used by non-browser clients.
pub fn extract_session_id(
    headers: &HeaderMap,
    cookie_name: &str,
    header_name: &str,
) -> Option<String> {
    for cookie_header in headers.get_all(COOKIE) {
        let Ok(raw) = cookie_header.to_str() else {
            continue;
        };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == cookie_name && !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }

    headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

/// Write the grant onto the outgoing request headers.
fn apply_grant(request: &mut Request<Body>, grant: &Grant) -> Result<(), GatewayError> {
    let headers = request.headers_mut();

    if let Some(subject) = &grant.subject_id {
        headers.insert(HEADER_SUBJECT, header_value(subject)?);
    }
    if let Some(permission) = &grant.permission_code {
        headers.insert(HEADER_PERMISSION, header_value(permission)?);
    }
    if let Some(token) = &grant.access_token {
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
    }

    Ok(())
}

fn header_value(value: &str) -> Result<HeaderValue, GatewayError> {
    // Session payloads come from the identity provider, but a header value
    // still has a narrower charset than JSON strings.
    HeaderValue::from_str(value)
        .map_err(|_| GatewayError::internal("Session contains a value not representable as a header"))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
