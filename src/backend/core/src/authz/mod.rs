//! Authorization decisions for proxied requests.
//!
//! This module provides:
//! - **Grant / Denial / Decision**: the outcome of evaluating one request
//!   against the current policy snapshot and the caller's session
//! - **Decider**: the pure decision engine combining [`PolicyStore`] route
//!   matching with [`PermissionResolver`] lookups
//! - **AuthzLayer**: the tower middleware that resolves the session, runs the
//!   decider, and either enriches the request with identity headers or
//!   short-circuits with a JSON error envelope (see [`middleware`])
//!
//! Evaluation order is fixed: public rules short-circuit, then
//! authentication, then route match, then permission. A route with no
//! matching rule is denied outright, so an unpublished endpoint never leaks
//! upstream, and anonymous callers see the same 401 for unpublished and
//! protected routes alike.

pub mod middleware;

pub use middleware::AuthzLayer;

use crate::error::{ErrorCode, GatewayError};
use crate::permission::PermissionResolver;
use crate::policy::{EndpointPolicy, PolicyStore};
use crate::session::Session;
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════════════
// Decision Model
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity context attached to an allowed request.
///
/// All fields are optional: a public route reached without a session yields an
/// empty grant, while a public route reached *with* a session still carries
/// the caller's identity so the upstream can personalize its response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Grant {
    /// Authenticated subject, when a session was presented.
    pub subject_id: Option<String>,
    /// Bearer credential to forward upstream.
    pub access_token: Option<String>,
    /// Permission that satisfied the matched rule (`None` on public routes
    /// and on rules that only require authentication).
    pub permission_code: Option<String>,
}

impl Grant {
    fn from_public(session: Option<&Session>) -> Self {
        Self {
            subject_id: session.map(|s| s.subject_id.clone()),
            access_token: session.map(|s| s.access_token.clone()),
            permission_code: None,
        }
    }

    fn from_session(session: &Session, policy: &EndpointPolicy) -> Self {
        Self {
            subject_id: Some(session.subject_id.clone()),
            access_token: Some(session.access_token.clone()),
            permission_code: (!policy.permission_code.is_empty())
                .then(|| policy.permission_code.clone()),
        }
    }

    /// Whether the grant carries an authenticated identity.
    pub fn is_authenticated(&self) -> bool {
        self.subject_id.is_some()
    }
}

/// A refused request, with the error code that determines the HTTP status
/// and a short reason used in logs and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Denial {
    pub code: ErrorCode,
    pub reason: &'static str,
}

impl Denial {
    /// No session cookie/header, or the session could not be restored.
    pub fn unauthenticated() -> Self {
        Self {
            code: ErrorCode::AuthenticationRequired,
            reason: "no_session",
        }
    }

    /// No policy rule matches the requested route.
    pub fn route_not_permitted() -> Self {
        Self {
            code: ErrorCode::RouteNotPermitted,
            reason: "no_matching_rule",
        }
    }

    /// The matched rule names a permission the subject does not hold.
    pub fn missing_permission() -> Self {
        Self {
            code: ErrorCode::PermissionDenied,
            reason: "missing_permission",
        }
    }

    /// Client-facing message for the error envelope. Intentionally generic:
    /// the denied caller learns nothing about which rules or permissions
    /// exist.
    pub fn user_message(&self) -> &'static str {
        match self.code {
            ErrorCode::AuthenticationRequired => {
                "Authentication is required to access this resource"
            }
            ErrorCode::SessionExpired => "Your session has expired, please sign in again",
            ErrorCode::RouteNotPermitted => "Access to this route is not permitted",
            ErrorCode::PermissionDenied => "You do not have permission to perform this action",
            _ => "Access denied",
        }
    }

    /// Convert into the error type that renders the JSON envelope.
    pub fn to_error(&self) -> GatewayError {
        GatewayError::new(self.code, self.user_message())
    }
}

/// Outcome of evaluating a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(Grant),
    Deny(Denial),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decider
// ═══════════════════════════════════════════════════════════════════════════════

/// The decision engine.
///
/// Stateless apart from its handles to the policy store and the permission
/// resolver, so it is cheap to clone into the middleware.
#[derive(Clone)]
pub struct Decider {
    policies: Arc<PolicyStore>,
    permissions: PermissionResolver,
}

impl Decider {
    pub fn new(policies: Arc<PolicyStore>, permissions: PermissionResolver) -> Self {
        Self {
            policies,
            permissions,
        }
    }

    /// Evaluate one request.
    ///
    /// - public rule: allow, carrying the session identity when present
    /// - anything else without a session: deny with 401
    /// - no matching rule: deny with 403
    /// - protected rule with an empty permission code: any authenticated
    ///   subject is allowed
    /// - otherwise: allow iff the subject holds the rule's permission
    pub async fn decide(&self, method: &str, path: &str, session: Option<&Session>) -> Decision {
        let matched = self.policies.matches(method, path);

        if let Some(policy) = &matched {
            if policy.is_public {
                return Decision::Allow(Grant::from_public(session));
            }
        }

        let Some(session) = session else {
            return Decision::Deny(Denial::unauthenticated());
        };

        let Some(policy) = matched else {
            return Decision::Deny(Denial::route_not_permitted());
        };

        if policy.permission_code.is_empty()
            || self
                .permissions
                .has_permission(&session.subject_id, &policy.permission_code)
                .await
        {
            Decision::Allow(Grant::from_session(session, &policy))
        } else {
            Decision::Deny(Denial::missing_permission())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
