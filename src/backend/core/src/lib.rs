#![allow(clippy::result_large_err)]
//! # Portcullis Core
//!
//! Edge authorization engine: one policy-checked front door in front of an
//! upstream application.
//!
//! ## Architecture
//!
//! - **Policy**: hot-swappable snapshot of endpoint rules, refreshed in the
//!   background from the policy source
//! - **Permission**: tiered (in-process + Redis) caching over the identity
//!   source, with single-flight fetches and fail-closed degradation
//! - **Session**: opaque cookie ids mapped to OAuth tokens in Redis, with
//!   sliding expiration and proactive renewal
//! - **Authz**: the decision engine and the tower middleware enforcing it
//! - **API**: session endpoints, operator endpoints, and the buffering
//!   forwarder to the upstream

pub mod api;
pub mod authz;
pub mod config;
pub mod error;
pub mod observability;
pub mod permission;
pub mod policy;
pub mod session;

pub use error::{ErrorCode, ErrorContext, ErrorResponse, ErrorSeverity, GatewayError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::{build_router, AppState, UpstreamClient};
    pub use crate::authz::{AuthzLayer, Decider, Decision, Denial, Grant};
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, GatewayError, Result};
    pub use crate::permission::{
        HttpIdentitySource, IdentitySource, InProcessTier, PermissionResolver, PermissionTier,
        RedisTier,
    };
    pub use crate::policy::{
        EndpointPolicy, HttpPolicySource, PolicyRefresher, PolicySnapshot, PolicySource,
        PolicyStore, RefreshOutcome,
    };
    pub use crate::session::{
        HttpTokenRenewer, MemorySessionBackend, RedisSessionBackend, Session, SessionBackend,
        SessionStore, TokenRenewer,
    };
}
