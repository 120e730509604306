//! Opaque-cookie sessions and server-side token custody.
//!
//! Browsers hold a random session id in an HttpOnly cookie; the real OAuth
//! tokens never leave the server side. This module provides:
//! - **Session**: the server-side record (subject, tokens, expiries)
//! - **SessionBackend**: pluggable persistence (Redis in production, memory
//!   for tests and development)
//! - **TokenRenewer**: exchanges a refresh token for fresh tokens at the
//!   external token endpoint
//! - **SessionStore**: the resolution pipeline (load, validate, renew,
//!   slide the TTL, record presence)
//!
//! # Usage
//!
//! ```rust,ignore
//! use portcullis_core::session::{SessionStore, RedisSessionBackend, HttpTokenRenewer};
//!
//! let store = SessionStore::new(backend, renewer, config.session.clone());
//!
//! match store.resolve(&session_id).await? {
//!     Some(session) => println!("authenticated as {}", session.subject_id),
//!     None => println!("no usable session"),
//! }
//! ```

pub mod backend;
pub mod renewal;
pub mod store;

pub use backend::{MemorySessionBackend, RedisSessionBackend, SessionBackend};
pub use renewal::{HttpTokenRenewer, RenewedTokens, TokenRenewer};
pub use store::SessionStore;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Renew this far ahead of access-token expiry, so a token is never handed
/// upstream right before it lapses.
const RENEWAL_MARGIN_SECONDS: i64 = 30;

/// A server-side session record.
///
/// Two clocks run against it. The access token expires quickly and is
/// renewed in place; the refresh token is the session's hard deadline, and
/// once it lapses the record is dead no matter how fresh the access token
/// looks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Opaque handle the client carries; also the backend storage key.
    pub session_id: String,

    /// The authenticated subject this session belongs to.
    pub subject_id: String,

    /// Current access token, injected upstream as a bearer credential.
    pub access_token: String,

    /// Refresh token, if the token endpoint issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// When the access token stops being accepted upstream.
    pub access_expires_at: DateTime<Utc>,

    /// When the refresh token lapses and the session with it.
    pub refresh_expires_at: DateTime<Utc>,

    /// When the session was first established.
    pub created_at: DateTime<Utc>,

    /// When the session last authorized a request. Slid on every resolve.
    pub last_accessed_at: DateTime<Utc>,
}

impl Session {
    /// Build a fresh session under a random v4 id. The access token lasts
    /// `expires_in` seconds, the refresh token `refresh_ttl`.
    pub fn new(
        subject_id: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in: u64,
        refresh_ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            access_token: access_token.into(),
            refresh_token,
            access_expires_at: deadline_after(now, expires_in),
            refresh_expires_at: deadline_after(now, refresh_ttl.as_secs()),
            created_at: now,
            last_accessed_at: now,
        }
    }

    pub fn is_access_expired(&self) -> bool {
        self.access_expires_at <= Utc::now()
    }

    pub fn is_refresh_expired(&self) -> bool {
        self.refresh_expires_at <= Utc::now()
    }

    /// A session lives exactly as long as its refresh token. An expired
    /// access token alone only means a renewal is due.
    pub fn is_valid(&self) -> bool {
        !self.is_refresh_expired()
    }

    /// Whether the access token is expired or inside the renewal margin.
    pub fn needs_renewal(&self) -> bool {
        self.access_expires_at <= Utc::now() + ChronoDuration::seconds(RENEWAL_MARGIN_SECONDS)
    }

    /// Record activity for sliding expiration.
    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
    }

    /// Adopt freshly issued tokens. The refresh token is kept unless the
    /// token endpoint rotated it; a rotated one restarts the refresh
    /// lifetime at `refresh_ttl`.
    pub fn apply_renewal(&mut self, tokens: RenewedTokens, refresh_ttl: Duration) {
        self.access_token = tokens.access_token;
        self.access_expires_at = deadline_after(Utc::now(), tokens.expires_in);
        if tokens.refresh_token.is_some() {
            self.refresh_token = tokens.refresh_token;
            self.refresh_expires_at = deadline_after(Utc::now(), refresh_ttl.as_secs());
        }
    }
}

/// Deadline `seconds` from `now`. Lifetimes arrive off the wire as plain
/// integers, so an out-of-range value clamps to the end of the calendar
/// instead of panicking on the request path.
fn deadline_after(now: DateTime<Utc>, seconds: u64) -> DateTime<Utc> {
    i64::try_from(seconds)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
