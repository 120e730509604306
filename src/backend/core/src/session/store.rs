//! Session resolution, creation, and teardown.

use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::Result;
use crate::session::{Session, SessionBackend, TokenRenewer};

/// First eight characters, for logs that must not leak whole ids.
fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// The session pipeline used on every authenticated request.
///
/// `resolve` is the hot path: load the record, delete it if its refresh
/// token has lapsed, renew the access token if it is expired or about to
/// expire, then re-save with the full TTL so activity keeps the session
/// alive. Renewal failures destroy the session so the client falls back to
/// a clean re-login.
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    renewer: Arc<dyn TokenRenewer>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        renewer: Arc<dyn TokenRenewer>,
        config: SessionConfig,
    ) -> Self {
        Self {
            backend,
            renewer,
            config,
        }
    }

    /// Resolve a session id to a usable session, or `None` if the client
    /// must re-authenticate. Errors mean the backend itself is unusable.
    pub async fn resolve(&self, session_id: &str) -> Result<Option<Session>> {
        let Some(mut session) = self.backend.load(session_id).await? else {
            return Ok(None);
        };

        if !session.is_valid() {
            info!(
                session = short_id(session_id),
                subject = %session.subject_id,
                "Refresh token expired; destroying session"
            );
            self.backend.delete(session_id).await?;
            return Ok(None);
        }

        if session.needs_renewal() && !self.renew(session_id, &mut session).await? {
            return Ok(None);
        }

        // Sliding expiration: activity re-saves the record with a full TTL.
        session.touch();
        self.backend
            .save(session_id, &session, self.config.ttl)
            .await?;

        self.spawn_heartbeat(&session.subject_id);
        Ok(Some(session))
    }

    /// Mint a new session for a subject. The returned record carries the
    /// opaque id the client will hold in its cookie.
    pub async fn create(
        &self,
        subject_id: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in: u64,
    ) -> Result<Session> {
        let session = Session::new(
            subject_id,
            access_token,
            refresh_token,
            expires_in,
            self.config.refresh_ttl,
        );
        self.backend
            .save(&session.session_id, &session, self.config.ttl)
            .await?;
        self.spawn_heartbeat(&session.subject_id);
        info!(
            session = short_id(&session.session_id),
            subject = %session.subject_id,
            "Session created"
        );
        Ok(session)
    }

    /// Remove a session unconditionally.
    pub async fn destroy(&self, session_id: &str) -> Result<()> {
        self.backend.delete(session_id).await?;
        info!(session = short_id(session_id), "Session destroyed");
        Ok(())
    }

    /// Reachability check against the backend, for the health endpoint.
    pub async fn ping_backend(&self) -> Result<()> {
        self.backend.ping().await
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Renew the session's tokens now, regardless of how much access-token
    /// lifetime remains. `None` means the session did not survive.
    pub async fn refresh_now(&self, session_id: &str) -> Result<Option<Session>> {
        let Some(mut session) = self.backend.load(session_id).await? else {
            return Ok(None);
        };

        if !session.is_valid() {
            self.backend.delete(session_id).await?;
            return Ok(None);
        }

        if !self.renew(session_id, &mut session).await? {
            return Ok(None);
        }

        session.touch();
        self.backend
            .save(session_id, &session, self.config.ttl)
            .await?;

        self.spawn_heartbeat(&session.subject_id);
        Ok(Some(session))
    }

    /// Exchange the refresh token and fold the result into `session`.
    /// Returns whether the session survived; the caller persists it.
    async fn renew(&self, session_id: &str, session: &mut Session) -> Result<bool> {
        let Some(refresh_token) = session.refresh_token.clone() else {
            info!(
                session = short_id(session_id),
                "No refresh token available; destroying session"
            );
            self.backend.delete(session_id).await?;
            return Ok(false);
        };

        match self.renewer.renew(&refresh_token).await {
            Ok(tokens) => {
                session.apply_renewal(tokens, self.config.refresh_ttl);
                counter!("gateway_session_renewals_total", "outcome" => "success").increment(1);
                info!(
                    session = short_id(session_id),
                    subject = %session.subject_id,
                    "Access token renewed"
                );
                Ok(true)
            }
            Err(e) => {
                counter!("gateway_session_renewals_total", "outcome" => "failure").increment(1);
                warn!(
                    session = short_id(session_id),
                    error = %e,
                    "Token renewal failed; destroying session"
                );
                self.backend.delete(session_id).await?;
                Ok(false)
            }
        }
    }

    /// Presence write, decoupled from the request so it can neither slow
    /// nor fail it.
    fn spawn_heartbeat(&self, subject_id: &str) {
        let backend = Arc::clone(&self.backend);
        let subject = subject_id.to_string();
        let ttl = self.config.heartbeat_ttl;
        tokio::spawn(async move {
            if let Err(e) = backend.heartbeat(&subject, ttl).await {
                debug!(subject, error = %e, "Presence heartbeat failed");
            }
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
