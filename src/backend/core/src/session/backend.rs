//! Session persistence backends.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::{ErrorCode, GatewayError, Result};
use crate::session::Session;

// ═══════════════════════════════════════════════════════════════════════════════
// Session Backend Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable session storage shared by all gateway instances.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Load a session by id.
    async fn load(&self, session_id: &str) -> Result<Option<Session>>;

    /// Persist a session with an absolute TTL.
    async fn save(&self, session_id: &str, session: &Session, ttl: Duration) -> Result<()>;

    /// Remove a session.
    async fn delete(&self, session_id: &str) -> Result<()>;

    /// Record that a subject was just seen, expiring after `ttl`.
    async fn heartbeat(&self, subject_id: &str, ttl: Duration) -> Result<()>;

    /// Verify the backend is reachable. Used by the health endpoint.
    async fn ping(&self) -> Result<()>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis-backed session storage.
///
/// Keys are `session:<id>` for records and `online:<subject>` for presence.
/// Operations are bounded by `op_timeout`; the client connects lazily.
pub struct RedisSessionBackend {
    client: redis::Client,
    op_timeout: Duration,
}

impl RedisSessionBackend {
    pub fn new(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            GatewayError::with_internal(
                ErrorCode::SessionBackendUnavailable,
                "Failed to create Redis client",
                e.to_string(),
            )
        })?;
        Ok(Self::with_client(client, op_timeout))
    }

    /// Build from an existing client.
    pub fn with_client(client: redis::Client, op_timeout: Duration) -> Self {
        Self { client, op_timeout }
    }

    fn session_key(session_id: &str) -> String {
        format!("session:{}", session_id)
    }

    fn online_key(subject_id: &str) -> String {
        format!("online:{}", subject_id)
    }

    fn backend_error(e: redis::RedisError) -> GatewayError {
        GatewayError::with_internal(
            ErrorCode::SessionBackendUnavailable,
            "Session store is unavailable",
            e.to_string(),
        )
    }

    fn timeout_error() -> GatewayError {
        GatewayError::new(
            ErrorCode::SessionBackendUnavailable,
            "Session store operation timed out",
        )
    }

    async fn bounded<T>(
        &self,
        op: impl std::future::Future<Output = std::result::Result<T, redis::RedisError>>,
    ) -> Result<T> {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| Self::timeout_error())?
            .map_err(Self::backend_error)
    }
}

/// An unreadable record is treated as absent rather than an error; the
/// client simply signs in again. Covers both corruption and records written
/// by older releases with a different shape.
fn decode_session(bytes: &[u8]) -> Option<Session> {
    match serde_json::from_slice(bytes) {
        Ok(session) => Some(session),
        Err(e) => {
            warn!(error = %e, "Discarding unreadable session record");
            None
        }
    }
}

#[async_trait]
impl SessionBackend for RedisSessionBackend {
    async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let data: Option<Vec<u8>> = self
            .bounded(async {
                let mut conn = self.client.get_multiplexed_async_connection().await?;
                conn.get(Self::session_key(session_id)).await
            })
            .await?;

        Ok(data.as_deref().and_then(decode_session))
    }

    async fn save(&self, session_id: &str, session: &Session, ttl: Duration) -> Result<()> {
        let data = serde_json::to_vec(session)?;
        self.bounded(async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            conn.set_ex::<_, _, ()>(Self::session_key(session_id), data, ttl.as_secs())
                .await
        })
        .await
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.bounded(async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            conn.del::<_, ()>(Self::session_key(session_id)).await
        })
        .await
    }

    async fn heartbeat(&self, subject_id: &str, ttl: Duration) -> Result<()> {
        self.bounded(async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            conn.set_ex::<_, _, ()>(Self::online_key(subject_id), "1", ttl.as_secs())
                .await
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        let pong: String = self
            .bounded(async {
                let mut conn = self.client.get_multiplexed_async_connection().await?;
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;

        if pong != "PONG" {
            return Err(GatewayError::new(
                ErrorCode::SessionBackendUnavailable,
                "Session store answered ping with an unexpected reply",
            ));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

struct StoredSession {
    session: Session,
    expires_at: Instant,
}

/// In-process session storage for tests and single-node development.
#[derive(Default)]
pub struct MemorySessionBackend {
    sessions: DashMap<String, StoredSession>,
    online: DashMap<String, Instant>,
}

impl MemorySessionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a presence record for the subject is still live.
    pub fn is_online(&self, subject_id: &str) -> bool {
        self.online
            .get(subject_id)
            .map(|seen| *seen > Instant::now())
            .unwrap_or(false)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        if let Some(stored) = self.sessions.get(session_id) {
            if stored.expires_at <= Instant::now() {
                drop(stored);
                self.sessions.remove(session_id);
                return Ok(None);
            }
            Ok(Some(stored.session.clone()))
        } else {
            Ok(None)
        }
    }

    async fn save(&self, session_id: &str, session: &Session, ttl: Duration) -> Result<()> {
        self.sessions.insert(
            session_id.to_string(),
            StoredSession {
                session: session.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.sessions.remove(session_id);
        Ok(())
    }

    async fn heartbeat(&self, subject_id: &str, ttl: Duration) -> Result<()> {
        self.online
            .insert(subject_id.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("alice", "token", None, 3600, Duration::from_secs(86_400))
    }

    #[test]
    fn test_key_shapes() {
        assert_eq!(RedisSessionBackend::session_key("abc"), "session:abc");
        assert_eq!(RedisSessionBackend::online_key("42"), "online:42");
    }

    #[test]
    fn test_unreadable_record_decodes_as_none() {
        assert!(decode_session(b"{\"not\": \"a session\"}").is_none());
        assert!(decode_session(b"garbage").is_none());

        let bytes = serde_json::to_vec(&session()).unwrap();
        assert!(decode_session(&bytes).is_some());
    }

    #[tokio::test]
    async fn test_memory_save_load_delete() {
        let backend = MemorySessionBackend::new();
        let session = session();

        backend
            .save("sid-1", &session, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(backend.session_count(), 1);
        assert_eq!(backend.load("sid-1").await.unwrap(), Some(session));

        backend.delete("sid-1").await.unwrap();
        assert_eq!(backend.session_count(), 0);
        assert_eq!(backend.load("sid-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_record_lapses_after_ttl() {
        let backend = MemorySessionBackend::new();

        backend
            .save("sid-1", &session(), Duration::from_millis(60))
            .await
            .unwrap();
        assert!(backend.load("sid-1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(backend.load("sid-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_resave_extends_ttl() {
        let backend = MemorySessionBackend::new();
        let session = session();

        backend
            .save("sid-1", &session, Duration::from_millis(40))
            .await
            .unwrap();
        backend
            .save("sid-1", &session, Duration::from_millis(250))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(backend.load("sid-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_heartbeat_presence() {
        let backend = MemorySessionBackend::new();

        assert!(!backend.is_online("alice"));
        backend
            .heartbeat("alice", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(backend.is_online("alice"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!backend.is_online("alice"));
    }

    #[tokio::test]
    async fn test_memory_ping_always_succeeds() {
        assert!(MemorySessionBackend::new().ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_redis_backend_errors_when_unreachable() {
        let backend =
            RedisSessionBackend::new("redis://127.0.0.1:1", Duration::from_millis(200)).unwrap();

        assert!(backend.load("sid").await.is_err());
        assert!(backend
            .save("sid", &session(), Duration::from_secs(60))
            .await
            .is_err());
        assert!(backend.delete("sid").await.is_err());
        assert!(backend
            .heartbeat("alice", Duration::from_secs(60))
            .await
            .is_err());
        assert!(backend.ping().await.is_err());
    }
}
