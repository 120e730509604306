//! Permission cache tiers.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{ErrorCode, GatewayError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Permission Tier Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A cache tier holding subject permission sets.
///
/// Tiers are consulted closest-first by the resolver; a tier that errors is
/// skipped, never fatal. `lookup` distinguishes "not cached" (`Ok(None)`)
/// from "cached as empty" (`Ok(Some(empty set))`).
#[async_trait]
pub trait PermissionTier: Send + Sync {
    /// Look up the cached permission set for a subject.
    async fn lookup(&self, subject: &str) -> Result<Option<HashSet<String>>>;

    /// Cache the permission set for a subject.
    async fn store(&self, subject: &str, permissions: &HashSet<String>) -> Result<()>;

    /// Drop the cached permission set for a subject.
    async fn invalidate(&self, subject: &str) -> Result<()>;

    /// Tier name for logging and metrics.
    fn name(&self) -> &'static str;
}

/// Point-in-time tier counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Process Tier
// ═══════════════════════════════════════════════════════════════════════════════

struct CachedPermissions {
    permissions: HashSet<String>,
    expires_at: Instant,
}

/// Bounded in-process tier with absolute-TTL expiry.
pub struct InProcessTier {
    entries: DashMap<String, CachedPermissions>,
    capacity: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl InProcessTier {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> TierStats {
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.len() as u64,
        }
    }

    /// Evict entries if at capacity: expired entries first, then arbitrary
    /// entries until a tenth of the capacity is free.
    fn maybe_evict(&self) {
        if self.entries.len() < self.capacity {
            return;
        }

        let mut evicted = 0u64;
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| e.key().clone())
            .collect();
        for key in expired {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }

        let to_free = (self.capacity / 10).max(1);
        if self.entries.len() + to_free > self.capacity {
            let victims: Vec<String> = self
                .entries
                .iter()
                .take(to_free)
                .map(|e| e.key().clone())
                .collect();
            for key in victims {
                if self.entries.remove(&key).is_some() {
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            debug!(evicted, "Evicted permission cache entries");
        }
    }
}

#[async_trait]
impl PermissionTier for InProcessTier {
    async fn lookup(&self, subject: &str) -> Result<Option<HashSet<String>>> {
        if let Some(entry) = self.entries.get(subject) {
            if entry.expires_at <= Instant::now() {
                drop(entry);
                self.entries.remove(subject);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }

            let permissions = entry.permissions.clone();
            self.hits.fetch_add(1, Ordering::Relaxed);
            Ok(Some(permissions))
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }
    }

    async fn store(&self, subject: &str, permissions: &HashSet<String>) -> Result<()> {
        self.maybe_evict();
        self.entries.insert(
            subject.to_string(),
            CachedPermissions {
                permissions: permissions.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn invalidate(&self, subject: &str) -> Result<()> {
        self.entries.remove(subject);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_process"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Tier
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis-backed tier shared by all gateway instances.
///
/// Every operation is bounded by `op_timeout` so a slow Redis degrades a
/// lookup to a tier miss instead of stalling the request path. The client
/// connects lazily; construction succeeds even while Redis is down.
pub struct RedisTier {
    client: redis::Client,
    ttl: Duration,
    op_timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RedisTier {
    pub fn new(url: &str, ttl: Duration, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            GatewayError::with_internal(
                ErrorCode::CacheBackendUnavailable,
                "Failed to create Redis client",
                e.to_string(),
            )
        })?;
        Ok(Self::with_client(client, ttl, op_timeout))
    }

    /// Build from an existing client.
    pub fn with_client(client: redis::Client, ttl: Duration, op_timeout: Duration) -> Self {
        Self {
            client,
            ttl,
            op_timeout,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> TierStats {
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ..TierStats::default()
        }
    }

    fn key(subject: &str) -> String {
        format!("authz:perm:{}", subject)
    }

    fn timeout_error() -> GatewayError {
        GatewayError::new(
            ErrorCode::CacheBackendUnavailable,
            "Cache operation timed out",
        )
    }
}

#[async_trait]
impl PermissionTier for RedisTier {
    async fn lookup(&self, subject: &str) -> Result<Option<HashSet<String>>> {
        let op = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let data: Option<Vec<u8>> = conn.get(Self::key(subject)).await?;
            Ok::<_, redis::RedisError>(data)
        };

        let data = tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| Self::timeout_error())??;

        match data {
            Some(bytes) => {
                let permissions: HashSet<String> = serde_json::from_slice(&bytes)?;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(permissions))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn store(&self, subject: &str, permissions: &HashSet<String>) -> Result<()> {
        let data = serde_json::to_vec(permissions)?;
        let ttl_secs = self.ttl.as_secs();

        let op = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            conn.set_ex::<_, _, ()>(Self::key(subject), data, ttl_secs)
                .await?;
            Ok::<_, redis::RedisError>(())
        };

        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| Self::timeout_error())??;
        Ok(())
    }

    async fn invalidate(&self, subject: &str) -> Result<()> {
        let op = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            conn.del::<_, ()>(Self::key(subject)).await?;
            Ok::<_, redis::RedisError>(())
        };

        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| Self::timeout_error())??;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn perms(codes: &[&str]) -> HashSet<String> {
        codes.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_in_process_store_and_lookup() {
        let tier = InProcessTier::new(100, Duration::from_secs(60));

        tier.store("alice", &perms(&["items:read", "items:write"]))
            .await
            .unwrap();

        let found = tier.lookup("alice").await.unwrap();
        assert_eq!(found, Some(perms(&["items:read", "items:write"])));

        let missing = tier.lookup("bob").await.unwrap();
        assert!(missing.is_none());

        let stats = tier.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_in_process_empty_set_is_a_hit() {
        let tier = InProcessTier::new(100, Duration::from_secs(60));

        tier.store("nobody", &HashSet::new()).await.unwrap();

        // cached-as-empty is distinct from not-cached
        let found = tier.lookup("nobody").await.unwrap();
        assert_eq!(found, Some(HashSet::new()));
    }

    #[tokio::test]
    async fn test_in_process_expiry() {
        let tier = InProcessTier::new(100, Duration::from_millis(20));

        tier.store("alice", &perms(&["items:read"])).await.unwrap();
        assert!(tier.lookup("alice").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(tier.lookup("alice").await.unwrap().is_none());
        // the expired entry was removed on lookup
        assert_eq!(tier.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_in_process_invalidate() {
        let tier = InProcessTier::new(100, Duration::from_secs(60));

        tier.store("alice", &perms(&["items:read"])).await.unwrap();
        tier.invalidate("alice").await.unwrap();
        assert!(tier.lookup("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_process_eviction_bounds_entries() {
        let tier = InProcessTier::new(10, Duration::from_secs(60));

        for i in 0..25 {
            tier.store(&format!("subject-{}", i), &perms(&["p"]))
                .await
                .unwrap();
        }

        let stats = tier.stats();
        assert!(stats.entries <= 10);
        assert!(stats.evictions > 0);
    }

    #[test]
    fn test_redis_key_shape() {
        assert_eq!(RedisTier::key("42"), "authz:perm:42");
    }

    #[tokio::test]
    async fn test_redis_tier_errors_when_unreachable() {
        // nothing listens on this port
        let tier = RedisTier::new(
            "redis://127.0.0.1:1",
            Duration::from_secs(3600),
            Duration::from_millis(200),
        )
        .unwrap();

        assert!(tier.lookup("alice").await.is_err());
        assert!(tier.store("alice", &perms(&["p"])).await.is_err());
        assert!(tier.invalidate("alice").await.is_err());
    }
}
