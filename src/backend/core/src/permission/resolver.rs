//! Cache-aside permission resolution.

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::permission::{IdentitySource, PermissionTier};

type SharedFetch = Shared<BoxFuture<'static, HashSet<String>>>;

/// Resolves subject permission sets through the tier chain.
///
/// Lookup order is tiers closest-first, then the identity source. A hit in
/// a farther tier is written back into the tiers in front of it; a source
/// fetch is written into every tier, farthest first. Concurrent misses for
/// the same subject share one source fetch.
///
/// The resolver never fails a request: tier errors skip the tier, and an
/// unreachable identity source resolves to the empty set without caching it.
#[derive(Clone)]
pub struct PermissionResolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    tiers: Vec<Arc<dyn PermissionTier>>,
    source: Arc<dyn IdentitySource>,
    in_flight: DashMap<String, SharedFetch>,
}

impl PermissionResolver {
    pub fn new(tiers: Vec<Arc<dyn PermissionTier>>, source: Arc<dyn IdentitySource>) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                tiers,
                source,
                in_flight: DashMap::new(),
            }),
        }
    }

    /// Resolve the full permission set for a subject.
    pub async fn resolve(&self, subject: &str) -> HashSet<String> {
        for (idx, tier) in self.inner.tiers.iter().enumerate() {
            match tier.lookup(subject).await {
                Ok(Some(permissions)) => {
                    counter!(
                        "gateway_permission_lookups_total",
                        "tier" => tier.name(),
                        "result" => "hit"
                    )
                    .increment(1);
                    self.backfill(subject, idx, &permissions).await;
                    return permissions;
                }
                Ok(None) => {
                    counter!(
                        "gateway_permission_lookups_total",
                        "tier" => tier.name(),
                        "result" => "miss"
                    )
                    .increment(1);
                }
                Err(e) => {
                    warn!(
                        tier = tier.name(),
                        subject,
                        error = %e,
                        "Permission tier lookup failed; skipping tier"
                    );
                    counter!(
                        "gateway_permission_lookups_total",
                        "tier" => tier.name(),
                        "result" => "error"
                    )
                    .increment(1);
                }
            }
        }

        // Missed everywhere: join the in-flight fetch for this subject, or
        // start one.
        let fetch = self
            .inner
            .in_flight
            .entry(subject.to_string())
            .or_insert_with(|| Self::spawn_fetch(&self.inner, subject))
            .clone();
        fetch.await
    }

    /// Check a single permission code for a subject.
    pub async fn has_permission(&self, subject: &str, code: &str) -> bool {
        self.resolve(subject).await.contains(code)
    }

    /// Drop the subject from every tier and abandon any in-flight fetch.
    pub async fn invalidate(&self, subject: &str) {
        self.inner.in_flight.remove(subject);
        for tier in &self.inner.tiers {
            if let Err(e) = tier.invalidate(subject).await {
                warn!(
                    tier = tier.name(),
                    subject,
                    error = %e,
                    "Permission invalidation failed in tier"
                );
            }
        }
        info!(subject, "Subject permissions invalidated");
    }

    async fn backfill(&self, subject: &str, hit_idx: usize, permissions: &HashSet<String>) {
        for tier in &self.inner.tiers[..hit_idx] {
            if let Err(e) = tier.store(subject, permissions).await {
                warn!(tier = tier.name(), error = %e, "Permission backfill failed");
            }
        }
    }

    /// Start a source fetch decoupled from the calling request, so a client
    /// disconnect cannot cancel it out from under coalesced followers.
    fn spawn_fetch(inner: &Arc<ResolverInner>, subject: &str) -> SharedFetch {
        let inner = Arc::clone(inner);
        let subject = subject.to_string();

        let handle = tokio::spawn(async move {
            let permissions = inner.fetch_and_store(&subject).await;
            inner.in_flight.remove(&subject);
            permissions
        });

        async move {
            match handle.await {
                Ok(permissions) => permissions,
                Err(e) => {
                    error!(error = %e, "Permission fetch task failed");
                    HashSet::new()
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl ResolverInner {
    async fn fetch_and_store(&self, subject: &str) -> HashSet<String> {
        match self.source.fetch_permissions(subject).await {
            Ok(permissions) => {
                debug!(
                    subject,
                    count = permissions.len(),
                    source = self.source.name(),
                    "Permissions fetched from identity source"
                );
                counter!("gateway_permission_fetches_total", "result" => "success").increment(1);
                // Farthest tier first: shared storage fills before
                // per-instance caches.
                for tier in self.tiers.iter().rev() {
                    if let Err(e) = tier.store(subject, &permissions).await {
                        warn!(
                            tier = tier.name(),
                            error = %e,
                            "Failed to store permissions in tier"
                        );
                    }
                }
                permissions
            }
            Err(e) => {
                // Fail closed, and never cache the failure.
                warn!(
                    subject,
                    error = %e,
                    "Identity source fetch failed; resolving to no permissions"
                );
                counter!("gateway_permission_fetches_total", "result" => "failure").increment(1);
                HashSet::new()
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, GatewayError, Result};
    use crate::permission::{InProcessTier, RedisTier};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;

    struct StaticSource {
        sets: parking_lot::Mutex<HashMap<String, HashSet<String>>>,
        calls: AtomicU64,
        fail: AtomicBool,
        delay: Duration,
    }

    impl StaticSource {
        fn new(entries: &[(&str, &[&str])]) -> Self {
            let sets = entries
                .iter()
                .map(|(subject, codes)| {
                    (
                        subject.to_string(),
                        codes.iter().map(|c| c.to_string()).collect(),
                    )
                })
                .collect();
            Self {
                sets: parking_lot::Mutex::new(sets),
                calls: AtomicU64::new(0),
                fail: AtomicBool::new(false),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IdentitySource for StaticSource {
        async fn fetch_permissions(&self, subject: &str) -> Result<HashSet<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(GatewayError::new(
                    ErrorCode::IdentitySourceUnavailable,
                    "identity service down",
                ));
            }
            Ok(self.sets.lock().get(subject).cloned().unwrap_or_default())
        }

        fn name(&self) -> &str {
            "static"
        }
    }

    fn perms(codes: &[&str]) -> HashSet<String> {
        codes.iter().map(|s| s.to_string()).collect()
    }

    /// Tier that records every store into a shared log and never hits.
    struct RecordingTier {
        label: &'static str,
        writes: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl PermissionTier for RecordingTier {
        async fn lookup(&self, _subject: &str) -> Result<Option<HashSet<String>>> {
            Ok(None)
        }

        async fn store(&self, _subject: &str, _permissions: &HashSet<String>) -> Result<()> {
            self.writes.lock().push(self.label);
            Ok(())
        }

        async fn invalidate(&self, _subject: &str) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            self.label
        }
    }

    #[tokio::test]
    async fn test_resolves_from_source_and_caches() {
        let tier = Arc::new(InProcessTier::new(100, Duration::from_secs(60)));
        let source = Arc::new(StaticSource::new(&[("alice", &["items:read"])]));
        let resolver = PermissionResolver::new(vec![tier.clone()], source.clone());

        let resolved = resolver.resolve("alice").await;
        assert_eq!(resolved, perms(&["items:read"]));
        assert_eq!(source.calls(), 1);

        // second resolve is served by the tier
        let resolved = resolver.resolve("alice").await;
        assert_eq!(resolved, perms(&["items:read"]));
        assert_eq!(source.calls(), 1);
        assert_eq!(tier.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_hit_in_far_tier_backfills_closer_tier() {
        let l1 = Arc::new(InProcessTier::new(100, Duration::from_secs(60)));
        let l2 = Arc::new(InProcessTier::new(100, Duration::from_secs(60)));
        let source = Arc::new(StaticSource::new(&[]));
        let resolver =
            PermissionResolver::new(vec![l1.clone(), l2.clone()], source.clone());

        l2.store("alice", &perms(&["items:read"])).await.unwrap();

        let resolved = resolver.resolve("alice").await;
        assert_eq!(resolved, perms(&["items:read"]));
        assert_eq!(source.calls(), 0);

        // the far-tier hit was written into the closer tier
        let backfilled = l1.lookup("alice").await.unwrap();
        assert_eq!(backfilled, Some(perms(&["items:read"])));
    }

    #[tokio::test]
    async fn test_failing_tier_is_skipped() {
        let broken = Arc::new(RedisTier::new(
            "redis://127.0.0.1:1",
            Duration::from_secs(3600),
            Duration::from_millis(100),
        )
        .unwrap());
        let healthy = Arc::new(InProcessTier::new(100, Duration::from_secs(60)));
        healthy.store("alice", &perms(&["items:read"])).await.unwrap();

        let source = Arc::new(StaticSource::new(&[]));
        let resolver = PermissionResolver::new(vec![broken, healthy], source.clone());

        let resolved = resolver.resolve("alice").await;
        assert_eq!(resolved, perms(&["items:read"]));
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_source_failure_resolves_empty_without_caching() {
        let tier = Arc::new(InProcessTier::new(100, Duration::from_secs(60)));
        let source = Arc::new(StaticSource::new(&[("alice", &["items:read"])]));
        source.fail.store(true, Ordering::SeqCst);
        let resolver = PermissionResolver::new(vec![tier.clone()], source.clone());

        let resolved = resolver.resolve("alice").await;
        assert!(resolved.is_empty());
        assert_eq!(source.calls(), 1);

        // the failure was not cached; recovery is immediate
        assert_eq!(tier.lookup("alice").await.unwrap(), None);
        source.fail.store(false, Ordering::SeqCst);
        let resolved = resolver.resolve("alice").await;
        assert_eq!(resolved, perms(&["items:read"]));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_source_fetch_populates_farthest_tier_first() {
        let writes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let near: Arc<dyn PermissionTier> = Arc::new(RecordingTier {
            label: "near",
            writes: writes.clone(),
        });
        let far: Arc<dyn PermissionTier> = Arc::new(RecordingTier {
            label: "far",
            writes: writes.clone(),
        });
        let source = Arc::new(StaticSource::new(&[("alice", &["items:read"])]));
        let resolver = PermissionResolver::new(vec![near, far], source);

        let resolved = resolver.resolve("alice").await;
        assert_eq!(resolved, perms(&["items:read"]));

        // shared storage is written before the per-instance cache
        assert_eq!(*writes.lock(), vec!["far", "near"]);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let tier = Arc::new(InProcessTier::new(100, Duration::from_secs(60)));
        let source = Arc::new(
            StaticSource::new(&[("alice", &["items:read"])])
                .with_delay(Duration::from_millis(50)),
        );
        let resolver = PermissionResolver::new(vec![tier], source.clone());

        let a = {
            let r = resolver.clone();
            tokio::spawn(async move { r.resolve("alice").await })
        };
        let b = {
            let r = resolver.clone();
            tokio::spawn(async move { r.resolve("alice").await })
        };

        assert_eq!(a.await.unwrap(), perms(&["items:read"]));
        assert_eq!(b.await.unwrap(), perms(&["items:read"]));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_distinct_subjects_fetch_independently() {
        let tier = Arc::new(InProcessTier::new(100, Duration::from_secs(60)));
        let source = Arc::new(
            StaticSource::new(&[("alice", &["a"]), ("bob", &["b"])])
                .with_delay(Duration::from_millis(20)),
        );
        let resolver = PermissionResolver::new(vec![tier], source.clone());

        let (alice, bob) = tokio::join!(resolver.resolve("alice"), resolver.resolve("bob"));
        assert_eq!(alice, perms(&["a"]));
        assert_eq!(bob, perms(&["b"]));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_clears_tiers_and_refetches() {
        let tier = Arc::new(InProcessTier::new(100, Duration::from_secs(60)));
        let source = Arc::new(StaticSource::new(&[("alice", &["items:read"])]));
        let resolver = PermissionResolver::new(vec![tier.clone()], source.clone());

        resolver.resolve("alice").await;
        assert_eq!(source.calls(), 1);

        resolver.invalidate("alice").await;
        assert_eq!(tier.lookup("alice").await.unwrap(), None);

        // permission change takes effect on the next resolve
        source
            .sets
            .lock()
            .insert("alice".to_string(), perms(&["items:read", "items:write"]));
        let resolved = resolver.resolve("alice").await;
        assert_eq!(resolved, perms(&["items:read", "items:write"]));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_has_permission() {
        let tier = Arc::new(InProcessTier::new(100, Duration::from_secs(60)));
        let source = Arc::new(StaticSource::new(&[("alice", &["items:read"])]));
        let resolver = PermissionResolver::new(vec![tier], source);

        assert!(resolver.has_permission("alice", "items:read").await);
        assert!(!resolver.has_permission("alice", "items:write").await);
        assert!(!resolver.has_permission("stranger", "items:read").await);
    }
}
