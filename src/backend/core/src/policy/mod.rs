//! Endpoint policies: which permission (if any) a route requires.
//!
//! This module provides:
//! - **EndpointPolicy**: the path/method → permission rule published by the
//!   policy source
//! - **PolicySnapshot**: an immutable, pre-compiled, priority-ordered view of
//!   the full rule list
//! - **PolicyStore**: the atomically swappable holder of the current snapshot;
//!   readers never lock
//! - **PolicyRefresher**: scheduled + on-demand repopulation with retry,
//!   backoff, and single-flight coordination
//!
//! # Usage
//!
//! ```rust,ignore
//! use portcullis_core::policy::{PolicyStore, PolicySnapshot, EndpointPolicy};
//!
//! let store = PolicyStore::new();
//! store.install(PolicySnapshot::build(vec![
//!     EndpointPolicy::protected("/api/business/**", "GET", "business:read", 10),
//! ])?);
//!
//! if let Some(policy) = store.matches("GET", "/api/business/items/42") {
//!     println!("requires {}", policy.permission_code);
//! }
//! ```

pub mod refresher;
pub mod source;

pub use refresher::{PolicyRefresher, RefreshOutcome};
pub use source::{HttpPolicySource, PolicySource};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{ErrorCode, GatewayError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Endpoint Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// A single authorization rule, as published by the policy source.
///
/// Rules are immutable once published; the full list is the unit of
/// replacement. Exactly one rule governs a given (method, path) pair at
/// decision time: the highest-priority match, ties broken by position in
/// the published list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointPolicy {
    /// Ant-style path glob: `?` one char, `*` within a segment, `**` across
    /// segments (a trailing `/**` also matches the bare prefix).
    pub pattern: String,

    /// HTTP method, or `"*"` for any. Compared case-insensitively.
    pub method: String,

    /// Permission required to pass this rule. Ignored for public rules.
    #[serde(default)]
    pub permission_code: String,

    /// Public rules allow the request without any permission lookup.
    #[serde(rename = "public", default)]
    pub is_public: bool,

    /// Higher priority wins when several patterns match the same path.
    #[serde(default)]
    pub priority: i32,
}

impl EndpointPolicy {
    /// Build a protected rule.
    pub fn protected(
        pattern: impl Into<String>,
        method: impl Into<String>,
        permission_code: impl Into<String>,
        priority: i32,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            method: method.into(),
            permission_code: permission_code.into(),
            is_public: false,
            priority,
        }
    }

    /// Build a public rule.
    pub fn public(pattern: impl Into<String>, method: impl Into<String>, priority: i32) -> Self {
        Self {
            pattern: pattern.into(),
            method: method.into(),
            permission_code: String::new(),
            is_public: true,
            priority,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pattern Compilation
// ═══════════════════════════════════════════════════════════════════════════════

/// Method matcher pre-normalized at snapshot build time.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MethodMatcher {
    Any,
    Exact(String),
}

impl MethodMatcher {
    fn parse(method: &str) -> Self {
        if method == "*" {
            Self::Any
        } else {
            Self::Exact(method.to_ascii_uppercase())
        }
    }

    fn matches(&self, method: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(m) => m.eq_ignore_ascii_case(method),
        }
    }
}

/// Translate an Ant-style glob into an anchored regular expression.
///
/// `/a/**/b` matches `/a/b` (zero intermediate segments) and a trailing
/// `/**` matches the bare prefix, mirroring the matcher the policy source
/// authors write patterns against.
fn translate_pattern(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');

    let mut i = 0;
    while i < chars.len() {
        let is_double_star_segment = chars[i] == '/'
            && chars.get(i + 1) == Some(&'*')
            && chars.get(i + 2) == Some(&'*');

        if is_double_star_segment && i + 3 == chars.len() {
            // trailing "/**": optional slash-and-rest
            regex.push_str("(?:/.*)?");
            i += 3;
        } else if is_double_star_segment && chars.get(i + 3) == Some(&'/') {
            // "/**/": zero or more whole segments
            regex.push_str("/(?:.*/)?");
            i += 4;
        } else {
            match chars[i] {
                '*' if chars.get(i + 1) == Some(&'*') => {
                    regex.push_str(".*");
                    i += 2;
                }
                '*' => {
                    regex.push_str("[^/]*");
                    i += 1;
                }
                '?' => {
                    regex.push_str("[^/]");
                    i += 1;
                }
                c => {
                    regex.push_str(&regex::escape(&c.to_string()));
                    i += 1;
                }
            }
        }
    }

    regex.push('$');
    regex
}

/// A policy with its pattern compiled for matching.
#[derive(Debug, Clone)]
struct CompiledPolicy {
    policy: EndpointPolicy,
    method: MethodMatcher,
    path: Regex,
}

impl CompiledPolicy {
    fn compile(policy: EndpointPolicy) -> Result<Self> {
        let translated = translate_pattern(&policy.pattern);
        let path = Regex::new(&translated).map_err(|e| {
            GatewayError::with_internal(
                ErrorCode::InvalidPolicyPattern,
                "Policy pattern failed to compile",
                format!("pattern {:?}: {}", policy.pattern, e),
            )
        })?;
        let method = MethodMatcher::parse(&policy.method);
        Ok(Self {
            policy,
            method,
            path,
        })
    }

    fn matches(&self, method: &str, path: &str) -> bool {
        self.method.matches(method) && self.path.is_match(path)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Policy Snapshot
// ═══════════════════════════════════════════════════════════════════════════════

/// An immutable, compiled view of the full policy list.
///
/// Built once per refresh and swapped in wholesale; in-flight readers keep
/// whatever snapshot they loaded until they drop it.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    compiled: Vec<CompiledPolicy>,
    version: u64,
    loaded_at: Option<DateTime<Utc>>,
}

impl PolicySnapshot {
    /// The empty snapshot used before the first successful refresh.
    pub fn empty() -> Self {
        Self {
            compiled: Vec::new(),
            version: 0,
            loaded_at: None,
        }
    }

    /// Compile the published list into a matchable snapshot.
    ///
    /// Policies are stable-sorted by descending priority, so equal
    /// priorities keep their published (registration) order and the first
    /// match during a scan is always the governing rule.
    pub fn build(policies: Vec<EndpointPolicy>) -> Result<Self> {
        let mut compiled = policies
            .into_iter()
            .map(CompiledPolicy::compile)
            .collect::<Result<Vec<_>>>()?;
        compiled.sort_by(|a, b| b.policy.priority.cmp(&a.policy.priority));

        Ok(Self {
            compiled,
            version: 0,
            loaded_at: Some(Utc::now()),
        })
    }

    /// Find the governing rule for a (method, path) pair.
    ///
    /// Returns `None` when nothing matches; callers must treat that as deny.
    pub fn match_route(&self, method: &str, path: &str) -> Option<&EndpointPolicy> {
        self.compiled
            .iter()
            .find(|cp| cp.matches(method, path))
            .map(|cp| &cp.policy)
    }

    /// Number of rules in this snapshot.
    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    /// Monotonic version assigned at install time (0 = never installed).
    pub fn version(&self) -> u64 {
        self.version
    }

    /// When this snapshot was built from the source (`None` for the
    /// startup-empty snapshot).
    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Policy Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Holder of the current [`PolicySnapshot`].
///
/// Reads are wait-free atomic loads; the refresher is the only writer and
/// replaces the whole snapshot in one swap. A failed refresh never touches
/// the stored snapshot, so previously-allowed traffic keeps flowing on the
/// last-known-good rules.
#[derive(Debug)]
pub struct PolicyStore {
    current: ArcSwap<PolicySnapshot>,
    installs: AtomicU64,
}

impl PolicyStore {
    /// Create a store holding the empty snapshot.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from(Arc::new(PolicySnapshot::empty())),
            installs: AtomicU64::new(0),
        }
    }

    /// Find the governing rule for a request. Lock-free.
    pub fn matches(&self, method: &str, path: &str) -> Option<EndpointPolicy> {
        self.current.load().match_route(method, path).cloned()
    }

    /// Get the current snapshot (for health reporting and tests).
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.load_full()
    }

    /// Atomically replace the current snapshot. Returns the installed version.
    pub fn install(&self, mut snapshot: PolicySnapshot) -> u64 {
        let version = self.installs.fetch_add(1, Ordering::AcqRel) + 1;
        snapshot.version = version;
        self.current.store(Arc::new(snapshot));
        version
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn snapshot(policies: Vec<EndpointPolicy>) -> PolicySnapshot {
        PolicySnapshot::build(policies).unwrap()
    }

    #[test]
    fn test_exact_pattern() {
        let snap = snapshot(vec![EndpointPolicy::protected(
            "/api/items",
            "GET",
            "items:read",
            0,
        )]);

        assert!(snap.match_route("GET", "/api/items").is_some());
        assert!(snap.match_route("GET", "/api/items/42").is_none());
        assert!(snap.match_route("GET", "/api/itemsX").is_none());
    }

    #[test]
    fn test_single_star_stays_within_segment() {
        let snap = snapshot(vec![EndpointPolicy::protected(
            "/api/items/*",
            "GET",
            "items:read",
            0,
        )]);

        assert!(snap.match_route("GET", "/api/items/42").is_some());
        assert!(snap.match_route("GET", "/api/items/42/details").is_none());
    }

    #[test]
    fn test_double_star_crosses_segments() {
        let snap = snapshot(vec![EndpointPolicy::protected(
            "/api/business/**",
            "GET",
            "business:read",
            0,
        )]);

        // the bare prefix matches too
        assert!(snap.match_route("GET", "/api/business").is_some());
        assert!(snap.match_route("GET", "/api/business/").is_some());
        assert!(snap.match_route("GET", "/api/business/items").is_some());
        assert!(snap.match_route("GET", "/api/business/items/42").is_some());
        assert!(snap.match_route("GET", "/api/businesses").is_none());
    }

    #[test]
    fn test_double_star_mid_pattern_matches_zero_segments() {
        let snap = snapshot(vec![EndpointPolicy::protected(
            "/api/**/export",
            "POST",
            "export:run",
            0,
        )]);

        assert!(snap.match_route("POST", "/api/export").is_some());
        assert!(snap.match_route("POST", "/api/reports/export").is_some());
        assert!(snap.match_route("POST", "/api/reports/q3/export").is_some());
        assert!(snap.match_route("POST", "/api/exports").is_none());
    }

    #[test]
    fn test_question_mark_single_char() {
        let snap = snapshot(vec![EndpointPolicy::protected(
            "/api/v?/items",
            "GET",
            "items:read",
            0,
        )]);

        assert!(snap.match_route("GET", "/api/v1/items").is_some());
        assert!(snap.match_route("GET", "/api/v2/items").is_some());
        assert!(snap.match_route("GET", "/api/v12/items").is_none());
        assert!(snap.match_route("GET", "/api/v//items").is_none());
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let snap = snapshot(vec![EndpointPolicy::protected(
            "/api/v1.0/items",
            "GET",
            "items:read",
            0,
        )]);

        assert!(snap.match_route("GET", "/api/v1.0/items").is_some());
        assert!(snap.match_route("GET", "/api/v1X0/items").is_none());
    }

    #[test]
    fn test_method_wildcard_and_case() {
        let snap = snapshot(vec![EndpointPolicy::protected(
            "/api/items",
            "*",
            "items:write",
            0,
        )]);

        assert!(snap.match_route("GET", "/api/items").is_some());
        assert!(snap.match_route("DELETE", "/api/items").is_some());

        let snap = snapshot(vec![EndpointPolicy::protected(
            "/api/items",
            "post",
            "items:write",
            0,
        )]);
        assert!(snap.match_route("POST", "/api/items").is_some());
        assert!(snap.match_route("Post", "/api/items").is_some());
        assert!(snap.match_route("GET", "/api/items").is_none());
    }

    #[test]
    fn test_highest_priority_wins() {
        let snap = snapshot(vec![
            EndpointPolicy::protected("/api/**", "GET", "api:read", 0),
            EndpointPolicy::protected("/api/admin/**", "GET", "admin:read", 100),
        ]);

        let matched = snap.match_route("GET", "/api/admin/users").unwrap();
        assert_eq!(matched.permission_code, "admin:read");

        let matched = snap.match_route("GET", "/api/items").unwrap();
        assert_eq!(matched.permission_code, "api:read");
    }

    #[test]
    fn test_priority_tie_keeps_registration_order() {
        let snap = snapshot(vec![
            EndpointPolicy::protected("/api/**", "GET", "first:registered", 5),
            EndpointPolicy::protected("/api/**", "GET", "second:registered", 5),
        ]);

        let matched = snap.match_route("GET", "/api/items").unwrap();
        assert_eq!(matched.permission_code, "first:registered");
    }

    #[test]
    fn test_unmatched_route_returns_none() {
        let snap = snapshot(vec![EndpointPolicy::protected(
            "/api/items/**",
            "GET",
            "items:read",
            0,
        )]);

        assert!(snap.match_route("GET", "/internal/debug").is_none());
    }

    #[test]
    fn test_store_starts_empty_and_versions_installs() {
        let store = PolicyStore::new();
        assert!(store.matches("GET", "/anything").is_none());
        assert_eq!(store.snapshot().version(), 0);
        assert!(store.snapshot().loaded_at().is_none());

        let v1 = store.install(snapshot(vec![EndpointPolicy::public("/ping", "GET", 0)]));
        assert_eq!(v1, 1);
        assert_eq!(store.snapshot().version(), 1);
        assert!(store.snapshot().loaded_at().is_some());
        assert!(store.matches("GET", "/ping").is_some());

        let v2 = store.install(snapshot(vec![]));
        assert_eq!(v2, 2);
        assert!(store.matches("GET", "/ping").is_none());
    }

    #[test]
    fn test_readers_keep_loaded_snapshot_across_install() {
        let store = PolicyStore::new();
        store.install(snapshot(vec![EndpointPolicy::public("/old", "GET", 0)]));

        let held = store.snapshot();
        store.install(snapshot(vec![EndpointPolicy::public("/new", "GET", 0)]));

        // the held reference still sees the old list in full
        assert!(held.match_route("GET", "/old").is_some());
        assert!(held.match_route("GET", "/new").is_none());
        // fresh loads see the new list
        assert!(store.matches("GET", "/new").is_some());
        assert!(store.matches("GET", "/old").is_none());
    }

    /// A snapshot whose two rules carry the same generation marker, so a
    /// reader can tell whether both answers came from one list.
    fn generation(n: u64) -> PolicySnapshot {
        snapshot(vec![
            EndpointPolicy::protected("/api/items/**", "GET", format!("items:read:g{}", n), 10),
            EndpointPolicy::protected("/api/orders/**", "GET", format!("orders:read:g{}", n), 10),
        ])
    }

    #[test]
    fn test_concurrent_readers_observe_whole_snapshots() {
        let store = Arc::new(PolicyStore::new());
        store.install(generation(0));

        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut n = 0u64;
                while !done.load(Ordering::Acquire) {
                    n += 1;
                    store.install(generation(n));
                }
                n
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..300 {
                        let snap = store.snapshot();
                        let items = snap.match_route("GET", "/api/items/1").unwrap();
                        let orders = snap.match_route("GET", "/api/orders/1").unwrap();
                        let items_gen =
                            items.permission_code.strip_prefix("items:read:").unwrap();
                        let orders_gen =
                            orders.permission_code.strip_prefix("orders:read:").unwrap();
                        assert_eq!(items_gen, orders_gen, "rules from two different lists");
                    }
                })
            })
            .collect();

        for reader in readers {
            reader.join().unwrap();
        }
        done.store(true, Ordering::Release);
        let last = writer.join().unwrap();

        let code = store.matches("GET", "/api/items/1").unwrap().permission_code;
        assert_eq!(code, format!("items:read:g{}", last));
    }

    #[test]
    fn test_wire_format_round_trip() {
        let json = r#"[
            {"pattern": "/api/business/**", "method": "GET",
             "permissionCode": "business:read", "public": false, "priority": 10},
            {"pattern": "/auth/**", "method": "*", "public": true}
        ]"#;

        let policies: Vec<EndpointPolicy> = serde_json::from_str(json).unwrap();
        assert_eq!(policies.len(), 2);
        assert_eq!(policies[0].permission_code, "business:read");
        assert_eq!(policies[0].priority, 10);
        assert!(!policies[0].is_public);
        assert!(policies[1].is_public);
        assert_eq!(policies[1].priority, 0);

        let encoded = serde_json::to_string(&policies[0]).unwrap();
        assert!(encoded.contains("\"permissionCode\""));
        assert!(encoded.contains("\"public\":false"));
    }
}
