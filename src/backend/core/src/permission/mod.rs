//! Subject permission resolution with tiered caching.
//!
//! This module provides:
//! - **PermissionTier**: pluggable cache tier interface (in-process, Redis)
//! - **IdentitySource**: the authoritative backend that owns subject
//!   permissions
//! - **PermissionResolver**: cache-aside lookup across the tier chain with
//!   per-subject request coalescing and closer-tier backfill
//!
//! A subject's permission set is a flat set of permission codes. Lookups
//! fail closed: if every tier misses and the identity source is
//! unreachable, the subject resolves to the empty set (which is never
//! cached).
//!
//! # Usage
//!
//! ```rust,ignore
//! use portcullis_core::permission::{
//!     HttpIdentitySource, InProcessTier, PermissionResolver, RedisTier,
//! };
//!
//! let resolver = PermissionResolver::new(
//!     vec![Arc::new(l1), Arc::new(l2)],
//!     Arc::new(identity_source),
//! );
//!
//! let permissions = resolver.resolve("subject-42").await;
//! if permissions.contains("business:read") {
//!     // ...
//! }
//! ```

pub mod resolver;
pub mod source;
pub mod tier;

pub use resolver::PermissionResolver;
pub use source::{HttpIdentitySource, IdentitySource};
pub use tier::{InProcessTier, PermissionTier, RedisTier, TierStats};
