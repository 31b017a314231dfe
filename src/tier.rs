//! Cache tier adapter contract
//!
//! Every backing store (in-process memory, Redis, ...) implements
//! [`CacheTier`]. Adapters do not enforce deadlines themselves; callers wrap
//! each operation with [`bounded`], which turns an overrun into
//! [`TierError::Timeout`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use globset::{Glob, GlobMatcher};

use crate::{CacheEntry, CacheError, CacheKey, TierError};

/// Remaining lifetime of a key as reported by a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    /// Present without an expiry
    Persistent,
    Expires(Duration),
}

/// Glob over cache keys (`*`, `?`, `[abc]`, `{a,b}`). `*` also crosses `:`
/// and `/`, so `user:*` matches every key under `user:`.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    matcher: GlobMatcher,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Result<Self, CacheError> {
        let glob = Glob::new(pattern).map_err(|e| CacheError::InvalidPattern(e.to_string()))?;
        Ok(Self {
            matcher: glob.compile_matcher(),
        })
    }

    pub fn as_str(&self) -> &str {
        self.matcher.glob().glob()
    }

    pub fn matches(&self, key: &str) -> bool {
        self.matcher.is_match(key)
    }
}

/// Uniform capability set implemented once per backing store.
#[async_trait]
pub trait CacheTier: Send + Sync + 'static {
    /// Short store identifier used in logs (`"memory"`, `"redis"`).
    fn kind(&self) -> &'static str;

    /// Fetch the stored entry. Expiry filtering is the caller's job.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, TierError>;

    /// Store `entry` under its key, replacing any previous entry. The tier
    /// expires it no later than `entry.expires_at()`.
    async fn set(&self, entry: &CacheEntry) -> Result<(), TierError>;

    /// Remove the key. Removing a missing key succeeds.
    async fn delete(&self, key: &CacheKey) -> Result<(), TierError>;

    async fn exists(&self, key: &CacheKey) -> Result<bool, TierError>;

    async fn ttl(&self, key: &CacheKey) -> Result<KeyTtl, TierError>;

    /// Live keys matching `pattern`, in no particular order. Stores that
    /// cannot enumerate their keys keep this default.
    async fn keys(&self, _pattern: &KeyPattern) -> Result<Vec<CacheKey>, TierError> {
        Err(TierError::Rejected(format!(
            "{} tier cannot list keys",
            self.kind()
        )))
    }

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), TierError> {
        Ok(())
    }
}

/// Run a tier operation, failing with [`TierError::Timeout`] once `budget` is spent.
pub async fn bounded<T, F>(budget: Duration, op: F) -> Result<T, TierError>
where
    F: Future<Output = Result<T, TierError>>,
{
    match tokio::time::timeout(budget, op).await {
        Ok(result) => result,
        Err(_) => Err(TierError::Timeout(budget)),
    }
}
