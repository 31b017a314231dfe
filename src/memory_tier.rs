//! In-process tier backed by a Moka cache
//!
//! Moka evicts by entry count and expires each entry at its own
//! `expires_at`, so expired entries do not linger in memory. The engine still
//! checks expiry against its clock on every read.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use tracing::debug;

use crate::clock::Clock;
use crate::tier::{CacheTier, KeyPattern, KeyTtl};
use crate::{CacheEntry, CacheKey, TierError};

/// Per-entry expiry computed from the entry's own deadline
struct EntryExpiry {
    clock: Arc<dyn Clock>,
}

impl Expiry<CacheKey, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.remaining_ttl(self.clock.now())
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.remaining_ttl(self.clock.now())
    }
}

/// Local in-memory tier
#[derive(Clone)]
pub struct MemoryTier {
    cache: Cache<CacheKey, CacheEntry>,
    clock: Arc<dyn Clock>,
    max_entry_bytes: Option<usize>,
}

impl MemoryTier {
    pub fn new(max_capacity: u64, max_entry_bytes: Option<usize>, clock: Arc<dyn Clock>) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry {
                clock: Arc::clone(&clock),
            })
            .build();

        Self {
            cache,
            clock,
            max_entry_bytes,
        }
    }

    /// Number of entries currently held (approximate, as reported by Moka).
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, TierError> {
        Ok(self.cache.get(key).await)
    }

    async fn set(&self, entry: &CacheEntry) -> Result<(), TierError> {
        if let Some(limit) = self.max_entry_bytes
            && entry.value().len() > limit
        {
            return Err(TierError::Rejected(format!(
                "payload of {} bytes exceeds limit of {} bytes",
                entry.value().len(),
                limit
            )));
        }
        if entry.is_expired(self.clock.now()) {
            return Err(TierError::Rejected("entry already expired".to_owned()));
        }

        self.cache.insert(entry.key().clone(), entry.clone()).await;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), TierError> {
        self.cache.invalidate(key).await;
        debug!("Memory tier invalidated key: {}", key);
        Ok(())
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool, TierError> {
        let now = self.clock.now();
        Ok(self
            .cache
            .get(key)
            .await
            .is_some_and(|entry| !entry.is_expired(now)))
    }

    async fn ttl(&self, key: &CacheKey) -> Result<KeyTtl, TierError> {
        let now = self.clock.now();
        Ok(match self.cache.get(key).await {
            Some(entry) if entry.is_expired(now) => KeyTtl::Missing,
            Some(entry) => match entry.remaining_ttl(now) {
                Some(left) => KeyTtl::Expires(left),
                None => KeyTtl::Persistent,
            },
            None => KeyTtl::Missing,
        })
    }

    async fn keys(&self, pattern: &KeyPattern) -> Result<Vec<CacheKey>, TierError> {
        let now = self.clock.now();
        Ok(self
            .cache
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && pattern.matches(key.as_str()))
            .map(|(key, _)| CacheKey::clone(&key))
            .collect())
    }
}
