//! Scripted tier used by engine tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::memory_tier::MemoryTier;
use crate::tier::{CacheTier, KeyPattern, KeyTtl};
use crate::{CacheEntry, CacheKey, TierError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Up,
    /// Every call fails with `Unavailable`
    Down,
    /// Every call blocks until the caller's timeout fires
    Hang,
}

/// A memory tier whose availability can be switched at runtime
pub(crate) struct ScriptedTier {
    pub(crate) inner: MemoryTier,
    mode: Mutex<Mode>,
    calls: AtomicUsize,
}

impl ScriptedTier {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryTier::new(1_000, None, clock),
            mode: Mutex::new(Mode::Up),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    /// Number of operations that reached this tier.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn gate(&self) -> Result<(), TierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock();
        match mode {
            Mode::Up => Ok(()),
            Mode::Down => Err(TierError::Unavailable("scripted outage".to_owned())),
            Mode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl CacheTier for ScriptedTier {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, TierError> {
        self.gate().await?;
        self.inner.get(key).await
    }

    async fn set(&self, entry: &CacheEntry) -> Result<(), TierError> {
        self.gate().await?;
        self.inner.set(entry).await
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), TierError> {
        self.gate().await?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool, TierError> {
        self.gate().await?;
        self.inner.exists(key).await
    }

    async fn ttl(&self, key: &CacheKey) -> Result<KeyTtl, TierError> {
        self.gate().await?;
        self.inner.ttl(key).await
    }

    async fn keys(&self, pattern: &KeyPattern) -> Result<Vec<CacheKey>, TierError> {
        self.gate().await?;
        self.inner.keys(pattern).await
    }

    async fn ping(&self) -> Result<(), TierError> {
        self.gate().await
    }
}
