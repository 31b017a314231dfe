//! ensemble-cache - Tiered caching behind a single contract
//!
//! This library combines several cache tiers into one logical cache:
//! - Local: in-memory Moka cache (fastest, per process)
//! - Shared: Redis (slower, shared across instances)
//! - Any other store implementing [`CacheTier`]
//!
//! The cache supports:
//! - Ordered lookups that stop at the first live entry and back-fill faster tiers
//! - Concurrent write and invalidation fan-out with partial-failure tolerance
//! - Per-tier circuit breakers so a down tier adds no latency
//! - Deadlines split across the tiers a request still has to consult
//! - Best-effort key listing by glob pattern across readable tiers

mod clock;
pub mod config;
mod ensemble_cache;
mod entry;
mod error;
pub mod health;
mod memory_tier;
mod redis_tier;
pub mod registry;
pub mod tier;

#[cfg(test)]
mod test_support;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BackfillMode, EnsembleConfig, HealthConfig, InvalidateScope, ReadPolicy, TierConfig, TierKind,
};
pub use ensemble_cache::{
    EngineOptions, EnsembleCache, Hit, InvalidateReceipt, Lookup, StoreReceipt, StoreRequest,
};
pub use entry::{CacheEntry, CacheKey, MIN_TTL};
pub use error::{CacheError, FailureReason, TierError, TierFailure};
pub use health::{CircuitState, HealthReport, HealthTracker, Outcome};
pub use memory_tier::MemoryTier;
pub use redis_tier::RedisTier;
pub use registry::{Durability, LatencyClass, Tier, TierDescriptor, TierRegistry};
pub use tier::{CacheTier, KeyPattern, KeyTtl};

// Re-export async_trait for adapter implementors
pub use async_trait::async_trait;
