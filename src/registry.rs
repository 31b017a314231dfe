//! Tier registry
//!
//! The ordered, validated set of tiers an engine works with. Built once at
//! startup and read-only afterwards.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{HealthConfig, InvalidateScope, TierKind};
use crate::health::HealthTracker;
use crate::tier::{CacheTier, KeyPattern, KeyTtl, bounded};
use crate::{CacheEntry, CacheError, CacheKey, TierError};

/// How expensive a tier is to reach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyClass {
    InProcess,
    Network,
}

/// Whether a tier's contents survive this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Volatile,
    Shared,
}

/// Static description of one tier
#[derive(Debug, Clone)]
pub struct TierDescriptor {
    pub name: String,
    /// Read precedence; lower is consulted first
    pub order: i32,
    pub readable: bool,
    pub writable: bool,
    pub latency: LatencyClass,
    pub durability: Durability,
    /// Upper bound for any single operation
    pub timeout: Duration,
    pub health: HealthConfig,
}

impl TierDescriptor {
    pub fn new(name: impl Into<String>, order: i32) -> Self {
        Self {
            name: name.into(),
            order,
            readable: true,
            writable: true,
            latency: LatencyClass::InProcess,
            durability: Durability::Volatile,
            timeout: Duration::from_millis(100),
            health: HealthConfig::default(),
        }
    }

    pub(crate) fn classes_for(kind: &TierKind) -> (LatencyClass, Durability) {
        match kind {
            TierKind::Memory { .. } => (LatencyClass::InProcess, Durability::Volatile),
            TierKind::Redis { .. } => (LatencyClass::Network, Durability::Shared),
        }
    }
}

/// A registered tier: its descriptor plus the adapter that talks to it.
///
/// The operation helpers bound every call by the given budget.
pub struct Tier {
    descriptor: TierDescriptor,
    store: Arc<dyn CacheTier>,
}

impl Tier {
    pub fn descriptor(&self) -> &TierDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn store(&self) -> &Arc<dyn CacheTier> {
        &self.store
    }

    /// Budget for one call given what is left of the caller's deadline.
    pub(crate) fn budget(&self, remaining: Duration) -> Duration {
        self.descriptor.timeout.min(remaining)
    }

    pub async fn get(
        &self,
        key: &CacheKey,
        budget: Duration,
    ) -> Result<Option<CacheEntry>, TierError> {
        bounded(budget, self.store.get(key)).await
    }

    pub async fn set(&self, entry: &CacheEntry, budget: Duration) -> Result<(), TierError> {
        bounded(budget, self.store.set(entry)).await
    }

    pub async fn delete(&self, key: &CacheKey, budget: Duration) -> Result<(), TierError> {
        bounded(budget, self.store.delete(key)).await
    }

    pub async fn exists(&self, key: &CacheKey, budget: Duration) -> Result<bool, TierError> {
        bounded(budget, self.store.exists(key)).await
    }

    pub async fn ttl(&self, key: &CacheKey, budget: Duration) -> Result<KeyTtl, TierError> {
        bounded(budget, self.store.ttl(key)).await
    }

    pub async fn keys(
        &self,
        pattern: &KeyPattern,
        budget: Duration,
    ) -> Result<Vec<CacheKey>, TierError> {
        bounded(budget, self.store.keys(pattern)).await
    }

    pub async fn ping(&self, budget: Duration) -> Result<(), TierError> {
        bounded(budget, self.store.ping()).await
    }
}

/// Collects tiers before validation
#[derive(Default)]
pub struct TierRegistryBuilder {
    tiers: Vec<Tier>,
}

impl TierRegistryBuilder {
    pub fn tier(mut self, descriptor: TierDescriptor, store: Arc<dyn CacheTier>) -> Self {
        self.tiers.push(Tier { descriptor, store });
        self
    }

    pub fn build(self) -> Result<TierRegistry, CacheError> {
        TierRegistry::new(self.tiers)
    }
}

/// Ordered, validated tiers
pub struct TierRegistry {
    /// Ascending `order`, ties in registration order
    tiers: Vec<Tier>,
}

impl TierRegistry {
    pub fn builder() -> TierRegistryBuilder {
        TierRegistryBuilder::default()
    }

    fn new(mut tiers: Vec<Tier>) -> Result<Self, CacheError> {
        let mut names = HashSet::new();
        for tier in &tiers {
            let name = tier.name();
            if name.is_empty() {
                return Err(CacheError::Configuration(
                    "tier name must not be empty".to_owned(),
                ));
            }
            if !names.insert(name) {
                return Err(CacheError::Configuration(format!(
                    "duplicate tier name: {name}"
                )));
            }
            if tier.descriptor.timeout.is_zero() {
                return Err(CacheError::Configuration(format!(
                    "tier {name}: timeout must be non-zero"
                )));
            }
            tier.descriptor.health.validate(name)?;
        }
        if !tiers.iter().any(|t| t.descriptor.writable) {
            return Err(CacheError::Configuration(
                "at least one tier must be writable".to_owned(),
            ));
        }
        if !tiers.iter().any(|t| t.descriptor.readable) {
            return Err(CacheError::Configuration(
                "at least one tier must be readable".to_owned(),
            ));
        }

        // Stable sort keeps registration order among equal ranks.
        tiers.sort_by_key(|t| t.descriptor.order);
        Ok(Self { tiers })
    }

    /// Readable tiers whose circuit currently allows traffic, in read order.
    pub fn read_tiers(&self, health: &HealthTracker) -> Vec<&Tier> {
        self.tiers
            .iter()
            .filter(|t| t.descriptor.readable && health.is_healthy(t.name()))
            .collect()
    }

    /// Every writable tier, regardless of health.
    pub fn write_tiers(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.iter().filter(|t| t.descriptor.writable)
    }

    /// Tiers an invalidation deletes from under `scope`.
    pub fn invalidate_tiers(&self, scope: InvalidateScope) -> impl Iterator<Item = &Tier> {
        self.tiers.iter().filter(move |t| match scope {
            InvalidateScope::ReadWrite => t.descriptor.readable && t.descriptor.writable,
            InvalidateScope::Any => t.descriptor.readable || t.descriptor.writable,
        })
    }

    /// Writable, readable tiers ranked strictly before `name`.
    pub(crate) fn ranked_before(&self, name: &str) -> Vec<&Tier> {
        self.tiers
            .iter()
            .take_while(|t| t.name() != name)
            .filter(|t| t.descriptor.readable && t.descriptor.writable)
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.name() == name)
    }

    /// All tiers in read order.
    pub fn iter(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.iter()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub(crate) fn health_tracker(&self) -> HealthTracker {
        HealthTracker::new(
            self.tiers
                .iter()
                .map(|t| (t.name(), t.descriptor.health)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::health::Outcome;
    use crate::memory_tier::MemoryTier;

    fn store() -> Arc<dyn CacheTier> {
        Arc::new(MemoryTier::new(10, None, Arc::new(ManualClock::default())))
    }

    fn names<'a>(tiers: impl IntoIterator<Item = &'a Tier>) -> Vec<&'a str> {
        tiers.into_iter().map(Tier::name).collect()
    }

    #[test]
    fn orders_by_rank_then_registration() {
        let registry = TierRegistry::builder()
            .tier(TierDescriptor::new("shared", 10), store())
            .tier(TierDescriptor::new("local-b", 0), store())
            .tier(TierDescriptor::new("local-a", 0), store())
            .tier(TierDescriptor::new("edge", -5), store())
            .build()
            .unwrap();

        assert_eq!(
            names(registry.iter()),
            vec!["edge", "local-b", "local-a", "shared"]
        );
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = TierRegistry::builder()
            .tier(TierDescriptor::new("local", 0), store())
            .tier(TierDescriptor::new("local", 1), store())
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("duplicate tier name: local"));
    }

    #[test]
    fn rejects_registry_without_writable_tier() {
        let mut descriptor = TierDescriptor::new("local", 0);
        descriptor.writable = false;
        let err = TierRegistry::builder().tier(descriptor, store()).build();
        assert!(matches!(err, Err(CacheError::Configuration(_))));
    }

    #[test]
    fn rejects_registry_without_readable_tier() {
        let mut descriptor = TierDescriptor::new("local", 0);
        descriptor.readable = false;
        let err = TierRegistry::builder().tier(descriptor, store()).build();
        assert!(matches!(err, Err(CacheError::Configuration(_))));
    }

    #[test]
    fn rejects_empty_registry() {
        assert!(TierRegistry::builder().build().is_err());
    }

    #[test]
    fn splits_read_and_write_tiers() {
        let mut write_only = TierDescriptor::new("audit", 5);
        write_only.readable = false;
        let mut read_only = TierDescriptor::new("replica", 3);
        read_only.writable = false;

        let registry = TierRegistry::builder()
            .tier(TierDescriptor::new("local", 0), store())
            .tier(write_only, store())
            .tier(read_only, store())
            .build()
            .unwrap();
        let health = registry.health_tracker();

        assert_eq!(names(registry.read_tiers(&health)), vec!["local", "replica"]);
        assert_eq!(names(registry.write_tiers()), vec!["local", "audit"]);
        assert_eq!(
            names(registry.invalidate_tiers(InvalidateScope::ReadWrite)),
            vec!["local"]
        );
        assert_eq!(
            names(registry.invalidate_tiers(InvalidateScope::Any)),
            vec!["local", "replica", "audit"]
        );
        assert_eq!(names(registry.ranked_before("audit")), vec!["local"]);
    }

    #[test]
    fn open_tiers_are_not_read() {
        let registry = TierRegistry::builder()
            .tier(TierDescriptor::new("local", 0), store())
            .tier(TierDescriptor::new("shared", 1), store())
            .build()
            .unwrap();
        let health = registry.health_tracker();
        for _ in 0..3 {
            health.record_outcome("local", Outcome::Timeout);
        }
        assert_eq!(names(registry.read_tiers(&health)), vec!["shared"]);
    }
}
