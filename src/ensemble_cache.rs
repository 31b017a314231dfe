//! Ensemble cache engine
//!
//! Presents an ordered set of tiers as one cache:
//! - Lookups walk the healthy readable tiers in order and stop at the first
//!   live entry, then back-fill the faster tiers that missed it
//! - Stores and invalidations fan out to every eligible tier concurrently and
//!   succeed as long as one tier accepts them
//! - Every tier call goes through the tier's circuit breaker and is bounded
//!   by what is left of the caller's deadline
//!
//! Tier faults never reach the caller directly: a lookup degrades to the next
//! tier (or a miss), and a write only fails when every tier failed.
//!
//! Tiers are not kept transactionally consistent. After a partial write they
//! may disagree until the next successful write or until the entry expires.
//! Back-fill never outlives a later store or invalidation of the same key: it
//! is dropped, or undone, once the key's write generation has moved.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{BackfillMode, EnsembleConfig, InvalidateScope, ReadPolicy, TierKind};
use crate::entry::{VersionSource, WriteGenerations};
use crate::error::{FailureReason, TierFailure};
use crate::health::{HealthReport, HealthTracker, Outcome};
use crate::memory_tier::MemoryTier;
use crate::redis_tier::RedisTier;
use crate::registry::{Tier, TierDescriptor, TierRegistry};
use crate::tier::{CacheTier, KeyPattern};
use crate::{CacheEntry, CacheError, CacheKey};

/// Result of a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(Hit),
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn hit(&self) -> Option<&Hit> {
        match self {
            Lookup::Hit(hit) => Some(hit),
            Lookup::Miss => None,
        }
    }

    pub fn into_hit(self) -> Option<Hit> {
        match self {
            Lookup::Hit(hit) => Some(hit),
            Lookup::Miss => None,
        }
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.hit().map(Hit::value)
    }
}

/// A live entry and where it was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    pub entry: CacheEntry,
    /// Name of the tier that served the entry
    pub source: String,
    /// `None` when the entry never expires
    pub ttl_remaining: Option<Duration>,
}

impl Hit {
    pub fn value(&self) -> &Bytes {
        self.entry.value()
    }
}

/// Outcome of a successful store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReceipt {
    pub key: CacheKey,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Tiers that accepted the entry
    pub written: Vec<String>,
    /// Tiers that did not
    pub failures: Vec<TierFailure>,
}

impl StoreReceipt {
    /// Some writable tier missed this write.
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Outcome of a successful invalidation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidateReceipt {
    pub cleared: Vec<String>,
    pub failures: Vec<TierFailure>,
}

/// One item of a bulk store
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub key: CacheKey,
    pub value: Bytes,
    pub ttl: Option<Duration>,
}

impl StoreRequest {
    pub fn new(key: CacheKey, value: impl Into<Bytes>, ttl: Option<Duration>) -> Self {
        Self {
            key,
            value: value.into(),
            ttl,
        }
    }
}

/// Engine-wide policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Default overall deadline per operation
    pub deadline: Duration,
    pub read_policy: ReadPolicy,
    pub backfill: BackfillMode,
    pub invalidate_scope: InvalidateScope,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&EnsembleConfig::default())
    }
}

impl From<&EnsembleConfig> for EngineOptions {
    fn from(config: &EnsembleConfig) -> Self {
        Self {
            deadline: config.deadline,
            read_policy: config.read_policy,
            backfill: config.backfill,
            invalidate_scope: config.invalidate_scope,
        }
    }
}

/// The ensemble cache. Cheap to clone; clones share tiers and health state.
#[derive(Clone)]
pub struct EnsembleCache {
    inner: Arc<EnsembleInner>,
}

struct EnsembleInner {
    registry: TierRegistry,
    health: HealthTracker,
    clock: Arc<dyn Clock>,
    versions: VersionSource,
    generations: WriteGenerations,
    options: EngineOptions,
}

/// What a single tier read produced
enum TierRead {
    Hit(CacheEntry),
    Miss,
    Failed,
    OutOfTime,
}

/// A lookup winner plus the tiers that should receive it
struct Found<'a> {
    tier: &'a Tier,
    entry: CacheEntry,
    backfill: Vec<&'a Tier>,
}

#[derive(Clone, Copy)]
enum WriteOp<'a> {
    Set(&'a CacheEntry),
    Delete(&'a CacheKey),
}

impl EnsembleCache {
    /// Create an engine over an already validated registry. The engine owns a
    /// fresh health tracker for those tiers.
    pub fn new(registry: TierRegistry, clock: Arc<dyn Clock>, options: EngineOptions) -> Self {
        let health = registry.health_tracker();
        Self {
            inner: Arc::new(EnsembleInner {
                registry,
                health,
                clock,
                versions: VersionSource::default(),
                generations: WriteGenerations::default(),
                options,
            }),
        }
    }

    /// Build every configured tier and the engine over them.
    pub async fn from_config(config: &EnsembleConfig) -> Result<Self, CacheError> {
        Self::from_config_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn from_config_with_clock(
        config: &EnsembleConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        if config.deadline.is_zero() {
            return Err(CacheError::Configuration(
                "deadline must be non-zero".to_owned(),
            ));
        }

        let mut builder = TierRegistry::builder();
        for tier in &config.tiers {
            let store: Arc<dyn CacheTier> = match &tier.store {
                TierKind::Memory {
                    max_capacity,
                    max_entry_bytes,
                } => Arc::new(MemoryTier::new(
                    *max_capacity,
                    *max_entry_bytes,
                    Arc::clone(&clock),
                )),
                TierKind::Redis { url, key_prefix } => Arc::new(
                    RedisTier::connect(url, key_prefix.clone(), Arc::clone(&clock)).await?,
                ),
            };
            let (latency, durability) = TierDescriptor::classes_for(&tier.store);
            debug!(
                "Registering tier {} ({}) at order {}",
                tier.name,
                store.kind(),
                tier.order
            );
            builder = builder.tier(
                TierDescriptor {
                    name: tier.name.clone(),
                    order: tier.order,
                    readable: tier.readable,
                    writable: tier.writable,
                    latency,
                    durability,
                    timeout: tier.timeout,
                    health: tier.health,
                },
                store,
            );
        }

        Ok(Self::new(builder.build()?, clock, EngineOptions::from(config)))
    }

    pub fn registry(&self) -> &TierRegistry {
        &self.inner.registry
    }

    pub fn health(&self) -> &HealthTracker {
        &self.inner.health
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// Look a key up within the default deadline.
    pub async fn lookup(&self, key: &CacheKey) -> Lookup {
        self.lookup_within(key, self.inner.options.deadline).await
    }

    /// Look a key up, giving up (with a miss) once `budget` is spent.
    pub async fn lookup_within(&self, key: &CacheKey, budget: Duration) -> Lookup {
        let inner = &self.inner;
        let deadline = deadline_in(budget);
        let generation = inner.generations.current(key);
        let tiers = inner.registry.read_tiers(&inner.health);

        let found = match inner.options.read_policy {
            ReadPolicy::LowestOrder => inner.first_hit(key, &tiers, deadline).await,
            ReadPolicy::Freshest => inner.freshest(key, &tiers, deadline).await,
        };
        let Some(found) = found else {
            debug!("Cache miss on every tier for key: {}", key);
            return Lookup::Miss;
        };

        let source = found.tier.name().to_owned();
        let targets: Vec<String> = found
            .backfill
            .iter()
            .map(|tier| tier.name().to_owned())
            .collect();

        if !targets.is_empty() {
            match inner.options.backfill {
                BackfillMode::Detached => {
                    let inner = Arc::clone(&self.inner);
                    let entry = found.entry.clone();
                    tokio::spawn(async move {
                        inner.backfill(&entry, &targets, generation, None).await;
                    });
                }
                BackfillMode::Inline => {
                    inner
                        .backfill(&found.entry, &targets, generation, Some(deadline))
                        .await
                }
                BackfillMode::Disabled => {}
            }
        }

        let ttl_remaining = found.entry.remaining_ttl(inner.clock.now());
        Lookup::Hit(Hit {
            entry: found.entry,
            source,
            ttl_remaining,
        })
    }

    /// Whether any healthy readable tier holds a live entry for the key.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        let inner = &self.inner;
        let deadline = deadline_in(inner.options.deadline);
        let tiers = inner.registry.read_tiers(&inner.health);

        for (idx, tier) in tiers.iter().enumerate() {
            let Some(budget) = share_of(deadline, tiers.len() - idx, tier) else {
                break;
            };
            let Some(admission) = inner.health.admit(tier.name()) else {
                continue;
            };
            match tier.exists(key, budget).await {
                Ok(found) => {
                    admission.record(Outcome::Success);
                    if found {
                        return true;
                    }
                }
                Err(err) => {
                    admission.record(err.outcome());
                    warn!(
                        "Tier {} EXISTS error for key {} ({}). Trying next tier.",
                        tier.name(),
                        key,
                        err
                    );
                }
            }
        }
        false
    }

    /// Store a value within the default deadline. `ttl` of `None` never expires.
    pub async fn store(
        &self,
        key: &CacheKey,
        value: impl Into<Bytes>,
        ttl: Option<Duration>,
    ) -> Result<StoreReceipt, CacheError> {
        self.store_within(key, value, ttl, self.inner.options.deadline)
            .await
    }

    pub async fn store_within(
        &self,
        key: &CacheKey,
        value: impl Into<Bytes>,
        ttl: Option<Duration>,
        budget: Duration,
    ) -> Result<StoreReceipt, CacheError> {
        let inner = &self.inner;
        let deadline = deadline_in(budget);
        let now = inner.clock.now();
        let entry = CacheEntry::new(key.clone(), value, now, ttl, inner.versions.next(now))?;
        inner.generations.bump(key);

        let (written, failures) = inner
            .fan_out(inner.registry.write_tiers(), WriteOp::Set(&entry), deadline)
            .await;

        if written.is_empty() {
            warn!("Store failed on every writable tier for key: {}", key);
            return Err(CacheError::StoreFailed { failures });
        }
        if !failures.is_empty() {
            for failure in &failures {
                inner.health.note_degraded_write(&failure.tier);
                warn!(
                    "Degraded store for key {}: tier {} missed version {} ({})",
                    key,
                    failure.tier,
                    entry.version(),
                    failure.reason
                );
            }
        }
        debug!(
            "Stored key {} (version {}) on tiers {:?}",
            key,
            entry.version(),
            written
        );

        Ok(StoreReceipt {
            key: key.clone(),
            version: entry.version(),
            created_at: entry.created_at(),
            expires_at: entry.expires_at(),
            written,
            failures,
        })
    }

    /// Store several entries concurrently. Each item succeeds or fails on its own.
    pub async fn store_many(
        &self,
        items: Vec<StoreRequest>,
    ) -> Vec<Result<StoreReceipt, CacheError>> {
        join_all(
            items
                .into_iter()
                .map(|item| async move { self.store(&item.key, item.value, item.ttl).await }),
        )
        .await
    }

    /// Remove a key from every tier within the default deadline.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<InvalidateReceipt, CacheError> {
        self.invalidate_within(key, self.inner.options.deadline)
            .await
    }

    pub async fn invalidate_within(
        &self,
        key: &CacheKey,
        budget: Duration,
    ) -> Result<InvalidateReceipt, CacheError> {
        let inner = &self.inner;
        let deadline = deadline_in(budget);
        debug!("Invalidating cache for key: {}", key);
        inner.generations.bump(key);

        let tiers = inner.registry.invalidate_tiers(inner.options.invalidate_scope);
        let (cleared, failures) = inner.fan_out(tiers, WriteOp::Delete(key), deadline).await;

        if cleared.is_empty() {
            warn!("Invalidate failed on every tier for key: {}", key);
            return Err(CacheError::InvalidateFailed { failures });
        }
        for failure in &failures {
            warn!(
                "Tier {} kept key {} after invalidation ({}). Continuing.",
                failure.tier, key, failure.reason
            );
        }

        Ok(InvalidateReceipt { cleared, failures })
    }

    /// Keys with a live entry on any healthy readable tier, sorted. Tiers that
    /// fail or cannot list keys are skipped, so the result may be partial.
    pub async fn keys(&self, pattern: &KeyPattern) -> Vec<CacheKey> {
        let inner = &self.inner;
        let deadline = deadline_in(inner.options.deadline);
        let tiers = inner.registry.read_tiers(&inner.health);

        let listed = join_all(tiers.into_iter().map(|tier| async move {
            let budget = tier.budget(deadline.saturating_duration_since(Instant::now()));
            if budget.is_zero() {
                return Vec::new();
            }
            let Some(admission) = inner.health.admit(tier.name()) else {
                return Vec::new();
            };
            match tier.keys(pattern, budget).await {
                Ok(keys) => {
                    admission.record(Outcome::Success);
                    keys
                }
                Err(err) => {
                    admission.record(err.outcome());
                    warn!(
                        "Tier {} could not list keys matching {} ({}). Skipping tier.",
                        tier.name(),
                        pattern.as_str(),
                        err
                    );
                    Vec::new()
                }
            }
        }))
        .await;

        listed
            .into_iter()
            .flatten()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Ping every tier the breaker admits and report health for all of them.
    pub async fn check_tiers(&self) -> Vec<HealthReport> {
        let inner = &self.inner;
        join_all(inner.registry.iter().map(|tier| async move {
            let Some(admission) = inner.health.admit(tier.name()) else {
                return;
            };
            match tier.ping(tier.descriptor().timeout).await {
                Ok(()) => admission.record(Outcome::Success),
                Err(err) => {
                    admission.record(err.outcome());
                    warn!("Tier {} health check failed: {}", tier.name(), err);
                }
            }
        }))
        .await;

        self.health_report()
    }

    /// Current health of every tier, in read order.
    pub fn health_report(&self) -> Vec<HealthReport> {
        let inner = &self.inner;
        inner
            .registry
            .iter()
            .filter_map(|tier| inner.health.report(tier.name()))
            .collect()
    }
}

/// Far enough ahead to stand in for "no deadline"
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Deadline `budget` from now; budgets too large to represent are clamped.
fn deadline_in(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .unwrap_or_else(|| now + budget.min(FAR_FUTURE))
}

/// Budget for the next tier: an even share of what is left of the deadline
/// across the tiers still to consult, capped by the tier's own timeout.
fn share_of(deadline: Instant, tiers_left: usize, tier: &Tier) -> Option<Duration> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return None;
    }
    let slots = u32::try_from(tiers_left.max(1)).unwrap_or(u32::MAX);
    Some(tier.budget(remaining / slots))
}

impl EnsembleInner {
    async fn read_tier(
        &self,
        key: &CacheKey,
        tier: &Tier,
        deadline: Instant,
        tiers_left: usize,
    ) -> TierRead {
        let Some(budget) = share_of(deadline, tiers_left, tier) else {
            debug!("Deadline exhausted before tier {} for key: {}", tier.name(), key);
            return TierRead::OutOfTime;
        };
        // The circuit may have opened since the tier list was taken.
        let Some(admission) = self.health.admit(tier.name()) else {
            return TierRead::Failed;
        };

        match tier.get(key, budget).await {
            Ok(Some(entry)) => {
                admission.record(Outcome::Success);
                if entry.is_expired(self.clock.now()) {
                    debug!("Expired entry on tier {} for key: {}", tier.name(), key);
                    TierRead::Miss
                } else {
                    debug!("Cache hit on tier {} for key: {}", tier.name(), key);
                    TierRead::Hit(entry)
                }
            }
            Ok(None) => {
                admission.record(Outcome::Success);
                debug!("Cache miss on tier {} for key: {}", tier.name(), key);
                TierRead::Miss
            }
            Err(err) => {
                admission.record(err.outcome());
                warn!(
                    "Tier {} GET error for key {} ({}). Trying next tier.",
                    tier.name(),
                    key,
                    err
                );
                TierRead::Failed
            }
        }
    }

    /// Lowest-order tier wins; every faster tier is back-filled.
    async fn first_hit<'a>(
        &'a self,
        key: &CacheKey,
        tiers: &[&'a Tier],
        deadline: Instant,
    ) -> Option<Found<'a>> {
        for (idx, &tier) in tiers.iter().enumerate() {
            match self.read_tier(key, tier, deadline, tiers.len() - idx).await {
                TierRead::Hit(entry) => {
                    return Some(Found {
                        tier,
                        entry,
                        backfill: self.registry.ranked_before(tier.name()),
                    });
                }
                TierRead::Miss | TierRead::Failed => {}
                TierRead::OutOfTime => break,
            }
        }
        None
    }

    /// Every tier is consulted and the newest entry wins. Tiers that answered
    /// with a miss or an older entry are back-filled.
    async fn freshest<'a>(
        &'a self,
        key: &CacheKey,
        tiers: &[&'a Tier],
        deadline: Instant,
    ) -> Option<Found<'a>> {
        let mut best: Option<(&'a Tier, CacheEntry)> = None;
        let mut stale: Vec<&'a Tier> = Vec::new();

        for (idx, &tier) in tiers.iter().enumerate() {
            match self.read_tier(key, tier, deadline, tiers.len() - idx).await {
                TierRead::Hit(entry) => match best.take() {
                    Some((leader, current)) if entry.is_newer(&current) => {
                        stale.push(leader);
                        best = Some((tier, entry));
                    }
                    Some((leader, current)) => {
                        if current.is_newer(&entry) {
                            stale.push(tier);
                        }
                        best = Some((leader, current));
                    }
                    None => best = Some((tier, entry)),
                },
                TierRead::Miss => stale.push(tier),
                TierRead::Failed => {}
                TierRead::OutOfTime => break,
            }
        }

        best.map(|(tier, entry)| Found {
            tier,
            entry,
            backfill: stale
                .into_iter()
                .filter(|t| t.descriptor().writable)
                .collect(),
        })
    }

    /// Best-effort copy of `entry` into `targets`. Failures are recorded in
    /// health state and logged, never returned.
    ///
    /// `generation` is the key's write generation from before the entry was
    /// read. Once a store or invalidation moves it, the copy is stale: it is
    /// not written, and a copy that landed concurrently is deleted again so
    /// the tier falls through to the authoritative one.
    async fn backfill(
        &self,
        entry: &CacheEntry,
        targets: &[String],
        generation: u64,
        deadline: Option<Instant>,
    ) {
        let key = entry.key();
        let superseded = || self.generations.current(key) != generation;
        if entry.is_expired(self.clock.now()) || superseded() {
            return;
        }

        let writes = targets
            .iter()
            .filter_map(|name| self.registry.get(name))
            .map(|tier| async move {
                let budget = match deadline {
                    Some(deadline) => {
                        tier.budget(deadline.saturating_duration_since(Instant::now()))
                    }
                    None => tier.descriptor().timeout,
                };
                if budget.is_zero() {
                    return;
                }
                let Some(admission) = self.health.admit(tier.name()) else {
                    debug!("Skipping back-fill to unhealthy tier {}", tier.name());
                    return;
                };
                if superseded() {
                    debug!(
                        "Dropping superseded back-fill to tier {} for key: {}",
                        tier.name(),
                        key
                    );
                    return;
                }
                match tier.set(entry, budget).await {
                    Ok(()) => {
                        admission.record(Outcome::Success);
                        if superseded() {
                            self.undo_backfill(tier, key).await;
                            return;
                        }
                        debug!(
                            "Back-filled tier {} for key: {} (version {})",
                            tier.name(),
                            key,
                            entry.version()
                        );
                    }
                    Err(err) => {
                        admission.record(err.outcome());
                        warn!(
                            "Back-fill to tier {} failed for key {}: {}. Continuing.",
                            tier.name(),
                            key,
                            err
                        );
                    }
                }
            });

        join_all(writes).await;
    }

    /// Remove a back-filled copy that raced a store or invalidation.
    async fn undo_backfill(&self, tier: &Tier, key: &CacheKey) {
        debug!(
            "Back-fill to tier {} raced a write for key: {}. Removing copy.",
            tier.name(),
            key
        );
        if let Err(err) = tier.delete(key, tier.descriptor().timeout).await {
            self.health.record_outcome(tier.name(), err.outcome());
            warn!(
                "Could not remove raced back-fill from tier {} for key {}: {}",
                tier.name(),
                key,
                err
            );
        }
    }

    /// Apply `op` to every tier concurrently; returns (succeeded, failed).
    async fn fan_out<'t>(
        &self,
        tiers: impl Iterator<Item = &'t Tier>,
        op: WriteOp<'_>,
        deadline: Instant,
    ) -> (Vec<String>, Vec<TierFailure>) {
        let results = join_all(tiers.map(|tier| async move {
            (tier.name(), self.write_tier(tier, op, deadline).await)
        }))
        .await;

        let mut done = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(()) => done.push(name.to_owned()),
                Err(reason) => failures.push(TierFailure {
                    tier: name.to_owned(),
                    reason,
                }),
            }
        }
        (done, failures)
    }

    async fn write_tier(
        &self,
        tier: &Tier,
        op: WriteOp<'_>,
        deadline: Instant,
    ) -> Result<(), FailureReason> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(FailureReason::DeadlineExceeded);
        }
        let Some(admission) = self.health.admit(tier.name()) else {
            debug!("Skipping tier {} (circuit open)", tier.name());
            return Err(FailureReason::CircuitOpen);
        };

        let budget = tier.budget(remaining);
        let result = match op {
            WriteOp::Set(entry) => tier.set(entry, budget).await,
            WriteOp::Delete(key) => tier.delete(key, budget).await,
        };
        match result {
            Ok(()) => {
                admission.record(Outcome::Success);
                Ok(())
            }
            Err(err) => {
                admission.record(err.outcome());
                Err(FailureReason::Tier(err))
            }
        }
    }
}
