//! Key and entry model
//!
//! Entries are immutable: storing a new value under a key always produces a
//! fresh [`CacheEntry`] with a higher version.

use std::fmt;
use std::hash::{BuildHasher, RandomState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::CacheError;

/// Smallest TTL an entry may carry. An entry with this TTL is already
/// expired one millisecond after creation: expiry is inclusive of `expires_at`.
pub const MIN_TTL: Duration = Duration::from_millis(1);

/// Caller-supplied cache key. Never empty; compared byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Result<Self, CacheError> {
        let key = key.into();
        if key.is_empty() {
            return Err(CacheError::InvalidKey("key must not be empty".to_owned()));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for CacheKey {
    type Error = CacheError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// A cached value together with its timestamps and version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    key: CacheKey,
    value: Bytes,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    version: u64,
}

impl CacheEntry {
    /// Build an entry created at `created_at` that lives for `ttl` (forever if `None`).
    pub fn new(
        key: CacheKey,
        value: impl Into<Bytes>,
        created_at: DateTime<Utc>,
        ttl: Option<Duration>,
        version: u64,
    ) -> Result<Self, CacheError> {
        let expires_at = match ttl {
            Some(ttl) => {
                if ttl < MIN_TTL {
                    return Err(CacheError::InvalidTtl(ttl));
                }
                let delta =
                    chrono::Duration::from_std(ttl).map_err(|_| CacheError::InvalidTtl(ttl))?;
                Some(
                    created_at
                        .checked_add_signed(delta)
                        .ok_or(CacheError::InvalidTtl(ttl))?,
                )
            }
            None => None,
        };

        Ok(Self {
            key,
            value: value.into(),
            created_at,
            expires_at,
            version,
        })
    }

    /// Rebuild an entry from stored parts, checking that expiry follows creation.
    pub fn from_parts(
        key: CacheKey,
        value: impl Into<Bytes>,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
        version: u64,
    ) -> Result<Self, CacheError> {
        if let Some(expires_at) = expires_at
            && expires_at <= created_at
        {
            return Err(CacheError::InvalidTtl(Duration::ZERO));
        }
        Ok(Self {
            key,
            value: value.into(),
            created_at,
            expires_at,
            version,
        })
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// An entry is gone once its full TTL has elapsed, so `now == expires_at`
    /// already counts as expired (the same boundary Redis applies).
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Time left before expiry; `None` for entries without a TTL.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| (expires_at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Whether `self` supersedes `other`: higher version, then later creation.
    pub fn is_newer(&self, other: &CacheEntry) -> bool {
        (self.version, self.created_at) > (other.version, other.created_at)
    }
}

/// Hands out entry versions: strictly increasing within a process and seeded
/// from the wall clock (microseconds) so they roughly order across processes.
#[derive(Debug, Default)]
pub(crate) struct VersionSource {
    last: AtomicU64,
}

impl VersionSource {
    pub(crate) fn next(&self, now: DateTime<Utc>) -> u64 {
        let floor = u64::try_from(now.timestamp_micros()).unwrap_or(0);
        let bump = |prev: u64| prev.saturating_add(1).max(floor);
        match self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| Some(bump(prev)))
        {
            Ok(prev) | Err(prev) => bump(prev),
        }
    }
}

/// Number of counters [`WriteGenerations`] spreads keys over
const GENERATION_STRIPES: usize = 256;

/// Write generations per key, striped over a fixed set of counters.
///
/// Every store or invalidation moves the generation of its key. Back-fill
/// remembers the generation seen when its lookup started and gives up once it
/// moved. Keys sharing a stripe only cost each other a skipped back-fill.
pub(crate) struct WriteGenerations {
    hasher: RandomState,
    stripes: Box<[AtomicU64]>,
}

impl Default for WriteGenerations {
    fn default() -> Self {
        Self {
            hasher: RandomState::new(),
            stripes: (0..GENERATION_STRIPES).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

impl WriteGenerations {
    fn stripe(&self, key: &CacheKey) -> &AtomicU64 {
        let hash = self.hasher.hash_one(key);
        &self.stripes[(hash % self.stripes.len() as u64) as usize]
    }

    pub(crate) fn current(&self, key: &CacheKey) -> u64 {
        self.stripe(key).load(Ordering::Acquire)
    }

    pub(crate) fn bump(&self, key: &CacheKey) {
        self.stripe(key).fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s).unwrap()
    }

    #[test]
    fn empty_keys_are_rejected() {
        assert!(matches!(CacheKey::new(""), Err(CacheError::InvalidKey(_))));
        assert!(CacheKey::try_from("user:1").is_ok());
    }

    #[test]
    fn keys_compare_byte_exact() {
        assert_ne!(key("User:1"), key("user:1"));
        assert_ne!(key("user:1 "), key("user:1"));
        assert_eq!(key("user:1"), key("user:1"));
    }

    #[test]
    fn expiry_is_observed_once_ttl_elapses() {
        let now = Utc::now();
        let entry =
            CacheEntry::new(key("k"), "v", now, Some(Duration::from_secs(60)), 1).unwrap();

        assert!(!entry.is_expired(now));
        assert!(!entry.is_expired(now + chrono::Duration::seconds(59)));
        assert!(entry.is_expired(now + chrono::Duration::seconds(60)));
        assert_eq!(
            entry.remaining_ttl(now + chrono::Duration::seconds(20)),
            Some(Duration::from_secs(40))
        );
        assert_eq!(
            entry.remaining_ttl(now + chrono::Duration::seconds(90)),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn entries_without_ttl_never_expire() {
        let now = Utc::now();
        let entry = CacheEntry::new(key("k"), "v", now, None, 1).unwrap();
        assert!(!entry.is_expired(now + chrono::Duration::days(3650)));
        assert_eq!(entry.remaining_ttl(now), None);
    }

    #[test]
    fn sub_millisecond_ttl_is_invalid() {
        let err = CacheEntry::new(key("k"), "v", Utc::now(), Some(Duration::ZERO), 1);
        assert!(matches!(err, Err(CacheError::InvalidTtl(_))));
        let err = CacheEntry::new(key("k"), "v", Utc::now(), Some(Duration::from_micros(10)), 1);
        assert!(matches!(err, Err(CacheError::InvalidTtl(_))));
    }

    #[test]
    fn from_parts_requires_expiry_after_creation() {
        let now = Utc::now();
        assert!(CacheEntry::from_parts(key("k"), "v", now, Some(now), 1).is_err());
        assert!(
            CacheEntry::from_parts(key("k"), "v", now, Some(now + chrono::Duration::seconds(1)), 1)
                .is_ok()
        );
    }

    #[test]
    fn newer_compares_version_then_creation() {
        let now = Utc::now();
        let later = now + chrono::Duration::milliseconds(5);
        let v1 = CacheEntry::new(key("k"), "a", later, None, 1).unwrap();
        let v2 = CacheEntry::new(key("k"), "b", now, None, 2).unwrap();
        assert!(v2.is_newer(&v1));
        assert!(!v1.is_newer(&v2));

        let tie_old = CacheEntry::new(key("k"), "a", now, None, 7).unwrap();
        let tie_new = CacheEntry::new(key("k"), "b", later, None, 7).unwrap();
        assert!(tie_new.is_newer(&tie_old));
        assert!(!tie_old.is_newer(&tie_old));
    }

    #[test]
    fn versions_strictly_increase() {
        let source = VersionSource::default();
        let now = Utc::now();
        let a = source.next(now);
        let b = source.next(now);
        let c = source.next(now - chrono::Duration::seconds(30));
        assert!(a < b && b < c);
        assert!(a >= u64::try_from(now.timestamp_micros()).unwrap());
    }

    #[test]
    fn generations_move_only_for_written_keys() {
        let generations = WriteGenerations::default();
        let seen = generations.current(&key("user:1"));

        generations.bump(&key("user:1"));
        assert_ne!(generations.current(&key("user:1")), seen);

        let other = generations.current(&key("user:2"));
        generations.bump(&key("user:1"));
        let moved = generations.current(&key("user:2")) != other;
        // Only possible when both keys landed on the same stripe.
        assert_eq!(
            moved,
            std::ptr::eq(
                generations.stripe(&key("user:1")),
                generations.stripe(&key("user:2"))
            )
        );
    }
}
