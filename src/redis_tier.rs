//! Shared tier backed by Redis
//!
//! Each entry is a Redis hash holding the raw payload and its metadata:
//!
//! | field        | content                               |
//! |--------------|---------------------------------------|
//! | `value`      | payload bytes                         |
//! | `version`    | decimal version                       |
//! | `created_at` | creation time, Unix microseconds      |
//! | `expires_at` | expiry time, Unix microseconds (opt.) |
//!
//! The hash is written atomically together with its `PEXPIRE`, so Redis drops
//! the key when the entry expires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::tier::{CacheTier, KeyPattern, KeyTtl};
use crate::{CacheEntry, CacheError, CacheKey, TierError};

const FIELD_VALUE: &str = "value";
const FIELD_VERSION: &str = "version";
const FIELD_CREATED_AT: &str = "created_at";
const FIELD_EXPIRES_AT: &str = "expires_at";

/// Keys requested per SCAN round trip
const SCAN_BATCH: usize = 100;

/// Shared network tier
#[derive(Clone)]
pub struct RedisTier {
    redis: ConnectionManager,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl RedisTier {
    /// Connect to the Redis server at `url`.
    pub async fn connect(
        url: &str,
        key_prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self::new(redis, key_prefix, clock))
    }

    pub fn new(redis: ConnectionManager, key_prefix: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            redis,
            key_prefix: key_prefix.into(),
            clock,
        }
    }

    fn format_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

/// Escape Redis glob metacharacters so `prefix` matches literally.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn encode_fields(entry: &CacheEntry) -> Vec<(&'static str, Vec<u8>)> {
    let mut fields = vec![
        (FIELD_VALUE, entry.value().to_vec()),
        (FIELD_VERSION, entry.version().to_string().into_bytes()),
        (
            FIELD_CREATED_AT,
            entry.created_at().timestamp_micros().to_string().into_bytes(),
        ),
    ];
    if let Some(expires_at) = entry.expires_at() {
        fields.push((
            FIELD_EXPIRES_AT,
            expires_at.timestamp_micros().to_string().into_bytes(),
        ));
    }
    fields
}

fn decode_fields(
    key: &CacheKey,
    mut fields: HashMap<String, Vec<u8>>,
) -> Result<CacheEntry, String> {
    fn number<T: std::str::FromStr>(fields: &HashMap<String, Vec<u8>>, name: &str) -> Result<T, String> {
        let raw = fields
            .get(name)
            .ok_or_else(|| format!("missing field {name}"))?;
        std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| format!("unparseable field {name}"))
    }
    fn timestamp(micros: i64, name: &str) -> Result<DateTime<Utc>, String> {
        DateTime::from_timestamp_micros(micros).ok_or_else(|| format!("out of range field {name}"))
    }

    let version: u64 = number(&fields, FIELD_VERSION)?;
    let created_at = timestamp(number(&fields, FIELD_CREATED_AT)?, FIELD_CREATED_AT)?;
    let expires_at = if fields.contains_key(FIELD_EXPIRES_AT) {
        Some(timestamp(
            number(&fields, FIELD_EXPIRES_AT)?,
            FIELD_EXPIRES_AT,
        )?)
    } else {
        None
    };
    let value = fields
        .remove(FIELD_VALUE)
        .ok_or_else(|| format!("missing field {FIELD_VALUE}"))?;

    CacheEntry::from_parts(key.clone(), value, created_at, expires_at, version)
        .map_err(|e| e.to_string())
}

#[async_trait]
impl CacheTier for RedisTier {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, TierError> {
        let redis_key = self.format_key(key);
        let mut conn = self.redis.clone();

        let fields: HashMap<String, Vec<u8>> = conn.hgetall(&redis_key).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        match decode_fields(key, fields) {
            Ok(entry) => Ok(Some(entry)),
            Err(reason) => {
                warn!(
                    "Corrupt Redis entry for key {} ({}). Deleting corrupt entry.",
                    key, reason
                );
                if let Err(del_err) = conn.del::<_, ()>(&redis_key).await {
                    warn!(
                        "Failed to delete corrupt entry for key {} (Redis key: {}): {}",
                        key, redis_key, del_err
                    );
                }
                Ok(None)
            }
        }
    }

    async fn set(&self, entry: &CacheEntry) -> Result<(), TierError> {
        let remaining = entry.remaining_ttl(self.clock.now());
        if remaining == Some(Duration::ZERO) {
            return Err(TierError::Rejected("entry already expired".to_owned()));
        }

        let redis_key = self.format_key(entry.key());
        let fields = encode_fields(entry);

        // DEL first: HSET on an existing key would keep its old TTL.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&redis_key)
            .ignore()
            .hset_multiple(&redis_key, &fields)
            .ignore();
        if let Some(ttl) = remaining {
            let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
            pipe.pexpire(&redis_key, millis).ignore();
        }

        let mut conn = self.redis.clone();
        pipe.query_async::<()>(&mut conn).await?;
        debug!("Redis tier stored key: {} (version {})", entry.key(), entry.version());
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), TierError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(self.format_key(key)).await?;
        Ok(())
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool, TierError> {
        let mut conn = self.redis.clone();
        Ok(conn.exists::<_, bool>(self.format_key(key)).await?)
    }

    async fn ttl(&self, key: &CacheKey) -> Result<KeyTtl, TierError> {
        let mut conn = self.redis.clone();
        let millis: i64 = conn.pttl(self.format_key(key)).await?;
        Ok(match millis {
            -1 => KeyTtl::Persistent,
            ms if ms < 0 => KeyTtl::Missing,
            ms => KeyTtl::Expires(Duration::from_millis(ms.unsigned_abs())),
        })
    }

    // SCAN only narrows by prefix; the pattern itself is applied here so every
    // tier interprets it the same way.
    async fn keys(&self, pattern: &KeyPattern) -> Result<Vec<CacheKey>, TierError> {
        let mut conn = self.redis.clone();
        let scan_match = format!("{}*", escape_glob(&self.key_prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&scan_match)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            keys.extend(
                batch
                    .iter()
                    .filter_map(|raw| raw.strip_prefix(self.key_prefix.as_str()))
                    .filter(|name| pattern.matches(name))
                    .filter_map(|name| CacheKey::new(name).ok()),
            );

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), TierError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s).unwrap()
    }

    fn as_map(fields: Vec<(&'static str, Vec<u8>)>) -> HashMap<String, Vec<u8>> {
        fields
            .into_iter()
            .map(|(name, value)| (name.to_owned(), value))
            .collect()
    }

    #[test]
    fn fields_carry_payload_and_metadata() {
        let created = DateTime::from_timestamp_micros(1_700_000_000_123_456).unwrap();
        let entry = CacheEntry::new(
            key("user:1"),
            &b"\x00Alice\xff"[..],
            created,
            Some(Duration::from_secs(60)),
            42,
        )
        .unwrap();

        let fields = as_map(encode_fields(&entry));
        assert_eq!(fields[FIELD_VERSION], b"42");
        assert_eq!(fields[FIELD_CREATED_AT], b"1700000000123456");
        assert_eq!(fields[FIELD_EXPIRES_AT], b"1700000060123456");

        let decoded = decode_fields(&key("user:1"), fields).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn entries_without_ttl_omit_expiry_field() {
        let entry = CacheEntry::new(key("k"), "v", Utc::now(), None, 1).unwrap();
        let fields = as_map(encode_fields(&entry));
        assert!(!fields.contains_key(FIELD_EXPIRES_AT));
        assert_eq!(decode_fields(&key("k"), fields).unwrap().expires_at(), None);
    }

    #[test]
    fn corrupt_fields_are_reported() {
        let mut fields = HashMap::new();
        fields.insert(FIELD_VALUE.to_owned(), b"v".to_vec());
        fields.insert(FIELD_VERSION.to_owned(), b"not-a-number".to_vec());
        fields.insert(FIELD_CREATED_AT.to_owned(), b"1".to_vec());
        let err = decode_fields(&key("k"), fields).unwrap_err();
        assert!(err.contains(FIELD_VERSION));

        let mut fields = HashMap::new();
        fields.insert(FIELD_VERSION.to_owned(), b"1".to_vec());
        fields.insert(FIELD_CREATED_AT.to_owned(), b"1".to_vec());
        assert!(decode_fields(&key("k"), fields).is_err());
    }

    #[test]
    fn prefixes_are_matched_literally() {
        assert_eq!(escape_glob("cache:"), "cache:");
        assert_eq!(escape_glob("app[1]*"), "app\\[1\\]\\*");
    }

    #[test]
    fn expiry_before_creation_is_corrupt() {
        let mut fields = HashMap::new();
        fields.insert(FIELD_VALUE.to_owned(), b"v".to_vec());
        fields.insert(FIELD_VERSION.to_owned(), b"1".to_vec());
        fields.insert(FIELD_CREATED_AT.to_owned(), b"2000".to_vec());
        fields.insert(FIELD_EXPIRES_AT.to_owned(), b"1000".to_vec());
        assert!(decode_fields(&key("k"), fields).is_err());
    }
}
