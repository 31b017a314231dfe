//! Cache configuration
//!
//! Every struct here deserializes with serde; durations are written in
//! human-readable form (`"250ms"`, `"5s"`). Reading the document from files or
//! the environment is left to the caller.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::CacheError;

/// Configuration for the whole ensemble
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Tier definitions, in any order (`order` decides read precedence)
    pub tiers: Vec<TierConfig>,
    /// Overall deadline for one lookup, store or invalidate
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
    pub read_policy: ReadPolicy,
    pub backfill: BackfillMode,
    pub invalidate_scope: InvalidateScope,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            tiers: vec![TierConfig::memory("local", 0)],
            deadline: Duration::from_millis(500),
            read_policy: ReadPolicy::default(),
            backfill: BackfillMode::default(),
            invalidate_scope: InvalidateScope::default(),
        }
    }
}

/// How a lookup picks its answer when several tiers hold the key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPolicy {
    /// Stop at the first tier (lowest order) with a live entry.
    #[default]
    LowestOrder,
    /// Consult every healthy readable tier and keep the newest entry.
    Freshest,
}

/// How back-fill writes run relative to the lookup that triggered them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillMode {
    /// Spawned in the background; the lookup returns immediately.
    #[default]
    Detached,
    /// Awaited inside the lookup, bounded by its deadline.
    Inline,
    Disabled,
}

/// Which tiers an invalidation deletes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidateScope {
    /// Tiers that are both readable and writable.
    #[default]
    ReadWrite,
    /// Every tier that is readable or writable, including read-only tiers
    /// whose content the engine never wrote.
    Any,
}

/// One tier definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Unique tier name
    pub name: String,
    /// Read precedence; lower is consulted first
    pub order: i32,
    #[serde(default = "enabled")]
    pub readable: bool,
    #[serde(default = "enabled")]
    pub writable: bool,
    /// Upper bound for any single operation against this tier
    #[serde(default = "default_tier_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub health: HealthConfig,
    pub store: TierKind,
}

fn enabled() -> bool {
    true
}

fn default_tier_timeout() -> Duration {
    Duration::from_millis(100)
}

impl TierConfig {
    /// An in-process tier with default capacity.
    pub fn memory(name: impl Into<String>, order: i32) -> Self {
        Self::with_store(
            name,
            order,
            TierKind::Memory {
                max_capacity: 10_000,
                max_entry_bytes: None,
            },
        )
    }

    /// A Redis tier at `url`.
    pub fn redis(name: impl Into<String>, order: i32, url: impl Into<String>) -> Self {
        Self::with_store(
            name,
            order,
            TierKind::Redis {
                url: url.into(),
                key_prefix: "cache:".to_owned(),
            },
        )
    }

    fn with_store(name: impl Into<String>, order: i32, store: TierKind) -> Self {
        Self {
            name: name.into(),
            order,
            readable: true,
            writable: true,
            timeout: default_tier_timeout(),
            health: HealthConfig::default(),
            store,
        }
    }
}

/// Backing store selection and its connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TierKind {
    Memory {
        /// Maximum number of entries held
        max_capacity: u64,
        /// Payloads larger than this are rejected
        #[serde(default)]
        max_entry_bytes: Option<usize>,
    },
    Redis {
        url: String,
        #[serde(default)]
        key_prefix: String,
    },
}

/// Circuit breaker thresholds for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive faults inside `window` that open the circuit
    pub failure_threshold: u32,
    /// Rolling window outcomes are kept for
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Maximum outcomes kept in the window
    pub window_size: usize,
    /// First cooldown after the circuit opens
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// Ceiling for the doubled cooldown after failed probes
    #[serde(with = "humantime_serde")]
    pub max_cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window: Duration::from_secs(30),
            window_size: 16,
            cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(60),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self, tier: &str) -> Result<(), CacheError> {
        let problem = if self.failure_threshold == 0 {
            "failure_threshold must be at least 1"
        } else if self.window_size < self.failure_threshold as usize {
            "window_size must be at least failure_threshold"
        } else if self.window.is_zero() {
            "window must be non-zero"
        } else if self.cooldown.is_zero() {
            "cooldown must be non-zero"
        } else if self.cooldown > self.max_cooldown {
            "cooldown must not exceed max_cooldown"
        } else {
            return Ok(());
        };
        Err(CacheError::Configuration(format!(
            "tier {tier}: {problem}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tier_definitions() {
        let config: EnsembleConfig = serde_json::from_str(
            r#"{
                "deadline": "250ms",
                "read_policy": "freshest",
                "backfill": "inline",
                "invalidate_scope": "any",
                "tiers": [
                    {
                        "name": "local",
                        "order": 0,
                        "timeout": "5ms",
                        "store": { "kind": "memory", "max_capacity": 500, "max_entry_bytes": 4096 }
                    },
                    {
                        "name": "shared",
                        "order": 1,
                        "readable": false,
                        "health": { "failure_threshold": 5, "cooldown": "2s", "max_cooldown": "1m" },
                        "store": { "kind": "redis", "url": "redis://127.0.0.1:6379", "key_prefix": "app:" }
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.deadline, Duration::from_millis(250));
        assert_eq!(config.read_policy, ReadPolicy::Freshest);
        assert_eq!(config.backfill, BackfillMode::Inline);
        assert_eq!(config.invalidate_scope, InvalidateScope::Any);

        let local = &config.tiers[0];
        assert_eq!(local.timeout, Duration::from_millis(5));
        assert!(local.readable && local.writable);
        assert_eq!(
            local.store,
            TierKind::Memory {
                max_capacity: 500,
                max_entry_bytes: Some(4096)
            }
        );

        let shared = &config.tiers[1];
        assert!(!shared.readable);
        assert_eq!(shared.timeout, Duration::from_millis(100));
        assert_eq!(shared.health.failure_threshold, 5);
        assert_eq!(shared.health.cooldown, Duration::from_secs(2));
        assert_eq!(shared.health.max_cooldown, Duration::from_secs(60));
        assert_eq!(shared.health.window_size, 16);
    }

    #[test]
    fn defaults_to_a_single_local_tier() {
        let config: EnsembleConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.tiers.len(), 1);
        assert_eq!(config.tiers[0].name, "local");
        assert_eq!(config.read_policy, ReadPolicy::LowestOrder);
        assert_eq!(config.backfill, BackfillMode::Detached);
        assert_eq!(config.invalidate_scope, InvalidateScope::ReadWrite);
    }

    #[test]
    fn rejects_inconsistent_health_thresholds() {
        let ok = HealthConfig::default();
        assert!(ok.validate("local").is_ok());

        let zero = HealthConfig {
            failure_threshold: 0,
            ..ok
        };
        assert!(matches!(
            zero.validate("local"),
            Err(CacheError::Configuration(_))
        ));

        let inverted = HealthConfig {
            cooldown: Duration::from_secs(120),
            ..ok
        };
        let err = inverted.validate("shared").unwrap_err().to_string();
        assert!(err.contains("shared"));

        let tiny_window = HealthConfig {
            window_size: 2,
            ..ok
        };
        assert!(tiny_window.validate("local").is_err());
    }
}
