//! Cache error types

use std::fmt;
use std::time::Duration;

use redis::RedisError;

use crate::health::Outcome;

/// Adapter-level errors, recoverable at the ensemble level by trying other tiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TierError {
    #[error("tier operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("tier unavailable: {0}")]
    Unavailable(String),

    #[error("tier rejected operation: {0}")]
    Rejected(String),
}

impl TierError {
    /// The health outcome this error counts as.
    pub fn outcome(&self) -> Outcome {
        match self {
            TierError::Timeout(_) => Outcome::Timeout,
            TierError::Unavailable(_) => Outcome::Failure,
            TierError::Rejected(_) => Outcome::Rejected,
        }
    }
}

impl From<RedisError> for TierError {
    fn from(err: RedisError) -> Self {
        if err.is_timeout() {
            TierError::Timeout(Duration::ZERO)
        } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped()
        {
            TierError::Unavailable(err.to_string())
        } else {
            TierError::Rejected(err.to_string())
        }
    }
}

/// Why a tier did not take part in a fan-out write or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The tier's circuit was open, so it was skipped.
    CircuitOpen,
    /// The overall deadline ran out before the tier could be called.
    DeadlineExceeded,
    /// The tier was called and failed.
    Tier(TierError),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::CircuitOpen => f.write_str("circuit open"),
            FailureReason::DeadlineExceeded => f.write_str("deadline exceeded"),
            FailureReason::Tier(err) => write!(f, "{err}"),
        }
    }
}

/// A single tier's failure inside an ensemble operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierFailure {
    pub tier: String,
    pub reason: FailureReason,
}

impl fmt::Display for TierFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.tier, self.reason)
    }
}

fn join_failures(failures: &[TierFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Ensemble-level errors surfaced to callers
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("invalid ttl {0:?}: must be at least one millisecond")]
    InvalidTtl(Duration),

    #[error("invalid key pattern: {0}")]
    InvalidPattern(String),

    #[error("store failed on every writable tier ({})", join_failures(.failures))]
    StoreFailed { failures: Vec<TierFailure> },

    #[error("invalidate failed on every tier ({})", join_failures(.failures))]
    InvalidateFailed { failures: Vec<TierFailure> },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),
}
