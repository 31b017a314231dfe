//! Per-tier health tracking and circuit breaking
//!
//! Every tier operation reports an [`Outcome`]. A run of consecutive faults
//! inside the rolling window opens the tier's circuit; after the cooldown a
//! single probe is admitted, which either closes the circuit again or re-opens
//! it with a doubled cooldown (capped at `max_cooldown`).
//!
//! Each tier has its own lock. The tracker's map of tiers is fixed at
//! construction, so lookups never contend on a global lock.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;

/// Result of a single tier operation as seen by the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
    /// The tier answered but refused the request. Proves reachability.
    Rejected,
}

impl Outcome {
    pub fn is_fault(self) -> bool {
        matches!(self, Outcome::Failure | Outcome::Timeout)
    }
}

/// Externally visible circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Circuit {
    Closed,
    Open { since: Instant, until: Instant },
    HalfOpen { probe_in_flight: bool },
}

/// Kind of permission granted by [`Breaker::try_admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admit {
    Normal,
    Probe,
}

/// Circuit breaker state machine for one tier. Pure over the `now` it is given.
#[derive(Debug)]
struct Breaker {
    config: HealthConfig,
    circuit: Circuit,
    cooldown: Duration,
    window: VecDeque<(Instant, Outcome)>,
    degraded_writes: u64,
}

impl Breaker {
    fn new(config: HealthConfig) -> Self {
        Self {
            cooldown: config.cooldown,
            window: VecDeque::with_capacity(config.window_size),
            circuit: Circuit::Closed,
            degraded_writes: 0,
            config,
        }
    }

    fn state(&self, now: Instant) -> CircuitState {
        match self.circuit {
            Circuit::Closed => CircuitState::Closed,
            Circuit::Open { until, .. } if now >= until => CircuitState::HalfOpen,
            Circuit::Open { .. } => CircuitState::Open,
            Circuit::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    fn is_available(&self, now: Instant) -> bool {
        match self.circuit {
            Circuit::Closed => true,
            Circuit::Open { until, .. } => now >= until,
            Circuit::HalfOpen { probe_in_flight } => !probe_in_flight,
        }
    }

    fn time_until_probe(&self, now: Instant) -> Duration {
        match self.circuit {
            Circuit::Open { until, .. } => until.saturating_duration_since(now),
            _ => Duration::ZERO,
        }
    }

    fn try_admit(&mut self, now: Instant) -> Option<Admit> {
        if let Circuit::Open { until, .. } = self.circuit
            && now >= until
        {
            self.circuit = Circuit::HalfOpen {
                probe_in_flight: false,
            };
        }

        match self.circuit {
            Circuit::Closed => Some(Admit::Normal),
            Circuit::Open { .. } => None,
            Circuit::HalfOpen {
                probe_in_flight: true,
            } => None,
            Circuit::HalfOpen {
                probe_in_flight: false,
            } => {
                self.circuit = Circuit::HalfOpen {
                    probe_in_flight: true,
                };
                Some(Admit::Probe)
            }
        }
    }

    fn release_probe(&mut self) {
        if let Circuit::HalfOpen {
            probe_in_flight: true,
        } = self.circuit
        {
            self.circuit = Circuit::HalfOpen {
                probe_in_flight: false,
            };
        }
    }

    /// Record an outcome; returns the new state when a transition happened.
    fn record(&mut self, now: Instant, outcome: Outcome) -> Option<CircuitState> {
        self.push(now, outcome);

        match self.circuit {
            Circuit::Closed => {
                if outcome.is_fault()
                    && self.consecutive_faults(now) >= self.config.failure_threshold as usize
                {
                    self.cooldown = self.config.cooldown;
                    self.open(now);
                    return Some(CircuitState::Open);
                }
                None
            }
            Circuit::HalfOpen { .. } => {
                if outcome.is_fault() {
                    self.cooldown = self
                        .cooldown
                        .saturating_mul(2)
                        .min(self.config.max_cooldown);
                    self.open(now);
                    Some(CircuitState::Open)
                } else {
                    self.cooldown = self.config.cooldown;
                    self.circuit = Circuit::Closed;
                    Some(CircuitState::Closed)
                }
            }
            // Stragglers admitted before the circuit opened.
            Circuit::Open { .. } => None,
        }
    }

    fn open(&mut self, now: Instant) {
        self.circuit = Circuit::Open {
            since: now,
            until: now + self.cooldown,
        };
    }

    fn push(&mut self, now: Instant, outcome: Outcome) {
        self.window.push_back((now, outcome));
        while self.window.len() > self.config.window_size {
            self.window.pop_front();
        }
        let horizon = now.checked_sub(self.config.window);
        while let Some(&(at, _)) = self.window.front() {
            match horizon {
                Some(horizon) if at < horizon => {
                    self.window.pop_front();
                }
                _ => break,
            }
        }
    }

    fn consecutive_faults(&self, now: Instant) -> usize {
        self.window
            .iter()
            .rev()
            .take_while(|(at, outcome)| {
                outcome.is_fault() && now.saturating_duration_since(*at) <= self.config.window
            })
            .count()
    }

    fn report(&self, name: &str, now: Instant) -> HealthReport {
        let (faults, successes) = self
            .window
            .iter()
            .fold((0, 0), |(faults, successes), (_, outcome)| {
                if outcome.is_fault() {
                    (faults + 1, successes)
                } else {
                    (faults, successes + 1)
                }
            });
        HealthReport {
            tier: name.to_owned(),
            state: self.state(now),
            recent_successes: successes,
            recent_faults: faults,
            consecutive_faults: self.consecutive_faults(now),
            degraded_writes: self.degraded_writes,
            open_for: match self.circuit {
                Circuit::Open { since, .. } => Some(now.saturating_duration_since(since)),
                _ => None,
            },
            time_until_probe: self.time_until_probe(now),
        }
    }
}

/// Point-in-time view of one tier's health
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub tier: String,
    pub state: CircuitState,
    pub recent_successes: usize,
    pub recent_faults: usize,
    pub consecutive_faults: usize,
    /// Writes that succeeded elsewhere while this tier failed
    pub degraded_writes: u64,
    pub open_for: Option<Duration>,
    pub time_until_probe: Duration,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.state != CircuitState::Open
    }
}

struct TierHealth {
    name: String,
    breaker: Mutex<Breaker>,
}

impl TierHealth {
    fn record(&self, outcome: Outcome) {
        let transition = self.breaker.lock().record(Instant::now(), outcome);
        match transition {
            Some(CircuitState::Open) => {
                warn!("Circuit opened for tier {} after {:?}", self.name, outcome)
            }
            Some(CircuitState::Closed) => info!("Circuit closed for tier {}", self.name),
            _ => {}
        }
    }
}

/// Health and circuit state for every configured tier.
///
/// Owned by one engine instance; nothing here is process-global.
#[derive(Default)]
pub struct HealthTracker {
    tiers: HashMap<String, TierHealth>,
}

impl HealthTracker {
    pub fn new<'a>(tiers: impl IntoIterator<Item = (&'a str, HealthConfig)>) -> Self {
        let tiers = tiers
            .into_iter()
            .map(|(name, config)| {
                (
                    name.to_owned(),
                    TierHealth {
                        name: name.to_owned(),
                        breaker: Mutex::new(Breaker::new(config)),
                    },
                )
            })
            .collect();
        Self { tiers }
    }

    /// Record the outcome of an operation that was not admitted through [`HealthTracker::admit`].
    pub fn record_outcome(&self, tier: &str, outcome: Outcome) {
        match self.tiers.get(tier) {
            Some(health) => health.record(outcome),
            None => debug!("Ignoring outcome for unknown tier {}", tier),
        }
    }

    /// Whether the tier may currently be used. Unknown tiers count as healthy.
    pub fn is_healthy(&self, tier: &str) -> bool {
        self.tiers
            .get(tier)
            .is_none_or(|health| health.breaker.lock().is_available(Instant::now()))
    }

    /// How long until an open tier will be probed again (zero unless open).
    pub fn time_until_probe(&self, tier: &str) -> Duration {
        self.tiers
            .get(tier)
            .map(|health| health.breaker.lock().time_until_probe(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn state(&self, tier: &str) -> Option<CircuitState> {
        self.tiers
            .get(tier)
            .map(|health| health.breaker.lock().state(Instant::now()))
    }

    /// Ask permission to call a tier. Returns `None` while its circuit is open
    /// or while another caller holds the half-open probe.
    pub fn admit(&self, tier: &str) -> Option<Admission<'_>> {
        let Some(health) = self.tiers.get(tier) else {
            return Some(Admission {
                health: None,
                probe: false,
                settled: false,
            });
        };
        let admit = health.breaker.lock().try_admit(Instant::now())?;
        if admit == Admit::Probe {
            debug!("Admitting probe for half-open tier {}", tier);
        }
        Some(Admission {
            health: Some(health),
            probe: admit == Admit::Probe,
            settled: false,
        })
    }

    /// Note that a write succeeded elsewhere while this tier failed.
    pub fn note_degraded_write(&self, tier: &str) {
        if let Some(health) = self.tiers.get(tier) {
            health.breaker.lock().degraded_writes += 1;
        }
    }

    pub fn report(&self, tier: &str) -> Option<HealthReport> {
        self.tiers
            .get(tier)
            .map(|health| health.breaker.lock().report(&health.name, Instant::now()))
    }
}

/// Permission to perform one operation against a tier.
///
/// Dropping it without calling [`Admission::record`] (for example when the
/// caller's future is cancelled) frees the half-open probe slot.
pub struct Admission<'a> {
    health: Option<&'a TierHealth>,
    probe: bool,
    settled: bool,
}

impl Admission<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record(mut self, outcome: Outcome) {
        self.settled = true;
        if let Some(health) = self.health {
            health.record(outcome);
        }
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled
            && self.probe
            && let Some(health) = self.health
        {
            health.breaker.lock().release_probe();
        }
    }
}
