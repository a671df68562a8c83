//! Per-queue circuit breakers.
//!
//! ```text
//! CLOSED --(threshold failures)--> OPEN --(timeout elapsed)--> HALF_OPEN
//!   ^                                ^                             |
//!   |                                +---------(failure)-----------+
//!   +------------------------------(success)-----------------------+
//! ```
//!
//! Breakers are created lazily on the first failure of a queue. A queue with no
//! breaker behaves as `CLOSED` with zero failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, retries allowed.
    #[default]
    Closed,
    /// Too many recent failures; retries blocked until `next_attempt_at`.
    Open,
    /// Probation after the open timeout.
    HalfOpen,
}

/// Snapshot of one queue's breaker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerState {
    fn trip(&mut self, now: DateTime<Utc>, open_timeout: chrono::Duration) {
        self.state = CircuitState::Open;
        self.next_attempt_at = Some(now + open_timeout);
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.next_attempt_at = None;
    }

    fn timeout_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| now >= at)
    }
}

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures in `CLOSED` before the breaker opens.
    pub failure_threshold: u32,
    /// How long an open breaker blocks before probation.
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Outcome of a proactive recovery sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BreakerSweepReport {
    /// Queues moved from `OPEN` to `HALF_OPEN`.
    pub recovered: Vec<String>,
    /// Breakers still open after the sweep.
    pub still_open: usize,
}

/// All breakers, keyed by queue name.
///
/// Every read and transition happens under one lock, so the failure path and
/// the recovery sweep never interleave on the same breaker.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreakerState>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// May work on `queue` proceed right now?
    ///
    /// An open breaker whose timeout has elapsed moves to `HALF_OPEN` and lets
    /// this check through.
    pub fn allow(&self, queue: &str, now: DateTime<Utc>) -> bool {
        let mut breakers = self.lock();
        let Some(breaker) = breakers.get_mut(queue) else {
            return true;
        };

        match breaker.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open if breaker.timeout_elapsed(now) => {
                breaker.state = CircuitState::HalfOpen;
                info!(queue, "circuit breaker half-open (probation)");
                true
            }
            CircuitState::Open => false,
        }
    }

    /// Record a failure and return the resulting state.
    pub fn record_failure(&self, queue: &str, now: DateTime<Utc>) -> CircuitState {
        let open_timeout = self.open_timeout();
        let mut breakers = self.lock();
        let breaker = breakers.entry(queue.to_string()).or_default();

        breaker.failure_count = breaker.failure_count.saturating_add(1);
        breaker.last_failure_at = Some(now);

        match breaker.state {
            CircuitState::Closed if breaker.failure_count >= self.config.failure_threshold => {
                breaker.trip(now, open_timeout);
                warn!(
                    queue,
                    failures = breaker.failure_count,
                    "circuit breaker opened"
                );
            }
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                breaker.trip(now, open_timeout);
                warn!(queue, "circuit breaker re-opened after probation failure");
            }
            // Already open: keep the current deadline.
            CircuitState::Open => {}
        }

        breaker.state
    }

    /// Record a success. Returns the resulting state, or `None` when the queue
    /// has no breaker yet.
    pub fn record_success(&self, queue: &str) -> Option<CircuitState> {
        let mut breakers = self.lock();
        let breaker = breakers.get_mut(queue)?;

        match breaker.state {
            CircuitState::HalfOpen => {
                breaker.close();
                info!(queue, "circuit breaker closed (service recovered)");
            }
            CircuitState::Closed => breaker.failure_count = 0,
            CircuitState::Open => {}
        }

        Some(breaker.state)
    }

    /// Move every open breaker whose timeout has elapsed to `HALF_OPEN`.
    pub fn sweep(&self, now: DateTime<Utc>) -> BreakerSweepReport {
        let mut breakers = self.lock();
        let mut report = BreakerSweepReport::default();

        for (queue, breaker) in breakers.iter_mut() {
            if breaker.state != CircuitState::Open {
                continue;
            }
            if breaker.timeout_elapsed(now) {
                breaker.state = CircuitState::HalfOpen;
                info!(queue = %queue, "circuit breaker half-open (sweep)");
                report.recovered.push(queue.clone());
            } else {
                report.still_open += 1;
            }
        }

        report.recovered.sort();
        report
    }

    /// Snapshot of one breaker.
    pub fn state_of(&self, queue: &str) -> Option<CircuitBreakerState> {
        self.lock().get(queue).cloned()
    }

    /// Snapshot of every breaker, ordered by queue name.
    pub fn status(&self) -> BTreeMap<String, CircuitBreakerState> {
        self.lock()
            .iter()
            .map(|(q, s)| (q.clone(), s.clone()))
            .collect()
    }

    /// Operator escape hatch: force a breaker closed.
    ///
    /// Returns `false` when the queue has no breaker.
    pub fn reset(&self, queue: &str) -> bool {
        let mut breakers = self.lock();
        match breakers.get_mut(queue) {
            Some(breaker) => {
                breaker.close();
                breaker.last_failure_at = None;
                info!(queue, "circuit breaker manually reset");
                true
            }
            None => false,
        }
    }

    fn open_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.open_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(36_500))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CircuitBreakerState>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
