//! Retry strategy table and backoff computation.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use angelhub_core::{CoreError, CoreResult};

/// Well-known queue names used by the marketplace workers.
pub mod queues {
    pub const EMAIL: &str = "email";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const PAYMENTS: &str = "payments";
    pub const INVESTMENT_PROCESSING: &str = "investment-processing";
    pub const DOCUMENT_PROCESSING: &str = "document-processing";
    pub const PORTFOLIO_PERFORMANCE: &str = "portfolio-performance";
    pub const ANALYTICS: &str = "analytics";
}

/// Backoff shape between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay every time.
    Fixed,
    /// initial * attempt * multiplier (multiplier defaults to 1).
    Linear,
    /// initial * multiplier^(attempt - 1) (multiplier defaults to 2).
    #[default]
    Exponential,
    /// fib(attempt) * initial, with fib(0) = fib(1) = 1.
    Fibonacci,
}

/// Named retry policy for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Total attempts allowed (>= 1).
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub initial_delay: Duration,
    /// Cap applied before jitter (>= `initial_delay`).
    pub max_delay: Duration,
    pub multiplier: Option<f64>,
    /// Scale each delay by a uniform factor in [0.5, 1.0).
    pub jitter: bool,
}

impl Default for RetryStrategy {
    /// 3 attempts, exponential from 2s capped at 300s, x2, jittered.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            multiplier: Some(2.0),
            jitter: true,
        }
    }
}

impl RetryStrategy {
    pub fn new(max_attempts: u32, backoff: BackoffKind, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            initial_delay,
            max_delay,
            multiplier: None,
            jitter: false,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Check the strategy invariants.
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_attempts < 1 {
            return Err(CoreError::validation("max_attempts must be at least 1"));
        }
        if self.initial_delay > self.max_delay {
            return Err(CoreError::validation(format!(
                "initial_delay ({:?}) must not exceed max_delay ({:?})",
                self.initial_delay, self.max_delay
            )));
        }
        if let Some(m) = self.multiplier {
            if !(m.is_finite() && m > 0.0) {
                return Err(CoreError::validation("multiplier must be a finite positive number"));
            }
        }
        Ok(())
    }

    /// Whether a job that has already made `attempts_made` attempts may run again.
    pub fn allows_another_attempt(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Apply a partial update, returning the new strategy (unvalidated).
    pub fn patched(&self, patch: &RetryStrategyPatch) -> Self {
        Self {
            max_attempts: patch.max_attempts.unwrap_or(self.max_attempts),
            backoff: patch.backoff.unwrap_or(self.backoff),
            initial_delay: patch.initial_delay.unwrap_or(self.initial_delay),
            max_delay: patch.max_delay.unwrap_or(self.max_delay),
            multiplier: patch.multiplier.or(self.multiplier),
            jitter: patch.jitter.unwrap_or(self.jitter),
        }
    }
}

/// Operator-supplied partial update of a [`RetryStrategy`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategyPatch {
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffKind>,
    pub initial_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    pub multiplier: Option<f64>,
    pub jitter: Option<bool>,
}

/// Source of randomness for backoff jitter.
pub trait JitterSource: Send + Sync + std::fmt::Debug {
    /// Uniform sample in [0, 1).
    fn sample(&self) -> f64;
}

/// Jitter drawn from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..1.0)
    }
}

/// Constant jitter sample, for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        // Keep the sample inside [0, 1) whatever the caller passed.
        if self.0.is_finite() {
            self.0.clamp(0.0, 1.0 - f64::EPSILON)
        } else {
            0.0
        }
    }
}

/// Delay before retry number `attempt` (1 = first retry).
///
/// The formula result is capped at `max_delay`, then jittered when the
/// strategy asks for it, then floored to whole milliseconds.
pub fn compute_delay(strategy: &RetryStrategy, attempt: u32, jitter: &dyn JitterSource) -> Duration {
    let attempt = attempt.max(1);
    let initial_ms = strategy.initial_delay.as_millis() as f64;
    let max_ms = strategy.max_delay.as_millis() as f64;

    let raw_ms = match strategy.backoff {
        BackoffKind::Fixed => initial_ms,
        BackoffKind::Linear => initial_ms * attempt as f64 * strategy.multiplier.unwrap_or(1.0),
        BackoffKind::Exponential => {
            let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
            initial_ms * strategy.multiplier.unwrap_or(2.0).powi(exp)
        }
        BackoffKind::Fibonacci => fibonacci(attempt) * initial_ms,
    };

    // NaN can only come from a bad multiplier; treat it as "as long as allowed".
    let mut delay_ms = if raw_ms.is_nan() { max_ms } else { raw_ms.min(max_ms) };

    if strategy.jitter {
        delay_ms *= 0.5 + 0.5 * jitter.sample();
    }

    Duration::from_millis(delay_ms.max(0.0).floor() as u64)
}

/// fib(0) = fib(1) = 1. Computed in f64 so large attempts saturate to infinity
/// (and then get capped) instead of overflowing.
fn fibonacci(n: u32) -> f64 {
    let (mut a, mut b) = (1.0_f64, 1.0_f64);
    for _ in 1..n {
        let next = a + b;
        a = b;
        b = next;
        if b.is_infinite() {
            break;
        }
    }
    b
}

/// Per-queue strategy table.
///
/// Seeded with marketplace defaults at construction; operators can patch
/// entries at runtime. Unknown queues fall back to the default strategy.
#[derive(Debug)]
pub struct RetryStrategyTable {
    fallback: RetryStrategy,
    strategies: RwLock<HashMap<String, RetryStrategy>>,
}

impl RetryStrategyTable {
    /// Empty table: every queue uses `fallback`.
    pub fn new(fallback: RetryStrategy) -> Self {
        Self {
            fallback,
            strategies: RwLock::new(HashMap::new()),
        }
    }

    /// Table seeded with the marketplace queue defaults.
    pub fn with_defaults() -> Self {
        let table = Self::new(RetryStrategy::default());
        {
            let mut map = table.write();
            for (queue, strategy) in default_strategies() {
                map.insert(queue.to_string(), strategy);
            }
        }
        table
    }

    /// Strategy for `queue`, falling back to the default.
    pub fn strategy_for(&self, queue: &str) -> RetryStrategy {
        self.get(queue).unwrap_or_else(|| self.fallback.clone())
    }

    /// Explicitly configured strategy for `queue`, if any.
    pub fn get(&self, queue: &str) -> Option<RetryStrategy> {
        self.read().get(queue).cloned()
    }

    /// Patch the strategy for `queue` (creating it from the fallback if absent).
    ///
    /// Invalid results are rejected and leave the table unchanged.
    pub fn update(&self, queue: &str, patch: &RetryStrategyPatch) -> CoreResult<RetryStrategy> {
        let mut map = self.write();
        let current = map.get(queue).unwrap_or(&self.fallback);
        let updated = current.patched(patch);
        updated.validate()?;
        map.insert(queue.to_string(), updated.clone());
        Ok(updated)
    }

    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<_> = self.read().keys().cloned().collect();
        queues.sort();
        queues
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, RetryStrategy>> {
        self.strategies.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, RetryStrategy>> {
        self.strategies.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for RetryStrategyTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn default_strategies() -> Vec<(&'static str, RetryStrategy)> {
    vec![
        (
            queues::EMAIL,
            RetryStrategy::new(5, BackoffKind::Exponential, Duration::from_secs(1), Duration::from_secs(60))
                .with_multiplier(2.0)
                .with_jitter(true),
        ),
        (
            queues::NOTIFICATIONS,
            RetryStrategy::new(3, BackoffKind::Exponential, Duration::from_secs(2), Duration::from_secs(120))
                .with_multiplier(2.0)
                .with_jitter(true),
        ),
        (
            queues::PAYMENTS,
            RetryStrategy::new(5, BackoffKind::Exponential, Duration::from_secs(5), Duration::from_secs(600))
                .with_multiplier(3.0),
        ),
        (
            queues::INVESTMENT_PROCESSING,
            RetryStrategy::new(3, BackoffKind::Linear, Duration::from_secs(10), Duration::from_secs(300)),
        ),
        (
            queues::DOCUMENT_PROCESSING,
            RetryStrategy::new(4, BackoffKind::Fibonacci, Duration::from_secs(3), Duration::from_secs(180))
                .with_jitter(true),
        ),
        (
            queues::PORTFOLIO_PERFORMANCE,
            RetryStrategy::new(3, BackoffKind::Linear, Duration::from_secs(15), Duration::from_secs(300)),
        ),
        (
            queues::ANALYTICS,
            RetryStrategy::new(2, BackoffKind::Fixed, Duration::from_secs(30), Duration::from_secs(30)),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter(backoff: BackoffKind, initial_ms: u64, max_ms: u64) -> RetryStrategy {
        RetryStrategy::new(
            10,
            backoff,
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
        )
    }

    const NONE: FixedJitter = FixedJitter(0.0);

    #[test]
    fn exponential_backoff_doubles_by_default() {
        let s = no_jitter(BackoffKind::Exponential, 100, 10_000);
        assert_eq!(compute_delay(&s, 1, &NONE), Duration::from_millis(100));
        assert_eq!(compute_delay(&s, 2, &NONE), Duration::from_millis(200));
        assert_eq!(compute_delay(&s, 3, &NONE), Duration::from_millis(400));
        assert_eq!(compute_delay(&s, 4, &NONE), Duration::from_millis(800));
    }

    #[test]
    fn linear_backoff_uses_multiplier() {
        let s = no_jitter(BackoffKind::Linear, 100, 10_000);
        assert_eq!(compute_delay(&s, 3, &NONE), Duration::from_millis(300));

        let s = s.with_multiplier(1.5);
        assert_eq!(compute_delay(&s, 2, &NONE), Duration::from_millis(300));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let s = no_jitter(BackoffKind::Fixed, 500, 500);
        for attempt in 1..5 {
            assert_eq!(compute_delay(&s, attempt, &NONE), Duration::from_millis(500));
        }
    }

    #[test]
    fn fibonacci_backoff_follows_sequence() {
        let s = no_jitter(BackoffKind::Fibonacci, 1_000, 1_000_000);
        let got: Vec<u64> = (1..=6)
            .map(|a| compute_delay(&s, a, &NONE).as_millis() as u64)
            .collect();
        assert_eq!(got, vec![1_000, 2_000, 3_000, 5_000, 8_000, 13_000]);
    }

    #[test]
    fn delay_is_capped() {
        let s = no_jitter(BackoffKind::Exponential, 1_000, 5_000);
        assert_eq!(compute_delay(&s, 10, &NONE), Duration::from_millis(5_000));
        assert_eq!(compute_delay(&s, u32::MAX, &NONE), Duration::from_millis(5_000));
    }

    #[test]
    fn jitter_scales_into_lower_half() {
        let s = no_jitter(BackoffKind::Fixed, 1_000, 1_000).with_jitter(true);
        assert_eq!(compute_delay(&s, 1, &FixedJitter(0.0)), Duration::from_millis(500));
        assert_eq!(compute_delay(&s, 1, &FixedJitter(0.5)), Duration::from_millis(750));
        assert!(compute_delay(&s, 1, &FixedJitter(1.0)) < Duration::from_millis(1_000));
    }

    #[test]
    fn attempt_zero_is_treated_as_first_retry() {
        let s = no_jitter(BackoffKind::Linear, 100, 1_000);
        assert_eq!(compute_delay(&s, 0, &NONE), compute_delay(&s, 1, &NONE));
    }

    #[test]
    fn default_strategy_matches_documented_values() {
        let s = RetryStrategy::default();
        assert_eq!(s.max_attempts, 3);
        assert_eq!(s.backoff, BackoffKind::Exponential);
        assert_eq!(s.initial_delay, Duration::from_secs(2));
        assert_eq!(s.max_delay, Duration::from_secs(300));
        assert_eq!(s.multiplier, Some(2.0));
        assert!(s.jitter);
    }

    #[test]
    fn unknown_queue_falls_back_to_default() {
        let table = RetryStrategyTable::with_defaults();
        assert!(table.get("no-such-queue").is_none());
        assert_eq!(table.strategy_for("no-such-queue"), RetryStrategy::default());
        assert_eq!(table.strategy_for(queues::EMAIL).max_attempts, 5);
    }

    #[test]
    fn update_rejects_invalid_patch_and_keeps_old_value() {
        let table = RetryStrategyTable::with_defaults();
        let before = table.strategy_for(queues::PAYMENTS);

        let err = table
            .update(
                queues::PAYMENTS,
                &RetryStrategyPatch {
                    max_attempts: Some(0),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let err = table
            .update(
                queues::PAYMENTS,
                &RetryStrategyPatch {
                    initial_delay: Some(Duration::from_secs(3_600)),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        assert_eq!(table.strategy_for(queues::PAYMENTS), before);
    }

    #[test]
    fn update_creates_entry_for_new_queue() {
        let table = RetryStrategyTable::new(RetryStrategy::default());
        let updated = table
            .update(
                "kyc",
                &RetryStrategyPatch {
                    max_attempts: Some(7),
                    backoff: Some(BackoffKind::Fibonacci),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.max_attempts, 7);
        assert_eq!(updated.backoff, BackoffKind::Fibonacci);
        assert_eq!(updated.initial_delay, RetryStrategy::default().initial_delay);
        assert_eq!(table.get("kyc"), Some(updated));
        assert_eq!(table.queues(), vec!["kyc".to_string()]);
    }

    #[test]
    fn seeded_defaults_are_valid() {
        for (queue, strategy) in default_strategies() {
            assert!(strategy.validate().is_ok(), "invalid default for {queue}");
        }
    }

    fn growing_backoff() -> impl Strategy<Value = BackoffKind> {
        prop_oneof![Just(BackoffKind::Exponential), Just(BackoffKind::Linear)]
    }

    fn any_backoff() -> impl Strategy<Value = BackoffKind> {
        prop_oneof![
            Just(BackoffKind::Fixed),
            Just(BackoffKind::Linear),
            Just(BackoffKind::Exponential),
            Just(BackoffKind::Fibonacci),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Without jitter, growing strategies never shrink between attempts.
        #[test]
        fn backoff_is_monotonic_without_jitter(
            backoff in growing_backoff(),
            initial_ms in 1u64..10_000,
            extra_ms in 0u64..1_000_000,
            multiplier in 1.0f64..4.0,
            attempt in 1u32..64,
        ) {
            let s = RetryStrategy::new(10, backoff, Duration::from_millis(initial_ms), Duration::from_millis(initial_ms + extra_ms))
                .with_multiplier(multiplier);
            prop_assert!(compute_delay(&s, attempt + 1, &NONE) >= compute_delay(&s, attempt, &NONE));
        }

        /// No strategy ever exceeds its cap, jittered or not.
        #[test]
        fn backoff_never_exceeds_cap(
            backoff in any_backoff(),
            initial_ms in 0u64..10_000,
            extra_ms in 0u64..1_000_000,
            multiplier in proptest::option::of(0.1f64..10.0),
            jitter in any::<bool>(),
            sample in 0.0f64..1.0,
            attempt in 0u32..200,
        ) {
            let mut s = RetryStrategy::new(10, backoff, Duration::from_millis(initial_ms), Duration::from_millis(initial_ms + extra_ms))
                .with_jitter(jitter);
            s.multiplier = multiplier;
            prop_assert!(compute_delay(&s, attempt, &FixedJitter(sample)) <= s.max_delay);
        }
    }
}
