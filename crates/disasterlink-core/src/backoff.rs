//! Exponential backoff with full jitter for failed drains.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(with = "millis")]
    pub base: Duration,
    pub multiplier: u32,
    #[serde(with = "millis")]
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2,
            cap: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// `min(cap, base * multiplier^failures)`
    pub fn ceiling(&self, failures: u32) -> Duration {
        let mut ceiling = self.base.min(self.cap);
        for _ in 0..failures {
            if ceiling >= self.cap {
                break;
            }
            ceiling = ceiling
                .checked_mul(self.multiplier.max(1))
                .map_or(self.cap, |next| next.min(self.cap));
        }
        ceiling
    }
}

/// One scheduled retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRetry {
    /// Consecutive failures including this one
    pub attempt: u32,
    /// Upper bound the delay was drawn from
    pub ceiling: Duration,
    /// Time to wait, uniform in `[0, ceiling]`
    pub delay: Duration,
}

/// Tracks consecutive failed drains
#[derive(Debug)]
pub struct BackoffController {
    policy: BackoffPolicy,
    failures: u32,
    rng: StdRng,
}

impl BackoffController {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic jitter for tests
    pub fn with_seed(policy: BackoffPolicy, seed: u64) -> Self {
        Self {
            policy,
            failures: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Schedule the retry after another failed drain
    #[allow(clippy::cast_possible_truncation)]
    pub fn next_delay(&mut self) -> ScheduledRetry {
        let ceiling = self.policy.ceiling(self.failures);
        self.failures = self.failures.saturating_add(1);

        let ceiling_ms = ceiling.as_millis() as u64;
        let delay = Duration::from_millis(self.rng.gen_range(0..=ceiling_ms));
        ScheduledRetry {
            attempt: self.failures,
            ceiling,
            delay,
        }
    }

    /// Back to the base delay after a fully successful drain
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub const fn failures(&self) -> u32 {
        self.failures
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceilings_double_up_to_cap() {
        let policy = BackoffPolicy::default();
        let ceilings: Vec<u64> = (0..9).map(|n| policy.ceiling(n).as_secs()).collect();
        assert_eq!(ceilings, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
        assert_eq!(policy.ceiling(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn consecutive_failures_are_monotone_and_bounded() {
        let mut backoff = BackoffController::with_seed(BackoffPolicy::default(), 7);
        let mut last_ceiling = Duration::ZERO;
        for attempt in 1..=40 {
            let retry = backoff.next_delay();
            assert_eq!(retry.attempt, attempt);
            assert!(retry.ceiling >= last_ceiling);
            assert!(retry.ceiling <= Duration::from_secs(60));
            assert!(retry.delay <= retry.ceiling);
            last_ceiling = retry.ceiling;
        }
        assert_eq!(last_ceiling, Duration::from_secs(60));
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = BackoffController::with_seed(BackoffPolicy::default(), 1);
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay().ceiling, Duration::from_secs(1));
    }

    #[test]
    fn jitter_spreads_delays() {
        let mut backoff = BackoffController::with_seed(BackoffPolicy::default(), 42);
        for _ in 0..6 {
            backoff.next_delay();
        }
        let delays: std::collections::HashSet<_> =
            (0..20).map(|_| backoff.next_delay().delay).collect();
        assert!(delays.len() > 1);
    }

    #[test]
    fn same_seed_same_schedule() {
        let mut a = BackoffController::with_seed(BackoffPolicy::default(), 9);
        let mut b = BackoffController::with_seed(BackoffPolicy::default(), 9);
        for _ in 0..10 {
            assert_eq!(a.next_delay(), b.next_delay());
        }
    }
}
