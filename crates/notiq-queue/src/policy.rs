//! Bounded exponential backoff for failed deliveries.
//!
//! Attempt delays double from the base up to the cap, with jitter so a
//! burst of failures does not retry in lockstep. Past the ceiling the queue
//! dead-letters instead of retrying forever.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy applied by the queue when an attempt fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum delivery attempts before dead-lettering.
    pub max_attempts: u32,

    /// Base delay for the backoff curve.
    pub base_delay: Duration,

    /// Cap on the delay between attempts.
    pub max_delay: Duration,

    /// Jitter factor (0.0 to 1.0) randomizing each delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(512),
            jitter_factor: 0.25,
        }
    }
}

/// Decision for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry {
        /// How long to wait before the event becomes due again.
        delay: Duration,
    },
    /// The ceiling is reached; dead-letter the event.
    GiveUp,
}

impl RetryPolicy {
    /// Decides what to do after `attempt_count` completed attempts.
    pub fn decide(&self, attempt_count: u32) -> RetryDecision {
        if attempt_count >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        RetryDecision::Retry { delay: self.delay_for(attempt_count) }
    }

    /// Backoff delay after `attempt_count` completed attempts.
    fn delay_for(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let base = self.base_delay.saturating_mul(multiplier);
        let capped = std::cmp::min(base, self.max_delay);

        std::cmp::min(apply_jitter(capped, self.jitter_factor), self.max_delay)
    }
}

/// Randomizes a delay by ±`jitter_factor` to avoid thundering herds.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let mut rng = rand::rng();
    let range = duration.as_secs_f64() * clamped;
    let offset = rng.random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy { jitter_factor: 0.0, ..Default::default() }
    }

    #[test]
    fn delays_double_per_attempt() {
        let policy = no_jitter();
        let delays: Vec<_> = (1..=5).map(|n| policy.delay_for(n)).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[2], Duration::from_secs(4));
        assert_eq!(delays[3], Duration::from_secs(8));
        assert_eq!(delays[4], Duration::from_secs(16));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
            max_attempts: 30,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(25), Duration::from_secs(60));
    }

    #[test]
    fn ceiling_gives_up() {
        let policy = no_jitter();
        assert_eq!(policy.decide(8), RetryDecision::GiveUp);
        assert_eq!(policy.decide(12), RetryDecision::GiveUp);
        assert!(matches!(policy.decide(7), RetryDecision::Retry { .. }));
    }

    #[test]
    fn jitter_varies_but_stays_in_band() {
        let base = Duration::from_secs(10);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            let jittered = apply_jitter(base, 0.5);
            assert!(jittered >= Duration::from_secs(5), "too small: {jittered:?}");
            assert!(jittered <= Duration::from_secs(15), "too large: {jittered:?}");
            seen.insert(jittered.as_millis());
        }
        assert!(seen.len() > 1, "jitter should create variation");
    }

    proptest! {
        #[test]
        fn decide_is_monotone_in_attempts(attempts in 0u32..64) {
            let policy = no_jitter();
            let gave_up = matches!(policy.decide(attempts), RetryDecision::GiveUp);
            let gave_up_next = matches!(policy.decide(attempts + 1), RetryDecision::GiveUp);
            // Once the policy gives up it never starts retrying again.
            prop_assert!(!gave_up || gave_up_next);
        }
    }
}
