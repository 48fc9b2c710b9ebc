//! Jittered exponential backoff

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::instance::RestartPolicy;

/// Lower bound of the jitter factor
pub const JITTER_LOW: f64 = 0.75;
/// Upper bound of the jitter factor
pub const JITTER_HIGH: f64 = 1.25;

/// Computes `min(base * multiplier^attempt * jitter, max_delay)`
///
/// Jitter is uniform in `[JITTER_LOW, JITTER_HIGH]`. Successive calls with
/// increasing attempts never return a shorter delay than the previous one,
/// which keeps the sequence non-decreasing while every value still lies
/// inside its own jitter window.
#[derive(Debug)]
pub struct BackoffCalculator {
    base: Duration,
    multiplier: f64,
    max_delay: Duration,
    attempt: u32,
    last: Duration,
    rng: StdRng,
}

impl BackoffCalculator {
    pub fn new(base: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self::with_rng(base, multiplier, max_delay, StdRng::from_entropy())
    }

    /// Deterministic jitter for reproducible delays
    pub fn with_seed(base: Duration, multiplier: f64, max_delay: Duration, seed: u64) -> Self {
        Self::with_rng(base, multiplier, max_delay, StdRng::seed_from_u64(seed))
    }

    fn with_rng(base: Duration, multiplier: f64, max_delay: Duration, rng: StdRng) -> Self {
        Self {
            base,
            multiplier: if multiplier.is_finite() {
                multiplier.max(1.0)
            } else {
                1.0
            },
            max_delay: max_delay.max(base),
            attempt: 0,
            last: Duration::ZERO,
            rng,
        }
    }

    pub fn from_policy(policy: &RestartPolicy) -> Self {
        Self::new(
            Duration::from_millis(policy.initial_delay_ms),
            policy.multiplier,
            Duration::from_millis(policy.max_delay_ms),
        )
    }

    /// Un-jittered delay for `attempt`, capped at `max_delay`
    pub fn nominal(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.base.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Jittered delay for `attempt`
    pub fn delay(&mut self, attempt: u32) -> Duration {
        let jitter = self.rng.gen_range(JITTER_LOW..=JITTER_HIGH);
        let nominal = self.base.as_secs_f64() * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let jittered = nominal * jitter;
        let mut delay = if !jittered.is_finite() || jittered >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(jittered)
        };

        if attempt > 0 && attempt >= self.attempt {
            delay = delay.max(self.last);
        }
        self.attempt = attempt;
        self.last = delay;
        delay
    }

    /// Delay for the next attempt, advancing the internal counter
    pub fn next_delay(&mut self) -> Duration {
        let attempt = if self.last.is_zero() { 0 } else { self.attempt + 1 };
        self.delay(attempt)
    }

    /// Attempts made since the last reset
    pub fn attempts(&self) -> u32 {
        if self.last.is_zero() {
            0
        } else {
            self.attempt + 1
        }
    }

    /// Back to `base` after a success
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }
}
