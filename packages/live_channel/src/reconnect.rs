//! Capped exponential backoff and the single-timer reconnect scheduler.

use std::future;
use std::pin::Pin;
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, Sleep};

/// Fraction of the exponential delay used as the upper bound for jitter.
pub const JITTER_RATIO: f64 = 0.3;

/// `min(base * 2^(n-1) + jitter, max)` with jitter in `[0, 0.3 * base * 2^(n-1))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// The exponential component for attempt `n` (1-based), capped at `max`.
    pub fn exponential(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay for attempt `n` using the thread-local RNG for jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponential = self.exponential(attempt);
        let bound = exponential.as_secs_f64() * JITTER_RATIO;
        let jitter = if bound > 0.0 {
            Duration::from_secs_f64(rng.random_range(0.0..bound))
        } else {
            Duration::ZERO
        };
        exponential.saturating_add(jitter).min(self.max)
    }
}

/// Result of asking the scheduler for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A timer is armed; `attempt` is 1-based.
    Scheduled { attempt: u32, delay: Duration },
    /// The attempt budget is spent; nothing is armed.
    Exhausted { attempts: u32 },
}

/// Owns the reconnect counter and at most one pending timer.
pub struct ReconnectScheduler {
    policy: BackoffPolicy,
    max_attempts: u32,
    attempts: u32,
    pending: Option<Pin<Box<Sleep>>>,
}

impl ReconnectScheduler {
    pub fn new(policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            policy,
            max_attempts,
            attempts: 0,
            pending: None,
        }
    }

    /// Arm the timer for the next attempt. Any pending timer is cleared first.
    pub fn schedule(&mut self) -> ScheduleOutcome {
        self.cancel();
        if self.attempts >= self.max_attempts {
            return ScheduleOutcome::Exhausted {
                attempts: self.attempts,
            };
        }
        self.attempts += 1;
        let delay = self.policy.delay(self.attempts);
        self.pending = Some(Box::pin(tokio::time::sleep_until(Instant::now() + delay)));
        ScheduleOutcome::Scheduled {
            attempt: self.attempts,
            delay,
        }
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    /// Called on every successful open.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolves when the armed timer elapses; pends forever when disarmed.
    /// Cancel-safe: dropping the future leaves the timer armed.
    pub async fn fired(&mut self) {
        match self.pending.as_mut() {
            Some(sleep) => {
                sleep.await;
                self.pending = None;
            }
            None => future::pending().await,
        }
    }
}
