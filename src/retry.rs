//! Retry policies shared by the chunk transport and the assembly verifier.
//!
//! A policy is a plain value: how many attempts are allowed and how long to
//! wait after a failed attempt. Tests swap in [`RetryPolicy::immediate`] so
//! nothing sleeps.

use std::time::Duration;

/// Delay curve applied between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// `step * attempt`, where `attempt` is the 1-based number of the attempt
    /// that just failed.
    Linear { step: Duration },
    /// `base * 2^attempt` clamped to `max`, with `attempt` 0-based.
    Exponential { base: Duration, max: Duration },
    /// No waiting at all.
    None,
}

/// Maximum attempts plus the backoff between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Client chunk transport default: 3 attempts, 1s, 2s between them.
    pub fn chunk_transport() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear {
                step: Duration::from_millis(1000),
            },
        }
    }

    /// Listing verifier default: 10 attempts, `min(1000 * 2^n, 10000)` ms.
    pub fn listing_consistency() -> Self {
        Self::listing_consistency_with(10)
    }

    pub fn listing_consistency_with(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(1000),
                max: Duration::from_millis(10_000),
            },
        }
    }

    /// Same attempt budget, zero delay.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::None,
        }
    }

    /// Delay to wait after the 0-based `attempt` failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Linear { step } => step.saturating_mul(attempt.saturating_add(1)),
            Backoff::Exponential { base, max } => {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(*max)
            }
            Backoff::None => Duration::ZERO,
        }
    }

    /// True when another attempt is allowed after `attempts_made`.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Sleep for the delay after `attempt`, skipping the timer when it is zero.
    pub async fn wait(&self, attempt: u32) {
        let delay = self.delay_after(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
