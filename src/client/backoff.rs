//! Reconnect backoff
//!
//! Exponential delay per attempt, capped, with random jitter so that many
//! clients dropped by the same server restart do not reconnect in lockstep.

use std::time::Duration;

use rand::Rng;

use super::config::ClientConfig;

/// Reconnect delay policy
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter: f64, max_attempts: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.reconnect_interval,
            config.max_reconnect_delay,
            config.reconnect_jitter,
            config.max_reconnect_attempts,
        )
    }

    /// Delay before attempt `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial
            .saturating_mul(1u32 << exponent)
            .min(self.max)
    }

    /// Delay before attempt `attempt`, with jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter == 0.0 {
            return base;
        }

        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor)
    }

    /// Whether `attempts` consecutive failures exhaust the policy
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}
