//! Reconnect spacing.
//!
//! `fixed` waits the same delay before every attempt. `exponential` doubles
//! from the base delay up to the ceiling and starts over after a session
//! registers successfully. Neither ever gives up.

use std::time::Duration;
use tether_types::config::{ReconnectConfig, ReconnectStrategy};

/// Stateful delay generator for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    strategy: ReconnectStrategy,
    base: Duration,
    ceiling: Duration,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(strategy: ReconnectStrategy, base: Duration, ceiling: Duration) -> Self {
        Self {
            strategy,
            base,
            ceiling: ceiling.max(base),
            attempt: 0,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            config.strategy,
            Duration::from_millis(config.delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.strategy {
            ReconnectStrategy::Fixed => self.base,
            ReconnectStrategy::Exponential => {
                let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
                self.base.saturating_mul(factor).min(self.ceiling)
            }
        };
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Forget past failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
