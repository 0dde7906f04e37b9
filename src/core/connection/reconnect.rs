//! Exponential reconnect schedule for room-level recovery.

use std::time::Duration;

use crate::core::config::{
    ReconnectSettings, RECONNECT_BASE_DELAY, RECONNECT_MAX_ATTEMPTS, RECONNECT_MAX_DELAY,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: RECONNECT_BASE_DELAY,
            max_delay: RECONNECT_MAX_DELAY,
            max_attempts: RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(s: &ReconnectSettings) -> Self {
        Self {
            base_delay: s.base_delay(),
            max_delay: s.max_delay(),
            max_attempts: s.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the 1-based `attempt`: `min(base · 2^(attempt-1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Every `(attempt, delay)` pair of a full reconnect cycle.
    pub fn schedule(&self) -> impl Iterator<Item = (u32, Duration)> + '_ {
        (1..=self.max_attempts).map(move |n| (n, self.delay_for(n)))
    }
}
