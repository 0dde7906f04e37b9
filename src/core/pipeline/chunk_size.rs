//! Congestion-adaptive chunk sizing.
//!
//! Multiplicative decrease when the channel backs up or a send is slow,
//! additive increase when it drains quickly, always within `[min, max]`.

use std::time::Duration;

use crate::core::config::ChunkSettings;

#[derive(Debug, Clone)]
pub struct ChunkSizer {
    current: usize,
    min: usize,
    max: usize,
    step: usize,
    backlog_high: usize,
    backlog_low: usize,
    slow: Duration,
    fast: Duration,
}

impl ChunkSizer {
    pub fn new(settings: &ChunkSettings) -> Self {
        let min = settings.min.max(1);
        let max = settings.max.max(min);
        Self {
            current: settings.initial.clamp(min, max),
            min,
            max,
            step: settings.step,
            backlog_high: settings.backlog_high,
            backlog_low: settings.backlog_low,
            slow: settings.slow_send(),
            fast: settings.fast_send(),
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Feed one send measurement; returns the size for the next chunk.
    pub fn observe(&mut self, backlog: usize, send_duration: Duration) -> usize {
        if backlog > self.backlog_high || send_duration > self.slow {
            self.current = (self.current / 2).max(self.min);
        } else if backlog < self.backlog_low && send_duration < self.fast {
            self.current = self.current.saturating_add(self.step).min(self.max);
        }
        self.current
    }
}
