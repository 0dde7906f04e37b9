//! Connection quality: ping round-trips and observed chunk throughput.
//!
//! Samples are kept in a bounded window and exposed read-only; nothing in
//! the transfer path depends on them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::core::config::{PING_EXPIRY, QUALITY_WINDOW};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Measurement {
    Latency(Duration),
    Bandwidth { bytes_per_sec: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualitySample {
    pub peer_id: String,
    pub at: Instant,
    pub measurement: Measurement,
}

#[derive(Default)]
struct QualityState {
    next_ping: u64,
    pending: HashMap<u64, (String, Instant)>,
    samples: VecDeque<QualitySample>,
}

#[derive(Clone)]
pub struct QualityMonitor {
    state: Arc<Mutex<QualityState>>,
    window: usize,
}

impl Default for QualityMonitor {
    fn default() -> Self {
        Self::new(QUALITY_WINDOW)
    }
}

impl QualityMonitor {
    pub fn new(window: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QualityState::default())),
            window: window.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QualityState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Allocate a ping id for `peer_id` and start its clock.
    pub fn begin_ping(&self, peer_id: &str) -> u64 {
        let now = Instant::now();
        let mut state = self.lock();
        state
            .pending
            .retain(|_, (_, sent)| now.saturating_duration_since(*sent) < PING_EXPIRY);
        state.next_ping += 1;
        let id = state.next_ping;
        state.pending.insert(id, (peer_id.to_string(), now));
        id
    }

    /// Match a pong to its ping; unknown ids or mismatched peers are ignored.
    pub fn complete_ping(&self, peer_id: &str, id: u64) -> Option<QualitySample> {
        let now = Instant::now();
        let mut state = self.lock();
        match state.pending.get(&id) {
            Some((owner, _)) if owner == peer_id => {}
            _ => return None,
        }
        let (_, sent) = state.pending.remove(&id)?;
        let sample = QualitySample {
            peer_id: peer_id.to_string(),
            at: now,
            measurement: Measurement::Latency(now.saturating_duration_since(sent)),
        };
        self.push(&mut state, sample.clone());
        Some(sample)
    }

    pub fn record_bandwidth(&self, peer_id: &str, bytes_per_sec: f64) -> QualitySample {
        let sample = QualitySample {
            peer_id: peer_id.to_string(),
            at: Instant::now(),
            measurement: Measurement::Bandwidth { bytes_per_sec },
        };
        let mut state = self.lock();
        self.push(&mut state, sample.clone());
        sample
    }

    fn push(&self, state: &mut QualityState, sample: QualitySample) {
        if state.samples.len() == self.window {
            state.samples.pop_front();
        }
        state.samples.push_back(sample);
    }

    pub fn samples(&self) -> Vec<QualitySample> {
        self.lock().samples.iter().cloned().collect()
    }

    pub fn latest_latency(&self, peer_id: &str) -> Option<Duration> {
        self.lock()
            .samples
            .iter()
            .rev()
            .find_map(|s| match s.measurement {
                Measurement::Latency(d) if s.peer_id == peer_id => Some(d),
                _ => None,
            })
    }

    pub fn forget_peer(&self, peer_id: &str) {
        self.lock().pending.retain(|_, (owner, _)| owner != peer_id);
    }
}
