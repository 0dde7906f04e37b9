//! Progress accounting: smoothed throughput / ETA and the multi-peer
//! delivery watermark.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::core::config::SPEED_SMOOTHING;

/// A progress reading emitted at most once per interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    pub bytes: u64,
    pub speed_bps: f64,
    pub eta: Option<Duration>,
}

/// Exponentially smoothed throughput over periodic samples.
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    total: u64,
    interval: Duration,
    alpha: f64,
    speed_bps: Option<f64>,
    last_at: Instant,
    last_bytes: u64,
}

impl SpeedMeter {
    pub fn new(total: u64, interval: Duration) -> Self {
        Self {
            total,
            interval,
            alpha: SPEED_SMOOTHING,
            speed_bps: None,
            last_at: Instant::now(),
            last_bytes: 0,
        }
    }

    /// Restart measurement from `bytes` without discarding the smoothed speed.
    pub fn rebase(&mut self, bytes: u64) {
        self.last_at = Instant::now();
        self.last_bytes = bytes;
    }

    /// Record `bytes` transferred so far. Returns a reading if the interval
    /// has elapsed, or always when `force` is set.
    pub fn sample(&mut self, bytes: u64, force: bool) -> Option<Rate> {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_at);
        if !force && elapsed < self.interval {
            return None;
        }

        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            let instant = bytes.saturating_sub(self.last_bytes) as f64 / secs;
            self.speed_bps = Some(match self.speed_bps {
                Some(prev) => self.alpha * instant + (1.0 - self.alpha) * prev,
                None => instant,
            });
            self.last_at = now;
            self.last_bytes = bytes;
        }

        Some(Rate {
            bytes,
            speed_bps: self.speed(),
            eta: self.eta(bytes),
        })
    }

    pub fn speed(&self) -> f64 {
        self.speed_bps.unwrap_or(0.0)
    }

    /// `remaining / speed`, or `None` while the speed is unknown.
    pub fn eta(&self, bytes: u64) -> Option<Duration> {
        let remaining = self.total.saturating_sub(bytes);
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        match self.speed_bps {
            Some(speed) if speed > 0.0 => Some(Duration::from_secs_f64(remaining as f64 / speed)),
            _ => None,
        }
    }
}

// ── Watermark ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    InFlight,
    Completed,
    Failed,
    Cancelled,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        self != DeliveryStatus::InFlight
    }
}

/// One peer's view of a send job.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PeerDelivery {
    pub peer_id: String,
    pub offset: u64,
    pub chunk_size: usize,
    pub status: DeliveryStatus,
}

/// Guaranteed-delivered watermark across the peers of a send job.
///
/// The value is the minimum offset over every delivery that was not
/// cancelled, so it never overstates what any receiving peer holds; a
/// failed peer freezes it at the offset it reached.
#[derive(Debug, Clone)]
pub struct Watermark {
    peers: BTreeMap<String, PeerDelivery>,
}

impl Watermark {
    pub fn new<'a>(peers: impl IntoIterator<Item = &'a str>, chunk_size: usize) -> Self {
        Self {
            peers: peers
                .into_iter()
                .map(|p| {
                    (
                        p.to_string(),
                        PeerDelivery {
                            peer_id: p.to_string(),
                            offset: 0,
                            chunk_size,
                            status: DeliveryStatus::InFlight,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn update(&mut self, update: PeerDelivery) {
        self.peers.insert(update.peer_id.clone(), update);
    }

    pub fn value(&self) -> u64 {
        let counted = self
            .peers
            .values()
            .filter(|d| d.status != DeliveryStatus::Cancelled)
            .map(|d| d.offset)
            .min();
        counted
            .or_else(|| self.peers.values().map(|d| d.offset).min())
            .unwrap_or(0)
    }

    pub fn all_terminal(&self) -> bool {
        self.peers.values().all(|d| d.status.is_terminal())
    }

    pub fn deliveries(&self) -> Vec<PeerDelivery> {
        self.peers.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(peer: &str, offset: u64, status: DeliveryStatus) -> PeerDelivery {
        PeerDelivery {
            peer_id: peer.into(),
            offset,
            chunk_size: 1024,
            status,
        }
    }

    #[test]
    fn test_watermark_is_minimum_and_freezes_on_failure() {
        let mut w = Watermark::new(["a", "b", "c"], 1024);
        w.update(delivery("a", 300, DeliveryStatus::InFlight));
        w.update(delivery("b", 100, DeliveryStatus::InFlight));
        w.update(delivery("c", 200, DeliveryStatus::InFlight));
        assert_eq!(w.value(), 100);

        w.update(delivery("b", 150, DeliveryStatus::Failed));
        w.update(delivery("a", 1000, DeliveryStatus::Completed));
        w.update(delivery("c", 1000, DeliveryStatus::Completed));
        assert_eq!(w.value(), 150);
        assert!(w.all_terminal());
    }

    #[test]
    fn test_cancelled_peer_does_not_hold_back_others() {
        let mut w = Watermark::new(["a", "b"], 1024);
        w.update(delivery("a", 10, DeliveryStatus::Cancelled));
        w.update(delivery("b", 500, DeliveryStatus::InFlight));
        assert_eq!(w.value(), 500);
        assert!(!w.all_terminal());

        w.update(delivery("b", 600, DeliveryStatus::Cancelled));
        assert_eq!(w.value(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_meter_cadence_and_smoothing() {
        let mut m = SpeedMeter::new(10_000, Duration::from_millis(500));
        assert!(m.sample(100, false).is_none());
        assert_eq!(m.eta(100), None);

        tokio::time::advance(Duration::from_secs(1)).await;
        let first = m.sample(1_000, false).unwrap();
        assert!((first.speed_bps - 1_000.0).abs() < 1e-6);
        assert_eq!(first.eta, Some(Duration::from_secs(9)));

        tokio::time::advance(Duration::from_secs(1)).await;
        let second = m.sample(3_000, false).unwrap();
        // 0.2 * 2000 + 0.8 * 1000
        assert!((second.speed_bps - 1_200.0).abs() < 1e-6);

        let done = m.sample(10_000, true).unwrap();
        assert_eq!(done.eta, Some(Duration::ZERO));
    }
}
