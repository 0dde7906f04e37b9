//! Centralized configuration constants for peerdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (IV layout, HKDF labels, room
//! code alphabet) stay in their respective modules.
//!
//! [`Settings`] mirrors the runtime-tunable subset so it can be loaded from
//! a TOML file; its `Default` is built from the constants below.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Chunking ─────────────────────────────────────────────────────────────────

/// Chunk size every delivery starts with (64 KB).
pub const INITIAL_CHUNK_SIZE: usize = 64 * 1024;

/// Floor of the adaptive chunk size (16 KB).
pub const MIN_CHUNK_SIZE: usize = 16 * 1024;

/// Ceiling of the adaptive chunk size (256 KB).
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

/// Additive growth step applied when the channel drains quickly.
pub const CHUNK_SIZE_STEP: usize = 16 * 1024;

/// Backlog above which the chunk size is halved (2 MB).
pub const BACKLOG_HIGH_WATERMARK: usize = 2 * 1024 * 1024;

/// Backlog under which the chunk size may grow (256 KB).
pub const BACKLOG_LOW_WATERMARK: usize = 256 * 1024;

/// A chunk send slower than this halves the chunk size.
pub const SLOW_SEND_THRESHOLD: Duration = Duration::from_millis(40);

/// A chunk send faster than this (with a small backlog) grows the chunk size.
pub const FAST_SEND_THRESHOLD: Duration = Duration::from_millis(10);

/// Deliveries yield to the scheduler after this many chunks.
pub const YIELD_EVERY_CHUNKS: u32 = 3;

/// Consecutive failed chunk sends on one session before the delivery gives up.
pub const SEND_MAX_RETRIES: u32 = 10;

/// Pause between retries of a failed chunk send.
pub const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(100);

// ── Progress ─────────────────────────────────────────────────────────────────

/// Minimum interval between progress reports (sender and receiver).
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Exponential smoothing factor for throughput (weight of the newest sample).
pub const SPEED_SMOOTHING: f64 = 0.2;

// ── Connection ───────────────────────────────────────────────────────────────

/// Outgoing channels that do not open within this window are abandoned.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(20);

/// How long a delivery waits for its peer to come back before failing.
pub const RESUME_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a reconnect attempt waits for the handshake after the channel opens.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before the host announces a newly ready peer to the others.
pub const PEER_JOINED_DELAY: Duration = Duration::from_millis(500);

// ── Reconnect ────────────────────────────────────────────────────────────────

/// First reconnect delay; doubled on every subsequent attempt.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for a single reconnect delay.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Attempts before the room gives up with a terminal error.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

// ── Quality / Diagnostics ────────────────────────────────────────────────────

/// Interval between latency pings to every ready peer.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Pings without a pong after this long are forgotten.
pub const PING_EXPIRY: Duration = Duration::from_secs(30);

/// Number of connection-quality samples retained.
pub const QUALITY_WINDOW: usize = 50;

/// Number of encrypt/decrypt samples kept for crypto performance stats.
pub const CRYPTO_STATS_WINDOW: usize = 100;

// ── Runtime settings ─────────────────────────────────────────────────────────

/// Runtime-tunable settings, loadable from TOML.
///
/// Durations are expressed in milliseconds so config files stay readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub open_timeout_ms: u64,
    pub resume_wait_ms: u64,
    pub handshake_timeout_ms: u64,
    pub peer_joined_delay_ms: u64,
    pub progress_interval_ms: u64,
    pub ping_interval_ms: u64,
    pub reconnect: ReconnectSettings,
    pub chunking: ChunkSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSettings {
    pub initial: usize,
    pub min: usize,
    pub max: usize,
    pub step: usize,
    pub backlog_high: usize,
    pub backlog_low: usize,
    pub slow_send_ms: u64,
    pub fast_send_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            open_timeout_ms: millis(OPEN_TIMEOUT),
            resume_wait_ms: millis(RESUME_WAIT_TIMEOUT),
            handshake_timeout_ms: millis(HANDSHAKE_TIMEOUT),
            peer_joined_delay_ms: millis(PEER_JOINED_DELAY),
            progress_interval_ms: millis(PROGRESS_INTERVAL),
            ping_interval_ms: millis(PING_INTERVAL),
            reconnect: ReconnectSettings::default(),
            chunking: ChunkSettings::default(),
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: millis(RECONNECT_BASE_DELAY),
            max_delay_ms: millis(RECONNECT_MAX_DELAY),
            max_attempts: RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            initial: INITIAL_CHUNK_SIZE,
            min: MIN_CHUNK_SIZE,
            max: MAX_CHUNK_SIZE,
            step: CHUNK_SIZE_STEP,
            backlog_high: BACKLOG_HIGH_WATERMARK,
            backlog_low: BACKLOG_LOW_WATERMARK,
            slow_send_ms: millis(SLOW_SEND_THRESHOLD),
            fast_send_ms: millis(FAST_SEND_THRESHOLD),
        }
    }
}

impl Settings {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn resume_wait(&self) -> Duration {
        Duration::from_millis(self.resume_wait_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn peer_joined_delay(&self) -> Duration {
        Duration::from_millis(self.peer_joined_delay_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Reject combinations the engine cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let c = &self.chunking;
        anyhow::ensure!(c.min > 0, "chunking.min must be positive");
        anyhow::ensure!(
            c.min <= c.initial && c.initial <= c.max,
            "chunk sizes must satisfy min <= initial <= max (got {} / {} / {})",
            c.min,
            c.initial,
            c.max
        );
        anyhow::ensure!(c.step > 0, "chunking.step must be positive");
        anyhow::ensure!(
            c.backlog_low <= c.backlog_high,
            "chunking.backlog_low must not exceed chunking.backlog_high"
        );
        anyhow::ensure!(
            self.reconnect.max_attempts > 0,
            "reconnect.max_attempts must be at least 1"
        );
        anyhow::ensure!(
            self.reconnect.base_delay_ms <= self.reconnect.max_delay_ms,
            "reconnect.base_delay_ms must not exceed reconnect.max_delay_ms"
        );
        anyhow::ensure!(self.ping_interval_ms > 0, "ping_interval_ms must be positive");
        Ok(())
    }
}

impl ChunkSettings {
    pub fn slow_send(&self) -> Duration {
        Duration::from_millis(self.slow_send_ms)
    }

    pub fn fast_send(&self) -> Duration {
        Duration::from_millis(self.fast_send_ms)
    }
}

impl ReconnectSettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}
