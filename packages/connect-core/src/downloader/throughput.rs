//! Throughput tracking and read-ahead target sizing.
//!
//! The background filler needs to know how far ahead of the playback cursor
//! to stay. A fast CDN only needs a few seconds of buffer; a slow one needs
//! up to a minute. [`ThroughputTracker`] keeps an exponential moving average
//! of observed bytes/sec and [`BufferStatus::target_ahead_bytes`] turns that
//! into a byte count using the nominal bitrate.

use crate::protocol_constants::{
    MAX_BUFFER_AHEAD_SECS, NOMINAL_BITRATE_KBPS, READ_AHEAD_DURATION_SECS,
    THROUGHPUT_HIGH_WATER_BYTES_PER_SEC, THROUGHPUT_LOW_WATER_BYTES_PER_SEC,
};

/// Exponential moving average of observed download throughput (bytes/sec).
#[derive(Debug, Clone)]
pub struct ThroughputTracker {
    ema_bytes_per_sec: Option<f64>,
}

impl Default for ThroughputTracker {
    fn default() -> Self {
        Self {
            ema_bytes_per_sec: None,
        }
    }
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one fetch's observed throughput.
    pub fn observe(&mut self, bytes: u64, elapsed: std::time::Duration) {
        if elapsed.as_secs_f64() <= 0.0 {
            return;
        }
        let sample = bytes as f64 / elapsed.as_secs_f64();
        // ema = (ema + instant) / 2.
        self.ema_bytes_per_sec = Some(match self.ema_bytes_per_sec {
            Some(prev) => (prev + sample) / 2.0,
            None => sample,
        });
    }

    /// Current throughput estimate, or `None` before any sample is taken.
    pub fn bytes_per_sec(&self) -> Option<f64> {
        self.ema_bytes_per_sec
    }

    /// Derives the read-ahead byte target for the current throughput
    /// estimate. Scales linearly between [`READ_AHEAD_DURATION_SECS`] at the
    /// high-water mark and [`MAX_BUFFER_AHEAD_SECS`] at/below the low-water
    /// mark; unknown throughput (no samples yet) uses the high-water target
    /// so an idle downloader doesn't over-fetch speculatively.
    pub fn target_ahead_bytes(&self) -> u64 {
        BufferStatus::from_throughput(self.ema_bytes_per_sec).target_ahead_bytes()
    }
}

/// A snapshot of the read-ahead target implied by a throughput estimate.
/// Split out from [`ThroughputTracker`] so the sizing math is independently
/// testable without needing to feed samples through the EMA.
#[derive(Debug, Clone, Copy)]
pub struct BufferStatus {
    target_secs: u64,
}

impl BufferStatus {
    pub fn from_throughput(bytes_per_sec: Option<f64>) -> Self {
        let target_secs = match bytes_per_sec {
            None => READ_AHEAD_DURATION_SECS,
            Some(bps) if bps >= THROUGHPUT_HIGH_WATER_BYTES_PER_SEC as f64 => {
                READ_AHEAD_DURATION_SECS
            }
            Some(bps) if bps <= THROUGHPUT_LOW_WATER_BYTES_PER_SEC as f64 => MAX_BUFFER_AHEAD_SECS,
            Some(bps) => {
                // Linear interpolation between the two water marks.
                let lo = THROUGHPUT_LOW_WATER_BYTES_PER_SEC as f64;
                let hi = THROUGHPUT_HIGH_WATER_BYTES_PER_SEC as f64;
                let fraction = (bps - lo) / (hi - lo);
                let span = READ_AHEAD_DURATION_SECS as f64 - MAX_BUFFER_AHEAD_SECS as f64;
                (MAX_BUFFER_AHEAD_SECS as f64 + fraction * span).round() as u64
            }
        };
        Self { target_secs }
    }

    pub fn target_ahead_bytes(&self) -> u64 {
        self.target_secs * (NOMINAL_BITRATE_KBPS * 1000 / 8)
    }
}
