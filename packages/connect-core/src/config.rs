//! Engine-wide tunable configuration.
//!
//! Mirrors every timeout/backoff/buffer constant this engine uses,
//! defaulted from [`crate::protocol_constants`]. Validated the way the
//! reference streaming config in this codebase's lineage rejects
//! nonsensical zero values before bootstrap wires any component to it.

use serde::{Deserialize, Serialize};

use crate::protocol_constants::*;

/// Tunable configuration for every engine subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dealer_heartbeat_interval_secs: u64,
    pub dealer_pong_timeout_secs: u64,
    pub dealer_reconnect_initial_secs: u64,
    pub dealer_reconnect_multiplier: u32,
    pub dealer_reconnect_max_secs: u64,

    pub audio_key_timeout_ms: u64,
    pub audio_key_retry_delays_ms: [u64; 3],

    pub head_file_timeout_secs: u64,

    pub range_fetch_timeout_secs: u64,
    pub range_fetch_max_retries: u32,
    pub range_fetch_retry_delays_secs: [u64; 3],

    pub min_chunk_bytes: usize,
    pub max_chunk_bytes: usize,
    pub read_ahead_duration_secs: u64,
    pub max_buffer_ahead_secs: u64,

    pub position_report_throttle_ms: u64,

    /// Whether the pipeline also emits PUTs reflecting local state changes.
    pub bidirectional_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dealer_heartbeat_interval_secs: DEALER_HEARTBEAT_INTERVAL_SECS,
            dealer_pong_timeout_secs: DEALER_PONG_TIMEOUT_SECS,
            dealer_reconnect_initial_secs: DEALER_RECONNECT_INITIAL_SECS,
            dealer_reconnect_multiplier: DEALER_RECONNECT_MULTIPLIER,
            dealer_reconnect_max_secs: DEALER_RECONNECT_MAX_SECS,

            audio_key_timeout_ms: AUDIO_KEY_TIMEOUT_MS,
            audio_key_retry_delays_ms: AUDIO_KEY_RETRY_DELAYS_MS,

            head_file_timeout_secs: HEAD_FILE_TIMEOUT_SECS,

            range_fetch_timeout_secs: RANGE_FETCH_TIMEOUT_SECS,
            range_fetch_max_retries: RANGE_FETCH_MAX_RETRIES,
            range_fetch_retry_delays_secs: RANGE_FETCH_RETRY_DELAYS_SECS,

            min_chunk_bytes: MIN_CHUNK_BYTES,
            max_chunk_bytes: MAX_CHUNK_BYTES,
            read_ahead_duration_secs: READ_AHEAD_DURATION_SECS,
            max_buffer_ahead_secs: MAX_BUFFER_AHEAD_SECS,

            position_report_throttle_ms: POSITION_REPORT_THROTTLE_MS,

            bidirectional_mode: true,
        }
    }
}

impl EngineConfig {
    /// Rejects configuration that would make a subsystem nonfunctional
    /// (e.g. a zero timeout that fires before any I/O could ever complete).
    pub fn validate(&self) -> Result<(), String> {
        if self.dealer_heartbeat_interval_secs == 0 {
            return Err("dealer_heartbeat_interval_secs must be > 0".into());
        }
        if self.dealer_pong_timeout_secs == 0 {
            return Err("dealer_pong_timeout_secs must be > 0".into());
        }
        if self.dealer_reconnect_multiplier < 2 {
            return Err("dealer_reconnect_multiplier must be >= 2".into());
        }
        if self.audio_key_timeout_ms == 0 {
            return Err("audio_key_timeout_ms must be > 0".into());
        }
        if self.min_chunk_bytes == 0 || self.max_chunk_bytes < self.min_chunk_bytes {
            return Err("max_chunk_bytes must be >= min_chunk_bytes > 0".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_heartbeat_is_rejected() {
        let mut config = EngineConfig::default();
        config.dealer_heartbeat_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_chunk_bounds_are_rejected() {
        let mut config = EngineConfig::default();
        config.max_chunk_bytes = config.min_chunk_bytes - 1;
        assert!(config.validate().is_err());
    }
}
