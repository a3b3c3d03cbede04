//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by Spotify's Connect/dealer protocol and by the
//! tunable policy this engine applies around it. Where a value is a protocol
//! constant (wire format, endpoint paths) changing it breaks compatibility;
//! where it is a policy default (timeouts, backoff, buffer sizes) it is safe
//! to override via [`crate::config::EngineConfig`] but this module still
//! carries the shipped default.

// ─────────────────────────────────────────────────────────────────────────────
// Dealer (WebSocket control plane)
// ─────────────────────────────────────────────────────────────────────────────

/// Interval between dealer heartbeat pings (seconds).
pub const DEALER_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// How long to wait for a `pong` after sending `ping` before declaring the
/// connection dead (seconds).
pub const DEALER_PONG_TIMEOUT_SECS: u64 = 3;

/// Initial reconnect backoff delay (seconds).
pub const DEALER_RECONNECT_INITIAL_SECS: u64 = 1;

/// Reconnect backoff multiplier applied after each failed attempt.
pub const DEALER_RECONNECT_MULTIPLIER: u32 = 2;

/// Reconnect backoff cap (seconds). Backoff grows geometrically up to this
/// ceiling and then holds, retrying indefinitely.
pub const DEALER_RECONNECT_MAX_SECS: u64 = 30;

/// Producer-side back-pressure pause threshold for the dealer's frame pipe
/// (bytes buffered before the socket reader pauses).
pub const DEALER_PIPE_PAUSE_BYTES: usize = 1024 * 1024;

/// Producer-side back-pressure resume threshold (bytes).
pub const DEALER_PIPE_RESUME_BYTES: usize = 512 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// AudioKey
// ─────────────────────────────────────────────────────────────────────────────

/// Per-attempt timeout waiting for an `AesKey`/`AesKeyError` reply (ms).
pub const AUDIO_KEY_TIMEOUT_MS: u64 = 1500;

/// Retry delay table. The third delay is used before the third (final)
/// attempt; there is no fourth retry.
pub const AUDIO_KEY_RETRY_DELAYS_MS: [u64; 3] = [0, 500, 1000];

/// AP packet type: outgoing audio key request.
pub const AP_PACKET_REQUEST_KEY: u8 = 0x0c;

/// AP packet type: incoming successful audio key reply.
pub const AP_PACKET_AES_KEY: u8 = 0x0d;

/// AP packet type: incoming audio key error reply.
pub const AP_PACKET_AES_KEY_ERROR: u8 = 0x0e;

// ─────────────────────────────────────────────────────────────────────────────
// Head file / CDN fetch
// ─────────────────────────────────────────────────────────────────────────────

/// Timeout for the head-file fetch (seconds). Failure here is never fatal.
pub const HEAD_FILE_TIMEOUT_SECS: u64 = 5;

/// Byte offset of [`crate::model::NormalizationData`] within a decrypted
/// audio file.
pub const NORMALIZATION_OFFSET: usize = 144;

/// Byte length of the normalization data block.
pub const NORMALIZATION_SIZE: usize = 16;

/// Timeout for a single HTTP range fetch against the CDN (seconds).
pub const RANGE_FETCH_TIMEOUT_SECS: u64 = 8;

/// Maximum retry attempts for a range fetch.
pub const RANGE_FETCH_MAX_RETRIES: u32 = 3;

/// Exponential backoff table for range-fetch retries (seconds).
pub const RANGE_FETCH_RETRY_DELAYS_SECS: [u64; 3] = [1, 2, 4];

/// Smallest chunk expansion applied to an on-demand gap fetch.
pub const MIN_CHUNK_BYTES: usize = 64 * 1024;

/// Largest chunk the background filler fetches per iteration.
pub const MAX_CHUNK_BYTES: usize = 256 * 1024;

/// Background filler idle sleep once its read-ahead target is satisfied.
pub const BACKGROUND_FILL_IDLE_MS: u64 = 1000;

/// Background filler yield between chunks, so a fast CDN doesn't starve the
/// reader of the file mutex.
pub const BACKGROUND_FILL_YIELD_MS: u64 = 50;

/// Read-ahead duration target at or above [`THROUGHPUT_HIGH_WATER_BYTES_PER_SEC`]
/// (seconds of audio at the nominal bitrate).
pub const READ_AHEAD_DURATION_SECS: u64 = 10;

/// Maximum read-ahead duration target at or below
/// [`THROUGHPUT_LOW_WATER_BYTES_PER_SEC`] (seconds of audio at the nominal
/// bitrate).
pub const MAX_BUFFER_AHEAD_SECS: u64 = 60;

/// Nominal bitrate used to convert a read-ahead duration into a byte target
/// when the source doesn't carry its own bitrate (kbps).
pub const NOMINAL_BITRATE_KBPS: u64 = 320;

/// Throughput at/above which the downloader uses the minimum read-ahead
/// target (bytes/sec).
pub const THROUGHPUT_HIGH_WATER_BYTES_PER_SEC: u64 = 500 * 1024;

/// Throughput at/below which the downloader uses the maximum read-ahead
/// target (bytes/sec).
pub const THROUGHPUT_LOW_WATER_BYTES_PER_SEC: u64 = 100 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Seek
// ─────────────────────────────────────────────────────────────────────────────

/// Bytes requested before the estimated seek offset when prefetching a seek
/// window.
pub const SEEK_PREFETCH_BEFORE_BYTES: usize = 64 * 1024;

/// Bytes requested after the estimated seek offset when prefetching a seek
/// window.
pub const SEEK_PREFETCH_AFTER_BYTES: usize = 192 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Position reporting
// ─────────────────────────────────────────────────────────────────────────────

/// Minimum interval between `LocalPlaybackState` position emissions sent to
/// UI-facing consumers (ms). The pipeline may track finer granularity
/// internally.
pub const POSITION_REPORT_THROTTLE_MS: u64 = 500;

// ─────────────────────────────────────────────────────────────────────────────
// HTTP endpoints (wire-format constants, not tunables)
// ─────────────────────────────────────────────────────────────────────────────

/// Access-point resolver endpoint, queried for dealer hostnames.
pub const APRESOLVE_URL: &str = "https://apresolve.spotify.com/?type=dealer";

/// Head-file CDN host.
pub const HEAD_FILE_HOST: &str = "https://heads-fa.spotify.com";

// ─────────────────────────────────────────────────────────────────────────────
// Application identity
// ─────────────────────────────────────────────────────────────────────────────

/// Application name carried in outbound requests that want a human-readable
/// client identity (device registration, user-agent).
pub const APP_NAME: &str = "Connect Engine";

/// Safety margin subtracted from an access token's reported expiry before
/// the engine considers it stale and triggers a refresh (seconds).
pub const TOKEN_EXPIRY_SAFETY_MARGIN_SECS: u64 = 60;

// ─────────────────────────────────────────────────────────────────────────────
// Channel capacities
// ─────────────────────────────────────────────────────────────────────────────

/// Capacity of the broadcast channel carrying raw dealer `message` frames.
pub const DEALER_MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the broadcast channel carrying raw dealer `request` frames.
pub const DEALER_REQUEST_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the broadcast channel carrying distilled engine events
/// (see [`crate::events`]).
pub const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Capacity of the broadcast channel carrying decoded [`crate::command_handler::CommandEnvelope`]s.
pub const COMMAND_CHANNEL_CAPACITY: usize = 128;

/// Capacity of the broadcast channel carrying synthesized transfer requests
/// (see [`crate::playback_state::PlaybackState`]).
pub const TRANSFER_CHANNEL_CAPACITY: usize = 16;

// ─────────────────────────────────────────────────────────────────────────────
// HTTP track source
// ─────────────────────────────────────────────────────────────────────────────

/// Bytes pre-buffered before an HTTP-sourced stream (episode external URL,
/// generic HTTP radio) is handed to the decoder.
pub const HTTP_SOURCE_PREBUFFER_BYTES: usize = 128 * 1024;
