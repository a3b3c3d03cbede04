//! Event system for host integration.
//!
//! This module provides:
//! - [`EventEmitter`] trait for domain services to emit events
//! - Event types for each cooperating subsystem
//!
//! Events are the "things happened" stream; current-value state (connection
//! state, volume, playback status) is exposed separately via
//! `tokio::sync::watch` on the owning component rather than replayed through
//! this broadcast channel.

pub mod bridge;
mod emitter;

pub use bridge::BroadcastEventBridge;
pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use crate::model::{ConnectionState, PlaybackStatus};

/// Events broadcast to the engine's host.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Dealer connection lifecycle.
    Connection(ConnectionEvent),

    /// Local and remote playback state changes.
    Playback(PlaybackEvent),

    /// Progressive downloader fetch failures.
    Download(DownloadEvent),

    /// ConnectState PUT outcomes.
    ConnectState(ConnectStateEvent),
}

/// Dealer connection lifecycle events.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Connection state transitioned.
    StateChanged(ConnectionState),

    /// A reconnect attempt has been scheduled after a failure.
    ReconnectScheduled {
        /// 1-based attempt counter, reset to 1 on a successful connect.
        attempt: u32,
        /// Delay before the attempt fires.
        delay_ms: u64,
    },
}

/// Playback state changes, local or mirrored from the remote cluster.
#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    /// This device's local playback state changed (see `AudioPipeline`).
    LocalStateChanged {
        track_uri: String,
        position_ms: u64,
        status: PlaybackStatus,
    },

    /// The remote cluster's active track changed (see `PlaybackState`).
    RemoteTrackChanged { track_uri: String },

    /// The remote cluster's playback status changed.
    RemotePlaybackStatusChanged { status: PlaybackStatus },

    /// The remote cluster's reported position changed.
    RemotePositionChanged { position_ms: u64 },

    /// The remote cluster's shuffle/repeat options changed.
    RemoteOptionsChanged {
        shuffling_context: bool,
        repeating_context: bool,
        repeating_track: bool,
    },
}

/// A download retry/failure, emitted before the retry fires so UI can show
/// transient trouble without treating it as fatal.
#[derive(Debug, Clone)]
pub struct DownloadEvent {
    pub message: String,
    pub retry_count: u32,
    pub will_retry: bool,
}

/// ConnectState PUT outcome. Failures are logged and never roll back local
/// state (§4.3); this event exists purely for observability.
#[derive(Debug, Clone)]
pub enum ConnectStateEvent {
    PutSucceeded { message_id: u64 },
    PutFailed { message_id: u64, reason: String },
}

impl From<ConnectionEvent> for EngineEvent {
    fn from(event: ConnectionEvent) -> Self {
        EngineEvent::Connection(event)
    }
}

impl From<PlaybackEvent> for EngineEvent {
    fn from(event: PlaybackEvent) -> Self {
        EngineEvent::Playback(event)
    }
}

impl From<DownloadEvent> for EngineEvent {
    fn from(event: DownloadEvent) -> Self {
        EngineEvent::Download(event)
    }
}

impl From<ConnectStateEvent> for EngineEvent {
    fn from(event: ConnectStateEvent) -> Self {
        EngineEvent::ConnectState(event)
    }
}
