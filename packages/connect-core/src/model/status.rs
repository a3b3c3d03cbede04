//! Playback and connection state enums, and the remote cluster snapshot.

/// Playback state of the [`crate::pipeline::AudioPipeline`]. Transitions are
/// single-writer (the pipeline owns the state machine driving these
/// changes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Stopped,
    Loading,
    Playing,
    Paused,
    Buffering,
    Error,
}

/// Dealer WebSocket connection state, exposed as a `tokio::sync::watch`
/// observable so late subscribers immediately see the current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// This device's view of the Connect cluster's active player, built from
/// dealer `ClusterUpdate` messages. Replaced atomically on each update;
/// consumers subscribe to `PlaybackState`'s distilled change streams rather
/// than diffing snapshots themselves.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    pub active_device_id: Option<String>,
    pub player_state: PlayerState,
    pub options: PlaybackOptions,
    /// Monotonic server timestamp used to discard out-of-order updates.
    pub server_timestamp_ms: u64,
}

/// The cluster's reported player state.
#[derive(Debug, Clone, Default)]
pub struct PlayerState {
    pub track_uri: Option<String>,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub is_playing: bool,
    pub is_paused: bool,
}

/// The cluster's reported shuffle/repeat options.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybackOptions {
    pub shuffling_context: bool,
    pub repeating_context: bool,
    pub repeating_track: bool,
}
