//! Shared data model: identifiers, track metadata, and state snapshots.
//!
//! Ownership rules for the types that carry mutable state (not expressed in
//! the type system, documented here instead):
//!
//! - `Session` exclusively owns credentials, the AP transport, and the
//!   `AudioKeyManager`.
//! - `Dealer` exclusively owns its WebSocket; `ConnectState`, the
//!   `CommandHandler`, and `PlaybackState` are collaborators that subscribe
//!   to it, never own it.
//! - `AudioPipeline` exclusively owns the currently loaded track stream and
//!   its decoder; on track change the previous stream is deterministically
//!   disposed before the next begins decoding.

pub mod ids;
pub mod metadata;
pub mod range_set;
pub mod status;

pub use ids::{AudioKey, FileId, SpotifyId, SpotifyIdError, SpotifyItemType};
pub use metadata::{NormalizationData, ReplayGain, TrackMetadata};
pub use range_set::{ByteRange, RangeSet};
pub use status::{ClusterView, ConnectionState, PlaybackOptions, PlaybackStatus, PlayerState};
