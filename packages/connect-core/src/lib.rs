//! connect-core - engine library for an unofficial Spotify Connect client.
//!
//! This crate owns every piece of the engine that is independent of a host
//! UI: the dealer WebSocket session, device presence in the Connect
//! cluster, the remote cluster mirror, the local playback state machine,
//! and the instant-start progressive downloader. It is designed to be
//! driven by a thin front-end (the CLI in this workspace, or any other
//! host) that supplies the handful of capability traits this crate leaves
//! out-of-scope: the OAuth/AP handshake, the wire protobuf codecs, and real
//! audio decoding.
//!
//! # Architecture
//!
//! - [`session`]: credentials, access-token refresh, AP transport, AudioKey requests
//! - [`dealer`]: the Spotify dealer WebSocket and its reconnect orchestration
//! - [`connect_state`]: device presence in the Connect cluster (volume, active flag, PUT loop)
//! - [`command_handler`]: decodes dealer requests into typed [`command_handler::Command`]s
//! - [`playback_state`]: mirrors the remote cluster's player state
//! - [`pipeline`]: the single owner of local playback, [`pipeline::AudioPipeline`]
//! - [`track_source`]: resolves a uri into a decrypted, decodable stream
//! - [`downloader`]: progressive HTTP range downloading and AES-128-CTR decryption
//! - [`spclient`]: the HTTP boundary to Spotify's `spclient`
//! - [`model`]: shared identifiers and state types
//! - [`config`]: engine-wide tunable configuration
//! - [`error`]: centralized error types
//! - [`events`]: event system for host integration
//! - [`bootstrap`]: composition root wiring every component together
//!
//! # Abstraction traits
//!
//! The crate defines several traits to decouple engine logic from
//! platform- and protocol-specific concerns a host must supply:
//!
//! - [`runtime::TaskSpawner`]: spawning background tasks
//! - [`events::EventEmitter`]: emitting domain events
//! - [`session::TokenRefresher`] / [`session::ApTransport`]: the OAuth/AP boundary
//! - [`dealer::DealerResolver`]: resolving dealer WebSocket hosts
//! - [`spclient::SpClient`]: the `spclient` HTTP boundary
//! - [`playback_state::ClusterUpdateDecoder`]: decoding the `ClusterUpdate` protobuf
//! - [`pipeline::Decoder`] / [`pipeline::DecoderSession`]: real audio decoding
//!
//! Each has a default or headless implementation suitable for tests and for
//! the standalone CLI; a richer host can substitute its own.

#![warn(clippy::all)]

pub mod bootstrap;
pub mod command_handler;
pub mod config;
pub mod connect_state;
pub mod dealer;
pub mod downloader;
pub mod error;
pub mod events;
pub mod model;
pub mod pipeline;
pub mod playback_state;
pub mod protocol_constants;
pub mod runtime;
pub mod session;
pub mod spclient;
pub mod track_source;
pub mod utils;

pub use bootstrap::{bootstrap_engine, BootstrapError, BootstrappedEngine, HostDependencies};
pub use command_handler::{Command, CommandHandler};
pub use config::EngineConfig;
pub use connect_state::ConnectState;
pub use dealer::{Dealer, DealerResolver, DealerSession};
pub use error::{EngineError, EngineResult, ErrorCode};
pub use events::{
    BroadcastEventBridge, ConnectStateEvent, ConnectionEvent, DownloadEvent, EngineEvent, EventEmitter,
    NoopEventEmitter, PlaybackEvent,
};
pub use pipeline::AudioPipeline;
pub use playback_state::PlaybackState;
pub use runtime::{TaskSpawner, TokioSpawner};
pub use session::Session;
pub use spclient::{HttpSpClient, SharedSpClient, SpClient};
pub use track_source::{TrackSource, TrackSourceRegistry, TrackStream};
