//! Engine bootstrap and dependency wiring.
//!
//! This module is the composition root - the single place where every
//! engine component is instantiated and wired together. This pattern
//! provides:
//!
//! - **Clarity**: all dependency relationships are visible in one place
//! - **Testability**: easy to swap implementations for testing
//! - **Maintainability**: wiring logic is isolated from usage

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::command_handler::CommandHandler;
use crate::config::EngineConfig;
use crate::connect_state::ConnectState;
use crate::dealer::{ApResolveDealerResolver, DealerResolver, DealerSession};
use crate::events::{BroadcastEventBridge, EventEmitter};
use crate::pipeline::{AudioPipeline, Decoder, NullDecoder};
use crate::playback_state::{ClusterUpdateDecoder, PlaybackState};
use crate::runtime::TokioSpawner;
use crate::session::{ApTransport, Credentials, DeviceConfig, Session, TokenRefresher};
use crate::spclient::{HttpSpClient, SharedSpClient};
use crate::track_source::http_source::HttpTrackSource;
use crate::track_source::spotify::SpotifyTrackSource;
use crate::track_source::TrackSourceRegistry;

/// Errors that can prevent the engine from bootstrapping.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Everything a host needs to supply beyond engine-native wiring: the
/// pieces this crate treats as out of scope and leaves to the host
/// (OAuth/AP handshake, wire protobuf codecs, real audio decoding).
pub struct HostDependencies {
    pub device: DeviceConfig,
    pub credentials: Credentials,
    pub token_refresher: Arc<dyn TokenRefresher>,
    pub ap_transport: Arc<dyn ApTransport>,
    pub cluster_update_decoder: Arc<dyn ClusterUpdateDecoder>,
    /// Defaults to [`NullDecoder`] (headless, position tracked from bytes
    /// consumed) when not supplied.
    pub decoder: Option<Arc<dyn Decoder>>,
    /// Defaults to [`ApResolveDealerResolver`] when not supplied.
    pub dealer_resolver: Option<Arc<dyn DealerResolver>>,
    pub spclient_host: String,
}

/// Container for all bootstrapped engine services.
///
/// Holds every wired component a host (the CLI, or any other front-end)
/// drives directly: queue playback commands on [`Self::pipeline`], observe
/// [`Self::events`], read [`Self::dealer`]'s connection state.
#[derive(Clone)]
pub struct BootstrappedEngine {
    pub session: Arc<Session>,
    pub dealer: Arc<DealerSession>,
    pub connect_state: Arc<ConnectState>,
    pub command_handler: Arc<CommandHandler>,
    pub playback_state: Arc<PlaybackState>,
    pub pipeline: Arc<AudioPipeline>,
    pub registry: Arc<TrackSourceRegistry>,
    pub events: Arc<BroadcastEventBridge>,
    pub config: EngineConfig,
    /// Shared HTTP client for connection pooling across every subsystem
    /// that speaks HTTP (spclient, head-file fetch, CDN range requests).
    http_client: Client,
    pub spawner: Arc<TokioSpawner>,
    pub cancel_token: CancellationToken,
}

impl BootstrappedEngine {
    /// The shared `reqwest::Client` every HTTP-speaking subsystem was wired
    /// with. Exposed for a host that wants to make its own calls (e.g. the
    /// OAuth exchange) through the same connection pool.
    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    /// Spawns every background task that waits for the dealer's first
    /// connection (connect-state, playback state, pipeline), plus the
    /// access-token refresh loop that feeds `ConnectState`'s PUT calls. The
    /// dealer reconnect loop and the command handler are already running by
    /// the time [`bootstrap_engine`] returns.
    pub fn start(&self) {
        self.connect_state.start(self.spawner.as_ref());
        self.playback_state.start(self.spawner.as_ref());
        self.pipeline.start();

        let session = self.session.clone();
        let connect_state = self.connect_state.clone();
        let cancel = self.cancel_token.clone();
        self.spawner.spawn(async move {
            loop {
                match session.get_access_token().await {
                    Ok(token) => connect_state.set_access_token(token),
                    Err(e) => log::warn!("access token refresh failed: {e}"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(TOKEN_EXPIRY_SAFETY_MARGIN_SECS)) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    /// Cancels every outstanding background task. The pipeline's decode
    /// loop and every in-flight downloader background fill observe this
    /// token.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

fn create_http_client() -> Result<Client, BootstrapError> {
    Client::builder()
        .timeout(Duration::from_secs(crate::protocol_constants::RANGE_FETCH_TIMEOUT_SECS))
        .build()
        .map_err(|e| BootstrapError::HttpClient(e.to_string()))
}

/// Bootstraps the engine with every dependency wired together.
///
/// This is the composition root where all services are instantiated in
/// dependency order:
///
/// 1. Configuration validation
/// 2. Shared infrastructure (HTTP client, event bridge, task spawner, cancellation token)
/// 3. Session (credentials, AP transport, AudioKey requests)
/// 4. Dealer (WebSocket connection plus reconnect orchestration)
/// 5. ConnectState, CommandHandler, PlaybackState (dealer collaborators)
/// 6. The Spotify/HTTP track source registry
/// 7. AudioPipeline (the single owner of local playback)
pub fn bootstrap_engine(config: EngineConfig, deps: HostDependencies) -> Result<BootstrappedEngine, BootstrapError> {
    config.validate().map_err(BootstrapError::InvalidConfig)?;

    let http_client = create_http_client()?;
    let events = Arc::new(BroadcastEventBridge::new(crate::protocol_constants::EVENT_CHANNEL_CAPACITY));
    let events_dyn: Arc<dyn EventEmitter> = events.clone();
    let spawner = Arc::new(TokioSpawner::current());
    let cancel_token = CancellationToken::new();

    let device_id = deps.device.device_id.clone();
    let ap_transport = deps.ap_transport.clone();
    let session = Session::new(deps.device, deps.credentials, deps.token_refresher, deps.ap_transport);

    // The only caller of `AudioKeyManager::handle_packet` in production:
    // without this loop draining the host's `ApTransport`, every pending
    // `request_audio_key` call would time out regardless of how correct the
    // host's transport is, since nothing would ever deliver its reply.
    let audio_keys = session.audio_keys().clone();
    spawner.spawn(async move {
        while let Some(packet) = ap_transport.recv_packet().await {
            audio_keys.handle_packet(packet.packet_type, &packet.payload);
        }
        log::info!("AP transport closed, audio key packet dispatch loop exiting");
    });

    let resolver = deps
        .dealer_resolver
        .unwrap_or_else(|| Arc::new(ApResolveDealerResolver::new(http_client.clone())));

    let dealer = DealerSession::start(
        resolver,
        session.clone(),
        Duration::from_secs(config.dealer_heartbeat_interval_secs),
        Duration::from_secs(config.dealer_pong_timeout_secs),
        Duration::from_secs(config.dealer_reconnect_initial_secs),
        config.dealer_reconnect_multiplier,
        Duration::from_secs(config.dealer_reconnect_max_secs),
        events_dyn.clone(),
        spawner.clone(),
    );

    let sp_client: SharedSpClient = Arc::new(HttpSpClient::new(http_client.clone(), deps.spclient_host));

    let connect_state = ConnectState::new(device_id.clone(), sp_client.clone(), dealer.clone(), events_dyn.clone());
    let command_handler = CommandHandler::start(dealer.clone(), spawner.as_ref());
    let playback_state = PlaybackState::new(device_id, deps.cluster_update_decoder, dealer.clone(), events_dyn.clone());

    let http_source = Arc::new(HttpTrackSource::new(
        http_client.clone(),
        events.clone(),
        spawner.clone(),
        cancel_token.clone(),
    ));
    let spotify_source = SpotifyTrackSource::new(
        session.clone(),
        sp_client,
        http_client.clone(),
        events.clone(),
        spawner.clone(),
        cancel_token.clone(),
        crate::spclient::AudioQuality::default(),
        http_source.clone(),
    );

    let mut registry = TrackSourceRegistry::new();
    registry.register(Arc::new(spotify_source));
    registry.register(http_source);
    let registry = Arc::new(registry);

    let decoder: Arc<dyn Decoder> = deps.decoder.unwrap_or_else(|| Arc::new(NullDecoder));

    let pipeline = AudioPipeline::new(
        registry.clone(),
        decoder,
        command_handler.clone(),
        playback_state.clone(),
        connect_state.clone(),
        events_dyn,
        spawner.clone(),
        &config,
        cancel_token.clone(),
    );

    Ok(BootstrappedEngine {
        session,
        dealer,
        connect_state,
        command_handler,
        playback_state,
        pipeline,
        registry,
        events,
        config,
        http_client,
        spawner,
        cancel_token,
    })
}
