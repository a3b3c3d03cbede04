//! Remote cluster mirror: tracks the Connect cluster's active player from
//! dealer `ClusterUpdate` messages and bridges transfers to the local
//! pipeline.
//!
//! The `ClusterUpdate` protobuf itself is out of scope; decoding
//! it is a capability boundary, [`ClusterUpdateDecoder`], the same shape as
//! [`crate::session::ApTransport`] and [`crate::spclient::SpClient`] draw
//! around their own out-of-scope wire formats.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::dealer::DealerSession;
use crate::error::PlaybackStateError;
use crate::events::{EventEmitter, PlaybackEvent};
use crate::model::{ClusterView, PlaybackOptions, PlaybackStatus, PlayerState};
use crate::protocol_constants::TRANSFER_CHANNEL_CAPACITY;
use crate::runtime::TaskSpawner;

const CLUSTER_URI: &str = "hm://connect-state/v1/cluster";

/// A decoded `ClusterUpdate`, the fields this component actually consumes.
#[derive(Debug, Clone, Default)]
pub struct ClusterUpdatePayload {
    pub active_device_id: Option<String>,
    pub player_state: PlayerState,
    pub options: PlaybackOptions,
    pub server_timestamp_ms: u64,
}

/// Decodes a (possibly gzip-decompressed) dealer message payload at
/// `hm://connect-state/v1/cluster` into a
/// [`ClusterUpdatePayload`]. A host supplies this once it owns a protobuf
/// codec; [`crate::error::PlaybackStateError::DecodeFailed`] is logged and
/// dropped like any other malformed inbound frame, never fatal.
#[async_trait]
pub trait ClusterUpdateDecoder: Send + Sync {
    async fn decode(&self, payload: &[u8]) -> Result<ClusterUpdatePayload, PlaybackStateError>;
}

/// A transfer synthesized either by [`crate::command_handler::Command::Transfer`]
/// or by this component when `active_device_id` changes to this device.
/// Both cases resolve to the cluster's last-known player state rather than
/// attempting to decode the transfer command's opaque bytes.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub track_uri: Option<String>,
    pub position_ms: u64,
}

fn derive_status(player_state: &PlayerState) -> PlaybackStatus {
    if player_state.is_playing {
        PlaybackStatus::Playing
    } else if player_state.is_paused {
        PlaybackStatus::Paused
    } else {
        PlaybackStatus::Stopped
    }
}

/// The device's view of the Connect cluster, distilled into change events
/// and a local queue the pipeline consults on skip-next/skip-prev.
pub struct PlaybackState {
    device_id: String,
    decoder: Arc<dyn ClusterUpdateDecoder>,
    dealer: Arc<DealerSession>,
    events: Arc<dyn EventEmitter>,

    cluster: RwLock<ClusterView>,
    /// Set by the pipeline while bidirectional mode has this device as the
    /// active player, so this component suppresses redundant remote
    /// reflections of state it originated.
    local_authoritative: AtomicBool,
    last_applied_timestamp_ms: AtomicU64,

    queue: Mutex<VecDeque<String>>,
    transfer_tx: broadcast::Sender<TransferRequest>,
}

impl PlaybackState {
    pub fn new(
        device_id: String,
        decoder: Arc<dyn ClusterUpdateDecoder>,
        dealer: Arc<DealerSession>,
        events: Arc<dyn EventEmitter>,
    ) -> Arc<Self> {
        let (transfer_tx, _) = broadcast::channel(TRANSFER_CHANNEL_CAPACITY);
        Arc::new(Self {
            device_id,
            decoder,
            dealer,
            events,
            cluster: RwLock::new(ClusterView::default()),
            local_authoritative: AtomicBool::new(false),
            last_applied_timestamp_ms: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::new()),
            transfer_tx,
        })
    }

    /// Spawns the task watching dealer messages at [`CLUSTER_URI`].
    pub fn start(self: &Arc<Self>, spawner: &dyn TaskSpawner) {
        let state = self.clone();
        let mut messages = self.dealer.subscribe_messages();
        spawner.spawn(async move {
            loop {
                let message = match messages.recv().await {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("playback_state: message stream lagged by {n} frames");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                if message.uri != CLUSTER_URI {
                    continue;
                }
                let Some(payload) = message.payload() else {
                    continue;
                };
                state.apply_cluster_payload(payload).await;
            }
        });
    }

    /// Snapshot of the current cluster view.
    pub fn current_cluster(&self) -> ClusterView {
        self.cluster.read().clone()
    }

    /// Subscribes to transfer requests synthesized when this device becomes
    /// the cluster's active device.
    pub fn subscribe_transfers(&self) -> broadcast::Receiver<TransferRequest> {
        self.transfer_tx.subscribe()
    }

    /// Called by the pipeline/bootstrap layer when bidirectional mode makes
    /// this device the authoritative source, to suppress redundant remote
    /// reflections of state this device itself originated.
    pub fn set_local_authoritative(&self, authoritative: bool) {
        self.local_authoritative.store(authoritative, Ordering::SeqCst);
    }

    async fn apply_cluster_payload(&self, payload: &[u8]) {
        let decoded = match self.decoder.decode(payload).await {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("playback_state: failed to decode cluster update, dropping: {e}");
                return;
            }
        };
        self.apply(decoded);
    }

    /// Applies a decoded cluster update: tie-breaks on `server_timestamp_ms`,
    /// diffs against the previous view to emit distilled events, and
    /// synthesizes a transfer if `active_device_id` became this device.
    fn apply(&self, update: ClusterUpdatePayload) {
        if update.server_timestamp_ms < self.last_applied_timestamp_ms.load(Ordering::SeqCst) {
            log::debug!(
                "playback_state: dropping out-of-order cluster update (ts={}, last={})",
                update.server_timestamp_ms,
                self.last_applied_timestamp_ms.load(Ordering::SeqCst)
            );
            return;
        }

        if self.local_authoritative.load(Ordering::SeqCst)
            && self.cluster.read().active_device_id.as_deref() == Some(self.device_id.as_str())
        {
            log::trace!("playback_state: suppressing remote reflection, this device is authoritative");
            self.last_applied_timestamp_ms.store(update.server_timestamp_ms, Ordering::SeqCst);
            return;
        }

        let previous = self.cluster.read().clone();
        let became_active = update.active_device_id.as_deref() == Some(self.device_id.as_str())
            && previous.active_device_id.as_deref() != Some(self.device_id.as_str());

        if previous.player_state.track_uri != update.player_state.track_uri {
            if let Some(track_uri) = update.player_state.track_uri.clone() {
                self.events.emit_playback(PlaybackEvent::RemoteTrackChanged { track_uri });
            }
        }
        if derive_status(&previous.player_state) != derive_status(&update.player_state) {
            self.events
                .emit_playback(PlaybackEvent::RemotePlaybackStatusChanged { status: derive_status(&update.player_state) });
        }
        if previous.player_state.position_ms != update.player_state.position_ms {
            self.events
                .emit_playback(PlaybackEvent::RemotePositionChanged { position_ms: update.player_state.position_ms });
        }
        if previous.options.shuffling_context != update.options.shuffling_context
            || previous.options.repeating_context != update.options.repeating_context
            || previous.options.repeating_track != update.options.repeating_track
        {
            self.events.emit_playback(PlaybackEvent::RemoteOptionsChanged {
                shuffling_context: update.options.shuffling_context,
                repeating_context: update.options.repeating_context,
                repeating_track: update.options.repeating_track,
            });
        }

        self.last_applied_timestamp_ms.store(update.server_timestamp_ms, Ordering::SeqCst);
        *self.cluster.write() = ClusterView {
            active_device_id: update.active_device_id,
            player_state: update.player_state.clone(),
            options: update.options,
            server_timestamp_ms: update.server_timestamp_ms,
        };

        if became_active {
            log::info!("playback_state: cluster transferred playback to this device");
            let _ = self.transfer_tx.send(TransferRequest {
                track_uri: update.player_state.track_uri,
                position_ms: update.player_state.position_ms,
            });
        }
    }

    /// Synthesizes a transfer from a [`crate::command_handler::Command::Transfer`]
    /// (the opaque `transfer_state` bytes are ignored, see module docs):
    /// loads from the cluster's last-known player state.
    pub fn synthesize_transfer_from_command(&self) {
        let cluster = self.cluster.read();
        let _ = self.transfer_tx.send(TransferRequest {
            track_uri: cluster.player_state.track_uri.clone(),
            position_ms: cluster.player_state.position_ms,
        });
    }

    /// The pipeline's current view of the upcoming queue, consulted when
    /// skip-next runs out of locally queued tracks.
    pub fn current_queue(&self) -> Vec<String> {
        self.queue.lock().iter().cloned().collect()
    }

    pub fn set_queue(&self, tracks: Vec<String>) {
        *self.queue.lock() = tracks.into_iter().collect();
    }

    pub fn add_to_queue(&self, track_uri: String) {
        self.queue.lock().push_back(track_uri);
    }

    /// Pops the next queued track, if any.
    pub fn pop_next(&self) -> Option<String> {
        self.queue.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dealer::connection::DealerResolver;
    use crate::events::{BroadcastEventBridge, EventEmitter};
    use crate::runtime::TokioSpawner;
    use crate::session::{ApPacket, ApTransport, Credentials, DeviceConfig, RefreshedToken, Session, TokenRefresher};
    use std::time::Duration;

    struct NullResolver;
    #[async_trait]
    impl DealerResolver for NullResolver {
        async fn resolve_dealer_hosts(&self) -> Result<Vec<String>, crate::error::DealerError> {
            Err(crate::error::DealerError::ResolveFailed)
        }
    }

    struct NullRefresher;
    #[async_trait]
    impl TokenRefresher for NullRefresher {
        async fn refresh(&self, _credentials: &Credentials) -> Result<RefreshedToken, crate::error::SessionError> {
            Ok(RefreshedToken {
                access_token: "tok".into(),
                ttl: Duration::from_secs(3600),
                country_code: None,
                account_type: Default::default(),
            })
        }
    }

    struct NullTransport;
    #[async_trait]
    impl ApTransport for NullTransport {
        async fn send_packet(&self, _packet_type: u8, _payload: Vec<u8>) -> Result<(), crate::error::SessionError> {
            Ok(())
        }
        async fn recv_packet(&self) -> Option<ApPacket> {
            None
        }
    }

    struct FixedDecoder;
    #[async_trait]
    impl ClusterUpdateDecoder for FixedDecoder {
        async fn decode(&self, _payload: &[u8]) -> Result<ClusterUpdatePayload, PlaybackStateError> {
            unreachable!("tests call apply() directly")
        }
    }

    fn harness() -> Arc<PlaybackState> {
        let session = Session::new(
            DeviceConfig { device_id: "this-device".into(), device_name: "Test".into(), device_type: "computer".into() },
            Credentials::Reusable(vec![]),
            Arc::new(NullRefresher),
            Arc::new(NullTransport),
        );
        let events: Arc<dyn EventEmitter> = Arc::new(BroadcastEventBridge::new(16));
        let dealer = DealerSession::start(
            Arc::new(NullResolver),
            session,
            Duration::from_secs(30),
            Duration::from_secs(3),
            Duration::from_secs(1),
            2,
            Duration::from_secs(30),
            events.clone(),
            Arc::new(TokioSpawner::current()),
        );
        PlaybackState::new("this-device".to_string(), Arc::new(FixedDecoder), dealer, events)
    }

    fn update(track_uri: &str, ts: u64, active_device: &str) -> ClusterUpdatePayload {
        ClusterUpdatePayload {
            active_device_id: Some(active_device.to_string()),
            player_state: PlayerState {
                track_uri: Some(track_uri.to_string()),
                position_ms: 0,
                duration_ms: 180_000,
                is_playing: true,
                is_paused: false,
            },
            options: PlaybackOptions::default(),
            server_timestamp_ms: ts,
        }
    }

    #[tokio::test]
    async fn out_of_order_update_is_dropped() {
        let state = harness();
        state.apply(update("spotify:track:a", 100, "other-device"));
        state.apply(update("spotify:track:b", 50, "other-device"));
        assert_eq!(state.current_cluster().player_state.track_uri, Some("spotify:track:a".to_string()));
    }

    #[tokio::test]
    async fn becoming_active_device_synthesizes_transfer() {
        let state = harness();
        let mut transfers = state.subscribe_transfers();
        state.apply(update("spotify:track:a", 100, "other-device"));
        state.apply(update("spotify:track:b", 200, "this-device"));

        let transfer = transfers.try_recv().expect("transfer synthesized");
        assert_eq!(transfer.track_uri, Some("spotify:track:b".to_string()));
    }

    #[tokio::test]
    async fn queue_operations_round_trip() {
        let state = harness();
        state.set_queue(vec!["a".to_string(), "b".to_string()]);
        state.add_to_queue("c".to_string());
        assert_eq!(state.current_queue(), vec!["a", "b", "c"]);
        assert_eq!(state.pop_next(), Some("a".to_string()));
        assert_eq!(state.current_queue(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn local_authoritative_device_suppresses_remote_reflection() {
        let state = harness();
        state.apply(update("spotify:track:a", 100, "this-device"));
        state.set_local_authoritative(true);

        let mut transfers = state.subscribe_transfers();
        state.apply(update("spotify:track:b", 200, "this-device"));

        assert_eq!(state.current_cluster().player_state.track_uri, Some("spotify:track:a".to_string()));
        assert!(transfers.try_recv().is_err());
    }
}
