//! Device presence in the Connect cluster: volume, active flag, and the
//! PUT-state sync loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::dealer::DealerSession;
use crate::events::{ConnectStateEvent, EventEmitter};
use crate::runtime::TaskSpawner;
use crate::spclient::{PlayerStateSnapshot, PutStateReason, PutStateRequest, SharedSpClient};

/// Clamps an input volume percentage (0-100) to the protocol's 0..=65535
/// range by linear scaling.
pub fn percent_to_protocol_volume(percent: u8) -> u16 {
    let percent = percent.min(100) as u32;
    ((percent * u16::MAX as u32) / 100) as u16
}

/// Device presence manager: owns volume, active flag, and the message-id
/// counter; PUTs to the cloud on every change that needs one.
pub struct ConnectState {
    device_id: String,
    sp_client: SharedSpClient,
    dealer: Arc<DealerSession>,
    events: Arc<dyn EventEmitter>,

    connection_id: Mutex<Option<String>>,
    volume_tx: watch::Sender<u16>,
    volume_rx: watch::Receiver<u16>,
    active: Mutex<bool>,
    message_id: AtomicU64,
    access_token: Mutex<Option<String>>,
}

impl ConnectState {
    pub fn new(
        device_id: String,
        sp_client: SharedSpClient,
        dealer: Arc<DealerSession>,
        events: Arc<dyn EventEmitter>,
    ) -> Arc<Self> {
        let (volume_tx, volume_rx) = watch::channel(0u16);
        Arc::new(Self {
            device_id,
            sp_client,
            dealer,
            events,
            connection_id: Mutex::new(None),
            volume_tx,
            volume_rx,
            active: Mutex::new(false),
            message_id: AtomicU64::new(0),
            access_token: Mutex::new(None),
        })
    }

    /// Spawns the task that watches dealer messages for
    /// `hm://pusher/v1/connections/...` and extracts the connection id.
    pub fn start(self: &Arc<Self>, spawner: &dyn TaskSpawner) {
        let state = self.clone();
        let mut messages = self.dealer.subscribe_messages();
        spawner.spawn(async move {
            while let Ok(message) = messages.recv().await {
                if !message.uri.starts_with("hm://pusher/v1/connections/") {
                    continue;
                }
                let Some(connection_id) = message.header("Spotify-Connection-Id") else {
                    continue;
                };
                state.on_connection_id(connection_id.to_string()).await;
            }
        });
    }

    /// Latest-value volume observable (0..=65535).
    pub fn volume(&self) -> watch::Receiver<u16> {
        self.volume_rx.clone()
    }

    async fn on_connection_id(&self, connection_id: String) {
        *self.connection_id.lock() = Some(connection_id);
        // Every (re)learned connection id sends NewConnection, whether this
        // is the first connection of the process or a reconnect.
        self.put_state(PutStateReason::NewConnection, None).await;
    }

    /// Sets volume from an input percentage (0-100), converting linearly to
    /// the protocol's 0..=65535 range. A no-op if unchanged.
    pub async fn set_volume_percent(&self, percent: u8) {
        self.set_volume(percent_to_protocol_volume(percent)).await;
    }

    /// Sets volume directly in protocol units, clamped to 0..=65535. A
    /// no-op if unchanged.
    pub async fn set_volume(&self, volume: u16) {
        let changed = {
            let current = *self.volume_rx.borrow();
            if current == volume {
                false
            } else {
                let _ = self.volume_tx.send(volume);
                true
            }
        };
        if changed {
            self.put_state(PutStateReason::VolumeChanged, None).await;
        }
    }

    /// Activates or deactivates this device. The first activation after a
    /// (re)connection uses `NewDevice`; subsequent changes use
    /// `BecameInactive` when deactivating. A no-op if the flag is already
    /// at the requested value.
    pub async fn set_active(&self, active: bool) {
        let changed = {
            let mut current = self.active.lock();
            if *current == active {
                false
            } else {
                *current = active;
                true
            }
        };
        if !changed {
            return;
        }
        let reason = if active {
            PutStateReason::NewDevice
        } else {
            PutStateReason::BecameInactive
        };
        self.put_state(reason, None).await;
    }

    /// Reflects a local playback state change into the cloud (bidirectional
    /// mode).
    pub async fn put_player_state(&self, snapshot: PlayerStateSnapshot) {
        self.put_state(PutStateReason::PlayerStateChanged, Some(snapshot)).await;
    }

    /// Caches the access token used for the next PUT; refreshed by the
    /// bootstrap/session layer whenever it changes.
    pub fn set_access_token(&self, token: String) {
        *self.access_token.lock() = Some(token);
    }

    async fn put_state(&self, reason: PutStateReason, player_state: Option<PlayerStateSnapshot>) {
        let Some(connection_id) = self.connection_id.lock().clone() else {
            log::debug!("connect_state: no connection id yet, deferring PUT ({reason:?})");
            return;
        };
        let Some(access_token) = self.access_token.lock().clone() else {
            log::debug!("connect_state: no access token cached yet, deferring PUT ({reason:?})");
            return;
        };

        // message_id assignment happens under no additional lock: this
        // method only runs from call sites that already serialize through
        // self's own internal Mutex-guarded state transitions, and
        // fetch_add is itself atomic, giving the monotonic, no-duplicates
        // sequence PUT callers require.
        let message_id = self.message_id.fetch_add(1, Ordering::SeqCst);

        let request = PutStateRequest {
            message_id,
            reason,
            is_active: *self.active.lock(),
            volume: *self.volume_rx.borrow(),
            player_state,
        };

        match self
            .sp_client
            .put_state(&self.device_id, &connection_id, &access_token, &request)
            .await
        {
            Ok(()) => {
                self.events.emit_connect_state(ConnectStateEvent::PutSucceeded { message_id });
            }
            Err(e) => {
                // Network/server errors never roll back local state: we've already applied the change above.
                log::warn!("connect_state: PUT failed (message_id={message_id}): {e}");
                self.events.emit_connect_state(ConnectStateEvent::PutFailed {
                    message_id,
                    reason: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_to_protocol_volume_scales_linearly() {
        assert_eq!(percent_to_protocol_volume(0), 0);
        assert_eq!(percent_to_protocol_volume(100), u16::MAX);
        assert_eq!(percent_to_protocol_volume(50), u16::MAX / 2);
    }

    #[test]
    fn percent_to_protocol_volume_clamps_above_100() {
        assert_eq!(percent_to_protocol_volume(150), u16::MAX);
    }
}
