//! Bridge implementation that maps domain events to a broadcast channel.
//!
//! The [`BroadcastEventBridge`] lives at the boundary between domain
//! services and host transport, forwarding typed domain events onto a
//! `tokio::sync::broadcast` channel the CLI (or any other host) subscribes
//! to, while also forwarding to an optional externally-set [`EventEmitter`]
//! (used by tests to assert on emitted events without subscribing to the
//! channel).

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::emitter::EventEmitter;
use super::{ConnectStateEvent, ConnectionEvent, DownloadEvent, EngineEvent, PlaybackEvent};

/// Bridges domain events to a broadcast channel.
#[derive(Clone)]
pub struct BroadcastEventBridge {
    tx: broadcast::Sender<EngineEvent>,
    external_emitter: Arc<RwLock<Option<Arc<dyn EventEmitter>>>>,
}

impl BroadcastEventBridge {
    /// Creates a new bridge with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            external_emitter: Arc::new(RwLock::new(None)),
        }
    }

    /// Sets an external emitter that receives every event in addition to
    /// the broadcast channel.
    pub fn set_external_emitter(&self, emitter: Arc<dyn EventEmitter>) {
        *self.external_emitter.write() = Some(emitter);
    }

    /// Returns a new receiver for the broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Returns a reference to the broadcast sender.
    pub fn sender(&self) -> &broadcast::Sender<EngineEvent> {
        &self.tx
    }
}

macro_rules! impl_emit {
    ($method:ident, $event_ty:ty, $variant:ident) => {
        fn $method(&self, event: $event_ty) {
            if let Some(ref emitter) = *self.external_emitter.read() {
                emitter.$method(event.clone());
            }
            if let Err(e) = self.tx.send(EngineEvent::$variant(event)) {
                log::trace!("[EventBridge] no broadcast receivers: {}", e);
            }
        }
    };
}

impl EventEmitter for BroadcastEventBridge {
    impl_emit!(emit_connection, ConnectionEvent, Connection);
    impl_emit!(emit_playback, PlaybackEvent, Playback);
    impl_emit!(emit_download, DownloadEvent, Download);
    impl_emit!(emit_connect_state, ConnectStateEvent, ConnectState);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionState;

    #[test]
    fn forwards_to_subscribers() {
        let bridge = BroadcastEventBridge::new(16);
        let mut rx = bridge.subscribe();

        bridge.emit_connection(ConnectionEvent::StateChanged(ConnectionState::Connected));

        let event = rx.try_recv().expect("event delivered");
        matches!(
            event,
            EngineEvent::Connection(ConnectionEvent::StateChanged(ConnectionState::Connected))
        );
    }
}
