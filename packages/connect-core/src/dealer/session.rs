//! Reconnect orchestration around a [`Dealer`].
//!
//! `DealerSession` is a periodic-refresh-style supervisor loop around
//! exponential backoff, `{1s, x2, cap 30s, infinite attempts}`, kept
//! separate from the Dealer connection itself.
//!
//! Because each reconnect produces a fresh [`Dealer`] with fresh broadcast
//! channels, `DealerSession` owns long-lived channels of its own and
//! forwards the current `Dealer`'s frames into them, so a subscriber taken
//! out once stays valid across reconnects.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};

use super::connection::{Dealer, DealerResolver};
use super::frame::{MessageFrame, RequestFrame};
use crate::error::DealerError;
use crate::events::{ConnectionEvent, EventEmitter};
use crate::model::ConnectionState;
use crate::protocol_constants::{
    DEALER_MESSAGE_CHANNEL_CAPACITY, DEALER_REQUEST_CHANNEL_CAPACITY,
};
use crate::runtime::TaskSpawner;
use crate::session::Session;

/// Owns the dealer reconnect loop and presents stable, reconnect-surviving
/// subscription points.
pub struct DealerSession {
    current: RwLock<Option<Arc<Dealer>>>,
    messages_tx: broadcast::Sender<MessageFrame>,
    requests_tx: broadcast::Sender<RequestFrame>,
    connection_state_tx: watch::Sender<ConnectionState>,
    connection_state_rx: watch::Receiver<ConnectionState>,
}

impl DealerSession {
    /// Starts the reconnect loop on `spawner` and returns a handle
    /// immediately (the first connection attempt happens in the background;
    /// observe [`Self::connection_state`] to know when it succeeds).
    pub fn start(
        resolver: Arc<dyn DealerResolver>,
        session: Arc<Session>,
        heartbeat_interval: Duration,
        pong_timeout: Duration,
        reconnect_initial: Duration,
        reconnect_multiplier: u32,
        reconnect_max: Duration,
        events: Arc<dyn EventEmitter>,
        spawner: Arc<dyn TaskSpawner>,
    ) -> Arc<Self> {
        let (messages_tx, _) = broadcast::channel(DEALER_MESSAGE_CHANNEL_CAPACITY);
        let (requests_tx, _) = broadcast::channel(DEALER_REQUEST_CHANNEL_CAPACITY);
        let (connection_state_tx, connection_state_rx) = watch::channel(ConnectionState::Disconnected);

        let dealer_session = Arc::new(Self {
            current: RwLock::new(None),
            messages_tx,
            requests_tx,
            connection_state_tx,
            connection_state_rx,
        });

        let loop_session = dealer_session.clone();
        let loop_spawner = spawner.clone();
        spawner.spawn(async move {
            loop_session
                .run_reconnect_loop(
                    resolver,
                    session,
                    heartbeat_interval,
                    pong_timeout,
                    reconnect_initial,
                    reconnect_multiplier,
                    reconnect_max,
                    events,
                    loop_spawner,
                )
                .await;
        });

        dealer_session
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state_rx.clone()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<MessageFrame> {
        self.messages_tx.subscribe()
    }

    pub fn subscribe_requests(&self) -> broadcast::Receiver<RequestFrame> {
        self.requests_tx.subscribe()
    }

    /// Sends a reply on the currently active dealer, if any.
    pub async fn send_reply(&self, key: &str, success: bool) -> Result<(), DealerError> {
        let dealer = self.current.read().clone();
        match dealer {
            Some(dealer) => dealer.send_reply(key, success).await,
            None => Err(DealerError::ConnectionFailed("no active dealer".into())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_reconnect_loop(
        self: Arc<Self>,
        resolver: Arc<dyn DealerResolver>,
        session: Arc<Session>,
        heartbeat_interval: Duration,
        pong_timeout: Duration,
        reconnect_initial: Duration,
        reconnect_multiplier: u32,
        reconnect_max: Duration,
        events: Arc<dyn EventEmitter>,
        spawner: Arc<dyn TaskSpawner>,
    ) {
        let mut attempt: u32 = 0;
        let mut backoff = reconnect_initial;

        loop {
            let _ = self.connection_state_tx.send(ConnectionState::Connecting);
            match Dealer::connect(
                resolver.as_ref(),
                &session,
                heartbeat_interval,
                pong_timeout,
                spawner.as_ref(),
            )
            .await
            {
                Ok(dealer) => {
                    log::info!("dealer: connected");
                    attempt = 0;
                    backoff = reconnect_initial;
                    *self.current.write() = Some(dealer.clone());
                    let _ = self.connection_state_tx.send(ConnectionState::Connected);
                    events.emit_connection(ConnectionEvent::StateChanged(ConnectionState::Connected));

                    self.forward_until_disconnected(&dealer).await;

                    *self.current.write() = None;
                    let _ = self.connection_state_tx.send(ConnectionState::Disconnected);
                    events.emit_connection(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
                }
                Err(e) => {
                    log::warn!("dealer: connection attempt failed: {e}");
                }
            }

            attempt += 1;
            let delay = backoff;
            backoff = (backoff * reconnect_multiplier).min(reconnect_max);
            events.emit_connection(ConnectionEvent::ReconnectScheduled {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
            tokio::time::sleep(delay).await;
        }
    }

    /// Re-broadcasts the live dealer's frames onto our stable channels until
    /// it disconnects, then returns so the outer loop can reconnect.
    async fn forward_until_disconnected(&self, dealer: &Arc<Dealer>) {
        let mut messages = dealer.subscribe_messages();
        let mut requests = dealer.subscribe_requests();
        let mut connection_state = dealer.connection_state();

        loop {
            tokio::select! {
                changed = connection_state.changed() => {
                    if changed.is_err() || *connection_state.borrow() == ConnectionState::Disconnected {
                        return;
                    }
                }
                message = messages.recv() => {
                    match message {
                        Ok(message) => { let _ = self.messages_tx.send(message); }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("dealer: message forwarder lagged by {n} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                request = requests.recv() => {
                    match request {
                        Ok(request) => { let _ = self.requests_tx.send(request); }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("dealer: request forwarder lagged by {n} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }
}
