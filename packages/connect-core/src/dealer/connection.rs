//! The dealer WebSocket connection: resolve, connect, read loop, heartbeat.
//!
//! An outbound `tokio-tungstenite` client built around a `tokio::select!`
//! over the heartbeat interval and inbound frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::frame::{encode_reply, parse_frame, DealerFrame, MessageFrame, RequestFrame, PONG_FRAME};
use crate::error::DealerError;
use crate::model::ConnectionState;
use crate::protocol_constants::{
    DEALER_MESSAGE_CHANNEL_CAPACITY, DEALER_PIPE_PAUSE_BYTES, DEALER_PIPE_RESUME_BYTES,
    DEALER_PONG_TIMEOUT_SECS, DEALER_REQUEST_CHANNEL_CAPACITY,
};
use crate::session::Session;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Resolves dealer hostnames via Spotify's AP resolver. The default
/// implementation lives in `crate::spclient`; this trait exists so tests
/// can substitute a fixed host list.
#[async_trait]
pub trait DealerResolver: Send + Sync {
    async fn resolve_dealer_hosts(&self) -> Result<Vec<String>, DealerError>;
}

/// A single authenticated dealer WebSocket connection.
///
/// Owns the socket exclusively: one reader task, one writer behind a mutex.
/// `ConnectState`, `CommandHandler`, and `PlaybackState` subscribe to
/// [`Self::subscribe_messages`] / [`Self::subscribe_requests`] but never
/// write to the socket directly.
pub struct Dealer {
    write: Mutex<futures::stream::SplitSink<WsStream, WsMessage>>,
    connection_state_tx: watch::Sender<ConnectionState>,
    connection_state_rx: watch::Receiver<ConnectionState>,
    messages_tx: broadcast::Sender<MessageFrame>,
    requests_tx: broadcast::Sender<RequestFrame>,
    last_pong_at: Arc<AtomicU64>,
}

impl Dealer {
    /// Resolves, authenticates, and connects to the dealer, then spawns the
    /// read loop and heartbeat on the given spawner. Tries each resolved
    /// host in order; fails with [`DealerError::ResolveFailed`] if the
    /// resolver returns no candidates, or [`DealerError::ConnectionFailed`]
    /// if every candidate fails.
    pub async fn connect(
        resolver: &dyn DealerResolver,
        session: &Arc<Session>,
        heartbeat_interval: Duration,
        pong_timeout: Duration,
        spawner: &dyn crate::runtime::TaskSpawner,
    ) -> Result<Arc<Self>, DealerError> {
        let hosts = resolver.resolve_dealer_hosts().await?;
        if hosts.is_empty() {
            return Err(DealerError::ResolveFailed);
        }

        let token = session
            .get_access_token()
            .await
            .map_err(|e| DealerError::ConnectionFailed(e.to_string()))?;

        let mut last_error = None;
        for host in &hosts {
            let url = format!("wss://{host}/?access_token={token}");
            match tokio_tungstenite::connect_async(&url).await {
                Ok((stream, _response)) => {
                    return Ok(Self::from_stream(stream, heartbeat_interval, pong_timeout, spawner));
                }
                Err(e) => {
                    log::warn!("dealer: connect to {host} failed: {e}");
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(DealerError::ConnectionFailed(
            last_error.unwrap_or_else(|| "no candidate hosts".to_string()),
        ))
    }

    fn from_stream(
        stream: WsStream,
        heartbeat_interval: Duration,
        pong_timeout: Duration,
        spawner: &dyn crate::runtime::TaskSpawner,
    ) -> Arc<Self> {
        let (write, read) = stream.split();
        let (connection_state_tx, connection_state_rx) = watch::channel(ConnectionState::Connected);
        let (messages_tx, _) = broadcast::channel(DEALER_MESSAGE_CHANNEL_CAPACITY);
        let (requests_tx, _) = broadcast::channel(DEALER_REQUEST_CHANNEL_CAPACITY);

        let dealer = Arc::new(Self {
            write: Mutex::new(write),
            connection_state_tx,
            connection_state_rx,
            messages_tx,
            requests_tx,
            last_pong_at: Arc::new(AtomicU64::new(crate::utils::now_millis())),
        });

        let read_dealer = dealer.clone();
        spawner.spawn(async move {
            read_dealer.run_read_loop(read).await;
        });

        let heartbeat_dealer = dealer.clone();
        spawner.spawn(async move {
            heartbeat_dealer
                .run_heartbeat(heartbeat_interval, pong_timeout)
                .await;
        });

        dealer
    }

    /// Current connection state; late subscribers immediately observe the
    /// latest value.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state_rx.clone()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<MessageFrame> {
        self.messages_tx.subscribe()
    }

    pub fn subscribe_requests(&self) -> broadcast::Receiver<RequestFrame> {
        self.requests_tx.subscribe()
    }

    /// Sends a reply for a request frame previously observed on
    /// [`Self::subscribe_requests`]. Every request must be replied to, even
    /// on application-level failure (`success: false`).
    pub async fn send_reply(&self, key: &str, success: bool) -> Result<(), DealerError> {
        self.send_text(encode_reply(key, success)).await
    }

    async fn send_text(&self, text: String) -> Result<(), DealerError> {
        let mut write = self.write.lock().await;
        write
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| DealerError::MessageError(e.to_string()))
    }

    async fn run_read_loop(
        self: Arc<Self>,
        mut read: futures::stream::SplitStream<WsStream>,
    ) {
        // A byte-budget gate approximating the back-pressured pipe (pause
        // ~1 MiB outstanding, resume ~512 KiB): frames are dispatched to
        // subscribers synchronously here (single consumer loop), so the
        // budget tracks bytes not yet handed to a subscriber via the
        // broadcast channel's internal buffer, bounding pathological frame
        // floods even though delivery itself is channel-capacity bounded.
        let pending = Arc::new(AtomicU64::new(0));
        let resume_notify = Arc::new(Notify::new());

        while let Some(message) = read.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("dealer: websocket error: {e}");
                    break;
                }
            };

            let text = match message {
                WsMessage::Text(text) => text.to_string(),
                WsMessage::Close(_) => {
                    log::info!("dealer: server closed the connection");
                    break;
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_) | WsMessage::Frame(_) => {
                    continue;
                }
            };

            let len = text.len() as u64;
            if pending.fetch_add(len, Ordering::SeqCst) + len > DEALER_PIPE_PAUSE_BYTES as u64 {
                log::trace!("dealer: inbound pipe over pause threshold, waiting for drain");
                while pending.load(Ordering::SeqCst) > DEALER_PIPE_RESUME_BYTES as u64 {
                    resume_notify.notified().await;
                }
            }

            self.dispatch(&text).await;
            pending.fetch_sub(len, Ordering::SeqCst);
            resume_notify.notify_waiters();
        }

        let _ = self.connection_state_tx.send(ConnectionState::Disconnected);
    }

    async fn dispatch(&self, text: &str) {
        match parse_frame(text) {
            Some(DealerFrame::Ping) => {
                if let Err(e) = self.send_text(PONG_FRAME.to_string()).await {
                    log::warn!("dealer: failed to send pong: {e}");
                }
            }
            Some(DealerFrame::Pong) => {
                self.last_pong_at
                    .store(crate::utils::now_millis(), Ordering::SeqCst);
            }
            Some(DealerFrame::Message(message)) => {
                if self.messages_tx.send(message).is_err() {
                    log::trace!("dealer: no message subscribers");
                }
            }
            Some(DealerFrame::Request(request)) => {
                if self.requests_tx.send(request).is_err() {
                    log::trace!("dealer: no request subscribers");
                }
            }
            None => {
                // Already logged by parse_frame; never poisons the stream.
            }
        }
    }

    async fn run_heartbeat(self: Arc<Self>, interval: Duration, pong_timeout: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            if self.connection_state_rx.borrow().clone() != ConnectionState::Connected {
                return;
            }

            let sent_at = crate::utils::now_millis();
            if self.send_text(r#"{"type":"ping"}"#.to_string()).await.is_err() {
                log::warn!("dealer: failed to send heartbeat ping, treating connection as dead");
                let _ = self.connection_state_tx.send(ConnectionState::Disconnected);
                return;
            }

            tokio::time::sleep(pong_timeout).await;
            let last_pong = self.last_pong_at.load(Ordering::SeqCst);
            if last_pong < sent_at {
                log::warn!("dealer: heartbeat timeout, no pong within {pong_timeout:?}");
                let _ = self.connection_state_tx.send(ConnectionState::Disconnected);
                return;
            }
        }
    }

    /// Marks the connection disconnected, e.g. from external orchestration.
    pub fn mark_disconnected(&self) {
        let _ = self.connection_state_tx.send(ConnectionState::Disconnected);
    }
}

/// Default [`DealerResolver`] backed by Spotify's `apresolve` endpoint.
pub struct ApResolveDealerResolver {
    client: reqwest::Client,
}

impl ApResolveDealerResolver {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DealerResolver for ApResolveDealerResolver {
    async fn resolve_dealer_hosts(&self) -> Result<Vec<String>, DealerError> {
        #[derive(serde::Deserialize)]
        struct ApResolveResponse {
            #[serde(default)]
            dealer: Vec<String>,
        }

        let response = self
            .client
            .get(crate::protocol_constants::APRESOLVE_URL)
            .send()
            .await
            .map_err(|e| DealerError::ConnectionFailed(e.to_string()))?;

        let body: ApResolveResponse = response
            .json()
            .await
            .map_err(|e| DealerError::ConnectionFailed(e.to_string()))?;

        Ok(body.dealer)
    }
}
