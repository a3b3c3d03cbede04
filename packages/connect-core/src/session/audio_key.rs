//! AudioKey request/response protocol over the AP transport.
//!
//! Uses the same fixed-delay retry table shape as the rest of this crate's
//! transient-failure handling: a short table of delays, with an
//! `is_transient`-style branch deciding whether a failed attempt gets
//! another try.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::AudioKeyError;
use crate::model::{AudioKey, FileId, SpotifyId};
use crate::protocol_constants::{
    AP_PACKET_AES_KEY, AP_PACKET_AES_KEY_ERROR, AP_PACKET_REQUEST_KEY, AUDIO_KEY_RETRY_DELAYS_MS,
    AUDIO_KEY_TIMEOUT_MS,
};
use crate::session::ap_transport::ApTransport;

type PendingSender = oneshot::Sender<Result<AudioKey, AudioKeyError>>;

/// Maintains the mapping from request sequence number to pending promise,
/// and drives the timeout/retry policy around a single logical request.
pub struct AudioKeyManager {
    transport: Arc<dyn ApTransport>,
    next_seq: AtomicU32,
    pending: DashMap<u32, PendingSender>,
    timeout: Duration,
    retry_delays: [Duration; 3],
}

impl AudioKeyManager {
    pub fn new(transport: Arc<dyn ApTransport>) -> Self {
        Self::with_policy(
            transport,
            Duration::from_millis(AUDIO_KEY_TIMEOUT_MS),
            AUDIO_KEY_RETRY_DELAYS_MS.map(Duration::from_millis),
        )
    }

    pub fn with_policy(
        transport: Arc<dyn ApTransport>,
        timeout: Duration,
        retry_delays: [Duration; 3],
    ) -> Self {
        Self {
            transport,
            next_seq: AtomicU32::new(0),
            pending: DashMap::new(),
            timeout,
            retry_delays,
        }
    }

    /// Requests the AES key for `(track_id, file_id)`, retrying up to 3
    /// attempts total on timeout. A server-declared `AesKeyError` is
    /// terminal and is not retried. Each attempt uses a fresh sequence
    /// number.
    pub async fn request_audio_key(
        &self,
        track_id: SpotifyId,
        file_id: FileId,
    ) -> Result<AudioKey, AudioKeyError> {
        for (attempt, delay) in self.retry_delays.iter().enumerate() {
            if !delay.is_zero() {
                tokio::time::sleep(*delay).await;
            }

            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            self.pending.insert(seq, tx);

            let packet = build_request_packet(file_id, track_id, seq);
            if let Err(e) = self.transport.send_packet(AP_PACKET_REQUEST_KEY, packet).await {
                self.pending.remove(&seq);
                return Err(AudioKeyError::NotConnected.tap_log(&e));
            }

            let is_last_attempt = attempt + 1 == self.retry_delays.len();
            match tokio::time::timeout(self.timeout, rx).await {
                Ok(Ok(Ok(key))) => return Ok(key),
                Ok(Ok(Err(e))) => return Err(e),
                Ok(Err(_)) => return Err(AudioKeyError::NotConnected), // disposed mid-flight
                Err(_) => {
                    self.pending.remove(&seq);
                    if is_last_attempt {
                        return Err(AudioKeyError::Timeout);
                    }
                }
            }
        }
        Err(AudioKeyError::Timeout)
    }

    /// Routes an inbound `AesKey`/`AesKeyError` packet to its waiter.
    /// Called from the session's packet dispatch loop.
    pub fn handle_packet(&self, packet_type: u8, payload: &[u8]) {
        if payload.len() < 4 {
            log::trace!("audio key packet too short to carry a sequence number");
            return;
        }
        let seq = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);

        let Some((_, sender)) = self.pending.remove(&seq) else {
            log::trace!("audio key response for unknown or already-resolved seq {seq}");
            return;
        };

        let result = match packet_type {
            AP_PACKET_AES_KEY if payload.len() == 20 => {
                let mut key = [0u8; 16];
                key.copy_from_slice(&payload[4..20]);
                Ok(AudioKey::from_raw(key))
            }
            AP_PACKET_AES_KEY => Err(AudioKeyError::MalformedResponse),
            AP_PACKET_AES_KEY_ERROR if payload.len() == 6 => {
                let code = u16::from_be_bytes([payload[4], payload[5]]);
                Err(AudioKeyError::KeyError(code))
            }
            AP_PACKET_AES_KEY_ERROR => Err(AudioKeyError::MalformedResponse),
            other => Err(AudioKeyError::UnexpectedPacket(other)),
        };

        let _ = sender.send(result);
    }

    /// Cancels every pending request (used on session disposal).
    pub fn dispose(&self) {
        self.pending.clear();
    }
}

/// A 42-byte packet: `file_id(20) ‖ track_id.raw(16) ‖ seq(4 BE) ‖ 0x0000`.
fn build_request_packet(file_id: FileId, track_id: SpotifyId, seq: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(42);
    packet.extend_from_slice(file_id.as_bytes());
    packet.extend_from_slice(&track_id.to_raw());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00]);
    packet
}

trait TapLog {
    fn tap_log(self, err: &impl std::fmt::Display) -> Self;
}

impl TapLog for AudioKeyError {
    fn tap_log(self, err: &impl std::fmt::Display) -> Self {
        log::warn!("failed to send audio key request: {err}");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SpotifyItemType;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    struct MockTransport {
        sent: StdMutex<Vec<(u8, Vec<u8>)>>,
        outbound: StdMutex<Option<mpsc::UnboundedReceiver<(u8, Vec<u8>)>>>,
        inbound_tx: mpsc::UnboundedSender<(u8, Vec<u8>)>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                outbound: StdMutex::new(Some(rx)),
                inbound_tx: tx,
            })
        }
    }

    #[async_trait]
    impl ApTransport for MockTransport {
        async fn send_packet(&self, packet_type: u8, payload: Vec<u8>) -> Result<(), crate::error::SessionError> {
            self.sent.lock().unwrap().push((packet_type, payload));
            Ok(())
        }

        async fn recv_packet(&self) -> Option<crate::session::ap_transport::ApPacket> {
            None
        }
    }

    fn track_id() -> SpotifyId {
        SpotifyId::new(1, SpotifyItemType::Track)
    }

    #[tokio::test]
    async fn first_attempt_succeeds_immediately() {
        let transport = MockTransport::new();
        let manager = Arc::new(AudioKeyManager::with_policy(
            transport.clone(),
            Duration::from_millis(200),
            [Duration::ZERO, Duration::from_millis(10), Duration::from_millis(10)],
        ));

        let m2 = manager.clone();
        let handle = tokio::spawn(async move { m2.request_audio_key(track_id(), FileId::default()).await });

        // Give the request a moment to register its pending sequence, then
        // respond on seq 0.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut payload = 0u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&[7u8; 16]);
        manager.handle_packet(AP_PACKET_AES_KEY, &payload);

        let key = handle.await.unwrap().unwrap();
        assert_eq!(key.as_bytes(), &[7u8; 16]);
    }

    #[tokio::test]
    async fn malformed_response_fails_with_malformed_response() {
        let transport = MockTransport::new();
        let manager = Arc::new(AudioKeyManager::with_policy(
            transport,
            Duration::from_millis(200),
            [Duration::ZERO, Duration::from_millis(10), Duration::from_millis(10)],
        ));

        let m2 = manager.clone();
        let handle = tokio::spawn(async move { m2.request_audio_key(track_id(), FileId::default()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let payload = vec![0u8; 10]; // too short: not 4-byte-seq + 16-byte key
        manager.handle_packet(AP_PACKET_AES_KEY, &payload);

        assert_eq!(handle.await.unwrap(), Err(AudioKeyError::MalformedResponse));
    }

    #[tokio::test]
    async fn timeout_then_success_on_third_attempt() {
        let transport = MockTransport::new();
        let manager = Arc::new(AudioKeyManager::with_policy(
            transport,
            Duration::from_millis(30),
            [Duration::ZERO, Duration::from_millis(5), Duration::from_millis(5)],
        ));

        let m2 = manager.clone();
        let handle = tokio::spawn(async move { m2.request_audio_key(track_id(), FileId::default()).await });

        // Let the first two attempts (seq 0, seq 1) time out silently, then
        // answer the third (seq 2).
        tokio::time::sleep(Duration::from_millis(90)).await;
        let mut payload = 2u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&[9u8; 16]);
        manager.handle_packet(AP_PACKET_AES_KEY, &payload);

        let key = handle.await.unwrap().unwrap();
        assert_eq!(key.as_bytes(), &[9u8; 16]);
    }
}
