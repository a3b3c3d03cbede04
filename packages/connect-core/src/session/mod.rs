//! Session: credentials, access-token refresh, AP transport, AudioKey requests.
//!
//! `Session` is the exclusive owner of credentials, the AP transport, and
//! the [`AudioKeyManager`]. The OAuth exchange
//! itself and the AP handshake are out of scope; this module
//! depends on a [`TokenRefresher`] and an [`ApTransport`] as interface
//! contracts a host supplies once it has completed them.

pub mod ap_transport;
pub mod audio_key;
pub mod credentials;

pub use ap_transport::{ApPacket, ApTransport};
pub use audio_key::AudioKeyManager;
pub use credentials::{AccessTokenCache, Credentials};

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::SessionError;
use crate::model::{AudioKey, FileId, SpotifyId};

/// Device identity presented to Spotify when connecting.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
}

/// Exchanges [`Credentials`] for a fresh access token. Implemented by the
/// host once it owns the OAuth/AP handshake.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, credentials: &Credentials) -> Result<RefreshedToken, SessionError>;
}

/// The result of a successful token refresh.
pub struct RefreshedToken {
    pub access_token: String,
    pub ttl: std::time::Duration,
    /// ISO 3166-1 alpha-2 country code Spotify reports for this account.
    pub country_code: Option<String>,
    pub account_type: AccountType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccountType {
    #[default]
    Free,
    Premium,
}

/// Deduplicates concurrent refreshes: only one refresh is ever in flight,
/// every other caller awaits its result.
struct RefreshGate {
    in_flight: Mutex<bool>,
    done: Notify,
}

impl RefreshGate {
    fn new() -> Self {
        Self {
            in_flight: Mutex::new(false),
            done: Notify::new(),
        }
    }

    /// Returns `true` if the caller won the race and must perform the
    /// refresh itself (and call [`Self::finish`] when done); `false` if the
    /// caller should wait on [`Self::wait`] for the winner to finish.
    fn try_start(&self) -> bool {
        let mut flag = self.in_flight.lock();
        if *flag {
            false
        } else {
            *flag = true;
            true
        }
    }

    fn finish(&self) {
        *self.in_flight.lock() = false;
        self.done.notify_waiters();
    }

    async fn wait(&self) {
        self.done.notified().await;
    }
}

/// Owns everything needed to act as an authenticated Spotify device:
/// credentials, the cached access token, the AP transport, and the
/// AudioKeyManager built atop it.
pub struct Session {
    device: DeviceConfig,
    credentials: Mutex<Credentials>,
    token_cache: AccessTokenCache,
    refresh_gate: RefreshGate,
    refresher: Arc<dyn TokenRefresher>,
    transport: Arc<dyn ApTransport>,
    audio_keys: Arc<AudioKeyManager>,
    country_code: Mutex<Option<String>>,
    account_type: Mutex<AccountType>,
}

impl Session {
    pub fn new(
        device: DeviceConfig,
        credentials: Credentials,
        refresher: Arc<dyn TokenRefresher>,
        transport: Arc<dyn ApTransport>,
    ) -> Arc<Self> {
        let audio_keys = Arc::new(AudioKeyManager::new(transport.clone()));
        Arc::new(Self {
            device,
            credentials: Mutex::new(credentials),
            token_cache: AccessTokenCache::new(),
            refresh_gate: RefreshGate::new(),
            refresher,
            transport,
            audio_keys,
            country_code: Mutex::new(None),
            account_type: Mutex::new(AccountType::default()),
        })
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn audio_keys(&self) -> &Arc<AudioKeyManager> {
        &self.audio_keys
    }

    /// Replaces the active credentials (e.g. after the host re-authenticates).
    pub fn connect(&self, credentials: Credentials) {
        *self.credentials.lock() = credentials;
        self.token_cache.clear();
    }

    /// Returns a valid access token, refreshing if the cached one is stale
    /// or absent. Concurrent callers share a single in-flight refresh.
    pub async fn get_access_token(&self) -> Result<String, SessionError> {
        if let Some(token) = self.token_cache.get() {
            return Ok(token);
        }

        if self.refresh_gate.try_start() {
            let result = self.do_refresh().await;
            self.refresh_gate.finish();
            return result;
        }

        self.refresh_gate.wait().await;
        self.token_cache
            .get()
            .ok_or_else(|| SessionError::TokenRefreshFailed("concurrent refresh failed".into()))
    }

    async fn do_refresh(&self) -> Result<String, SessionError> {
        let credentials = self.credentials.lock().clone();
        let refreshed = self.refresher.refresh(&credentials).await?;
        self.token_cache.set(refreshed.access_token.clone(), refreshed.ttl);
        *self.country_code.lock() = refreshed.country_code;
        *self.account_type.lock() = refreshed.account_type;
        Ok(refreshed.access_token)
    }

    pub fn country_code(&self) -> Option<String> {
        self.country_code.lock().clone()
    }

    pub fn account_type(&self) -> AccountType {
        *self.account_type.lock()
    }

    /// Sends a raw AP packet of the given type.
    pub async fn send_packet(&self, packet_type: u8, payload: Vec<u8>) -> Result<(), SessionError> {
        self.transport.send_packet(packet_type, payload).await
    }

    pub async fn request_audio_key(
        &self,
        track_id: SpotifyId,
        file_id: FileId,
    ) -> Result<AudioKey, crate::error::AudioKeyError> {
        self.audio_keys.request_audio_key(track_id, file_id).await
    }

    /// Gracefully terminates the AP session, cancelling any pending
    /// AudioKey requests first so they fail fast rather than time out.
    pub async fn dispose(&self) {
        self.audio_keys.dispose();
        log::info!("session disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingRefresher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _credentials: &Credentials) -> Result<RefreshedToken, SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(RefreshedToken {
                access_token: "tok".into(),
                ttl: Duration::from_secs(3600),
                country_code: Some("US".into()),
                account_type: AccountType::Premium,
            })
        }
    }

    struct NullTransport;

    #[async_trait]
    impl ApTransport for NullTransport {
        async fn send_packet(&self, _packet_type: u8, _payload: Vec<u8>) -> Result<(), SessionError> {
            Ok(())
        }
        async fn recv_packet(&self) -> Option<ApPacket> {
            None
        }
    }

    fn device() -> DeviceConfig {
        DeviceConfig {
            device_id: "dev".into(),
            device_name: "Test Device".into(),
            device_type: "computer".into(),
        }
    }

    #[tokio::test]
    async fn concurrent_refresh_requests_are_deduplicated() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
        });
        let session = Session::new(
            device(),
            Credentials::Reusable(vec![1, 2, 3]),
            refresher.clone(),
            Arc::new(NullTransport),
        );

        let (a, b) = tokio::join!(session.get_access_token(), session.get_access_token());
        assert_eq!(a.unwrap(), "tok");
        assert_eq!(b.unwrap(), "tok");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn country_and_account_type_reflect_latest_refresh() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
        });
        let session = Session::new(
            device(),
            Credentials::Reusable(vec![]),
            refresher,
            Arc::new(NullTransport),
        );
        session.get_access_token().await.unwrap();
        assert_eq!(session.country_code(), Some("US".to_string()));
        assert_eq!(session.account_type(), AccountType::Premium);
    }
}
