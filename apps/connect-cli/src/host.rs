//! Minimal host-side implementations of the capability traits connect-core
//! leaves out of scope: the OAuth/AP handshake and the `ClusterUpdate`
//! protobuf codec. This CLI is a thin front-end, not a full
//! Spotify client stack, so it supplies the simplest implementation that
//! lets the engine run against a pre-obtained access token; a production
//! host would replace these with a real OAuth client and an AP connection.

use async_trait::async_trait;
use connect_core::playback_state::{ClusterUpdateDecoder, ClusterUpdatePayload};
use connect_core::session::{ApPacket, ApTransport, Credentials, RefreshedToken, TokenRefresher};
use connect_core::error::{PlaybackStateError, SessionError};

/// Re-serves the access token the credentials blob already carries.
///
/// A real host exchanges a reusable credentials blob for a fresh access
/// token via Spotify's login endpoint; that exchange is the out-of-scope
/// "AP handshake". This CLI only supports the simpler case of
/// a directly-supplied, already-valid access token.
pub struct StaticTokenRefresher;

#[async_trait]
impl TokenRefresher for StaticTokenRefresher {
    async fn refresh(&self, credentials: &Credentials) -> Result<RefreshedToken, SessionError> {
        match credentials {
            Credentials::AccessToken { token, expires_in } => Ok(RefreshedToken {
                access_token: token.clone(),
                ttl: *expires_in,
                country_code: None,
                account_type: Default::default(),
            }),
            Credentials::Reusable(_) => Err(SessionError::TokenRefreshFailed(
                "connect-cli only supports a pre-obtained access token; supply one via \
                 credentials_path prefixed \"access_token:\""
                    .to_string(),
            )),
        }
    }
}

/// No AP transport: AudioKey requests always fail. A real host maintains
/// the long-lived AP TCP session this stands in for; without it, the
/// engine can still play tracks whose head file covers enough bytes to be
/// interesting for inspection, but the main CDN body can never be decrypted.
pub struct NullApTransport;

#[async_trait]
impl ApTransport for NullApTransport {
    async fn send_packet(&self, _packet_type: u8, _payload: Vec<u8>) -> Result<(), SessionError> {
        Err(SessionError::NotConnected)
    }

    async fn recv_packet(&self) -> Option<ApPacket> {
        None
    }
}

/// No `ClusterUpdate` protobuf codec: every cluster update is reported
/// undecodable and dropped, exactly like any other malformed inbound frame.
/// A real host plugs in its protobuf decoder here.
pub struct NullClusterUpdateDecoder;

#[async_trait]
impl ClusterUpdateDecoder for NullClusterUpdateDecoder {
    async fn decode(&self, _payload: &[u8]) -> Result<ClusterUpdatePayload, PlaybackStateError> {
        Err(PlaybackStateError::DecodeFailed(
            "connect-cli does not implement the ClusterUpdate protobuf codec".to_string(),
        ))
    }
}
