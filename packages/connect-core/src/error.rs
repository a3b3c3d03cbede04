//! Centralized error types for the connect-core engine.
//!
//! Each subsystem defines its own `thiserror` enum; [`EngineError`] is the
//! umbrella type the bootstrap layer and the CLI front-end deal in. The
//! [`ErrorCode`] trait gives every error a stable machine-readable code,
//! independent of its `Display` message, for logging and host integration.

use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;
}

/// Session-level errors: credentials, access-token refresh, AP transport.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("access token refresh failed: {0}")]
    TokenRefreshFailed(String),
}

impl ErrorCode for SessionError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotConnected => "session_not_connected",
            Self::AuthFailed(_) => "session_auth_failed",
            Self::TokenRefreshFailed(_) => "session_token_refresh_failed",
        }
    }
}

/// Dealer (WebSocket control plane) errors.
#[derive(Debug, Error)]
pub enum DealerError {
    #[error("dealer host resolution failed")]
    ResolveFailed,

    #[error("dealer connection failed: {0}")]
    ConnectionFailed(String),

    #[error("dealer heartbeat timed out waiting for pong")]
    HeartbeatTimeout,

    #[error("dealer message error: {0}")]
    MessageError(String),
}

impl DealerError {
    /// Transient dealer errors are worth a reconnect attempt; none of the
    /// current variants are terminal, reconnection always retries.
    pub fn is_transient(&self) -> bool {
        true
    }
}

impl ErrorCode for DealerError {
    fn code(&self) -> &'static str {
        match self {
            Self::ResolveFailed => "dealer_resolve_failed",
            Self::ConnectionFailed(_) => "dealer_connection_failed",
            Self::HeartbeatTimeout => "dealer_heartbeat_timeout",
            Self::MessageError(_) => "dealer_message_error",
        }
    }
}

/// AudioKey request/response errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AudioKeyError {
    #[error("session is not connected")]
    NotConnected,

    #[error("server returned an audio key error (code {0})")]
    KeyError(u16),

    #[error("timed out waiting for audio key")]
    Timeout,

    #[error("malformed audio key response")]
    MalformedResponse,

    #[error("unexpected packet type {0:#04x} while awaiting audio key")]
    UnexpectedPacket(u8),
}

impl ErrorCode for AudioKeyError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotConnected => "audio_key_not_connected",
            Self::KeyError(_) => "audio_key_error",
            Self::Timeout => "audio_key_timeout",
            Self::MalformedResponse => "audio_key_malformed_response",
            Self::UnexpectedPacket(_) => "audio_key_unexpected_packet",
        }
    }
}

/// Head-file fetch errors. Always non-fatal to the caller: the load falls
/// through to the no-head path on any of these.
#[derive(Debug, Error)]
pub enum HeadFileError {
    #[error("head file http error: {0}")]
    HttpError(String),

    #[error("head file network error: {0}")]
    NetworkError(String),

    #[error("head file request timed out")]
    Timeout,
}

impl ErrorCode for HeadFileError {
    fn code(&self) -> &'static str {
        match self {
            Self::HttpError(_) => "head_file_http_error",
            Self::NetworkError(_) => "head_file_network_error",
            Self::Timeout => "head_file_timeout",
        }
    }
}

/// Errors talking to Spotify's spclient (metadata, extended-metadata,
/// PutState, storage-resolve).
#[derive(Debug, Error)]
pub enum SpClientError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("rate limited")]
    RateLimited,

    #[error("server error: {0}")]
    ServerError(String),
}

impl SpClientError {
    /// Mirrors [`DownloadError::is_transient`]: 5xx, 429, and plain I/O
    /// failures are worth retrying locally; 401/404 are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::ServerError(_))
    }
}

impl ErrorCode for SpClientError {
    fn code(&self) -> &'static str {
        match self {
            Self::RequestFailed(_) => "spclient_request_failed",
            Self::Unauthorized => "spclient_unauthorized",
            Self::NotFound => "spclient_not_found",
            Self::RateLimited => "spclient_rate_limited",
            Self::ServerError(_) => "spclient_server_error",
        }
    }
}

/// Errors surfaced by the progressive downloader's range fetches.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("http error: {0}")]
    Http(String),

    #[error("http status {0}")]
    HttpStatus(u16),

    #[error("request timed out")]
    Timeout,

    #[error("io error: {0}")]
    Io(String),
}

impl DownloadError {
    /// 5xx, 429, timeouts, and I/O errors are retried locally with
    /// [`crate::protocol_constants::RANGE_FETCH_RETRY_DELAYS_SECS`]; any
    /// other status fails immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout | Self::Io(_) => true,
            Self::HttpStatus(code) => *code == 429 || *code == 503,
        }
    }
}

impl ErrorCode for DownloadError {
    fn code(&self) -> &'static str {
        match self {
            Self::Http(_) => "download_http_error",
            Self::HttpStatus(_) => "download_http_status",
            Self::Timeout => "download_timeout",
            Self::Io(_) => "download_io_error",
        }
    }
}

/// AudioPipeline operation errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to load track: {0}")]
    LoadFailed(String),

    #[error("stream does not support seeking")]
    SeekNotSupported,

    #[error("no track source can handle this uri")]
    NoSource,

    #[error("decoder error: {0}")]
    DecoderError(String),
}

impl ErrorCode for PipelineError {
    fn code(&self) -> &'static str {
        match self {
            Self::LoadFailed(_) => "pipeline_load_failed",
            Self::SeekNotSupported => "pipeline_seek_not_supported",
            Self::NoSource => "pipeline_no_source",
            Self::DecoderError(_) => "pipeline_decoder_error",
        }
    }
}

/// Remote cluster mirror errors (`PlaybackState`). The `ClusterUpdate`
/// protobuf itself is out of scope; this is the failure a host-supplied
/// decoder reports, treated the same as any other malformed inbound frame
/// (logged and dropped, never fatal).
#[derive(Debug, Error)]
pub enum PlaybackStateError {
    #[error("failed to decode cluster update: {0}")]
    DecodeFailed(String),
}

impl ErrorCode for PlaybackStateError {
    fn code(&self) -> &'static str {
        match self {
            Self::DecodeFailed(_) => "playback_state_decode_failed",
        }
    }
}

/// Engine-wide error type aggregating every subsystem error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("dealer error: {0}")]
    Dealer(#[from] DealerError),

    #[error("audio key error: {0}")]
    AudioKey(#[from] AudioKeyError),

    #[error("head file error: {0}")]
    HeadFile(#[from] HeadFileError),

    #[error("spclient error: {0}")]
    SpClient(#[from] SpClientError),

    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("playback state error: {0}")]
    PlaybackState(#[from] PlaybackStateError),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ErrorCode for EngineError {
    fn code(&self) -> &'static str {
        match self {
            Self::Session(e) => e.code(),
            Self::Dealer(e) => e.code(),
            Self::AudioKey(e) => e.code(),
            Self::HeadFile(e) => e.code(),
            Self::SpClient(e) => e.code(),
            Self::Download(e) => e.code(),
            Self::Pipeline(e) => e.code(),
            Self::PlaybackState(e) => e.code(),
            Self::Configuration(_) => "configuration_error",
        }
    }
}

/// Convenient Result alias for engine-wide operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_error_transience() {
        assert!(DownloadError::HttpStatus(503).is_transient());
        assert!(DownloadError::HttpStatus(429).is_transient());
        assert!(!DownloadError::HttpStatus(404).is_transient());
        assert!(DownloadError::Timeout.is_transient());
    }

    #[test]
    fn spclient_error_transience() {
        assert!(SpClientError::RateLimited.is_transient());
        assert!(SpClientError::ServerError("boom".into()).is_transient());
        assert!(!SpClientError::NotFound.is_transient());
        assert!(!SpClientError::Unauthorized.is_transient());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(AudioKeyError::Timeout.code(), "audio_key_timeout");
        assert_eq!(
            EngineError::from(AudioKeyError::Timeout).code(),
            "audio_key_timeout"
        );
    }
}
