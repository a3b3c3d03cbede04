//! HTTP boundary to Spotify's `spclient`: metadata, extended-metadata,
//! PutState, and storage-resolve.
//!
//! Protobuf message definitions and JSON wire helpers are explicitly out of
//! scope: this module exposes each endpoint as a capability on
//! the [`SpClient`] trait, parameterized with plain Rust structs, so the
//! engine's components depend on an interface contract rather than a wire
//! format. [`HttpSpClient`] is a default implementation suitable for a host
//! that has its own protobuf/JSON codec to plug in at the edges; as shipped
//! it speaks a JSON body over a single shared `reqwest::Client`, pooling
//! connections across every caller.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SpClientError;
use crate::model::{FileId, SpotifyId};

/// An audio encoding available for a track, as listed by track metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioFormat {
    OggVorbis96,
    OggVorbis160,
    OggVorbis320,
    Mp3256,
    Mp3320,
    Aac24,
    Aac48,
}

impl AudioFormat {
    pub fn is_ogg_vorbis(self) -> bool {
        matches!(self, Self::OggVorbis96 | Self::OggVorbis160 | Self::OggVorbis320)
    }
}

/// Requested playback quality; each tier prefers a specific format order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioQuality {
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

impl AudioQuality {
    /// Preference-ordered list of formats to try for this quality tier.
    pub fn preferred_formats(self) -> &'static [AudioFormat] {
        match self {
            Self::Low => &[AudioFormat::OggVorbis96],
            Self::Normal => &[AudioFormat::OggVorbis160, AudioFormat::OggVorbis96],
            Self::High => &[AudioFormat::OggVorbis320, AudioFormat::OggVorbis160],
            Self::VeryHigh => &[
                AudioFormat::OggVorbis320,
                AudioFormat::Aac48,
                AudioFormat::OggVorbis160,
            ],
        }
    }
}

/// One selectable encoding of a track, as returned by metadata.
#[derive(Debug, Clone)]
pub struct AudioFile {
    pub file_id: FileId,
    pub format: AudioFormat,
}

/// Track (or episode) metadata plus its selectable files and any
/// alternative tracks to recurse into if none of `files` is selectable.
#[derive(Debug, Clone)]
pub struct TrackMetadataResponse {
    pub metadata: crate::model::TrackMetadata,
    pub files: Vec<AudioFile>,
    pub alternatives: Vec<TrackMetadataResponse>,
    /// Present when playback should delegate to the HTTP track source
    /// (episodes with an externally hosted audio file).
    pub external_url: Option<String>,
}

/// Response to a storage-resolve request: at least one CDN URL for range
/// fetches against the selected file.
#[derive(Debug, Clone)]
pub struct StorageResolveResponse {
    pub cdn_urls: Vec<String>,
}

/// The reason a `PutState` is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutStateReason {
    NewConnection,
    NewDevice,
    PlayerStateChanged,
    VolumeChanged,
    BecameInactive,
}

/// The device-state snapshot PUT to the cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutStateRequest {
    pub message_id: u64,
    pub reason: PutStateReason,
    pub is_active: bool,
    pub volume: u16,
    pub player_state: Option<PlayerStateSnapshot>,
}

/// The subset of local playback state mirrored into a `PutState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerStateSnapshot {
    pub track_uri: String,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub is_playing: bool,
    pub is_paused: bool,
}

/// Capability boundary for every `spclient` HTTP call the engine makes.
#[async_trait]
pub trait SpClient: Send + Sync {
    async fn put_state(
        &self,
        device_id: &str,
        connection_id: &str,
        access_token: &str,
        request: &PutStateRequest,
    ) -> Result<(), SpClientError>;

    async fn fetch_track_metadata(
        &self,
        id: SpotifyId,
        access_token: &str,
    ) -> Result<TrackMetadataResponse, SpClientError>;

    async fn fetch_episode_metadata(
        &self,
        id: SpotifyId,
        access_token: &str,
    ) -> Result<TrackMetadataResponse, SpClientError>;

    /// The batched extended-metadata request: the primary metadata path,
    /// carrying the full audio-file list in one round trip. Callers fall
    /// back to [`Self::fetch_track_metadata`]/[`Self::fetch_episode_metadata`]
    /// when this fails or returns no files.
    async fn fetch_extended_metadata(
        &self,
        id: SpotifyId,
        access_token: &str,
    ) -> Result<TrackMetadataResponse, SpClientError>;

    async fn resolve_storage(
        &self,
        file_id: FileId,
        access_token: &str,
    ) -> Result<StorageResolveResponse, SpClientError>;
}

/// Default [`SpClient`] backed by a shared `reqwest::Client`.
pub struct HttpSpClient {
    client: reqwest::Client,
    spclient_host: String,
    country: Option<String>,
    catalogue: &'static str,
}

impl HttpSpClient {
    pub fn new(client: reqwest::Client, spclient_host: String) -> Self {
        Self {
            client,
            spclient_host,
            country: None,
            catalogue: "premium",
        }
    }

    pub fn with_country(mut self, country: Option<String>) -> Self {
        self.country = country;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("https://{}{}", self.spclient_host, path)
    }

    fn status_to_error(status: reqwest::StatusCode) -> SpClientError {
        match status.as_u16() {
            401 => SpClientError::Unauthorized,
            404 => SpClientError::NotFound,
            429 => SpClientError::RateLimited,
            500..=599 => SpClientError::ServerError(status.to_string()),
            other => SpClientError::RequestFailed(format!("unexpected status {other}")),
        }
    }
}

#[async_trait]
impl SpClient for HttpSpClient {
    async fn put_state(
        &self,
        device_id: &str,
        connection_id: &str,
        access_token: &str,
        request: &PutStateRequest,
    ) -> Result<(), SpClientError> {
        let url = self.endpoint(&format!("/connect-state/v1/devices/{device_id}"));
        let response = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .header("X-Spotify-Connection-Id", connection_id)
            .json(request)
            .send()
            .await
            .map_err(|e| SpClientError::RequestFailed(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_to_error(response.status()))
        }
    }

    async fn fetch_track_metadata(
        &self,
        id: SpotifyId,
        access_token: &str,
    ) -> Result<TrackMetadataResponse, SpClientError> {
        let url = self.endpoint(&format!("/metadata/4/track/{}", id.to_base16()));
        let mut request = self.client.get(url).bearer_auth(access_token);
        if let Some(country) = &self.country {
            request = request.header("country", country).header("catalogue", self.catalogue);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SpClientError::RequestFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::status_to_error(response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| SpClientError::RequestFailed(e.to_string()))
    }

    async fn fetch_episode_metadata(
        &self,
        id: SpotifyId,
        access_token: &str,
    ) -> Result<TrackMetadataResponse, SpClientError> {
        let url = self.endpoint(&format!("/metadata/4/episode/{}", id.to_base62()));
        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| SpClientError::RequestFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::status_to_error(response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| SpClientError::RequestFailed(e.to_string()))
    }

    async fn fetch_extended_metadata(
        &self,
        id: SpotifyId,
        access_token: &str,
    ) -> Result<TrackMetadataResponse, SpClientError> {
        let url = self.endpoint("/extended-metadata/v0/extended-metadata");
        let mut request = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(&ExtendedMetadataRequest {
                entity_uris: &[id.to_uri()],
            });
        if let Some(country) = &self.country {
            request = request.header("country", country).header("catalogue", self.catalogue);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SpClientError::RequestFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::status_to_error(response.status()));
        }
        let batch: BatchedExtensionResponse = response
            .json()
            .await
            .map_err(|e| SpClientError::RequestFailed(e.to_string()))?;
        batch
            .tracks
            .into_iter()
            .next()
            .ok_or_else(|| SpClientError::NotFound)
    }

    async fn resolve_storage(
        &self,
        file_id: FileId,
        access_token: &str,
    ) -> Result<StorageResolveResponse, SpClientError> {
        let url = self.endpoint(&format!("/storage-resolve/v2/files/audio/interactive/11/{file_id}"));
        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| SpClientError::RequestFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::status_to_error(response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| SpClientError::RequestFailed(e.to_string()))
    }
}

// `TrackMetadataResponse` and friends need (de)serialization for the
// default JSON-bodied `HttpSpClient`; implemented by hand rather than
// derived because `crate::model::TrackMetadata` intentionally has no
// serde dependency (it is not a wire type anywhere else in the engine).
impl Serialize for TrackMetadataResponse {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawTrackMetadataResponse::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TrackMetadataResponse {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(RawTrackMetadataResponse::deserialize(deserializer)?.into())
    }
}

#[derive(Serialize, Deserialize)]
struct RawAudioFile {
    file_id: String,
    format: String,
}

/// The batched entity request body: a list of entity URIs, standing in
/// for the protobuf request this endpoint actually expects on the wire.
#[derive(Serialize)]
struct ExtendedMetadataRequest<'a> {
    entity_uris: &'a [String],
}

/// Standing in for the protobuf `BatchedExtensionResponse`.
#[derive(Deserialize)]
struct BatchedExtensionResponse {
    #[serde(default)]
    tracks: Vec<TrackMetadataResponse>,
}

#[derive(Serialize, Deserialize)]
struct RawTrackMetadataResponse {
    uri: String,
    title: String,
    artists: Vec<String>,
    album: String,
    album_artist: String,
    duration_ms: u32,
    track_number: u32,
    disc_number: u32,
    year: Option<u32>,
    genre: Option<String>,
    image_url: Option<String>,
    files: Vec<RawAudioFile>,
    #[serde(default)]
    alternatives: Vec<RawTrackMetadataResponse>,
    external_url: Option<String>,
}

fn format_to_str(format: AudioFormat) -> &'static str {
    match format {
        AudioFormat::OggVorbis96 => "OGG_VORBIS_96",
        AudioFormat::OggVorbis160 => "OGG_VORBIS_160",
        AudioFormat::OggVorbis320 => "OGG_VORBIS_320",
        AudioFormat::Mp3256 => "MP3_256",
        AudioFormat::Mp3320 => "MP3_320",
        AudioFormat::Aac24 => "AAC_24",
        AudioFormat::Aac48 => "AAC_48",
    }
}

fn str_to_format(s: &str) -> Option<AudioFormat> {
    Some(match s {
        "OGG_VORBIS_96" => AudioFormat::OggVorbis96,
        "OGG_VORBIS_160" => AudioFormat::OggVorbis160,
        "OGG_VORBIS_320" => AudioFormat::OggVorbis320,
        "MP3_256" => AudioFormat::Mp3256,
        "MP3_320" => AudioFormat::Mp3320,
        "AAC_24" => AudioFormat::Aac24,
        "AAC_48" => AudioFormat::Aac48,
        _ => return None,
    })
}

impl From<&TrackMetadataResponse> for RawTrackMetadataResponse {
    fn from(value: &TrackMetadataResponse) -> Self {
        let m = &value.metadata;
        Self {
            uri: m.uri.clone(),
            title: m.title.clone(),
            artists: m.artists.clone(),
            album: m.album.clone(),
            album_artist: m.album_artist.clone(),
            duration_ms: m.duration_ms,
            track_number: m.track_number,
            disc_number: m.disc_number,
            year: m.year,
            genre: m.genre.clone(),
            image_url: m.image_url.clone(),
            files: value
                .files
                .iter()
                .map(|f| RawAudioFile {
                    file_id: f.file_id.to_hex(),
                    format: format_to_str(f.format).to_string(),
                })
                .collect(),
            alternatives: value.alternatives.iter().map(RawTrackMetadataResponse::from).collect(),
            external_url: value.external_url.clone(),
        }
    }
}

impl From<RawTrackMetadataResponse> for TrackMetadataResponse {
    fn from(raw: RawTrackMetadataResponse) -> Self {
        Self {
            metadata: crate::model::TrackMetadata {
                uri: raw.uri,
                title: raw.title,
                artists: raw.artists,
                album: raw.album,
                album_artist: raw.album_artist,
                duration_ms: raw.duration_ms,
                track_number: raw.track_number,
                disc_number: raw.disc_number,
                year: raw.year,
                genre: raw.genre,
                image_url: raw.image_url,
                replay_gain: None,
            },
            files: raw
                .files
                .into_iter()
                .filter_map(|f| {
                    Some(AudioFile {
                        file_id: FileId::from_hex(&f.file_id)?,
                        format: str_to_format(&f.format)?,
                    })
                })
                .collect(),
            alternatives: raw.alternatives.into_iter().map(TrackMetadataResponse::from).collect(),
            external_url: raw.external_url,
        }
    }
}

impl Serialize for StorageResolveResponse {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Raw<'a> {
            cdnurl: &'a [String],
        }
        Raw { cdnurl: &self.cdn_urls }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StorageResolveResponse {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            cdnurl: Vec<String>,
        }
        Ok(Self {
            cdn_urls: Raw::deserialize(deserializer)?.cdnurl,
        })
    }
}

/// Selects the best-matching audio file for `quality`, trying each format
/// in the quality's preference list, then any Ogg Vorbis file, then the
/// first file, then recursing into alternatives.
pub fn select_audio_file(track: &TrackMetadataResponse, quality: AudioQuality) -> Option<AudioFile> {
    for format in quality.preferred_formats() {
        if let Some(file) = track.files.iter().find(|f| f.format == *format) {
            return Some(file.clone());
        }
    }
    if let Some(file) = track.files.iter().find(|f| f.format.is_ogg_vorbis()) {
        return Some(file.clone());
    }
    if let Some(file) = track.files.first() {
        return Some(file.clone());
    }
    track.alternatives.iter().find_map(|alt| select_audio_file(alt, quality))
}

/// Shared type alias used across the track-source layer.
pub type SharedSpClient = Arc<dyn SpClient>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TrackMetadata;

    fn file(format: AudioFormat) -> AudioFile {
        AudioFile {
            file_id: FileId::from_raw([1u8; 20]),
            format,
        }
    }

    fn track(files: Vec<AudioFile>, alternatives: Vec<TrackMetadataResponse>) -> TrackMetadataResponse {
        TrackMetadataResponse {
            metadata: TrackMetadata::default(),
            files,
            alternatives,
            external_url: None,
        }
    }

    #[test]
    fn prefers_exact_quality_match() {
        let t = track(
            vec![file(AudioFormat::OggVorbis96), file(AudioFormat::OggVorbis320)],
            vec![],
        );
        let selected = select_audio_file(&t, AudioQuality::High).unwrap();
        assert_eq!(selected.format, AudioFormat::OggVorbis320);
    }

    #[test]
    fn falls_back_to_any_ogg_vorbis() {
        let t = track(vec![file(AudioFormat::OggVorbis96)], vec![]);
        let selected = select_audio_file(&t, AudioQuality::VeryHigh).unwrap();
        assert_eq!(selected.format, AudioFormat::OggVorbis96);
    }

    #[test]
    fn falls_back_to_first_file_when_no_vorbis() {
        let t = track(vec![file(AudioFormat::Aac24)], vec![]);
        let selected = select_audio_file(&t, AudioQuality::High).unwrap();
        assert_eq!(selected.format, AudioFormat::Aac24);
    }

    #[test]
    fn recurses_into_alternatives_when_no_files() {
        let alt = track(vec![file(AudioFormat::OggVorbis160)], vec![]);
        let t = track(vec![], vec![alt]);
        let selected = select_audio_file(&t, AudioQuality::Normal).unwrap();
        assert_eq!(selected.format, AudioFormat::OggVorbis160);
    }

    #[test]
    fn nothing_selectable_is_none() {
        let t = track(vec![], vec![]);
        assert!(select_audio_file(&t, AudioQuality::Normal).is_none());
    }
}
