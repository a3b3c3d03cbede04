//! Spotify track/episode source: the instant-start hot path.
//!
//! Implements the exact load sequence: parse the uri, fetch metadata, pick
//! an audio file for the configured [`AudioQuality`], kick off the
//! head-file/audio-key/storage-resolve fetches concurrently, and return as
//! soon as the head file is in hand (or, failing that, once the key and CDN
//! URL both resolve).

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::downloader::decrypt::AudioDecryptStream;
use crate::downloader::lazy::LazyProgressiveDownloader;
use crate::downloader::progressive::ProgressiveDownloader;
use crate::error::PipelineError;
use crate::events::BroadcastEventBridge;
use crate::model::{FileId, NormalizationData, SpotifyId, SpotifyItemType};
use crate::protocol_constants::{NORMALIZATION_OFFSET, NORMALIZATION_SIZE};
use crate::runtime::TaskSpawner;
use crate::session::Session;
use crate::spclient::{select_audio_file, AudioQuality, SharedSpClient, TrackMetadataResponse};

use super::head_file::try_fetch_head_file;
use super::http_source::HttpTrackSource;
use super::{TrackSource, TrackStream};

/// Resolves `spotify:track:<id>` and `spotify:episode:<id>` uris into a
/// decrypted, instant-starting stream.
pub struct SpotifyTrackSource {
    session: Arc<Session>,
    sp_client: SharedSpClient,
    client: reqwest::Client,
    events: Arc<BroadcastEventBridge>,
    spawner: Arc<dyn TaskSpawner>,
    cancel: CancellationToken,
    quality: AudioQuality,
    http_source: Arc<HttpTrackSource>,
}

impl SpotifyTrackSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<Session>,
        sp_client: SharedSpClient,
        client: reqwest::Client,
        events: Arc<BroadcastEventBridge>,
        spawner: Arc<dyn TaskSpawner>,
        cancel: CancellationToken,
        quality: AudioQuality,
        http_source: Arc<HttpTrackSource>,
    ) -> Self {
        Self {
            session,
            sp_client,
            client,
            events,
            spawner,
            cancel,
            quality,
            http_source,
        }
    }

    /// Extended-metadata is the primary path: one batched call returns the
    /// full audio-file list. Falls back to the basic per-type endpoint when
    /// the extended call fails or comes back with no files to select from.
    async fn fetch_metadata(&self, id: SpotifyId, access_token: &str) -> Result<TrackMetadataResponse, PipelineError> {
        match self.sp_client.fetch_extended_metadata(id, access_token).await {
            Ok(track) if !track.files.is_empty() || !track.alternatives.is_empty() => return Ok(track),
            Ok(_) => log::debug!("extended metadata for {id} had no files, falling back to basic metadata"),
            Err(e) => log::debug!("extended metadata fetch failed for {id}, falling back to basic metadata: {e}"),
        }

        let result = match id.item_type() {
            SpotifyItemType::Episode => self.sp_client.fetch_episode_metadata(id, access_token).await,
            _ => self.sp_client.fetch_track_metadata(id, access_token).await,
        };
        result.map_err(|e| PipelineError::LoadFailed(e.to_string()))
    }

    /// Step 4/5/6 of the load sequence, shared between a fresh load and the
    /// loop body once an `access_token` and selected `file_id` are known.
    async fn load_file(
        &self,
        track_id: SpotifyId,
        file_id: FileId,
        metadata: crate::model::TrackMetadata,
        format_hint: String,
    ) -> Result<Box<dyn TrackStream>, PipelineError> {
        let head_future = try_fetch_head_file(&self.client, file_id);

        let audio_keys = self.session.audio_keys().clone();
        let key_future = async move {
            audio_keys
                .request_audio_key(track_id, file_id)
                .await
                .map_err(|e| PipelineError::LoadFailed(e.to_string()))
        };

        let sp_client = self.sp_client.clone();
        let session = self.session.clone();
        let cdn_future = async move {
            let access_token = session
                .get_access_token()
                .await
                .map_err(|e| PipelineError::LoadFailed(e.to_string()))?;
            let resolved = sp_client
                .resolve_storage(file_id, &access_token)
                .await
                .map_err(|e| PipelineError::LoadFailed(e.to_string()))?;
            resolved
                .cdn_urls
                .into_iter()
                .next()
                .ok_or_else(|| PipelineError::LoadFailed("storage-resolve returned no cdn url".to_string()))
        };

        let head = head_future.await;

        if let Some(head) = &head {
            if head.len() >= NORMALIZATION_OFFSET + NORMALIZATION_SIZE {
                let normalization = NormalizationData::parse(head);
                let stream = LazyProgressiveDownloader::new(
                    head.clone(),
                    Box::pin(key_future),
                    Box::pin(async move {
                        let cdn_url = cdn_future.await?;
                        // The CDN length isn't known until the storage
                        // resolve response is paired with a HEAD request;
                        // `ProgressiveDownloader::with_head` sizes itself
                        // off the caller-supplied `total_len`, so resolve it
                        // here alongside the URL rather than as a fourth
                        // concurrent task, since it depends on `cdn_url`.
                        let total_len = crate::downloader::http_fetch::fetch_content_length(
                            &reqwest::Client::new(),
                            &cdn_url,
                        )
                        .await
                        .map_err(|e| PipelineError::LoadFailed(e.to_string()))?;
                        Ok((cdn_url, total_len))
                    }),
                    metadata,
                    normalization,
                    format_hint,
                    self.client.clone(),
                    self.events.clone(),
                    self.spawner.clone(),
                    self.cancel.child_token(),
                );
                return Ok(Box::new(stream));
            }
        }

        let key = key_future.await?;
        let cdn_url = cdn_future.await?;
        let total_len = crate::downloader::http_fetch::fetch_content_length(&self.client, &cdn_url)
            .await
            .map_err(|e| PipelineError::LoadFailed(e.to_string()))?;

        let head_bytes = head.unwrap_or_default();
        let decryption_start_offset = head_bytes.len() as u64;
        let normalization = NormalizationData::parse(&head_bytes);

        let downloader = ProgressiveDownloader::with_head(
            self.client.clone(),
            cdn_url,
            total_len,
            head_bytes,
            self.events.clone(),
            self.spawner.clone(),
            self.cancel.child_token(),
        )
        .await
        .map_err(|e| PipelineError::LoadFailed(e.to_string()))?;

        let stream = AudioDecryptStream::new(downloader, key, decryption_start_offset, metadata, normalization, format_hint);
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl TrackSource for SpotifyTrackSource {
    fn can_handle(&self, uri: &str) -> bool {
        uri.starts_with("spotify:track:") || uri.starts_with("spotify:episode:")
    }

    async fn load(&self, uri: &str) -> Result<Box<dyn TrackStream>, PipelineError> {
        let id = SpotifyId::from_uri(uri).map_err(|e| PipelineError::LoadFailed(e.to_string()))?;

        let access_token = self
            .session
            .get_access_token()
            .await
            .map_err(|e| PipelineError::LoadFailed(e.to_string()))?;

        let track = self.fetch_metadata(id, &access_token).await?;

        if let Some(external_url) = track.external_url.clone() {
            return self.http_source.load(&external_url).await;
        }

        let file = select_audio_file(&track, self.quality).ok_or(PipelineError::NoSource)?;
        let format_hint = if file.format.is_ogg_vorbis() { "ogg" } else { "aac" }.to_string();

        self.load_file(id, file.file_id, track.metadata, format_hint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SessionError, SpClientError};
    use crate::model::TrackMetadata;
    use crate::runtime::TokioSpawner;
    use crate::session::{ApPacket, ApTransport, Credentials, DeviceConfig, RefreshedToken, TokenRefresher};
    use crate::spclient::{AudioFile, AudioFormat, PutStateRequest, SpClient, StorageResolveResponse};
    use std::time::Duration;

    struct NullRefresher;
    #[async_trait]
    impl TokenRefresher for NullRefresher {
        async fn refresh(&self, _credentials: &Credentials) -> Result<RefreshedToken, SessionError> {
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
        async fn send_packet(&self, _packet_type: u8, _payload: Vec<u8>) -> Result<(), SessionError> {
            Ok(())
        }
        async fn recv_packet(&self) -> Option<ApPacket> {
            None
        }
    }

    struct FakeSpClient {
        external_url: Option<String>,
    }

    #[async_trait]
    impl SpClient for FakeSpClient {
        async fn put_state(
            &self,
            _device_id: &str,
            _connection_id: &str,
            _access_token: &str,
            _request: &PutStateRequest,
        ) -> Result<(), SpClientError> {
            Ok(())
        }

        async fn fetch_track_metadata(&self, id: SpotifyId, _access_token: &str) -> Result<TrackMetadataResponse, SpClientError> {
            Ok(TrackMetadataResponse {
                metadata: TrackMetadata { uri: format!("spotify:track:{}", id.to_base62()), ..Default::default() },
                files: vec![AudioFile { file_id: FileId::from_raw([2u8; 20]), format: AudioFormat::OggVorbis160 }],
                alternatives: vec![],
                external_url: self.external_url.clone(),
            })
        }

        async fn fetch_episode_metadata(&self, id: SpotifyId, access_token: &str) -> Result<TrackMetadataResponse, SpClientError> {
            self.fetch_track_metadata(id, access_token).await
        }

        async fn fetch_extended_metadata(&self, id: SpotifyId, access_token: &str) -> Result<TrackMetadataResponse, SpClientError> {
            self.fetch_track_metadata(id, access_token).await
        }

        async fn resolve_storage(&self, _file_id: FileId, _access_token: &str) -> Result<StorageResolveResponse, SpClientError> {
            Ok(StorageResolveResponse { cdn_urls: vec!["http://127.0.0.1:1/unused".to_string()] })
        }
    }

    fn harness(external_url: Option<String>) -> SpotifyTrackSource {
        let session = Session::new(
            DeviceConfig { device_id: "dev".into(), device_name: "Test".into(), device_type: "computer".into() },
            Credentials::Reusable(vec![]),
            Arc::new(NullRefresher),
            Arc::new(NullTransport),
        );
        let events = Arc::new(BroadcastEventBridge::new(16));
        let spawner: Arc<dyn TaskSpawner> = Arc::new(TokioSpawner::current());
        let cancel = CancellationToken::new();
        let http_source = Arc::new(HttpTrackSource::new(reqwest::Client::new(), events.clone(), spawner.clone(), cancel.clone()));

        SpotifyTrackSource::new(
            session,
            Arc::new(FakeSpClient { external_url }),
            reqwest::Client::new(),
            events,
            spawner,
            cancel,
            AudioQuality::Normal,
            http_source,
        )
    }

    #[test]
    fn handles_track_and_episode_uris_only() {
        let source = harness(None);
        assert!(source.can_handle("spotify:track:4iV5W9uYEdYUVa79Axb7Rh"));
        assert!(source.can_handle("spotify:episode:4iV5W9uYEdYUVa79Axb7Rh"));
        assert!(!source.can_handle("spotify:album:4iV5W9uYEdYUVa79Axb7Rh"));
    }

    #[tokio::test]
    async fn episode_with_external_url_delegates_to_http_source() {
        let body = vec![9u8; 512];
        let addr = spawn_body_server(body.clone()).await;
        let url = format!("http://{addr}/ep.mp3");

        let source = harness(Some(url));
        let mut stream = source.load("spotify:episode:4iV5W9uYEdYUVa79Axb7Rh").await.unwrap();
        let mut out = vec![0u8; 100];
        let n = stream.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], &body[..n]);
    }

    async fn spawn_body_server(body: Vec<u8>) -> std::net::SocketAddr {
        use std::convert::Infallible;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let is_head = buf.starts_with(b"HEAD");
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _: Result<(), Infallible> = async {
                        let _ = socket.write_all(response.as_bytes()).await;
                        if !is_head {
                            let _ = socket.write_all(&body).await;
                        }
                        Ok(())
                    }
                    .await;
                });
            }
        });
        addr
    }
}
