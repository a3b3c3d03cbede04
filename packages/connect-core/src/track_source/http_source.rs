//! HTTP-hosted track source: buffered playback of a plain URL. When an
//! episode carries an external URL, loading delegates here instead of the
//! Spotify CDN path, pre-buffering 128 KiB before playback can start.
//!
//! Unlike [`super::spotify::SpotifyTrackSource`], there is no audio key: the
//! CDN serves cleartext bytes directly, so this is a thin wrapper over
//! [`crate::downloader::progressive::ProgressiveDownloader`] with no
//! decryption overlay.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::downloader::http_fetch::fetch_content_length;
use crate::downloader::progressive::ProgressiveDownloader;
use crate::error::PipelineError;
use crate::events::BroadcastEventBridge;
use crate::model::{NormalizationData, TrackMetadata};
use crate::protocol_constants::HTTP_SOURCE_PREBUFFER_BYTES;
use crate::runtime::TaskSpawner;

use super::{TrackSource, TrackStream};

/// A [`TrackStream`] backed directly by a [`ProgressiveDownloader`], with no
/// decryption overlay.
struct HttpTrackStream {
    downloader: Arc<ProgressiveDownloader>,
    position: u64,
    metadata: TrackMetadata,
    format_hint: String,
}

#[async_trait]
impl TrackStream for HttpTrackStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .downloader
            .read_at(self.position, buf)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.position += n as u64;
        Ok(n)
    }

    async fn seek(&mut self, position_bytes: u64) -> Result<(), PipelineError> {
        self.position = position_bytes;
        Ok(())
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.downloader.total_len())
    }

    fn metadata(&self) -> &TrackMetadata {
        &self.metadata
    }

    fn normalization(&self) -> NormalizationData {
        NormalizationData::default()
    }

    fn format_hint(&self) -> &str {
        &self.format_hint
    }

    fn can_seek(&self) -> bool {
        true
    }

    async fn prefetch_for_seek(&self, start: u64, len: u64) {
        self.downloader.prefetch(start, len).await;
    }
}

/// Handles any `http://`/`https://` URI by streaming it through a
/// [`ProgressiveDownloader`], pre-buffering [`HTTP_SOURCE_PREBUFFER_BYTES`]
/// before returning so playback doesn't stall on the very first read.
pub struct HttpTrackSource {
    client: reqwest::Client,
    events: Arc<BroadcastEventBridge>,
    spawner: Arc<dyn TaskSpawner>,
    cancel: CancellationToken,
}

impl HttpTrackSource {
    pub fn new(
        client: reqwest::Client,
        events: Arc<BroadcastEventBridge>,
        spawner: Arc<dyn TaskSpawner>,
        cancel: CancellationToken,
    ) -> Self {
        Self { client, events, spawner, cancel }
    }
}

#[async_trait]
impl TrackSource for HttpTrackSource {
    fn can_handle(&self, uri: &str) -> bool {
        uri.starts_with("http://") || uri.starts_with("https://")
    }

    async fn load(&self, uri: &str) -> Result<Box<dyn TrackStream>, PipelineError> {
        let total_len = fetch_content_length(&self.client, uri)
            .await
            .map_err(|e| PipelineError::LoadFailed(e.to_string()))?;

        let downloader = ProgressiveDownloader::new(
            self.client.clone(),
            uri.to_string(),
            total_len,
            self.events.clone(),
            self.spawner.clone(),
            self.cancel.child_token(),
        )
        .await
        .map_err(|e| PipelineError::LoadFailed(e.to_string()))?;

        let prebuffer = (HTTP_SOURCE_PREBUFFER_BYTES as u64).min(total_len);
        downloader
            .read_at(0, &mut vec![0u8; prebuffer as usize])
            .await
            .map_err(|e| PipelineError::LoadFailed(e.to_string()))?;

        Ok(Box::new(HttpTrackStream {
            downloader,
            position: 0,
            metadata: TrackMetadata { uri: uri.to_string(), ..Default::default() },
            format_hint: "mp3".to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TokioSpawner;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_fixed_server(body: Vec<u8>) -> SocketAddr {
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

    #[tokio::test]
    async fn can_handle_only_http_uris() {
        let source = HttpTrackSource::new(
            reqwest::Client::new(),
            Arc::new(BroadcastEventBridge::new(16)),
            Arc::new(TokioSpawner::current()),
            CancellationToken::new(),
        );
        assert!(source.can_handle("https://example.com/a.mp3"));
        assert!(!source.can_handle("spotify:track:abc"));
    }

    #[tokio::test]
    async fn load_prebuffers_and_serves_bytes() {
        let body = vec![7u8; 4096];
        let addr = spawn_fixed_server(body.clone()).await;
        let uri = format!("http://{addr}/episode.mp3");

        let source = HttpTrackSource::new(
            reqwest::Client::new(),
            Arc::new(BroadcastEventBridge::new(16)),
            Arc::new(TokioSpawner::current()),
            CancellationToken::new(),
        );

        let mut stream = source.load(&uri).await.unwrap();
        let mut out = vec![0u8; 100];
        let n = stream.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], &body[..n]);
    }
}
