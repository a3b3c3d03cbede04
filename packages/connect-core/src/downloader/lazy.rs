//! Instant-start wrapper over [`super::progressive::ProgressiveDownloader`].
//!
//! Playback can begin the moment the head file arrives, well before the
//! audio key and the CDN URL are known (both require a network round trip:
//! an AP packet exchange and a storage-resolve call respectively). A
//! [`LazyProgressiveDownloader`] serves reads out of the head bytes directly
//! and, the first time a read reaches past them, awaits both pending futures
//! and promotes itself to a real decrypted [`super::progressive::ProgressiveDownloader`].
//! Every read after that first promotion reuses the same promoted stream;
//! the promotion itself runs at most once, guarded by a `tokio::sync::Mutex`
//! around an `Option` rather than `tokio::sync::OnceCell` so a promotion
//! that fails (network error) can be retried on the next read instead of
//! poisoning the slot forever.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use super::decrypt::AudioDecryptStream;
use super::progressive::ProgressiveDownloader;
use crate::error::PipelineError;
use crate::events::BroadcastEventBridge;
use crate::model::{AudioKey, NormalizationData, TrackMetadata};
use crate::runtime::TaskSpawner;
use crate::track_source::TrackStream;

/// A future resolving to the audio key, boxed so the struct doesn't need to
/// be generic over the caller's concrete future type.
pub type AudioKeyFuture = Pin<Box<dyn Future<Output = Result<AudioKey, PipelineError>> + Send>>;
/// A future resolving to the CDN URL and total file length.
pub type CdnFuture = Pin<Box<dyn Future<Output = Result<(String, u64), PipelineError>> + Send>>;

struct PendingInit {
    audio_key: AudioKeyFuture,
    cdn: CdnFuture,
}

/// Instant-start track stream: serves `head` bytes immediately, then
/// promotes to a real downloader once the audio key and CDN URL resolve.
pub struct LazyProgressiveDownloader {
    head: Vec<u8>,
    pending: AsyncMutex<Option<PendingInit>>,
    promoted: AsyncMutex<Option<AudioDecryptStream>>,
    position: u64,
    metadata: TrackMetadata,
    normalization: NormalizationData,
    format_hint: String,

    client: reqwest::Client,
    events: Arc<BroadcastEventBridge>,
    spawner: Arc<dyn TaskSpawner>,
    cancel: CancellationToken,
}

impl LazyProgressiveDownloader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        head: Vec<u8>,
        audio_key: AudioKeyFuture,
        cdn: CdnFuture,
        metadata: TrackMetadata,
        normalization: NormalizationData,
        format_hint: String,
        client: reqwest::Client,
        events: Arc<BroadcastEventBridge>,
        spawner: Arc<dyn TaskSpawner>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            head,
            pending: AsyncMutex::new(Some(PendingInit { audio_key, cdn })),
            promoted: AsyncMutex::new(None),
            position: 0,
            metadata,
            normalization,
            format_hint,
            client,
            events,
            spawner,
            cancel,
        }
    }

    /// Awaits the pending audio-key/CDN futures (first caller pays the
    /// latency; every later caller just takes the lock and finds
    /// `promoted` already populated) and builds the decrypted downloader
    /// seeded with the head bytes already served.
    async fn ensure_promoted(&self) -> Result<(), PipelineError> {
        if self.promoted.lock().await.is_some() {
            return Ok(());
        }

        let init = self.pending.lock().await.take();
        let Some(init) = init else {
            // Another caller is mid-promotion or already finished; wait for
            // the promoted slot to be populated.
            return if self.promoted.lock().await.is_some() {
                Ok(())
            } else {
                Err(PipelineError::LoadFailed("stream promotion already in progress".to_string()))
            };
        };

        let (key_result, cdn_result) = tokio::join!(init.audio_key, init.cdn);
        let key = key_result?;
        let (cdn_url, total_len) = cdn_result?;

        let downloader = ProgressiveDownloader::with_head(
            self.client.clone(),
            cdn_url,
            total_len,
            self.head.clone(),
            self.events.clone(),
            self.spawner.clone(),
            self.cancel.clone(),
        )
        .await
        .map_err(|e| PipelineError::LoadFailed(e.to_string()))?;

        let stream = AudioDecryptStream::new(
            downloader,
            key,
            self.head.len() as u64,
            self.metadata.clone(),
            self.normalization,
            self.format_hint.clone(),
        );

        *self.promoted.lock().await = Some(stream);
        Ok(())
    }
}

#[async_trait]
impl TrackStream for LazyProgressiveDownloader {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if (self.position as usize) < self.head.len() {
            let offset = self.position as usize;
            let want = buf.len().min(self.head.len() - offset);
            buf[..want].copy_from_slice(&self.head[offset..offset + want]);
            self.position += want as u64;
            return Ok(want);
        }

        self.ensure_promoted()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let mut promoted = self.promoted.lock().await;
        let stream = promoted.as_mut().expect("promotion just succeeded");
        stream.seek(self.position).await.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let n = stream.read(buf).await?;
        self.position += n as u64;
        Ok(n)
    }

    async fn seek(&mut self, position_bytes: u64) -> Result<(), PipelineError> {
        self.position = position_bytes;
        if let Some(stream) = self.promoted.lock().await.as_mut() {
            stream.seek(position_bytes).await?;
        }
        Ok(())
    }

    fn total_len(&self) -> Option<u64> {
        None
    }

    fn metadata(&self) -> &TrackMetadata {
        &self.metadata
    }

    fn normalization(&self) -> NormalizationData {
        self.normalization
    }

    fn format_hint(&self) -> &str {
        &self.format_hint
    }

    fn can_seek(&self) -> bool {
        true
    }

    async fn prefetch_for_seek(&self, start: u64, len: u64) {
        if let Some(stream) = self.promoted.lock().await.as_ref() {
            stream.prefetch_for_seek(start, len).await;
        }
        // Still in the head-bytes phase: nothing to prefetch, the
        // eventual promotion will fetch from wherever reads land.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SpotifyItemType;
    use crate::runtime::TokioSpawner;
    use ctr::cipher::{KeyIvInit, StreamCipher};
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const TEST_IV: [u8; 16] = [
        0x72, 0xe0, 0x67, 0xfb, 0xdd, 0xcb, 0xcf, 0x77, 0xeb, 0xe8, 0xbc, 0x64, 0x3f, 0x63, 0x0d, 0x93,
    ];

    fn encrypt(key: &AudioKey, plaintext: &[u8]) -> Vec<u8> {
        let mut cipher = ctr::Ctr128BE::<aes::Aes128>::new(key.as_bytes().into(), &TEST_IV.into());
        let mut out = plaintext.to_vec();
        cipher.apply_keystream(&mut out);
        out
    }

    async fn spawn_body_server(body: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _: Result<(), Infallible> = async {
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.write_all(&body).await;
                        Ok(())
                    }
                    .await;
                });
            }
        });
        addr
    }

    #[allow(unused)]
    fn _unused(_x: SpotifyItemType) {}

    #[tokio::test]
    async fn serves_head_bytes_without_touching_pending_futures() {
        let head = b"HEAD-BYTES".to_vec();
        let never: AudioKeyFuture = Box::pin(async { unreachable!("must not resolve yet") });
        let never_cdn: CdnFuture = Box::pin(async { unreachable!("must not resolve yet") });

        let mut stream = LazyProgressiveDownloader::new(
            head.clone(),
            never,
            never_cdn,
            TrackMetadata::default(),
            NormalizationData::default(),
            "ogg".to_string(),
            reqwest::Client::new(),
            Arc::new(BroadcastEventBridge::new(16)),
            Arc::new(TokioSpawner::current()),
            CancellationToken::new(),
        );

        let mut buf = vec![0u8; head.len()];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, head.len());
        assert_eq!(buf, head);
    }

    #[tokio::test]
    async fn reading_past_head_promotes_and_decrypts() {
        let key = AudioKey::from_raw([4u8; 16]);
        let head = b"HEAD".to_vec();
        let tail_plain = b"tail-of-the-file".to_vec();

        let mut full_plain = head.clone();
        full_plain.extend_from_slice(&tail_plain);
        let full_cipher = encrypt(&key, &full_plain);
        let tail_cipher = full_cipher[head.len()..].to_vec();

        let addr = spawn_body_server(tail_cipher).await;
        let url = format!("http://{addr}/audio");
        let total_len = full_plain.len() as u64;

        let audio_key: AudioKeyFuture = Box::pin(async move { Ok(key) });
        let cdn: CdnFuture = Box::pin(async move { Ok((url, total_len)) });

        let cancel = CancellationToken::new();
        let mut stream = LazyProgressiveDownloader::new(
            head.clone(),
            audio_key,
            cdn,
            TrackMetadata::default(),
            NormalizationData::default(),
            "ogg".to_string(),
            reqwest::Client::new(),
            Arc::new(BroadcastEventBridge::new(16)),
            Arc::new(TokioSpawner::current()),
            cancel.clone(),
        );

        let mut head_buf = vec![0u8; head.len()];
        stream.read(&mut head_buf).await.unwrap();
        assert_eq!(head_buf, head);

        let mut tail_buf = vec![0u8; tail_plain.len()];
        let mut read_total = 0;
        while read_total < tail_buf.len() {
            let n = stream.read(&mut tail_buf[read_total..]).await.unwrap();
            assert!(n > 0);
            read_total += n;
        }
        assert_eq!(tail_buf, tail_plain);

        cancel.cancel();
    }
}
