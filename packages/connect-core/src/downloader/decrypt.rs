//! AES-128-CTR decryption overlay on top of a random-access byte source.
//!
//! The CDN serves every audio file fully encrypted with AES-128 in CTR mode,
//! keyed per-file by the session's [`crate::session::audio_key::AudioKeyManager`]
//! and using a single fixed IV published alongside the rest of Spotify's
//! storage protocol: the counter for byte offset `n` is the IV value
//! interpreted as a 128-bit big-endian integer, advanced by `n / 16` blocks.
//! `ctr::Ctr128BE` already implements exactly that counter arithmetic, so
//! seeking is just `StreamCipherSeek::try_seek`.
//!
//! A region can be marked cleartext up front via `decryption_start_offset`:
//! [`crate::downloader::lazy::LazyProgressiveDownloader`] seeds its backing
//! [`super::progressive::ProgressiveDownloader`] with an already-decrypted
//! head, and that region must pass through
//! unchanged rather than being XORed against a keystream it was never
//! encrypted with.

use std::io;
use std::sync::Arc;

use aes::Aes128;
use async_trait::async_trait;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

use crate::error::{DownloadError, PipelineError};
use crate::model::{AudioKey, NormalizationData, TrackMetadata};
use crate::track_source::TrackStream;

type Cipher = ctr::Ctr128BE<Aes128>;

/// The fixed IV Spotify's desktop/mobile clients use for every AES-128-CTR
/// audio stream, published alongside the rest of the storage protocol.
const AUDIO_AES_IV: [u8; 16] = [
    0x72, 0xe0, 0x67, 0xfb, 0xdd, 0xcb, 0xcf, 0x77, 0xeb, 0xe8, 0xbc, 0x64, 0x3f, 0x63, 0x0d, 0x93,
];

/// A byte-addressable source an [`AudioDecryptStream`] can read ciphertext
/// from. [`super::progressive::ProgressiveDownloader`] is the only
/// implementation today; the trait exists so tests can substitute an
/// in-memory source without spinning up a temp file and background task.
#[async_trait]
pub trait RandomAccessSource: Send + Sync {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DownloadError>;
    async fn prefetch(&self, start: u64, len: u64);
    fn total_len(&self) -> u64;
}

#[async_trait]
impl RandomAccessSource for super::progressive::ProgressiveDownloader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DownloadError> {
        super::progressive::ProgressiveDownloader::read_at(self, offset, buf).await
    }

    async fn prefetch(&self, start: u64, len: u64) {
        super::progressive::ProgressiveDownloader::prefetch(self, start, len).await
    }

    fn total_len(&self) -> u64 {
        super::progressive::ProgressiveDownloader::total_len(self)
    }
}

/// Decrypts a random-access ciphertext source on the fly and presents it as
/// a [`TrackStream`]. Bytes before `decryption_start_offset` are passed
/// through unchanged.
pub struct AudioDecryptStream {
    source: Arc<dyn RandomAccessSource>,
    key: AudioKey,
    decryption_start_offset: u64,
    position: u64,
    metadata: TrackMetadata,
    normalization: NormalizationData,
    format_hint: String,
}

impl AudioDecryptStream {
    pub fn new(
        source: Arc<dyn RandomAccessSource>,
        key: AudioKey,
        decryption_start_offset: u64,
        metadata: TrackMetadata,
        normalization: NormalizationData,
        format_hint: String,
    ) -> Self {
        Self {
            source,
            key,
            decryption_start_offset,
            position: 0,
            metadata,
            normalization,
            format_hint,
        }
    }

    fn cipher(&self) -> Cipher {
        Cipher::new(self.key.as_bytes().into(), &AUDIO_AES_IV.into())
    }

    /// Decrypts `buf` in place, assuming it holds ciphertext read starting at
    /// absolute file offset `offset` (which must be `>= decryption_start_offset`).
    /// The keystream position is the absolute offset itself: the CDN file is
    /// encrypted in its entirety from byte 0, so a cleartext head served by
    /// a separate host doesn't shift where the real ciphertext's keystream
    /// begins.
    fn decrypt_in_place(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut cipher = self.cipher();
        cipher
            .try_seek(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "keystream position overflow"))?;
        cipher.apply_keystream(buf);
        Ok(())
    }
}

#[async_trait]
impl TrackStream for AudioDecryptStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let offset = self.position;

        if offset < self.decryption_start_offset {
            let end = offset
                .saturating_add(buf.len() as u64)
                .min(self.decryption_start_offset);
            let want = (end - offset) as usize;
            let n = self
                .source
                .read_at(offset, &mut buf[..want])
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            self.position += n as u64;
            return Ok(n);
        }

        let n = self
            .source
            .read_at(offset, buf)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        if n == 0 {
            return Ok(0);
        }
        self.decrypt_in_place(offset, &mut buf[..n])?;
        self.position += n as u64;
        Ok(n)
    }

    async fn seek(&mut self, position_bytes: u64) -> Result<(), PipelineError> {
        self.position = position_bytes;
        Ok(())
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.source.total_len())
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
        self.source.prefetch(start, len).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory ciphertext source for exercising the decrypt logic without
    /// a real HTTP fetch.
    struct FixedSource(Mutex<Vec<u8>>);

    #[async_trait]
    impl RandomAccessSource for FixedSource {
        async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DownloadError> {
            let data = self.0.lock().unwrap();
            let offset = offset as usize;
            if offset >= data.len() {
                return Ok(0);
            }
            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }

        async fn prefetch(&self, _start: u64, _len: u64) {}

        fn total_len(&self) -> u64 {
            self.0.lock().unwrap().len() as u64
        }
    }

    fn encrypt(key: &AudioKey, plaintext: &[u8]) -> Vec<u8> {
        let mut cipher = Cipher::new(key.as_bytes().into(), &AUDIO_AES_IV.into());
        let mut out = plaintext.to_vec();
        cipher.apply_keystream(&mut out);
        out
    }

    #[tokio::test]
    async fn decrypts_full_ciphertext_round_trip() {
        let key = AudioKey::from_raw([3u8; 16]);
        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let ciphertext = encrypt(&key, plaintext);

        let source: Arc<dyn RandomAccessSource> = Arc::new(FixedSource(Mutex::new(ciphertext)));
        let mut stream = AudioDecryptStream::new(
            source,
            key,
            0,
            TrackMetadata::default(),
            NormalizationData::default(),
            "ogg".to_string(),
        );

        let mut out = vec![0u8; plaintext.len()];
        let n = stream.read(&mut out).await.unwrap();
        assert_eq!(n, plaintext.len());
        assert_eq!(&out, plaintext);
    }

    #[tokio::test]
    async fn seek_then_read_decrypts_from_the_right_keystream_position() {
        let key = AudioKey::from_raw([9u8; 16]);
        let plaintext = (0u8..=255).collect::<Vec<u8>>();
        let ciphertext = encrypt(&key, &plaintext);

        let source: Arc<dyn RandomAccessSource> = Arc::new(FixedSource(Mutex::new(ciphertext)));
        let mut stream = AudioDecryptStream::new(
            source,
            key,
            0,
            TrackMetadata::default(),
            NormalizationData::default(),
            "ogg".to_string(),
        );

        stream.seek(100).await.unwrap();
        let mut out = vec![0u8; 50];
        let n = stream.read(&mut out).await.unwrap();
        assert_eq!(n, 50);
        assert_eq!(&out, &plaintext[100..150]);
    }

    #[tokio::test]
    async fn cleartext_region_passes_through_unchanged() {
        let key = AudioKey::from_raw([1u8; 16]);
        let cleartext_head = b"HEADBYTES!".to_vec();
        let plaintext_tail = b"rest-of-the-track".to_vec();
        let mut data = cleartext_head.clone();
        data.extend_from_slice(&encrypt(&key, &plaintext_tail));

        let source: Arc<dyn RandomAccessSource> = Arc::new(FixedSource(Mutex::new(data)));
        let mut stream = AudioDecryptStream::new(
            source,
            key,
            cleartext_head.len() as u64,
            TrackMetadata::default(),
            NormalizationData::default(),
            "ogg".to_string(),
        );

        let mut head_out = vec![0u8; cleartext_head.len()];
        let n = stream.read(&mut head_out).await.unwrap();
        assert_eq!(n, cleartext_head.len());
        assert_eq!(head_out, cleartext_head);

        let mut tail_out = vec![0u8; plaintext_tail.len()];
        let n = stream.read(&mut tail_out).await.unwrap();
        assert_eq!(n, plaintext_tail.len());
        assert_eq!(tail_out, plaintext_tail);
    }
}
