//! The progressive downloader: random-access storage over a CDN URL, backed
//! by a pre-allocated temp file and a [`RangeSet`].
//!
//! Two locks guard two different things: `fetch_mutex` serializes the
//! decision to fetch a gap (so two concurrent reads of an overlapping gap
//! don't both hit the CDN), while `file` guards the actual file handle used
//! for both writes (after a fetch) and reads (for the caller). The
//! background filler and on-demand reads both go through
//! [`ProgressiveDownloader::ensure_downloaded`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use super::http_fetch::fetch_range;
use super::throughput::ThroughputTracker;
use crate::error::DownloadError;
use crate::events::{BroadcastEventBridge, DownloadEvent, EventEmitter};
use crate::model::{ByteRange, RangeSet};
use crate::protocol_constants::{BACKGROUND_FILL_IDLE_MS, BACKGROUND_FILL_YIELD_MS, MAX_CHUNK_BYTES, MIN_CHUNK_BYTES};
use crate::runtime::TaskSpawner;

pub struct ProgressiveDownloader {
    client: reqwest::Client,
    cdn_url: String,
    file: AsyncMutex<tokio::fs::File>,
    _temp: tempfile::NamedTempFile,
    total_len: u64,
    ranges: Mutex<RangeSet>,
    fetch_mutex: AsyncMutex<()>,
    throughput: Mutex<ThroughputTracker>,
    read_cursor: AtomicU64,
    events: Arc<BroadcastEventBridge>,
    cancel: CancellationToken,
}

impl ProgressiveDownloader {
    /// Creates the backing temp file (pre-allocated to `total_len`) and
    /// spawns the background fill task. Returns an `Arc` because the
    /// background task and every `TrackStream` wrapper share ownership.
    pub async fn new(
        client: reqwest::Client,
        cdn_url: String,
        total_len: u64,
        events: Arc<BroadcastEventBridge>,
        spawner: Arc<dyn TaskSpawner>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, DownloadError> {
        let temp = tokio::task::spawn_blocking(move || -> std::io::Result<tempfile::NamedTempFile> {
            let temp = tempfile::NamedTempFile::new()?;
            temp.as_file().set_len(total_len)?;
            Ok(temp)
        })
        .await
        .map_err(|e| DownloadError::Io(e.to_string()))?
        .map_err(|e| DownloadError::Io(e.to_string()))?;

        let std_file = temp.reopen().map_err(|e| DownloadError::Io(e.to_string()))?;
        let file = tokio::fs::File::from_std(std_file);

        let this = Arc::new(Self {
            client,
            cdn_url,
            file: AsyncMutex::new(file),
            _temp: temp,
            total_len,
            ranges: Mutex::new(RangeSet::new()),
            fetch_mutex: AsyncMutex::new(()),
            throughput: Mutex::new(ThroughputTracker::new()),
            read_cursor: AtomicU64::new(0),
            events,
            cancel,
        });

        let background = Arc::clone(&this);
        spawner.spawn(async move {
            background.run_background_fill().await;
        });

        Ok(this)
    }

    /// Wraps a pre-populated downloader around bytes already known: constructs
    /// the store, then seeds the range set and file with `head` before the
    /// background filler starts advancing past it.
    pub async fn with_head(
        client: reqwest::Client,
        cdn_url: String,
        total_len: u64,
        head: Vec<u8>,
        events: Arc<BroadcastEventBridge>,
        spawner: Arc<dyn TaskSpawner>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, DownloadError> {
        let this = Self::new(client, cdn_url, total_len, events, spawner, cancel).await?;
        if !head.is_empty() {
            this.store(0, &head).await?;
        }
        Ok(this)
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn ranges_snapshot(&self) -> RangeSet {
        self.ranges.lock().clone()
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, fetching any
    /// missing range synchronously first. Updates the read cursor the
    /// background filler uses to decide how far ahead to stay.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DownloadError> {
        if offset >= self.total_len {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.total_len - offset) as usize;
        self.read_cursor.store(offset, Ordering::Relaxed);
        self.ensure_downloaded(offset, offset + want as u64).await?;

        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| DownloadError::Io(e.to_string()))?;
        let mut read_total = 0usize;
        while read_total < want {
            let n = file
                .read(&mut buf[read_total..want])
                .await
                .map_err(|e| DownloadError::Io(e.to_string()))?;
            if n == 0 {
                break;
            }
            read_total += n;
        }
        Ok(read_total)
    }

    /// Best-effort prefetch of a byte window;
    /// failures are logged, never propagated, since the caller's next
    /// `read_at` will retry the same gap anyway.
    pub async fn prefetch(&self, start: u64, len: u64) {
        let end = start.saturating_add(len).min(self.total_len);
        if let Err(e) = self.ensure_downloaded(start, end).await {
            log::debug!("prefetch [{start}, {end}) failed, deferring to on-read fetch: {e}");
        }
    }

    async fn ensure_downloaded(&self, start: u64, end: u64) -> Result<(), DownloadError> {
        let end = end.min(self.total_len);
        if start >= end {
            return Ok(());
        }

        let _fetch_guard = self.fetch_mutex.lock().await;
        // Re-check under the fetch lock: a concurrent caller or the
        // background filler may have already closed this gap.
        let gaps = self.ranges.lock().gaps(start, end);
        for gap in gaps {
            self.fetch_and_store(gap, true).await?;
        }
        Ok(())
    }

    /// Fetches one gap and writes it to the file. `expand` widens small
    /// on-demand gaps up to [`MIN_CHUNK_BYTES`] (capped at
    /// [`MAX_CHUNK_BYTES`] and the file end) so a handful of short reads
    /// don't turn into a flurry of tiny range requests; the background
    /// filler passes `expand = false` since its chunks are already sized.
    async fn fetch_and_store(&self, gap: ByteRange, expand: bool) -> Result<(), DownloadError> {
        let fetch_range_bytes = if expand {
            let widened_len = gap.length().max(MIN_CHUNK_BYTES as u64).min(MAX_CHUNK_BYTES as u64);
            let end = (gap.start + widened_len).max(gap.end).min(self.total_len);
            ByteRange::new(gap.start, end)
        } else {
            gap
        };

        let mut retry_count = 0u32;
        let fetched = fetch_range(&self.client, &self.cdn_url, fetch_range_bytes, |err, attempt, will_retry| {
            retry_count = attempt + 1;
            self.events.emit_download(DownloadEvent {
                message: err.to_string(),
                retry_count,
                will_retry,
            });
        })
        .await?;

        self.throughput.lock().observe(fetched.bytes.len() as u64, fetched.elapsed);
        self.store(fetch_range_bytes.start, &fetched.bytes).await?;
        Ok(())
    }

    async fn store(&self, offset: u64, bytes: &[u8]) -> Result<(), DownloadError> {
        if bytes.is_empty() {
            return Ok(());
        }
        {
            let mut file = self.file.lock().await;
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| DownloadError::Io(e.to_string()))?;
            file.write_all(bytes)
                .await
                .map_err(|e| DownloadError::Io(e.to_string()))?;
        }
        self.ranges
            .lock()
            .add(ByteRange::new(offset, offset + bytes.len() as u64));
        Ok(())
    }

    /// Keeps the downloaded region ahead of the read cursor by a target
    /// determined from the observed throughput. Runs for the life of the
    /// downloader; exits when `cancel` fires or the file is fully downloaded.
    async fn run_background_fill(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let cursor = self.read_cursor.load(Ordering::Relaxed);
            let target_ahead = self.throughput.lock().target_ahead_bytes();
            let target_end = cursor.saturating_add(target_ahead).min(self.total_len);

            let ahead_gap = self.ranges.lock().gaps(cursor, target_end).into_iter().next();
            // Nothing ahead of the cursor within the buffer target: wrap to
            // the earliest gap anywhere in the file so regions left behind
            // by a forward seek still get filled in eventually.
            let next_gap = match ahead_gap {
                Some(gap) => Some(gap),
                None => self.ranges.lock().gaps(0, self.total_len).into_iter().next(),
            };

            let Some(gap) = next_gap else {
                return;
            };

            let chunk_end = (gap.start + MAX_CHUNK_BYTES as u64).min(gap.end);
            let chunk = ByteRange::new(gap.start, chunk_end);

            if let Err(e) = self.fetch_and_store(chunk, false).await {
                log::warn!("background fill fetch of [{}, {}) failed: {e}", chunk.start, chunk.end);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(BACKGROUND_FILL_IDLE_MS)) => {}
                    _ = self.cancel.cancelled() => return,
                }
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(BACKGROUND_FILL_YIELD_MS)) => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }
}
