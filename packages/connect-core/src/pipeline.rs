//! AudioPipeline: the single owner of "what is playing" on this device.
//!
//! Serializes every playback operation (play, pause, resume, seek,
//! skip-next/prev, shuffle/repeat toggles, stop) through a FIFO work queue
//! so at most one is ever in flight; same-kind operations may coalesce to
//! the latest (only `Seek` does today). Real audio decoding is not this
//! crate's concern: it feeds bytes to a decoder abstraction.
//! [`Decoder`]/[`DecoderSession`] are the capability boundary around it,
//! drawn the same way [`crate::spclient::SpClient`] and
//! [`crate::playback_state::ClusterUpdateDecoder`] draw theirs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::command_handler::{Command, CommandHandler, PlayOptions};
use crate::config::EngineConfig;
use crate::connect_state::ConnectState;
use crate::error::PipelineError;
use crate::events::{EventEmitter, PlaybackEvent};
use crate::model::PlaybackStatus;
use crate::playback_state::PlaybackState;
use crate::protocol_constants::{NOMINAL_BITRATE_KBPS, SEEK_PREFETCH_AFTER_BYTES, SEEK_PREFETCH_BEFORE_BYTES};
use crate::runtime::TaskSpawner;
use crate::spclient::PlayerStateSnapshot;
use crate::track_source::{TrackSourceRegistry, TrackStream};
use crate::utils::now_millis;

/// Begins decoding a stream whose format is `format_hint`, starting its
/// playback clock at `start_position_ms`. A host with a real codec plugs in
/// here; [`NullDecoder`] is the headless default (no audio output, position
/// tracked from bytes consumed at the nominal bitrate).
#[async_trait]
pub trait Decoder: Send + Sync {
    async fn start(&self, format_hint: &str, start_position_ms: u64) -> Result<Box<dyn DecoderSession>, PipelineError>;
}

/// A single decode session, fed bytes by the pipeline's decode loop as they
/// arrive from the loaded [`TrackStream`].
#[async_trait]
pub trait DecoderSession: Send + Sync {
    async fn push(&mut self, chunk: &[u8]) -> Result<(), PipelineError>;
    async fn pause(&mut self);
    async fn resume(&mut self);
    /// Resets the playback clock after the pipeline repositions the stream.
    fn seek(&mut self, position_ms: u64);
    fn position_ms(&self) -> u64;
    async fn stop(&mut self);
}

/// Headless [`Decoder`]: performs no real decoding. Position advances
/// purely from bytes consumed at [`NOMINAL_BITRATE_KBPS`], which is enough
/// to drive position reporting and end-of-track detection without an
/// audio backend.
pub struct NullDecoder;

#[async_trait]
impl Decoder for NullDecoder {
    async fn start(&self, _format_hint: &str, start_position_ms: u64) -> Result<Box<dyn DecoderSession>, PipelineError> {
        Ok(Box::new(NullDecoderSession {
            position_ms: AtomicU64::new(start_position_ms),
            paused: AtomicBool::new(false),
        }))
    }
}

struct NullDecoderSession {
    position_ms: AtomicU64,
    paused: AtomicBool,
}

#[async_trait]
impl DecoderSession for NullDecoderSession {
    async fn push(&mut self, chunk: &[u8]) -> Result<(), PipelineError> {
        if self.paused.load(Ordering::Relaxed) {
            return Ok(());
        }
        let advance_ms = (chunk.len() as u64 * 8) / NOMINAL_BITRATE_KBPS;
        self.position_ms.fetch_add(advance_ms, Ordering::Relaxed);
        Ok(())
    }

    async fn pause(&mut self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    async fn resume(&mut self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    fn seek(&mut self, position_ms: u64) {
        self.position_ms.store(position_ms, Ordering::Relaxed);
    }

    fn position_ms(&self) -> u64 {
        self.position_ms.load(Ordering::Relaxed)
    }

    async fn stop(&mut self) {}
}

/// A queued playback operation. `TrackEnded` is an internal
/// signal raised by the decode loop on natural end-of-stream; it is not a
/// user-facing command but is handled the same way `SkipNext` is.
#[derive(Debug, Clone)]
enum Operation {
    Play {
        uri: String,
        seek_to_ms: Option<u64>,
        options: PlayOptions,
    },
    Pause,
    Resume,
    Seek { position_ms: u64 },
    SkipNext,
    SkipPrev,
    SetShuffling(bool),
    SetRepeatingContext(bool),
    SetRepeatingTrack(bool),
    Stop,
    TrackEnded,
}

/// FIFO queue of [`Operation`]s with same-kind coalescing for `Seek`.
struct WorkQueue {
    items: Mutex<VecDeque<Operation>>,
    notify: Notify,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

impl WorkQueue {
    fn push(&self, op: Operation) {
        let mut items = self.items.lock();
        if matches!(op, Operation::Seek { .. }) {
            if let Some(last @ Operation::Seek { .. }) = items.back_mut() {
                *last = op;
                drop(items);
                self.notify.notify_one();
                return;
            }
        }
        items.push_back(op);
        drop(items);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Operation {
        loop {
            if let Some(op) = self.items.lock().pop_front() {
                return op;
            }
            self.notify.notified().await;
        }
    }
}

/// Estimates a byte offset for `position_ms` from a linear position/duration
/// ratio against the stream's total length. `None`
/// total length (a stream whose size isn't known up front) estimates 0.
fn estimate_byte_offset(position_ms: u64, duration_ms: u64, total_len: Option<u64>) -> u64 {
    let Some(total_len) = total_len else { return 0 };
    if duration_ms == 0 {
        return 0;
    }
    ((position_ms as u128 * total_len as u128) / duration_ms as u128) as u64
}

/// The currently loaded track: the stream the pipeline owns, the decode
/// session built over it, and the cancellation handle for its decode loop.
struct Loaded {
    stream: Box<dyn TrackStream>,
    session: Box<dyn DecoderSession>,
    track_uri: String,
    duration_ms: u64,
    paused: bool,
    decode_cancel: CancellationToken,
}

/// Single owner of "what is playing" on this device. Routes
/// dealer commands and synthesized transfers into its work queue, and
/// exposes the same operations directly for a local UI (the CLI).
pub struct AudioPipeline {
    registry: Arc<TrackSourceRegistry>,
    decoder: Arc<dyn Decoder>,
    command_handler: Arc<CommandHandler>,
    playback_state: Arc<PlaybackState>,
    connect_state: Arc<ConnectState>,
    events: Arc<dyn EventEmitter>,
    spawner: Arc<dyn TaskSpawner>,

    bidirectional_mode: bool,
    position_report_throttle: Duration,
    seek_prefetch_before: u64,
    seek_prefetch_after: u64,

    queue: Arc<WorkQueue>,
    current: AsyncMutex<Option<Loaded>>,
    status: Mutex<PlaybackStatus>,
    shuffling: AtomicBool,
    repeating_context: AtomicBool,
    repeating_track: AtomicBool,
    last_emit_ms: AtomicU64,
    cancel: CancellationToken,
}

impl AudioPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<TrackSourceRegistry>,
        decoder: Arc<dyn Decoder>,
        command_handler: Arc<CommandHandler>,
        playback_state: Arc<PlaybackState>,
        connect_state: Arc<ConnectState>,
        events: Arc<dyn EventEmitter>,
        spawner: Arc<dyn TaskSpawner>,
        config: &EngineConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            decoder,
            command_handler,
            playback_state,
            connect_state,
            events,
            spawner,
            bidirectional_mode: config.bidirectional_mode,
            position_report_throttle: Duration::from_millis(config.position_report_throttle_ms),
            seek_prefetch_before: SEEK_PREFETCH_BEFORE_BYTES as u64,
            seek_prefetch_after: SEEK_PREFETCH_AFTER_BYTES as u64,
            queue: Arc::new(WorkQueue::default()),
            current: AsyncMutex::new(None),
            status: Mutex::new(PlaybackStatus::Stopped),
            shuffling: AtomicBool::new(false),
            repeating_context: AtomicBool::new(false),
            repeating_track: AtomicBool::new(false),
            last_emit_ms: AtomicU64::new(0),
            cancel,
        })
    }

    /// Spawns the queue worker and the dealer-command/transfer bridges.
    pub fn start(self: &Arc<Self>) {
        let queue_worker = self.clone();
        self.spawner.spawn(async move { queue_worker.run_queue().await });

        let command_bridge = self.clone();
        self.spawner.spawn(async move { command_bridge.run_command_bridge().await });

        let transfer_bridge = self.clone();
        self.spawner.spawn(async move { transfer_bridge.run_transfer_bridge().await });
    }

    pub fn status(&self) -> PlaybackStatus {
        *self.status.lock()
    }

    pub fn is_shuffling(&self) -> bool {
        self.shuffling.load(Ordering::SeqCst)
    }

    pub fn is_repeating_context(&self) -> bool {
        self.repeating_context.load(Ordering::SeqCst)
    }

    pub fn is_repeating_track(&self) -> bool {
        self.repeating_track.load(Ordering::SeqCst)
    }

    pub fn play(&self, uri: String) {
        self.queue.push(Operation::Play {
            uri,
            seek_to_ms: None,
            options: PlayOptions::default(),
        });
    }

    pub fn pause(&self) {
        self.queue.push(Operation::Pause);
    }

    pub fn resume(&self) {
        self.queue.push(Operation::Resume);
    }

    pub fn seek(&self, position_ms: u64) {
        self.queue.push(Operation::Seek { position_ms });
    }

    pub fn skip_next(&self) {
        self.queue.push(Operation::SkipNext);
    }

    pub fn skip_prev(&self) {
        self.queue.push(Operation::SkipPrev);
    }

    pub fn stop(&self) {
        self.queue.push(Operation::Stop);
    }

    pub fn set_shuffling(&self, value: bool) {
        self.queue.push(Operation::SetShuffling(value));
    }

    pub fn set_repeating_context(&self, value: bool) {
        self.queue.push(Operation::SetRepeatingContext(value));
    }

    pub fn set_repeating_track(&self, value: bool) {
        self.queue.push(Operation::SetRepeatingTrack(value));
    }

    fn set_status(&self, status: PlaybackStatus) {
        *self.status.lock() = status;
    }

    async fn run_queue(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                op = self.queue.pop() => self.apply(op).await,
            }
        }
    }

    async fn run_command_bridge(self: Arc<Self>) {
        let mut commands = self.command_handler.subscribe();
        loop {
            let envelope = match commands.recv().await {
                Ok(envelope) => envelope,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("pipeline: command stream lagged by {n} frames");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            self.route_command(envelope.command);
        }
    }

    async fn run_transfer_bridge(self: Arc<Self>) {
        let mut transfers = self.playback_state.subscribe_transfers();
        loop {
            match transfers.recv().await {
                Ok(transfer) => {
                    if let Some(uri) = transfer.track_uri {
                        self.queue.push(Operation::Play {
                            uri,
                            seek_to_ms: Some(transfer.position_ms),
                            options: PlayOptions::default(),
                        });
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Translates a decoded dealer command into a queued operation.
    /// `Transfer`/`SetQueue`/`AddToQueue` bypass the queue entirely: they
    /// mutate `PlaybackState`'s queue/transfer machinery directly, which
    /// then feeds back through [`Self::run_transfer_bridge`].
    fn route_command(&self, command: Command) {
        match command {
            Command::Play { context_uri, track_uri, seek_to_ms, skip_to_track_index, options } => {
                if skip_to_track_index.is_some() {
                    log::debug!("pipeline: skip_to_track_index ignored, context-based playback is out of scope");
                }
                // Context-only play commands (no explicit track uri) fall
                // through to the context uri itself; the registry will
                // reject it with NoSource unless a source recognizes it.
                match track_uri.or(context_uri) {
                    Some(uri) => self.queue.push(Operation::Play { uri, seek_to_ms, options }),
                    None => log::warn!("pipeline: play command carried no playable uri"),
                }
            }
            Command::Pause => self.queue.push(Operation::Pause),
            Command::Resume => self.queue.push(Operation::Resume),
            Command::Seek { position_ms } => self.queue.push(Operation::Seek { position_ms }),
            Command::SkipNext => self.queue.push(Operation::SkipNext),
            Command::SkipPrev => self.queue.push(Operation::SkipPrev),
            Command::Shuffle { value } => self.queue.push(Operation::SetShuffling(value)),
            Command::RepeatContext { value } => self.queue.push(Operation::SetRepeatingContext(value)),
            Command::RepeatTrack { value } => self.queue.push(Operation::SetRepeatingTrack(value)),
            Command::Transfer { .. } => self.playback_state.synthesize_transfer_from_command(),
            Command::SetQueue { next_tracks } => {
                self.playback_state
                    .set_queue(next_tracks.into_iter().map(|t| t.uri).collect());
            }
            Command::AddToQueue { track_uri } => self.playback_state.add_to_queue(track_uri),
        }
    }

    async fn apply(self: &Arc<Self>, op: Operation) {
        match op {
            Operation::Play { uri, seek_to_ms, options } => self.do_play(uri, seek_to_ms, options).await,
            Operation::Pause => self.do_pause().await,
            Operation::Resume => self.do_resume().await,
            Operation::Seek { position_ms } => self.do_seek(position_ms).await,
            Operation::SkipNext => self.do_skip(true).await,
            Operation::SkipPrev => self.do_skip(false).await,
            Operation::SetShuffling(v) => self.do_set_option(&self.shuffling, v).await,
            Operation::SetRepeatingContext(v) => self.do_set_option(&self.repeating_context, v).await,
            Operation::SetRepeatingTrack(v) => self.do_set_option(&self.repeating_track, v).await,
            Operation::Stop => self.do_stop().await,
            Operation::TrackEnded => self.do_skip(true).await,
        }
    }

    /// Load protocol: route through the registry, dispose
    /// the previous stream deterministically, hand the new one to the
    /// decoder, and transition to `Playing`.
    async fn do_play(self: &Arc<Self>, uri: String, seek_to_ms: Option<u64>, options: PlayOptions) {
        self.set_status(PlaybackStatus::Loading);

        let decode_cancel = self.cancel.child_token();
        let loaded = match self.load_track(&uri, seek_to_ms.unwrap_or(0), decode_cancel.clone()).await {
            Ok(loaded) => loaded,
            Err(e) => {
                log::warn!("pipeline: failed to load {uri}: {e}");
                self.set_status(PlaybackStatus::Error);
                self.events.emit_playback(PlaybackEvent::LocalStateChanged {
                    track_uri: uri,
                    position_ms: 0,
                    status: PlaybackStatus::Error,
                });
                return;
            }
        };

        if let Some(v) = options.shuffling_context {
            self.shuffling.store(v, Ordering::SeqCst);
        }
        if let Some(v) = options.repeating_context {
            self.repeating_context.store(v, Ordering::SeqCst);
        }
        if let Some(v) = options.repeating_track {
            self.repeating_track.store(v, Ordering::SeqCst);
        }

        let track_uri = loaded.track_uri.clone();
        let duration_ms = loaded.duration_ms;
        let start_position_ms = seek_to_ms.unwrap_or(0);
        *self.current.lock().await = Some(loaded);
        self.set_status(PlaybackStatus::Playing);

        let decode_worker = self.clone();
        self.spawner.spawn(async move { decode_worker.run_decode_loop(decode_cancel).await });

        self.emit_local_state(&track_uri, start_position_ms, duration_ms).await;
    }

    async fn load_track(
        &self,
        uri: &str,
        start_position_ms: u64,
        decode_cancel: CancellationToken,
    ) -> Result<Loaded, PipelineError> {
        if let Some(mut old) = self.current.lock().await.take() {
            old.decode_cancel.cancel();
            old.stream.dispose().await;
            old.session.stop().await;
        }

        let mut stream = self.registry.load(uri).await?;
        let format_hint = stream.format_hint().to_string();
        let duration_ms = stream.metadata().duration_ms as u64;

        if start_position_ms > 0 {
            if !stream.can_seek() {
                return Err(PipelineError::SeekNotSupported);
            }
            let byte_offset = estimate_byte_offset(start_position_ms, duration_ms, stream.total_len());
            stream.seek(byte_offset).await?;
        }

        let session = self.decoder.start(&format_hint, start_position_ms).await?;

        Ok(Loaded {
            stream,
            session,
            track_uri: uri.to_string(),
            duration_ms,
            paused: false,
            decode_cancel,
        })
    }

    /// Reads from the loaded stream and feeds the decoder until
    /// end-of-stream, cancellation, or the track is replaced. Runs once per
    /// load; superseded on the next `Play` via `decode_cancel`.
    async fn run_decode_loop(self: Arc<Self>, decode_cancel: CancellationToken) {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            if decode_cancel.is_cancelled() {
                return;
            }

            let paused = {
                let current = self.current.lock().await;
                match current.as_ref() {
                    Some(loaded) => loaded.paused,
                    None => return,
                }
            };
            if paused {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    _ = decode_cancel.cancelled() => return,
                }
                continue;
            }

            let read_result = {
                let mut current = self.current.lock().await;
                match current.as_mut() {
                    Some(loaded) => loaded.stream.read(&mut buf).await,
                    None => return,
                }
            };

            match read_result {
                Ok(0) => {
                    self.queue.push(Operation::TrackEnded);
                    return;
                }
                Ok(n) => {
                    let report = {
                        let mut current = self.current.lock().await;
                        match current.as_mut() {
                            Some(loaded) => {
                                if let Err(e) = loaded.session.push(&buf[..n]).await {
                                    log::warn!("pipeline: decoder error: {e}");
                                }
                                Some((loaded.track_uri.clone(), loaded.session.position_ms(), loaded.duration_ms))
                            }
                            None => None,
                        }
                    };
                    if let Some((track_uri, position_ms, duration_ms)) = report {
                        self.report_position(&track_uri, position_ms, duration_ms).await;
                    }
                }
                Err(e) => {
                    log::warn!("pipeline: stream read error: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                        _ = decode_cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    async fn do_pause(&self) {
        if self.status() != PlaybackStatus::Playing {
            return;
        }
        let snapshot = {
            let mut current = self.current.lock().await;
            let Some(loaded) = current.as_mut() else { return };
            loaded.session.pause().await;
            loaded.paused = true;
            (loaded.track_uri.clone(), loaded.session.position_ms(), loaded.duration_ms)
        };
        self.set_status(PlaybackStatus::Paused);
        self.emit_local_state(&snapshot.0, snapshot.1, snapshot.2).await;
    }

    async fn do_resume(&self) {
        if self.status() != PlaybackStatus::Paused {
            return;
        }
        let snapshot = {
            let mut current = self.current.lock().await;
            let Some(loaded) = current.as_mut() else { return };
            loaded.session.resume().await;
            loaded.paused = false;
            (loaded.track_uri.clone(), loaded.session.position_ms(), loaded.duration_ms)
        };
        self.set_status(PlaybackStatus::Playing);
        self.emit_local_state(&snapshot.0, snapshot.1, snapshot.2).await;
    }

    /// Seeks entirely within one queued operation, so the externally
    /// observed status never actually leaves `Playing`/`Paused` — the
    /// "returns to pre-seek status" requirement holds
    /// trivially since there is no intermediate state a consumer could
    /// observe.
    async fn do_seek(&self, position_ms: u64) {
        if !matches!(self.status(), PlaybackStatus::Playing | PlaybackStatus::Paused) {
            return;
        }

        let mut current = self.current.lock().await;
        let Some(loaded) = current.as_mut() else { return };
        if !loaded.stream.can_seek() {
            log::warn!("pipeline: seek requested on a non-seekable stream, ignoring");
            return;
        }

        let byte_offset = estimate_byte_offset(position_ms, loaded.duration_ms, loaded.stream.total_len());
        let prefetch_start = byte_offset.saturating_sub(self.seek_prefetch_before);
        loaded
            .stream
            .prefetch_for_seek(prefetch_start, self.seek_prefetch_before + self.seek_prefetch_after)
            .await;

        if let Err(e) = loaded.stream.seek(byte_offset).await {
            log::warn!("pipeline: seek failed: {e}");
            return;
        }
        loaded.session.seek(position_ms);
        let track_uri = loaded.track_uri.clone();
        let duration_ms = loaded.duration_ms;
        drop(current);
        self.emit_local_state(&track_uri, position_ms, duration_ms).await;
    }

    /// Consults `PlaybackState`'s queue, loads the next uri, or stops if
    /// it's exhausted. `PlaybackState` tracks only an upcoming queue, not
    /// playback history: skip-prev has nothing to rewind to and is a logged
    /// no-op.
    async fn do_skip(self: &Arc<Self>, forward: bool) {
        if !forward {
            log::info!("pipeline: skip-prev has no tracked history, ignoring");
            return;
        }
        match self.playback_state.pop_next() {
            Some(uri) => self.do_play(uri, None, PlayOptions::default()).await,
            None => {
                log::info!("pipeline: queue exhausted, stopping");
                self.do_stop().await;
            }
        }
    }

    async fn do_stop(&self) {
        if let Some(mut loaded) = self.current.lock().await.take() {
            loaded.decode_cancel.cancel();
            loaded.stream.dispose().await;
            loaded.session.stop().await;
        }
        self.set_status(PlaybackStatus::Stopped);
        self.events.emit_playback(PlaybackEvent::LocalStateChanged {
            track_uri: String::new(),
            position_ms: 0,
            status: PlaybackStatus::Stopped,
        });
    }

    async fn do_set_option(&self, flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
        let snapshot = {
            let current = self.current.lock().await;
            current
                .as_ref()
                .map(|loaded| (loaded.track_uri.clone(), loaded.session.position_ms(), loaded.duration_ms))
        };
        if let Some((track_uri, position_ms, duration_ms)) = snapshot {
            self.emit_local_state(&track_uri, position_ms, duration_ms).await;
        }
    }

    /// Emits throttled position reports (`POSITION_REPORT_THROTTLE_MS`).
    /// Always emits on a status-changing call site via
    /// [`Self::emit_local_state`] directly; this wrapper only throttles the
    /// decode loop's steady-state position ticks.
    async fn report_position(&self, track_uri: &str, position_ms: u64, duration_ms: u64) {
        let now = now_millis();
        let last = self.last_emit_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.position_report_throttle.as_millis() as u64 {
            return;
        }
        self.last_emit_ms.store(now, Ordering::Relaxed);
        self.emit_local_state(track_uri, position_ms, duration_ms).await;
    }

    async fn emit_local_state(&self, track_uri: &str, position_ms: u64, duration_ms: u64) {
        let status = self.status();
        self.last_emit_ms.store(now_millis(), Ordering::Relaxed);
        self.events.emit_playback(PlaybackEvent::LocalStateChanged {
            track_uri: track_uri.to_string(),
            position_ms,
            status,
        });

        if self.bidirectional_mode {
            self.connect_state
                .put_player_state(PlayerStateSnapshot {
                    track_uri: track_uri.to_string(),
                    position_ms,
                    duration_ms,
                    is_playing: status == PlaybackStatus::Playing,
                    is_paused: status == PlaybackStatus::Paused,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dealer::connection::DealerResolver;
    use crate::dealer::DealerSession;
    use crate::error::{PlaybackStateError, SessionError, SpClientError};
    use crate::events::{ConnectStateEvent, ConnectionEvent, DownloadEvent};
    use crate::model::{FileId, NormalizationData, SpotifyId, TrackMetadata};
    use crate::playback_state::{ClusterUpdateDecoder, ClusterUpdatePayload};
    use crate::runtime::TokioSpawner;
    use crate::session::{ApPacket, ApTransport, Credentials, DeviceConfig, RefreshedToken, Session, TokenRefresher};
    use crate::spclient::{PutStateRequest, SharedSpClient, SpClient, StorageResolveResponse, TrackMetadataResponse};
    use crate::track_source::TrackSource;
    use std::io;

    #[test]
    fn estimate_byte_offset_scales_linearly() {
        assert_eq!(estimate_byte_offset(50_000, 100_000, Some(1000)), 500);
        assert_eq!(estimate_byte_offset(0, 100_000, Some(1000)), 0);
    }

    #[test]
    fn estimate_byte_offset_without_total_len_is_zero() {
        assert_eq!(estimate_byte_offset(50_000, 100_000, None), 0);
    }

    #[test]
    fn work_queue_coalesces_consecutive_seeks() {
        let queue = WorkQueue::default();
        queue.push(Operation::Seek { position_ms: 1000 });
        queue.push(Operation::Seek { position_ms: 2000 });
        let mut items = queue.items.lock();
        assert_eq!(items.len(), 1);
        assert!(matches!(items.pop_front(), Some(Operation::Seek { position_ms: 2000 })));
    }

    #[test]
    fn work_queue_does_not_coalesce_play() {
        let queue = WorkQueue::default();
        queue.push(Operation::Play { uri: "a".into(), seek_to_ms: None, options: PlayOptions::default() });
        queue.push(Operation::Play { uri: "b".into(), seek_to_ms: None, options: PlayOptions::default() });
        assert_eq!(queue.items.lock().len(), 2);
    }

    #[tokio::test]
    async fn null_decoder_session_advances_position_from_bytes() {
        let decoder = NullDecoder;
        let mut session = decoder.start("ogg", 0).await.unwrap();
        session.push(&vec![0u8; 40_000]).await.unwrap();
        assert!(session.position_ms() > 0);
        session.seek(5000);
        assert_eq!(session.position_ms(), 5000);
    }

    struct NullResolver;
    #[async_trait]
    impl DealerResolver for NullResolver {
        async fn resolve_dealer_hosts(&self) -> Result<Vec<String>, crate::error::DealerError> {
            Err(crate::error::DealerError::ResolveFailed)
        }
    }

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

    struct FixedClusterDecoder;
    #[async_trait]
    impl ClusterUpdateDecoder for FixedClusterDecoder {
        async fn decode(&self, _payload: &[u8]) -> Result<ClusterUpdatePayload, PlaybackStateError> {
            unreachable!("no dealer traffic in these tests")
        }
    }

    struct NullSpClient;
    #[async_trait]
    impl SpClient for NullSpClient {
        async fn put_state(
            &self,
            _device_id: &str,
            _connection_id: &str,
            _access_token: &str,
            _request: &PutStateRequest,
        ) -> Result<(), SpClientError> {
            Ok(())
        }
        async fn fetch_track_metadata(&self, _id: SpotifyId, _access_token: &str) -> Result<TrackMetadataResponse, SpClientError> {
            unreachable!("not exercised by these tests")
        }
        async fn fetch_episode_metadata(&self, _id: SpotifyId, _access_token: &str) -> Result<TrackMetadataResponse, SpClientError> {
            unreachable!("not exercised by these tests")
        }
        async fn fetch_extended_metadata(&self, _id: SpotifyId, _access_token: &str) -> Result<TrackMetadataResponse, SpClientError> {
            unreachable!("not exercised by these tests")
        }
        async fn resolve_storage(&self, _file_id: FileId, _access_token: &str) -> Result<StorageResolveResponse, SpClientError> {
            unreachable!("not exercised by these tests")
        }
    }

    #[derive(Default)]
    struct CapturingEmitter {
        playback: Mutex<Vec<PlaybackEvent>>,
    }
    impl EventEmitter for CapturingEmitter {
        fn emit_connection(&self, _event: ConnectionEvent) {}
        fn emit_playback(&self, event: PlaybackEvent) {
            self.playback.lock().push(event);
        }
        fn emit_download(&self, _event: DownloadEvent) {}
        fn emit_connect_state(&self, _event: ConnectStateEvent) {}
    }

    struct FakeTrackStream {
        data: Vec<u8>,
        position: u64,
        metadata: TrackMetadata,
    }

    #[async_trait]
    impl TrackStream for FakeTrackStream {
        async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let offset = self.position as usize;
            if offset >= self.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.data.len() - offset);
            buf[..n].copy_from_slice(&self.data[offset..offset + n]);
            self.position += n as u64;
            Ok(n)
        }

        async fn seek(&mut self, position_bytes: u64) -> Result<(), PipelineError> {
            self.position = position_bytes;
            Ok(())
        }

        fn total_len(&self) -> Option<u64> {
            Some(self.data.len() as u64)
        }

        fn metadata(&self) -> &TrackMetadata {
            &self.metadata
        }

        fn normalization(&self) -> NormalizationData {
            NormalizationData::default()
        }

        fn format_hint(&self) -> &str {
            "ogg"
        }

        fn can_seek(&self) -> bool {
            true
        }
    }

    struct FakeTrackSource;
    #[async_trait]
    impl TrackSource for FakeTrackSource {
        fn can_handle(&self, uri: &str) -> bool {
            uri.starts_with("spotify:track:")
        }
        async fn load(&self, uri: &str) -> Result<Box<dyn TrackStream>, PipelineError> {
            Ok(Box::new(FakeTrackStream {
                data: vec![0u8; 4000],
                position: 0,
                metadata: TrackMetadata {
                    uri: uri.to_string(),
                    duration_ms: 10_000,
                    ..Default::default()
                },
            }))
        }
    }

    fn harness() -> (Arc<AudioPipeline>, Arc<CapturingEmitter>) {
        let captured = Arc::new(CapturingEmitter::default());
        let events: Arc<dyn EventEmitter> = captured.clone();

        let session = Session::new(
            DeviceConfig { device_id: "dev".into(), device_name: "Test".into(), device_type: "computer".into() },
            Credentials::Reusable(vec![]),
            Arc::new(NullRefresher),
            Arc::new(NullTransport),
        );
        let dealer = DealerSession::start(
            Arc::new(NullResolver),
            session,
            Duration::from_secs(30),
            Duration::from_secs(3),
            Duration::from_secs(1),
            2,
            Duration::from_secs(30),
            events.clone(),
            Arc::new(TokioSpawner::current()),
        );
        let command_handler = CommandHandler::start(dealer.clone(), &TokioSpawner::current());
        let playback_state = PlaybackState::new("dev".to_string(), Arc::new(FixedClusterDecoder), dealer.clone(), events.clone());
        let sp_client: SharedSpClient = Arc::new(NullSpClient);
        let connect_state = ConnectState::new("dev".to_string(), sp_client, dealer, events.clone());

        let mut registry = TrackSourceRegistry::new();
        registry.register(Arc::new(FakeTrackSource));

        let config = EngineConfig::default();
        let pipeline = AudioPipeline::new(
            Arc::new(registry),
            Arc::new(NullDecoder),
            command_handler,
            playback_state,
            connect_state,
            events,
            Arc::new(TokioSpawner::current()),
            &config,
            CancellationToken::new(),
        );
        (pipeline, captured)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within timeout");
    }

    #[tokio::test]
    async fn play_transitions_to_playing_and_emits_local_state() {
        let (pipeline, events) = harness();
        pipeline.start();
        pipeline.play("spotify:track:abc".to_string());

        wait_until(|| pipeline.status() == PlaybackStatus::Playing).await;

        let emitted = events.playback.lock().clone();
        assert!(emitted.iter().any(|e| matches!(
            e,
            PlaybackEvent::LocalStateChanged { track_uri, status: PlaybackStatus::Playing, .. }
                if track_uri == "spotify:track:abc"
        )));
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_status() {
        let (pipeline, _events) = harness();
        pipeline.start();
        pipeline.play("spotify:track:abc".to_string());
        wait_until(|| pipeline.status() == PlaybackStatus::Playing).await;

        pipeline.pause();
        wait_until(|| pipeline.status() == PlaybackStatus::Paused).await;

        pipeline.resume();
        wait_until(|| pipeline.status() == PlaybackStatus::Playing).await;
    }

    #[tokio::test]
    async fn skip_next_with_empty_queue_stops_playback() {
        let (pipeline, _events) = harness();
        pipeline.start();
        pipeline.play("spotify:track:abc".to_string());
        wait_until(|| pipeline.status() == PlaybackStatus::Playing).await;

        pipeline.skip_next();
        wait_until(|| pipeline.status() == PlaybackStatus::Stopped).await;
    }

    #[tokio::test]
    async fn loading_an_unmatched_uri_transitions_to_error() {
        let (pipeline, _events) = harness();
        pipeline.start();
        pipeline.play("not-a-known-scheme:track:abc".to_string());

        wait_until(|| pipeline.status() == PlaybackStatus::Error).await;
    }
}
