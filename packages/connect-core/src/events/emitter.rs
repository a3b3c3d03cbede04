//! Event emitter abstraction for decoupling services from transport.
//!
//! Services depend on the [`EventEmitter`] trait rather than a concrete
//! broadcast channel, so the CLI, a future UI, and tests can all observe
//! engine activity without the engine knowing which one is listening.

use super::{ConnectStateEvent, ConnectionEvent, DownloadEvent, PlaybackEvent};

/// Trait for emitting domain events without knowledge of transport.
pub trait EventEmitter: Send + Sync {
    /// Emits a dealer connection lifecycle event.
    fn emit_connection(&self, event: ConnectionEvent);

    /// Emits a local or remote playback state change.
    fn emit_playback(&self, event: PlaybackEvent);

    /// Emits a progressive-download retry/failure event.
    fn emit_download(&self, event: DownloadEvent);

    /// Emits a ConnectState PUT outcome.
    fn emit_connect_state(&self, event: ConnectStateEvent);
}

/// No-op emitter for headless use or testing.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_connection(&self, _event: ConnectionEvent) {}
    fn emit_playback(&self, _event: PlaybackEvent) {}
    fn emit_download(&self, _event: DownloadEvent) {}
    fn emit_connect_state(&self, _event: ConnectStateEvent) {}
}

/// Logging emitter for debugging and development.
///
/// Logs every event at debug level. Useful when running the CLI with
/// `-l debug` to see engine activity without wiring a full UI.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_connection(&self, event: ConnectionEvent) {
        log::debug!("connection_event: {event:?}");
    }

    fn emit_playback(&self, event: PlaybackEvent) {
        log::debug!("playback_event: {event:?}");
    }

    fn emit_download(&self, event: DownloadEvent) {
        log::debug!("download_event: {event:?}");
    }

    fn emit_connect_state(&self, event: ConnectStateEvent) {
        log::debug!("connect_state_event: {event:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingEventEmitter {
        connection_count: AtomicUsize,
        download_count: AtomicUsize,
    }

    impl CountingEventEmitter {
        fn new() -> Self {
            Self {
                connection_count: AtomicUsize::new(0),
                download_count: AtomicUsize::new(0),
            }
        }
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit_connection(&self, _event: ConnectionEvent) {
            self.connection_count.fetch_add(1, Ordering::SeqCst);
        }
        fn emit_playback(&self, _event: PlaybackEvent) {}
        fn emit_download(&self, _event: DownloadEvent) {
            self.download_count.fetch_add(1, Ordering::SeqCst);
        }
        fn emit_connect_state(&self, _event: ConnectStateEvent) {}
    }

    #[test]
    fn counting_emitter_tracks_events() {
        let emitter = Arc::new(CountingEventEmitter::new());

        emitter.emit_connection(ConnectionEvent::ReconnectScheduled {
            attempt: 1,
            delay_ms: 1000,
        });
        emitter.emit_download(DownloadEvent {
            message: "503".into(),
            retry_count: 1,
            will_retry: true,
        });
        emitter.emit_download(DownloadEvent {
            message: "503".into(),
            retry_count: 2,
            will_retry: true,
        });

        assert_eq!(emitter.connection_count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.download_count.load(Ordering::SeqCst), 2);
    }
}
