//! Progressive CDN downloader: the storage core.
//!
//! [`progressive::ProgressiveDownloader`] is a random-access store backed by
//! HTTP range requests over a pre-allocated temp file, tracked by a
//! [`crate::model::RangeSet`]. [`lazy::LazyProgressiveDownloader`] wraps it
//! with an instant-start head-bytes trick: playback can begin from a small
//! prefetched prefix while the rest streams in behind it.
//! [`decrypt::AudioDecryptStream`] layers AES-128-CTR decryption on top,
//! passing the cleartext head region through unchanged.

pub mod decrypt;
pub mod http_fetch;
pub mod lazy;
pub mod progressive;
pub mod throughput;

pub use decrypt::AudioDecryptStream;
pub use lazy::LazyProgressiveDownloader;
pub use progressive::ProgressiveDownloader;
pub use throughput::{BufferStatus, ThroughputTracker};
