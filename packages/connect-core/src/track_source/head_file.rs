//! Head-file fetch: a pre-decrypted prefix (~128 KiB) served from a
//! separate CDN so playback can start before the audio key or main CDN URL
//! is known.
//!
//! Failure here is always non-fatal: the caller falls
//! through to the no-head load path.

use std::time::Duration;

use crate::error::HeadFileError;
use crate::model::FileId;
use crate::protocol_constants::{HEAD_FILE_HOST, HEAD_FILE_TIMEOUT_SECS};

/// Fetches the head file for `file_id`. Returns `Ok(None)` rather than an
/// error variant in most caller contexts; the `Result` exists for logging
/// at the call site, never for propagating failure upward.
pub async fn fetch_head_file(
    client: &reqwest::Client,
    file_id: FileId,
) -> Result<Vec<u8>, HeadFileError> {
    let url = format!("{HEAD_FILE_HOST}/head/{}", file_id.to_hex());
    let response = client
        .get(url)
        .timeout(Duration::from_secs(HEAD_FILE_TIMEOUT_SECS))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                HeadFileError::Timeout
            } else {
                HeadFileError::NetworkError(e.to_string())
            }
        })?;

    if !response.status().is_success() {
        return Err(HeadFileError::HttpError(response.status().to_string()));
    }

    response
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|e| HeadFileError::NetworkError(e.to_string()))
}

/// Fetches the head file, swallowing any failure into `None` and logging it
/// — the shape every call site in `track_source::spotify` actually wants.
pub async fn try_fetch_head_file(client: &reqwest::Client, file_id: FileId) -> Option<Vec<u8>> {
    match fetch_head_file(client, file_id).await {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::debug!("head file unavailable for {file_id}, falling through to no-head load: {e}");
            None
        }
    }
}
