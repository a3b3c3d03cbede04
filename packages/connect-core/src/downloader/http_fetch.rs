//! Retrying HTTP range fetch against the CDN.
//!
//! A single place for the retry/backoff policy so both the on-demand gap
//! fetch and the background filler in [`super::progressive`] share it.

use std::time::{Duration, Instant};

use crate::error::DownloadError;
use crate::model::ByteRange;
use crate::protocol_constants::{
    RANGE_FETCH_MAX_RETRIES, RANGE_FETCH_RETRY_DELAYS_SECS, RANGE_FETCH_TIMEOUT_SECS,
};

/// Result of a successful range fetch: the bytes and how long they took to
/// arrive, so the caller can feed a [`super::throughput::ThroughputTracker`].
pub struct FetchedRange {
    pub bytes: Vec<u8>,
    pub elapsed: Duration,
}

/// Fetches `range` from `url`, retrying transient failures up to
/// [`RANGE_FETCH_MAX_RETRIES`] times with the
/// [`RANGE_FETCH_RETRY_DELAYS_SECS`] backoff table. A callback receives each
/// failed attempt so the caller can emit a `DownloadEvent`.
pub async fn fetch_range(
    client: &reqwest::Client,
    url: &str,
    range: ByteRange,
    mut on_retry: impl FnMut(&DownloadError, u32, bool),
) -> Result<FetchedRange, DownloadError> {
    let mut attempt = 0u32;
    loop {
        let started = Instant::now();
        let result = fetch_once(client, url, range).await;
        match result {
            Ok(bytes) => {
                return Ok(FetchedRange {
                    bytes,
                    elapsed: started.elapsed(),
                });
            }
            Err(e) => {
                let will_retry = e.is_transient() && attempt < RANGE_FETCH_MAX_RETRIES;
                on_retry(&e, attempt, will_retry);
                if !will_retry {
                    return Err(e);
                }
                let delay_secs = RANGE_FETCH_RETRY_DELAYS_SECS
                    [attempt as usize % RANGE_FETCH_RETRY_DELAYS_SECS.len()];
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                attempt += 1;
            }
        }
    }
}

/// Resolves the total byte length of `url` via an HTTP `HEAD` request, for
/// sizing the pre-allocated temp file a [`super::progressive::ProgressiveDownloader`]
/// writes into. Neither track metadata nor storage-resolve carries this
/// length, so it has to come from the CDN itself.
pub async fn fetch_content_length(client: &reqwest::Client, url: &str) -> Result<u64, DownloadError> {
    let response = client
        .head(url)
        .timeout(Duration::from_secs(RANGE_FETCH_TIMEOUT_SECS))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                DownloadError::Timeout
            } else {
                DownloadError::Http(e.to_string())
            }
        })?;

    if !response.status().is_success() {
        return Err(DownloadError::HttpStatus(response.status().as_u16()));
    }

    response
        .content_length()
        .ok_or_else(|| DownloadError::Http("response missing Content-Length".to_string()))
}

async fn fetch_once(
    client: &reqwest::Client,
    url: &str,
    range: ByteRange,
) -> Result<Vec<u8>, DownloadError> {
    // Half-open [start, end) becomes an inclusive HTTP byte range.
    let header_value = format!("bytes={}-{}", range.start, range.end.saturating_sub(1));
    let response = client
        .get(url)
        .header(reqwest::header::RANGE, header_value)
        .timeout(Duration::from_secs(RANGE_FETCH_TIMEOUT_SECS))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                DownloadError::Timeout
            } else {
                DownloadError::Http(e.to_string())
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::HttpStatus(status.as_u16()));
    }

    response
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|e| DownloadError::Http(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal hand-rolled HTTP/1.1 server returning a fixed status and body
    /// for every request, matching a fixed number of requests before
    /// closing.
    async fn spawn_fixed_response_server(
        status_line: &'static str,
        body: &'static [u8],
        expected_requests: usize,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for _ in 0..expected_requests {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _: Result<(), Infallible> = async {
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.write_all(body).await;
                    Ok(())
                }
                .await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn successful_fetch_returns_bytes() {
        let addr = spawn_fixed_response_server("HTTP/1.1 206 Partial Content", b"hello", 1).await;
        let client = reqwest::Client::new();
        let url = format!("http://{addr}/audio");
        let result = fetch_range(&client, &url, ByteRange::new(0, 5), |_, _, _| {}).await;
        assert_eq!(result.unwrap().bytes, b"hello");
    }

    #[tokio::test]
    async fn non_transient_status_fails_without_retry() {
        let addr = spawn_fixed_response_server("HTTP/1.1 404 Not Found", b"", 1).await;
        let client = reqwest::Client::new();
        let url = format!("http://{addr}/audio");
        let mut retries = 0;
        let result = fetch_range(&client, &url, ByteRange::new(0, 5), |_, _, _| retries += 1).await;
        assert!(matches!(result, Err(DownloadError::HttpStatus(404))));
        assert_eq!(retries, 1);
    }

    #[tokio::test]
    async fn content_length_is_parsed_from_head_response() {
        let addr = spawn_fixed_response_server("HTTP/1.1 200 OK", b"0123456789", 1).await;
        let client = reqwest::Client::new();
        let url = format!("http://{addr}/audio");
        let len = fetch_content_length(&client, &url).await.unwrap();
        assert_eq!(len, 10);
    }
}
