use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::error::ResponseError;

/// Raw outcome of a fetch, before status and body validation.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub data: Bytes,
}

/// Progress sink invoked with `(received_bytes, total_bytes)`.
pub type ProgressSink = dyn Fn(u64, Option<u64>) + Send + Sync;

/// Trait for fetching the bytes behind a URL.
///
/// This is the only network contract the downloader needs, which keeps it
/// testable with an in-process stub. Implementations must be thread-safe.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `url`, reporting progress as body chunks arrive.
    ///
    /// Non-2xx statuses are returned as a response, not as an error; the
    /// downloader decides what counts as a failure.
    async fn fetch(&self, url: &Url, progress: &ProgressSink)
        -> Result<TransportResponse, ResponseError>;
}
