//! Coalescing image downloader.
//!
//! Concurrent downloads of the same URL share one transport fetch. The first
//! caller starts the fetch on a spawned task; later callers join it and all of
//! them receive the same result.
//!
//! # Cancellation
//!
//! Dropping a `download_image` future detaches that caller only. The shared
//! fetch keeps running while other callers wait on it and is aborted when the
//! last one leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;
use url::Url;

use super::http::HttpTransport;
use super::transport::{Transport, TransportResponse};
use crate::error::ResponseError;

/// Default time limit for a single fetch
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15);

/// Progress callback invoked with `(received_bytes, total_bytes)`.
pub type ProgressBlock = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

type FetchResult = Result<Bytes, ResponseError>;
type InFlightMap = Arc<Mutex<HashMap<Url, InFlight>>>;
type ProgressSinks = Arc<Mutex<Vec<(u64, ProgressBlock)>>>;

/// A fetch shared by every caller currently waiting on a URL.
struct InFlight {
    id: u64,
    result: watch::Receiver<Option<FetchResult>>,
    sinks: ProgressSinks,
    waiters: usize,
    abort: AbortHandle,
}

/// Downloads image bytes, de-duplicating concurrent requests per URL.
pub struct ImageDownloader {
    name: String,
    transport: Arc<dyn Transport>,
    timeout: Option<Duration>,
    in_flight: InFlightMap,
    next_id: AtomicU64,
}

impl ImageDownloader {
    /// Create a downloader over a custom transport.
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            transport,
            timeout: Some(DEFAULT_DOWNLOAD_TIMEOUT),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Create a downloader over HTTP(S).
    pub fn http(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(HttpTransport::default()))
    }

    /// Set the per-fetch time limit. `None` disables it.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Number of URLs with a fetch in progress.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Download the bytes behind `url`.
    ///
    /// Joins an in-progress fetch for the same URL when there is one. Non-2xx
    /// statuses and empty bodies are errors.
    pub async fn download_image(
        &self,
        url: &Url,
        progress: Option<ProgressBlock>,
    ) -> Result<Bytes, ResponseError> {
        let waiter_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (mut result, flight_id) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get_mut(url) {
                Some(flight) => {
                    debug!(downloader = %self.name, %url, "joining in-flight download");
                    flight.waiters += 1;
                    if let Some(progress) = progress {
                        flight.sinks.lock().push((waiter_id, progress));
                    }
                    (flight.result.clone(), flight.id)
                }
                None => {
                    debug!(downloader = %self.name, %url, "starting download");
                    let flight_id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    let sinks: ProgressSinks = Arc::new(Mutex::new(
                        progress.into_iter().map(|p| (waiter_id, p)).collect(),
                    ));

                    let task = tokio::spawn(run_fetch(
                        self.transport.clone(),
                        url.clone(),
                        self.timeout,
                        sinks.clone(),
                        tx,
                        self.in_flight.clone(),
                        flight_id,
                    ));

                    in_flight.insert(
                        url.clone(),
                        InFlight {
                            id: flight_id,
                            result: rx.clone(),
                            sinks,
                            waiters: 1,
                            abort: task.abort_handle(),
                        },
                    );
                    (rx, flight_id)
                }
            }
        };

        let _waiter = Waiter {
            in_flight: &self.in_flight,
            url,
            flight_id,
            waiter_id,
        };

        loop {
            let current = result.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if result.changed().await.is_err() {
                return Err(ResponseError::Transport {
                    url: url.to_string(),
                    message: "download task ended without a result".to_string(),
                });
            }
        }
    }
}

impl std::fmt::Debug for ImageDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageDownloader")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Detaches a caller from its shared fetch when dropped.
///
/// A settled fetch has already been removed from the map, so this is a no-op
/// for callers that received a result.
struct Waiter<'a> {
    in_flight: &'a InFlightMap,
    url: &'a Url,
    flight_id: u64,
    waiter_id: u64,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        let Some(flight) = in_flight.get_mut(self.url) else {
            return;
        };
        if flight.id != self.flight_id {
            return;
        }

        flight.waiters -= 1;
        flight.sinks.lock().retain(|(id, _)| *id != self.waiter_id);

        if flight.waiters == 0 {
            debug!(url = %self.url, "last waiter left, aborting download");
            flight.abort.abort();
            in_flight.remove(self.url);
        }
    }
}

async fn run_fetch(
    transport: Arc<dyn Transport>,
    url: Url,
    timeout: Option<Duration>,
    sinks: ProgressSinks,
    tx: watch::Sender<Option<FetchResult>>,
    in_flight: InFlightMap,
    flight_id: u64,
) {
    let progress = move |received: u64, total: Option<u64>| {
        let sinks: Vec<ProgressBlock> = sinks.lock().iter().map(|(_, p)| p.clone()).collect();
        for sink in sinks {
            sink(received, total);
        }
    };

    let fetch = transport.fetch(&url, &progress);
    let response = match timeout {
        Some(limit) => match tokio::time::timeout(limit, fetch).await {
            Ok(response) => response,
            Err(_) => Err(ResponseError::Transport {
                url: url.to_string(),
                message: format!("timed out after {:?}", limit),
            }),
        },
        None => fetch.await,
    };
    let outcome = response.and_then(|response| validate(&url, response));

    {
        let mut in_flight = in_flight.lock();
        if in_flight.get(&url).is_some_and(|flight| flight.id == flight_id) {
            in_flight.remove(&url);
        }
    }
    // Every waiter may already be gone
    let _ = tx.send(Some(outcome));
}

fn validate(url: &Url, response: TransportResponse) -> FetchResult {
    if !(200..300).contains(&response.status) {
        return Err(ResponseError::InvalidHttpStatusCode {
            url: url.to_string(),
            status: response.status,
        });
    }
    if response.data.is_empty() {
        return Err(ResponseError::DataIsEmpty {
            url: url.to_string(),
        });
    }
    Ok(response.data)
}
