//! Network side of retrieval.
//!
//! - [`Transport`]: fetches the bytes behind a URL (stubbed in tests)
//! - [`HttpTransport`]: `reqwest`-backed transport with streamed progress
//! - [`ImageDownloader`]: validates responses and coalesces concurrent fetches per URL

mod http;
mod image_downloader;
mod transport;

pub use http::HttpTransport;
pub use image_downloader::{ImageDownloader, ProgressBlock, DEFAULT_DOWNLOAD_TIMEOUT};
pub use transport::{ProgressSink, Transport, TransportResponse};
