use std::path::PathBuf;

use thiserror::Error;

/// Top-level error delivered by every retrieval.
///
/// Each variant wraps a reason enum so callers can tell a cache miss apart
/// from a bad status code or a processing failure.
#[derive(Debug, Clone, Error)]
pub enum RetrieveError {
    /// The request could not be built or was cancelled
    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    /// The transport or data provider returned something unusable
    #[error("Response error: {0}")]
    Response(#[from] ResponseError),

    /// A cache operation failed, or the image is not cached
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// A processor could not produce an image
    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),
}

impl RetrieveError {
    /// Whether this error is a response carrying the given HTTP status code.
    pub fn is_invalid_response_status_code(&self, code: u16) -> bool {
        matches!(
            self,
            RetrieveError::Response(ResponseError::InvalidHttpStatusCode { status, .. }) if *status == code
        )
    }

    /// Whether the retrieval was cancelled before it produced a result.
    pub fn is_task_cancelled(&self) -> bool {
        matches!(self, RetrieveError::Request(RequestError::TaskCancelled { .. }))
    }

    /// Whether a cache-only retrieval missed.
    pub fn is_not_existing_in_cache(&self) -> bool {
        matches!(self, RetrieveError::Cache(CacheError::ImageNotExisting { .. }))
    }
}

/// Errors raised before anything is fetched
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// The locator could not be parsed as a URL
    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    /// The caller cancelled the retrieval
    #[error("Task cancelled for key: {key}")]
    TaskCancelled { key: String },
}

/// Errors produced by the transport or by a data provider
#[derive(Debug, Clone, Error)]
pub enum ResponseError {
    /// Server answered with a non-2xx status
    #[error("Invalid HTTP status code {status} for {url}")]
    InvalidHttpStatusCode { url: String, status: u16 },

    /// Network or connection error
    #[error("Transport error for {url}: {message}")]
    Transport { url: String, message: String },

    /// Server answered 2xx with an empty body
    #[error("Empty response body for {url}")]
    DataIsEmpty { url: String },

    /// A local data provider failed to produce bytes
    #[error("Data provider failed for key {key}: {message}")]
    DataProviderFailed { key: String, message: String },
}

/// Errors related to the memory and disk cache tiers
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Nothing is cached under the key (cache-only retrieval)
    #[error("Image not existing in cache for key: {key}")]
    ImageNotExisting { key: String },

    /// The disk storage directory could not be created
    #[error("Cannot create directory {}: {message}", path.display())]
    CannotCreateDirectory { path: PathBuf, message: String },

    /// A cache file could not be written
    #[error("Cannot write file {}: {message}", path.display())]
    CannotWriteFile { path: PathBuf, message: String },

    /// A cache file exists but could not be read
    #[error("Cannot read file {}: {message}", path.display())]
    CannotReadFile { path: PathBuf, message: String },

    /// A cache file could not be removed
    #[error("Cannot remove file {}: {message}", path.display())]
    CannotRemoveFile { path: PathBuf, message: String },

    /// The serializer produced no data for the image
    #[error("Cannot serialize image for key: {key}")]
    CannotSerializeImage { key: String },

    /// The disk worker thread could not be spawned
    #[error("Cannot start disk worker for cache {name}: {message}")]
    CannotStartWorker { name: String, message: String },

    /// The disk worker has shut down
    #[error("Disk storage is closed")]
    DiskStorageClosed,
}

/// Errors raised by the processing pipeline
#[derive(Debug, Clone, Error)]
pub enum ProcessorError {
    /// The processor could not turn its input into an image
    #[error("Processor '{processor}' failed: {message}")]
    ProcessingFailed { processor: String, message: String },
}
