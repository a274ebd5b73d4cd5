//! Image sources.
//!
//! A [`Source`] is either a network [`Resource`] fetched through the
//! downloader, or an [`ImageDataProvider`] that produces bytes itself (a local
//! file, bytes already in memory). Both expose the cache key the image is
//! stored under.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::error::{RequestError, ResponseError};

// =============================================================================
// Network Resource
// =============================================================================

/// A remote image: where to download it and which key to cache it under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    pub download_url: Url,
    pub cache_key: String,
}

impl Resource {
    /// Resource cached under a custom key.
    pub fn new(download_url: Url, cache_key: impl Into<String>) -> Self {
        Self {
            download_url,
            cache_key: cache_key.into(),
        }
    }

    /// Parse an absolute URL. The URL string becomes the cache key.
    pub fn parse(input: &str) -> Result<Self, RequestError> {
        Url::parse(input)
            .map(Self::from)
            .map_err(|e| RequestError::InvalidUrl {
                url: input.to_string(),
                message: e.to_string(),
            })
    }
}

impl From<Url> for Resource {
    fn from(download_url: Url) -> Self {
        let cache_key = download_url.to_string();
        Self {
            download_url,
            cache_key,
        }
    }
}

// =============================================================================
// Data Providers
// =============================================================================

/// Produces image bytes without going through the downloader.
#[async_trait]
pub trait ImageDataProvider: Send + Sync {
    /// Key the image is cached under.
    fn cache_key(&self) -> &str;

    /// Load the image bytes.
    async fn data(&self) -> Result<Bytes, ResponseError>;
}

/// Reads an image from the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFileImageDataProvider {
    path: PathBuf,
    cache_key: String,
}

impl LocalFileImageDataProvider {
    /// Provider keyed by the file URL of `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cache_key = format!("file://{}", path.display());
        Self { path, cache_key }
    }

    pub fn with_cache_key(path: impl Into<PathBuf>, cache_key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cache_key: cache_key.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ImageDataProvider for LocalFileImageDataProvider {
    fn cache_key(&self) -> &str {
        &self.cache_key
    }

    async fn data(&self) -> Result<Bytes, ResponseError> {
        tokio::fs::read(&self.path)
            .await
            .map(Bytes::from)
            .map_err(|e| ResponseError::DataProviderFailed {
                key: self.cache_key.clone(),
                message: e.to_string(),
            })
    }
}

/// Serves bytes that are already in memory.
#[derive(Debug, Clone)]
pub struct RawImageDataProvider {
    data: Bytes,
    cache_key: String,
}

impl RawImageDataProvider {
    pub fn new(data: impl Into<Bytes>, cache_key: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            cache_key: cache_key.into(),
        }
    }
}

#[async_trait]
impl ImageDataProvider for RawImageDataProvider {
    fn cache_key(&self) -> &str {
        &self.cache_key
    }

    async fn data(&self) -> Result<Bytes, ResponseError> {
        Ok(self.data.clone())
    }
}

// =============================================================================
// Source
// =============================================================================

/// Where an image comes from.
#[derive(Clone)]
pub enum Source {
    Network(Resource),
    Provider(Arc<dyn ImageDataProvider>),
}

impl Source {
    /// Key the image is cached under.
    pub fn cache_key(&self) -> &str {
        match self {
            Source::Network(resource) => &resource.cache_key,
            Source::Provider(provider) => provider.cache_key(),
        }
    }

    /// The download URL, for network sources.
    pub fn url(&self) -> Option<&Url> {
        match self {
            Source::Network(resource) => Some(&resource.download_url),
            Source::Provider(_) => None,
        }
    }

    /// Wrap a provider.
    pub fn provider(provider: impl ImageDataProvider + 'static) -> Self {
        Source::Provider(Arc::new(provider))
    }
}

impl From<Resource> for Source {
    fn from(resource: Resource) -> Self {
        Source::Network(resource)
    }
}

impl From<Url> for Source {
    fn from(url: Url) -> Self {
        Source::Network(Resource::from(url))
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Network(resource) => f.debug_tuple("Network").field(resource).finish(),
            Source::Provider(provider) => f
                .debug_tuple("Provider")
                .field(&provider.cache_key())
                .finish(),
        }
    }
}
