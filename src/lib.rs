//! # pixcache
//!
//! An image retrieval and caching engine.
//!
//! Given an image source and a set of options, the engine decides whether to
//! serve the image from memory, from disk, or by fetching it, then makes sure
//! the result is cached in both tiers and delivered exactly once on a
//! predictable callback queue.
//!
//! ## Features
//!
//! - **Two-tier cache**: cost-bounded LRU memory tier over a persistent disk tier
//! - **Coalesced downloads**: concurrent requests for one URL share a single fetch
//! - **Processors**: resizing, rounded corners, blur, grayscale, chaining; each
//!   processed variant is cached under its own key
//! - **Callback queues**: progress and completion run on a serial queue, in order
//! - **Cancellation**: pending retrievals can be cancelled without disturbing
//!   other callers waiting on the same download
//!
//! ## Architecture
//!
//! - [`cache`] - memory and disk tiers and the [`ImageCache`] coordinator
//! - [`downloader`] - transport abstraction and the coalescing [`ImageDownloader`]
//! - [`manager`] - the [`ImageManager`] retrieval decision tree
//! - [`processor`] / [`modifier`] - image transforms before caching and before delivery
//! - [`provider`] - network and non-network image sources
//! - [`dispatch`] - serial callback queues
//! - [`config`] - CLI configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pixcache::{ImageCache, ImageDownloader, ImageManager, Resource, RetrievalOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let cache = Arc::new(ImageCache::new("avatars").unwrap());
//!     let downloader = Arc::new(ImageDownloader::http("avatars"));
//!     let manager = ImageManager::new(cache, downloader).unwrap();
//!
//!     let resource = Resource::parse("https://example.com/avatar.png").unwrap();
//!     let result = manager
//!         .retrieve(resource, RetrievalOptions::new().with_wait_for_cache(), None)
//!         .await
//!         .unwrap();
//!     println!("{}x{} from {:?}", result.image.width(), result.image.height(), result.cache_type);
//! }
//! ```

use std::sync::Arc;

pub mod cache;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod downloader;
pub mod error;
pub mod manager;
pub mod modifier;
pub mod options;
pub mod processor;
pub mod provider;

/// A decoded image shared between the cache and its consumers.
pub type SharedImage = Arc<image::DynamicImage>;

// Re-export commonly used types
pub use cache::{
    computed_key, CacheSerializer, CacheType, CacheWrite, DefaultCacheSerializer, DiskStorage,
    DiskStorageConfig, ImageCache, ImageCacheConfig, ImageCacheResult, MemoryStorage,
    MemoryStorageConfig, SharedSerializer,
};
pub use config::{CacheAction, CacheArgs, CacheConfig, Cli, Command, FetchConfig, ResizeMode};
pub use dispatch::{CallbackQueue, SerialQueue};
pub use downloader::{
    HttpTransport, ImageDownloader, ProgressBlock, Transport, TransportResponse,
    DEFAULT_DOWNLOAD_TIMEOUT,
};
pub use error::{CacheError, ProcessorError, RequestError, ResponseError, RetrieveError};
pub use manager::{ImageManager, RetrieveImageResult, RetrieveTask};
pub use modifier::{AnyImageModifier, ImageModifier, SharedModifier};
pub use options::RetrievalOptions;
pub use processor::{
    append, BlurImageProcessor, ContentMode, DefaultImageProcessor, GrayscaleImageProcessor,
    ImageProcessItem, ImageProcessor, ResizingImageProcessor, RoundCornerImageProcessor,
    SharedProcessor,
};
pub use provider::{
    ImageDataProvider, LocalFileImageDataProvider, RawImageDataProvider, Resource, Source,
};
