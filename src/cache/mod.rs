//! Two-tier image cache.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               ImageCache                │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │MemoryStorage │  │   DiskStorage   │  │
//! │  │ (decoded,    │  │ (serialized,    │  │
//! │  │  LRU, sync)  │  │  worker thread) │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`ImageCache`]: lookup/store contract over both tiers, with promotion of disk hits
//! - [`MemoryStorage`]: LRU store bounded by entry count and decoded size
//! - [`DiskStorage`]: one file per entry, mutations serialized on a worker thread
//! - [`CacheSerializer`]: converts images to disk bytes and back
//! - [`computed_key`]: combines a cache key with a processor identifier
//!
//! # Example
//!
//! ```no_run
//! use pixcache::cache::{CacheType, DefaultCacheSerializer, ImageCache};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let cache = ImageCache::new("avatars").unwrap();
//!     let image = Arc::new(image::DynamicImage::new_rgba8(16, 16));
//!
//!     cache
//!         .store(image, None, "https://example.com/a.png", "", DefaultCacheSerializer::shared(), true)
//!         .await
//!         .unwrap();
//!
//!     cache.clear_memory_cache();
//!     assert_eq!(
//!         cache.image_cached_type("https://example.com/a.png", ""),
//!         CacheType::Disk
//!     );
//! }
//! ```

mod disk;
mod image_cache;
mod key;
mod memory;
mod serializer;

pub use disk::{
    default_root, CacheWrite, DiskStorage, DiskStorageConfig, DEFAULT_DISK_EXPIRATION,
    DISK_DIRECTORY_PREFIX,
};
pub use image_cache::{
    CacheType, ImageCache, ImageCacheConfig, ImageCacheResult, DEFAULT_CACHE_NAME,
};
pub use key::{computed_key, disk_file_name, PROCESSOR_SEPARATOR};
pub use memory::{
    MemoryStorage, MemoryStorageConfig, DEFAULT_MEMORY_COST_LIMIT, DEFAULT_MEMORY_COUNT_LIMIT,
    DEFAULT_MEMORY_EXPIRATION,
};
pub use serializer::{CacheSerializer, DefaultCacheSerializer, SharedSerializer};
