//! Two-tier image cache.
//!
//! [`ImageCache`] unifies a [`MemoryStorage`] and a [`DiskStorage`] behind one
//! lookup/store contract:
//!
//! - Lookups check memory first, then disk. A disk hit is decoded and
//!   promoted into memory before it is returned.
//! - Stores write memory synchronously, so a read issued after `store`
//!   returns always sees the value. The disk write (including serialization)
//!   is queued to the disk worker and reported through the returned
//!   [`CacheWrite`].
//!
//! Entries are addressed by a cache key plus a processor identifier, so the
//! original image and each processed variant are cached independently.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use super::disk::{CacheWrite, DiskStorage, DiskStorageConfig};
use super::key::computed_key;
use super::memory::{MemoryStorage, MemoryStorageConfig};
use super::serializer::SharedSerializer;
use crate::error::CacheError;
use crate::options::RetrievalOptions;
use crate::SharedImage;

/// Name of the cache used when none is given.
pub const DEFAULT_CACHE_NAME: &str = "default";

// =============================================================================
// Cache Type
// =============================================================================

/// Where an image was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// Not cached; the image was fetched by this call
    None,
    /// Found in the memory tier
    Memory,
    /// Found in the disk tier
    Disk,
}

impl CacheType {
    /// Whether the image came from either cache tier.
    pub fn is_cached(self) -> bool {
        !matches!(self, CacheType::None)
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone)]
pub enum ImageCacheResult {
    Memory(SharedImage),
    Disk(SharedImage),
    None,
}

impl ImageCacheResult {
    pub fn cache_type(&self) -> CacheType {
        match self {
            ImageCacheResult::Memory(_) => CacheType::Memory,
            ImageCacheResult::Disk(_) => CacheType::Disk,
            ImageCacheResult::None => CacheType::None,
        }
    }

    pub fn image(&self) -> Option<&SharedImage> {
        match self {
            ImageCacheResult::Memory(image) | ImageCacheResult::Disk(image) => Some(image),
            ImageCacheResult::None => None,
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration of both tiers of an [`ImageCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCacheConfig {
    pub memory: MemoryStorageConfig,
    pub disk: DiskStorageConfig,
}

impl ImageCacheConfig {
    /// Default limits for a cache called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            memory: MemoryStorageConfig::default(),
            disk: DiskStorageConfig::new(name),
        }
    }
}

// =============================================================================
// Image Cache
// =============================================================================

/// Memory + disk cache for decoded images.
///
/// # Thread Safety
///
/// The cache is thread-safe and meant to be shared via `Arc` across any number
/// of concurrent retrievals.
pub struct ImageCache {
    memory: MemoryStorage,
    disk: DiskStorage,
}

impl ImageCache {
    /// Create a cache with default limits, stored under the default root.
    pub fn new(name: impl Into<String>) -> Result<Self, CacheError> {
        Self::with_config(ImageCacheConfig::new(name))
    }

    /// Create a cache with explicit tier configuration.
    pub fn with_config(config: ImageCacheConfig) -> Result<Self, CacheError> {
        Ok(Self {
            memory: MemoryStorage::new(config.memory),
            disk: DiskStorage::new(config.disk)?,
        })
    }

    /// Shared handle to a new cache.
    pub fn shared(config: ImageCacheConfig) -> Result<Arc<Self>, CacheError> {
        Self::with_config(config).map(Arc::new)
    }

    /// The cache name, which also namespaces its disk directory.
    pub fn name(&self) -> &str {
        &self.disk.config().name
    }

    pub fn memory_storage(&self) -> &MemoryStorage {
        &self.memory
    }

    pub fn disk_storage(&self) -> &DiskStorage {
        &self.disk
    }

    // -------------------------------------------------------------------------
    // Store
    // -------------------------------------------------------------------------

    /// Store an image under `key` for the given processor.
    ///
    /// The memory write happens before this returns. When `to_disk` is set,
    /// the image is serialized and written on the disk worker and the returned
    /// [`CacheWrite`] resolves once that write settles; otherwise it is
    /// already resolved.
    pub fn store(
        &self,
        image: SharedImage,
        original: Option<Bytes>,
        key: &str,
        processor_identifier: &str,
        serializer: SharedSerializer,
        to_disk: bool,
    ) -> CacheWrite {
        let computed = computed_key(key, processor_identifier);
        self.memory.store(computed.clone(), image.clone());

        if !to_disk {
            return CacheWrite::completed();
        }

        let error_key = computed.clone();
        self.disk.store_with(computed, move || {
            serializer
                .data(&image, original.as_deref())
                .ok_or(CacheError::CannotSerializeImage { key: error_key })
        })
    }

    /// Store an image in the memory tier only.
    pub fn store_to_memory(&self, image: SharedImage, key: &str, processor_identifier: &str) {
        self.memory
            .store(computed_key(key, processor_identifier), image);
    }

    /// Store already serialized bytes in the disk tier only.
    pub fn store_to_disk(&self, data: Bytes, key: &str, processor_identifier: &str) -> CacheWrite {
        self.disk
            .store(computed_key(key, processor_identifier), data)
    }

    /// Remove an entry from the selected tiers.
    pub fn remove_image(
        &self,
        key: &str,
        processor_identifier: &str,
        from_memory: bool,
        from_disk: bool,
    ) -> CacheWrite {
        let computed = computed_key(key, processor_identifier);
        if from_memory {
            self.memory.remove(&computed);
        }
        if from_disk {
            self.disk.remove(computed)
        } else {
            CacheWrite::completed()
        }
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    /// Which tier currently holds the entry.
    ///
    /// Checks memory, then probes the disk for the file's existence without
    /// reading or decoding it.
    pub fn image_cached_type(&self, key: &str, processor_identifier: &str) -> CacheType {
        let computed = computed_key(key, processor_identifier);
        if self.memory.is_cached(&computed) {
            CacheType::Memory
        } else if self.disk.is_cached(&computed) {
            CacheType::Disk
        } else {
            CacheType::None
        }
    }

    /// Whether either tier holds the entry.
    pub fn is_cached(&self, key: &str, processor_identifier: &str) -> bool {
        self.image_cached_type(key, processor_identifier)
            .is_cached()
    }

    /// Look the entry up in memory, then disk.
    ///
    /// Uses the processor identifier and serializer from `options`. With
    /// `from_memory_cache_or_refresh`, the disk tier is skipped. A disk hit is
    /// promoted into memory before this returns.
    pub async fn retrieve_image(
        &self,
        key: &str,
        options: &RetrievalOptions,
    ) -> Result<ImageCacheResult, CacheError> {
        let identifier = options.processor_identifier();

        if let Some(image) = self.retrieve_image_in_memory_cache(key, identifier) {
            debug!(key, identifier, "memory cache hit");
            return Ok(ImageCacheResult::Memory(image));
        }

        if options.from_memory_cache_or_refresh {
            return Ok(ImageCacheResult::None);
        }

        let serializer = options.serializer();
        match self
            .retrieve_image_in_disk_cache(key, identifier, &serializer)
            .await?
        {
            Some(image) => {
                debug!(key, identifier, "disk cache hit");
                self.store_to_memory(image.clone(), key, identifier);
                Ok(ImageCacheResult::Disk(image))
            }
            None => Ok(ImageCacheResult::None),
        }
    }

    /// Memory tier lookup.
    pub fn retrieve_image_in_memory_cache(
        &self,
        key: &str,
        processor_identifier: &str,
    ) -> Option<SharedImage> {
        self.memory
            .value(&computed_key(key, processor_identifier))
    }

    /// Disk tier lookup. Does not promote the result into memory.
    ///
    /// Data the serializer cannot decode is treated as a miss.
    pub async fn retrieve_image_in_disk_cache(
        &self,
        key: &str,
        processor_identifier: &str,
        serializer: &SharedSerializer,
    ) -> Result<Option<SharedImage>, CacheError> {
        let computed = computed_key(key, processor_identifier);
        let Some(data) = self.disk.value(&computed).await? else {
            return Ok(None);
        };

        let serializer = serializer.clone();
        match tokio::task::spawn_blocking(move || serializer.image(&data)).await {
            Ok(Some(image)) => Ok(Some(Arc::new(image))),
            Ok(None) => {
                warn!(key = %computed, "disk cache entry could not be decoded");
                Ok(None)
            }
            Err(e) => {
                warn!(key = %computed, error = %e, "disk cache decoding task failed");
                Ok(None)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Drop every entry from the memory tier.
    pub fn clear_memory_cache(&self) {
        self.memory.remove_all();
    }

    /// Queue removal of every entry from the disk tier.
    pub fn clear_disk_cache(&self) -> CacheWrite {
        self.disk.remove_all()
    }

    /// Drop expired memory entries. Returns how many were removed.
    pub fn clean_expired_memory_cache(&self) -> usize {
        self.memory.remove_expired()
    }

    /// Queue a sweep of expired and over-limit disk entries.
    pub fn clean_expired_disk_cache(&self) -> CacheWrite {
        self.disk.remove_expired()
    }

    /// Total size of the disk tier in bytes.
    pub fn disk_storage_size(&self) -> Result<u64, CacheError> {
        self.disk.total_size()
    }

    /// Path of the disk file for an entry.
    pub fn cache_path(&self, key: &str, processor_identifier: &str) -> PathBuf {
        self.disk
            .cache_path(&computed_key(key, processor_identifier))
    }
}

// =============================================================================
// Tests
// =============================================================================
