//! In-memory tier for decoded images.
//!
//! This module provides an LRU store for decoded images, bounded both by the
//! number of entries and by their total cost in bytes.
//!
//! # Cost-Based Eviction
//!
//! Each entry is charged its decoded pixel size. When either the entry count
//! or the total cost exceeds its limit, least-recently-used entries are
//! evicted until both limits hold again. The most recently stored entry is
//! always kept, so an image larger than the cost limit still reads back until
//! the next store pushes it out.
//!
//! # Expiration
//!
//! Entries optionally expire a fixed duration after they were last accessed.
//! An expired entry behaves exactly like a miss.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::codec::memory_cost;
use crate::SharedImage;

/// Default total cost limit: 256MB of decoded pixels
pub const DEFAULT_MEMORY_COST_LIMIT: usize = 256 * 1024 * 1024;

/// Default maximum number of entries
pub const DEFAULT_MEMORY_COUNT_LIMIT: usize = 1_000;

/// Default time an entry stays alive after its last access
pub const DEFAULT_MEMORY_EXPIRATION: Duration = Duration::from_secs(300);

/// Limits for a [`MemoryStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStorageConfig {
    /// Maximum total cost (decoded bytes) of all entries
    pub total_cost_limit: usize,

    /// Maximum number of entries
    pub count_limit: usize,

    /// Time-to-live after last access; `None` keeps entries until evicted
    pub expiration: Option<Duration>,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            total_cost_limit: DEFAULT_MEMORY_COST_LIMIT,
            count_limit: DEFAULT_MEMORY_COUNT_LIMIT,
            expiration: Some(DEFAULT_MEMORY_EXPIRATION),
        }
    }
}

struct MemoryEntry {
    image: SharedImage,
    cost: usize,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct Inner {
    entries: LruCache<String, MemoryEntry>,
    total_cost: usize,
}

/// Thread-safe LRU store of decoded images.
///
/// All operations are synchronous: a value stored by one thread is visible to
/// any read that starts after `store` returned.
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    config: MemoryStorageConfig,
}

impl MemoryStorage {
    /// Create a storage with the given limits.
    pub fn new(config: MemoryStorageConfig) -> Self {
        let capacity = NonZeroUsize::new(config.count_limit).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                total_cost: 0,
            }),
            config,
        }
    }

    /// Get an image, marking it as recently used and extending its expiration.
    pub fn value(&self, key: &str) -> Option<SharedImage> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.peek(key) {
            Some(entry) => entry.is_expired(now),
            None => return None,
        };
        if expired {
            if let Some(entry) = inner.entries.pop(key) {
                inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
            }
            return None;
        }

        let expiration = self.config.expiration;
        inner.entries.get_mut(key).map(|entry| {
            entry.expires_at = expiration.map(|ttl| now + ttl);
            entry.image.clone()
        })
    }

    /// Check for a live entry without updating LRU order.
    pub fn is_cached(&self, key: &str) -> bool {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .entries
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Store an image, evicting least-recently-used entries over the limits.
    pub fn store(&self, key: impl Into<String>, image: SharedImage) {
        let cost = memory_cost(&image);
        let expires_at = self.config.expiration.map(|ttl| Instant::now() + ttl);
        let mut inner = self.inner.lock();

        let entry = MemoryEntry {
            image,
            cost,
            expires_at,
        };

        // `push` returns the replaced value for an existing key, or the LRU
        // entry it evicted to respect the count limit.
        if let Some((_, old)) = inner.entries.push(key.into(), entry) {
            inner.total_cost = inner.total_cost.saturating_sub(old.cost);
        }
        inner.total_cost += cost;

        // The entry just stored is the most recent one and is never evicted
        // here, even when it alone exceeds the cost limit.
        while inner.total_cost > self.config.total_cost_limit && inner.entries.len() > 1 {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.total_cost = inner.total_cost.saturating_sub(evicted.cost);
                }
                None => break,
            }
        }
    }

    /// Remove an entry, returning its image if it existed.
    pub fn remove(&self, key: &str) -> Option<SharedImage> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.pop(key)?;
        inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
        Some(entry.image)
    }

    /// Remove every entry.
    pub fn remove_all(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_cost = 0;
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = inner.entries.pop(key) {
                inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
            }
        }
        expired.len()
    }

    /// Number of entries, including expired ones not yet dropped.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the storage holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Total cost of all entries in bytes.
    pub fn total_cost(&self) -> usize {
        self.inner.lock().total_cost
    }

    /// The limits this storage was created with.
    pub fn config(&self) -> &MemoryStorageConfig {
        &self.config
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(MemoryStorageConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
