//! Persistent disk tier.
//!
//! Every [`DiskStorage`] owns a directory named after its cache and a
//! dedicated worker thread. All mutating operations (store, remove, clear,
//! expiration sweeps) are queued to that thread and run strictly in
//! submission order, so a `remove_all` issued after a `store` always sees the
//! stored file. Reads and existence probes go straight to the filesystem.
//!
//! # Layout
//!
//! ```text
//! <root>/pixcache.<cache name>/<sha256(computed key)>
//! ```
//!
//! Files are written to a temporary name first and renamed into place, so a
//! reader never observes a partially written entry.
//!
//! # Expiration
//!
//! An entry expires a fixed duration after its file was last modified. Read
//! hits touch the file, which extends its lifetime.

use std::fs;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::key::disk_file_name;
use crate::error::CacheError;

/// Prefix of every cache directory.
pub const DISK_DIRECTORY_PREFIX: &str = "pixcache.";

/// Default time an entry stays on disk after its last access: 7 days
pub const DEFAULT_DISK_EXPIRATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Suffix of files that are still being written.
const TEMP_SUFFIX: &str = ".tmp";

/// Default root directory for disk caches.
///
/// The platform cache directory, or the temp directory when there is none.
pub fn default_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pixcache")
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration of a [`DiskStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskStorageConfig {
    /// Cache name; entries live under `pixcache.<name>` inside `directory`
    pub name: String,

    /// Root directory holding the cache directory
    pub directory: PathBuf,

    /// Maximum total size in bytes enforced by expiration sweeps (0 = unlimited)
    pub size_limit: u64,

    /// Time-to-live after last access; `None` keeps entries forever
    pub expiration: Option<Duration>,
}

impl DiskStorageConfig {
    /// Configuration with default root, no size limit and a 7 day expiration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory: default_root(),
            size_limit: 0,
            expiration: Some(DEFAULT_DISK_EXPIRATION),
        }
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn with_size_limit(mut self, size_limit: u64) -> Self {
        self.size_limit = size_limit;
        self
    }

    pub fn with_expiration(mut self, expiration: Option<Duration>) -> Self {
        self.expiration = expiration;
        self
    }

    /// Directory holding this cache's files.
    pub fn cache_directory(&self) -> PathBuf {
        self.directory
            .join(format!("{}{}", DISK_DIRECTORY_PREFIX, self.name))
    }
}

// =============================================================================
// Completion Handle
// =============================================================================

/// Completion of a queued disk operation.
///
/// Resolves once the operation is durable or has failed. Dropping it does not
/// cancel the operation.
#[must_use = "a CacheWrite does nothing to the operation when dropped; await it to observe completion"]
pub struct CacheWrite(WriteState);

enum WriteState {
    Ready(Option<Result<(), CacheError>>),
    Pending(oneshot::Receiver<Result<(), CacheError>>),
}

impl CacheWrite {
    /// A write that has already settled with `result`.
    pub fn ready(result: Result<(), CacheError>) -> Self {
        Self(WriteState::Ready(Some(result)))
    }

    /// A write that has already succeeded.
    pub fn completed() -> Self {
        Self::ready(Ok(()))
    }

    fn pending(rx: oneshot::Receiver<Result<(), CacheError>>) -> Self {
        Self(WriteState::Pending(rx))
    }
}

impl Future for CacheWrite {
    type Output = Result<(), CacheError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().0 {
            WriteState::Ready(result) => Poll::Ready(result.take().unwrap_or(Ok(()))),
            WriteState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(Err(CacheError::DiskStorageClosed))),
        }
    }
}

// =============================================================================
// Disk Storage
// =============================================================================

type Encoder = Box<dyn FnOnce() -> Result<Bytes, CacheError> + Send>;
type Done = oneshot::Sender<Result<(), CacheError>>;

enum DiskOp {
    Store {
        key: String,
        encode: Encoder,
        done: Done,
    },
    Remove {
        key: String,
        done: Done,
    },
    RemoveAll {
        done: Done,
    },
    RemoveExpired {
        done: Done,
    },
}

/// Key → bytes store backed by one directory and one worker thread.
pub struct DiskStorage {
    config: DiskStorageConfig,
    directory: PathBuf,
    ops: mpsc::UnboundedSender<DiskOp>,
}

impl DiskStorage {
    /// Create the cache directory and start the worker thread.
    pub fn new(config: DiskStorageConfig) -> Result<Self, CacheError> {
        let directory = config.cache_directory();
        create_directory(&directory)?;

        let (ops, rx) = mpsc::unbounded_channel();
        let worker = DiskWorker {
            directory: directory.clone(),
            size_limit: config.size_limit,
            expiration: config.expiration,
        };

        thread::Builder::new()
            .name(format!("pixcache.disk.{}", config.name))
            .spawn(move || worker.run(rx))
            .map_err(|e| CacheError::CannotStartWorker {
                name: config.name.clone(),
                message: e.to_string(),
            })?;

        debug!(directory = %directory.display(), "disk storage ready");

        Ok(Self {
            config,
            directory,
            ops,
        })
    }

    /// Path of the file holding `key`.
    pub fn cache_path(&self, key: &str) -> PathBuf {
        self.directory.join(disk_file_name(key))
    }

    /// Synchronous existence probe; expired entries count as absent.
    pub fn is_cached(&self, key: &str) -> bool {
        match fs::metadata(self.cache_path(key)) {
            Ok(meta) => meta
                .modified()
                .map(|modified| !is_expired(modified, self.config.expiration, SystemTime::now()))
                .unwrap_or(true),
            Err(_) => false,
        }
    }

    /// Read the bytes stored under `key`.
    ///
    /// Returns `Ok(None)` when the entry is missing or expired. A hit extends
    /// the entry's expiration.
    pub async fn value(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let path = self.cache_path(key);
        let expiration = self.config.expiration;
        let read_path = path.clone();

        tokio::task::spawn_blocking(move || read_value(&read_path, expiration))
            .await
            .map_err(|e| CacheError::CannotReadFile {
                path,
                message: e.to_string(),
            })?
    }

    /// Queue a write of `data` under `key`.
    pub fn store(&self, key: impl Into<String>, data: Bytes) -> CacheWrite {
        self.store_with(key, move || Ok(data))
    }

    /// Queue a write whose bytes are produced by `encode` on the worker thread.
    pub fn store_with<F>(&self, key: impl Into<String>, encode: F) -> CacheWrite
    where
        F: FnOnce() -> Result<Bytes, CacheError> + Send + 'static,
    {
        let key = key.into();
        self.submit(|done| DiskOp::Store {
            key,
            encode: Box::new(encode),
            done,
        })
    }

    /// Queue the removal of `key`. Removing a missing entry succeeds.
    pub fn remove(&self, key: impl Into<String>) -> CacheWrite {
        let key = key.into();
        self.submit(|done| DiskOp::Remove { key, done })
    }

    /// Queue the removal of every entry.
    pub fn remove_all(&self) -> CacheWrite {
        self.submit(|done| DiskOp::RemoveAll { done })
    }

    /// Queue a sweep removing expired entries, then trimming the directory to
    /// half the size limit (oldest entries first) if it is over the limit.
    pub fn remove_expired(&self) -> CacheWrite {
        self.submit(|done| DiskOp::RemoveExpired { done })
    }

    /// Total size of all entries in bytes.
    pub fn total_size(&self) -> Result<u64, CacheError> {
        Ok(list_entries(&self.directory)?
            .iter()
            .map(|entry| entry.size)
            .sum())
    }

    /// The configuration this storage was created with.
    pub fn config(&self) -> &DiskStorageConfig {
        &self.config
    }

    /// Directory holding this storage's files.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn submit(&self, op: impl FnOnce(Done) -> DiskOp) -> CacheWrite {
        let (done, rx) = oneshot::channel();
        match self.ops.send(op(done)) {
            Ok(()) => CacheWrite::pending(rx),
            Err(_) => CacheWrite::ready(Err(CacheError::DiskStorageClosed)),
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

struct DiskWorker {
    directory: PathBuf,
    size_limit: u64,
    expiration: Option<Duration>,
}

impl DiskWorker {
    fn run(self, mut rx: mpsc::UnboundedReceiver<DiskOp>) {
        // Exits once every sender is dropped and the queue is drained.
        while let Some(op) = rx.blocking_recv() {
            match op {
                DiskOp::Store { key, encode, done } => {
                    let result = encode().and_then(|data| self.write(&key, &data));
                    report("store", &result);
                    let _ = done.send(result);
                }
                DiskOp::Remove { key, done } => {
                    let result = remove_file(&self.directory.join(disk_file_name(&key)));
                    report("remove", &result);
                    let _ = done.send(result);
                }
                DiskOp::RemoveAll { done } => {
                    let result = self.remove_all();
                    report("remove_all", &result);
                    let _ = done.send(result);
                }
                DiskOp::RemoveExpired { done } => {
                    let result = self.remove_expired();
                    report("remove_expired", &result);
                    let _ = done.send(result);
                }
            }
        }
        debug!(directory = %self.directory.display(), "disk worker stopped");
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        create_directory(&self.directory)?;

        let name = disk_file_name(key);
        let path = self.directory.join(&name);
        let temp = self.directory.join(format!("{}{}", name, TEMP_SUFFIX));

        fs::write(&temp, data).map_err(|e| CacheError::CannotWriteFile {
            path: temp.clone(),
            message: e.to_string(),
        })?;
        fs::rename(&temp, &path).map_err(|e| CacheError::CannotWriteFile {
            path,
            message: e.to_string(),
        })
    }

    fn remove_all(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(&self.directory) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CacheError::CannotRemoveFile {
                    path: self.directory.clone(),
                    message: e.to_string(),
                })
            }
        }
        create_directory(&self.directory)
    }

    fn remove_expired(&self) -> Result<(), CacheError> {
        let now = SystemTime::now();
        let (expired, mut live): (Vec<_>, Vec<_>) = list_entries(&self.directory)?
            .into_iter()
            .partition(|entry| is_expired(entry.modified, self.expiration, now));

        for entry in &expired {
            remove_file(&entry.path)?;
        }

        let mut total: u64 = live.iter().map(|entry| entry.size).sum();
        let mut trimmed = 0usize;
        if self.size_limit > 0 && total > self.size_limit {
            let target = self.size_limit / 2;
            live.sort_by_key(|entry| entry.modified);
            for entry in &live {
                if total <= target {
                    break;
                }
                remove_file(&entry.path)?;
                total = total.saturating_sub(entry.size);
                trimmed += 1;
            }
        }

        debug!(
            expired = expired.len(),
            trimmed,
            remaining_bytes = total,
            "disk expiration sweep finished"
        );
        Ok(())
    }
}

fn report(op: &str, result: &Result<(), CacheError>) {
    if let Err(e) = result {
        warn!(op, error = %e, "disk cache operation failed");
    }
}

// =============================================================================
// Filesystem Helpers
// =============================================================================

struct DiskEntry {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

fn is_expired(modified: SystemTime, expiration: Option<Duration>, now: SystemTime) -> bool {
    match expiration {
        Some(ttl) => modified.checked_add(ttl).is_some_and(|at| at <= now),
        None => false,
    }
}

fn create_directory(directory: &Path) -> Result<(), CacheError> {
    fs::create_dir_all(directory).map_err(|e| CacheError::CannotCreateDirectory {
        path: directory.to_path_buf(),
        message: e.to_string(),
    })
}

fn remove_file(path: &Path) -> Result<(), CacheError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::CannotRemoveFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        }),
    }
}

fn read_value(path: &Path, expiration: Option<Duration>) -> Result<Option<Bytes>, CacheError> {
    let read_error = |e: std::io::Error| CacheError::CannotReadFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(read_error(e)),
    };
    let modified = meta.modified().map_err(read_error)?;
    if is_expired(modified, expiration, SystemTime::now()) {
        return Ok(None);
    }

    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(read_error(e)),
    };

    // Touching is best effort; a failure only shortens the entry's lifetime.
    if let Ok(file) = fs::File::options().write(true).open(path) {
        let _ = file.set_modified(SystemTime::now());
    }

    Ok(Some(Bytes::from(data)))
}

fn list_entries(directory: &Path) -> Result<Vec<DiskEntry>, CacheError> {
    let read_error = |e: std::io::Error| CacheError::CannotReadFile {
        path: directory.to_path_buf(),
        message: e.to_string(),
    };

    let dir = match fs::read_dir(directory) {
        Ok(dir) => dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(read_error(e)),
    };

    let mut entries = Vec::new();
    for entry in dir {
        let entry = entry.map_err(read_error)?;
        let path = entry.path();
        if path.to_string_lossy().ends_with(TEMP_SUFFIX) {
            continue;
        }
        let meta = entry.metadata().map_err(read_error)?;
        if !meta.is_file() {
            continue;
        }
        entries.push(DiskEntry {
            path,
            size: meta.len(),
            modified: meta.modified().map_err(read_error)?,
        });
    }
    Ok(entries)
}

// =============================================================================
// Tests
// =============================================================================
