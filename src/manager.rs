//! Retrieval coordinator.
//!
//! [`ImageManager`] decides, per call, whether an image is served from the
//! memory tier, the disk tier, a cached original, or a fresh fetch, and makes
//! sure fetched images end up in the cache.
//!
//! # Decision Order
//!
//! 1. `force_refresh` skips every cache lookup.
//! 2. The target cache is checked: memory, then disk unless
//!    `from_memory_cache_or_refresh` is set.
//! 3. With a custom processor, a cached original is processed instead of
//!    fetching again.
//! 4. `only_from_cache` turns a miss into [`CacheError::ImageNotExisting`].
//! 5. Otherwise the image is fetched, processed and stored.
//!
//! The image modifier runs on every delivered image and its output is never
//! cached.

use std::io;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheType, CacheWrite, ImageCache, ImageCacheResult};
use crate::dispatch::{CompletionOnce, Dispatcher, SerialQueue};
use crate::downloader::{ImageDownloader, ProgressBlock};
use crate::error::{CacheError, ProcessorError, RequestError, RetrieveError};
use crate::options::RetrievalOptions;
use crate::processor::{DefaultImageProcessor, ImageProcessItem, ImageProcessor};
use crate::provider::Source;
use crate::SharedImage;

/// Label of the thread running main-queue callbacks
pub const MAIN_QUEUE_LABEL: &str = "pixcache.main";

/// A successfully retrieved image.
#[derive(Debug, Clone)]
pub struct RetrieveImageResult {
    /// The delivered image, after the modifier if one was set
    pub image: SharedImage,
    /// Where the image was found; [`CacheType::None`] if it was produced by this call
    pub cache_type: CacheType,
    /// The source the image was requested from
    pub source: Source,
}

/// Handle to a retrieval started with [`ImageManager::retrieve_image`].
#[derive(Debug, Clone)]
pub struct RetrieveTask {
    token: CancellationToken,
    cache_key: String,
}

impl RetrieveTask {
    /// Cancel the retrieval.
    ///
    /// A pending retrieval completes with [`RequestError::TaskCancelled`]. A
    /// completion that has already been delivered is unaffected.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }
}

struct ManagerInner {
    cache: Arc<ImageCache>,
    downloader: Arc<ImageDownloader>,
    main_queue: Arc<SerialQueue>,
    default_options: RetrievalOptions,
}

/// Coordinates cache lookups, downloads, processing and caching.
///
/// Cheap to clone; clones share the same cache, downloader and main queue.
#[derive(Clone)]
pub struct ImageManager {
    inner: Arc<ManagerInner>,
}

impl ImageManager {
    /// Create a manager with its own main queue thread.
    pub fn new(cache: Arc<ImageCache>, downloader: Arc<ImageDownloader>) -> io::Result<Self> {
        let main_queue = Arc::new(SerialQueue::new(MAIN_QUEUE_LABEL)?);
        Ok(Self::with_main_queue(cache, downloader, main_queue))
    }

    /// Create a manager delivering main-queue callbacks on `main_queue`.
    pub fn with_main_queue(
        cache: Arc<ImageCache>,
        downloader: Arc<ImageDownloader>,
        main_queue: Arc<SerialQueue>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                cache,
                downloader,
                main_queue,
                default_options: RetrievalOptions::default(),
            }),
        }
    }

    /// Options merged into every call.
    pub fn with_default_options(self, default_options: RetrievalOptions) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                cache: self.inner.cache.clone(),
                downloader: self.inner.downloader.clone(),
                main_queue: self.inner.main_queue.clone(),
                default_options,
            }),
        }
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.inner.cache
    }

    pub fn downloader(&self) -> &Arc<ImageDownloader> {
        &self.inner.downloader
    }

    pub fn main_queue(&self) -> &Arc<SerialQueue> {
        &self.inner.main_queue
    }

    pub fn default_options(&self) -> &RetrievalOptions {
        &self.inner.default_options
    }

    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    /// Start a retrieval and report its outcome through `completion`.
    ///
    /// Returns immediately. Progress and completion run on the options'
    /// callback queue (the main queue by default); `completion` runs exactly
    /// once. Must be called from within a Tokio runtime.
    pub fn retrieve_image<F>(
        &self,
        source: impl Into<Source>,
        options: RetrievalOptions,
        progress: Option<ProgressBlock>,
        completion: F,
    ) -> RetrieveTask
    where
        F: FnOnce(Result<RetrieveImageResult, RetrieveError>) + Send + 'static,
    {
        let source = source.into();
        let cache_key = source.cache_key().to_string();
        let options = options.merged_with(&self.inner.default_options);
        let dispatcher = options.callback_queue().resolve(&self.inner.main_queue);

        let completion = CompletionOnce::new(dispatcher.clone(), completion);
        let progress = progress.map(|block| {
            let completion = completion.clone();
            Arc::new(move |received: u64, total: Option<u64>| {
                let block = block.clone();
                // Nothing is reported once the completion is queued
                completion.dispatch_if_pending(move || block(received, total));
            }) as ProgressBlock
        });

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let manager = self.clone();
        let key = cache_key.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancelled.cancelled() => {
                    debug!(%key, "retrieval cancelled");
                    Err(RequestError::TaskCancelled { key }.into())
                }
                result = manager.run(source, &options, progress) => result,
            };
            completion.complete(result);
        });

        RetrieveTask { token, cache_key }
    }

    /// Retrieve an image.
    ///
    /// Progress runs on the options' callback queue; the result is returned
    /// directly. Dropping the future cancels the retrieval.
    pub async fn retrieve(
        &self,
        source: impl Into<Source>,
        options: RetrievalOptions,
        progress: Option<ProgressBlock>,
    ) -> Result<RetrieveImageResult, RetrieveError> {
        let options = options.merged_with(&self.inner.default_options);
        let progress = self.dispatch_progress(&options, progress);
        self.run(source.into(), &options, progress).await
    }

    /// Fetch, process and cache an image without looking at the cache first.
    pub async fn download_and_cache_image(
        &self,
        source: impl Into<Source>,
        options: RetrievalOptions,
        progress: Option<ProgressBlock>,
    ) -> Result<RetrieveImageResult, RetrieveError> {
        let options = options.merged_with(&self.inner.default_options);
        let progress = self.dispatch_progress(&options, progress);
        self.load_and_cache(source.into(), &options, progress).await
    }

    // -------------------------------------------------------------------------
    // Decision tree
    // -------------------------------------------------------------------------

    fn dispatch_progress(
        &self,
        options: &RetrievalOptions,
        progress: Option<ProgressBlock>,
    ) -> Option<ProgressBlock> {
        let dispatcher: Dispatcher = options.callback_queue().resolve(&self.inner.main_queue);
        progress.map(|block| dispatcher.progress(block))
    }

    fn target_cache(&self, options: &RetrievalOptions) -> Arc<ImageCache> {
        options
            .target_cache
            .clone()
            .unwrap_or_else(|| self.inner.cache.clone())
    }

    async fn run(
        &self,
        source: Source,
        options: &RetrievalOptions,
        progress: Option<ProgressBlock>,
    ) -> Result<RetrieveImageResult, RetrieveError> {
        if options.force_refresh {
            debug!(key = source.cache_key(), "force refresh, skipping cache");
            return self.load_and_cache(source, options, progress).await;
        }

        if let Some(result) = self.retrieve_from_cache(&source, options).await? {
            return Ok(result);
        }

        if options.only_from_cache {
            return Err(CacheError::ImageNotExisting {
                key: source.cache_key().to_string(),
            }
            .into());
        }

        self.load_and_cache(source, options, progress).await
    }

    /// Serve from the target cache, or by processing a cached original.
    async fn retrieve_from_cache(
        &self,
        source: &Source,
        options: &RetrievalOptions,
    ) -> Result<Option<RetrieveImageResult>, RetrieveError> {
        let key = source.cache_key();
        let cache = self.target_cache(options);

        let lookup = match cache.retrieve_image(key, options).await {
            Ok(lookup) => lookup,
            Err(e) => {
                warn!(key, error = %e, "cache lookup failed, treating as a miss");
                ImageCacheResult::None
            }
        };
        if let Some(image) = lookup.image() {
            return Ok(Some(self.deliver(
                image.clone(),
                lookup.cache_type(),
                source.clone(),
                options,
            )));
        }

        if options.from_memory_cache_or_refresh || !options.has_custom_processor() {
            return Ok(None);
        }

        let original_cache = options.original_cache.clone().unwrap_or(cache.clone());
        let serializer = options.serializer();
        let original = match original_cache.retrieve_image_in_memory_cache(key, "") {
            Some(image) => Some(image),
            None => original_cache
                .retrieve_image_in_disk_cache(key, "", &serializer)
                .await
                .unwrap_or_else(|e| {
                    warn!(key, error = %e, "original lookup failed, treating as a miss");
                    None
                }),
        };
        let Some(original) = original else {
            return Ok(None);
        };

        debug!(
            key,
            processor = options.processor_identifier(),
            "processing cached original"
        );
        let image = self
            .process(ImageProcessItem::Image(original), options)
            .await?;
        let write = cache.store(
            image.clone(),
            None,
            key,
            options.processor_identifier(),
            serializer,
            !options.cache_memory_only,
        );
        self.settle(write, key, options).await;

        Ok(Some(self.deliver(
            image,
            CacheType::None,
            source.clone(),
            options,
        )))
    }

    /// Fetch, process, store and deliver.
    async fn load_and_cache(
        &self,
        source: Source,
        options: &RetrievalOptions,
        progress: Option<ProgressBlock>,
    ) -> Result<RetrieveImageResult, RetrieveError> {
        let key = source.cache_key().to_string();

        let data = match &source {
            Source::Network(resource) => {
                let downloader = options
                    .downloader
                    .clone()
                    .unwrap_or_else(|| self.inner.downloader.clone());
                downloader
                    .download_image(&resource.download_url, progress)
                    .await?
            }
            Source::Provider(provider) => provider.data().await?,
        };

        let image = self
            .process(ImageProcessItem::Data(data.clone()), options)
            .await?;

        let cache = self.target_cache(options);
        let serializer = options.serializer();
        let to_disk = !options.cache_memory_only;

        let mut writes = vec![cache.store(
            image.clone(),
            Some(data.clone()),
            &key,
            options.processor_identifier(),
            serializer.clone(),
            to_disk,
        )];

        if options.cache_original_image && options.has_custom_processor() {
            let original_cache = options.original_cache.clone().unwrap_or(cache);
            match decode_original(data.clone(), options).await {
                Ok(original) => writes.push(original_cache.store(
                    original,
                    Some(data),
                    &key,
                    "",
                    serializer,
                    to_disk,
                )),
                Err(e) => warn!(%key, error = %e, "could not decode original for caching"),
            }
        }

        for write in writes {
            self.settle(write, &key, options).await;
        }

        Ok(self.deliver(image, CacheType::None, source, options))
    }

    /// Run the options' processor off the async workers.
    async fn process(
        &self,
        item: ImageProcessItem,
        options: &RetrievalOptions,
    ) -> Result<SharedImage, ProcessorError> {
        let processor = options.processor();
        let identifier = processor.identifier().to_string();
        let task_options = options.clone();

        match tokio::task::spawn_blocking(move || processor.process(&item, &task_options)).await {
            Ok(result) => result.map(Arc::new),
            Err(e) => Err(ProcessorError::ProcessingFailed {
                processor: identifier,
                message: e.to_string(),
            }),
        }
    }

    /// Await a disk write under `wait_for_cache`; otherwise let it finish in
    /// the background.
    async fn settle(&self, write: CacheWrite, key: &str, options: &RetrievalOptions) {
        if !options.wait_for_cache {
            drop(write);
            return;
        }
        if let Err(e) = write.await {
            warn!(key, error = %e, "disk cache write failed, image cached in memory only");
        }
    }

    fn deliver(
        &self,
        image: SharedImage,
        cache_type: CacheType,
        source: Source,
        options: &RetrievalOptions,
    ) -> RetrieveImageResult {
        let image = match &options.image_modifier {
            Some(modifier) => modifier.modify(image),
            None => image,
        };
        RetrieveImageResult {
            image,
            cache_type,
            source,
        }
    }
}

impl std::fmt::Debug for ImageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageManager")
            .field("cache", &self.inner.cache.name())
            .field("downloader", &self.inner.downloader)
            .field("main_queue", &self.inner.main_queue)
            .finish()
    }
}

/// Decode fetched bytes with the default processor.
async fn decode_original(
    data: bytes::Bytes,
    options: &RetrievalOptions,
) -> Result<SharedImage, ProcessorError> {
    let task_options = options.clone();
    tokio::task::spawn_blocking(move || {
        DefaultImageProcessor.process(&ImageProcessItem::Data(data), &task_options)
    })
    .await
    .map_err(|e| ProcessorError::ProcessingFailed {
        processor: String::new(),
        message: e.to_string(),
    })?
    .map(Arc::new)
}
