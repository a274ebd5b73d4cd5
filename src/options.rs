//! Per-call retrieval options.

use std::fmt;
use std::sync::Arc;

use crate::cache::{DefaultCacheSerializer, ImageCache, SharedSerializer};
use crate::dispatch::CallbackQueue;
use crate::downloader::ImageDownloader;
use crate::modifier::SharedModifier;
use crate::processor::{is_default, DefaultImageProcessor, SharedProcessor};

/// Options controlling one retrieval.
///
/// Built with the `with_*` methods and treated as immutable once a call
/// starts. Unset values fall back to the manager's defaults, then to the
/// manager's own cache, downloader and main queue.
#[derive(Clone, Default)]
pub struct RetrievalOptions {
    /// Cache to look up and store the image in
    pub target_cache: Option<Arc<ImageCache>>,
    /// Cache for the unprocessed original, when it differs from the target
    pub original_cache: Option<Arc<ImageCache>>,
    /// Downloader used for network sources
    pub downloader: Option<Arc<ImageDownloader>>,
    /// Processor applied to fetched data; `None` means the default processor
    pub processor: Option<SharedProcessor>,
    /// Serializer for the disk tier
    pub cache_serializer: Option<SharedSerializer>,
    /// Applied to the delivered image only
    pub image_modifier: Option<SharedModifier>,
    /// Where callbacks run; `None` means the main queue
    pub callback_queue: Option<CallbackQueue>,

    /// Ignore cached images and fetch again
    pub force_refresh: bool,
    /// Check only the memory tier; fetch on a memory miss
    pub from_memory_cache_or_refresh: bool,
    /// Never fetch; fail when the image is not cached
    pub only_from_cache: bool,
    /// Skip the disk tier when storing
    pub cache_memory_only: bool,
    /// Complete only after disk writes settle
    pub wait_for_cache: bool,
    /// Also cache the unprocessed original when a processor is set
    pub cache_original_image: bool,
}

impl RetrievalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target_cache(mut self, cache: Arc<ImageCache>) -> Self {
        self.target_cache = Some(cache);
        self
    }

    pub fn with_original_cache(mut self, cache: Arc<ImageCache>) -> Self {
        self.original_cache = Some(cache);
        self
    }

    pub fn with_downloader(mut self, downloader: Arc<ImageDownloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn with_processor(mut self, processor: SharedProcessor) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn with_cache_serializer(mut self, serializer: SharedSerializer) -> Self {
        self.cache_serializer = Some(serializer);
        self
    }

    pub fn with_image_modifier(mut self, modifier: SharedModifier) -> Self {
        self.image_modifier = Some(modifier);
        self
    }

    pub fn with_callback_queue(mut self, queue: CallbackQueue) -> Self {
        self.callback_queue = Some(queue);
        self
    }

    pub fn with_force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn with_from_memory_cache_or_refresh(mut self) -> Self {
        self.from_memory_cache_or_refresh = true;
        self
    }

    pub fn with_only_from_cache(mut self) -> Self {
        self.only_from_cache = true;
        self
    }

    pub fn with_cache_memory_only(mut self) -> Self {
        self.cache_memory_only = true;
        self
    }

    pub fn with_wait_for_cache(mut self) -> Self {
        self.wait_for_cache = true;
        self
    }

    pub fn with_cache_original_image(mut self) -> Self {
        self.cache_original_image = true;
        self
    }

    /// Combine with `defaults`: flags are OR-ed, values set here win.
    pub fn merged_with(&self, defaults: &RetrievalOptions) -> RetrievalOptions {
        fn pick<T: Clone>(own: &Option<T>, fallback: &Option<T>) -> Option<T> {
            own.as_ref().or(fallback.as_ref()).cloned()
        }

        RetrievalOptions {
            target_cache: pick(&self.target_cache, &defaults.target_cache),
            original_cache: pick(&self.original_cache, &defaults.original_cache),
            downloader: pick(&self.downloader, &defaults.downloader),
            processor: pick(&self.processor, &defaults.processor),
            cache_serializer: pick(&self.cache_serializer, &defaults.cache_serializer),
            image_modifier: pick(&self.image_modifier, &defaults.image_modifier),
            callback_queue: pick(&self.callback_queue, &defaults.callback_queue),
            force_refresh: self.force_refresh || defaults.force_refresh,
            from_memory_cache_or_refresh: self.from_memory_cache_or_refresh
                || defaults.from_memory_cache_or_refresh,
            only_from_cache: self.only_from_cache || defaults.only_from_cache,
            cache_memory_only: self.cache_memory_only || defaults.cache_memory_only,
            wait_for_cache: self.wait_for_cache || defaults.wait_for_cache,
            cache_original_image: self.cache_original_image || defaults.cache_original_image,
        }
    }

    /// The processor to run, the default one when unset.
    pub fn processor(&self) -> SharedProcessor {
        self.processor
            .clone()
            .unwrap_or_else(DefaultImageProcessor::shared)
    }

    /// Identifier of the processor; empty for the default processor.
    pub fn processor_identifier(&self) -> &str {
        self.processor
            .as_deref()
            .map_or("", |processor| processor.identifier())
    }

    /// Whether a non-default processor is set.
    pub fn has_custom_processor(&self) -> bool {
        self.processor
            .as_deref()
            .is_some_and(|processor| !is_default(processor))
    }

    /// The disk serializer, the default one when unset.
    pub fn serializer(&self) -> SharedSerializer {
        self.cache_serializer
            .clone()
            .unwrap_or_else(DefaultCacheSerializer::shared)
    }

    /// Callback queue, the main queue when unset.
    pub fn callback_queue(&self) -> CallbackQueue {
        self.callback_queue.clone().unwrap_or_default()
    }
}

impl fmt::Debug for RetrievalOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrievalOptions")
            .field(
                "target_cache",
                &self.target_cache.as_ref().map(|cache| cache.name().to_string()),
            )
            .field(
                "original_cache",
                &self.original_cache.as_ref().map(|cache| cache.name().to_string()),
            )
            .field("downloader", &self.downloader)
            .field("processor", &self.processor_identifier())
            .field("callback_queue", &self.callback_queue)
            .field("force_refresh", &self.force_refresh)
            .field(
                "from_memory_cache_or_refresh",
                &self.from_memory_cache_or_refresh,
            )
            .field("only_from_cache", &self.only_from_cache)
            .field("cache_memory_only", &self.cache_memory_only)
            .field("wait_for_cache", &self.wait_for_cache)
            .field("cache_original_image", &self.cache_original_image)
            .finish_non_exhaustive()
    }
}
