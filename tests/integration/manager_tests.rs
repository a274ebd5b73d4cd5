//! Retrieval decision tree tests.
//!
//! Each test drives an [`ImageManager`] over a stub transport and a temporary
//! cache, then checks which tier served the image and what ended up cached.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use image::GenericImageView;
use tokio::sync::oneshot;

use pixcache::{
    AnyImageModifier, CacheError, CacheType, CallbackQueue, ContentMode, DefaultCacheSerializer,
    ImageProcessor, ProgressBlock, RawImageDataProvider, Resource, ResizingImageProcessor,
    RetrievalOptions, RetrieveError, RoundCornerImageProcessor, SerialQueue, SharedImage, Source,
};

use super::test_utils::{
    eventually, retrieve, retrieve_with_progress, test_image, test_image_data, test_url,
    SimpleProcessor, TestEnv, TEST_IMAGE_HEIGHT, TEST_IMAGE_WIDTH,
};

fn round_corner() -> Arc<RoundCornerImageProcessor> {
    Arc::new(RoundCornerImageProcessor::new(20))
}

// =============================================================================
// Cache tiers
// =============================================================================

#[tokio::test]
async fn test_retrieve_image() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());
    let manager = &env.manager;

    let first = retrieve(manager, url.clone(), RetrievalOptions::new().with_wait_for_cache()).await;
    let first = first.result.unwrap();
    assert_eq!(first.cache_type, CacheType::None);
    assert_eq!(
        first.image.dimensions(),
        (TEST_IMAGE_WIDTH, TEST_IMAGE_HEIGHT)
    );

    let second = retrieve(manager, url.clone(), RetrievalOptions::new()).await;
    assert_eq!(second.result.unwrap().cache_type, CacheType::Memory);

    manager.cache().clear_memory_cache();
    let third = retrieve(manager, url.clone(), RetrievalOptions::new()).await;
    assert_eq!(third.result.unwrap().cache_type, CacheType::Disk);

    manager.cache().clear_memory_cache();
    manager.cache().clear_disk_cache().await.unwrap();
    let fourth = retrieve(manager, url.clone(), RetrievalOptions::new()).await;
    assert_eq!(fourth.result.unwrap().cache_type, CacheType::None);

    assert_eq!(env.transport.fetch_count(), 2);
}

#[tokio::test]
async fn test_retrieve_image_with_processor() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());
    let manager = &env.manager;
    let processor = round_corner();
    let with_processor = || RetrievalOptions::new().with_processor(processor.clone());

    let result = retrieve(manager, url.clone(), with_processor().with_wait_for_cache()).await;
    assert_eq!(result.result.unwrap().cache_type, CacheType::None);

    // Without the processor the cached variant does not match
    let result = retrieve(manager, url.clone(), RetrievalOptions::new()).await;
    assert_eq!(result.result.unwrap().cache_type, CacheType::None);

    let result = retrieve(manager, url.clone(), with_processor()).await;
    assert_eq!(result.result.unwrap().cache_type, CacheType::Memory);

    manager.cache().clear_memory_cache();
    let result = retrieve(manager, url.clone(), with_processor()).await;
    assert_eq!(result.result.unwrap().cache_type, CacheType::Disk);

    manager.cache().clear_memory_cache();
    manager.cache().clear_disk_cache().await.unwrap();
    let result = retrieve(manager, url.clone(), with_processor()).await;
    assert_eq!(result.result.unwrap().cache_type, CacheType::None);
}

#[tokio::test]
async fn test_should_not_download_if_only_from_cache_and_not_cached() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());

    let delivery = retrieve(
        &env.manager,
        url.clone(),
        RetrievalOptions::new().with_only_from_cache(),
    )
    .await;

    let err = delivery.result.unwrap_err();
    assert!(err.is_not_existing_in_cache());
    match err {
        RetrieveError::Cache(CacheError::ImageNotExisting { key }) => {
            assert_eq!(key, url.to_string());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(env.transport.fetch_count(), 0);
}

#[tokio::test]
async fn test_only_from_cache_serves_cached_image() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.main_cache()
        .store(
            test_image(),
            None,
            url.as_str(),
            "",
            DefaultCacheSerializer::shared(),
            true,
        )
        .await
        .unwrap();
    env.main_cache().clear_memory_cache();

    let delivery = retrieve(
        &env.manager,
        url.clone(),
        RetrievalOptions::new().with_only_from_cache(),
    )
    .await;
    assert_eq!(delivery.result.unwrap().cache_type, CacheType::Disk);
    assert_eq!(env.transport.fetch_count(), 0);
}

#[tokio::test]
async fn test_force_refresh_skips_cache() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());
    env.main_cache()
        .store_to_memory(test_image(), url.as_str(), "");

    let delivery = retrieve(
        &env.manager,
        url.clone(),
        RetrievalOptions::new().with_force_refresh(),
    )
    .await;
    assert_eq!(delivery.result.unwrap().cache_type, CacheType::None);
    assert_eq!(env.transport.fetch_count(), 1);
}

// =============================================================================
// Callback queues
// =============================================================================

#[tokio::test]
async fn test_success_completion_runs_on_main_queue_by_default() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());

    let progress_on_main = Arc::new(AtomicBool::new(false));
    let progress_calls = Arc::new(AtomicUsize::new(0));
    let main_queue = env.manager.main_queue().clone();
    let (on_main, calls) = (progress_on_main.clone(), progress_calls.clone());
    let progress: ProgressBlock = Arc::new(move |_: u64, _: Option<u64>| {
        on_main.store(main_queue.is_current(), Ordering::SeqCst);
        calls.fetch_add(1, Ordering::SeqCst);
    });

    let delivery =
        retrieve_with_progress(&env.manager, url, RetrievalOptions::new(), Some(progress)).await;

    assert!(delivery.result.is_ok());
    assert!(delivery.on_main_queue);
    // The FIFO queue ran every progress call before the completion
    assert_eq!(progress_calls.load(Ordering::SeqCst), 2);
    assert!(progress_on_main.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_error_completion_runs_on_main_queue_by_default() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport
        .stub_with(&url, 404, test_image_data(), Duration::ZERO);

    let delivery = retrieve(&env.manager, url, RetrievalOptions::new()).await;

    assert!(delivery.on_main_queue);
    let err = delivery.result.unwrap_err();
    assert!(err.is_invalid_response_status_code(404));
    assert!(!err.is_invalid_response_status_code(500));
}

#[tokio::test]
async fn test_success_completion_runs_on_custom_queue() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());

    let custom = Arc::new(SerialQueue::new("test.custom").unwrap());
    let progress_on_custom = Arc::new(AtomicBool::new(false));
    let (queue, flag) = (custom.clone(), progress_on_custom.clone());
    let progress: ProgressBlock = Arc::new(move |_: u64, _: Option<u64>| {
        flag.store(queue.is_current(), Ordering::SeqCst);
    });

    let (tx, rx) = oneshot::channel();
    let queue = custom.clone();
    env.manager.retrieve_image(
        url,
        RetrievalOptions::new().with_callback_queue(CallbackQueue::Queue(custom.clone())),
        Some(progress),
        move |result| {
            let _ = tx.send((result.is_ok(), queue.is_current()));
        },
    );

    let (ok, on_custom) = rx.await.unwrap();
    assert!(ok);
    assert!(on_custom);
    assert!(progress_on_custom.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_untouch_queue_skips_main_queue() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());

    let delivery = retrieve(
        &env.manager,
        url,
        RetrievalOptions::new().with_callback_queue(CallbackQueue::Untouch),
    )
    .await;
    assert!(delivery.result.is_ok());
    assert!(!delivery.on_main_queue);
}

// =============================================================================
// Default options
// =============================================================================

#[tokio::test]
async fn test_default_options_apply() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());

    let resizing = Arc::new(ResizingImageProcessor::new(8, 8, ContentMode::None));
    let manager = env
        .manager
        .clone()
        .with_default_options(RetrievalOptions::new().with_processor(resizing.clone()));

    let delivery = retrieve(&manager, url.clone(), RetrievalOptions::new()).await;
    let result = delivery.result.unwrap();
    assert_eq!(result.image.dimensions(), (8, 8));
    assert_eq!(
        manager
            .cache()
            .image_cached_type(url.as_str(), resizing.identifier()),
        CacheType::Memory
    );
}

// =============================================================================
// Original images
// =============================================================================

#[tokio::test]
async fn test_original_image_could_be_stored() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());
    let processor = SimpleProcessor::new();

    env.manager
        .download_and_cache_image(
            url.clone(),
            RetrievalOptions::new()
                .with_processor(processor.clone())
                .with_cache_original_image()
                .with_wait_for_cache(),
            None,
        )
        .await
        .unwrap();

    let cache = env.main_cache();
    assert_eq!(cache.image_cached_type(url.as_str(), "id"), CacheType::Memory);
    assert_eq!(cache.image_cached_type(url.as_str(), ""), CacheType::Memory);

    cache.clear_memory_cache();
    assert_eq!(cache.image_cached_type(url.as_str(), "id"), CacheType::Disk);
    assert_eq!(cache.image_cached_type(url.as_str(), ""), CacheType::Disk);
}

#[tokio::test]
async fn test_original_image_not_stored_without_option() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());
    let processor = SimpleProcessor::new();

    env.manager
        .download_and_cache_image(
            url.clone(),
            RetrievalOptions::new()
                .with_processor(processor.clone())
                .with_wait_for_cache(),
            None,
        )
        .await
        .unwrap();

    let cache = env.main_cache();
    assert_eq!(cache.image_cached_type(url.as_str(), "id"), CacheType::Memory);
    assert_eq!(cache.image_cached_type(url.as_str(), ""), CacheType::None);

    cache.clear_memory_cache();
    assert_eq!(cache.image_cached_type(url.as_str(), "id"), CacheType::Disk);
    assert_eq!(cache.image_cached_type(url.as_str(), ""), CacheType::None);
}

#[tokio::test]
async fn test_could_process_on_original_image() {
    let env = TestEnv::new();
    let url = test_url(0);
    let cache = env.main_cache();

    cache
        .store(
            test_image(),
            Some(test_image_data()),
            url.as_str(),
            "",
            DefaultCacheSerializer::shared(),
            true,
        )
        .await
        .unwrap();

    let processor = SimpleProcessor::new();
    assert!(!cache.is_cached(url.as_str(), processor.identifier()));

    // No stub registered: any download would fail
    let delivery = retrieve(
        &env.manager,
        url.clone(),
        RetrievalOptions::new()
            .with_processor(processor.clone())
            .with_wait_for_cache(),
    )
    .await;

    let result = delivery.result.unwrap();
    assert_eq!(result.cache_type, CacheType::None);
    assert!(processor.processed());
    assert!(cache.is_cached(url.as_str(), processor.identifier()));
    assert_eq!(env.transport.fetch_count(), 0);
}

#[tokio::test]
async fn test_cache_original_image_with_original_cache() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());
    let original_cache = env.cache("test-originalCache");
    assert_eq!(
        original_cache.image_cached_type(url.as_str(), ""),
        CacheType::None
    );

    let delivery = retrieve(
        &env.manager,
        url.clone(),
        RetrievalOptions::new()
            .with_processor(round_corner())
            .with_cache_original_image()
            .with_original_cache(original_cache.clone())
            .with_wait_for_cache(),
    )
    .await;
    assert!(delivery.result.is_ok());

    assert_eq!(
        original_cache.image_cached_type(url.as_str(), ""),
        CacheType::Memory
    );
    // The original lives in its own namespace, not the target cache
    assert_eq!(
        env.main_cache().image_cached_type(url.as_str(), ""),
        CacheType::None
    );
    assert!(original_cache
        .cache_path(url.as_str(), "")
        .starts_with(original_cache.disk_storage().directory()));
    assert!(original_cache.cache_path(url.as_str(), "").exists());
}

#[tokio::test]
async fn test_could_process_on_original_image_with_original_cache() {
    let env = TestEnv::new();
    let url = test_url(0);
    let original_cache = env.cache("test-originalCache");

    original_cache
        .store(
            test_image(),
            Some(test_image_data()),
            url.as_str(),
            "",
            DefaultCacheSerializer::shared(),
            true,
        )
        .await
        .unwrap();

    let processor = SimpleProcessor::new();
    assert!(!env.main_cache().is_cached(url.as_str(), processor.identifier()));

    let delivery = retrieve(
        &env.manager,
        url.clone(),
        RetrievalOptions::new()
            .with_processor(processor.clone())
            .with_original_cache(original_cache.clone())
            .with_wait_for_cache(),
    )
    .await;

    let result = delivery.result.unwrap();
    assert_eq!(result.cache_type, CacheType::None);
    assert!(processor.processed());
    assert!(env.main_cache().is_cached(url.as_str(), processor.identifier()));
    assert_eq!(env.transport.fetch_count(), 0);
}

// =============================================================================
// Waiting for the disk tier
// =============================================================================

#[tokio::test]
async fn test_wait_for_cache_on_retrieve_image() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());

    let delivery = retrieve(
        &env.manager,
        url.clone(),
        RetrievalOptions::new().with_wait_for_cache(),
    )
    .await;
    assert_eq!(delivery.result.unwrap().cache_type, CacheType::None);

    env.main_cache().clear_memory_cache();
    assert_eq!(
        env.main_cache().image_cached_type(url.as_str(), ""),
        CacheType::Disk
    );
}

#[tokio::test]
async fn test_not_wait_for_cache_on_retrieve_image() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());

    let delivery = retrieve(&env.manager, url.clone(), RetrievalOptions::new()).await;
    assert_eq!(delivery.result.unwrap().cache_type, CacheType::None);

    // The memory write is done before completion
    let cache = env.main_cache().clone();
    assert_eq!(cache.image_cached_type(url.as_str(), ""), CacheType::Memory);

    // The disk write finishes in the background
    cache.clear_memory_cache();
    assert!(eventually(|| cache.image_cached_type(url.as_str(), "") == CacheType::Disk).await);
}

#[tokio::test]
async fn test_wait_for_cache_on_retrieve_image_with_processor() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());
    let processor = round_corner();

    let delivery = retrieve(
        &env.manager,
        url.clone(),
        RetrievalOptions::new()
            .with_processor(processor.clone())
            .with_wait_for_cache(),
    )
    .await;
    assert_eq!(delivery.result.unwrap().cache_type, CacheType::None);

    env.main_cache().clear_memory_cache();
    assert_eq!(
        env.main_cache()
            .image_cached_type(url.as_str(), processor.identifier()),
        CacheType::Disk
    );
}

#[tokio::test]
async fn test_cache_memory_only_skips_disk() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());

    let delivery = retrieve(
        &env.manager,
        url.clone(),
        RetrievalOptions::new()
            .with_cache_memory_only()
            .with_wait_for_cache(),
    )
    .await;
    assert!(delivery.result.is_ok());

    let cache = env.main_cache();
    assert_eq!(cache.image_cached_type(url.as_str(), ""), CacheType::Memory);
    cache.clear_memory_cache();
    assert_eq!(cache.image_cached_type(url.as_str(), ""), CacheType::None);
}

// =============================================================================
// Memory-or-refresh
// =============================================================================

#[tokio::test]
async fn test_from_memory_cache_or_refresh_can_be_got_from_memory() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());
    let options = || {
        RetrievalOptions::new()
            .with_from_memory_cache_or_refresh()
            .with_wait_for_cache()
    };

    let delivery = retrieve(&env.manager, url.clone(), options()).await;
    assert_eq!(delivery.result.unwrap().cache_type, CacheType::None);

    // Still served from memory with the disk tier cleared
    env.main_cache().clear_disk_cache().await.unwrap();
    let delivery = retrieve(&env.manager, url.clone(), options()).await;
    assert_eq!(delivery.result.unwrap().cache_type, CacheType::Memory);
}

#[tokio::test]
async fn test_from_memory_cache_or_refresh_refreshes_if_not_in_memory() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());
    let cache = env.main_cache();

    let delivery = retrieve(
        &env.manager,
        url.clone(),
        RetrievalOptions::new()
            .with_from_memory_cache_or_refresh()
            .with_wait_for_cache(),
    )
    .await;
    assert_eq!(delivery.result.unwrap().cache_type, CacheType::None);
    assert_eq!(cache.image_cached_type(url.as_str(), ""), CacheType::Memory);

    cache.clear_memory_cache();
    assert_eq!(cache.image_cached_type(url.as_str(), ""), CacheType::Disk);

    // Skips the disk tier and downloads again
    let delivery = retrieve(
        &env.manager,
        url.clone(),
        RetrievalOptions::new().with_from_memory_cache_or_refresh(),
    )
    .await;
    assert_eq!(delivery.result.unwrap().cache_type, CacheType::None);
    assert_eq!(cache.image_cached_type(url.as_str(), ""), CacheType::Memory);
    assert_eq!(env.transport.fetch_count(), 2);
}

#[tokio::test]
async fn test_should_download_and_cache_processed_image() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());
    let processor = Arc::new(ResizingImageProcessor::new(1, 1, ContentMode::None));

    let delivery = retrieve(
        &env.manager,
        url.clone(),
        RetrievalOptions::new()
            .with_processor(processor.clone())
            .with_wait_for_cache(),
    )
    .await;
    let result = delivery.result.unwrap();
    assert_eq!(result.image.dimensions(), (1, 1));
    assert_eq!(result.cache_type, CacheType::None);

    env.main_cache().clear_memory_cache();
    assert_eq!(
        env.main_cache()
            .image_cached_type(url.as_str(), processor.identifier()),
        CacheType::Disk
    );

    let delivery = retrieve(
        &env.manager,
        url.clone(),
        RetrievalOptions::new().with_processor(processor.clone()),
    )
    .await;
    let result = delivery.result.unwrap();
    assert_eq!(result.image.dimensions(), (1, 1));
    assert_eq!(result.cache_type, CacheType::Disk);
}

// =============================================================================
// Image modifiers
// =============================================================================

/// A modifier that crops to 1x1 and records that it ran.
fn cropping_modifier(called: Arc<AtomicBool>) -> pixcache::SharedModifier {
    AnyImageModifier::shared(move |image: SharedImage| {
        called.store(true, Ordering::SeqCst);
        Arc::new(image.crop_imm(0, 0, 1, 1))
    })
}

#[tokio::test]
async fn test_should_apply_image_modifier_when_download() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());
    let called = Arc::new(AtomicBool::new(false));

    let delivery = retrieve(
        &env.manager,
        url.clone(),
        RetrievalOptions::new()
            .with_image_modifier(cropping_modifier(called.clone()))
            .with_wait_for_cache(),
    )
    .await;

    assert!(called.load(Ordering::SeqCst));
    assert_eq!(delivery.result.unwrap().image.dimensions(), (1, 1));

    // The cached image is unmodified
    let cached = env
        .main_cache()
        .retrieve_image_in_memory_cache(url.as_str(), "")
        .unwrap();
    assert_eq!(cached.dimensions(), (TEST_IMAGE_WIDTH, TEST_IMAGE_HEIGHT));
}

#[tokio::test]
async fn test_should_apply_image_modifier_when_load_from_memory_cache() {
    let env = TestEnv::new();
    let url = test_url(0);
    let called = Arc::new(AtomicBool::new(false));
    env.main_cache()
        .store_to_memory(test_image(), url.as_str(), "");

    let delivery = retrieve(
        &env.manager,
        url.clone(),
        RetrievalOptions::new().with_image_modifier(cropping_modifier(called.clone())),
    )
    .await;

    assert!(called.load(Ordering::SeqCst));
    let result = delivery.result.unwrap();
    assert_eq!(result.cache_type, CacheType::Memory);
    assert_eq!(result.image.dimensions(), (1, 1));
}

#[tokio::test]
async fn test_should_apply_image_modifier_when_load_from_disk_cache() {
    let env = TestEnv::new();
    let url = test_url(0);
    let called = Arc::new(AtomicBool::new(false));
    env.main_cache()
        .store(
            test_image(),
            None,
            url.as_str(),
            "",
            DefaultCacheSerializer::shared(),
            true,
        )
        .await
        .unwrap();
    env.main_cache().clear_memory_cache();

    let delivery = retrieve(
        &env.manager,
        url.clone(),
        RetrievalOptions::new().with_image_modifier(cropping_modifier(called.clone())),
    )
    .await;

    assert!(called.load(Ordering::SeqCst));
    let result = delivery.result.unwrap();
    assert_eq!(result.cache_type, CacheType::Disk);
    assert_eq!(result.image.dimensions(), (1, 1));

    // Promoted unmodified
    let promoted = env
        .main_cache()
        .retrieve_image_in_memory_cache(url.as_str(), "")
        .unwrap();
    assert_eq!(promoted.dimensions(), (TEST_IMAGE_WIDTH, TEST_IMAGE_HEIGHT));
}

// =============================================================================
// Coalescing and cancellation
// =============================================================================

#[tokio::test]
async fn test_concurrent_retrievals_share_one_download() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport
        .stub_with(&url, 200, test_image_data(), Duration::from_millis(100));

    let (a, b, c) = tokio::join!(
        retrieve(&env.manager, url.clone(), RetrievalOptions::new()),
        retrieve(&env.manager, url.clone(), RetrievalOptions::new()),
        retrieve(&env.manager, url.clone(), RetrievalOptions::new()),
    );

    for delivery in [a, b, c] {
        assert_eq!(delivery.result.unwrap().cache_type, CacheType::None);
    }
    assert_eq!(env.transport.fetch_count(), 1);
}

#[tokio::test]
async fn test_concurrent_retrievals_share_one_failure() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport
        .stub_with(&url, 500, test_image_data(), Duration::from_millis(100));

    let (a, b, c) = tokio::join!(
        retrieve(&env.manager, url.clone(), RetrievalOptions::new()),
        retrieve(&env.manager, url.clone(), RetrievalOptions::new()),
        retrieve(&env.manager, url.clone(), RetrievalOptions::new()),
    );

    for delivery in [a, b, c] {
        assert!(delivery.result.unwrap_err().is_invalid_response_status_code(500));
    }
    assert_eq!(env.transport.fetch_count(), 1);
    assert_eq!(env.manager.downloader().in_flight_count(), 0);
    assert!(!env.main_cache().is_cached(url.as_str(), ""));
}

#[tokio::test]
async fn test_cancel_delivers_task_cancelled_once() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport
        .stub_with(&url, 200, test_image_data(), Duration::from_secs(2));

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = oneshot::channel();
    let counter = calls.clone();
    let task = env.manager.retrieve_image(
        url.clone(),
        RetrievalOptions::new(),
        None,
        move |result| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(result);
        },
    );
    assert_eq!(task.cache_key(), url.as_str());

    tokio::time::sleep(Duration::from_millis(20)).await;
    task.cancel();
    task.cancel();
    assert!(task.is_cancelled());

    let result = tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .unwrap()
        .unwrap();
    let err = result.unwrap_err();
    assert!(err.is_task_cancelled());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // The last waiter left, so the shared download was dropped
    assert_eq!(env.manager.downloader().in_flight_count(), 0);
}

#[tokio::test]
async fn test_cancel_one_of_two_waiters() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport
        .stub_with(&url, 200, test_image_data(), Duration::from_millis(200));

    let (cancelled_tx, cancelled_rx) = oneshot::channel();
    let task = env
        .manager
        .retrieve_image(url.clone(), RetrievalOptions::new(), None, move |result| {
            let _ = cancelled_tx.send(result);
        });
    let survivor = retrieve(&env.manager, url.clone(), RetrievalOptions::new());

    let cancel = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.cancel();
        cancelled_rx.await.unwrap()
    };
    let (cancelled, survivor) = tokio::join!(cancel, survivor);

    assert!(cancelled.unwrap_err().is_task_cancelled());
    assert_eq!(survivor.result.unwrap().cache_type, CacheType::None);
    assert_eq!(env.transport.fetch_count(), 1);
}

// =============================================================================
// Sources and errors
// =============================================================================

#[tokio::test]
async fn test_provider_source_is_cached_under_its_key() {
    let env = TestEnv::new();
    let source = Source::provider(RawImageDataProvider::new(test_image_data(), "raw-key"));

    let delivery = retrieve(
        &env.manager,
        source.clone(),
        RetrievalOptions::new().with_wait_for_cache(),
    )
    .await;
    assert_eq!(delivery.result.unwrap().cache_type, CacheType::None);

    let delivery = retrieve(&env.manager, source, RetrievalOptions::new()).await;
    assert_eq!(delivery.result.unwrap().cache_type, CacheType::Memory);
    assert_eq!(env.transport.fetch_count(), 0);
    assert!(env.main_cache().is_cached("raw-key", ""));
}

#[tokio::test]
async fn test_custom_cache_key() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());

    let resource = Resource::new(url.clone(), "custom");
    let delivery = retrieve(&env.manager, resource, RetrievalOptions::new()).await;
    assert!(delivery.result.is_ok());

    assert!(env.main_cache().is_cached("custom", ""));
    assert!(!env.main_cache().is_cached(url.as_str(), ""));
}

#[tokio::test]
async fn test_empty_body_is_an_error() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, Bytes::new());

    let delivery = retrieve(&env.manager, url, RetrievalOptions::new()).await;
    assert!(matches!(
        delivery.result,
        Err(RetrieveError::Response(
            pixcache::ResponseError::DataIsEmpty { .. }
        ))
    ));
}

#[tokio::test]
async fn test_undecodable_body_is_a_processor_error() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport
        .stub(&url, Bytes::from_static(b"definitely not an image"));

    let delivery = retrieve(&env.manager, url.clone(), RetrievalOptions::new()).await;
    assert!(matches!(delivery.result, Err(RetrieveError::Processor(_))));
    assert!(!env.main_cache().is_cached(url.as_str(), ""));
}

#[tokio::test]
async fn test_async_api_matches_callback_api() {
    let env = TestEnv::new();
    let url = test_url(0);
    env.transport.stub(&url, test_image_data());

    let first = env
        .manager
        .retrieve(url.clone(), RetrievalOptions::new(), None)
        .await
        .unwrap();
    assert_eq!(first.cache_type, CacheType::None);
    assert_eq!(first.source.cache_key(), url.as_str());

    let second = env
        .manager
        .retrieve(url.clone(), RetrievalOptions::new(), None)
        .await
        .unwrap();
    assert_eq!(second.cache_type, CacheType::Memory);
}
