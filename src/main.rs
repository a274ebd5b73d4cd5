//! pixcache - fetch images through a two-tier memory and disk cache.
//!
//! This binary wires the CLI configuration to the library's cache, downloader
//! and manager.

use clap::Parser;
use image::{DynamicImage, ImageFormat};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pixcache::{
    append, codec,
    config::{CacheAction, CacheArgs, CacheConfig, Cli, Command, FetchConfig},
    BlurImageProcessor, GrayscaleImageProcessor, ImageCache, ImageDownloader, ImageManager,
    ImageProcessor, ProgressBlock, Resource, ResizingImageProcessor, RetrievalOptions,
    RoundCornerImageProcessor, SharedProcessor,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Fetch(config) => run_fetch(config).await,
        Command::Cache(config) => run_cache(config).await,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "pixcache=debug"
    } else {
        "pixcache=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn open_cache(args: &CacheArgs) -> Option<Arc<ImageCache>> {
    match ImageCache::shared(args.image_cache_config()) {
        Ok(cache) => Some(cache),
        Err(e) => {
            error!("Failed to open cache '{}': {}", args.cache_name, e);
            None
        }
    }
}

// =============================================================================
// Fetch Command
// =============================================================================

async fn run_fetch(config: FetchConfig) -> ExitCode {
    init_logging(config.cache.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let resource = match Resource::parse(&config.url) {
        Ok(resource) => resource,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let Some(cache) = open_cache(&config.cache) else {
        return ExitCode::FAILURE;
    };
    let downloader = Arc::new(ImageDownloader::http("pixcache").with_timeout(config.timeout()));
    let manager = match ImageManager::new(cache.clone(), downloader) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to start callback queue: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let options = build_options(&config);
    debug!(?options, "retrieving {}", resource.download_url);

    let progress: ProgressBlock = Arc::new(|received: u64, total: Option<u64>| match total {
        Some(total) => debug!("received {} of {} bytes", received, total),
        None => debug!("received {} bytes", received),
    });

    let result = match manager.retrieve(resource, options, Some(progress)).await {
        Ok(result) => result,
        Err(e) => {
            error!("Retrieval failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(ref path) = config.output {
        let format = ImageFormat::from_path(path).unwrap_or(codec::FALLBACK_FORMAT);
        // JPEG cannot hold an alpha channel
        let data = match codec::encode(&result.image, format).or_else(|_| {
            codec::encode(&DynamicImage::ImageRgb8(result.image.to_rgb8()), format)
        }) {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode image as {:?}: {}", format, e);
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = tokio::fs::write(path, &data).await {
            error!("Failed to write {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
        info!("Wrote {}", path.display());
    }

    let cache_path = cache.cache_path(result.source.cache_key(), &processor_identifier(&config));
    if config.json {
        let json = serde_json::json!({
            "url": config.url,
            "cache_key": result.source.cache_key(),
            "cache_type": result.cache_type,
            "width": result.image.width(),
            "height": result.image.height(),
            "cache_path": cache_path,
            "output": config.output,
        });
        match serde_json::to_string_pretty(&json) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                error!("Failed to format summary: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!(
            "{}x{} image from {:?} cache",
            result.image.width(),
            result.image.height(),
            result.cache_type
        );
        println!("  cache file: {}", cache_path.display());
    }

    ExitCode::SUCCESS
}

/// Chain the processors requested on the command line, in a fixed order.
fn build_processor(config: &FetchConfig) -> Option<SharedProcessor> {
    let mut steps: Vec<SharedProcessor> = Vec::new();

    if let Some((width, height)) = config.resize_size() {
        steps.push(Arc::new(ResizingImageProcessor::new(
            width,
            height,
            config.resize_mode.into(),
        )));
    }
    if let Some(radius) = config.round_corner {
        steps.push(Arc::new(RoundCornerImageProcessor::new(radius)));
    }
    if let Some(sigma) = config.blur {
        steps.push(Arc::new(BlurImageProcessor::new(sigma)));
    }
    if config.grayscale {
        steps.push(Arc::new(GrayscaleImageProcessor));
    }

    steps.into_iter().reduce(append)
}

fn processor_identifier(config: &FetchConfig) -> String {
    build_processor(config)
        .map(|processor| processor.identifier().to_string())
        .unwrap_or_default()
}

fn build_options(config: &FetchConfig) -> RetrievalOptions {
    // The process exits after delivery, so disk writes are always awaited
    let mut options = RetrievalOptions::new().with_wait_for_cache();

    if let Some(processor) = build_processor(config) {
        options = options.with_processor(processor);
    }
    if config.force_refresh {
        options = options.with_force_refresh();
    }
    if config.only_from_cache {
        options = options.with_only_from_cache();
    }
    if config.from_memory_or_refresh {
        options = options.with_from_memory_cache_or_refresh();
    }
    if config.memory_only {
        options = options.with_cache_memory_only();
    }
    if config.cache_original {
        options = options.with_cache_original_image();
    }
    options
}

// =============================================================================
// Cache Command
// =============================================================================

async fn run_cache(config: CacheConfig) -> ExitCode {
    init_logging(config.cache.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let Some(cache) = open_cache(&config.cache) else {
        return ExitCode::FAILURE;
    };

    match config.action {
        CacheAction::Status {
            ref key,
            ref processor_id,
        } => {
            let cache_type = cache.image_cached_type(key, processor_id);
            println!("{:?}", cache_type);
            if cache_type.is_cached() {
                println!("  cache file: {}", cache.cache_path(key, processor_id).display());
            }
        }
        CacheAction::Clear { memory_only } => {
            cache.clear_memory_cache();
            if !memory_only {
                if let Err(e) = cache.clear_disk_cache().await {
                    error!("Failed to clear disk cache: {}", e);
                    return ExitCode::FAILURE;
                }
            }
            println!("Cache '{}' cleared", cache.name());
        }
        CacheAction::CleanExpired => {
            let before = cache.disk_storage_size().unwrap_or(0);
            cache.clean_expired_memory_cache();
            if let Err(e) = cache.clean_expired_disk_cache().await {
                error!("Failed to clean disk cache: {}", e);
                return ExitCode::FAILURE;
            }
            let after = cache.disk_storage_size().unwrap_or(0);
            println!(
                "Removed {} bytes, {} bytes remain",
                before.saturating_sub(after),
                after
            );
        }
        CacheAction::Size => match cache.disk_storage_size() {
            Ok(size) => println!("{}", size),
            Err(e) => {
                error!("Failed to read disk cache size: {}", e);
                return ExitCode::FAILURE;
            }
        },
    }

    ExitCode::SUCCESS
}
