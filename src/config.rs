//! Configuration for the `pixcache` command-line tool.
//!
//! This module provides the CLI surface, which supports:
//! - Command-line arguments via clap
//! - Environment variables with `PIXCACHE_` prefix
//! - Sensible defaults for all optional settings
//!
//! # Environment Variables
//!
//! - `PIXCACHE_CACHE_NAME` - Cache name, namespaces the disk directory (default: default)
//! - `PIXCACHE_CACHE_DIR` - Root directory of the disk cache (default: platform cache dir)
//! - `PIXCACHE_MEMORY_COST_LIMIT` - Memory tier limit in decoded bytes (default: 256MB)
//! - `PIXCACHE_MEMORY_COUNT_LIMIT` - Memory tier entry limit (default: 1000)
//! - `PIXCACHE_DISK_SIZE_LIMIT` - Disk tier limit in bytes, 0 for unlimited (default: 0)
//! - `PIXCACHE_DISK_EXPIRATION_DAYS` - Disk entry lifetime in days, 0 to never expire (default: 7)
//! - `PIXCACHE_TIMEOUT` - Download timeout in seconds (default: 15)

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::cache::{
    default_root, DiskStorageConfig, ImageCacheConfig, MemoryStorageConfig,
    DEFAULT_MEMORY_EXPIRATION,
};
use crate::processor::ContentMode;

// =============================================================================
// Default Values
// =============================================================================

pub use crate::cache::{DEFAULT_CACHE_NAME, DEFAULT_MEMORY_COST_LIMIT, DEFAULT_MEMORY_COUNT_LIMIT};

/// Default disk size limit in bytes (0 = unlimited).
pub const DEFAULT_DISK_SIZE_LIMIT: u64 = 0;

/// Default disk entry lifetime in days.
pub const DEFAULT_DISK_EXPIRATION_DAYS: u64 = 7;

/// Default download timeout in seconds.
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 15;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

// =============================================================================
// CLI Arguments
// =============================================================================

/// pixcache - fetch images through a two-tier memory and disk cache.
#[derive(Parser, Debug, Clone)]
#[command(name = "pixcache")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Retrieve an image through the cache and write it to a file.
    Fetch(FetchConfig),

    /// Inspect or maintain the cache.
    Cache(CacheConfig),
}

/// Options shared by every command that opens a cache.
#[derive(Args, Debug, Clone)]
pub struct CacheArgs {
    /// Cache name; the disk tier lives in `<cache-dir>/pixcache.<name>`.
    #[arg(long, default_value = DEFAULT_CACHE_NAME, env = "PIXCACHE_CACHE_NAME")]
    pub cache_name: String,

    /// Root directory of the disk tier.
    ///
    /// If not specified, uses the platform cache directory.
    #[arg(long, env = "PIXCACHE_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Memory tier limit in decoded bytes.
    #[arg(long, default_value_t = DEFAULT_MEMORY_COST_LIMIT, env = "PIXCACHE_MEMORY_COST_LIMIT")]
    pub memory_cost_limit: usize,

    /// Maximum number of images in the memory tier.
    #[arg(long, default_value_t = DEFAULT_MEMORY_COUNT_LIMIT, env = "PIXCACHE_MEMORY_COUNT_LIMIT")]
    pub memory_count_limit: usize,

    /// Disk tier limit in bytes (0 = unlimited).
    #[arg(long, default_value_t = DEFAULT_DISK_SIZE_LIMIT, env = "PIXCACHE_DISK_SIZE_LIMIT")]
    pub disk_size_limit: u64,

    /// Disk entry lifetime in days (0 = never expire).
    #[arg(long, default_value_t = DEFAULT_DISK_EXPIRATION_DAYS, env = "PIXCACHE_DISK_EXPIRATION_DAYS")]
    pub disk_expiration_days: u64,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl CacheArgs {
    /// Validate the cache options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_name.is_empty() {
            return Err("cache name must not be empty".to_string());
        }
        if self
            .cache_name
            .chars()
            .any(|c| std::path::is_separator(c) || c.is_control())
        {
            return Err("cache name must not contain path separators".to_string());
        }
        if self.memory_cost_limit == 0 {
            return Err("memory_cost_limit must be greater than 0".to_string());
        }
        if self.memory_count_limit == 0 {
            return Err("memory_count_limit must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Build the library cache configuration.
    pub fn image_cache_config(&self) -> ImageCacheConfig {
        let expiration = match self.disk_expiration_days {
            0 => None,
            days => Some(Duration::from_secs(days * SECONDS_PER_DAY)),
        };
        let directory = self.cache_dir.clone().unwrap_or_else(default_root);

        ImageCacheConfig {
            memory: MemoryStorageConfig {
                total_cost_limit: self.memory_cost_limit,
                count_limit: self.memory_count_limit,
                expiration: Some(DEFAULT_MEMORY_EXPIRATION),
            },
            disk: DiskStorageConfig::new(self.cache_name.clone())
                .with_directory(directory)
                .with_size_limit(self.disk_size_limit)
                .with_expiration(expiration),
        }
    }
}

// =============================================================================
// Fetch Command
// =============================================================================

/// Resize modes accepted on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeMode {
    /// Stretch to exactly the given size
    #[default]
    Exact,
    /// Fit inside the given size
    Fit,
    /// Cover the given size
    Fill,
}

impl From<ResizeMode> for ContentMode {
    fn from(mode: ResizeMode) -> Self {
        match mode {
            ResizeMode::Exact => ContentMode::None,
            ResizeMode::Fit => ContentMode::AspectFit,
            ResizeMode::Fill => ContentMode::AspectFill,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct FetchConfig {
    /// Absolute URL of the image.
    pub url: String,

    /// File to write the delivered image to.
    ///
    /// The format follows the extension; PNG when it has none.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Resize to WIDTHxHEIGHT.
    #[arg(long, value_name = "WIDTHxHEIGHT")]
    pub resize: Option<String>,

    /// How --resize fits the image.
    #[arg(long, value_enum, default_value_t = ResizeMode::Exact)]
    pub resize_mode: ResizeMode,

    /// Round the corners with this radius in pixels.
    #[arg(long)]
    pub round_corner: Option<u32>,

    /// Gaussian blur sigma.
    #[arg(long)]
    pub blur: Option<f32>,

    /// Convert to grayscale.
    #[arg(long, default_value_t = false)]
    pub grayscale: bool,

    /// Ignore cached images and download again.
    #[arg(long, default_value_t = false)]
    pub force_refresh: bool,

    /// Fail instead of downloading when the image is not cached.
    #[arg(long, default_value_t = false)]
    pub only_from_cache: bool,

    /// Check only the memory tier before downloading.
    #[arg(long, default_value_t = false)]
    pub from_memory_or_refresh: bool,

    /// Do not write to the disk tier.
    #[arg(long, default_value_t = false)]
    pub memory_only: bool,

    /// Also cache the unprocessed original when processing.
    #[arg(long, default_value_t = false)]
    pub cache_original: bool,

    /// Download timeout in seconds (0 = none).
    #[arg(long, default_value_t = DEFAULT_DOWNLOAD_TIMEOUT_SECS, env = "PIXCACHE_TIMEOUT")]
    pub timeout: u64,

    /// Print a JSON summary instead of plain text.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    #[command(flatten)]
    pub cache: CacheArgs,
}

impl FetchConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.cache.validate()?;

        if self.url.is_empty() {
            return Err("url is required".to_string());
        }
        if let Some(ref size) = self.resize {
            parse_size(size)?;
        }
        if let Some(sigma) = self.blur {
            if !(sigma > 0.0 && sigma.is_finite()) {
                return Err("blur must be a positive number".to_string());
            }
        }
        if self.only_from_cache && self.force_refresh {
            return Err("--only-from-cache and --force-refresh are mutually exclusive".to_string());
        }
        Ok(())
    }

    /// Parsed `--resize` value. Call `validate()` first.
    pub fn resize_size(&self) -> Option<(u32, u32)> {
        self.resize.as_deref().and_then(|s| parse_size(s).ok())
    }

    /// Download timeout, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Parse `WIDTHxHEIGHT` into non-zero dimensions.
pub fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("invalid size '{}', expected WIDTHxHEIGHT", value))?;

    let parse = |part: &str| -> Result<u32, String> {
        match part.trim().parse::<u32>() {
            Ok(0) | Err(_) => Err(format!(
                "invalid size '{}', dimensions must be positive integers",
                value
            )),
            Ok(n) => Ok(n),
        }
    };

    Ok((parse(width)?, parse(height)?))
}

// =============================================================================
// Cache Command
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct CacheConfig {
    #[command(subcommand)]
    pub action: CacheAction,

    #[command(flatten)]
    pub cache: CacheArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CacheAction {
    /// Show which tier holds an image.
    Status {
        /// Cache key, usually the image URL.
        key: String,

        /// Identifier of the processor the image was cached with.
        #[arg(long, default_value = "")]
        processor_id: String,
    },

    /// Remove cached images.
    Clear {
        /// Only clear the memory tier.
        #[arg(long, default_value_t = false)]
        memory_only: bool,
    },

    /// Remove expired disk entries and trim the disk tier to its size limit.
    CleanExpired,

    /// Print the size of the disk tier.
    Size,
}

impl CacheConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.cache.validate()?;
        if let CacheAction::Status { ref key, .. } = self.action {
            if key.is_empty() {
                return Err("key must not be empty".to_string());
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
