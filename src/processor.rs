//! Image processors.
//!
//! A processor turns fetched bytes or an already decoded image into the image
//! that gets cached and delivered. Every processor has a stable identifier;
//! the identifier is part of the cache key, so each processed variant of a
//! resource is cached on its own.
//!
//! The default processor has the empty identifier and only decodes. Its
//! output is cached under the bare resource key and is what the engine calls
//! the "original" image.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

use crate::codec;
use crate::error::ProcessorError;
use crate::options::RetrievalOptions;
use crate::SharedImage;

/// Separator between identifiers of chained processors.
pub const CHAIN_SEPARATOR: &str = "|>";

/// Input to a processor.
#[derive(Debug, Clone)]
pub enum ImageProcessItem {
    /// A decoded image, e.g. an original read back from the cache
    Image(SharedImage),
    /// Raw bytes as fetched
    Data(Bytes),
}

/// Transforms an input item into an image.
pub trait ImageProcessor: Send + Sync {
    /// Stable identifier. Equal identifiers must mean equal output.
    fn identifier(&self) -> &str;

    /// Produce the processed image.
    fn process(
        &self,
        item: &ImageProcessItem,
        options: &RetrievalOptions,
    ) -> Result<DynamicImage, ProcessorError>;
}

/// Shared handle to a processor.
pub type SharedProcessor = Arc<dyn ImageProcessor>;

impl fmt::Debug for dyn ImageProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ImageProcessor")
            .field(&self.identifier())
            .finish()
    }
}

/// Whether a processor is the decode-only default.
pub fn is_default(processor: &dyn ImageProcessor) -> bool {
    processor.identifier().is_empty()
}

/// Decode `item` into an owned image.
fn materialize(item: &ImageProcessItem, identifier: &str) -> Result<DynamicImage, ProcessorError> {
    match item {
        ImageProcessItem::Image(image) => Ok(image.as_ref().clone()),
        ImageProcessItem::Data(data) => {
            codec::decode(data).map_err(|e| ProcessorError::ProcessingFailed {
                processor: identifier.to_string(),
                message: e.to_string(),
            })
        }
    }
}

// =============================================================================
// Default
// =============================================================================

/// Decodes data and passes images through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultImageProcessor;

impl DefaultImageProcessor {
    pub fn shared() -> SharedProcessor {
        Arc::new(Self)
    }
}

impl ImageProcessor for DefaultImageProcessor {
    fn identifier(&self) -> &str {
        ""
    }

    fn process(
        &self,
        item: &ImageProcessItem,
        _options: &RetrievalOptions,
    ) -> Result<DynamicImage, ProcessorError> {
        materialize(item, "")
    }
}

// =============================================================================
// Resizing
// =============================================================================

/// How an image is fitted into a reference size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentMode {
    /// Stretch to exactly the reference size
    #[default]
    None,
    /// Scale to fit inside the reference size, keeping the aspect ratio
    AspectFit,
    /// Scale to cover the reference size, keeping the aspect ratio
    AspectFill,
}

impl fmt::Display for ContentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContentMode::None => "none",
            ContentMode::AspectFit => "aspect_fit",
            ContentMode::AspectFill => "aspect_fill",
        };
        f.write_str(name)
    }
}

/// Resizes to a reference size.
#[derive(Debug, Clone)]
pub struct ResizingImageProcessor {
    width: u32,
    height: u32,
    mode: ContentMode,
    identifier: String,
}

impl ResizingImageProcessor {
    pub fn new(width: u32, height: u32, mode: ContentMode) -> Self {
        Self {
            width,
            height,
            mode,
            identifier: format!("pixcache.resizing({}x{}, {})", width, height, mode),
        }
    }

    /// The size the output will have for an input of `width` x `height`.
    pub fn target_size(&self, width: u32, height: u32) -> (u32, u32) {
        if width == 0 || height == 0 {
            return (self.width, self.height);
        }
        let scale_x = self.width as f64 / width as f64;
        let scale_y = self.height as f64 / height as f64;
        let scale = match self.mode {
            ContentMode::None => return (self.width, self.height),
            ContentMode::AspectFit => scale_x.min(scale_y),
            ContentMode::AspectFill => scale_x.max(scale_y),
        };
        let scaled = |v: u32| ((v as f64 * scale).round() as u32).max(1);
        (scaled(width), scaled(height))
    }
}

impl ImageProcessor for ResizingImageProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(
        &self,
        item: &ImageProcessItem,
        _options: &RetrievalOptions,
    ) -> Result<DynamicImage, ProcessorError> {
        if self.width == 0 || self.height == 0 {
            return Err(ProcessorError::ProcessingFailed {
                processor: self.identifier.clone(),
                message: "reference size must be non-zero".to_string(),
            });
        }
        let image = materialize(item, &self.identifier)?;
        let (width, height) = self.target_size(image.width(), image.height());
        Ok(image.resize_exact(width, height, FilterType::Triangle))
    }
}

// =============================================================================
// Round Corner
// =============================================================================

/// Makes the corners outside a given radius transparent.
#[derive(Debug, Clone)]
pub struct RoundCornerImageProcessor {
    radius: u32,
    identifier: String,
}

impl RoundCornerImageProcessor {
    pub fn new(radius: u32) -> Self {
        Self {
            radius,
            identifier: format!("pixcache.round_corner({})", radius),
        }
    }
}

impl ImageProcessor for RoundCornerImageProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(
        &self,
        item: &ImageProcessItem,
        _options: &RetrievalOptions,
    ) -> Result<DynamicImage, ProcessorError> {
        let image = materialize(item, &self.identifier)?;
        let (width, height) = image.dimensions();
        let radius = self.radius.min(width / 2).min(height / 2);
        let mut rgba = image.into_rgba8();
        if radius == 0 {
            return Ok(DynamicImage::ImageRgba8(rgba));
        }

        let r = radius as f64;
        let limit = r * r;
        for (x, y, pixel) in rgba.enumerate_pixels_mut() {
            // Distance from the nearest corner circle's center, if in a corner square
            let dx = if x < radius {
                r - x as f64 - 0.5
            } else if x >= width - radius {
                x as f64 + 0.5 - (width - radius) as f64
            } else {
                continue;
            };
            let dy = if y < radius {
                r - y as f64 - 0.5
            } else if y >= height - radius {
                y as f64 + 0.5 - (height - radius) as f64
            } else {
                continue;
            };
            if dx * dx + dy * dy > limit {
                pixel.0[3] = 0;
            }
        }
        Ok(DynamicImage::ImageRgba8(rgba))
    }
}

// =============================================================================
// Blur / Grayscale
// =============================================================================

/// Gaussian blur.
#[derive(Debug, Clone)]
pub struct BlurImageProcessor {
    sigma: f32,
    identifier: String,
}

impl BlurImageProcessor {
    pub fn new(sigma: f32) -> Self {
        Self {
            sigma,
            identifier: format!("pixcache.blur({})", sigma),
        }
    }
}

impl ImageProcessor for BlurImageProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(
        &self,
        item: &ImageProcessItem,
        _options: &RetrievalOptions,
    ) -> Result<DynamicImage, ProcessorError> {
        let image = materialize(item, &self.identifier)?;
        Ok(image.blur(self.sigma))
    }
}

/// Converts to grayscale.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrayscaleImageProcessor;

impl ImageProcessor for GrayscaleImageProcessor {
    fn identifier(&self) -> &str {
        "pixcache.grayscale"
    }

    fn process(
        &self,
        item: &ImageProcessItem,
        _options: &RetrievalOptions,
    ) -> Result<DynamicImage, ProcessorError> {
        let image = materialize(item, self.identifier())?;
        Ok(image.grayscale())
    }
}

// =============================================================================
// Chaining
// =============================================================================

/// Two processors run one after the other.
struct ChainedImageProcessor {
    first: SharedProcessor,
    second: SharedProcessor,
    identifier: String,
}

impl ImageProcessor for ChainedImageProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(
        &self,
        item: &ImageProcessItem,
        options: &RetrievalOptions,
    ) -> Result<DynamicImage, ProcessorError> {
        let intermediate = self.first.process(item, options)?;
        self.second
            .process(&ImageProcessItem::Image(Arc::new(intermediate)), options)
    }
}

/// Chain two processors. The result's identifier is `"{first}|>{second}"`.
pub fn append(first: SharedProcessor, second: SharedProcessor) -> SharedProcessor {
    let identifier = format!(
        "{}{}{}",
        first.identifier(),
        CHAIN_SEPARATOR,
        second.identifier()
    );
    Arc::new(ChainedImageProcessor {
        first,
        second,
        identifier,
    })
}

// =============================================================================
// Tests
// =============================================================================
