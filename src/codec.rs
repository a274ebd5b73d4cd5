//! Image codec helpers.
//!
//! Thin wrappers over the `image` crate used by the default processor and the
//! default cache serializer.
//!
//! # Design Decisions
//!
//! - **Format sniffing**: the input format is guessed from the magic bytes,
//!   never from the URL extension.
//!
//! - **PNG fallback**: images that cannot be written in their source format
//!   (e.g. an RGBA image produced by a processor from a JPEG source) are
//!   written as PNG instead.

use std::io::Cursor;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat, ImageResult};

/// Format used when the source format is unknown or cannot hold the image.
pub const FALLBACK_FORMAT: ImageFormat = ImageFormat::Png;

/// Decode raw bytes into an image, sniffing the format from the data.
pub fn decode(data: &[u8]) -> ImageResult<DynamicImage> {
    image::load_from_memory(data)
}

/// Encode an image in the given format.
pub fn encode(image: &DynamicImage, format: ImageFormat) -> ImageResult<Bytes> {
    let mut output = Cursor::new(Vec::new());
    image.write_to(&mut output, format)?;
    Ok(Bytes::from(output.into_inner()))
}

/// Encode an image in `format`, falling back to PNG if that fails.
pub fn encode_or_fallback(image: &DynamicImage, format: Option<ImageFormat>) -> ImageResult<Bytes> {
    match format {
        Some(format) if format != FALLBACK_FORMAT => {
            encode(image, format).or_else(|_| encode(image, FALLBACK_FORMAT))
        }
        _ => encode(image, FALLBACK_FORMAT),
    }
}

/// Guess the format of encoded image data.
pub fn image_format(data: &[u8]) -> Option<ImageFormat> {
    image::guess_format(data).ok()
}

/// Decoded size of an image in bytes, used as its memory cost.
#[inline]
pub fn memory_cost(image: &DynamicImage) -> usize {
    image.as_bytes().len()
}
