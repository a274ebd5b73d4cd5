//! Conversion between cached images and the bytes stored on disk.

use std::sync::Arc;

use bytes::Bytes;
use image::DynamicImage;

use crate::codec;

/// Converts images to disk bytes and back.
pub trait CacheSerializer: Send + Sync {
    /// Serialize an image. `original` holds the bytes the image was decoded or
    /// processed from, when known. Returns `None` if the image cannot be
    /// serialized.
    fn data(&self, image: &DynamicImage, original: Option<&[u8]>) -> Option<Bytes>;

    /// Deserialize bytes previously produced by [`CacheSerializer::data`].
    fn image(&self, data: &[u8]) -> Option<DynamicImage>;
}

/// Shared handle to a serializer.
pub type SharedSerializer = Arc<dyn CacheSerializer>;

/// Serializer backed by the `image` codecs.
///
/// Images are re-encoded in the format of their original data (PNG when the
/// original is unknown or the image cannot be written in that format). With
/// `prefer_cache_original_data`, the original bytes are stored verbatim
/// instead; only enable it when the stored image is not processed.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCacheSerializer {
    pub prefer_cache_original_data: bool,
}

impl DefaultCacheSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A serializer that stores original bytes verbatim when available.
    pub fn preferring_original_data() -> Self {
        Self {
            prefer_cache_original_data: true,
        }
    }

    /// Shared handle to the default serializer.
    pub fn shared() -> SharedSerializer {
        Arc::new(Self::default())
    }
}

impl CacheSerializer for DefaultCacheSerializer {
    fn data(&self, image: &DynamicImage, original: Option<&[u8]>) -> Option<Bytes> {
        if self.prefer_cache_original_data {
            if let Some(original) = original {
                return Some(Bytes::copy_from_slice(original));
            }
        }
        let format = original.and_then(codec::image_format);
        codec::encode_or_fallback(image, format).ok()
    }

    fn image(&self, data: &[u8]) -> Option<DynamicImage> {
        codec::decode(data).ok()
    }
}
