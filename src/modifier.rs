//! Delivery-time image modifiers.
//!
//! A modifier runs on the image right before it is handed to the caller, for
//! cache hits and fresh fetches alike. Its output is never written to a cache.

use std::fmt;
use std::sync::Arc;

use crate::SharedImage;

/// Transforms an image right before delivery.
pub trait ImageModifier: Send + Sync {
    fn modify(&self, image: SharedImage) -> SharedImage;
}

/// Shared handle to a modifier.
pub type SharedModifier = Arc<dyn ImageModifier>;

/// A modifier backed by a closure.
pub struct AnyImageModifier<F> {
    modify: F,
}

impl<F> AnyImageModifier<F>
where
    F: Fn(SharedImage) -> SharedImage + Send + Sync + 'static,
{
    pub fn new(modify: F) -> Self {
        Self { modify }
    }

    pub fn shared(modify: F) -> SharedModifier {
        Arc::new(Self::new(modify))
    }
}

impl<F> ImageModifier for AnyImageModifier<F>
where
    F: Fn(SharedImage) -> SharedImage + Send + Sync,
{
    fn modify(&self, image: SharedImage) -> SharedImage {
        (self.modify)(image)
    }
}

impl<F> fmt::Debug for AnyImageModifier<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AnyImageModifier")
    }
}
