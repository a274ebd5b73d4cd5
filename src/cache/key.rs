//! Cache key derivation.
//!
//! A cached artifact is identified by the locator's cache key combined with
//! the identifier of the processor that produced it. The default processor
//! has an empty identifier, so the original image lives under the bare key.

use sha2::{Digest, Sha256};

/// Separator between the cache key and a processor identifier.
pub const PROCESSOR_SEPARATOR: char = '@';

/// Combine a cache key with a processor identifier.
///
/// The default processor (empty identifier) maps to the key itself.
pub fn computed_key(key: &str, processor_identifier: &str) -> String {
    if processor_identifier.is_empty() {
        key.to_string()
    } else {
        format!("{}{}{}", key, PROCESSOR_SEPARATOR, processor_identifier)
    }
}

/// File name used by the disk tier for a computed key.
///
/// Lowercase hex SHA-256, so names are filesystem-safe and stable across
/// process restarts.
pub fn disk_file_name(computed_key: &str) -> String {
    hex::encode(Sha256::digest(computed_key.as_bytes()))
}
