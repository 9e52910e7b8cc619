//! Content hashing for fetched snapshots

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hex-encoded SHA-256 of page content as UTF-8
pub fn content_hash(content: &str) -> String {
    sha256_hex(content.as_bytes())
}
