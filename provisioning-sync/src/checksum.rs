//! SHA-256 helpers for file checksums and stable generated names.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(data);
    hex::encode(h.finalize())
}

/// First 12 hex chars of the SHA-256 of `input`, for derived names.
pub fn short_hash(input: &str) -> String {
    let mut full = sha256_hex(input.as_bytes());
    full.truncate(12);
    full
}
