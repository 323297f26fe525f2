//! Content-addressed file names for arbitrary keys

use sha1::{Digest, Sha1};

/// Lowercase hex SHA-1 of `key`.
///
/// Deterministic across runs and platforms, always 40 characters from
/// `[0-9a-f]`, so any key (full URLs included) maps to a safe file name.
pub fn derive_file_name(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}
