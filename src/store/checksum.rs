//! SHA-256 checksum helpers.
//!
//! Checksums travel on the wire as `sha256:<hex>`. A file may legitimately
//! carry no checksum (uploader opt-out); callers fall back to size-only
//! comparison and must flag the absence rather than treat it as a match.

use sha2::{Digest, Sha256};

/// Digest prefix identifying the hash algorithm.
pub const CHECKSUM_PREFIX: &str = "sha256:";

/// Computes the `sha256:<hex>` checksum of a byte slice.
pub fn compute(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!("{CHECKSUM_PREFIX}{}", hex::encode(digest))
}

/// Extracts the bare hex digest from a `sha256:`-prefixed checksum, or
/// returns the input unchanged when unprefixed.
pub fn bare_digest(checksum: &str) -> &str {
    checksum.strip_prefix(CHECKSUM_PREFIX).unwrap_or(checksum)
}
