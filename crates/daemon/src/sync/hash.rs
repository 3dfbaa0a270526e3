// Content hashing so unchanged files are not rewritten into the sandbox.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 hash of file content.
pub type ContentHash = String;

/// Compute the SHA-256 hash of the given bytes, returned as a lowercase hex string.
pub fn sha256_hex(content: &[u8]) -> ContentHash {
    let digest = Sha256::digest(content);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
