//! Bundle fingerprinting.
//!
//! Bundles are content-addressed by the SHA-256 hex digest of their bytes.
//! Every participant (client upload, node cache, worker creation) must use
//! the same digest for the addressing to line up.

use sha2::{Digest, Sha256};

/// Compute the fingerprint of a bundle's bytes.
pub fn bundle_fingerprint(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Whether a string is a plausible fingerprint (lowercase hex, bounded
/// length). Used by the node to reject cache keys that could escape the
/// bundle directory.
pub fn is_valid_fingerprint(hash: &str) -> bool {
    !hash.is_empty()
        && hash.len() <= 128
        && hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_produces_known_hash() {
        assert_eq!(
            bundle_fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn consistent_output() {
        let data = b"module.exports = 1;";
        assert_eq!(bundle_fingerprint(data), bundle_fingerprint(data));
        assert_eq!(bundle_fingerprint(data).len(), 64);
    }

    #[test]
    fn rejects_path_like_keys() {
        assert!(is_valid_fingerprint("abc123"));
        assert!(!is_valid_fingerprint(""));
        assert!(!is_valid_fingerprint("../etc/passwd"));
        assert!(!is_valid_fingerprint("ABC123"));
    }
}
