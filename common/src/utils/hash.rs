use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of arbitrary bytes.
///
/// Used for file content hashes in the tracker and as the basis for stable
/// chunk identifiers.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable() {
        assert_eq!(sha256_hex(b"atlas"), sha256_hex(b"atlas"));
        assert_ne!(sha256_hex(b"atlas"), sha256_hex(b"atlas "));
    }

    #[test]
    fn digest_is_hex_of_expected_length() {
        let digest = sha256_hex(b"");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
