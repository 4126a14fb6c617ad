//! SHA-256 helpers used to verify provisioned model files.

use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Incremental SHA-256 over a byte stream that arrives in chunks.
#[derive(Default)]
pub struct StreamingDigest {
    hasher: Sha256,
    len: u64,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finish_hex(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

/// Compare two hex digests ignoring case.
pub fn digest_matches(actual: &str, expected: &str) -> bool {
    actual.eq_ignore_ascii_case(expected.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_produces_known_hash() {
        let hash = sha256_hex(b"");
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn streaming_matches_one_shot() {
        let mut digest = StreamingDigest::new();
        digest.update(b"hello ");
        digest.update(b"world");
        assert_eq!(digest.len(), 11);
        assert_eq!(digest.finish_hex(), sha256_hex(b"hello world"));
    }

    #[test]
    fn digest_comparison_ignores_case_and_whitespace() {
        let hash = sha256_hex(b"abc");
        assert!(digest_matches(&hash, &format!(" {} ", hash.to_uppercase())));
        assert!(!digest_matches(&hash, &sha256_hex(b"abd")));
    }
}
