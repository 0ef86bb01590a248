//! Hashing utilities for the wire protocol
//!
//! Provides SHA-256 based hashing used for message checksums, inventory
//! hashes and keyed netgroup buckets.

use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
/// Used for message checksums and transaction/block identifiers
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Computes double SHA-256 hash and returns it as a hex string
pub fn double_sha256_hex(data: &[u8]) -> String {
    hex::encode(double_sha256(data))
}

/// First four bytes of the double SHA-256, as carried in message headers
pub fn checksum(data: &[u8]) -> [u8; 4] {
    let hash = double_sha256(data);
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Incremental double SHA-256.
///
/// Payload bytes are fed as they arrive from the socket; the outer hash is
/// only computed when [`PayloadHasher::finalize`] is called, so a completed
/// message never needs a second pass over its payload.
#[derive(Clone, Default)]
pub struct PayloadHasher {
    inner: Sha256,
}

impl PayloadHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finish the inner hash and apply the outer round
    pub fn finalize(self) -> [u8; 32] {
        let first: [u8; 32] = self.inner.finalize().into();
        sha256(&first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        let data = b"hello world";
        assert_eq!(
            hex::encode(sha256(data)),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_empty_payload_checksum() {
        // Well known checksum of an empty payload (verack, getaddr, ...)
        assert_eq!(checksum(&[]), [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut hasher = PayloadHasher::new();
        for chunk in data.chunks(7) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finalize(), double_sha256(data));
    }
}
