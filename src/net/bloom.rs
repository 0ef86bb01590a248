//! Bloom filters
//!
//! - [`BloomFilter`]: the relay filter a peer installs with filterload
//! - [`RollingBloomFilter`]: per-peer "already known" inventory set that
//!   forgets old entries instead of saturating

use crate::protocol::payload::FilterLoad;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// =============================================================================
// Constants
// =============================================================================

/// Largest filter a peer may load, in bytes
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// Most hash functions a loaded filter may use
pub const MAX_HASH_FUNCS: u32 = 50;

/// Bloom filter update flags
pub const BLOOM_UPDATE_NONE: u8 = 0;
pub const BLOOM_UPDATE_ALL: u8 = 1;
pub const BLOOM_UPDATE_P2PUBKEY_ONLY: u8 = 2;

// =============================================================================
// Bloom Filter
// =============================================================================

/// Probabilistic set membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    /// Filter data (bit array)
    data: Vec<u8>,
    /// Number of hash functions
    hash_funcs: u32,
    /// Tweak for hash randomization
    tweak: u32,
    /// Update flags
    flags: u8,
}

impl BloomFilter {
    /// Create an empty filter
    pub fn new(size_bytes: usize, hash_funcs: u32, tweak: u32) -> Self {
        Self {
            data: vec![0u8; size_bytes.clamp(1, MAX_BLOOM_FILTER_SIZE)],
            hash_funcs: hash_funcs.clamp(1, MAX_HASH_FUNCS),
            tweak,
            flags: BLOOM_UPDATE_NONE,
        }
    }

    /// Create filter sized for `n_elements` at the target false positive rate
    pub fn for_elements(n_elements: usize, fp_rate: f64, tweak: u32) -> Self {
        // Optimal size: -1 / (ln(2)^2) * n * ln(p)
        let ln2_squared = std::f64::consts::LN_2 * std::f64::consts::LN_2;
        let n = n_elements.max(1) as f64;
        let size_bits = ((-1.0 / ln2_squared) * n * fp_rate.ln()) as usize;
        let size_bytes = (size_bits / 8).clamp(1, MAX_BLOOM_FILTER_SIZE);

        // Optimal hash functions: (m/n) * ln(2)
        let hash_funcs = ((size_bytes * 8) as f64 / n * std::f64::consts::LN_2) as u32;
        Self::new(size_bytes, hash_funcs, tweak)
    }

    /// Filter exactly as a peer sent it in filterload
    pub fn from_filterload(load: &FilterLoad) -> Self {
        Self {
            data: load.data.clone(),
            hash_funcs: load.hash_funcs,
            tweak: load.tweak,
            flags: load.flags,
        }
    }

    /// Whether a loaded filter respects the protocol size limits
    pub fn is_within_size_constraints(&self) -> bool {
        !self.data.is_empty()
            && self.data.len() <= MAX_BLOOM_FILTER_SIZE
            && self.hash_funcs <= MAX_HASH_FUNCS
    }

    pub fn insert(&mut self, data: &[u8]) {
        for i in 0..self.hash_funcs {
            let idx = self.hash(data, i);
            self.set_bit(idx);
        }
    }

    /// Check if data might be in the filter
    pub fn contains(&self, data: &[u8]) -> bool {
        (0..self.hash_funcs).all(|i| self.get_bit(self.hash(data, i)))
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    fn hash(&self, data: &[u8], n: u32) -> usize {
        if self.data.is_empty() {
            return 0;
        }
        let seed = n.wrapping_mul(0xFBA4_C795).wrapping_add(self.tweak);
        let mut hasher = Sha256::new();
        hasher.update(seed.to_le_bytes());
        hasher.update(data);
        let hash = hasher.finalize();

        let idx = u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]);
        (idx as usize) % (self.data.len() * 8)
    }

    fn set_bit(&mut self, idx: usize) {
        if let Some(byte) = self.data.get_mut(idx / 8) {
            *byte |= 1 << (idx % 8);
        }
    }

    fn get_bit(&self, idx: usize) -> bool {
        self.data
            .get(idx / 8)
            .map_or(false, |byte| byte & (1 << (idx % 8)) != 0)
    }
}

// =============================================================================
// Rolling Bloom Filter
// =============================================================================

/// Bloom filter that remembers roughly the last `capacity` insertions.
///
/// Two generations of `capacity / 2` entries each: once the current
/// generation fills up it becomes the previous one and the oldest entries
/// are forgotten.
#[derive(Debug, Clone)]
pub struct RollingBloomFilter {
    current: BloomFilter,
    previous: BloomFilter,
    generation_size: usize,
    count: usize,
    fp_rate: f64,
}

impl RollingBloomFilter {
    pub fn new(capacity: usize, fp_rate: f64) -> Self {
        let generation_size = (capacity / 2).max(1);
        Self {
            current: BloomFilter::for_elements(generation_size, fp_rate, rand::random()),
            previous: BloomFilter::for_elements(generation_size, fp_rate, rand::random()),
            generation_size,
            count: 0,
            fp_rate,
        }
    }

    pub fn insert(&mut self, data: &[u8]) {
        if self.count >= self.generation_size {
            let fresh =
                BloomFilter::for_elements(self.generation_size, self.fp_rate, rand::random());
            self.previous = std::mem::replace(&mut self.current, fresh);
            self.count = 0;
        }
        self.current.insert(data);
        self.count += 1;
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        self.current.contains(data) || self.previous.contains(data)
    }

    pub fn reset(&mut self) {
        self.current.clear();
        self.previous.clear();
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_filter_basic() {
        let mut filter = BloomFilter::new(1000, 10, 12345);

        filter.insert(b"hello");
        filter.insert(b"world");

        assert!(filter.contains(b"hello"));
        assert!(filter.contains(b"world"));
        assert!(!filter.contains(b"not_inserted"));
    }

    #[test]
    fn test_bloom_filter_clear() {
        let mut filter = BloomFilter::for_elements(100, 0.01, 7);
        filter.insert(b"test");
        assert!(!filter.is_empty());
        filter.clear();
        assert!(filter.is_empty());
    }

    #[test]
    fn test_filterload_size_constraints() {
        let ok = BloomFilter::from_filterload(&FilterLoad {
            data: vec![0; 100],
            hash_funcs: 5,
            tweak: 0,
            flags: BLOOM_UPDATE_ALL,
        });
        assert!(ok.is_within_size_constraints());
        assert_eq!(ok.flags(), BLOOM_UPDATE_ALL);

        let too_many_funcs = BloomFilter::from_filterload(&FilterLoad {
            data: vec![0; 100],
            hash_funcs: 51,
            tweak: 0,
            flags: 0,
        });
        assert!(!too_many_funcs.is_within_size_constraints());

        let too_big = BloomFilter::from_filterload(&FilterLoad {
            data: vec![0; MAX_BLOOM_FILTER_SIZE + 1],
            hash_funcs: 1,
            tweak: 0,
            flags: 0,
        });
        assert!(!too_big.is_within_size_constraints());
    }

    #[test]
    fn test_rolling_filter_forgets_old_entries() {
        let mut filter = RollingBloomFilter::new(20, 0.000_001);
        filter.insert(b"first");
        assert!(filter.contains(b"first"));

        // Two full generations push the first entry out
        for i in 0u32..25 {
            filter.insert(&i.to_le_bytes());
        }
        assert!(!filter.contains(b"first"));
        assert!(filter.contains(&24u32.to_le_bytes()));
    }
}
