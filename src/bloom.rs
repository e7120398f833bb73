//! # Bloom Filters for Broadcast Matching
//!
//! Broadcast senders summarize their message's interface/member/path/arg
//! strings into a fixed-size bit array; receivers register byte masks and a
//! message matches a mask when every mask bit is set in the filter. The
//! exact hash inputs are a contract between senders and subscribers; the
//! engine only fixes the bit size and hash count per bus and evaluates the
//! mask containment test.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Smallest accepted filter size in bytes.
pub const BLOOM_MIN_SIZE: usize = 8;
/// Largest accepted filter size in bytes.
pub const BLOOM_MAX_SIZE: usize = 1024;

/// Per-bus bloom geometry, fixed at bus creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomParams {
    /// Filter size in bytes; within bounds and 8-byte aligned.
    pub size: usize,
    /// Number of hash functions each key contributes.
    pub n_hash: usize,
}

impl BloomParams {
    /// Validate the geometry bounds.
    pub fn validate(&self) -> Result<()> {
        if self.size < BLOOM_MIN_SIZE || self.size > BLOOM_MAX_SIZE {
            return Err(Error::InvalidArgument("bloom size out of bounds"));
        }
        if self.size % 8 != 0 {
            return Err(Error::InvalidArgument("bloom size not 8-byte aligned"));
        }
        if self.n_hash == 0 {
            return Err(Error::InvalidArgument("bloom hash count must be >= 1"));
        }
        Ok(())
    }
}

impl Default for BloomParams {
    fn default() -> Self {
        Self {
            size: 64,
            n_hash: 8,
        }
    }
}

/// A sender-populated bit array evaluated against receiver masks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter(pub Vec<u8>);

impl BloomFilter {
    /// An empty filter of the bus's geometry.
    pub fn new(params: &BloomParams) -> Self {
        BloomFilter(vec![0u8; params.size])
    }

    /// Build a filter from a set of match keys.
    pub fn from_keys<S: AsRef<str>>(params: &BloomParams, keys: &[S]) -> Self {
        let mut filter = Self::new(params);
        for key in keys {
            filter.add(params, key.as_ref());
        }
        filter
    }

    /// Mix one key into the filter, `n_hash` bits worth.
    pub fn add(&mut self, params: &BloomParams, key: &str) {
        let bits = (params.size * 8) as u64;
        for seed in 0..params.n_hash as u64 {
            let mut hasher = DefaultHasher::new();
            seed.hash(&mut hasher);
            key.hash(&mut hasher);
            let bit = hasher.finish() % bits;
            self.0[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// True when every bit of `mask` is also set here.
    ///
    /// A mask of different size never matches; geometry is fixed per bus,
    /// so a size mismatch means the rule was registered against another
    /// bus's parameters.
    pub fn contains_mask(&self, mask: &[u8]) -> bool {
        if mask.len() != self.0.len() {
            return false;
        }
        self.0
            .iter()
            .zip(mask.iter())
            .all(|(filter, mask)| filter & mask == *mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Geometry bounds: size window, alignment, hash count.
    #[test]
    fn params_bounds() {
        assert!(BloomParams { size: 64, n_hash: 4 }.validate().is_ok());
        assert!(BloomParams { size: 4, n_hash: 4 }.validate().is_err());
        assert!(BloomParams { size: 2048, n_hash: 4 }.validate().is_err());
        assert!(BloomParams { size: 60, n_hash: 4 }.validate().is_err());
        assert!(BloomParams { size: 64, n_hash: 0 }.validate().is_err());
    }

    /// A filter built from a key contains the mask built from the same key,
    /// and an unrelated key's mask does not match.
    #[test]
    fn mask_containment() {
        let params = BloomParams::default();
        let filter = BloomFilter::from_keys(&params, &["org.example.iface.Signal"]);
        let matching = BloomFilter::from_keys(&params, &["org.example.iface.Signal"]);
        let other = BloomFilter::from_keys(&params, &["org.example.iface.Other"]);

        assert!(filter.contains_mask(&matching.0));
        assert!(!filter.contains_mask(&other.0));
        // The empty mask matches everything.
        assert!(filter.contains_mask(&vec![0u8; params.size]));
    }

    /// Adding unrelated keys never unsets previously matching bits.
    #[test]
    fn match_is_monotonic_under_additions() {
        let params = BloomParams::default();
        let mask = BloomFilter::from_keys(&params, &["a.b.c"]);
        let mut filter = BloomFilter::from_keys(&params, &["a.b.c"]);
        assert!(filter.contains_mask(&mask.0));
        filter.add(&params, "x.y.z");
        assert!(filter.contains_mask(&mask.0));
    }
}
