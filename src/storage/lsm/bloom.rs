//! Bloom Filter for fast negative lookups
//!
//! Built once per SSTable from the hashes of its keys.
//!
//! ## Sizing
//! - bits per key: `-ln(fp) / ln(2)^2` (about 9.6 for fp = 1%)
//! - probes: `round(bits_per_key * ln 2)`, clamped to `[1, 30]`
//! - at least 64 bits, so tiny tables still filter
//!
//! Probes use double hashing off a single 32-bit hash
//! (`delta = h.rotate_right(17)`), so one [`hash`](crate::storage::hash::hash)
//! per lookup is enough.

use crate::storage::hash::hash;

const MIN_BITS: usize = 64;
const MAX_PROBES: u32 = 30;

/// Bloom filter for SSTable
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    /// Bit array
    bits: Vec<u8>,

    /// Number of probes per key
    num_hashes: u32,

    /// Number of addressable bits (`bits.len() * 8`)
    num_bits: usize,
}

/// Bits per key for a target false-positive rate
pub fn bits_per_key(false_positive: f64) -> f64 {
    let fp = false_positive.clamp(1e-9, 0.5);
    -fp.ln() / (std::f64::consts::LN_2 * std::f64::consts::LN_2)
}

impl BloomFilter {
    /// Build a filter over the given key hashes
    pub fn from_hashes(hashes: &[u32], false_positive: f64) -> Self {
        let bpk = bits_per_key(false_positive);
        let num_hashes = ((bpk * std::f64::consts::LN_2).round() as u32).clamp(1, MAX_PROBES);

        let wanted = (hashes.len() as f64 * bpk).ceil() as usize;
        let num_bytes = wanted.max(MIN_BITS).div_ceil(8);
        let mut filter = Self {
            bits: vec![0u8; num_bytes],
            num_hashes,
            num_bits: num_bytes * 8,
        };
        for &h in hashes {
            filter.insert_hash(h);
        }
        filter
    }

    pub fn insert_hash(&mut self, mut h: u32) {
        let delta = h.rotate_right(17);
        for _ in 0..self.num_hashes {
            let bit_pos = (h as usize) % self.num_bits;
            self.set_bit(bit_pos);
            h = h.wrapping_add(delta);
        }
    }

    /// Check if a hash might be present (no false negatives)
    pub fn may_contain_hash(&self, mut h: u32) -> bool {
        if self.num_bits == 0 {
            return false;
        }
        let delta = h.rotate_right(17);
        for _ in 0..self.num_hashes {
            let bit_pos = (h as usize) % self.num_bits;
            if !self.get_bit(bit_pos) {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.may_contain_hash(hash(key))
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Serialize to bytes: `[k: u32][num_bits: u64][bits]`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.byte_size());
        buf.extend_from_slice(&self.num_hashes.to_le_bytes());
        buf.extend_from_slice(&(self.num_bits as u64).to_le_bytes());
        buf.extend_from_slice(&self.bits);
        buf
    }

    /// Deserialize from bytes; `None` if the header is inconsistent
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }
        let num_hashes = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let mut nbits = [0u8; 8];
        nbits.copy_from_slice(&data[4..12]);
        let num_bits = u64::from_le_bytes(nbits) as usize;
        let bits = data[12..].to_vec();

        if num_bits != bits.len() * 8 || num_hashes == 0 || num_hashes > MAX_PROBES {
            return None;
        }
        Some(Self {
            bits,
            num_hashes,
            num_bits,
        })
    }

    pub fn byte_size(&self) -> usize {
        12 + self.bits.len()
    }

    fn set_bit(&mut self, pos: usize) {
        self.bits[pos / 8] |= 1 << (pos % 8);
    }

    fn get_bit(&self, pos: usize) -> bool {
        (self.bits[pos / 8] & (1 << (pos % 8))) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(range: std::ops::Range<usize>) -> Vec<u32> {
        range.map(|i| hash(format!("key_{}", i).as_bytes())).collect()
    }

    #[test]
    fn test_probe_count_from_fp() {
        let filter = BloomFilter::from_hashes(&hashes(0..10), 0.01);
        assert_eq!(filter.num_hashes(), 7);

        let loose = BloomFilter::from_hashes(&hashes(0..10), 0.5);
        assert_eq!(loose.num_hashes(), 1);
    }

    #[test]
    fn test_no_false_negatives() {
        let keys = hashes(0..5000);
        let filter = BloomFilter::from_hashes(&keys, 0.01);
        assert!(keys.iter().all(|&h| filter.may_contain_hash(h)));
    }

    #[test]
    fn test_false_positive_rate() {
        let num_keys = 10_000;
        let filter = BloomFilter::from_hashes(&hashes(0..num_keys), 0.01);

        let probes = 100_000;
        let false_positives = (num_keys..num_keys + probes)
            .filter(|i| filter.may_contain(format!("key_{}", i).as_bytes()))
            .count();
        let fpr = false_positives as f64 / probes as f64;

        assert!(fpr < 0.02, "FPR too high: {:.2}%", fpr * 100.0);
    }

    #[test]
    fn test_small_filter_still_filters() {
        let filter = BloomFilter::from_hashes(&[hash(b"only")], 0.01);
        assert!(filter.may_contain(b"only"));
        assert!(filter.byte_size() >= 12 + MIN_BITS / 8);
    }

    #[test]
    fn test_serialization() {
        let filter = BloomFilter::from_hashes(&hashes(0..100), 0.01);
        let restored = BloomFilter::from_bytes(&filter.to_bytes()).unwrap();
        assert_eq!(filter, restored);
        assert!(restored.may_contain(b"key_42"));

        assert!(BloomFilter::from_bytes(&[0u8; 5]).is_none());
    }
}
