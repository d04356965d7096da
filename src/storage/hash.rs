//! Key hash used by bloom filters
//!
//! A Murmur-style 32-bit hash over little-endian 4-byte chunks. The result
//! is part of the on-disk bloom format, so it must never change.

const SEED: u32 = 0xbc9f_1d34;
const M: u32 = 0xc6a4_a793;

pub fn hash(data: &[u8]) -> u32 {
    let mut h = SEED ^ (data.len() as u32).wrapping_mul(M);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h = h.wrapping_add(w);
        h = h.wrapping_mul(M);
        h ^= h >> 16;
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        if tail.len() >= 3 {
            h = h.wrapping_add(u32::from(tail[2]) << 16);
        }
        if tail.len() >= 2 {
            h = h.wrapping_add(u32::from(tail[1]) << 8);
        }
        h = h.wrapping_add(u32::from(tail[0]));
        h = h.wrapping_mul(M);
        h ^= h >> 24;
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashSet;

    #[test]
    fn test_deterministic() {
        for key in [&b""[..], b"a", b"ab", b"abc", b"abcd", b"hello minikv"] {
            assert_eq!(hash(key), hash(key));
        }
    }

    #[test]
    fn test_tail_bytes_contribute() {
        assert_ne!(hash(b"abcd1"), hash(b"abcd2"));
        assert_ne!(hash(b"abcd12"), hash(b"abcd13"));
        assert_ne!(hash(b"abcd123"), hash(b"abcd124"));
        assert_ne!(hash(b""), hash(b"\0"));
    }

    #[test]
    fn test_low_collision_rate() {
        let n = 100_000;
        let distinct: AHashSet<u32> = (0..n)
            .map(|i| hash(format!("key{:08}", i).as_bytes()))
            .collect();
        // Birthday bound for 1e5 draws from 2^32 is about one collision
        assert!(n - distinct.len() < 50, "{} collisions", n - distinct.len());
    }
}
