// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! Partitioners map partition-key bytes to totally ordered tokens.

use crate::types::Token;

pub trait Partitioner: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn token(&self, key: &[u8]) -> Token;
}

/// The murmur3-based partitioner of the "mc" format: the token is the
/// first 64-bit half of the 128-bit hash of the key.
#[derive(Clone, Copy, Debug, Default)]
pub struct Murmur3Partitioner;

impl Partitioner for Murmur3Partitioner {
    fn name(&self) -> &'static str {
        "org.apache.cassandra.dht.Murmur3Partitioner"
    }

    fn token(&self, key: &[u8]) -> Token {
        let (h1, _) = murmur3_x64_128(key, 0);
        Token(h1 as i64)
    }
}

/// MurmurHash3 x64 128-bit variant. Both halves are used by the bloom
/// filter; the partitioner keeps only the first.
pub fn murmur3_x64_128(data: &[u8], seed: u64) -> (u64, u64) {
    const C1: u64 = 0x87c3_7b91_1142_53d5;
    const C2: u64 = 0x4cf5_ad43_2745_937f;

    let mut h1 = seed;
    let mut h2 = seed;
    let mut chunks = data.chunks_exact(16);

    for chunk in &mut chunks {
        let mut k1 = u64::from_le_bytes(chunk[..8].try_into().unwrap());
        let mut k2 = u64::from_le_bytes(chunk[8..].try_into().unwrap());

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x3849_5ab5);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u64;
        let mut k2 = 0u64;
        for (i, byte) in tail.iter().enumerate() {
            if i < 8 {
                k1 |= (*byte as u64) << (8 * i);
            } else {
                k2 |= (*byte as u64) << (8 * (i - 8));
            }
        }
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u64;
    h2 ^= data.len() as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    (h1, h2)
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_spreads() {
        let (a1, a2) = murmur3_x64_128(b"hello", 0);
        let (b1, b2) = murmur3_x64_128(b"hello", 0);
        assert_eq!((a1, a2), (b1, b2));
        let (c1, _) = murmur3_x64_128(b"hellp", 0);
        assert_ne!(a1, c1);
    }

    #[test]
    fn empty_input() {
        let (h1, h2) = murmur3_x64_128(b"", 0);
        assert_eq!((h1, h2), murmur3_x64_128(b"", 0));
    }

    #[test]
    fn tokens_order_partitions() {
        let p = Murmur3Partitioner;
        let mut tokens: Vec<Token> = (0..64)
            .map(|i| p.token(format!("key-{i}").as_bytes()))
            .collect();
        tokens.sort();
        tokens.dedup();
        assert!(tokens.len() > 60, "tokens should rarely collide");
    }
}
