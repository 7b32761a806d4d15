// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

use bitvec::prelude::{BitVec, Msb0};
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec;
use crate::error::{Error, Result};
use crate::partitioner::murmur3_x64_128;

/// Bloom filter over partition keys. A miss skips the Index entirely.
///
/// Keys are hashed once with murmur3-128; the `hashes` probe positions are
/// derived as `h1 + i * h2` over the bit count. Bits externalize as a
/// `disk_array<u32, u64>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    hashes: u32,
    bits: BitVec<u64, Msb0>,
}

impl BloomFilter {
    /// Size for `expected_keys` at the requested false-positive chance.
    pub fn with_fp_chance(expected_keys: u64, fp_chance: f64) -> Self {
        let fp_chance = fp_chance.clamp(f64::MIN_POSITIVE, 1.0);
        let keys = expected_keys.max(1) as f64;
        let num_bits = (-keys * fp_chance.ln() / std::f64::consts::LN_2.powi(2)).ceil() as u64;
        let num_bits = num_bits.max(64).next_multiple_of(64);
        let hashes = ((num_bits as f64 / keys) * std::f64::consts::LN_2).round() as u32;
        Self {
            hashes: hashes.clamp(1, 20),
            bits: BitVec::repeat(false, num_bits as usize),
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        let num_bits = self.bits.len() as u64;
        let (h1, h2) = murmur3_x64_128(key, 0);
        for i in 0..self.hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % num_bits;
            self.bits.set(bit as usize, true);
        }
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        let num_bits = self.bits.len() as u64;
        let (h1, h2) = murmur3_x64_128(key, 0);
        (0..self.hashes as u64).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % num_bits;
            self.bits[bit as usize]
        })
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.hashes);
        let words = self.bits.as_raw_slice();
        buf.put_u32(words.len() as u32);
        for word in words {
            buf.put_u64(*word);
        }
        buf.freeze()
    }

    pub fn deserialize(mut raw: &[u8]) -> Result<Self> {
        let buf = &mut raw;
        let hashes = codec::get_u32(buf)?;
        if hashes == 0 || hashes > 20 {
            return Err(Error::malformed(format!("bloom filter with {hashes} hashes")));
        }
        let word_count = codec::get_u32(buf)? as usize;
        let mut words = Vec::with_capacity(word_count);
        for _ in 0..word_count {
            words.push(codec::get_u64(buf)?);
        }
        if words.is_empty() {
            return Err(Error::malformed("empty bloom filter"));
        }
        Ok(Self {
            hashes,
            bits: BitVec::from_vec(words),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let mut filter = BloomFilter::with_fp_chance(1000, 0.01);
        let keys: Vec<String> = (0..1000).map(|i| format!("key-{i}")).collect();
        for key in &keys {
            filter.add(key.as_bytes());
        }
        for key in &keys {
            assert!(filter.may_contain(key.as_bytes()));
        }
    }

    #[test]
    fn false_positive_rate_is_sane() {
        let mut filter = BloomFilter::with_fp_chance(1000, 0.01);
        for i in 0..1000 {
            filter.add(format!("key-{i}").as_bytes());
        }
        let hits = (0..10_000)
            .filter(|i| filter.may_contain(format!("other-{i}").as_bytes()))
            .count();
        assert!(hits < 500, "fp rate blew past its target: {hits}/10000");
    }

    #[test]
    fn serialization_roundtrip() {
        let mut filter = BloomFilter::with_fp_chance(64, 0.1);
        filter.add(b"alpha");
        filter.add(b"beta");
        let parsed = BloomFilter::deserialize(&filter.serialize()).unwrap();
        assert_eq!(parsed, filter);
        assert!(parsed.may_contain(b"alpha"));
    }
}
