// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::codec;
use crate::error::{Error, Result};

/// One shard-owned token range of the table, as recorded by the writer's
/// shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenRange {
    pub left_exclusive: bool,
    pub left: Bytes,
    pub right_exclusive: bool,
    pub right: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShardingMetadata {
    pub token_ranges: Vec<TokenRange>,
}

/// Feature bits a writer declares so older readers can refuse what they
/// do not understand.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Features(pub u64);

impl Features {
    pub const NON_COMPOUND_PI_ENTRIES: u64 = 1 << 0;
    pub const NON_COMPOUND_RANGE_TOMBSTONES: u64 = 1 << 1;

    pub fn all() -> Self {
        Self(Self::NON_COMPOUND_PI_ENTRIES | Self::NON_COMPOUND_RANGE_TOMBSTONES)
    }

    pub fn contains(self, bit: u64) -> bool {
        self.0 & bit != 0
    }

    pub fn disable(&mut self, bit: u64) {
        self.0 &= !bit;
    }
}

const TAG_SHARDING: u32 = 1;
const TAG_FEATURES: u32 = 2;

/// The optional Scylla.db component. Absence means legacy defaults: no
/// sharding knowledge, no feature bits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScyllaMetadata {
    pub sharding: Option<ShardingMetadata>,
    pub features: Option<Features>,
}

impl ScyllaMetadata {
    pub fn serialize(&self) -> Bytes {
        let mut entries: Vec<(u32, Bytes)> = vec![];
        if let Some(sharding) = &self.sharding {
            let mut payload = BytesMut::new();
            payload.put_u32(sharding.token_ranges.len() as u32);
            for range in &sharding.token_ranges {
                payload.put_u8(range.left_exclusive as u8);
                codec::put_string16(&mut payload, &range.left);
                payload.put_u8(range.right_exclusive as u8);
                codec::put_string16(&mut payload, &range.right);
            }
            entries.push((TAG_SHARDING, payload.freeze()));
        }
        if let Some(features) = &self.features {
            let mut payload = BytesMut::new();
            payload.put_u64(features.0);
            entries.push((TAG_FEATURES, payload.freeze()));
        }

        let mut buf = BytesMut::new();
        buf.put_u32(entries.len() as u32);
        for (tag, payload) in entries {
            buf.put_u32(tag);
            buf.put_u32(payload.len() as u32);
            buf.put_slice(&payload);
        }
        buf.freeze()
    }

    pub fn deserialize(mut raw: &[u8]) -> Result<Self> {
        let buf = &mut raw;
        let count = codec::get_u32(buf)? as usize;
        let mut metadata = ScyllaMetadata::default();
        for _ in 0..count {
            let tag = codec::get_u32(buf)?;
            let len = codec::get_u32(buf)? as usize;
            let mut payload = codec::get_bytes(buf, len)?;
            match tag {
                TAG_SHARDING => {
                    let range_count = codec::get_u32(&mut payload)? as usize;
                    let mut token_ranges = Vec::with_capacity(range_count);
                    for _ in 0..range_count {
                        let left_exclusive = codec::get_u8(&mut payload)? != 0;
                        let left = codec::get_string16(&mut payload)?;
                        let right_exclusive = codec::get_u8(&mut payload)? != 0;
                        let right = codec::get_string16(&mut payload)?;
                        token_ranges.push(TokenRange {
                            left_exclusive,
                            left,
                            right_exclusive,
                            right,
                        });
                    }
                    metadata.sharding = Some(ShardingMetadata { token_ranges });
                }
                TAG_FEATURES => {
                    if payload.remaining() < 8 {
                        return Err(Error::malformed("features payload"));
                    }
                    metadata.features = Some(Features(payload.get_u64()));
                }
                other => warn!(tag = other, "skipping unknown scylla metadata entry"),
            }
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let metadata = ScyllaMetadata {
            sharding: Some(ShardingMetadata {
                token_ranges: vec![TokenRange {
                    left_exclusive: true,
                    left: Bytes::copy_from_slice(&1i64.to_be_bytes()),
                    right_exclusive: false,
                    right: Bytes::copy_from_slice(&9i64.to_be_bytes()),
                }],
            }),
            features: Some(Features::all()),
        };
        let parsed = ScyllaMetadata::deserialize(&metadata.serialize()).unwrap();
        assert_eq!(parsed, metadata);
        assert!(parsed
            .features
            .unwrap()
            .contains(Features::NON_COMPOUND_RANGE_TOMBSTONES));
    }

    #[test]
    fn absent_entries_mean_defaults() {
        let parsed = ScyllaMetadata::deserialize(&ScyllaMetadata::default().serialize()).unwrap();
        assert_eq!(parsed, ScyllaMetadata::default());
    }

    #[test]
    fn unknown_tags_are_skipped() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u32(99);
        buf.put_u32(2);
        buf.put_slice(b"zz");
        let parsed = ScyllaMetadata::deserialize(&buf).unwrap();
        assert_eq!(parsed, ScyllaMetadata::default());
    }
}
