// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec;
use crate::error::{Error, Result};
use crate::types::Token;

pub const BASE_SAMPLING_LEVEL: u32 = 128;

/// One sampled partition: its token, key and the Index-file position of
/// its entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummaryEntry {
    pub token: Token,
    pub key: Bytes,
    pub position: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SummaryHeader {
    pub min_index_interval: u32,
    pub size: u32,
    pub memory_size: u64,
    pub sampling_level: u32,
    pub size_at_full_sampling: u32,
}

/// The sampled top-level index: monotonically increasing entries plus the
/// first and last partition keys of the table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub header: SummaryHeader,
    pub entries: Vec<SummaryEntry>,
    pub first_key: Bytes,
    pub last_key: Bytes,
}

/// Sampling state threaded through a write: an entry is taken whenever
/// the data file has grown past the next sampling offset, which advances
/// by `byte_cost` data bytes per summary byte produced.
#[derive(Debug)]
pub struct IndexSamplingState {
    pub partition_count: u64,
    pub next_sample_offset: u64,
    pub byte_cost: u64,
}

impl IndexSamplingState {
    pub fn new(byte_cost: u64) -> Self {
        Self {
            partition_count: 0,
            next_sample_offset: 0,
            byte_cost: byte_cost.max(1),
        }
    }
}

impl Summary {
    pub fn prepare(&mut self, min_index_interval: u32) {
        self.header.min_index_interval = min_index_interval;
        self.header.sampling_level = BASE_SAMPLING_LEVEL;
        self.header.memory_size = 0;
    }

    /// Sample `key` if the data file has grown enough since the previous
    /// sample. `index_offset` is the Index-file position of the partition's
    /// entry.
    pub fn maybe_add_entry(
        &mut self,
        state: &mut IndexSamplingState,
        token: Token,
        key: &[u8],
        data_offset: u64,
        index_offset: u64,
    ) {
        state.partition_count += 1;
        if data_offset < state.next_sample_offset {
            return;
        }
        let entry_size = 8 + 2 + key.len() as u64;
        state.next_sample_offset = state
            .next_sample_offset
            .saturating_add(state.byte_cost * entry_size);
        self.entries.push(SummaryEntry {
            token,
            key: Bytes::copy_from_slice(key),
            position: index_offset,
        });
    }

    pub fn seal(&mut self, first_key: Bytes, last_key: Bytes, state: &IndexSamplingState) {
        self.header.size = self.entries.len() as u32;
        let interval = self.header.min_index_interval.max(1) as u64;
        self.header.size_at_full_sampling =
            (state.partition_count / interval + u64::from(state.partition_count % interval != 0))
                as u32;
        self.header.memory_size = self.header.size as u64 * 4;
        for entry in &self.entries {
            self.header.memory_size += entry.key.len() as u64 + 8;
        }
        self.first_key = first_key;
        self.last_key = last_key;
    }

    /// Index of the last entry with token at or before `token`, if any.
    pub fn search(&self, token: Token) -> Option<usize> {
        let pp = self.entries.partition_point(|e| e.token <= token);
        pp.checked_sub(1)
    }

    /// Summary numbers are little-endian, unlike the rest of the family.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.header.min_index_interval);
        buf.put_u32_le(self.header.size);
        buf.put_u64_le(self.header.memory_size);
        buf.put_u32_le(self.header.sampling_level);
        buf.put_u32_le(self.header.size_at_full_sampling);

        let mut positions = Vec::with_capacity(self.entries.len());
        let mut entries = BytesMut::new();
        for entry in &self.entries {
            positions.push(entries.len() as u32);
            entries.put_i64_le(entry.token.0);
            entries.put_u64_le(entry.position);
            entries.put_slice(&entry.key);
        }
        buf.put_u32_le(self.entries.len() as u32);
        for position in positions {
            buf.put_u32_le(position);
        }
        buf.put_u32_le(entries.len() as u32);
        buf.put_slice(&entries);
        codec::put_string32(&mut buf, &self.first_key);
        codec::put_string32(&mut buf, &self.last_key);
        buf.freeze()
    }

    pub fn deserialize(mut raw: &[u8]) -> Result<Self> {
        let buf = &mut raw;
        let mut header = SummaryHeader {
            min_index_interval: get_u32_le(buf)?,
            size: get_u32_le(buf)?,
            memory_size: get_u64_le(buf)?,
            sampling_level: get_u32_le(buf)?,
            size_at_full_sampling: get_u32_le(buf)?,
        };
        let count = get_u32_le(buf)? as usize;
        let mut positions = Vec::with_capacity(count);
        for _ in 0..count {
            positions.push(get_u32_le(buf)? as usize);
        }
        let entries_len = get_u32_le(buf)? as usize;
        let entries_blob = codec::get_bytes(buf, entries_len)?;
        let mut entries = Vec::with_capacity(count);
        for (i, start) in positions.iter().copied().enumerate() {
            let end = positions.get(i + 1).copied().unwrap_or(entries_len);
            if start + 16 > end || end > entries_len {
                return Err(Error::malformed("summary entry positions"));
            }
            let mut entry = &entries_blob[start..end];
            let token = Token(entry.get_i64_le());
            let position = entry.get_u64_le();
            entries.push(SummaryEntry {
                token,
                key: entries_blob.slice(start + 16..end),
                position,
            });
        }
        if entries
            .windows(2)
            .any(|pair| pair[0].token > pair[1].token)
        {
            return Err(Error::malformed("summary entries are not token-ordered"));
        }
        header.size = entries.len() as u32;
        let first_key = codec::get_string32(buf)?;
        let last_key = codec::get_string32(buf)?;
        Ok(Self {
            header,
            entries,
            first_key,
            last_key,
        })
    }
}

fn get_u32_le(buf: &mut impl Buf) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::truncated(0, 4));
    }
    Ok(buf.get_u32_le())
}

fn get_u64_le(buf: &mut impl Buf) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(Error::truncated(0, 8));
    }
    Ok(buf.get_u64_le())
}
