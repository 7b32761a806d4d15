// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! Index-file reading: sequential entry iteration, the promoted-index
//! record, and summary regeneration.

use std::sync::Arc;

use bytes::{Buf, Bytes};

use crate::clustering::{get_clustering_prefix, position_cmp, BoundKind, ClusteringPrefix, Position};
use crate::codec;
use crate::error::{Error, Result};
use crate::metadata::{IndexSamplingState, Summary};
use crate::partitioner::Partitioner;
use crate::reader::source::BufferedSource;
use crate::schema::Schema;
use crate::types::{DeletionTime, Tombstone};

/// One block of a parsed promoted index.
#[derive(Clone, Debug)]
pub struct PiBlockInfo {
    pub first: (ClusteringPrefix, BoundKind),
    pub last: (ClusteringPrefix, BoundKind),
    /// Offset of the block relative to the partition start in the data
    /// file.
    pub offset: u64,
    pub width: u64,
    /// Range tombstone still open at the end of this block; a reader
    /// seeking into the next block re-emits it on entry.
    pub open_marker: Option<Tombstone>,
}

#[derive(Clone, Debug)]
pub struct PromotedIndex {
    pub partition_header_length: u64,
    pub partition_tombstone: Option<Tombstone>,
    pub blocks: Vec<PiBlockInfo>,
}

impl PromotedIndex {
    /// Parse the record embedded in an index entry.
    pub fn parse(raw: &Bytes, schema: &Schema) -> Result<PromotedIndex> {
        let mut buf = raw.clone();
        let partition_header_length = codec::get_vint(&mut buf)?;
        let partition_tombstone = DeletionTime::get(&mut buf)?.tombstone();
        let block_count = codec::get_vint(&mut buf)? as usize;
        let mut blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            let first = get_clustering_prefix(&mut buf, schema)?;
            let last = get_clustering_prefix(&mut buf, schema)?;
            let offset = codec::get_vint(&mut buf)?;
            let width_delta = codec::get_signed_vint(&mut buf)?;
            let width = width_delta
                .checked_add(crate::writer::WIDTH_BASE as i64)
                .filter(|w| *w >= 0)
                .ok_or_else(|| Error::malformed("promoted-index block width"))?
                as u64;
            let open_marker = match codec::get_u8(&mut buf)? {
                0 => None,
                1 => DeletionTime::get(&mut buf)?.tombstone(),
                other => {
                    return Err(Error::malformed(format!("open marker flag {other}")));
                }
            };
            blocks.push(PiBlockInfo {
                first,
                last,
                offset,
                width,
                open_marker,
            });
        }
        // The trailing block-offset table exists for mmap-style binary
        // search; with the record already in memory it is redundant, but
        // its length is still validated.
        if buf.remaining() < blocks.len() * 4 {
            return Err(Error::truncated(0, blocks.len() * 4 - buf.remaining()));
        }
        Ok(PromotedIndex {
            partition_header_length,
            partition_tombstone,
            blocks,
        })
    }

    /// The block a scan for `target` should enter: the last block whose
    /// first clustering is at or before the target, saturating at the
    /// first.
    pub fn block_for(&self, schema: &Schema, target: &Position) -> usize {
        let pp = self.blocks.partition_point(|block| {
            let first = Position::of_bound(block.first.0.clone(), block.first.1);
            position_cmp(schema, &first, target).is_le()
        });
        pp.saturating_sub(1)
    }
}

/// A parsed entry of the Index file.
#[derive(Clone, Debug)]
pub struct IndexEntry {
    pub key: Bytes,
    pub data_offset: u64,
    pub promoted: Option<Arc<PromotedIndex>>,
    /// Offset of this entry within the Index file.
    pub index_offset: u64,
}

/// Sequential reader over the Index file.
pub struct IndexReader {
    src: BufferedSource,
    schema: Arc<Schema>,
}

impl IndexReader {
    pub fn new(src: BufferedSource, schema: Arc<Schema>) -> Self {
        Self { src, schema }
    }

    pub fn seek(&mut self, offset: u64) {
        self.src.seek(offset);
    }

    pub fn position(&self) -> u64 {
        self.src.position()
    }

    pub async fn next_entry(&mut self) -> Result<Option<IndexEntry>> {
        if self.src.at_end() {
            return Ok(None);
        }
        let index_offset = self.src.position();
        let key_len = self.src.read_u16().await? as usize;
        let key = self.src.read_bytes(key_len).await?;
        let data_offset = self.src.read_vint().await?;
        let promoted_len = self.src.read_vint().await? as usize;
        let promoted = if promoted_len == 0 {
            None
        } else {
            let raw = self.src.read_bytes(promoted_len).await?;
            Some(Arc::new(PromotedIndex::parse(&raw, &self.schema)?))
        };
        Ok(Some(IndexEntry {
            key,
            data_offset,
            promoted,
            index_offset,
        }))
    }
}

/// Rebuild the Summary by scanning the Index, for when the Summary file
/// is corrupt or missing.
pub async fn rebuild_summary(
    mut reader: IndexReader,
    partitioner: &dyn Partitioner,
    min_index_interval: u32,
    summary_byte_cost: u64,
) -> Result<Summary> {
    let mut summary = Summary::default();
    summary.prepare(min_index_interval);
    let mut state = IndexSamplingState::new(summary_byte_cost);
    let mut first_key: Option<Bytes> = None;
    let mut last_key: Option<Bytes> = None;

    while let Some(entry) = reader.next_entry().await? {
        let token = partitioner.token(&entry.key);
        summary.maybe_add_entry(
            &mut state,
            token,
            &entry.key,
            entry.data_offset,
            entry.index_offset,
        );
        if first_key.is_none() {
            first_key = Some(entry.key.clone());
        }
        last_key = Some(entry.key);
    }

    let first = first_key.ok_or_else(|| Error::malformed("cannot summarize an empty index"))?;
    let last = last_key.unwrap_or_else(|| first.clone());
    summary.seal(first, last, &state);
    Ok(summary)
}
