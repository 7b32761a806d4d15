// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! Write-side promoted index: samples the clustered entries of one
//! partition into fixed-size blocks so readers can seek within it.

use bytes::{BufMut, BytesMut};

use crate::clustering::{put_clustering_prefix, BoundKind, ClusteringPrefix};
use crate::codec;
use crate::schema::Schema;
use crate::types::{DeletionTime, Tombstone};

/// Width deltas are stored relative to this base, keeping the common
/// near-64KiB widths in two bytes of signed vint.
pub const WIDTH_BASE: u64 = 65536;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusteringInfo {
    pub clustering: ClusteringPrefix,
    pub kind: BoundKind,
}

/// One closed block: its clustering bounds, extent within the partition,
/// and the range tombstone still open at its end, if any.
#[derive(Clone, Debug)]
pub struct PiBlock {
    pub first: ClusteringInfo,
    pub last: ClusteringInfo,
    /// Offset of the block start relative to the partition start.
    pub offset: u64,
    pub width: u64,
    pub open_marker: Option<Tombstone>,
}

/// Per-partition block state. Fed with every clustered entry; closes a
/// block whenever the data offset has advanced past the desired size.
pub struct PromotedIndexBuilder {
    desired_block_size: u64,
    blocks: Vec<PiBlock>,
    block_start_offset: u64,
    block_next_start_offset: u64,
    first_clustering: Option<ClusteringInfo>,
    last_clustering: Option<ClusteringInfo>,
}

impl PromotedIndexBuilder {
    pub fn new(desired_block_size: usize) -> Self {
        Self {
            desired_block_size: desired_block_size.max(1) as u64,
            blocks: vec![],
            block_start_offset: 0,
            block_next_start_offset: 0,
            first_clustering: None,
            last_clustering: None,
        }
    }

    pub fn start_partition(&mut self) {
        self.blocks.clear();
        self.first_clustering = None;
        self.last_clustering = None;
    }

    /// Called with the data offset just before a clustered entry is
    /// written; opens a block if none is open.
    pub fn maybe_set_first(&mut self, info: &ClusteringInfo, offset: u64) {
        if self.first_clustering.is_none() {
            self.first_clustering = Some(info.clone());
            self.block_start_offset = offset;
            self.block_next_start_offset = offset + self.desired_block_size;
        }
    }

    /// Called after a clustered entry has been written. Closes the block
    /// when it has grown past the target, recording the range tombstone
    /// still open at the boundary.
    pub fn on_clustered_written(
        &mut self,
        info: ClusteringInfo,
        offset_after: u64,
        partition_start: u64,
        open_marker: Option<Tombstone>,
    ) {
        self.last_clustering = Some(info);
        if offset_after >= self.block_next_start_offset {
            self.add_block(offset_after, partition_start, open_marker);
            self.first_clustering = None;
            self.block_next_start_offset = offset_after + self.desired_block_size;
        }
    }

    fn add_block(&mut self, offset_after: u64, partition_start: u64, open_marker: Option<Tombstone>) {
        let first = self
            .first_clustering
            .clone()
            .expect("a block is open when it is closed");
        let last = self
            .last_clustering
            .clone()
            .expect("a closed block saw at least one entry");
        self.blocks.push(PiBlock {
            first,
            last,
            offset: self.block_start_offset - partition_start,
            width: offset_after - self.block_start_offset,
            open_marker,
        });
    }

    /// Close the trailing block if it carried data.
    pub fn end_partition(
        &mut self,
        offset_after: u64,
        partition_start: u64,
        open_marker: Option<Tombstone>,
    ) {
        if !self.blocks.is_empty() && self.first_clustering.is_some() {
            self.add_block(offset_after, partition_start, open_marker);
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Serialize the promoted-index record embedded in the Index entry.
    /// Only meaningful when at least two blocks exist.
    pub fn serialize(
        &self,
        schema: &Schema,
        partition_header_length: u64,
        partition_tombstone: Option<Tombstone>,
    ) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::put_vint(&mut buf, partition_header_length);
        DeletionTime::of(partition_tombstone).put(&mut buf);
        codec::put_vint(&mut buf, self.blocks.len() as u64);

        let start = buf.len();
        let mut offsets = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            offsets.push((buf.len() - start) as u32);
            put_clustering_prefix(&mut buf, schema, &block.first.clustering, block.first.kind);
            put_clustering_prefix(&mut buf, schema, &block.last.clustering, block.last.kind);
            codec::put_vint(&mut buf, block.offset);
            codec::put_signed_vint(&mut buf, block.width as i64 - WIDTH_BASE as i64);
            buf.put_u8(block.open_marker.is_some() as u8);
            if let Some(open) = block.open_marker {
                DeletionTime::of(Some(open)).put(&mut buf);
            }
        }
        for offset in offsets {
            buf.put_u32(offset);
        }
        buf.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ColumnType, Value};

    fn info(v: i32) -> ClusteringInfo {
        ClusteringInfo {
            clustering: ClusteringPrefix::from_values([Value::Int(v).serialize()]),
            kind: BoundKind::Clustering,
        }
    }

    #[test]
    fn blocks_close_on_size() {
        let mut builder = PromotedIndexBuilder::new(100);
        builder.start_partition();
        let partition_start = 10;
        let mut offset = 20;
        for i in 0..10 {
            let entry = info(i);
            builder.maybe_set_first(&entry, offset);
            offset += 40;
            builder.on_clustered_written(entry, offset, partition_start, None);
        }
        builder.end_partition(offset, partition_start, None);
        assert!(builder.block_count() >= 3);
        // Bounds are strictly increasing block to block.
        let schema = Schema::builder("ks", "cf")
            .partition_key("pk", ColumnType::Int)
            .clustering("ck", ColumnType::Int)
            .regular("v", ColumnType::Int)
            .build();
        for pair in builder.blocks.windows(2) {
            let a = crate::clustering::Position::of_bound(
                pair[0].last.clustering.clone(),
                pair[0].last.kind,
            );
            let b = crate::clustering::Position::of_bound(
                pair[1].first.clustering.clone(),
                pair[1].first.kind,
            );
            assert_eq!(
                crate::clustering::position_cmp(&schema, &a, &b),
                std::cmp::Ordering::Less
            );
        }
        // Widths cover the partition without gaps.
        let covered: u64 = builder.blocks.iter().map(|b| b.width).sum();
        assert_eq!(covered, offset - 20);
    }

    #[test]
    fn no_trailing_block_without_data() {
        let mut builder = PromotedIndexBuilder::new(100);
        builder.start_partition();
        builder.end_partition(0, 0, None);
        assert_eq!(builder.block_count(), 0);
    }
}
