// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! The Statistics component: a tagged set of sub-metadata blocks indexed
//! by a sorted `(tag, offset)` table.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use itertools::Itertools;
use tracing::warn;

use crate::codec;
use crate::error::{Error, Result};
use crate::types::{EncodingStats, DELETION_TIME_EPOCH, TIMESTAMP_EPOCH, TTL_EPOCH};

/// Tags of the sub-metadata blocks, in on-disk ordinal order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum MetadataType {
    Validation = 0,
    Compaction = 1,
    Stats = 2,
    Serialization = 3,
}

impl MetadataType {
    fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => MetadataType::Validation,
            1 => MetadataType::Compaction,
            2 => MetadataType::Stats,
            3 => MetadataType::Serialization,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValidationMetadata {
    pub partitioner_name: String,
    pub bloom_filter_fp_chance: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionMetadata {
    pub ancestors: Vec<u32>,
}

/// Fixed-bucket histogram of sizes: exponentially growing offsets with a
/// count per bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EstimatedHistogram {
    pub bucket_offsets: Vec<i64>,
    pub buckets: Vec<i64>,
}

impl EstimatedHistogram {
    pub fn new(bucket_count: usize) -> Self {
        let mut offsets = Vec::with_capacity(bucket_count);
        let mut last = 1i64;
        offsets.push(last);
        while offsets.len() < bucket_count {
            let next = (last + 1).max((last as f64 * 1.2) as i64);
            offsets.push(next);
            last = next;
        }
        Self {
            buckets: vec![0; offsets.len() + 1],
            bucket_offsets: offsets,
        }
    }

    pub fn add(&mut self, value: u64) {
        let index = self
            .bucket_offsets
            .partition_point(|offset| (*offset as u64) < value);
        self.buckets[index] += 1;
    }

    pub fn count(&self) -> u64 {
        self.buckets.iter().map(|b| *b as u64).sum()
    }
}

impl Default for EstimatedHistogram {
    fn default() -> Self {
        Self::new(114)
    }
}

/// Bounded-bin histogram of tombstone drop times.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamingHistogram {
    pub max_bin_size: u32,
    /// `(point, count)` sorted by point.
    pub bins: Vec<(f64, u64)>,
}

impl Default for StreamingHistogram {
    fn default() -> Self {
        Self {
            max_bin_size: 100,
            bins: vec![],
        }
    }
}

impl StreamingHistogram {
    pub fn update(&mut self, point: i64) {
        let point = point as f64;
        match self
            .bins
            .binary_search_by(|(p, _)| p.partial_cmp(&point).unwrap())
        {
            Ok(i) => self.bins[i].1 += 1,
            Err(i) => {
                self.bins.insert(i, (point, 1));
                if self.bins.len() > self.max_bin_size as usize {
                    self.merge_closest();
                }
            }
        }
    }

    fn merge_closest(&mut self) {
        let mut best = 0;
        let mut best_gap = f64::INFINITY;
        for i in 0..self.bins.len() - 1 {
            let gap = self.bins[i + 1].0 - self.bins[i].0;
            if gap < best_gap {
                best_gap = gap;
                best = i;
            }
        }
        let (p1, c1) = self.bins[best];
        let (p2, c2) = self.bins[best + 1];
        let merged = (p1 * c1 as f64 + p2 * c2 as f64) / (c1 + c2) as f64;
        self.bins[best] = (merged, c1 + c2);
        self.bins.remove(best + 1);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatsMetadata {
    pub partition_size: EstimatedHistogram,
    pub cells_count: EstimatedHistogram,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub min_local_deletion_time: i32,
    pub max_local_deletion_time: i32,
    pub min_ttl: u32,
    pub max_ttl: u32,
    pub compression_ratio: f64,
    pub tombstone_drop_time: StreamingHistogram,
    pub sstable_level: u32,
    pub repaired_at: u64,
    pub min_clustering_values: Vec<Bytes>,
    pub max_clustering_values: Vec<Bytes>,
    pub has_legacy_counter_shards: bool,
    pub rows_count: u64,
    pub columns_count: u64,
}

impl Default for StatsMetadata {
    fn default() -> Self {
        Self {
            partition_size: EstimatedHistogram::default(),
            cells_count: EstimatedHistogram::default(),
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            min_local_deletion_time: i32::MAX,
            max_local_deletion_time: i32::MIN,
            min_ttl: u32::MAX,
            max_ttl: 0,
            compression_ratio: -1.0,
            tombstone_drop_time: StreamingHistogram::default(),
            sstable_level: 0,
            repaired_at: 0,
            min_clustering_values: vec![],
            max_clustering_values: vec![],
            has_legacy_counter_shards: false,
            rows_count: 0,
            columns_count: 0,
        }
    }
}

/// "mc"-only block: delta bases and the column lists that make rows
/// decodable without the schema's help.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializationHeader {
    pub min_timestamp: i64,
    pub min_local_deletion_time: i32,
    pub min_ttl: u32,
    pub pk_type_name: String,
    pub clustering_type_names: Vec<String>,
    /// `(column name, marshal type name)`, schema order.
    pub static_columns: Vec<(Bytes, String)>,
    pub regular_columns: Vec<(Bytes, String)>,
}

impl SerializationHeader {
    pub fn encoding_stats(&self) -> EncodingStats {
        EncodingStats {
            min_timestamp: self.min_timestamp,
            min_local_deletion_time: self.min_local_deletion_time,
            min_ttl: self.min_ttl,
        }
    }
}

/// The polymorphic set of sub-metadata blocks: one variant per tag, each
/// knowing how to parse and write itself.
#[derive(Clone, Debug, PartialEq)]
pub enum MetadataComponent {
    Validation(ValidationMetadata),
    Compaction(CompactionMetadata),
    Stats(StatsMetadata),
    Serialization(SerializationHeader),
}

impl MetadataComponent {
    pub fn tag(&self) -> MetadataType {
        match self {
            MetadataComponent::Validation(_) => MetadataType::Validation,
            MetadataComponent::Compaction(_) => MetadataType::Compaction,
            MetadataComponent::Stats(_) => MetadataType::Stats,
            MetadataComponent::Serialization(_) => MetadataType::Serialization,
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        match self {
            MetadataComponent::Validation(v) => {
                put_string_vint(buf, v.partitioner_name.as_bytes());
                buf.put_f64(v.bloom_filter_fp_chance);
            }
            MetadataComponent::Compaction(c) => {
                buf.put_u32(c.ancestors.len() as u32);
                for ancestor in &c.ancestors {
                    buf.put_u32(*ancestor);
                }
            }
            MetadataComponent::Stats(s) => {
                put_estimated_histogram(buf, &s.partition_size);
                put_estimated_histogram(buf, &s.cells_count);
                buf.put_i64(s.min_timestamp);
                buf.put_i64(s.max_timestamp);
                buf.put_i32(s.min_local_deletion_time);
                buf.put_i32(s.max_local_deletion_time);
                buf.put_u32(s.min_ttl);
                buf.put_u32(s.max_ttl);
                buf.put_f64(s.compression_ratio);
                put_streaming_histogram(buf, &s.tombstone_drop_time);
                buf.put_u32(s.sstable_level);
                buf.put_u64(s.repaired_at);
                put_clustering_bounds(buf, &s.min_clustering_values);
                put_clustering_bounds(buf, &s.max_clustering_values);
                buf.put_u8(s.has_legacy_counter_shards as u8);
                buf.put_u64(s.rows_count);
                buf.put_u64(s.columns_count);
            }
            MetadataComponent::Serialization(h) => {
                codec::put_vint(
                    buf,
                    (h.min_timestamp as u64).wrapping_sub(TIMESTAMP_EPOCH as u64),
                );
                codec::put_vint(
                    buf,
                    (h.min_local_deletion_time as i64).wrapping_sub(DELETION_TIME_EPOCH as i64)
                        as u64,
                );
                codec::put_vint(buf, (h.min_ttl - TTL_EPOCH) as u64);
                put_string_vint(buf, h.pk_type_name.as_bytes());
                codec::put_vint(buf, h.clustering_type_names.len() as u64);
                for name in &h.clustering_type_names {
                    put_string_vint(buf, name.as_bytes());
                }
                for columns in [&h.static_columns, &h.regular_columns] {
                    codec::put_vint(buf, columns.len() as u64);
                    for (name, ty) in columns {
                        codec::put_bytes_vint(buf, name);
                        put_string_vint(buf, ty.as_bytes());
                    }
                }
            }
        }
    }

    fn parse(tag: MetadataType, buf: &mut impl Buf) -> Result<Self> {
        Ok(match tag {
            MetadataType::Validation => MetadataComponent::Validation(ValidationMetadata {
                partitioner_name: get_string_vint(buf)?,
                bloom_filter_fp_chance: codec::get_f64(buf)?,
            }),
            MetadataType::Compaction => {
                let count = codec::get_u32(buf)? as usize;
                let mut ancestors = Vec::with_capacity(count);
                for _ in 0..count {
                    ancestors.push(codec::get_u32(buf)?);
                }
                MetadataComponent::Compaction(CompactionMetadata { ancestors })
            }
            MetadataType::Stats => MetadataComponent::Stats(StatsMetadata {
                partition_size: get_estimated_histogram(buf)?,
                cells_count: get_estimated_histogram(buf)?,
                min_timestamp: codec::get_i64(buf)?,
                max_timestamp: codec::get_i64(buf)?,
                min_local_deletion_time: codec::get_i32(buf)?,
                max_local_deletion_time: codec::get_i32(buf)?,
                min_ttl: codec::get_u32(buf)?,
                max_ttl: codec::get_u32(buf)?,
                compression_ratio: codec::get_f64(buf)?,
                tombstone_drop_time: get_streaming_histogram(buf)?,
                sstable_level: codec::get_u32(buf)?,
                repaired_at: codec::get_u64(buf)?,
                min_clustering_values: get_clustering_bounds(buf)?,
                max_clustering_values: get_clustering_bounds(buf)?,
                has_legacy_counter_shards: codec::get_u8(buf)? != 0,
                rows_count: codec::get_u64(buf)?,
                columns_count: codec::get_u64(buf)?,
            }),
            MetadataType::Serialization => {
                let min_timestamp =
                    (TIMESTAMP_EPOCH as u64).wrapping_add(codec::get_vint(buf)?) as i64;
                let min_local_deletion_time =
                    (DELETION_TIME_EPOCH as i64 + codec::get_vint(buf)? as i64) as i32;
                let min_ttl = TTL_EPOCH + codec::get_vint(buf)? as u32;
                let pk_type_name = get_string_vint(buf)?;
                let clustering_count = codec::get_vint(buf)? as usize;
                let mut clustering_type_names = Vec::with_capacity(clustering_count);
                for _ in 0..clustering_count {
                    clustering_type_names.push(get_string_vint(buf)?);
                }
                let mut column_lists = vec![];
                for _ in 0..2 {
                    let count = codec::get_vint(buf)? as usize;
                    let mut columns = Vec::with_capacity(count);
                    for _ in 0..count {
                        let name = codec::get_bytes_vint(buf)?;
                        let ty = get_string_vint(buf)?;
                        columns.push((name, ty));
                    }
                    column_lists.push(columns);
                }
                let regular_columns = column_lists.pop().unwrap();
                let static_columns = column_lists.pop().unwrap();
                MetadataComponent::Serialization(SerializationHeader {
                    min_timestamp,
                    min_local_deletion_time,
                    min_ttl,
                    pk_type_name,
                    clustering_type_names,
                    static_columns,
                    regular_columns,
                })
            }
        })
    }
}

/// The whole Statistics component.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Statistics {
    pub components: Vec<MetadataComponent>,
}

impl Statistics {
    pub fn get(&self, tag: MetadataType) -> Option<&MetadataComponent> {
        self.components.iter().find(|c| c.tag() == tag)
    }

    pub fn stats(&self) -> Option<&StatsMetadata> {
        match self.get(MetadataType::Stats) {
            Some(MetadataComponent::Stats(s)) => Some(s),
            _ => None,
        }
    }

    pub fn serialization_header(&self) -> Option<&SerializationHeader> {
        match self.get(MetadataType::Serialization) {
            Some(MetadataComponent::Serialization(h)) => Some(h),
            _ => None,
        }
    }

    pub fn validation(&self) -> Option<&ValidationMetadata> {
        match self.get(MetadataType::Validation) {
            Some(MetadataComponent::Validation(v)) => Some(v),
            _ => None,
        }
    }

    pub fn serialize(&self) -> Bytes {
        let sorted = self
            .components
            .iter()
            .sorted_by_key(|c| c.tag())
            .collect_vec();
        let mut payloads = Vec::with_capacity(sorted.len());
        for component in &sorted {
            let mut payload = BytesMut::new();
            component.write(&mut payload);
            payloads.push(payload.freeze());
        }

        let mut buf = BytesMut::new();
        buf.put_u32(sorted.len() as u32);
        let mut offset = 4 + 8 * sorted.len() as u32;
        for (component, payload) in sorted.iter().zip(&payloads) {
            buf.put_u32(component.tag() as u32);
            buf.put_u32(offset);
            offset += payload.len() as u32;
        }
        for payload in payloads {
            buf.put_slice(&payload);
        }
        buf.freeze()
    }

    pub fn deserialize(raw: &[u8]) -> Result<Self> {
        let mut buf = raw;
        let count = codec::get_u32(&mut buf)? as usize;
        let mut table = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = codec::get_u32(&mut buf)?;
            let offset = codec::get_u32(&mut buf)? as usize;
            table.push((tag, offset));
        }
        // Old writers emitted the table unsorted; re-sort before use.
        table.sort_unstable_by_key(|(tag, _)| *tag);

        let mut components = vec![];
        for (tag, offset) in table {
            let Some(tag) = MetadataType::from_u32(tag) else {
                warn!(tag, "skipping unknown statistics tag");
                continue;
            };
            if offset > raw.len() {
                return Err(Error::malformed("statistics offset past end of file"));
            }
            let mut payload = &raw[offset..];
            components.push(MetadataComponent::parse(tag, &mut payload)?);
        }
        Ok(Self { components })
    }
}

fn put_string_vint(buf: &mut impl BufMut, value: &[u8]) {
    codec::put_bytes_vint(buf, value);
}

fn get_string_vint(buf: &mut impl Buf) -> Result<String> {
    let raw = codec::get_bytes_vint(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::malformed("non-utf8 metadata string"))
}

fn put_estimated_histogram(buf: &mut impl BufMut, histogram: &EstimatedHistogram) {
    buf.put_u32(histogram.buckets.len() as u32);
    for i in 0..histogram.buckets.len() {
        let offset = if i == 0 {
            0
        } else {
            histogram.bucket_offsets[i - 1]
        };
        buf.put_i64(offset);
        buf.put_i64(histogram.buckets[i]);
    }
}

fn get_estimated_histogram(buf: &mut impl Buf) -> Result<EstimatedHistogram> {
    let count = codec::get_u32(buf)? as usize;
    let mut bucket_offsets = Vec::with_capacity(count.saturating_sub(1));
    let mut buckets = Vec::with_capacity(count);
    for i in 0..count {
        let offset = codec::get_i64(buf)?;
        if i > 0 {
            bucket_offsets.push(offset);
        }
        buckets.push(codec::get_i64(buf)?);
    }
    Ok(EstimatedHistogram {
        bucket_offsets,
        buckets,
    })
}

fn put_streaming_histogram(buf: &mut impl BufMut, histogram: &StreamingHistogram) {
    buf.put_u32(histogram.max_bin_size);
    buf.put_u32(histogram.bins.len() as u32);
    for (point, count) in &histogram.bins {
        buf.put_f64(*point);
        buf.put_u64(*count);
    }
}

fn get_streaming_histogram(buf: &mut impl Buf) -> Result<StreamingHistogram> {
    let max_bin_size = codec::get_u32(buf)?;
    let count = codec::get_u32(buf)? as usize;
    let mut bins = Vec::with_capacity(count);
    for _ in 0..count {
        let point = codec::get_f64(buf)?;
        bins.push((point, codec::get_u64(buf)?));
    }
    Ok(StreamingHistogram { max_bin_size, bins })
}

fn put_clustering_bounds(buf: &mut impl BufMut, values: &[Bytes]) {
    buf.put_u32(values.len() as u32);
    for value in values {
        codec::put_string16(buf, value);
    }
}

fn get_clustering_bounds(buf: &mut impl Buf) -> Result<Vec<Bytes>> {
    let count = codec::get_u32(buf)? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(codec::get_string16(buf)?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_statistics() -> Statistics {
        let mut stats = StatsMetadata::default();
        stats.min_timestamp = 100;
        stats.max_timestamp = 2000;
        stats.rows_count = 17;
        stats.partition_size.add(5000);
        stats.tombstone_drop_time.update(1_600_000_000);
        Statistics {
            components: vec![
                MetadataComponent::Stats(stats),
                MetadataComponent::Validation(ValidationMetadata {
                    partitioner_name: "org.apache.cassandra.dht.Murmur3Partitioner".into(),
                    bloom_filter_fp_chance: 0.01,
                }),
                MetadataComponent::Compaction(CompactionMetadata {
                    ancestors: vec![1, 2, 3],
                }),
                MetadataComponent::Serialization(SerializationHeader {
                    min_timestamp: 100,
                    min_local_deletion_time: DELETION_TIME_EPOCH,
                    min_ttl: 0,
                    pk_type_name: "org.apache.cassandra.db.marshal.Int32Type".into(),
                    clustering_type_names: vec![
                        "org.apache.cassandra.db.marshal.Int32Type".into(),
                    ],
                    static_columns: vec![(Bytes::from_static(b"s"), "t".into())],
                    regular_columns: vec![(Bytes::from_static(b"v"), "t".into())],
                }),
            ],
        }
    }

    #[test]
    fn roundtrip_reorders_by_tag() {
        let statistics = sample_statistics();
        let parsed = Statistics::deserialize(&statistics.serialize()).unwrap();
        let tags = parsed.components.iter().map(|c| c.tag()).collect_vec();
        assert_eq!(
            tags,
            vec![
                MetadataType::Validation,
                MetadataType::Compaction,
                MetadataType::Stats,
                MetadataType::Serialization,
            ]
        );
        assert_eq!(parsed.stats().unwrap().rows_count, 17);
        assert_eq!(parsed.serialization_header().unwrap().min_timestamp, 100);
    }

    #[test]
    fn unsorted_offset_table_is_resorted() {
        let statistics = sample_statistics();
        let mut raw = statistics.serialize().to_vec();
        // Swap the first two table rows (tag+offset pairs) to fake an old
        // writer that emitted an unsorted table.
        for i in 0..8 {
            raw.swap(4 + i, 12 + i);
        }
        let parsed = Statistics::deserialize(&raw).unwrap();
        assert_eq!(parsed.stats().unwrap().rows_count, 17);
        assert!(parsed.validation().is_some());
    }

    #[test]
    fn estimated_histogram_buckets_grow() {
        let histogram = EstimatedHistogram::new(30);
        assert!(histogram.bucket_offsets.windows(2).all(|w| w[0] < w[1]));
        let mut histogram = EstimatedHistogram::default();
        histogram.add(1);
        histogram.add(1_000_000);
        assert_eq!(histogram.count(), 2);
    }

    #[test]
    fn streaming_histogram_bounds_bins() {
        let mut histogram = StreamingHistogram {
            max_bin_size: 4,
            bins: vec![],
        };
        for i in 0..100 {
            histogram.update(i * 7);
        }
        assert!(histogram.bins.len() <= 4);
        assert_eq!(histogram.bins.iter().map(|(_, c)| c).sum::<u64>(), 100);
    }
}
