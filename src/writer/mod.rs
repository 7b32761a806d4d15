// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! The write path: consumes an ordered stream of partition/row events and
//! emits the sealed "mc" file family.

mod promoted;
mod sink;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tracing::debug;

pub use promoted::{ClusteringInfo, PiBlock, PromotedIndexBuilder, WIDTH_BASE};
pub use sink::{DataSink, FileSink, SinkOutput};

use crate::clustering::{
    position_cmp, put_clustering_prefix, BoundKind, ClusteringPrefix, Position,
};
use crate::codec;
use crate::error::{Error, Result};
use crate::metadata::{
    Features, MetadataComponent, ScyllaMetadata, SerializationHeader, ShardingMetadata, Statistics,
    StatsMetadata, Summary, IndexSamplingState, Toc, TokenRange, ValidationMetadata,
};
use crate::metadata::{BloomFilter, ComponentType, Descriptor, Version};
use crate::options::SsTableOptions;
use crate::partitioner::{Murmur3Partitioner, Partitioner};
use crate::row::{
    cell_flags, row_extended_flags, row_flags, AtomicCell, Cell, CellLiveness, CounterShard,
    RangeTombstone, Row,
};
use crate::schema::{ColumnKind, Schema};
use crate::sstable::{fsync_dir, SsTable};
use crate::types::{DecoratedKey, DeletionTime, EncodingStats, Timestamp, Tombstone};

/// Notified when a partition outgrows the configured threshold.
pub trait LargePartitionObserver: Send + Sync {
    fn on_large_partition(&self, key: &DecoratedKey, size: u64);
}

/// Outcome of [`SsTableWriter::end_partition`]: whether the data file has
/// outgrown `max_sstable_size` and the caller should rotate generations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndOfPartition {
    pub saturated: bool,
}

/// Row timestamp/expiry the cells of one row may reference instead of
/// carrying their own.
#[derive(Clone, Copy, Default)]
struct RowTimeProperties {
    timestamp: Option<Timestamp>,
    ttl: Option<u32>,
    local_deletion_time: Option<i32>,
}

/// A range-tombstone bound or boundary waiting to be written.
#[derive(Clone, Debug)]
struct RtMarker {
    clustering: ClusteringPrefix,
    kind: BoundKind,
    tombstone: Tombstone,
    /// The opening tombstone, engaged only for boundaries.
    boundary_tombstone: Option<Tombstone>,
}

impl RtMarker {
    fn position(&self) -> Position {
        Position::of_bound(self.clustering.clone(), self.kind)
    }
}

struct PartitionState {
    key: DecoratedKey,
    tombstone: Option<Tombstone>,
    start_offset: u64,
    header_length: u64,
    prev_row_start: u64,
    static_row_written: bool,
    last_position: Option<Position>,
}

/// Statistics accumulated while writing, sealed into the Statistics
/// component at the end.
struct MetadataCollector {
    stats: StatsMetadata,
    partition_cells: u64,
}

impl MetadataCollector {
    fn new() -> Self {
        Self {
            stats: StatsMetadata::default(),
            partition_cells: 0,
        }
    }

    fn update_timestamp(&mut self, timestamp: Timestamp) {
        self.stats.min_timestamp = self.stats.min_timestamp.min(timestamp);
        self.stats.max_timestamp = self.stats.max_timestamp.max(timestamp);
    }

    fn update_local_deletion_time(&mut self, ldt: i32) {
        self.stats.min_local_deletion_time = self.stats.min_local_deletion_time.min(ldt);
        self.stats.max_local_deletion_time = self.stats.max_local_deletion_time.max(ldt);
    }

    fn update_ttl(&mut self, ttl: u32) {
        self.stats.min_ttl = self.stats.min_ttl.min(ttl);
        self.stats.max_ttl = self.stats.max_ttl.max(ttl);
    }

    fn update_tombstone(&mut self, tombstone: Tombstone) {
        self.update_timestamp(tombstone.timestamp);
        self.update_local_deletion_time(tombstone.local_deletion_time);
        self.stats
            .tombstone_drop_time
            .update(tombstone.local_deletion_time as i64);
    }

    fn update_clustering(&mut self, schema: &Schema, prefix: &ClusteringPrefix) {
        for (i, value) in prefix.values.iter().enumerate() {
            let Some(value) = value else { continue };
            let ty = &schema.clustering[i].ty;
            if self.stats.min_clustering_values.len() <= i {
                self.stats.min_clustering_values.push(value.clone());
                self.stats.max_clustering_values.push(value.clone());
                continue;
            }
            if ty.compare(value, &self.stats.min_clustering_values[i]).is_lt() {
                self.stats.min_clustering_values[i] = value.clone();
            }
            if ty.compare(value, &self.stats.max_clustering_values[i]).is_gt() {
                self.stats.max_clustering_values[i] = value.clone();
            }
        }
    }

    fn on_cell(&mut self) {
        self.stats.columns_count += 1;
        self.partition_cells += 1;
    }

    fn end_partition(&mut self, partition_size: u64) {
        self.stats.partition_size.add(partition_size);
        self.stats.cells_count.add(self.partition_cells);
        self.partition_cells = 0;
    }
}

/// Writer for one SSTable generation. Create it, feed it partitions in
/// token order, then [`finish`](Self::finish) to seal or
/// [`abort`](Self::abort) to leave no trace.
pub struct SsTableWriter {
    descriptor: Descriptor,
    schema: Arc<Schema>,
    options: SsTableOptions,
    enc_stats: EncodingStats,
    features: Features,

    data: DataSink,
    index: FileSink,

    summary: Summary,
    sampling: IndexSamplingState,
    filter: Option<BloomFilter>,
    collector: MetadataCollector,
    pi: PromotedIndexBuilder,

    rt_queue: Vec<RangeTombstone>,
    end_open_marker: Option<RtMarker>,

    partition: Option<PartitionState>,
    first_key: Option<DecoratedKey>,
    last_key: Option<DecoratedKey>,

    observer: Option<Arc<dyn LargePartitionObserver>>,
    created: Vec<PathBuf>,
    scratch: BytesMut,
}

impl SsTableWriter {
    pub async fn create(
        descriptor: Descriptor,
        schema: Arc<Schema>,
        options: SsTableOptions,
        estimated_partitions: u64,
        enc_stats: EncodingStats,
    ) -> Result<SsTableWriter> {
        if descriptor.version != Version::Mc {
            return Err(Error::unsupported(
                "sstable version",
                descriptor.version.as_str(),
            ));
        }
        let with_filter = schema.bloom_filter_fp_chance < 1.0;
        let toc = Toc::for_write(schema.compression.is_some(), with_filter);

        let mut created = vec![];

        // The temporary TOC is the atomicity token of the build: it must
        // not be created over a sealed table of the same generation.
        if tokio::fs::try_exists(descriptor.path(ComponentType::Toc)).await? {
            return Err(Error::malformed(format!(
                "sealed TOC already exists for generation {}",
                descriptor.generation
            )));
        }
        let toc_path = descriptor.path(ComponentType::TemporaryToc);
        let mut toc_sink = FileSink::create(&toc_path, options.buffer_size).await?;
        created.push(toc_path);
        toc_sink.write_all(&toc.serialize()).await?;
        toc_sink.finish().await?;
        fsync_dir(&descriptor.dir).await?;

        let data_path = descriptor.path(ComponentType::Data);
        let data = DataSink::create(&data_path, &schema, &options).await?;
        created.push(data_path);
        let index_path = descriptor.path(ComponentType::Index);
        let index = FileSink::create(&index_path, options.buffer_size).await?;
        created.push(index_path);

        let filter = with_filter.then(|| {
            BloomFilter::with_fp_chance(estimated_partitions, schema.bloom_filter_fp_chance)
        });
        let mut summary = Summary::default();
        summary.prepare(schema.min_index_interval);
        let sampling = IndexSamplingState::new(options.summary_byte_cost());
        let pi = PromotedIndexBuilder::new(options.promoted_index_block_size);

        Ok(SsTableWriter {
            descriptor,
            schema,
            options,
            enc_stats,
            features: Features::all(),
            data,
            index,
            summary,
            sampling,
            filter,
            collector: MetadataCollector::new(),
            pi,
            rt_queue: vec![],
            end_open_marker: None,
            partition: None,
            first_key: None,
            last_key: None,
            observer: None,
            created,
            scratch: BytesMut::new(),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn LargePartitionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub async fn start_partition(
        &mut self,
        key: DecoratedKey,
        tombstone: Option<Tombstone>,
    ) -> Result<()> {
        if self.partition.is_some() {
            return Err(Error::out_of_order("previous partition was not ended"));
        }
        if let Some(last) = &self.last_key {
            if *last >= key {
                return Err(Error::out_of_order(format!(
                    "partition {key:?} not after {last:?}"
                )));
            }
        }

        let start_offset = self.data.logical_offset();
        let index_offset = self.index.offset();
        self.summary.maybe_add_entry(
            &mut self.sampling,
            key.token,
            &key.key,
            start_offset,
            index_offset,
        );
        if let Some(filter) = &mut self.filter {
            filter.add(&key.key);
        }

        // Index entry, minus the promoted index that only exists once the
        // whole partition has been seen.
        self.scratch.clear();
        codec::put_string16(&mut self.scratch, &key.key);
        codec::put_vint(&mut self.scratch, start_offset);
        let entry = self.scratch.split().freeze();
        self.index.write_all(&entry).await?;

        self.scratch.clear();
        codec::put_string16(&mut self.scratch, &key.key);
        DeletionTime::of(tombstone).put(&mut self.scratch);
        let header = self.scratch.split().freeze();
        self.data.write_all(&header).await?;

        if let Some(t) = tombstone {
            self.collector.update_tombstone(t);
        }

        self.pi.start_partition();
        self.partition = Some(PartitionState {
            key,
            tombstone,
            start_offset,
            header_length: self.data.logical_offset() - start_offset,
            prev_row_start: start_offset,
            static_row_written: false,
            last_position: None,
        });
        Ok(())
    }

    pub async fn write_static_row(&mut self, row: Row) -> Result<()> {
        let partition = self
            .partition
            .as_ref()
            .ok_or_else(|| Error::out_of_order("static row outside a partition"))?;
        if partition.static_row_written || partition.last_position.is_some() {
            return Err(Error::out_of_order(
                "static row must precede all clustered entries",
            ));
        }
        if !self.schema.has_statics() {
            return Err(Error::malformed("schema declares no static columns"));
        }

        let layout_len = self.schema.layout(ColumnKind::Static).len();
        let mut flags = row_flags::EXTENSION_FLAG;
        if row.cells.len() == layout_len {
            flags |= row_flags::HAS_ALL_COLUMNS;
        }
        let has_complex_deletion = row.has_complex_deletion();
        if has_complex_deletion {
            flags |= row_flags::HAS_COMPLEX_DELETION;
        }

        let start = self.data.logical_offset();
        let mut body = BytesMut::new();
        self.encode_cells(
            &mut body,
            ColumnKind::Static,
            &row,
            RowTimeProperties::default(),
            has_complex_deletion,
        )?;

        self.scratch.clear();
        self.scratch.put_u8(flags);
        self.scratch.put_u8(row_extended_flags::IS_STATIC);
        // The static row always comes first, so the previous row size is
        // always zero.
        codec::put_vint(
            &mut self.scratch,
            body.len() as u64 + codec::vint_len(0) as u64,
        );
        codec::put_vint(&mut self.scratch, 0);
        self.scratch.put_slice(&body);
        let frame = self.scratch.split().freeze();
        self.data.write_all(&frame).await?;

        let partition = self.partition.as_mut().unwrap();
        partition.header_length += self.data.logical_offset() - start;
        partition.static_row_written = true;
        self.collector.stats.rows_count += 1;
        Ok(())
    }

    pub async fn write_row(&mut self, clustering: ClusteringPrefix, row: Row) -> Result<()> {
        if self.partition.is_none() {
            return Err(Error::out_of_order("row outside a partition"));
        }
        if !clustering.is_full(&self.schema) {
            return Err(Error::malformed("row clustering prefix is not full"));
        }
        self.drain_tombstones(Some(Position::after(clustering.clone())))
            .await?;
        self.check_order(Position::row(clustering.clone()))?;

        let mut flags = 0u8;
        let mut ext_flags = 0u8;
        if let Some(liveness) = &row.liveness {
            flags |= row_flags::HAS_TIMESTAMP;
            if liveness.expiry.is_some() {
                flags |= row_flags::HAS_TTL;
            }
        }
        if row.tombstone.is_some() {
            flags |= row_flags::HAS_DELETION;
        }
        if row.shadowable_tombstone.is_some() {
            flags |= row_flags::EXTENSION_FLAG;
            ext_flags = row_extended_flags::HAS_SHADOWABLE_DELETION;
        }
        let layout_len = self.schema.layout(ColumnKind::Regular).len();
        if row.cells.len() == layout_len {
            flags |= row_flags::HAS_ALL_COLUMNS;
        }
        let has_complex_deletion = row.has_complex_deletion();
        if has_complex_deletion {
            flags |= row_flags::HAS_COMPLEX_DELETION;
        }

        let mut body = BytesMut::new();
        self.encode_row_body(&mut body, &row, has_complex_deletion)?;

        let info = ClusteringInfo {
            clustering: clustering.clone(),
            kind: BoundKind::Clustering,
        };
        self.collector.update_clustering(&self.schema, &clustering);
        self.collector.stats.rows_count += 1;

        self.scratch.clear();
        self.scratch.put_u8(flags);
        if ext_flags != 0 {
            self.scratch.put_u8(ext_flags);
        }
        put_clustering_prefix(&mut self.scratch, &self.schema, &clustering, BoundKind::Clustering);
        let head = self.scratch.split().freeze();
        self.write_clustered(info, &head, &body).await
    }

    pub async fn write_range_tombstone(&mut self, rt: RangeTombstone) -> Result<()> {
        if self.partition.is_none() {
            return Err(Error::out_of_order("range tombstone outside a partition"));
        }
        if !self.schema.is_compound
            && !self
                .features
                .contains(Features::NON_COMPOUND_RANGE_TOMBSTONES)
        {
            return Err(Error::unsupported(
                "range tombstone",
                "non-compound range tombstones are not declared in features",
            ));
        }
        let start_pos = Position::of_bound(rt.start.clone(), rt.start_kind);
        let end_pos = Position::of_bound(rt.end.clone(), rt.end_kind);
        if position_cmp(&self.schema, &start_pos, &end_pos).is_gt() {
            return Err(Error::malformed("range tombstone bounds are inverted"));
        }
        self.drain_tombstones(Some(start_pos.clone())).await?;

        let insert_at = self.rt_queue.partition_point(|queued| {
            position_cmp(
                &self.schema,
                &Position::of_bound(queued.start.clone(), queued.start_kind),
                &start_pos,
            )
            .is_le()
        });
        self.rt_queue.insert(insert_at, rt);
        Ok(())
    }

    pub async fn end_partition(&mut self) -> Result<EndOfPartition> {
        if self.partition.is_none() {
            return Err(Error::out_of_order("no partition to end"));
        }
        self.drain_tombstones(None).await?;

        self.data.write_all(&[row_flags::END_OF_PARTITION]).await?;

        let partition = self.partition.take().unwrap();
        let end_offset = self.data.logical_offset();
        self.pi
            .end_partition(end_offset, partition.start_offset, None);

        if self.pi.block_count() < 2 {
            self.scratch.clear();
            codec::put_vint(&mut self.scratch, 0);
        } else {
            let record = self.pi.serialize(
                &self.schema,
                partition.header_length,
                partition.tombstone,
            );
            self.scratch.clear();
            codec::put_vint(&mut self.scratch, record.len() as u64);
            self.scratch.put_slice(&record);
        }
        let entry_tail = self.scratch.split().freeze();
        self.index.write_all(&entry_tail).await?;

        let partition_size = end_offset - partition.start_offset;
        self.collector.end_partition(partition_size);
        if partition_size > self.options.large_partition_threshold {
            if let Some(observer) = &self.observer {
                observer.on_large_partition(&partition.key, partition_size);
            }
        }

        if self.first_key.is_none() {
            self.first_key = Some(partition.key.clone());
        }
        self.last_key = Some(partition.key);

        Ok(EndOfPartition {
            saturated: self.data.logical_offset() >= self.options.max_sstable_size,
        })
    }

    /// Flush every component, write the digest and seal the table by
    /// renaming the temporary TOC into place.
    pub async fn finish(mut self) -> Result<Arc<SsTable>> {
        if self.partition.is_some() {
            return Err(Error::out_of_order("finish with an open partition"));
        }
        let (Some(first), Some(last)) = (self.first_key.clone(), self.last_key.clone()) else {
            self.abort().await;
            return Err(Error::malformed("cannot seal an empty sstable"));
        };

        self.summary
            .seal(first.key.clone(), last.key.clone(), &self.sampling);

        self.index.finish().await?;
        let output = self.data.finish().await?;
        if let Some(info) = &output.compression {
            self.collector.stats.compression_ratio =
                output.on_disk_length as f64 / info.data_length.max(1) as f64;
        }

        let statistics = self.seal_statistics();

        let mut components: Vec<(ComponentType, Vec<u8>)> = vec![
            (ComponentType::Summary, self.summary.serialize().to_vec()),
            (ComponentType::Statistics, statistics.serialize().to_vec()),
            (
                ComponentType::Digest,
                crate::checksum::format_digest(output.digest).into_bytes(),
            ),
            (ComponentType::Scylla, self.scylla_metadata(&first, &last).serialize().to_vec()),
        ];
        if let Some(filter) = &self.filter {
            components.push((ComponentType::Filter, filter.serialize().to_vec()));
        }
        if let Some(info) = &output.compression {
            components.push((ComponentType::CompressionInfo, info.serialize().to_vec()));
        }
        if let Some((chunk_size, crcs)) = &output.crc_chunks {
            let mut payload = BytesMut::new();
            payload.put_u32(*chunk_size);
            for crc in crcs {
                payload.put_u32(*crc);
            }
            components.push((ComponentType::Crc, payload.to_vec()));
        }
        for (component, payload) in components {
            let path = self.descriptor.path(component);
            let mut sink = FileSink::create(&path, self.options.buffer_size).await?;
            sink.write_all(&payload).await?;
            sink.finish().await?;
            self.created.push(path);
        }

        // The linearization point: fsync the directory, rename the
        // temporary TOC into place, fsync again.
        fsync_dir(&self.descriptor.dir).await?;
        tokio::fs::rename(
            self.descriptor.path(ComponentType::TemporaryToc),
            self.descriptor.path(ComponentType::Toc),
        )
        .await?;
        fsync_dir(&self.descriptor.dir).await?;
        debug!(generation = self.descriptor.generation, "sealed sstable");

        let descriptor = self.descriptor.clone();
        let schema = self.schema.clone();
        let options = self.options.clone();
        SsTable::open(descriptor, schema, options).await
    }

    /// Abort the build: remove every file this writer created. The TOC was
    /// never published, so no reader can have observed the table.
    pub async fn abort(self) {
        for path in &self.created {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!(?path, error = %e, "failed to remove aborted component"),
            }
        }
        let _ = fsync_dir(&self.descriptor.dir).await;
    }

    fn check_order(&mut self, position: Position) -> Result<()> {
        let partition = self.partition.as_mut().unwrap();
        if let Some(last) = &partition.last_position {
            if position_cmp(&self.schema, &position, last).is_le() {
                return Err(Error::out_of_order(
                    "clustered entry at or before the previous one",
                ));
            }
        }
        partition.last_position = Some(position);
        Ok(())
    }

    /// Shared tail of row and marker writes: promoted-index bookkeeping
    /// around the framed entry.
    async fn write_clustered(
        &mut self,
        info: ClusteringInfo,
        head: &[u8],
        body: &[u8],
    ) -> Result<()> {
        let partition_start = self.partition.as_ref().unwrap().start_offset;
        let offset_before = self.data.logical_offset();
        self.pi.maybe_set_first(&info, offset_before);

        let prev_row_size = {
            let partition = self.partition.as_ref().unwrap();
            offset_before - partition.prev_row_start
        };

        self.scratch.clear();
        self.scratch.put_slice(head);
        codec::put_vint(
            &mut self.scratch,
            body.len() as u64 + codec::vint_len(prev_row_size) as u64,
        );
        codec::put_vint(&mut self.scratch, prev_row_size);
        self.scratch.put_slice(body);
        let frame = self.scratch.split().freeze();
        self.data.write_all(&frame).await?;

        self.partition.as_mut().unwrap().prev_row_start = offset_before;
        let open_marker = self.end_open_marker.as_ref().map(|m| m.tombstone);
        self.pi.on_clustered_written(
            info,
            self.data.logical_offset(),
            partition_start,
            open_marker,
        );
        Ok(())
    }

    async fn consume_marker(&mut self, marker: RtMarker) -> Result<()> {
        self.check_order(marker.position())?;
        self.collector.update_timestamp(marker.tombstone.timestamp);
        self.collector
            .update_local_deletion_time(marker.tombstone.local_deletion_time);
        if let Some(boundary) = marker.boundary_tombstone {
            self.collector.update_timestamp(boundary.timestamp);
            self.collector
                .update_local_deletion_time(boundary.local_deletion_time);
        }

        let mut body = BytesMut::new();
        self.enc_stats
            .put_delta_deletion_time(&mut body, DeletionTime::of(Some(marker.tombstone)));
        if let Some(boundary) = marker.boundary_tombstone {
            self.enc_stats
                .put_delta_deletion_time(&mut body, DeletionTime::of(Some(boundary)));
        }

        let mut head = BytesMut::new();
        head.put_u8(row_flags::IS_MARKER);
        put_clustering_prefix(&mut head, &self.schema, &marker.clustering, marker.kind);

        let info = ClusteringInfo {
            clustering: marker.clustering.clone(),
            kind: marker.kind,
        };
        let head = head.freeze();
        let body = body.freeze();
        self.write_clustered(info, &head, &body).await
    }

    /// Write out queued range tombstones whose start lies before `pos`
    /// (all of them when `pos` is `None`), merging adjacent bounds into
    /// boundary markers and closing superseded ones.
    async fn drain_tombstones(&mut self, pos: Option<Position>) -> Result<()> {
        loop {
            let due = match (&pos, self.rt_queue.first()) {
                (_, None) => break,
                (None, Some(_)) => true,
                (Some(pos), Some(rt)) => position_cmp(
                    &self.schema,
                    &Position::of_bound(rt.start.clone(), rt.start_kind),
                    pos,
                )
                .is_lt(),
            };
            if !due {
                break;
            }
            let rt = self.rt_queue.remove(0);
            let rt_end = RtMarker {
                clustering: rt.end.clone(),
                kind: rt.end_kind,
                tombstone: rt.tombstone,
                boundary_tombstone: None,
            };

            let mut need_write_start = true;
            if let Some(open) = self.end_open_marker.clone() {
                let rt_start_pos = Position::of_bound(rt.start.clone(), rt.start_kind);
                match position_cmp(&self.schema, &rt_start_pos, &open.position()) {
                    std::cmp::Ordering::Equal => {
                        self.write_rt_boundary(&rt, rt_end.clone()).await?;
                        need_write_start = false;
                    }
                    std::cmp::Ordering::Less => {
                        if open.tombstone != rt.tombstone {
                            // The open end has been superseded: close it and
                            // open the new one at once.
                            self.write_rt_boundary(&rt, rt_end.clone()).await?;
                        } else {
                            // Continuation of the open tombstone: just push
                            // the end out.
                            self.end_open_marker = Some(rt_end.clone());
                        }
                        need_write_start = false;
                    }
                    std::cmp::Ordering::Greater => {
                        let open = self.end_open_marker.take().unwrap();
                        self.consume_marker(open).await?;
                    }
                }
            }

            if need_write_start {
                self.end_open_marker = Some(rt_end);
                self.consume_marker(RtMarker {
                    clustering: rt.start,
                    kind: rt.start_kind,
                    tombstone: rt.tombstone,
                    boundary_tombstone: None,
                })
                .await?;
            }
        }

        if let Some(open) = &self.end_open_marker {
            let close = match &pos {
                None => true,
                Some(pos) => position_cmp(&self.schema, &open.position(), pos).is_lt(),
            };
            if close {
                let open = self.end_open_marker.take().unwrap();
                self.consume_marker(open).await?;
            }
        }
        Ok(())
    }

    async fn write_rt_boundary(&mut self, rt: &RangeTombstone, rt_end: RtMarker) -> Result<()> {
        let boundary_kind = if rt.start_kind == BoundKind::InclStart {
            BoundKind::ExclEndInclStart
        } else {
            BoundKind::InclEndExclStart
        };
        let closing = self.end_open_marker.take().unwrap().tombstone;
        self.end_open_marker = Some(rt_end);
        self.consume_marker(RtMarker {
            clustering: rt.start.clone(),
            kind: boundary_kind,
            tombstone: closing,
            boundary_tombstone: Some(rt.tombstone),
        })
        .await
    }

    fn encode_row_body(
        &mut self,
        body: &mut BytesMut,
        row: &Row,
        has_complex_deletion: bool,
    ) -> Result<()> {
        let mut properties = RowTimeProperties::default();
        if let Some(liveness) = &row.liveness {
            self.collector.update_timestamp(liveness.timestamp);
            self.enc_stats.put_delta_timestamp(body, liveness.timestamp);
            properties.timestamp = Some(liveness.timestamp);
            if let Some((ttl, expiry)) = liveness.expiry {
                self.collector.update_ttl(ttl);
                self.collector.update_local_deletion_time(expiry);
                self.enc_stats.put_delta_ttl(body, ttl);
                self.enc_stats.put_delta_local_deletion_time(body, expiry);
                properties.ttl = Some(ttl);
                properties.local_deletion_time = Some(expiry);
            }
        }
        if let Some(tombstone) = row.tombstone {
            self.collector.update_tombstone(tombstone);
            self.enc_stats
                .put_delta_deletion_time(body, DeletionTime::of(Some(tombstone)));
        }
        if let Some(shadowable) = row.shadowable_tombstone {
            self.collector.update_tombstone(shadowable);
            self.enc_stats
                .put_delta_deletion_time(body, DeletionTime::of(Some(shadowable)));
        }
        self.encode_cells(body, ColumnKind::Regular, row, properties, has_complex_deletion)
    }

    fn encode_cells(
        &mut self,
        body: &mut BytesMut,
        kind: ColumnKind,
        row: &Row,
        properties: RowTimeProperties,
        has_complex_deletion: bool,
    ) -> Result<()> {
        let layout: Vec<usize> = self.schema.layout(kind).to_vec();
        if let Some(out_of_range) = row.cells.keys().find(|c| **c >= layout.len()) {
            return Err(Error::malformed(format!(
                "cell for column {out_of_range} outside the schema"
            )));
        }
        if row.cells.len() < layout.len() {
            put_missing_columns(body, &layout, &row.cells);
        }

        for schema_index in layout.iter().copied() {
            let Some(cell) = row.cells.get(&schema_index) else {
                continue;
            };
            let column = self.schema.column(kind, schema_index).clone();
            match cell {
                Cell::Atomic(atomic) => {
                    if column.ty.is_multi_cell() || column.ty.is_counter() {
                        return Err(Error::malformed(format!(
                            "atomic cell on non-atomic column {}",
                            column.name
                        )));
                    }
                    self.collector.on_cell();
                    self.write_cell(body, atomic, &column.ty, &properties, None)?;
                }
                Cell::Counter { timestamp, shards } => {
                    if !column.ty.is_counter() {
                        return Err(Error::malformed(format!(
                            "counter cell on non-counter column {}",
                            column.name
                        )));
                    }
                    self.collector.on_cell();
                    let payload = encode_counter_shards(shards)?;
                    let cell = AtomicCell::live(*timestamp, payload);
                    self.write_cell(body, &cell, &column.ty, &properties, None)?;
                }
                Cell::Collection { tombstone, cells } => {
                    if !column.ty.is_multi_cell() {
                        return Err(Error::malformed(format!(
                            "collection cell on atomic column {}",
                            column.name
                        )));
                    }
                    if has_complex_deletion {
                        let dt = DeletionTime::of(*tombstone);
                        self.enc_stats.put_delta_deletion_time(body, dt);
                        if let Some(t) = tombstone {
                            self.collector.update_tombstone(*t);
                        }
                    }
                    codec::put_vint(body, cells.len() as u64);
                    if !cells.is_empty() {
                        self.collector.stats.columns_count += 1;
                    }
                    if cells.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
                        return Err(Error::malformed(format!(
                            "collection cells of {} are not sorted by path",
                            column.name
                        )));
                    }
                    for (path, cell) in cells {
                        self.collector.partition_cells += 1;
                        self.write_cell(body, cell, &column.ty, &properties, Some(path))?;
                    }
                }
            }
        }
        Ok(())
    }

    fn write_cell(
        &mut self,
        body: &mut BytesMut,
        cell: &AtomicCell,
        ty: &crate::value::ColumnType,
        properties: &RowTimeProperties,
        path: Option<&bytes::Bytes>,
    ) -> Result<()> {
        let is_deleted = !cell.is_live();
        let has_value = !is_deleted && !cell.value.is_empty();
        let use_row_timestamp = properties.timestamp == Some(cell.timestamp);
        let (is_expiring, cell_ttl, cell_expiry) = match cell.liveness {
            CellLiveness::Expiring { ttl, expiry } => (true, Some(ttl), Some(expiry)),
            _ => (false, None, None),
        };
        let use_row_ttl = properties.ttl.is_some()
            && is_expiring
            && properties.ttl == cell_ttl
            && properties.local_deletion_time == cell_expiry;

        let mut flags = 0u8;
        if !has_value {
            flags |= cell_flags::HAS_EMPTY_VALUE;
        }
        if is_deleted {
            flags |= cell_flags::IS_DELETED;
        } else if is_expiring {
            flags |= cell_flags::IS_EXPIRING;
        }
        if use_row_timestamp {
            flags |= cell_flags::USE_ROW_TIMESTAMP;
        }
        if use_row_ttl {
            flags |= cell_flags::USE_ROW_TTL;
        }
        body.put_u8(flags);

        if !use_row_timestamp {
            self.enc_stats.put_delta_timestamp(body, cell.timestamp);
        }
        if !use_row_ttl {
            match cell.liveness {
                CellLiveness::Deleted {
                    local_deletion_time,
                } => {
                    self.enc_stats
                        .put_delta_local_deletion_time(body, local_deletion_time);
                }
                CellLiveness::Expiring { ttl, expiry } => {
                    self.enc_stats.put_delta_local_deletion_time(body, expiry);
                    self.enc_stats.put_delta_ttl(body, ttl);
                }
                CellLiveness::Live => {}
            }
        }
        if let Some(path) = path {
            codec::put_bytes_vint(body, path);
        }
        if has_value {
            match ty.fixed_value_len() {
                Some(width) if !ty.is_counter() => {
                    if cell.value.len() != width {
                        return Err(Error::malformed(format!(
                            "fixed-width value of {} bytes, expected {width}",
                            cell.value.len()
                        )));
                    }
                    body.put_slice(&cell.value);
                }
                _ => codec::put_bytes_vint(body, &cell.value),
            }
        }

        // Cell statistics.
        self.collector.update_timestamp(cell.timestamp);
        match cell.liveness {
            CellLiveness::Deleted {
                local_deletion_time,
            } => {
                self.collector.update_local_deletion_time(local_deletion_time);
                self.collector
                    .stats
                    .tombstone_drop_time
                    .update(local_deletion_time as i64);
            }
            CellLiveness::Expiring { ttl, expiry } => {
                self.collector.update_ttl(ttl);
                self.collector.update_local_deletion_time(expiry);
                self.collector.stats.tombstone_drop_time.update(expiry as i64);
            }
            CellLiveness::Live => {
                self.collector.update_local_deletion_time(i32::MAX);
            }
        }
        Ok(())
    }

    fn seal_statistics(&mut self) -> Statistics {
        let header = SerializationHeader {
            min_timestamp: self.enc_stats.min_timestamp,
            min_local_deletion_time: self.enc_stats.min_local_deletion_time,
            min_ttl: self.enc_stats.min_ttl,
            pk_type_name: self.schema.pk_type_name(),
            clustering_type_names: self
                .schema
                .clustering
                .iter()
                .map(|c| c.ty.marshal_name())
                .collect(),
            static_columns: self
                .schema
                .columns(ColumnKind::Static)
                .iter()
                .map(|c| (bytes::Bytes::from(c.name.clone().into_bytes()), c.ty.marshal_name()))
                .collect(),
            regular_columns: self
                .schema
                .columns(ColumnKind::Regular)
                .iter()
                .map(|c| (bytes::Bytes::from(c.name.clone().into_bytes()), c.ty.marshal_name()))
                .collect(),
        };
        let mut stats = self.collector.stats.clone();
        if stats.min_ttl == u32::MAX {
            stats.min_ttl = 0;
        }
        Statistics {
            components: vec![
                MetadataComponent::Validation(ValidationMetadata {
                    partitioner_name: Murmur3Partitioner.name().to_string(),
                    bloom_filter_fp_chance: self.schema.bloom_filter_fp_chance,
                }),
                MetadataComponent::Compaction(Default::default()),
                MetadataComponent::Stats(stats),
                MetadataComponent::Serialization(header),
            ],
        }
    }

    fn scylla_metadata(&self, first: &DecoratedKey, last: &DecoratedKey) -> ScyllaMetadata {
        ScyllaMetadata {
            sharding: Some(ShardingMetadata {
                token_ranges: vec![TokenRange {
                    left_exclusive: false,
                    left: bytes::Bytes::copy_from_slice(&first.token.0.to_be_bytes()),
                    right_exclusive: false,
                    right: bytes::Bytes::copy_from_slice(&last.token.0.to_be_bytes()),
                }],
            }),
            features: Some(self.features),
        }
    }
}

/// Serialize the missing-columns bitmap for a row that does not carry
/// every column of the layout.
fn put_missing_columns(
    buf: &mut BytesMut,
    layout: &[usize],
    cells: &std::collections::BTreeMap<usize, Cell>,
) {
    let n = layout.len();
    let present: Vec<u64> = layout
        .iter()
        .enumerate()
        .filter(|(_, schema_index)| cells.contains_key(schema_index))
        .map(|(layout_index, _)| layout_index as u64)
        .collect();

    if n <= 64 {
        let mut absent_mask = 0u64;
        for (layout_index, schema_index) in layout.iter().enumerate() {
            if !cells.contains_key(schema_index) {
                absent_mask |= 1 << layout_index;
            }
        }
        codec::put_vint(buf, absent_mask);
        return;
    }

    // The branch below is a pure function of (n, present count), so the
    // reader can follow the same one without a discriminator byte.
    let k = present.len();
    codec::put_vint(buf, k as u64);
    if k <= n / 3 {
        for index in present {
            codec::put_vint(buf, index);
        }
    } else if n - k <= n / 3 {
        for (layout_index, schema_index) in layout.iter().enumerate() {
            if !cells.contains_key(schema_index) {
                codec::put_vint(buf, layout_index as u64);
            }
        }
    } else {
        let mut bitmap = vec![0u8; n.div_ceil(8)];
        for (layout_index, schema_index) in layout.iter().enumerate() {
            if !cells.contains_key(schema_index) {
                bitmap[layout_index / 8] |= 1 << (layout_index % 8);
            }
        }
        buf.put_slice(&bitmap);
    }
}

pub(crate) fn encode_counter_shards(shards: &[CounterShard]) -> Result<bytes::Bytes> {
    if shards.windows(2).any(|pair| pair[0].id >= pair[1].id) {
        return Err(Error::malformed("counter shards are not sorted by id"));
    }
    if shards.len() > i16::MAX as usize {
        return Err(Error::malformed("too many counter shards"));
    }
    let mut buf = BytesMut::new();
    buf.put_i16(shards.len() as i16);
    for i in 0..shards.len() {
        // Placeholder header slots, one per shard.
        buf.put_i16(-(i as i16 + 1));
    }
    for shard in shards {
        buf.put_slice(shard.id.as_bytes());
        buf.put_i64(shard.clock);
        buf.put_i64(shard.value);
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_columns_small_mask() {
        let layout = vec![0usize, 1, 2];
        let mut cells = std::collections::BTreeMap::new();
        cells.insert(0usize, Cell::Atomic(AtomicCell::live(1, vec![1u8, 2, 3, 4])));
        cells.insert(2usize, Cell::Atomic(AtomicCell::live(1, vec![1u8, 2, 3, 4])));
        let mut buf = BytesMut::new();
        put_missing_columns(&mut buf, &layout, &cells);
        let mut slice = &buf[..];
        // Column 1 is the only absent one.
        assert_eq!(codec::get_vint(&mut slice).unwrap(), 0b010);
    }

    #[test]
    fn counter_shards_must_be_sorted() {
        let id1 = uuid::Uuid::from_u128(1);
        let id2 = uuid::Uuid::from_u128(2);
        let sorted = [
            CounterShard {
                id: id1,
                clock: 1,
                value: 10,
            },
            CounterShard {
                id: id2,
                clock: 1,
                value: 20,
            },
        ];
        assert!(encode_counter_shards(&sorted).is_ok());
        let unsorted = [sorted[1], sorted[0]];
        assert!(encode_counter_shards(&unsorted).is_err());
    }
}
