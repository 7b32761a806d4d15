// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! The read path: an event-stream state machine over the data file,
//! driven by the index, summary and promoted index, with clustering
//! slices and forwarding.

pub mod data;
pub mod index;
pub mod source;

use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use crate::clustering::{position_cmp, BoundKind, ClusteringPrefix, Position};
use crate::error::{Error, Result};
use crate::partitioner::{Murmur3Partitioner, Partitioner};
use crate::reader::data::{read_atom, read_partition_header, Atom, ParseContext};
use crate::reader::index::{IndexEntry, IndexReader, PromotedIndex};
use crate::reader::source::{BufferedSource, Deadline, ReadCounter};
use crate::row::{RangeTombstone, SsTableEvent};
use crate::schema::Schema;
use crate::sstable::SsTable;
use crate::types::{DecoratedKey, Tombstone};

/// A clustering range with normalized bounds: the start is always an
/// `InclStart`/`ExclStart` prefix (empty meaning unbounded), the end an
/// `InclEnd`/`ExclEnd` prefix (empty meaning unbounded).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusteringRange {
    start: (ClusteringPrefix, BoundKind),
    end: (ClusteringPrefix, BoundKind),
}

impl ClusteringRange {
    pub fn new(
        start: Option<(ClusteringPrefix, bool)>,
        end: Option<(ClusteringPrefix, bool)>,
    ) -> Self {
        let start = match start {
            None => (ClusteringPrefix::empty(), BoundKind::InclStart),
            Some((prefix, true)) => (prefix, BoundKind::InclStart),
            Some((prefix, false)) => (prefix, BoundKind::ExclStart),
        };
        let end = match end {
            None => (ClusteringPrefix::empty(), BoundKind::InclEnd),
            Some((prefix, true)) => (prefix, BoundKind::InclEnd),
            Some((prefix, false)) => (prefix, BoundKind::ExclEnd),
        };
        Self { start, end }
    }

    pub fn all() -> Self {
        Self::new(None, None)
    }

    fn start_position(&self) -> Position {
        if self.start.0.is_empty() {
            // Before everything, static row included.
            Position {
                prefix: ClusteringPrefix::empty(),
                weight: -3,
            }
        } else {
            Position::of_bound(self.start.0.clone(), self.start.1)
        }
    }

    fn end_position(&self) -> Position {
        if self.end.0.is_empty() {
            Position {
                prefix: ClusteringPrefix::empty(),
                weight: 3,
            }
        } else {
            Position::of_bound(self.end.0.clone(), self.end.1)
        }
    }
}

/// A union of clustering ranges, ascending and disjoint.
#[derive(Clone, Debug, Default)]
pub struct ClusteringSlice {
    pub ranges: Vec<ClusteringRange>,
}

impl ClusteringSlice {
    pub fn of(ranges: Vec<ClusteringRange>) -> Self {
        Self { ranges }
    }
}

/// Bounds on the partitions to scan, by decorated key.
#[derive(Clone, Debug, Default)]
pub struct PartitionRange {
    pub lower: Option<(DecoratedKey, bool)>,
    pub upper: Option<(DecoratedKey, bool)>,
}

#[derive(Clone, Debug)]
pub struct ReadOptions {
    pub partition_range: PartitionRange,
    /// Clustering filter applied to every partition. `None` reads
    /// everything.
    pub slice: Option<ClusteringSlice>,
    /// Emit clustered content only in response to
    /// [`SsTableReader::fast_forward_clustering`] calls.
    pub row_forwarding: bool,
    /// Allow [`SsTableReader::fast_forward_to`] to narrow the partition
    /// range mid-scan.
    pub partition_forwarding: bool,
    /// Overrides the table's buffer size; 1 forces fine-grained reads.
    pub buffer_size: Option<usize>,
    pub deadline: Option<Instant>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            partition_range: PartitionRange::default(),
            slice: None,
            row_forwarding: false,
            partition_forwarding: false,
            buffer_size: None,
            deadline: None,
        }
    }
}

enum ReaderState {
    NeedPartition,
    InPartition,
    Done,
}

struct CurrentPartition {
    start_offset: u64,
    promoted: Option<Arc<PromotedIndex>>,
    static_pending: bool,
    pending_atom: Option<Atom>,
    ranges: Vec<ClusteringRange>,
    range_index: usize,
    need_seek: bool,
    /// The open range tombstone: start bound and its tombstone. The start
    /// may lie before the active range; bounds are intersected at
    /// emission.
    open_rt: Option<(ClusteringPrefix, BoundKind, Tombstone)>,
    /// Rows seen while a range tombstone is open. The stream positions a
    /// full range tombstone at its start, so the rows it spans must wait
    /// until its end bound resolves it.
    row_buffer: Vec<SsTableEvent>,
    /// Events ready to go out, in order.
    queued: std::collections::VecDeque<SsTableEvent>,
    exhausted: bool,
}

impl CurrentPartition {
    fn active_range(&self) -> Option<&ClusteringRange> {
        self.ranges.get(self.range_index)
    }

    /// Resolve the open tombstone into the queue: the tombstone piece (if
    /// any survived intersection) goes first, then the rows it covered.
    fn resolve_open(&mut self, piece: Option<RangeTombstone>) {
        if let Some(piece) = piece {
            self.queued.push_back(SsTableEvent::RangeTombstone(piece));
        }
        self.queued.extend(self.row_buffer.drain(..));
    }
}

/// A lazy, finite, non-restartable stream of [`SsTableEvent`]s. Returns
/// `None` at end of stream, or in row-forwarding mode when the active
/// range is drained and the reader awaits the next fast-forward.
pub struct SsTableReader {
    table: Arc<SsTable>,
    ctx: ParseContext,
    data: BufferedSource,
    index: IndexReader,
    options: ReadOptions,
    partitioner: Murmur3Partitioner,
    state: ReaderState,
    current: Option<CurrentPartition>,
    pending_entry: Option<IndexEntry>,
    data_reads: ReadCounter,
}

impl SsTableReader {
    pub(crate) async fn open(table: Arc<SsTable>, options: ReadOptions) -> Result<SsTableReader> {
        let deadline = options
            .deadline
            .map(Deadline::at)
            .unwrap_or_else(Deadline::none);
        let data_reads = ReadCounter::default();
        let data = BufferedSource::new(
            table.data_source(options.buffer_size)?,
            data_reads.clone(),
            deadline,
        );
        let index_src = BufferedSource::new(table.index_source(), ReadCounter::default(), deadline);
        let index = IndexReader::new(index_src, table.schema().clone());

        let mut reader = SsTableReader {
            ctx: ParseContext {
                schema: table.schema().clone(),
                stats: table.encoding_stats(),
            },
            data,
            index,
            options,
            partitioner: Murmur3Partitioner,
            state: ReaderState::NeedPartition,
            current: None,
            pending_entry: None,
            data_reads,
            table,
        };
        if let Some(lower) = reader.options.partition_range.lower.clone() {
            reader.seek_partitions(&lower).await?;
        }
        Ok(reader)
    }

    /// Physical data-file reads so far; promoted-index speedups are
    /// measured against this.
    pub fn data_reads(&self) -> u64 {
        self.data_reads.get()
    }

    /// Reposition to the first partition at or after the range's lower
    /// bound and narrow the upper bound. Only meaningful between
    /// partitions or to skip forward.
    pub async fn fast_forward_to(&mut self, range: PartitionRange) -> Result<()> {
        if !self.options.partition_forwarding {
            return Err(Error::unsupported(
                "fast_forward_to",
                "reader was not opened with partition forwarding",
            ));
        }
        self.current = None;
        self.pending_entry = None;
        self.state = ReaderState::NeedPartition;
        if let Some(lower) = range.lower.clone() {
            self.seek_partitions(&lower).await?;
        }
        self.options.partition_range = range;
        Ok(())
    }

    /// Restrict the current partition to `range` and position there. The
    /// ranges of successive calls must be ascending.
    pub async fn fast_forward_clustering(&mut self, range: ClusteringRange) -> Result<()> {
        let Some(current) = self.current.as_mut() else {
            return Err(Error::out_of_order(
                "fast_forward_clustering outside a partition",
            ));
        };
        // The open tombstone and the lookahead atom survive the call: the
        // seek decides whether they are still valid for the new range.
        current.ranges = vec![range];
        current.range_index = 0;
        current.need_seek = true;
        current.exhausted = false;
        Ok(())
    }

    /// Abandon the rest of the current partition; the next event is its
    /// `PartitionEnd`.
    pub async fn next_partition(&mut self) -> Result<()> {
        if let Some(current) = self.current.as_mut() {
            current.exhausted = true;
            current.pending_atom = None;
            current.open_rt = None;
            current.row_buffer.clear();
            current.queued.clear();
        }
        Ok(())
    }

    pub async fn next(&mut self) -> Result<Option<SsTableEvent>> {
        loop {
            match self.state {
                ReaderState::Done => return Ok(None),
                ReaderState::NeedPartition => {
                    let entry = match self.pending_entry.take() {
                        Some(entry) => entry,
                        None => match self.index.next_entry().await? {
                            Some(entry) => entry,
                            None => {
                                self.state = ReaderState::Done;
                                return Ok(None);
                            }
                        },
                    };
                    let key = DecoratedKey::new(
                        self.partitioner.token(&entry.key),
                        entry.key.clone(),
                    );
                    if let Some((upper, inclusive)) = &self.options.partition_range.upper {
                        let beyond = if *inclusive { key > *upper } else { key >= *upper };
                        if beyond {
                            self.state = ReaderState::Done;
                            return Ok(None);
                        }
                    }

                    self.data.seek(entry.data_offset);
                    let (header_key, tombstone) = read_partition_header(&mut self.data).await?;
                    if header_key != entry.key {
                        return Err(Error::malformed(
                            "index entry does not match the partition header",
                        ));
                    }

                    let ranges = if self.options.row_forwarding {
                        vec![]
                    } else {
                        match &self.options.slice {
                            Some(slice) => slice.ranges.clone(),
                            None => vec![ClusteringRange::all()],
                        }
                    };
                    let has_slice = self.options.slice.is_some();
                    self.current = Some(CurrentPartition {
                        start_offset: entry.data_offset,
                        promoted: entry.promoted.clone(),
                        static_pending: true,
                        pending_atom: None,
                        need_seek: has_slice && !ranges.is_empty(),
                        ranges,
                        range_index: 0,
                        open_rt: None,
                        row_buffer: vec![],
                        queued: std::collections::VecDeque::new(),
                        exhausted: false,
                    });
                    self.state = ReaderState::InPartition;
                    return Ok(Some(SsTableEvent::PartitionStart { key, tombstone }));
                }
                ReaderState::InPartition => {
                    if let Some(event) = self.partition_step().await? {
                        return Ok(Some(event));
                    }
                    // Row-forwarding pause: nothing to emit until the next
                    // fast-forward call.
                    if matches!(self.state, ReaderState::InPartition) {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Produce the next event of the current partition, or `None` when the
    /// reader pauses awaiting a fast-forward.
    async fn partition_step(&mut self) -> Result<Option<SsTableEvent>> {
        // Static row first, filtered only by its existence.
        if self.current.as_ref().unwrap().static_pending {
            let current = self.current.as_mut().unwrap();
            current.static_pending = false;
            if self.ctx.schema.has_statics() {
                let atom = read_atom(&mut self.data, &self.ctx).await?;
                match atom {
                    Atom::Static(row) => return Ok(Some(SsTableEvent::StaticRow(row))),
                    other => self.current.as_mut().unwrap().pending_atom = Some(other),
                }
            }
        }

        let row_forwarding = self.options.row_forwarding;
        loop {
            let current = self.current.as_mut().unwrap();
            if let Some(event) = current.queued.pop_front() {
                return Ok(Some(event));
            }
            if current.exhausted {
                self.current = None;
                self.state = ReaderState::NeedPartition;
                return Ok(Some(SsTableEvent::PartitionEnd));
            }
            if current.active_range().is_none() {
                if row_forwarding {
                    // Pause: await fast_forward_clustering or
                    // next_partition.
                    return Ok(None);
                }
                current.exhausted = true;
                continue;
            }
            if current.need_seek {
                self.seek_to_range().await?;
                continue;
            }

            let current = self.current.as_mut().unwrap();
            let atom = match current.pending_atom.take() {
                Some(atom) => atom,
                None => read_atom(&mut self.data, &self.ctx).await?,
            };

            match atom {
                Atom::EndOfPartition => {
                    // A well-formed partition closes every range tombstone
                    // before its end; a trimmed leftover can only remain
                    // when the range end cut it short.
                    let schema = self.ctx.schema.clone();
                    let current = self.current.as_mut().unwrap();
                    let piece = match (current.open_rt.take(), current.active_range().cloned()) {
                        (Some(open), Some(range)) => intersect_open(&schema, &open, &range, None),
                        _ => None,
                    };
                    current.resolve_open(piece);
                    current.exhausted = true;
                }
                Atom::Static(_) => {
                    return Err(Error::malformed("static row after the partition header"));
                }
                Atom::Row { clustering, row } => {
                    let pos = Position::row(clustering.clone());
                    match self.locate(&pos) {
                        Location::BeforeRange => continue,
                        Location::InRange => {
                            let event = SsTableEvent::Row { clustering, row };
                            let current = self.current.as_mut().unwrap();
                            if current.open_rt.is_some() {
                                // Positioned after the open tombstone's
                                // start; wait for its end bound.
                                current.row_buffer.push(event);
                                continue;
                            }
                            return Ok(Some(event));
                        }
                        Location::AfterRange => {
                            self.advance_range(Some(Atom::Row { clustering, row }))?;
                        }
                    }
                }
                Atom::Marker {
                    clustering,
                    kind,
                    tombstone,
                    boundary_tombstone,
                } => {
                    let pos = Position::of_bound(clustering.clone(), kind);
                    if matches!(self.locate(&pos), Location::AfterRange) {
                        self.advance_range(Some(Atom::Marker {
                            clustering,
                            kind,
                            tombstone,
                            boundary_tombstone,
                        }))?;
                        continue;
                    }
                    let resolves = kind.is_end();
                    let event =
                        self.apply_marker(clustering, kind, tombstone, boundary_tombstone)?;
                    if resolves {
                        let current = self.current.as_mut().unwrap();
                        let piece = match event {
                            Some(SsTableEvent::RangeTombstone(piece)) => Some(piece),
                            _ => None,
                        };
                        current.resolve_open(piece);
                    }
                }
            }
        }
    }

    fn locate(&self, pos: &Position) -> Location {
        let current = self.current.as_ref().unwrap();
        let range = current.active_range().unwrap();
        if position_cmp(&self.ctx.schema, pos, &range.start_position()).is_lt() {
            Location::BeforeRange
        } else if position_cmp(&self.ctx.schema, pos, &range.end_position()).is_gt() {
            Location::AfterRange
        } else {
            Location::InRange
        }
    }

    /// Move to the next range, queueing the trimmed piece of an open
    /// range tombstone cut by the end of the current range. The open
    /// tombstone itself survives the move: it may span into later ranges.
    /// `reprocess` is re-queued; a later seek drops it only when it
    /// actually moves to a later block.
    fn advance_range(&mut self, reprocess: Option<Atom>) -> Result<()> {
        let schema = self.ctx.schema.clone();
        let row_forwarding = self.options.row_forwarding;
        let current = self.current.as_mut().unwrap();
        let range = current.active_range().cloned().unwrap();
        let piece = current
            .open_rt
            .as_ref()
            .and_then(|open| intersect_open(&schema, open, &range, None));
        current.resolve_open(piece);

        current.range_index += 1;
        if current.range_index >= current.ranges.len() {
            if row_forwarding {
                // Pause instead of ending the partition: the caller may
                // fast-forward again, and the lookahead atom may fall into
                // the next range.
                current.ranges.clear();
                current.range_index = 0;
                current.pending_atom = reprocess;
            } else {
                current.exhausted = true;
            }
            return Ok(());
        }

        current.need_seek = current.promoted.is_some();
        current.pending_atom = reprocess;
        Ok(())
    }

    /// Position the data source at the block covering the active range's
    /// start, re-establishing the range tombstone open at block entry.
    async fn seek_to_range(&mut self) -> Result<()> {
        let (range, promoted, start_offset) = {
            let current = self.current.as_mut().unwrap();
            current.need_seek = false;
            (
                current.active_range().cloned().unwrap(),
                current.promoted.clone(),
                current.start_offset,
            )
        };
        let Some(promoted) = promoted else {
            return Ok(());
        };
        let block_index = promoted.block_for(&self.ctx.schema, &range.start_position());
        let block = &promoted.blocks[block_index];
        let target = start_offset + block.offset;
        // Never seek backwards: the sequential position may already be
        // past this block's start within the same range sweep.
        if target > self.data.position() {
            self.data.seek(target);
            // The marker open on entry to block k is the one recorded as
            // still open at the end of block k-1.
            let entry_marker = block_index
                .checked_sub(1)
                .and_then(|prev| promoted.blocks[prev].open_marker);
            let current = self.current.as_mut().unwrap();
            current.pending_atom = None;
            current.open_rt = entry_marker
                .map(|tombstone| (ClusteringPrefix::empty(), BoundKind::InclStart, tombstone));
        }
        Ok(())
    }

    /// Fold a decoded marker into the open-tombstone state, emitting the
    /// completed range tombstone when one closes inside the range.
    fn apply_marker(
        &mut self,
        clustering: ClusteringPrefix,
        kind: BoundKind,
        tombstone: Tombstone,
        boundary_tombstone: Option<Tombstone>,
    ) -> Result<Option<SsTableEvent>> {
        let schema = self.ctx.schema.clone();
        let current = self.current.as_mut().unwrap();
        let range = current.active_range().cloned().unwrap();

        let mut emitted = None;
        if kind.is_end() {
            let open = current.open_rt.take().ok_or_else(|| {
                Error::malformed("range tombstone end without a matching start")
            })?;
            let close_kind = match kind {
                BoundKind::ExclEndInclStart => BoundKind::ExclEnd,
                BoundKind::InclEndExclStart => BoundKind::InclEnd,
                other => other,
            };
            emitted = intersect_open(
                &schema,
                &(open.0, open.1, tombstone),
                &range,
                Some((clustering.clone(), close_kind)),
            );
        }
        if kind.is_start() {
            let start_kind = match kind {
                BoundKind::ExclEndInclStart => BoundKind::InclStart,
                BoundKind::InclEndExclStart => BoundKind::ExclStart,
                other => other,
            };
            let open_tombstone = boundary_tombstone.unwrap_or(tombstone);
            let current = self.current.as_mut().unwrap();
            if current.open_rt.is_some() && !kind.is_boundary() {
                return Err(Error::malformed(
                    "range tombstone start while another is open",
                ));
            }
            current.open_rt = Some((clustering, start_kind, open_tombstone));
        }
        Ok(emitted.map(SsTableEvent::RangeTombstone))
    }

    /// Binary-search the summary, then scan the index to the first
    /// partition at or after the bound.
    async fn seek_partitions(&mut self, lower: &(DecoratedKey, bool)) -> Result<()> {
        let (bound, inclusive) = lower;
        if let Some(entry_index) = self.table.summary().search(bound.token) {
            let position = self.table.summary().entries[entry_index].position;
            self.index.seek(position);
        } else {
            self.index.seek(0);
        }
        loop {
            let Some(entry) = self.index.next_entry().await? else {
                self.state = ReaderState::Done;
                return Ok(());
            };
            let key = DecoratedKey::new(self.partitioner.token(&entry.key), entry.key.clone());
            let found = if *inclusive {
                key >= *bound
            } else {
                key > *bound
            };
            if found {
                self.pending_entry = Some(entry);
                return Ok(());
            }
        }
    }
}

enum Location {
    BeforeRange,
    InRange,
    AfterRange,
}

/// Intersect an open range tombstone with the active range, closed either
/// by an explicit end bound or by the range's own end. `None` when the
/// intersection is empty.
fn intersect_open(
    schema: &Schema,
    open: &(ClusteringPrefix, BoundKind, Tombstone),
    range: &ClusteringRange,
    close: Option<(ClusteringPrefix, BoundKind)>,
) -> Option<RangeTombstone> {
    let (open_prefix, open_kind, tombstone) = open;

    // Start: the later of the tombstone's own start and the range start.
    let (start, start_kind) = if open_prefix.is_empty()
        || position_cmp(
            schema,
            &Position::of_bound(open_prefix.clone(), *open_kind),
            &range.start_position(),
        )
        .is_lt()
    {
        range.start.clone()
    } else {
        (open_prefix.clone(), *open_kind)
    };

    // End: the earlier of the explicit close and the range end.
    let (end, end_kind) = match close {
        Some((close_prefix, close_kind)) => {
            if position_cmp(
                schema,
                &Position::of_bound(close_prefix.clone(), close_kind),
                &range.end_position(),
            )
            .is_gt()
            {
                range.end.clone()
            } else {
                (close_prefix, close_kind)
            }
        }
        None => range.end.clone(),
    };

    if start.is_empty() && end.is_empty() {
        warn!("open range tombstone with no bounds at all; dropping");
        return None;
    }
    if !start.is_empty() && !end.is_empty() {
        let start_pos = Position::of_bound(start.clone(), start_kind);
        let end_pos = Position::of_bound(end.clone(), end_kind);
        if position_cmp(schema, &start_pos, &end_pos).is_gt() {
            return None;
        }
    }
    RangeTombstone::new(start, start_kind, end, end_kind, *tombstone).ok()
}
