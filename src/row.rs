// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! Rows, cells and range tombstones, plus the flag bytes that tag their
//! on-disk variants.

use std::collections::BTreeMap;

use bytes::Bytes;
use uuid::Uuid;

use crate::clustering::{BoundKind, ClusteringPrefix};
use crate::error::{Error, Result};
use crate::types::{DecoratedKey, LivenessInfo, LocalDeletionTime, Timestamp, Tombstone};

/// First byte of every unfiltered entry in the data file.
pub mod row_flags {
    pub const END_OF_PARTITION: u8 = 0x01;
    pub const IS_MARKER: u8 = 0x02;
    pub const HAS_TIMESTAMP: u8 = 0x04;
    pub const HAS_TTL: u8 = 0x08;
    pub const HAS_DELETION: u8 = 0x10;
    pub const HAS_ALL_COLUMNS: u8 = 0x20;
    pub const HAS_COMPLEX_DELETION: u8 = 0x40;
    pub const EXTENSION_FLAG: u8 = 0x80;
}

/// Second flags byte, present when `EXTENSION_FLAG` is set.
pub mod row_extended_flags {
    pub const IS_STATIC: u8 = 0x01;
    /// The deprecated Cassandra shadowable bit; files carrying it are
    /// rejected.
    pub const HAS_SHADOWABLE_DELETION_CASSANDRA: u8 = 0x02;
    pub const HAS_SHADOWABLE_DELETION: u8 = 0x80;

    pub fn validate(raw: u8) -> crate::error::Result<()> {
        if raw & HAS_SHADOWABLE_DELETION_CASSANDRA != 0 {
            return Err(crate::error::Error::unsupported(
                "row extended flags",
                "cassandra-style shadowable deletion",
            ));
        }
        let known = IS_STATIC | HAS_SHADOWABLE_DELETION;
        if raw & !known != 0 {
            return Err(crate::error::Error::unsupported(
                "row extended flags",
                format!("{raw:#04x}"),
            ));
        }
        Ok(())
    }
}

/// Per-cell flag byte.
pub mod cell_flags {
    pub const IS_DELETED: u8 = 0x01;
    pub const IS_EXPIRING: u8 = 0x02;
    pub const HAS_EMPTY_VALUE: u8 = 0x04;
    pub const USE_ROW_TIMESTAMP: u8 = 0x08;
    pub const USE_ROW_TTL: u8 = 0x10;

    pub fn validate(raw: u8) -> crate::error::Result<()> {
        let known = IS_DELETED | IS_EXPIRING | HAS_EMPTY_VALUE | USE_ROW_TIMESTAMP | USE_ROW_TTL;
        if raw & !known != 0 {
            return Err(crate::error::Error::unsupported(
                "cell flags",
                format!("{raw:#04x}"),
            ));
        }
        Ok(())
    }
}

/// Liveness mode of an atomic cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellLiveness {
    Live,
    Expiring {
        ttl: u32,
        expiry: LocalDeletionTime,
    },
    Deleted {
        local_deletion_time: LocalDeletionTime,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AtomicCell {
    pub timestamp: Timestamp,
    pub liveness: CellLiveness,
    pub value: Bytes,
}

impl AtomicCell {
    pub fn live(timestamp: Timestamp, value: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            liveness: CellLiveness::Live,
            value: value.into(),
        }
    }

    pub fn expiring(
        timestamp: Timestamp,
        value: impl Into<Bytes>,
        ttl: u32,
        expiry: LocalDeletionTime,
    ) -> Self {
        Self {
            timestamp,
            liveness: CellLiveness::Expiring { ttl, expiry },
            value: value.into(),
        }
    }

    pub fn deleted(timestamp: Timestamp, local_deletion_time: LocalDeletionTime) -> Self {
        Self {
            timestamp,
            liveness: CellLiveness::Deleted {
                local_deletion_time,
            },
            value: Bytes::new(),
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.liveness, CellLiveness::Deleted { .. })
    }
}

/// One originator's contribution to a counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterShard {
    pub id: Uuid,
    pub clock: i64,
    pub value: i64,
}

/// A column's payload within one row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cell {
    Atomic(AtomicCell),
    /// Shards are kept sorted by counter id; the cell-level timestamp and
    /// liveness ride on the embedded atomic cell whose value bytes are the
    /// serialized shards.
    Counter {
        timestamp: Timestamp,
        shards: Vec<CounterShard>,
    },
    Collection {
        tombstone: Option<Tombstone>,
        /// `(cell path, cell)` entries sorted by path.
        cells: Vec<(Bytes, AtomicCell)>,
    },
}

impl Cell {
    pub fn has_collection_tombstone(&self) -> bool {
        matches!(
            self,
            Cell::Collection {
                tombstone: Some(_),
                ..
            }
        )
    }
}

/// A row: optional marker liveness, optional tombstones, and cells keyed
/// by the column's index within its kind (schema order).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    pub liveness: Option<LivenessInfo>,
    pub tombstone: Option<Tombstone>,
    /// Superseded by any later row insert; used by materialized views.
    pub shadowable_tombstone: Option<Tombstone>,
    pub cells: BTreeMap<usize, Cell>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_liveness(mut self, liveness: LivenessInfo) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn with_tombstone(mut self, tombstone: Tombstone) -> Self {
        self.tombstone = Some(tombstone);
        self
    }

    pub fn with_cell(mut self, column: usize, cell: Cell) -> Self {
        self.cells.insert(column, cell);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.liveness.is_none()
            && self.tombstone.is_none()
            && self.shadowable_tombstone.is_none()
            && self.cells.is_empty()
    }

    pub fn has_complex_deletion(&self) -> bool {
        self.cells.values().any(Cell::has_collection_tombstone)
    }
}

/// A tombstone over a contiguous clustering range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeTombstone {
    pub start: ClusteringPrefix,
    pub start_kind: BoundKind,
    pub end: ClusteringPrefix,
    pub end_kind: BoundKind,
    pub tombstone: Tombstone,
}

impl RangeTombstone {
    pub fn new(
        start: ClusteringPrefix,
        start_kind: BoundKind,
        end: ClusteringPrefix,
        end_kind: BoundKind,
        tombstone: Tombstone,
    ) -> Result<Self> {
        if !start_kind.is_start() || start_kind.is_boundary() {
            return Err(Error::malformed(format!(
                "{start_kind:?} is not a range tombstone start"
            )));
        }
        if !end_kind.is_end() || end_kind.is_boundary() {
            return Err(Error::malformed(format!(
                "{end_kind:?} is not a range tombstone end"
            )));
        }
        Ok(Self {
            start,
            start_kind,
            end,
            end_kind,
            tombstone,
        })
    }
}

/// One element of the event stream a reader reproduces and a writer
/// consumes.
#[derive(Clone, Debug, PartialEq)]
pub enum SsTableEvent {
    PartitionStart {
        key: DecoratedKey,
        tombstone: Option<Tombstone>,
    },
    StaticRow(Row),
    Row {
        clustering: ClusteringPrefix,
        row: Row,
    },
    RangeTombstone(RangeTombstone),
    PartitionEnd,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_cell_flag_bits_are_unsupported() {
        assert!(cell_flags::validate(0x1f).is_ok());
        assert!(cell_flags::validate(0x20).is_err());
        assert!(cell_flags::validate(0x80).is_err());
    }

    #[test]
    fn cassandra_shadowable_bit_is_rejected() {
        assert!(row_extended_flags::validate(0x01).is_ok());
        assert!(row_extended_flags::validate(0x80).is_ok());
        assert!(row_extended_flags::validate(0x02).is_err());
    }

    #[test]
    fn range_tombstone_kind_validation() {
        let t = Tombstone {
            timestamp: 1,
            local_deletion_time: 1,
        };
        assert!(RangeTombstone::new(
            ClusteringPrefix::empty(),
            BoundKind::InclStart,
            ClusteringPrefix::empty(),
            BoundKind::InclEnd,
            t,
        )
        .is_ok());
        assert!(RangeTombstone::new(
            ClusteringPrefix::empty(),
            BoundKind::InclEnd,
            ClusteringPrefix::empty(),
            BoundKind::InclStart,
            t,
        )
        .is_err());
    }
}
