// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! An SSTable storage engine speaking the Cassandra 3.x "mc" on-disk
//! format: immutable, sorted files of partitions with clustering rows,
//! static rows and range tombstones.
//!
//! Writers consume an ordered stream of partition/row events and seal a
//! self-describing file family (Data, Index, Summary, Filter,
//! Statistics, CompressionInfo, Digest, CRC, Scylla, TOC). Readers
//! reproduce the same stream with partition-range scans, clustering
//! slices and promoted-index fast-forwarding.

#![feature(error_generic_member_access)]
#![deny(unused_must_use)]

pub mod background;
pub mod cache;
pub mod checksum;
pub mod clustering;
pub mod codec;
pub mod error;
pub mod metadata;
pub mod options;
pub mod partitioner;
pub mod reader;
pub mod row;
pub mod schema;
pub mod sstable;
pub mod types;
pub mod value;
pub mod writer;

pub use clustering::{BoundKind, ClusteringPrefix, Position};
pub use error::{Error, ErrorKind, Result};
pub use metadata::{ComponentType, Descriptor, Version};
pub use options::SsTableOptions;
pub use partitioner::{Murmur3Partitioner, Partitioner};
pub use reader::{ClusteringRange, ClusteringSlice, PartitionRange, ReadOptions, SsTableReader};
pub use row::{
    AtomicCell, Cell, CellLiveness, CounterShard, RangeTombstone, Row, SsTableEvent,
};
pub use schema::{ColumnDef, ColumnKind, CompressionParams, Schema, SchemaBuilder};
pub use sstable::{cleanup_unsealed, recover_dir, OpenInfo, SsTable};
pub use types::{DecoratedKey, EncodingStats, LivenessInfo, Token, Tombstone};
pub use value::{ColumnType, Value};
pub use writer::{EndOfPartition, LargePartitionObserver, SsTableWriter};
