// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! Data-file decoding: partition headers, rows, range-tombstone markers
//! and cells, the exact inverse of the write path.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::clustering::{BoundKind, ClusteringPrefix};
use crate::codec;
use crate::error::{Error, Result};
use crate::reader::source::BufferedSource;
use crate::row::{cell_flags, row_extended_flags, row_flags, AtomicCell, Cell, CellLiveness, CounterShard, Row};
use crate::schema::{ColumnKind, Schema};
use crate::types::{DeletionTime, EncodingStats, LivenessInfo, Timestamp, Tombstone};

/// Everything the decoder needs besides bytes: the schema and the delta
/// bases from the serialization header.
pub struct ParseContext {
    pub schema: Arc<Schema>,
    pub stats: EncodingStats,
}

/// One decoded unfiltered entry.
#[derive(Debug)]
pub enum Atom {
    Static(Row),
    Row {
        clustering: ClusteringPrefix,
        row: Row,
    },
    Marker {
        clustering: ClusteringPrefix,
        kind: BoundKind,
        tombstone: Tombstone,
        /// The opening tombstone of a boundary marker.
        boundary_tombstone: Option<Tombstone>,
    },
    EndOfPartition,
}

/// Partition header: `disk_string<u16>` key then the partition deletion
/// time.
pub async fn read_partition_header(src: &mut BufferedSource) -> Result<(Bytes, Option<Tombstone>)> {
    let key_len = src.read_u16().await? as usize;
    let key = src.read_bytes(key_len).await?;
    let local_deletion_time = src.read_i32().await?;
    let marked_for_delete_at = src.read_i64().await?;
    let tombstone = DeletionTime {
        local_deletion_time,
        marked_for_delete_at,
    }
    .tombstone();
    Ok((key, tombstone))
}

pub async fn read_clustering_prefix(
    src: &mut BufferedSource,
    schema: &Schema,
) -> Result<(ClusteringPrefix, BoundKind)> {
    let kind = BoundKind::from_u8(src.read_u8().await?)?;
    let len = if kind == BoundKind::Clustering {
        schema.clustering.len()
    } else {
        src.read_u16().await? as usize
    };
    if len > schema.clustering.len() {
        return Err(Error::malformed(format!(
            "clustering prefix of {len} components, schema has {}",
            schema.clustering.len()
        )));
    }
    if len == 0 {
        return Ok((ClusteringPrefix::empty(), kind));
    }
    let null_mask = src.read_vint().await?;
    let mut values = SmallVec::with_capacity(len);
    for i in 0..len {
        if null_mask & (1 << i) != 0 {
            values.push(None);
            continue;
        }
        let value = match schema.clustering[i].ty.fixed_value_len() {
            Some(width) => src.read_bytes(width).await?,
            None => {
                let len = src.read_vint().await? as usize;
                src.read_bytes(len).await?
            }
        };
        values.push(Some(value));
    }
    Ok((ClusteringPrefix { values }, kind))
}

/// Decode the next unfiltered entry of a partition.
pub async fn read_atom(src: &mut BufferedSource, ctx: &ParseContext) -> Result<Atom> {
    let flags = src.read_u8().await?;
    if flags & row_flags::END_OF_PARTITION != 0 {
        return Ok(Atom::EndOfPartition);
    }

    if flags & row_flags::IS_MARKER != 0 {
        let (clustering, kind) = read_clustering_prefix(src, &ctx.schema).await?;
        let body_size = src.read_vint().await?;
        let prev_size = src.read_vint().await?;
        let body_len = (body_size as usize)
            .checked_sub(codec::vint_len(prev_size))
            .ok_or_else(|| Error::malformed("marker body size"))?;
        let body = src.read_bytes(body_len).await?;
        let mut buf = &body[..];
        let tombstone = get_tombstone(&mut buf, &ctx.stats)?;
        let boundary_tombstone = if kind.is_boundary() {
            Some(get_tombstone(&mut buf, &ctx.stats)?)
        } else {
            None
        };
        return Ok(Atom::Marker {
            clustering,
            kind,
            tombstone,
            boundary_tombstone,
        });
    }

    // A row. Extended flags first, then the clustering prefix for
    // non-static rows.
    let mut is_static = false;
    let mut has_shadowable = false;
    if flags & row_flags::EXTENSION_FLAG != 0 {
        let ext = src.read_u8().await?;
        row_extended_flags::validate(ext)?;
        is_static = ext & row_extended_flags::IS_STATIC != 0;
        has_shadowable = ext & row_extended_flags::HAS_SHADOWABLE_DELETION != 0;
    }
    let clustering = if is_static {
        None
    } else {
        let (clustering, kind) = read_clustering_prefix(src, &ctx.schema).await?;
        if kind != BoundKind::Clustering {
            return Err(Error::malformed("row with a bound clustering prefix"));
        }
        Some(clustering)
    };

    let body_size = src.read_vint().await?;
    let prev_size = src.read_vint().await?;
    let body_len = (body_size as usize)
        .checked_sub(codec::vint_len(prev_size))
        .ok_or_else(|| Error::malformed("row body size"))?;
    let body = src.read_bytes(body_len).await?;
    let mut buf = &body[..];

    let mut row = Row::new();
    let mut properties = RowTimeProperties::default();
    if flags & row_flags::HAS_TIMESTAMP != 0 {
        let timestamp = ctx.stats.get_delta_timestamp(&mut buf)?;
        properties.timestamp = Some(timestamp);
        let expiry = if flags & row_flags::HAS_TTL != 0 {
            let ttl = ctx.stats.get_delta_ttl(&mut buf)?;
            let ldt = ctx.stats.get_delta_local_deletion_time(&mut buf)?;
            properties.ttl = Some(ttl);
            properties.local_deletion_time = Some(ldt);
            Some((ttl, ldt))
        } else {
            None
        };
        row.liveness = Some(LivenessInfo { timestamp, expiry });
    }
    if flags & row_flags::HAS_DELETION != 0 {
        row.tombstone = Some(get_tombstone(&mut buf, &ctx.stats)?);
    }
    if has_shadowable {
        row.shadowable_tombstone = Some(get_tombstone(&mut buf, &ctx.stats)?);
    }

    let kind = if is_static {
        ColumnKind::Static
    } else {
        ColumnKind::Regular
    };
    row.cells = read_cells(
        &mut buf,
        ctx,
        kind,
        flags & row_flags::HAS_ALL_COLUMNS != 0,
        flags & row_flags::HAS_COMPLEX_DELETION != 0,
        &properties,
    )?;
    if !buf.is_empty() {
        return Err(Error::malformed("trailing bytes in row body"));
    }

    Ok(match clustering {
        None => Atom::Static(row),
        Some(clustering) => Atom::Row { clustering, row },
    })
}

#[derive(Clone, Copy, Default)]
struct RowTimeProperties {
    timestamp: Option<Timestamp>,
    ttl: Option<u32>,
    local_deletion_time: Option<i32>,
}

fn get_tombstone(buf: &mut &[u8], stats: &EncodingStats) -> Result<Tombstone> {
    stats
        .get_delta_deletion_time(buf)?
        .tombstone()
        .ok_or_else(|| Error::malformed("live sentinel where a tombstone is required"))
}

fn read_cells(
    buf: &mut &[u8],
    ctx: &ParseContext,
    kind: ColumnKind,
    has_all_columns: bool,
    has_complex_deletion: bool,
    properties: &RowTimeProperties,
) -> Result<BTreeMap<usize, Cell>> {
    let layout = ctx.schema.layout(kind);
    let present = if has_all_columns {
        vec![true; layout.len()]
    } else {
        read_missing_columns(buf, layout.len())?
    };

    let mut cells = BTreeMap::new();
    for (layout_index, schema_index) in layout.iter().copied().enumerate() {
        if !present[layout_index] {
            continue;
        }
        let column = ctx.schema.column(kind, schema_index);
        let cell = if column.ty.is_multi_cell() {
            let tombstone = if has_complex_deletion {
                ctx.stats.get_delta_deletion_time(buf)?.tombstone()
            } else {
                None
            };
            let count = codec::get_vint(buf)? as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let (path, cell) = read_cell_with_path(buf, ctx, &column.ty, properties)?;
                entries.push((path, cell));
            }
            if entries.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
                return Err(Error::malformed("collection cells out of path order"));
            }
            Cell::Collection {
                tombstone,
                cells: entries,
            }
        } else if column.ty.is_counter() {
            let (_, cell) = read_cell_inner(buf, ctx, &column.ty, properties, false)?;
            Cell::Counter {
                timestamp: cell.timestamp,
                shards: decode_counter_shards(&cell.value)?,
            }
        } else {
            let (_, cell) = read_cell_inner(buf, ctx, &column.ty, properties, false)?;
            Cell::Atomic(cell)
        };
        cells.insert(schema_index, cell);
    }
    Ok(cells)
}

fn read_cell_with_path(
    buf: &mut &[u8],
    ctx: &ParseContext,
    ty: &crate::value::ColumnType,
    properties: &RowTimeProperties,
) -> Result<(Bytes, AtomicCell)> {
    let (path, cell) = read_cell_inner(buf, ctx, ty, properties, true)?;
    Ok((path.expect("collection cells always carry a path"), cell))
}

/// A single cell: flags, timestamp and expiry deltas, the cell path when
/// the cell lives in a collection, then the value.
fn read_cell_inner(
    buf: &mut &[u8],
    ctx: &ParseContext,
    ty: &crate::value::ColumnType,
    properties: &RowTimeProperties,
    with_path: bool,
) -> Result<(Option<Bytes>, AtomicCell)> {
    let flags = codec::get_u8(buf)?;
    cell_flags::validate(flags)?;
    let is_deleted = flags & cell_flags::IS_DELETED != 0;
    let is_expiring = flags & cell_flags::IS_EXPIRING != 0;
    let has_value = flags & cell_flags::HAS_EMPTY_VALUE == 0;

    let timestamp = if flags & cell_flags::USE_ROW_TIMESTAMP != 0 {
        properties
            .timestamp
            .ok_or_else(|| Error::malformed("cell uses a row timestamp the row lacks"))?
    } else {
        ctx.stats.get_delta_timestamp(buf)?
    };

    let liveness = if flags & cell_flags::USE_ROW_TTL != 0 {
        match (properties.ttl, properties.local_deletion_time) {
            (Some(ttl), Some(expiry)) => CellLiveness::Expiring { ttl, expiry },
            _ => return Err(Error::malformed("cell uses a row TTL the row lacks")),
        }
    } else if is_deleted {
        CellLiveness::Deleted {
            local_deletion_time: ctx.stats.get_delta_local_deletion_time(buf)?,
        }
    } else if is_expiring {
        let expiry = ctx.stats.get_delta_local_deletion_time(buf)?;
        let ttl = ctx.stats.get_delta_ttl(buf)?;
        CellLiveness::Expiring { ttl, expiry }
    } else {
        CellLiveness::Live
    };

    let path = if with_path {
        Some(codec::get_bytes_vint(buf)?)
    } else {
        None
    };

    let value = if !has_value {
        Bytes::new()
    } else {
        match ty.fixed_value_len() {
            Some(width) if !ty.is_counter() => codec::get_bytes(buf, width)?,
            _ => codec::get_bytes_vint(buf)?,
        }
    };

    Ok((
        path,
        AtomicCell {
            timestamp,
            liveness,
            value,
        },
    ))
}

/// The inverse of the writer's missing-columns encoding. The branch for
/// N > 64 is re-derived from `(N, present count)`, so no tag is needed.
fn read_missing_columns(buf: &mut &[u8], n: usize) -> Result<Vec<bool>> {
    if n <= 64 {
        let absent_mask = codec::get_vint(buf)?;
        if n < 64 && absent_mask >> n != 0 {
            return Err(Error::malformed("missing-columns mask wider than layout"));
        }
        return Ok((0..n).map(|i| absent_mask & (1 << i) == 0).collect());
    }

    let k = codec::get_vint(buf)? as usize;
    if k > n {
        return Err(Error::malformed("more present columns than the layout has"));
    }
    let mut present = vec![false; n];
    if k <= n / 3 {
        for _ in 0..k {
            let index = codec::get_vint(buf)? as usize;
            *present
                .get_mut(index)
                .ok_or_else(|| Error::malformed("present column index out of range"))? = true;
        }
    } else if n - k <= n / 3 {
        present.fill(true);
        for _ in 0..n - k {
            let index = codec::get_vint(buf)? as usize;
            *present
                .get_mut(index)
                .ok_or_else(|| Error::malformed("missing column index out of range"))? = false;
        }
    } else {
        let bitmap = codec::get_bytes(buf, n.div_ceil(8))?;
        for (i, slot) in present.iter_mut().enumerate() {
            *slot = bitmap[i / 8] & (1 << (i % 8)) == 0;
        }
        if present.iter().filter(|p| **p).count() != k {
            return Err(Error::malformed("missing-columns bitmap disagrees with count"));
        }
    }
    Ok(present)
}

fn decode_counter_shards(raw: &[u8]) -> Result<Vec<CounterShard>> {
    let mut buf = raw;
    let count = codec::get_i16(&mut buf)?;
    if count < 0 {
        return Err(Error::malformed("negative counter shard count"));
    }
    let count = count as usize;
    // Skip the placeholder header slots.
    for _ in 0..count {
        codec::get_i16(&mut buf)?;
    }
    let mut shards = Vec::with_capacity(count);
    for _ in 0..count {
        let id = codec::get_bytes(&mut buf, 16)?;
        let id = Uuid::from_bytes(id[..].try_into().expect("sliced to 16 bytes"));
        let clock = codec::get_i64(&mut buf)?;
        let value = codec::get_i64(&mut buf)?;
        shards.push(CounterShard { id, clock, value });
    }
    if !buf.is_empty() {
        return Err(Error::malformed("trailing bytes in counter payload"));
    }
    if shards.windows(2).any(|pair| pair[0].id >= pair[1].id) {
        return Err(Error::malformed("counter shards out of id order"));
    }
    Ok(shards)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_columns_three_large_encodings() {
        // 100-column layout; exercise all three branches by present count.
        let n = 100;
        for k in [10usize, 90, 50] {
            let mut buf = Vec::new();
            codec::put_vint(&mut buf, k as u64);
            if k <= n / 3 {
                for i in 0..k {
                    codec::put_vint(&mut buf, i as u64);
                }
            } else if n - k <= n / 3 {
                for i in 0..n - k {
                    codec::put_vint(&mut buf, (n - 1 - i) as u64);
                }
            } else {
                let mut bitmap = vec![0u8; n.div_ceil(8)];
                for i in k..n {
                    bitmap[i / 8] |= 1 << (i % 8);
                }
                buf.extend_from_slice(&bitmap);
            }
            let present = read_missing_columns(&mut &buf[..], n).unwrap();
            assert_eq!(present.iter().filter(|p| **p).count(), k, "k={k}");
        }
    }

    #[test]
    fn small_mask_rejects_stray_bits() {
        let mut buf = Vec::new();
        codec::put_vint(&mut buf, 1 << 10);
        assert!(read_missing_columns(&mut &buf[..], 3).is_err());
    }

    #[test]
    fn counter_shards_roundtrip() {
        let shards = vec![
            CounterShard {
                id: Uuid::from_u128(1),
                clock: 3,
                value: -7,
            },
            CounterShard {
                id: Uuid::from_u128(2),
                clock: 1,
                value: 9,
            },
        ];
        let raw = crate::writer::encode_counter_shards(&shards).unwrap();
        assert_eq!(decode_counter_shards(&raw).unwrap(), shards);
    }
}
