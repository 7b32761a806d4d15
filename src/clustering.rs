// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! Clustering prefixes, bound kinds and the total order of positions
//! within a partition.

use std::cmp::Ordering;

use bytes::{Buf, BufMut, Bytes};
use smallvec::SmallVec;

use crate::codec;
use crate::error::{Error, Result};
use crate::schema::Schema;

/// An ordered tuple of serialized clustering components. Full when every
/// clustering column is present, otherwise a prefix bounding a range.
/// A `None` component is a null.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusteringPrefix {
    pub values: SmallVec<[Option<Bytes>; 4]>,
}

impl ClusteringPrefix {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_values(values: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            values: values.into_iter().map(Some).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self, schema: &Schema) -> bool {
        self.values.len() == schema.clustering.len()
    }
}

/// Bound kinds of the "mc" format, with their on-disk ordinals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BoundKind {
    ExclEnd = 0,
    InclStart = 1,
    ExclEndInclStart = 2,
    StaticClustering = 3,
    Clustering = 4,
    InclEndExclStart = 5,
    InclEnd = 6,
    ExclStart = 7,
}

impl BoundKind {
    pub fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            0 => BoundKind::ExclEnd,
            1 => BoundKind::InclStart,
            2 => BoundKind::ExclEndInclStart,
            3 => BoundKind::StaticClustering,
            4 => BoundKind::Clustering,
            5 => BoundKind::InclEndExclStart,
            6 => BoundKind::InclEnd,
            7 => BoundKind::ExclStart,
            other => return Err(Error::malformed(format!("bound kind {other}"))),
        })
    }

    /// A boundary closes one range tombstone and opens another.
    pub fn is_boundary(self) -> bool {
        matches!(self, BoundKind::ExclEndInclStart | BoundKind::InclEndExclStart)
    }

    pub fn is_start(self) -> bool {
        matches!(
            self,
            BoundKind::InclStart
                | BoundKind::ExclStart
                | BoundKind::ExclEndInclStart
                | BoundKind::InclEndExclStart
        )
    }

    pub fn is_end(self) -> bool {
        matches!(
            self,
            BoundKind::InclEnd
                | BoundKind::ExclEnd
                | BoundKind::ExclEndInclStart
                | BoundKind::InclEndExclStart
        )
    }

    /// Position of the bound relative to rows sharing its prefix: before
    /// them, at one of them, or after them.
    pub fn weight(self) -> i8 {
        match self {
            BoundKind::StaticClustering => -2,
            BoundKind::ExclEnd | BoundKind::InclStart | BoundKind::ExclEndInclStart => -1,
            BoundKind::Clustering => 0,
            BoundKind::InclEndExclStart | BoundKind::InclEnd | BoundKind::ExclStart => 1,
        }
    }
}

/// A point in the clustering order of a partition: a prefix plus the side
/// of it the position falls on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Position {
    pub prefix: ClusteringPrefix,
    pub weight: i8,
}

impl Position {
    pub fn row(prefix: ClusteringPrefix) -> Self {
        Self { prefix, weight: 0 }
    }

    pub fn before(prefix: ClusteringPrefix) -> Self {
        Self { prefix, weight: -1 }
    }

    pub fn after(prefix: ClusteringPrefix) -> Self {
        Self { prefix, weight: 1 }
    }

    pub fn of_bound(prefix: ClusteringPrefix, kind: BoundKind) -> Self {
        Self {
            prefix,
            weight: kind.weight(),
        }
    }
}

/// Compare two positions under the clustering column types of `schema`.
///
/// Components are compared typewise left to right; when one position's
/// prefix exhausts first, its weight decides the side. A null component
/// sorts before any value.
pub fn position_cmp(schema: &Schema, a: &Position, b: &Position) -> Ordering {
    let common = a.prefix.len().min(b.prefix.len());
    for i in 0..common {
        let ty = &schema.clustering[i].ty;
        let ord = match (&a.prefix.values[i], &b.prefix.values[i]) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => ty.compare(x, y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    match a.prefix.len().cmp(&b.prefix.len()) {
        Ordering::Equal => a.weight.cmp(&b.weight),
        Ordering::Less => {
            // `a` is a strict prefix of `b`: its weight says which side of
            // the whole subtree it sits on.
            if a.weight <= 0 {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        Ordering::Greater => {
            if b.weight <= 0 {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
    }
}

/// Serialize a clustering prefix with its bound kind. Full row prefixes
/// omit the component count; everything else records a `u16` count. A
/// vint null mask precedes the component bytes, and components of types
/// with a declared fixed width are written raw.
pub fn put_clustering_prefix(
    buf: &mut impl BufMut,
    schema: &Schema,
    prefix: &ClusteringPrefix,
    kind: BoundKind,
) {
    buf.put_u8(kind as u8);
    if kind != BoundKind::Clustering {
        buf.put_u16(prefix.len() as u16);
    }
    put_clustering_components(buf, schema, prefix);
}

fn put_clustering_components(buf: &mut impl BufMut, schema: &Schema, prefix: &ClusteringPrefix) {
    if prefix.is_empty() {
        return;
    }
    let mut null_mask = 0u64;
    for (i, value) in prefix.values.iter().enumerate() {
        if value.is_none() {
            null_mask |= 1 << i;
        }
    }
    codec::put_vint(buf, null_mask);
    for (i, value) in prefix.values.iter().enumerate() {
        let Some(value) = value else { continue };
        match schema.clustering[i].ty.fixed_value_len() {
            Some(width) => {
                debug_assert_eq!(value.len(), width);
                buf.put_slice(value);
            }
            None => codec::put_bytes_vint(buf, value),
        }
    }
}

pub fn get_clustering_prefix(
    buf: &mut impl Buf,
    schema: &Schema,
) -> Result<(ClusteringPrefix, BoundKind)> {
    let kind = BoundKind::from_u8(codec::get_u8(buf)?)?;
    let len = if kind == BoundKind::Clustering {
        schema.clustering.len()
    } else {
        codec::get_u16(buf)? as usize
    };
    if len > schema.clustering.len() {
        return Err(Error::malformed(format!(
            "clustering prefix of {len} components, schema has {}",
            schema.clustering.len()
        )));
    }
    let prefix = get_clustering_components(buf, schema, len)?;
    Ok((prefix, kind))
}

fn get_clustering_components(
    buf: &mut impl Buf,
    schema: &Schema,
    len: usize,
) -> Result<ClusteringPrefix> {
    if len == 0 {
        return Ok(ClusteringPrefix::empty());
    }
    let null_mask = codec::get_vint(buf)?;
    let mut values = SmallVec::with_capacity(len);
    for i in 0..len {
        if null_mask & (1 << i) != 0 {
            values.push(None);
            continue;
        }
        let value = match schema.clustering[i].ty.fixed_value_len() {
            Some(width) => codec::get_bytes(buf, width)?,
            None => codec::get_bytes_vint(buf)?,
        };
        values.push(Some(value));
    }
    Ok(ClusteringPrefix { values })
}

/// Serialized size of a prefix with its kind byte, used by writers that
/// need sizes before writing.
pub fn clustering_prefix_len(schema: &Schema, prefix: &ClusteringPrefix, kind: BoundKind) -> usize {
    let mut size = 1;
    if kind != BoundKind::Clustering {
        size += 2;
    }
    if prefix.is_empty() {
        return size;
    }
    let mut null_mask = 0u64;
    for (i, value) in prefix.values.iter().enumerate() {
        if value.is_none() {
            null_mask |= 1 << i;
            continue;
        }
        let value = value.as_ref().unwrap();
        size += match schema.clustering[i].ty.fixed_value_len() {
            Some(width) => width,
            None => codec::bytes_vint_len(value),
        };
    }
    size + codec::vint_len(null_mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ColumnType, Value};

    fn test_schema() -> std::sync::Arc<Schema> {
        Schema::builder("ks", "cf")
            .partition_key("pk", ColumnType::Int)
            .clustering("ck1", ColumnType::Int)
            .clustering("ck2", ColumnType::Text)
            .regular("v", ColumnType::Int)
            .build()
    }

    fn ck(v: i32) -> ClusteringPrefix {
        ClusteringPrefix::from_values([Value::Int(v).serialize()])
    }

    fn ck2(v: i32, s: &str) -> ClusteringPrefix {
        ClusteringPrefix::from_values([
            Value::Int(v).serialize(),
            Value::Text(s.into()).serialize(),
        ])
    }

    #[test]
    fn prefix_roundtrip_all_kinds() {
        let schema = test_schema();
        for kind in [
            BoundKind::Clustering,
            BoundKind::InclStart,
            BoundKind::ExclEnd,
            BoundKind::InclEndExclStart,
        ] {
            let prefix = if kind == BoundKind::Clustering {
                ck2(5, "abc")
            } else {
                ck(5)
            };
            let mut buf = vec![];
            put_clustering_prefix(&mut buf, &schema, &prefix, kind);
            assert_eq!(buf.len(), clustering_prefix_len(&schema, &prefix, kind));
            let (decoded, decoded_kind) = get_clustering_prefix(&mut &buf[..], &schema).unwrap();
            assert_eq!(decoded, prefix);
            assert_eq!(decoded_kind, kind);
        }
    }

    #[test]
    fn null_components_roundtrip() {
        let schema = test_schema();
        let prefix = ClusteringPrefix {
            values: smallvec::smallvec![Some(Value::Int(1).serialize()), None],
        };
        let mut buf = vec![];
        put_clustering_prefix(&mut buf, &schema, &prefix, BoundKind::Clustering);
        let (decoded, _) = get_clustering_prefix(&mut &buf[..], &schema).unwrap();
        assert_eq!(decoded, prefix);
    }

    #[test]
    fn position_order() {
        let schema = test_schema();
        let before = Position::of_bound(ck(5), BoundKind::InclStart);
        let row = Position::row(ck2(5, "a"));
        let after = Position::of_bound(ck(5), BoundKind::InclEnd);
        let next = Position::row(ck2(6, "a"));
        assert_eq!(position_cmp(&schema, &before, &row), Ordering::Less);
        assert_eq!(position_cmp(&schema, &row, &after), Ordering::Less);
        assert_eq!(position_cmp(&schema, &after, &next), Ordering::Less);
        assert_eq!(
            position_cmp(&schema, &before, &Position::of_bound(ck(5), BoundKind::ExclEnd)),
            Ordering::Equal
        );
    }

    #[test]
    fn unknown_bound_kind_is_malformed() {
        let schema = test_schema();
        let buf = [9u8, 0, 0];
        assert!(get_clustering_prefix(&mut &buf[..], &schema).is_err());
    }
}
