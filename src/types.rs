// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! Core value objects of the partition/row data model.

use bytes::{Buf, BufMut, Bytes};

use crate::codec;
use crate::error::{Error, ErrorKind, Result};

/// Timestamps are microseconds since the epoch, totally ordered.
pub type Timestamp = i64;

/// Local deletion times and expiry points are seconds since the epoch.
pub type LocalDeletionTime = i32;

/// A partitioner token. Tokens order partitions within an SSTable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub i64);

/// A partition key decorated with its token; the pair is the total order
/// of partitions in the data file.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DecoratedKey {
    pub token: Token,
    pub key: Bytes,
}

impl DecoratedKey {
    pub fn new(token: Token, key: impl Into<Bytes>) -> Self {
        Self {
            token,
            key: key.into(),
        }
    }
}

impl PartialOrd for DecoratedKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DecoratedKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.token
            .cmp(&other.token)
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// A tombstone: everything written before `timestamp` and observed at
/// `local_deletion_time` is shadowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tombstone {
    pub timestamp: Timestamp,
    pub local_deletion_time: LocalDeletionTime,
}

/// On-disk `deletion_time` pair. The live sentinel is
/// `(i32::MAX, i64::MIN)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeletionTime {
    pub local_deletion_time: i32,
    pub marked_for_delete_at: i64,
}

pub const LIVE_DELETION_TIME: DeletionTime = DeletionTime {
    local_deletion_time: i32::MAX,
    marked_for_delete_at: i64::MIN,
};

impl DeletionTime {
    pub fn of(tombstone: Option<Tombstone>) -> Self {
        match tombstone {
            Some(t) => Self {
                local_deletion_time: t.local_deletion_time,
                marked_for_delete_at: t.timestamp,
            },
            None => LIVE_DELETION_TIME,
        }
    }

    pub fn tombstone(self) -> Option<Tombstone> {
        if self == LIVE_DELETION_TIME {
            None
        } else {
            Some(Tombstone {
                timestamp: self.marked_for_delete_at,
                local_deletion_time: self.local_deletion_time,
            })
        }
    }

    pub fn put(self, buf: &mut impl BufMut) {
        buf.put_i32(self.local_deletion_time);
        buf.put_i64(self.marked_for_delete_at);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self {
            local_deletion_time: codec::get_i32(buf)?,
            marked_for_delete_at: codec::get_i64(buf)?,
        })
    }
}

/// Row-level liveness: the row marker's timestamp plus optional expiry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LivenessInfo {
    pub timestamp: Timestamp,
    /// `(ttl, expiry point)`, present for expiring rows.
    pub expiry: Option<(u32, LocalDeletionTime)>,
}

impl LivenessInfo {
    pub fn live(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            expiry: None,
        }
    }

    pub fn expiring(timestamp: Timestamp, ttl: u32, expiry: LocalDeletionTime) -> Self {
        Self {
            timestamp,
            expiry: Some((ttl, expiry)),
        }
    }
}

/// Minima used as delta bases by the data-file codec. Cell-level encoded
/// values are non-negative deltas from these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodingStats {
    pub min_timestamp: Timestamp,
    pub min_local_deletion_time: LocalDeletionTime,
    pub min_ttl: u32,
}

/// Epochs chosen by the format so that fresh writes produce small deltas.
pub const TIMESTAMP_EPOCH: i64 = 1_442_880_000_000_000;
pub const DELETION_TIME_EPOCH: i32 = 1_442_880_000;
pub const TTL_EPOCH: u32 = 0;

impl Default for EncodingStats {
    fn default() -> Self {
        Self {
            min_timestamp: TIMESTAMP_EPOCH,
            min_local_deletion_time: DELETION_TIME_EPOCH,
            min_ttl: TTL_EPOCH,
        }
    }
}

impl EncodingStats {
    pub fn put_delta_timestamp(&self, buf: &mut impl BufMut, timestamp: Timestamp) {
        codec::put_vint(buf, (timestamp as u64).wrapping_sub(self.min_timestamp as u64));
    }

    pub fn get_delta_timestamp(&self, buf: &mut impl Buf) -> Result<Timestamp> {
        let delta = codec::get_vint(buf)?;
        Ok((self.min_timestamp as u64).wrapping_add(delta) as i64)
    }

    pub fn put_delta_local_deletion_time(&self, buf: &mut impl BufMut, ldt: LocalDeletionTime) {
        codec::put_vint(
            buf,
            (ldt as i64).wrapping_sub(self.min_local_deletion_time as i64) as u64,
        );
    }

    pub fn get_delta_local_deletion_time(&self, buf: &mut impl Buf) -> Result<LocalDeletionTime> {
        let delta = codec::get_vint(buf)?;
        let wide = (self.min_local_deletion_time as i64) + delta as i64;
        i32::try_from(wide).map_err(|_| Error::from(ErrorKind::Overflow("local deletion time")))
    }

    pub fn put_delta_ttl(&self, buf: &mut impl BufMut, ttl: u32) {
        codec::put_vint(buf, (ttl as u64).wrapping_sub(self.min_ttl as u64));
    }

    pub fn get_delta_ttl(&self, buf: &mut impl Buf) -> Result<u32> {
        let delta = codec::get_vint(buf)?;
        let wide = self.min_ttl as u64 + delta;
        u32::try_from(wide).map_err(|_| Error::from(ErrorKind::Overflow("ttl")))
    }

    pub fn put_delta_deletion_time(&self, buf: &mut impl BufMut, dt: DeletionTime) {
        self.put_delta_timestamp(buf, dt.marked_for_delete_at);
        self.put_delta_local_deletion_time(buf, dt.local_deletion_time);
    }

    pub fn get_delta_deletion_time(&self, buf: &mut impl Buf) -> Result<DeletionTime> {
        let marked_for_delete_at = self.get_delta_timestamp(buf)?;
        let local_deletion_time = self.get_delta_local_deletion_time(buf)?;
        Ok(DeletionTime {
            local_deletion_time,
            marked_for_delete_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_time_sentinel() {
        assert_eq!(DeletionTime::of(None), LIVE_DELETION_TIME);
        assert_eq!(LIVE_DELETION_TIME.tombstone(), None);
        let t = Tombstone {
            timestamp: 7,
            local_deletion_time: 3,
        };
        assert_eq!(DeletionTime::of(Some(t)).tombstone(), Some(t));
    }

    #[test]
    fn delta_roundtrip_with_negative_base() {
        let stats = EncodingStats {
            min_timestamp: -100,
            min_local_deletion_time: -5,
            min_ttl: 2,
        };
        let mut buf = vec![];
        stats.put_delta_timestamp(&mut buf, 1_000_000);
        stats.put_delta_local_deletion_time(&mut buf, 40);
        stats.put_delta_ttl(&mut buf, 9);
        let mut slice = &buf[..];
        assert_eq!(stats.get_delta_timestamp(&mut slice).unwrap(), 1_000_000);
        assert_eq!(stats.get_delta_local_deletion_time(&mut slice).unwrap(), 40);
        assert_eq!(stats.get_delta_ttl(&mut slice).unwrap(), 9);
    }

    #[test]
    fn decorated_key_orders_by_token_first() {
        let a = DecoratedKey::new(Token(1), Bytes::from_static(b"zzz"));
        let b = DecoratedKey::new(Token(2), Bytes::from_static(b"aaa"));
        assert!(a < b);
    }
}
