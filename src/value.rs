// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! Schema-aware value codec: typed cell values and their total orders.

use std::cmp::Ordering;
use std::net::IpAddr;

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::codec;
use crate::error::{Error, Result};

const MARSHAL_PREFIX: &str = "org.apache.cassandra.db.marshal.";

/// The CQL type of a column, as far as the storage engine cares: enough to
/// know fixed widths, compare clustering components and name itself in the
/// serialization header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Timestamp,
    Uuid,
    TimeUuid,
    Inet,
    Ascii,
    Text,
    Blob,
    Decimal,
    Duration,
    Counter,
    List(Box<ColumnType>),
    Set(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
}

impl ColumnType {
    /// Width of the serialized value when the type is fixed-size. Clustering
    /// components and cell values of such types are written without a length
    /// prefix.
    pub fn fixed_value_len(&self) -> Option<usize> {
        match self {
            ColumnType::Boolean | ColumnType::TinyInt => Some(1),
            ColumnType::SmallInt => Some(2),
            ColumnType::Int | ColumnType::Float => Some(4),
            ColumnType::BigInt | ColumnType::Double | ColumnType::Timestamp => Some(8),
            ColumnType::Uuid | ColumnType::TimeUuid => Some(16),
            _ => None,
        }
    }

    /// Multi-cell types: one cell per element, addressed by a cell path.
    pub fn is_multi_cell(&self) -> bool {
        matches!(
            self,
            ColumnType::List(_) | ColumnType::Set(_) | ColumnType::Map(_, _)
        )
    }

    pub fn is_counter(&self) -> bool {
        matches!(self, ColumnType::Counter)
    }

    /// Fully qualified marshal class name, as recorded in the
    /// serialization header and validation metadata.
    pub fn marshal_name(&self) -> String {
        let simple = match self {
            ColumnType::Boolean => "BooleanType",
            ColumnType::TinyInt => "ByteType",
            ColumnType::SmallInt => "ShortType",
            ColumnType::Int => "Int32Type",
            ColumnType::BigInt => "LongType",
            ColumnType::Float => "FloatType",
            ColumnType::Double => "DoubleType",
            ColumnType::Timestamp => "TimestampType",
            ColumnType::Uuid => "UUIDType",
            ColumnType::TimeUuid => "TimeUUIDType",
            ColumnType::Inet => "InetAddressType",
            ColumnType::Ascii => "AsciiType",
            ColumnType::Text => "UTF8Type",
            ColumnType::Blob => "BytesType",
            ColumnType::Decimal => "DecimalType",
            ColumnType::Duration => "DurationType",
            ColumnType::Counter => "CounterColumnType",
            ColumnType::List(inner) => {
                return format!("{MARSHAL_PREFIX}ListType({})", inner.marshal_name());
            }
            ColumnType::Set(inner) => {
                return format!("{MARSHAL_PREFIX}SetType({})", inner.marshal_name());
            }
            ColumnType::Map(key, value) => {
                return format!(
                    "{MARSHAL_PREFIX}MapType({},{})",
                    key.marshal_name(),
                    value.marshal_name()
                );
            }
        };
        format!("{MARSHAL_PREFIX}{simple}")
    }

    /// Total order of serialized values of this type. Integer types compare
    /// numerically, strings and blobs bytewise, floats by total order.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            ColumnType::TinyInt => a.first().map(|v| *v as i8).cmp(&b.first().map(|v| *v as i8)),
            ColumnType::SmallInt => decode_be_i64(a, 2).cmp(&decode_be_i64(b, 2)),
            ColumnType::Int => decode_be_i64(a, 4).cmp(&decode_be_i64(b, 4)),
            ColumnType::BigInt | ColumnType::Timestamp => {
                decode_be_i64(a, 8).cmp(&decode_be_i64(b, 8))
            }
            ColumnType::Float => {
                let fa = a.try_into().map(f32::from_be_bytes);
                let fb = b.try_into().map(f32::from_be_bytes);
                match (fa, fb) {
                    (Ok(fa), Ok(fb)) => fa.total_cmp(&fb),
                    _ => a.cmp(b),
                }
            }
            ColumnType::Double => {
                let fa = a.try_into().map(f64::from_be_bytes);
                let fb = b.try_into().map(f64::from_be_bytes);
                match (fa, fb) {
                    (Ok(fa), Ok(fb)) => fa.total_cmp(&fb),
                    _ => a.cmp(b),
                }
            }
            _ => a.cmp(b),
        }
    }
}

fn decode_be_i64(raw: &[u8], width: usize) -> Option<i64> {
    if raw.len() != width {
        return None;
    }
    let mut value: i64 = if raw[0] & 0x80 != 0 { -1 } else { 0 };
    for byte in raw {
        value = (value << 8) | *byte as i64;
    }
    Some(value)
}

/// An owned typed value, used to build mutations and to interpret cell
/// payloads in tests and tooling. The engine itself moves raw bytes.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Timestamp(i64),
    Uuid(Uuid),
    Inet(IpAddr),
    Text(String),
    Blob(Bytes),
    Decimal { scale: i32, unscaled: Bytes },
    Duration { months: i32, days: i32, nanos: i64 },
}

impl Value {
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Value::Boolean(v) => buf.put_u8(*v as u8),
            Value::TinyInt(v) => buf.put_i8(*v),
            Value::SmallInt(v) => buf.put_i16(*v),
            Value::Int(v) => buf.put_i32(*v),
            Value::BigInt(v) | Value::Timestamp(v) => buf.put_i64(*v),
            Value::Float(v) => buf.put_f32(*v),
            Value::Double(v) => buf.put_f64(*v),
            Value::Uuid(v) => buf.put_slice(v.as_bytes()),
            Value::Inet(IpAddr::V4(v)) => buf.put_slice(&v.octets()),
            Value::Inet(IpAddr::V6(v)) => buf.put_slice(&v.octets()),
            Value::Text(v) => buf.put_slice(v.as_bytes()),
            Value::Blob(v) => buf.put_slice(v),
            Value::Decimal { scale, unscaled } => {
                buf.put_i32(*scale);
                buf.put_slice(unscaled);
            }
            Value::Duration {
                months,
                days,
                nanos,
            } => {
                codec::put_signed_vint(&mut buf, *months as i64);
                codec::put_signed_vint(&mut buf, *days as i64);
                codec::put_signed_vint(&mut buf, *nanos);
            }
        }
        buf.freeze()
    }

    /// Interpret `raw` as a value of `ty`. Collections and counters are not
    /// values; their payloads live in cell paths and shards.
    pub fn deserialize(ty: &ColumnType, raw: &[u8]) -> Result<Value> {
        let mut buf = raw;
        let value = match ty {
            ColumnType::Boolean => Value::Boolean(codec::get_u8(&mut buf)? != 0),
            ColumnType::TinyInt => Value::TinyInt(codec::get_i8(&mut buf)?),
            ColumnType::SmallInt => Value::SmallInt(codec::get_i16(&mut buf)?),
            ColumnType::Int => Value::Int(codec::get_i32(&mut buf)?),
            ColumnType::BigInt => Value::BigInt(codec::get_i64(&mut buf)?),
            ColumnType::Float => Value::Float(codec::get_f32(&mut buf)?),
            ColumnType::Double => Value::Double(codec::get_f64(&mut buf)?),
            ColumnType::Timestamp => Value::Timestamp(codec::get_i64(&mut buf)?),
            ColumnType::Uuid | ColumnType::TimeUuid => {
                let raw: [u8; 16] = buf
                    .try_into()
                    .map_err(|_| Error::malformed("uuid value must be 16 bytes"))?;
                buf = &[];
                Value::Uuid(Uuid::from_bytes(raw))
            }
            ColumnType::Inet => match buf.len() {
                4 => {
                    let octets: [u8; 4] = buf.try_into().unwrap();
                    buf = &[];
                    Value::Inet(IpAddr::from(octets))
                }
                16 => {
                    let octets: [u8; 16] = buf.try_into().unwrap();
                    buf = &[];
                    Value::Inet(IpAddr::from(octets))
                }
                n => return Err(Error::malformed(format!("inet value of {n} bytes"))),
            },
            ColumnType::Ascii | ColumnType::Text => {
                let text = std::str::from_utf8(buf)
                    .map_err(|_| Error::malformed("invalid utf-8 in text value"))?;
                buf = &[];
                Value::Text(text.to_owned())
            }
            ColumnType::Blob => {
                let blob = Bytes::copy_from_slice(buf);
                buf = &[];
                Value::Blob(blob)
            }
            ColumnType::Decimal => {
                let scale = codec::get_i32(&mut buf)?;
                let unscaled = Bytes::copy_from_slice(buf);
                buf = &[];
                Value::Decimal { scale, unscaled }
            }
            ColumnType::Duration => {
                let months = codec::get_signed_vint(&mut buf)? as i32;
                let days = codec::get_signed_vint(&mut buf)? as i32;
                let nanos = codec::get_signed_vint(&mut buf)?;
                Value::Duration {
                    months,
                    days,
                    nanos,
                }
            }
            other => {
                return Err(Error::unsupported(
                    "value type",
                    format!("{other:?} is not a single-cell value type"),
                ));
            }
        };
        if !buf.is_empty() {
            return Err(Error::malformed("trailing bytes after typed value"));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_compare_is_signed() {
        let ty = ColumnType::Int;
        let neg = Value::Int(-1).serialize();
        let pos = Value::Int(1).serialize();
        assert_eq!(ty.compare(&neg, &pos), Ordering::Less);
        assert_eq!(ty.compare(&pos, &neg), Ordering::Greater);
        assert_eq!(ty.compare(&pos, &pos), Ordering::Equal);
    }

    #[test]
    fn value_roundtrip() {
        let cases = [
            (ColumnType::Int, Value::Int(-42)),
            (ColumnType::BigInt, Value::BigInt(1 << 40)),
            (ColumnType::Text, Value::Text("héllo".into())),
            (ColumnType::Boolean, Value::Boolean(true)),
            (ColumnType::Inet, Value::Inet("127.0.0.1".parse().unwrap())),
            (
                ColumnType::Duration,
                Value::Duration {
                    months: 1,
                    days: -2,
                    nanos: 3_000,
                },
            ),
        ];
        for (ty, value) in cases {
            let raw = value.serialize();
            assert_eq!(Value::deserialize(&ty, &raw).unwrap(), value);
        }
    }

    #[test]
    fn marshal_names() {
        assert_eq!(
            ColumnType::Int.marshal_name(),
            "org.apache.cassandra.db.marshal.Int32Type"
        );
        assert_eq!(
            ColumnType::Map(Box::new(ColumnType::Int), Box::new(ColumnType::Text)).marshal_name(),
            "org.apache.cassandra.db.marshal.MapType(\
             org.apache.cassandra.db.marshal.Int32Type,\
             org.apache.cassandra.db.marshal.UTF8Type)"
        );
    }
}
