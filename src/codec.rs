// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! Primitive wire codec of the "mc" format.
//!
//! Fixed-width integers are big-endian. Variable-length integers encode
//! their length as the number of leading one bits of the first byte
//! (0 through 8), with the remaining value bits following big-endian, so
//! values 0..=127 fit in a single byte and nothing exceeds nine bytes.
//! Signed vints go through the zig-zag mapping first.

use bytes::{Buf, BufMut, Bytes};

use crate::error::{Error, Result};

/// Longest possible vint: a `0xff` prefix byte plus eight value bytes.
pub const MAX_VINT_LEN: usize = 9;

/// Number of bytes [`put_vint`] emits for `value`.
pub fn vint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    if bits <= 7 {
        1
    } else {
        1 + usize::min(8, (bits - 8) / 7 + 1)
    }
}

pub fn signed_vint_len(value: i64) -> usize {
    vint_len(zigzag(value))
}

pub fn put_vint(buf: &mut impl BufMut, value: u64) {
    let extra = vint_len(value) - 1;
    if extra == 8 {
        buf.put_u8(0xff);
        buf.put_u64(value);
        return;
    }
    let lead = if extra == 0 {
        0u8
    } else {
        // `extra` leading ones followed by a zero terminator.
        !(0xffu8 >> extra)
    };
    buf.put_u8(lead | (value >> (8 * extra)) as u8);
    for i in (0..extra).rev() {
        buf.put_u8((value >> (8 * i)) as u8);
    }
}

pub fn put_signed_vint(buf: &mut impl BufMut, value: i64) {
    put_vint(buf, zigzag(value));
}

pub fn get_vint(buf: &mut impl Buf) -> Result<u64> {
    let first = get_u8(buf)?;
    let extra = first.leading_ones() as usize;
    if extra == 8 {
        return get_u64(buf);
    }
    let mut value = (first & (0xff >> extra)) as u64;
    for _ in 0..extra {
        value = (value << 8) | get_u8(buf)? as u64;
    }
    Ok(value)
}

pub fn get_signed_vint(buf: &mut impl Buf) -> Result<i64> {
    Ok(unzigzag(get_vint(buf)?))
}

pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

fn ensure(buf: &impl Buf, wanted: usize) -> Result<()> {
    if buf.remaining() < wanted {
        return Err(Error::truncated(0, wanted - buf.remaining()));
    }
    Ok(())
}

macro_rules! checked_get {
    ($name:ident, $ty:ty, $get:ident, $width:expr) => {
        pub fn $name(buf: &mut impl Buf) -> Result<$ty> {
            ensure(buf, $width)?;
            Ok(buf.$get())
        }
    };
}

checked_get!(get_u8, u8, get_u8, 1);
checked_get!(get_u16, u16, get_u16, 2);
checked_get!(get_u32, u32, get_u32, 4);
checked_get!(get_u64, u64, get_u64, 8);
checked_get!(get_i8, i8, get_i8, 1);
checked_get!(get_i16, i16, get_i16, 2);
checked_get!(get_i32, i32, get_i32, 4);
checked_get!(get_i64, i64, get_i64, 8);
checked_get!(get_f32, f32, get_f32, 4);
checked_get!(get_f64, f64, get_f64, 8);

pub fn get_bytes(buf: &mut impl Buf, len: usize) -> Result<Bytes> {
    ensure(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

/// `disk_string<u16>`: 16-bit big-endian length followed by the bytes.
pub fn put_string16(buf: &mut impl BufMut, value: &[u8]) {
    debug_assert!(value.len() <= u16::MAX as usize);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

pub fn get_string16(buf: &mut impl Buf) -> Result<Bytes> {
    let len = get_u16(buf)? as usize;
    get_bytes(buf, len)
}

/// `disk_string<u32>` is used by the summary's first/last key fields.
pub fn put_string32(buf: &mut impl BufMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

pub fn get_string32(buf: &mut impl Buf) -> Result<Bytes> {
    let len = get_u32(buf)? as usize;
    get_bytes(buf, len)
}

/// Vint-length-prefixed byte string, the "mc" default for values.
pub fn put_bytes_vint(buf: &mut impl BufMut, value: &[u8]) {
    put_vint(buf, value.len() as u64);
    buf.put_slice(value);
}

pub fn get_bytes_vint(buf: &mut impl Buf) -> Result<Bytes> {
    let len = get_vint(buf)?;
    let len = usize::try_from(len).map_err(|_| Error::malformed("byte string length"))?;
    get_bytes(buf, len)
}

pub fn bytes_vint_len(value: &[u8]) -> usize {
    vint_len(value.len() as u64) + value.len()
}
