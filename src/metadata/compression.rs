// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec;
use crate::error::{Error, Result};
use crate::schema::CompressionParams;

/// The CompressionInfo component: codec identity plus the compressed
/// offset of every fixed-size uncompressed chunk of the data file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressionInfo {
    pub params: CompressionParams,
    /// Total uncompressed length of the data file.
    pub data_length: u64,
    /// On-disk offset of each compressed chunk.
    pub chunk_offsets: Vec<u64>,
}

impl CompressionInfo {
    pub fn chunk_length(&self) -> u64 {
        self.params.chunk_length as u64
    }

    /// Index of the chunk holding uncompressed offset `logical`.
    pub fn chunk_of(&self, logical: u64) -> usize {
        (logical / self.chunk_length()) as usize
    }

    /// `(on-disk offset, compressed length)` of chunk `index`; the 4-byte
    /// trailing CRC is not included in the length. `file_length` bounds the
    /// final chunk.
    pub fn chunk_extent(&self, index: usize, file_length: u64) -> Result<(u64, usize)> {
        let start = *self
            .chunk_offsets
            .get(index)
            .ok_or_else(|| Error::malformed("chunk index out of range"))?;
        let end = self
            .chunk_offsets
            .get(index + 1)
            .copied()
            .unwrap_or(file_length);
        let len = end
            .checked_sub(start)
            .and_then(|l| l.checked_sub(4))
            .ok_or_else(|| Error::malformed("compressed chunk extent"))?;
        Ok((start, len as usize))
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        codec::put_string16(&mut buf, self.params.name.as_bytes());
        buf.put_u32(self.params.options.len() as u32);
        for (key, value) in &self.params.options {
            codec::put_string16(&mut buf, key.as_bytes());
            codec::put_string16(&mut buf, value.as_bytes());
        }
        buf.put_u32(self.params.chunk_length);
        buf.put_u64(self.data_length);
        buf.put_u32(self.chunk_offsets.len() as u32);
        for offset in &self.chunk_offsets {
            buf.put_u64(*offset);
        }
        buf.freeze()
    }

    pub fn deserialize(mut raw: &[u8]) -> Result<Self> {
        let buf = &mut raw;
        let name = string16(buf)?;
        let option_count = codec::get_u32(buf)? as usize;
        let mut options = Vec::with_capacity(option_count);
        for _ in 0..option_count {
            options.push((string16(buf)?, string16(buf)?));
        }
        let chunk_length = codec::get_u32(buf)?;
        if chunk_length == 0 || !chunk_length.is_power_of_two() {
            return Err(Error::malformed(format!("chunk length {chunk_length}")));
        }
        let data_length = codec::get_u64(buf)?;
        let count = codec::get_u32(buf)? as usize;
        let mut chunk_offsets = Vec::with_capacity(count);
        for _ in 0..count {
            chunk_offsets.push(codec::get_u64(buf)?);
        }
        if chunk_offsets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::malformed("chunk offsets are not increasing"));
        }
        Ok(Self {
            params: CompressionParams {
                name,
                chunk_length,
                options,
            },
            data_length,
            chunk_offsets,
        })
    }
}

fn string16(buf: &mut &[u8]) -> Result<String> {
    let raw = codec::get_string16(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::malformed("non-utf8 compression string"))
}

/// An opaque block codec resolved by name from the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compressor {
    Lz4,
    Snappy,
}

impl Compressor {
    /// Registry lookup. Unknown codecs are refused, not guessed at.
    pub fn by_name(name: &str) -> Result<Self> {
        // Both the short and the fully qualified spellings occur in the wild.
        match name.rsplit('.').next().unwrap_or(name) {
            "LZ4Compressor" => Ok(Compressor::Lz4),
            "SnappyCompressor" => Ok(Compressor::Snappy),
            _ => Err(Error::unsupported("compressor", name)),
        }
    }

    pub fn compress(&self, chunk: &[u8]) -> Vec<u8> {
        match self {
            Compressor::Lz4 => lz4_flex::compress(chunk),
            Compressor::Snappy => snap::raw::Encoder::new()
                .compress_vec(chunk)
                .expect("snappy compression of an in-memory chunk"),
        }
    }

    pub fn decompress(&self, chunk: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
        let out = match self {
            Compressor::Lz4 => lz4_flex::decompress(chunk, uncompressed_len)
                .map_err(|e| Error::malformed(format!("lz4: {e}")))?,
            Compressor::Snappy => snap::raw::Decoder::new()
                .decompress_vec(chunk)
                .map_err(|e| Error::malformed(format!("snappy: {e}")))?,
        };
        if out.len() > uncompressed_len {
            return Err(Error::malformed("chunk decompressed past its bound"));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_roundtrip() {
        let info = CompressionInfo {
            params: CompressionParams {
                name: "LZ4Compressor".into(),
                chunk_length: 4096,
                options: vec![("level".into(), "3".into())],
            },
            data_length: 123456,
            chunk_offsets: vec![0, 1000, 2100],
        };
        let parsed = CompressionInfo::deserialize(&info.serialize()).unwrap();
        assert_eq!(parsed, info);
        assert_eq!(parsed.chunk_of(4095), 0);
        assert_eq!(parsed.chunk_of(4096), 1);
        assert_eq!(parsed.chunk_extent(1, 5000).unwrap(), (1000, 1096));
        assert_eq!(parsed.chunk_extent(2, 5000).unwrap(), (2100, 2896));
    }

    #[test]
    fn unknown_compressor_is_unsupported() {
        assert!(Compressor::by_name("LZ4Compressor").is_ok());
        assert!(
            Compressor::by_name("org.apache.cassandra.io.compress.SnappyCompressor").is_ok()
        );
        assert!(Compressor::by_name("DeflateCompressor").is_err());
    }

    #[test]
    fn codecs_roundtrip() {
        let data: Vec<u8> = (0..10_000u32).flat_map(|i| (i % 251).to_be_bytes()).collect();
        for codec in [Compressor::Lz4, Compressor::Snappy] {
            let compressed = codec.compress(&data);
            let restored = codec.decompress(&compressed, data.len()).unwrap();
            assert_eq!(restored, data);
        }
    }

    #[test]
    fn non_power_of_two_chunk_length_is_malformed() {
        let info = CompressionInfo {
            params: CompressionParams {
                name: "LZ4Compressor".into(),
                chunk_length: 4095,
                options: vec![],
            },
            data_length: 0,
            chunk_offsets: vec![],
        };
        assert!(CompressionInfo::deserialize(&info.serialize()).is_err());
    }
}
