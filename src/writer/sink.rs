// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! Output sinks of the writer: a plain buffered file sink, and the data
//! sink that checksums or compresses on the way down.

use std::path::Path;

use bytes::BufMut;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::checksum::{crc32, FullChecksum};
use crate::error::Result;
use crate::metadata::{CompressionInfo, Compressor};
use crate::options::SsTableOptions;
use crate::schema::{CompressionParams, Schema};

/// Buffered, offset-tracking file sink opened create-exclusive.
pub struct FileSink {
    writer: BufWriter<tokio::fs::File>,
    offset: u64,
}

impl FileSink {
    pub async fn create(path: &Path, buffer_size: usize) -> Result<FileSink> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        Ok(FileSink {
            writer: BufWriter::with_capacity(buffer_size.max(1), file),
            offset: 0,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).await?;
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Flush and fsync. The handle stays open but must not be written to
    /// afterwards.
    pub async fn finish(&mut self) -> Result<()> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_data().await?;
        Ok(())
    }
}

/// What the data sink hands back once closed.
pub struct SinkOutput {
    /// Full-file checksum of the on-disk bytes; becomes the Digest.
    pub digest: u32,
    /// `(chunk size, per-chunk CRCs)` for the CRC component, present when
    /// the data file is uncompressed.
    pub crc_chunks: Option<(u32, Vec<u32>)>,
    /// CompressionInfo, present when the data file is compressed.
    pub compression: Option<CompressionInfo>,
    pub on_disk_length: u64,
}

/// The data-file sink: either plain with per-chunk CRCs, or segmented
/// into independently compressed chunks each followed by its CRC.
pub enum DataSink {
    Plain {
        file: FileSink,
        full: FullChecksum,
        chunk_len: u32,
        chunk_fill: u32,
        chunk_hasher: crc32fast::Hasher,
        chunk_crcs: Vec<u32>,
    },
    Compressed {
        file: FileSink,
        codec: Compressor,
        params: CompressionParams,
        buffer: Vec<u8>,
        chunk_offsets: Vec<u64>,
        logical_offset: u64,
        full: FullChecksum,
    },
}

/// Compress and write out one buffered chunk, followed by its CRC.
async fn flush_chunk(
    file: &mut FileSink,
    codec: Compressor,
    buffer: &mut Vec<u8>,
    chunk_offsets: &mut Vec<u64>,
    full: &mut FullChecksum,
) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let compressed = codec.compress(buffer);
    buffer.clear();
    chunk_offsets.push(file.offset());
    let mut trailer = Vec::with_capacity(4);
    trailer.put_u32(crc32(&compressed));
    full.update(&compressed);
    full.update(&trailer);
    file.write_all(&compressed).await?;
    file.write_all(&trailer).await?;
    Ok(())
}

impl DataSink {
    pub async fn create(path: &Path, schema: &Schema, options: &SsTableOptions) -> Result<DataSink> {
        let file = FileSink::create(path, options.buffer_size).await?;
        match &schema.compression {
            None => Ok(DataSink::Plain {
                file,
                full: FullChecksum::new(),
                chunk_len: options.buffer_size.max(1) as u32,
                chunk_fill: 0,
                chunk_hasher: crc32fast::Hasher::new(),
                chunk_crcs: vec![],
            }),
            Some(params) => Ok(DataSink::Compressed {
                file,
                codec: Compressor::by_name(&params.name)?,
                params: params.clone(),
                buffer: Vec::with_capacity(params.chunk_length as usize),
                chunk_offsets: vec![],
                logical_offset: 0,
                full: FullChecksum::new(),
            }),
        }
    }

    /// Offset in the uncompressed byte stream; index and promoted-index
    /// positions are expressed in this space.
    pub fn logical_offset(&self) -> u64 {
        match self {
            DataSink::Plain { file, .. } => file.offset(),
            DataSink::Compressed { logical_offset, .. } => *logical_offset,
        }
    }

    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        match self {
            DataSink::Plain {
                file,
                full,
                chunk_len,
                chunk_fill,
                chunk_hasher,
                chunk_crcs,
            } => {
                full.update(data);
                file.write_all(data).await?;
                while !data.is_empty() {
                    let room = (*chunk_len - *chunk_fill) as usize;
                    let take = room.min(data.len());
                    chunk_hasher.update(&data[..take]);
                    *chunk_fill += take as u32;
                    if *chunk_fill == *chunk_len {
                        let hasher = std::mem::replace(chunk_hasher, crc32fast::Hasher::new());
                        chunk_crcs.push(hasher.finalize());
                        *chunk_fill = 0;
                    }
                    data = &data[take..];
                }
            }
            DataSink::Compressed {
                file,
                codec,
                params,
                buffer,
                chunk_offsets,
                logical_offset,
                full,
            } => {
                while !data.is_empty() {
                    let take = (params.chunk_length as usize - buffer.len()).min(data.len());
                    buffer.extend_from_slice(&data[..take]);
                    *logical_offset += take as u64;
                    data = &data[take..];
                    if buffer.len() == params.chunk_length as usize {
                        flush_chunk(file, *codec, buffer, chunk_offsets, full).await?;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn finish(&mut self) -> Result<SinkOutput> {
        match self {
            DataSink::Plain {
                file,
                full,
                chunk_len,
                chunk_fill,
                chunk_hasher,
                chunk_crcs,
            } => {
                if *chunk_fill > 0 {
                    let hasher = std::mem::replace(chunk_hasher, crc32fast::Hasher::new());
                    chunk_crcs.push(hasher.finalize());
                    *chunk_fill = 0;
                }
                file.finish().await?;
                Ok(SinkOutput {
                    digest: std::mem::take(full).finalize(),
                    crc_chunks: Some((*chunk_len, std::mem::take(chunk_crcs))),
                    compression: None,
                    on_disk_length: file.offset(),
                })
            }
            DataSink::Compressed {
                file,
                codec,
                params,
                buffer,
                chunk_offsets,
                logical_offset,
                full,
            } => {
                flush_chunk(file, *codec, buffer, chunk_offsets, full).await?;
                file.finish().await?;
                Ok(SinkOutput {
                    digest: std::mem::take(full).finalize(),
                    crc_chunks: None,
                    compression: Some(CompressionInfo {
                        params: params.clone(),
                        data_length: *logical_offset,
                        chunk_offsets: std::mem::take(chunk_offsets),
                    }),
                    on_disk_length: file.offset(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ColumnType;

    fn plain_schema() -> std::sync::Arc<Schema> {
        Schema::builder("ks", "cf")
            .partition_key("pk", ColumnType::Int)
            .regular("v", ColumnType::Int)
            .build()
    }

    fn compressed_schema() -> std::sync::Arc<Schema> {
        Schema::builder("ks", "cf")
            .partition_key("pk", ColumnType::Int)
            .regular("v", ColumnType::Int)
            .compression(CompressionParams {
                chunk_length: 4096,
                ..CompressionParams::lz4()
            })
            .build()
    }

    #[tokio::test]
    async fn plain_sink_chunks_crcs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Data.db");
        let mut options = SsTableOptions::default_for_test();
        options.buffer_size = 1024;
        let mut sink = DataSink::create(&path, &plain_schema(), &options)
            .await
            .unwrap();
        let payload = vec![7u8; 2500];
        sink.write_all(&payload).await.unwrap();
        assert_eq!(sink.logical_offset(), 2500);
        let output = sink.finish().await.unwrap();
        let (chunk_len, crcs) = output.crc_chunks.unwrap();
        assert_eq!(chunk_len, 1024);
        assert_eq!(crcs.len(), 3);
        assert_eq!(crcs[0], crc32(&payload[..1024]));
        assert_eq!(crcs[2], crc32(&payload[2048..]));
        assert_eq!(output.digest, crc32(&payload));
        assert_eq!(output.on_disk_length, 2500);
    }

    #[tokio::test]
    async fn compressed_sink_records_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Data.db");
        let options = SsTableOptions::default_for_test();
        let mut sink = DataSink::create(&path, &compressed_schema(), &options)
            .await
            .unwrap();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        sink.write_all(&payload).await.unwrap();
        assert_eq!(sink.logical_offset(), 10_000);
        let output = sink.finish().await.unwrap();
        let info = output.compression.unwrap();
        assert_eq!(info.data_length, 10_000);
        // 10_000 bytes in 4096-byte chunks: three chunks.
        assert_eq!(info.chunk_offsets.len(), 3);
        assert_eq!(info.chunk_offsets[0], 0);
        let disk = std::fs::read(&path).unwrap();
        assert_eq!(disk.len() as u64, output.on_disk_length);
        assert_eq!(output.digest, crc32(&disk));
    }
}
