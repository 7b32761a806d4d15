// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! Suspendable byte sources under the readers. Every `read` is a
//! suspension point; positioned reads go through `spawn_blocking` so the
//! shard never blocks on the kernel.

use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::cache::{PageCache, PageCacheKey, PAGE_SIZE};
use crate::checksum::verify_crc32;
use crate::codec;
use crate::error::{Error, ErrorKind, Result};
use crate::metadata::{CompressionInfo, Compressor};

/// A reader deadline: exceeding it fails the next suspension point with
/// [`ErrorKind::Timeout`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn check(&self) -> Result<()> {
        match self.0 {
            Some(deadline) if Instant::now() > deadline => Err(ErrorKind::Timeout.into()),
            _ => Ok(()),
        }
    }
}

/// Counts physical read operations; the promoted-index speedup asserts
/// are written against this.
#[derive(Clone, Default)]
pub struct ReadCounter(Arc<AtomicU64>);

impl ReadCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// Read up to `len` bytes at `offset`; short only at end of file.
pub async fn read_at(file: &Arc<std::fs::File>, offset: u64, len: usize) -> Result<Bytes> {
    let file = file.clone();
    tokio::task::spawn_blocking(move || {
        let mut data = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match file.read_at(&mut data[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from(e)),
            }
        }
        data.truncate(filled);
        Ok(Bytes::from(data))
    })
    .await
    .map_err(|e| Error::malformed(format!("read task failed: {e}")))?
}

pub async fn read_exact_at(file: &Arc<std::fs::File>, offset: u64, len: usize) -> Result<Bytes> {
    let data = read_at(file, offset, len).await?;
    if data.len() < len {
        return Err(Error::truncated(offset + data.len() as u64, len - data.len()));
    }
    Ok(data)
}

/// Where a [`BufferedSource`] gets its buffers: a plain file window, a
/// decompressed chunk, or a cached index page. Offsets are logical
/// (uncompressed) throughout.
pub enum ChunkSource {
    Plain {
        file: Arc<std::fs::File>,
        len: u64,
        buffer_size: usize,
    },
    Compressed {
        file: Arc<std::fs::File>,
        file_len: u64,
        info: Arc<CompressionInfo>,
        codec: Compressor,
        verify: bool,
    },
    Paged {
        file: Arc<std::fs::File>,
        file_id: u64,
        len: u64,
        cache: PageCache,
    },
}

impl ChunkSource {
    pub fn logical_len(&self) -> u64 {
        match self {
            ChunkSource::Plain { len, .. } => *len,
            ChunkSource::Compressed { info, .. } => info.data_length,
            ChunkSource::Paged { len, .. } => *len,
        }
    }

    /// Fetch a buffer covering logical `offset`; returns the logical
    /// offset the buffer starts at.
    async fn fetch(&self, offset: u64, counter: &ReadCounter) -> Result<(u64, Bytes)> {
        match self {
            ChunkSource::Plain {
                file,
                len,
                buffer_size,
            } => {
                let want = (*len - offset).min(*buffer_size as u64) as usize;
                counter.bump();
                let data = read_exact_at(file, offset, want).await?;
                Ok((offset, data))
            }
            ChunkSource::Compressed {
                file,
                file_len,
                info,
                codec,
                verify,
            } => {
                let chunk = info.chunk_of(offset);
                let (disk_offset, compressed_len) = info.chunk_extent(chunk, *file_len)?;
                counter.bump();
                let raw = read_exact_at(file, disk_offset, compressed_len + 4).await?;
                let compressed = raw.slice(..compressed_len);
                if *verify {
                    let crc = (&raw[compressed_len..]).get_u32();
                    verify_crc32(&compressed, crc)?;
                }
                let chunk_start = chunk as u64 * info.chunk_length();
                let uncompressed_len =
                    (info.data_length - chunk_start).min(info.chunk_length()) as usize;
                let data = codec.decompress(&compressed, uncompressed_len)?;
                if data.len() != uncompressed_len {
                    return Err(Error::malformed("chunk decompressed to the wrong size"));
                }
                Ok((chunk_start, Bytes::from(data)))
            }
            ChunkSource::Paged {
                file,
                file_id,
                len,
                cache,
            } => {
                let page_offset = offset / PAGE_SIZE * PAGE_SIZE;
                let key = PageCacheKey::default().file(*file_id).page(page_offset);
                let want = (*len - page_offset).min(PAGE_SIZE) as usize;
                let file = file.clone();
                let counter = counter.clone();
                let page = cache
                    .get_or_load(key, async move {
                        counter.bump();
                        read_exact_at(&file, page_offset, want).await
                    })
                    .await?;
                Ok((page_offset, page))
            }
        }
    }
}

/// Sequential decoder over a [`ChunkSource`] with explicit seeking.
pub struct BufferedSource {
    source: ChunkSource,
    buf: Bytes,
    buf_start: u64,
    pos: u64,
    counter: ReadCounter,
    deadline: Deadline,
}

impl BufferedSource {
    pub fn new(source: ChunkSource, counter: ReadCounter, deadline: Deadline) -> Self {
        Self {
            source,
            buf: Bytes::new(),
            buf_start: 0,
            pos: 0,
            counter,
            deadline,
        }
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn len(&self) -> u64 {
        self.source.logical_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.len()
    }

    pub fn reads(&self) -> u64 {
        self.counter.get()
    }

    /// Reposition; a seek within the current buffer costs nothing.
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    fn buffered(&self) -> &[u8] {
        let start = (self.pos - self.buf_start) as usize;
        if self.pos < self.buf_start || start >= self.buf.len() {
            &[]
        } else {
            &self.buf[start..]
        }
    }

    async fn refill(&mut self) -> Result<()> {
        self.deadline.check()?;
        if self.at_end() {
            return Err(Error::truncated(self.pos, 1));
        }
        let (start, buf) = self.source.fetch(self.pos, &self.counter).await?;
        self.buf_start = start;
        self.buf = buf;
        Ok(())
    }

    pub async fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        // Fast path: entirely inside the current buffer.
        let available = self.buffered();
        if available.len() >= len {
            let start = (self.pos - self.buf_start) as usize;
            let out = self.buf.slice(start..start + len);
            self.pos += len as u64;
            return Ok(out);
        }
        if self.pos + len as u64 > self.len() {
            return Err(Error::truncated(self.pos, len));
        }
        let mut out = BytesMut::with_capacity(len);
        while out.len() < len {
            let chunk = self.buffered();
            if chunk.is_empty() {
                self.refill().await?;
                continue;
            }
            let take = chunk.len().min(len - out.len());
            out.put_slice(&chunk[..take]);
            self.pos += take as u64;
        }
        Ok(out.freeze())
    }

    pub async fn skip(&mut self, len: u64) -> Result<()> {
        if self.pos + len > self.len() {
            return Err(Error::truncated(self.pos, len as usize));
        }
        self.pos += len;
        Ok(())
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        let raw = self.read_bytes(1).await?;
        Ok(raw[0])
    }

    pub async fn read_u16(&mut self) -> Result<u16> {
        let raw = self.read_bytes(2).await?;
        codec::get_u16(&mut &raw[..])
    }

    pub async fn read_i32(&mut self) -> Result<i32> {
        let raw = self.read_bytes(4).await?;
        codec::get_i32(&mut &raw[..])
    }

    pub async fn read_i64(&mut self) -> Result<i64> {
        let raw = self.read_bytes(8).await?;
        codec::get_i64(&mut &raw[..])
    }

    pub async fn read_vint(&mut self) -> Result<u64> {
        let first = self.read_u8().await?;
        let extra = first.leading_ones() as usize;
        if extra == 8 {
            let raw = self.read_bytes(8).await?;
            return codec::get_u64(&mut &raw[..]);
        }
        let mut value = (first & (0xff >> extra)) as u64;
        if extra > 0 {
            let raw = self.read_bytes(extra).await?;
            for byte in raw {
                value = (value << 8) | byte as u64;
            }
        }
        Ok(value)
    }

    pub async fn read_signed_vint(&mut self) -> Result<i64> {
        Ok(codec::unzigzag(self.read_vint().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn file_with(data: &[u8]) -> (tempfile::TempDir, Arc<std::fs::File>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let mut f = tokio::fs::File::create(&path).await.unwrap();
        f.write_all(data).await.unwrap();
        f.sync_all().await.unwrap();
        let file = std::fs::File::open(&path).unwrap();
        (dir, Arc::new(file))
    }

    #[tokio::test]
    async fn plain_source_reads_across_buffers() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let (_dir, file) = file_with(&payload).await;
        let source = ChunkSource::Plain {
            file,
            len: 1000,
            buffer_size: 64,
        };
        let mut src = BufferedSource::new(source, ReadCounter::default(), Deadline::none());
        let head = src.read_bytes(10).await.unwrap();
        assert_eq!(&head[..], &payload[..10]);
        let cross = src.read_bytes(200).await.unwrap();
        assert_eq!(&cross[..], &payload[10..210]);
        src.seek(998);
        assert_eq!(src.read_u16().await.unwrap(), u16::from_be_bytes([payload[998], payload[999]]));
        assert!(src.read_u8().await.is_err());
    }

    #[tokio::test]
    async fn buffer_size_one_forces_fine_grained_reads() {
        let payload = vec![1u8; 16];
        let (_dir, file) = file_with(&payload).await;
        let source = ChunkSource::Plain {
            file,
            len: 16,
            buffer_size: 1,
        };
        let mut src = BufferedSource::new(source, ReadCounter::default(), Deadline::none());
        src.read_bytes(16).await.unwrap();
        assert_eq!(src.reads(), 16);
    }

    #[tokio::test]
    async fn expired_deadline_times_out() {
        let payload = vec![0u8; 8];
        let (_dir, file) = file_with(&payload).await;
        let source = ChunkSource::Plain {
            file,
            len: 8,
            buffer_size: 8,
        };
        let past = Instant::now() - std::time::Duration::from_secs(1);
        let mut src = BufferedSource::new(source, ReadCounter::default(), Deadline::at(past));
        let err = src.read_u8().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn paged_source_uses_cache() {
        let payload = vec![9u8; 100];
        let (_dir, file) = file_with(&payload).await;
        let counter = ReadCounter::default();
        let source = ChunkSource::Paged {
            file,
            file_id: 7,
            len: 100,
            cache: PageCache::new(8),
        };
        let mut src = BufferedSource::new(source, counter.clone(), Deadline::none());
        src.read_bytes(50).await.unwrap();
        src.seek(0);
        src.read_bytes(100).await.unwrap();
        assert_eq!(counter.get(), 1, "second pass must come from the cache");
    }
}
