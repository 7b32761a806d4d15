// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! The sealed SSTable object: component loading, lifecycle and the
//! crash-safe publication protocol.

use std::path::Path;
use std::sync::Arc;

use futures::future::try_join_all;
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::background::JobsBarrier;
use crate::cache::PageCache;
use crate::checksum::{parse_digest, FullChecksum};
use crate::error::{Error, ErrorKind, Result};
use crate::metadata::{
    BloomFilter, ComponentType, CompressionInfo, Compressor, Descriptor, ScyllaMetadata,
    Statistics, Summary, Toc, Version,
};
use crate::options::SsTableOptions;
use crate::partitioner::Murmur3Partitioner;
use crate::reader::index::IndexReader;
use crate::reader::source::{read_at, BufferedSource, ChunkSource, Deadline, ReadCounter};
use crate::reader::{ReadOptions, SsTableReader};
use crate::schema::Schema;
use crate::types::EncodingStats;

/// Fsync a directory so renames and unlinks inside it are durable.
pub async fn fsync_dir(dir: &Path) -> Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

async fn read_component(descriptor: &Descriptor, component: ComponentType) -> Result<Vec<u8>> {
    tokio::fs::read(descriptor.path(component))
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::missing_component(component.file_name())
            } else {
                e.into()
            }
        })
}

/// An immutable, sealed SSTable. Readers share it through an `Arc`; all
/// of its file handles are read-only.
pub struct SsTable {
    descriptor: Descriptor,
    schema: Arc<Schema>,
    options: SsTableOptions,
    toc: Toc,
    summary: Summary,
    statistics: Statistics,
    enc_stats: EncodingStats,
    filter: Option<BloomFilter>,
    compression: Option<Arc<CompressionInfo>>,
    scylla: ScyllaMetadata,
    data_file: Arc<std::fs::File>,
    data_len: u64,
    index_file: Arc<std::fs::File>,
    index_len: u64,
    cache: PageCache,
    /// Process-unique id keying this table's pages in the shared cache.
    cache_file_id: u64,
}

fn next_cache_file_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl SsTable {
    /// Load a sealed SSTable: parse the TOC, load every metadata
    /// component, open the data and index files. A missing Summary is
    /// rebuilt from the Index; a missing Filter is tolerated.
    pub async fn open(
        descriptor: Descriptor,
        schema: Arc<Schema>,
        options: SsTableOptions,
    ) -> Result<Arc<SsTable>> {
        if descriptor.version != Version::Mc {
            return Err(Error::unsupported(
                "sstable version",
                descriptor.version.as_str(),
            ));
        }
        let toc = Toc::deserialize(&read_component(&descriptor, ComponentType::Toc).await?)?;

        let statistics =
            Statistics::deserialize(&read_component(&descriptor, ComponentType::Statistics).await?)?;
        let enc_stats = statistics
            .serialization_header()
            .ok_or_else(|| Error::malformed("mc statistics without a serialization header"))?
            .encoding_stats();

        let compression = if toc.contains(ComponentType::CompressionInfo) {
            let raw = read_component(&descriptor, ComponentType::CompressionInfo).await?;
            Some(Arc::new(CompressionInfo::deserialize(&raw)?))
        } else {
            None
        };

        let filter = if toc.contains(ComponentType::Filter) {
            match read_component(&descriptor, ComponentType::Filter).await {
                Ok(raw) => Some(BloomFilter::deserialize(&raw)?),
                Err(e) if matches!(e.kind(), ErrorKind::MissingComponent(_)) => {
                    warn!(generation = descriptor.generation, "missing bloom filter");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let scylla = match read_component(&descriptor, ComponentType::Scylla).await {
            Ok(raw) => ScyllaMetadata::deserialize(&raw)?,
            Err(e) if matches!(e.kind(), ErrorKind::MissingComponent(_)) => {
                ScyllaMetadata::default()
            }
            Err(e) => return Err(e),
        };

        let data_file = open_read_only(&descriptor.path(ComponentType::Data)).await?;
        let data_len = data_file.metadata()?.len();
        let index_file = open_read_only(&descriptor.path(ComponentType::Index)).await?;
        let index_len = index_file.metadata()?.len();

        let cache = PageCache::shared();
        let summary = match read_component(&descriptor, ComponentType::Summary).await {
            Ok(raw) => match Summary::deserialize(&raw) {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(generation = descriptor.generation, error = %e,
                          "corrupt summary; regenerating from index");
                    regenerate_summary(&schema, &options, index_file.clone(), index_len, &cache)
                        .await?
                }
            },
            Err(e) if matches!(e.kind(), ErrorKind::MissingComponent(_)) => {
                info!(generation = descriptor.generation, "missing summary; regenerating");
                regenerate_summary(&schema, &options, index_file.clone(), index_len, &cache).await?
            }
            Err(e) => return Err(e),
        };

        let table = Arc::new(SsTable {
            descriptor,
            schema,
            options,
            toc,
            summary,
            statistics,
            enc_stats,
            filter,
            compression,
            scylla,
            data_file,
            data_len,
            index_file,
            index_len,
            cache,
            cache_file_id: next_cache_file_id(),
        });
        if table.options.data_integrity_check {
            table.verify_digest().await?;
        }
        Ok(table)
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn scylla_metadata(&self) -> &ScyllaMetadata {
        &self.scylla
    }

    pub fn encoding_stats(&self) -> EncodingStats {
        self.enc_stats
    }

    /// Bloom check; a miss means the key is definitely absent and the
    /// index need not be consulted.
    pub fn may_contain_key(&self, key: &[u8]) -> bool {
        self.filter
            .as_ref()
            .map(|filter| filter.may_contain(key))
            .unwrap_or(true)
    }

    pub async fn reader(self: &Arc<Self>, options: ReadOptions) -> Result<SsTableReader> {
        SsTableReader::open(self.clone(), options).await
    }

    pub(crate) fn data_source(&self, buffer_size: Option<usize>) -> Result<ChunkSource> {
        let buffer_size = buffer_size.unwrap_or(self.options.buffer_size).max(1);
        Ok(match &self.compression {
            None => ChunkSource::Plain {
                file: self.data_file.clone(),
                len: self.data_len,
                buffer_size,
            },
            Some(info) => ChunkSource::Compressed {
                file: self.data_file.clone(),
                file_len: self.data_len,
                info: info.clone(),
                codec: Compressor::by_name(&info.params.name)?,
                verify: self.options.data_integrity_check,
            },
        })
    }

    pub(crate) fn index_source(&self) -> ChunkSource {
        ChunkSource::Paged {
            file: self.index_file.clone(),
            file_id: self.cache_file_id,
            len: self.index_len,
            cache: self.cache.clone(),
        }
    }

    /// Recompute the full-file checksum and compare it with the Digest
    /// component.
    async fn verify_digest(&self) -> Result<()> {
        let raw = read_component(&self.descriptor, ComponentType::Digest).await?;
        let expected = parse_digest(&raw)?;
        let mut hasher = FullChecksum::new();
        let mut offset = 0u64;
        while offset < self.data_len {
            let want = (self.data_len - offset).min(self.options.buffer_size as u64) as usize;
            let chunk = read_at(&self.data_file, offset, want).await?;
            if chunk.is_empty() {
                return Err(Error::truncated(offset, want));
            }
            offset += chunk.len() as u64;
            hasher.update(&chunk);
        }
        let found = hasher.finalize();
        if found != expected {
            return Err(Error::checksum(found, expected));
        }
        Ok(())
    }

    /// The cross-shard hand-off form: duplicated file handles plus a
    /// deep-copied metadata bundle.
    pub fn open_info(&self) -> Result<OpenInfo> {
        Ok(OpenInfo {
            descriptor: self.descriptor.clone(),
            schema: self.schema.clone(),
            options: self.options.clone(),
            toc: self.toc.clone(),
            summary: self.summary.clone(),
            statistics: self.statistics.clone(),
            enc_stats: self.enc_stats,
            filter: self.filter.clone(),
            compression: self.compression.as_deref().cloned(),
            scylla: self.scylla.clone(),
            data_file: Arc::new(self.data_file.try_clone()?),
            data_len: self.data_len,
            index_file: Arc::new(self.index_file.try_clone()?),
            index_len: self.index_len,
        })
    }

    /// Atomic delete: record intent by renaming the TOC back to its
    /// temporary name, then remove components, the intent record last.
    pub async fn delete(self: Arc<Self>) -> Result<()> {
        let _job = JobsBarrier::global().enter();
        let descriptor = self.descriptor.clone();
        let components = self.toc.components.clone();
        drop(self);

        let toc_path = descriptor.path(ComponentType::Toc);
        let tmp_path = descriptor.path(ComponentType::TemporaryToc);
        match tokio::fs::rename(&toc_path, &tmp_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(?toc_path, "cannot delete sstable without a TOC");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        fsync_dir(&descriptor.dir).await?;

        try_join_all(
            components
                .iter()
                .filter(|c| !matches!(c, ComponentType::Toc | ComponentType::TemporaryToc))
                .map(|component| remove_forgiving(descriptor.path(*component))),
        )
        .await?;
        fsync_dir(&descriptor.dir).await?;
        tokio::fs::remove_file(&tmp_path).await?;
        fsync_dir(&descriptor.dir).await?;
        info!(generation = descriptor.generation, "deleted sstable");
        Ok(())
    }
}

async fn open_read_only(path: &Path) -> Result<Arc<std::fs::File>> {
    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .open(path)
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::missing_component(path.display().to_string())
            } else {
                Error::from(e)
            }
        })?;
    Ok(Arc::new(file.into_std().await))
}

async fn remove_forgiving(path: std::path::PathBuf) -> Result<()> {
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(?path, "forgiving ENOENT during delete");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn regenerate_summary(
    schema: &Arc<Schema>,
    options: &SsTableOptions,
    index_file: Arc<std::fs::File>,
    index_len: u64,
    cache: &PageCache,
) -> Result<Summary> {
    let source = ChunkSource::Paged {
        file: index_file,
        file_id: next_cache_file_id(),
        len: index_len,
        cache: cache.clone(),
    };
    let src = BufferedSource::new(source, ReadCounter::default(), Deadline::none());
    let reader = IndexReader::new(src, schema.clone());
    crate::reader::index::rebuild_summary(
        reader,
        &Murmur3Partitioner,
        schema.min_index_interval,
        options.summary_byte_cost(),
    )
    .await
}

/// The hand-off value object. Conversion back into a table is pure
/// in-memory work.
pub struct OpenInfo {
    pub descriptor: Descriptor,
    pub schema: Arc<Schema>,
    pub options: SsTableOptions,
    pub toc: Toc,
    pub summary: Summary,
    pub statistics: Statistics,
    pub enc_stats: EncodingStats,
    pub filter: Option<BloomFilter>,
    pub compression: Option<CompressionInfo>,
    pub scylla: ScyllaMetadata,
    pub data_file: Arc<std::fs::File>,
    pub data_len: u64,
    pub index_file: Arc<std::fs::File>,
    pub index_len: u64,
}

impl OpenInfo {
    /// Adopt the hand-off on the receiving shard, with that shard's page
    /// cache.
    pub fn into_sstable(self, cache: PageCache) -> Arc<SsTable> {
        Arc::new(SsTable {
            descriptor: self.descriptor,
            schema: self.schema,
            options: self.options,
            toc: self.toc,
            summary: self.summary,
            statistics: self.statistics,
            enc_stats: self.enc_stats,
            filter: self.filter,
            compression: self.compression.map(Arc::new),
            scylla: self.scylla,
            data_file: self.data_file,
            data_len: self.data_len,
            index_file: self.index_file,
            index_len: self.index_len,
            cache,
            cache_file_id: next_cache_file_id(),
        })
    }
}

/// Remove every component of an SSTable that has a TemporaryTOC but no
/// sealed TOC: the writer died before publication.
pub async fn cleanup_unsealed(descriptor: &Descriptor) -> Result<()> {
    let toc_path = descriptor.path(ComponentType::Toc);
    if tokio::fs::try_exists(&toc_path).await? {
        return Err(Error::malformed(format!(
            "refusing cleanup: {toc_path:?} exists, the sstable is sealed"
        )));
    }
    let tmp_path = descriptor.path(ComponentType::TemporaryToc);
    let toc = Toc::deserialize(&tokio::fs::read(&tmp_path).await?)?;

    warn!(
        generation = descriptor.generation,
        "removing components of an unsealed sstable"
    );
    for component in &toc.components {
        // The TemporaryTOC itself goes last: losing it early would leave
        // an undeletable half-table behind after another crash.
        if matches!(component, ComponentType::Toc | ComponentType::TemporaryToc) {
            continue;
        }
        remove_forgiving(descriptor.path(*component)).await?;
    }
    fsync_dir(&descriptor.dir).await?;
    tokio::fs::remove_file(&tmp_path).await?;
    fsync_dir(&descriptor.dir).await?;
    Ok(())
}

/// Scan a table directory on startup and clean every generation whose
/// build never completed. Returns the cleaned generations.
pub async fn recover_dir(dir: &Path) -> Result<Vec<u64>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut unsealed: Vec<Descriptor> = vec![];
    let mut sealed: Vec<u64> = vec![];
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Ok((descriptor, component)) = Descriptor::parse_path(&path) else {
            continue;
        };
        match component {
            ComponentType::TemporaryToc => unsealed.push(descriptor),
            ComponentType::Toc => sealed.push(descriptor.generation),
            _ => {}
        }
    }

    let mut cleaned = vec![];
    for descriptor in unsealed
        .into_iter()
        .unique_by(|d| (d.version, d.generation))
    {
        if sealed.contains(&descriptor.generation) {
            warn!(
                generation = descriptor.generation,
                "both TOC and TemporaryTOC present; leaving both for inspection"
            );
            continue;
        }
        cleanup_unsealed(&descriptor).await?;
        cleaned.push(descriptor.generation);
    }
    Ok(cleaned)
}
