// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

/// Tunables of the SSTable engine.
///
/// Defaults track the knobs of the on-disk format's reference deployment:
/// `sstable_summary_ratio`, `column_index_size_in_kb`,
/// `enable_sstable_data_integrity_check` and `sstable_buffer_size`.
#[derive(Clone, Debug)]
pub struct SsTableOptions {
    /// Target ratio of summary bytes to data bytes. The summary sampler
    /// spaces entries so that `data_len * summary_ratio ~= summary_len`.
    pub summary_ratio: f64,

    /// Desired size of one promoted-index block of a partition.
    pub promoted_index_block_size: usize,

    /// Buffer size for sequential data-file reads and writes.
    pub buffer_size: usize,

    /// Verify per-chunk checksums while reading the data file and the full
    /// digest when opening.
    pub data_integrity_check: bool,

    /// Capacity of the shared index page cache, in pages.
    pub page_cache_capacity: u64,

    /// Partitions larger than this trigger the large-partition observer.
    pub large_partition_threshold: u64,

    /// A writer reports saturation once the data file outgrows this.
    pub max_sstable_size: u64,
}

impl Default for SsTableOptions {
    fn default() -> Self {
        Self {
            summary_ratio: 0.0005,
            promoted_index_block_size: 64 * 1024,
            buffer_size: 128 * 1024,
            data_integrity_check: false,
            page_cache_capacity: 1024,
            large_partition_threshold: u64::MAX,
            max_sstable_size: u64::MAX,
        }
    }
}

impl SsTableOptions {
    pub fn default_for_test() -> Self {
        Self {
            promoted_index_block_size: 4096,
            buffer_size: 4096,
            data_integrity_check: true,
            page_cache_capacity: 64,
            ..Default::default()
        }
    }

    /// Cost in data bytes of one summary byte, derived from the ratio.
    pub fn summary_byte_cost(&self) -> u64 {
        const DEFAULT_SUMMARY_BYTE_COST: u64 = 2000;
        if self.summary_ratio > 0.0 {
            (1.0 / self.summary_ratio) as u64
        } else {
            DEFAULT_SUMMARY_BYTE_COST
        }
    }
}
