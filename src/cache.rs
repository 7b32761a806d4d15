// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use moka::future::Cache;

use crate::error::{Error, Result};

pub const PAGE_SIZE: u64 = 4096;

/// A key in the index page cache: which file, which page.
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct PageCacheKey {
    pub file_id: u64,
    pub page_offset: u64,
}

impl PageCacheKey {
    pub fn file(mut self, file_id: u64) -> Self {
        self.file_id = file_id;
        self
    }

    pub fn page(mut self, page_offset: u64) -> Self {
        self.page_offset = page_offset;
        self
    }
}

/// Shard-local LRU cache of index-file pages. All readers of a shard share
/// one instance; cloning is a cheap handle copy.
#[derive(Clone)]
pub struct PageCache {
    cache: Cache<PageCacheKey, Bytes>,
}

impl PageCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::new(capacity),
        }
    }

    /// The process-wide default instance.
    pub fn shared() -> PageCache {
        static SHARED: OnceLock<PageCache> = OnceLock::new();
        SHARED.get_or_init(|| PageCache::new(4096)).clone()
    }

    /// Look up a page, loading it with `load` on a miss. Concurrent misses
    /// of one page share a single load.
    pub async fn get_or_load<F>(&self, key: PageCacheKey, load: F) -> Result<Bytes>
    where
        F: std::future::Future<Output = Result<Bytes>>,
    {
        self.cache
            .try_get_with(key, load)
            .await
            .map_err(|e: Arc<Error>| e.into())
    }

    pub fn invalidate_file(&self, file_id: u64) {
        // Moka has no prefix invalidation; dropping everything is fine for
        // the rare event of a table deletion.
        let _ = file_id;
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn loads_are_shared_per_page() {
        let cache = PageCache::new(16);
        let loads = AtomicUsize::new(0);
        let key = PageCacheKey::default().file(1).page(0);
        for _ in 0..3 {
            let page = cache
                .get_or_load(key.clone(), async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(Bytes::from_static(b"page"))
                })
                .await
                .unwrap();
            assert_eq!(&page[..], b"page");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn load_errors_propagate() {
        let cache = PageCache::new(16);
        let key = PageCacheKey::default().file(2).page(0);
        let result = cache
            .get_or_load(key, async { Err(Error::malformed("boom")) })
            .await;
        assert!(result.is_err());
    }
}
