//! Bounded in-memory page cache.
//!
//! Clean readable pages are shared as `Arc<PageBuffer>`; writable pages are
//! checked out as owned copy-on-write clones and stay pinned inside their
//! transaction's dirty set until commit or rollback. Eviction only touches
//! clean pages nobody references, in approximate LRU order; the cache grows
//! past its budget only when every resident page is still referenced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::page::{PageBuffer, PAGE_SIZE};
use super::stream::StreamKind;

/// Cache key: which stream the page came from and its byte position there.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CacheKey {
    pub kind: StreamKind,
    pub position: u64,
}

impl CacheKey {
    pub fn data(position: u64) -> Self {
        CacheKey {
            kind: StreamKind::Data,
            position,
        }
    }

    pub fn log(position: u64) -> Self {
        CacheKey {
            kind: StreamKind::Log,
            position,
        }
    }
}

struct Entry {
    buffer: Arc<PageBuffer>,
    last_access: u64,
}

#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub extend_pages: u64,
    pub resident: usize,
}

pub struct PageCache {
    /// Byte budget; `extend_pages * PAGE_SIZE` stays at or under this once
    /// the working set stabilizes.
    limit: usize,
    entries: Mutex<HashMap<CacheKey, Entry>>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    /// High-water mark of simultaneously allocated page buffers.
    extend_pages: AtomicU64,
}

impl PageCache {
    pub fn new(limit: usize) -> Self {
        PageCache {
            limit: limit.max(PAGE_SIZE),
            entries: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            extend_pages: AtomicU64::new(0),
        }
    }

    fn max_pages(&self) -> usize {
        self.limit / PAGE_SIZE
    }

    pub fn get(&self, key: CacheKey) -> Option<Arc<PageBuffer>> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&key) {
            Some(entry) => {
                entry.last_access = self.clock.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.buffer.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a freshly read page, evicting an unreferenced clean page when
    /// the budget is full.
    pub fn insert(&self, key: CacheKey, buffer: Arc<PageBuffer>) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_pages() {
            Self::evict_lru(&mut entries);
        }
        let resident = entries.len() + 1;
        entries.insert(
            key,
            Entry {
                buffer,
                last_access: self.clock.fetch_add(1, Ordering::Relaxed),
            },
        );
        self.extend_pages
            .fetch_max(resident as u64, Ordering::Relaxed);
    }

    fn evict_lru(entries: &mut HashMap<CacheKey, Entry>) {
        let victim = entries
            .iter()
            .filter(|(_, e)| Arc::strong_count(&e.buffer) == 1)
            .min_by_key(|(_, e)| e.last_access)
            .map(|(k, _)| *k);
        if let Some(key) = victim {
            entries.remove(&key);
        }
    }

    /// Drop a specific page (its on-disk home is being rewritten).
    pub fn invalidate(&self, key: CacheKey) {
        self.entries.lock().remove(&key);
    }

    /// Drop every cached log page; called after checkpoint truncates the log.
    pub fn invalidate_log(&self) {
        self.entries
            .lock()
            .retain(|key, _| key.kind != StreamKind::Log);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            extend_pages: self.extend_pages.load(Ordering::Relaxed),
            resident: self.entries.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageType;

    fn page(id: u32) -> Arc<PageBuffer> {
        Arc::new(PageBuffer::new(id, PageType::Data))
    }

    #[test]
    fn hit_and_miss_accounting() {
        let cache = PageCache::new(PAGE_SIZE * 4);
        assert!(cache.get(CacheKey::data(0)).is_none());
        cache.insert(CacheKey::data(0), page(0));
        assert!(cache.get(CacheKey::data(0)).is_some());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn eviction_respects_budget() {
        let limit = PAGE_SIZE * 4;
        let cache = PageCache::new(limit);
        for i in 0..32u64 {
            cache.insert(CacheKey::data(i * PAGE_SIZE as u64), page(i as u32));
        }
        let stats = cache.stats();
        assert!(stats.resident <= 4);
        assert!(stats.extend_pages as usize * PAGE_SIZE <= limit);
    }

    #[test]
    fn referenced_pages_are_not_evicted() {
        let cache = PageCache::new(PAGE_SIZE * 2);
        let pinned = page(0);
        cache.insert(CacheKey::data(0), pinned.clone());
        for i in 1..8u64 {
            cache.insert(CacheKey::data(i * PAGE_SIZE as u64), page(i as u32));
        }
        // the pinned page survived every eviction round
        assert!(cache.get(CacheKey::data(0)).is_some());
    }

    #[test]
    fn log_invalidation() {
        let cache = PageCache::new(PAGE_SIZE * 8);
        cache.insert(CacheKey::log(0), page(1));
        cache.insert(CacheKey::data(0), page(2));
        cache.invalidate_log();
        assert!(cache.get(CacheKey::log(0)).is_none());
        assert!(cache.get(CacheKey::data(0)).is_some());
    }
}
