//! Disk service: routes page reads between cache, log file and data file,
//! and owns the append-only log writer.
//!
//! Read resolution order is decided by the caller (transaction dirty set,
//! then WAL index, then data file); this service provides the cached
//! primitives for the last two steps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::cache::{CacheKey, CacheStats, PageCache};
use super::page::{PageBuffer, PageId, PAGE_SIZE};
use super::stream::{PageStream, StreamFactory, StreamKind};
use crate::error::{DbError, Result};

pub struct DiskService {
    data: Mutex<Box<dyn PageStream>>,
    log: Mutex<Box<dyn PageStream>>,
    cache: PageCache,
    /// Next append position in the log stream.
    log_end: AtomicU64,
    read_only: bool,
}

impl DiskService {
    pub fn new(factory: &StreamFactory, cache_size: usize) -> Result<Self> {
        let data = factory.open(StreamKind::Data)?;
        let log = factory.open(StreamKind::Log)?;
        let log_len = log.len()?;
        // a torn tail write is discarded at recovery; start appends on a
        // page boundary
        let log_end = log_len - (log_len % PAGE_SIZE as u64);

        Ok(DiskService {
            data: Mutex::new(data),
            log: Mutex::new(log),
            cache: PageCache::new(cache_size),
            log_end: AtomicU64::new(log_end),
            read_only: factory.settings().read_only,
        })
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn data_len(&self) -> Result<u64> {
        self.data.lock().len()
    }

    /// Number of pages currently in the log; drives auto-checkpoint.
    pub fn log_page_count(&self) -> u64 {
        self.log_end.load(Ordering::Acquire) / PAGE_SIZE as u64
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn read_data_page(&self, page_id: PageId) -> Result<Arc<PageBuffer>> {
        let position = page_id as u64 * PAGE_SIZE as u64;
        let key = CacheKey::data(position);
        if let Some(page) = self.cache.get(key) {
            return Ok(page);
        }
        let mut buf = vec![0u8; PAGE_SIZE];
        self.data.lock().read_page(position, &mut buf)?;
        let mut page = PageBuffer::from_bytes(&buf)?;
        // pages past the current end of file read back as fresh empties
        if page.as_bytes().iter().all(|&b| b == 0) {
            page.set_page_id(page_id);
        }
        let page = Arc::new(page);
        self.cache.insert(key, page.clone());
        Ok(page)
    }

    pub fn read_log_page(&self, position: u64) -> Result<Arc<PageBuffer>> {
        let key = CacheKey::log(position);
        if let Some(page) = self.cache.get(key) {
            return Ok(page);
        }
        let mut buf = vec![0u8; PAGE_SIZE];
        self.log.lock().read_page(position, &mut buf)?;
        let page = Arc::new(PageBuffer::from_bytes(&buf)?);
        self.cache.insert(key, page.clone());
        Ok(page)
    }

    // ------------------------------------------------------------------
    // Log writer
    // ------------------------------------------------------------------

    /// Append pages sequentially to the log. Returns each page's log
    /// position. Flushes when the batch contains a confirm marker.
    pub fn append_log(&self, pages: &[PageBuffer]) -> Result<Vec<(PageId, u64)>> {
        self.assert_writable()?;
        if pages.is_empty() {
            return Ok(Vec::new());
        }
        let mut log = self.log.lock();
        let mut positions = Vec::with_capacity(pages.len());
        let mut confirmed = false;
        for page in pages {
            let position = self.log_end.fetch_add(PAGE_SIZE as u64, Ordering::AcqRel);
            log.write_page(position, page.as_bytes())?;
            self.cache
                .insert(CacheKey::log(position), Arc::new(page.clone()));
            positions.push((page.page_id(), position));
            confirmed |= page.is_confirmed();
        }
        if confirmed {
            log.flush()?;
        }
        trace!(
            pages = pages.len(),
            confirmed,
            "appended transaction pages to log"
        );
        Ok(positions)
    }

    /// Sequential scan over every complete page in the log.
    pub fn scan_log(&self, mut visit: impl FnMut(u64, &PageBuffer) -> Result<()>) -> Result<()> {
        let end = self.log_end.load(Ordering::Acquire);
        let mut log = self.log.lock();
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut position = 0u64;
        while position < end {
            log.read_page(position, &mut buf)?;
            let page = PageBuffer::from_bytes(&buf)?;
            visit(position, &page)?;
            position += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Truncate the log back to zero after a checkpoint has relocated every
    /// confirmed page.
    pub fn truncate_log(&self) -> Result<()> {
        self.assert_writable()?;
        let mut log = self.log.lock();
        log.set_len(0)?;
        log.flush()?;
        self.log_end.store(0, Ordering::Release);
        self.cache.invalidate_log();
        debug!("log truncated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data writer (checkpoint / creation only)
    // ------------------------------------------------------------------

    /// Write a page to its home position in the data file.
    pub fn write_data_page(&self, page: &PageBuffer) -> Result<()> {
        self.assert_writable()?;
        let position = page.page_id() as u64 * PAGE_SIZE as u64;
        self.data.lock().write_page(position, page.as_bytes())?;
        self.cache
            .insert(CacheKey::data(position), Arc::new(page.clone()));
        Ok(())
    }

    pub fn flush_data(&self) -> Result<()> {
        self.data.lock().flush()
    }

    /// Grow the data file to `size` bytes up front (InitialSize option).
    pub fn ensure_data_size(&self, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let mut data = self.data.lock();
        if data.len()? < size {
            data.set_len(size)?;
        }
        Ok(())
    }

    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    fn assert_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(DbError::usage("engine is open in read-only mode"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::storage::page::PageType;

    fn memory_disk() -> DiskService {
        let factory = StreamFactory::new(EngineSettings::default());
        DiskService::new(&factory, PAGE_SIZE * 16).unwrap()
    }

    #[test]
    fn data_page_read_is_cached() {
        let disk = memory_disk();
        let mut page = PageBuffer::new(3, PageType::Data);
        page.insert_block(b"payload").unwrap();
        disk.write_data_page(&page).unwrap();

        let first = disk.read_data_page(3).unwrap();
        let second = disk.read_data_page(3).unwrap();
        assert_eq!(first.read_block(0).unwrap(), b"payload");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn missing_page_reads_as_fresh_empty() {
        let disk = memory_disk();
        let page = disk.read_data_page(9).unwrap();
        assert_eq!(page.page_id(), 9);
        assert_eq!(page.page_type().unwrap(), PageType::Empty);
    }

    #[test]
    fn log_append_positions_are_sequential() {
        let disk = memory_disk();
        let mut a = PageBuffer::new(1, PageType::Data);
        a.set_transaction_id(1);
        let mut b = PageBuffer::new(2, PageType::Data);
        b.set_transaction_id(1);
        b.set_confirmed(true);

        let positions = disk.append_log(&[a, b]).unwrap();
        assert_eq!(positions[0], (1, 0));
        assert_eq!(positions[1], (2, PAGE_SIZE as u64));
        assert_eq!(disk.log_page_count(), 2);

        let page = disk.read_log_page(PAGE_SIZE as u64).unwrap();
        assert_eq!(page.page_id(), 2);
        assert!(page.is_confirmed());
    }

    #[test]
    fn truncate_clears_log_state() {
        let disk = memory_disk();
        let page = PageBuffer::new(1, PageType::Data);
        disk.append_log(std::slice::from_ref(&page)).unwrap();
        disk.truncate_log().unwrap();
        assert_eq!(disk.log_page_count(), 0);
    }
}
