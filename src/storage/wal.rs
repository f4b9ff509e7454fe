//! WAL index and checkpoint.
//!
//! Transactions append their dirty pages to the log; the last page of the
//! run carries the confirmed flag (the confirm marker). This service maps
//! each page id to its confirmed versions in the log so readers at a fixed
//! version see a consistent snapshot, rebuilds that map from the log on
//! open, and relocates confirmed pages into the data file on checkpoint.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::disk::DiskService;
use super::header::HeaderPage;
use super::page::{PageBuffer, PageId};
use crate::error::Result;

pub struct WalIndex {
    /// page id -> (version, log position), ascending by version.
    index: RwLock<HashMap<PageId, Vec<(u32, u64)>>>,
    /// Version of the latest committed transaction; readers snapshot this.
    current_version: RwLock<u32>,
}

impl Default for WalIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl WalIndex {
    pub fn new() -> Self {
        WalIndex {
            index: RwLock::new(HashMap::new()),
            current_version: RwLock::new(0),
        }
    }

    pub fn current_version(&self) -> u32 {
        *self.current_version.read()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Latest log position of `page_id` at or below `version`.
    pub fn get_page_position(&self, page_id: PageId, version: u32) -> Option<u64> {
        let index = self.index.read();
        let versions = index.get(&page_id)?;
        versions
            .iter()
            .rev()
            .find(|(v, _)| *v <= version)
            .map(|(_, pos)| *pos)
    }

    /// Publish a committed transaction's pages under a fresh version.
    /// Returns the new read version.
    pub fn confirm_transaction(&self, positions: &[(PageId, u64)]) -> u32 {
        let mut current = self.current_version.write();
        let version = *current + 1;
        let mut index = self.index.write();
        for &(page_id, position) in positions {
            // within one transaction the last write of a page wins
            let versions = index.entry(page_id).or_default();
            match versions.last_mut() {
                Some(last) if last.0 == version => last.1 = position,
                _ => versions.push((version, position)),
            }
        }
        *current = version;
        version
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Rebuild the index from the log after open. Pages belonging to
    /// transactions without a confirm marker are ignored; replay is
    /// idempotent by page id.
    pub fn restore(&self, disk: &DiskService) -> Result<()> {
        let mut pending: HashMap<u32, Vec<(PageId, u64)>> = HashMap::new();
        let mut confirmed_runs: Vec<Vec<(PageId, u64)>> = Vec::new();

        disk.scan_log(|position, page: &PageBuffer| {
            let txn_id = page.transaction_id();
            pending
                .entry(txn_id)
                .or_default()
                .push((page.page_id(), position));
            if page.is_confirmed() {
                if let Some(run) = pending.remove(&txn_id) {
                    confirmed_runs.push(run);
                }
            }
            Ok(())
        })?;

        for run in confirmed_runs {
            self.confirm_transaction(&run);
        }
        if !pending.is_empty() {
            debug!(
                aborted = pending.len(),
                "discarded unconfirmed transactions during log restore"
            );
        }
        if !self.is_empty() {
            info!(
                version = self.current_version(),
                "wal index restored from log"
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Checkpoint
    // ------------------------------------------------------------------

    /// Copy the newest confirmed version of every indexed page into the data
    /// file, truncate the log and reset the index. The caller holds the
    /// exclusive gate, so no reader or writer is active.
    pub fn checkpoint(&self, disk: &DiskService, header: &HeaderPage) -> Result<usize> {
        let targets: Vec<(PageId, u64)> = {
            let index = self.index.read();
            index
                .iter()
                .filter_map(|(page_id, versions)| {
                    versions.last().map(|(_, pos)| (*page_id, *pos))
                })
                .collect()
        };

        if targets.is_empty() {
            return Ok(0);
        }

        for &(page_id, position) in &targets {
            let page = disk.read_log_page(position)?;
            let mut home = (*page).clone();
            // identity checks and transaction markers do not survive the
            // move to the data file
            home.set_transaction_id(0);
            home.set_confirmed(false);
            debug_assert_eq!(home.page_id(), page_id);
            disk.write_data_page(&home)?;
        }
        disk.flush_data()?;
        disk.truncate_log()?;
        self.index.write().clear();
        header.set_checkpoint_lsn(self.current_version());

        info!(pages = targets.len(), "checkpoint complete");
        Ok(targets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::storage::page::{PageType, PAGE_SIZE};
    use crate::storage::stream::StreamFactory;

    fn disk() -> DiskService {
        let factory = StreamFactory::new(EngineSettings::default());
        DiskService::new(&factory, PAGE_SIZE * 32).unwrap()
    }

    fn log_page(page_id: u32, txn: u32, confirmed: bool, payload: &[u8]) -> PageBuffer {
        let mut page = PageBuffer::new(page_id, PageType::Data);
        page.set_transaction_id(txn);
        page.set_confirmed(confirmed);
        page.insert_block(payload).unwrap();
        page
    }

    #[test]
    fn versions_resolve_by_snapshot() {
        let wal = WalIndex::new();
        let v1 = wal.confirm_transaction(&[(5, 0)]);
        let v2 = wal.confirm_transaction(&[(5, 8192)]);
        assert_eq!((v1, v2), (1, 2));
        assert_eq!(wal.get_page_position(5, 1), Some(0));
        assert_eq!(wal.get_page_position(5, 2), Some(8192));
        assert_eq!(wal.get_page_position(5, 0), None);
        assert_eq!(wal.get_page_position(9, 2), None);
    }

    #[test]
    fn restore_skips_unconfirmed_runs() {
        let d = disk();
        // txn 1 confirmed, txn 2 crashed before its marker
        d.append_log(&[
            log_page(3, 1, false, b"a"),
            log_page(4, 1, true, b"b"),
            log_page(5, 2, false, b"c"),
        ])
        .unwrap();

        let wal = WalIndex::new();
        wal.restore(&d).unwrap();
        assert_eq!(wal.current_version(), 1);
        assert!(wal.get_page_position(3, 1).is_some());
        assert!(wal.get_page_position(4, 1).is_some());
        assert!(wal.get_page_position(5, 1).is_none());
    }

    #[test]
    fn checkpoint_moves_pages_home_and_is_idempotent() {
        let d = disk();
        let settings = EngineSettings::default();
        let header = HeaderPage::create(&settings, [0u8; 16]);

        let positions = d.append_log(&[log_page(2, 1, true, b"hello")]).unwrap();
        let wal = WalIndex::new();
        wal.confirm_transaction(&positions);

        assert_eq!(wal.checkpoint(&d, &header).unwrap(), 1);
        let page = d.read_data_page(2).unwrap();
        assert_eq!(page.read_block(0).unwrap(), b"hello");
        assert_eq!(page.transaction_id(), 0);
        assert!(!page.is_confirmed());
        assert_eq!(d.log_page_count(), 0);

        // second checkpoint has nothing to do
        assert_eq!(wal.checkpoint(&d, &header).unwrap(), 0);
    }
}
