//! Transactions: per-context page views with copy-on-write dirty tracking,
//! safepoint spill for arbitrarily large writes, and the commit protocol
//! that publishes a run of log pages behind a confirm marker.

pub mod lock;
pub mod snapshot;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

pub use lock::LockService;
pub use snapshot::{LockMode, Snapshot};

use crate::cancel::CancellationToken;
use crate::config::EngineSettings;
use crate::error::{DbError, Result};
use crate::storage::disk::DiskService;
use crate::storage::header::HeaderPage;
use crate::storage::page::{PageBuffer, PageId, PageType, EMPTY_PAGE_ID, PAGE_SIZE};
use crate::storage::wal::WalIndex;

/// Shared storage and lock services, frozen at engine construction.
pub struct EngineServices {
    pub disk: DiskService,
    pub wal: WalIndex,
    pub header: HeaderPage,
    pub locks: LockService,
    pub settings: EngineSettings,
    /// Temp-stream factory for sort spill.
    pub factory: crate::storage::stream::StreamFactory,
    /// Serializes commit/rollback publication (log append + wal confirm +
    /// header image).
    commit_lock: Mutex<()>,
}

impl EngineServices {
    pub fn new(
        disk: DiskService,
        wal: WalIndex,
        header: HeaderPage,
        settings: EngineSettings,
    ) -> Self {
        EngineServices {
            disk,
            wal,
            header,
            locks: LockService::new(),
            factory: crate::storage::stream::StreamFactory::new(settings.clone()),
            settings,
            commit_lock: Mutex::new(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    /// Query-only: shared gate, no collection locks.
    Read,
    /// Read-write: shared gate plus collection locks on first write.
    Write,
}

// ============================================================================
// Transaction
// ============================================================================

pub struct Transaction {
    id: u32,
    read_version: u32,
    mode: TransactionMode,
    explicit: bool,
    services: Arc<EngineServices>,
    cancel: CancellationToken,

    /// Copy-on-write pages modified by this transaction.
    dirty: HashMap<PageId, PageBuffer>,
    /// Transaction-local cache of clean page reads.
    local: HashMap<PageId, Arc<PageBuffer>>,
    /// Log positions of pages spilled at safepoints, append order preserved.
    spilled: Vec<(PageId, u64)>,
    spilled_pos: HashMap<PageId, u64>,

    /// Collection write locks held, in acquisition order.
    locked_collections: Vec<String>,
    /// Collections created inside this transaction; applied to the header
    /// registry as a deferred commit hook.
    pending_collections: Vec<(String, PageId)>,
    /// Collections dropped inside this transaction (exclusive scope).
    dropped_collections: Vec<String>,

    /// Pages allocated by extending the file; returned as empties on
    /// rollback.
    new_pages: Vec<PageId>,
    /// Pages freed by this transaction; chained into the global free list at
    /// commit so they become reusable only once confirmed.
    freed_pages: Vec<PageId>,

    header_dirty: bool,
    /// False for transactions running under the exclusive gate, which is
    /// held by the caller instead of the shared gate.
    holds_gate: bool,
    finalized: bool,
}

impl Transaction {
    pub fn new(
        services: Arc<EngineServices>,
        mode: TransactionMode,
        explicit: bool,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let timeout = services.header.pragmas.timeout_duration();
        services.locks.enter_transaction(timeout)?;
        Self::build(services, mode, explicit, cancel, true)
    }

    /// A write transaction inside an already-held exclusive scope; it never
    /// touches the main gate.
    pub fn new_in_exclusive(
        services: Arc<EngineServices>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Self::build(services, TransactionMode::Write, false, cancel, false)
    }

    fn build(
        services: Arc<EngineServices>,
        mode: TransactionMode,
        explicit: bool,
        cancel: CancellationToken,
        holds_gate: bool,
    ) -> Result<Self> {
        let id = services.header.next_transaction_id();
        let read_version = services.wal.current_version();
        trace!(id, read_version, ?mode, explicit, "transaction started");
        Ok(Transaction {
            id,
            read_version,
            mode,
            explicit,
            services,
            cancel,
            dirty: HashMap::new(),
            local: HashMap::new(),
            spilled: Vec::new(),
            spilled_pos: HashMap::new(),
            locked_collections: Vec::new(),
            pending_collections: Vec::new(),
            dropped_collections: Vec::new(),
            new_pages: Vec::new(),
            freed_pages: Vec::new(),
            header_dirty: false,
            holds_gate,
            finalized: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn read_version(&self) -> u32 {
        self.read_version
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    /// Bounded traversal counter for corrupt-chain detection.
    pub fn max_item_count(&self) -> u64 {
        let data_bytes = self.services.disk.data_len().unwrap_or(0);
        let log_bytes = self.services.disk.log_page_count() * PAGE_SIZE as u64;
        ((data_bytes + log_bytes) / PAGE_SIZE as u64 + 10) * 255
    }

    // ------------------------------------------------------------------
    // Collection registry view
    // ------------------------------------------------------------------

    /// Resolve a collection to its page, seeing this transaction's own
    /// pending creations first.
    pub fn resolve_collection(&self, name: &str) -> Option<PageId> {
        if let Some((_, page_id)) = self
            .pending_collections
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            return Some(*page_id);
        }
        if self
            .dropped_collections
            .iter()
            .any(|n| n.eq_ignore_ascii_case(name))
        {
            return None;
        }
        self.services.header.get_collection_page(name)
    }

    pub fn add_pending_collection(&mut self, name: &str, page_id: PageId) {
        self.pending_collections.push((name.to_string(), page_id));
        self.header_dirty = true;
    }

    pub fn mark_collection_dropped(&mut self, name: &str) {
        self.dropped_collections.push(name.to_string());
        self.header_dirty = true;
    }

    pub fn mark_header_dirty(&mut self) {
        self.header_dirty = true;
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    pub fn enter_collection_lock(&mut self, name: &str) -> Result<()> {
        if self.mode != TransactionMode::Write {
            return Err(DbError::Concurrency(
                "write lock requested inside a read-only transaction".to_string(),
            ));
        }
        let key = name.to_ascii_lowercase();
        if self.locked_collections.contains(&key) {
            return Ok(());
        }
        let timeout = self.services.header.pragmas.timeout_duration();
        self.services.locks.enter_collection(&key, timeout)?;
        self.locked_collections.push(key);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Page access
    // ------------------------------------------------------------------

    fn fetch_clean(&self, page_id: PageId) -> Result<Arc<PageBuffer>> {
        if let Some(&position) = self.spilled_pos.get(&page_id) {
            return self.services.disk.read_log_page(position);
        }
        if let Some(position) = self
            .services
            .wal
            .get_page_position(page_id, self.read_version)
        {
            return self.services.disk.read_log_page(position);
        }
        self.services.disk.read_data_page(page_id)
    }

    /// Read-only page view: dirty set, then spilled/log versions at the
    /// snapshot version, then the data file.
    pub fn with_page<R>(
        &mut self,
        page_id: PageId,
        f: impl FnOnce(&PageBuffer) -> Result<R>,
    ) -> Result<R> {
        if let Some(page) = self.dirty.get(&page_id) {
            return f(page);
        }
        if let Some(page) = self.local.get(&page_id) {
            return f(page);
        }
        let page = self.fetch_clean(page_id)?;
        let result = f(&page);
        self.local.insert(page_id, page);
        result
    }

    /// Writable page view; clones the current version into the dirty set on
    /// first touch.
    pub fn with_page_mut<R>(
        &mut self,
        page_id: PageId,
        f: impl FnOnce(&mut PageBuffer) -> Result<R>,
    ) -> Result<R> {
        debug_assert_ne!(page_id, 0, "header page is written only at commit");
        if self.mode != TransactionMode::Write {
            return Err(DbError::Concurrency(
                "page write inside a read-only transaction".to_string(),
            ));
        }
        if !self.dirty.contains_key(&page_id) {
            let source = match self.local.remove(&page_id) {
                Some(page) => page,
                None => self.fetch_clean(page_id)?,
            };
            let mut page = (*source).clone();
            page.set_transaction_id(self.id);
            page.set_confirmed(false);
            self.dirty.insert(page_id, page);
        }
        f(self.dirty.get_mut(&page_id).expect("inserted above"))
    }

    pub fn dirty_page_count(&self) -> usize {
        self.dirty.len()
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate a page: reuse the global empty list when possible, extend
    /// the file otherwise.
    pub fn alloc_page(&mut self, page_type: PageType, collection_id: u32) -> Result<PageId> {
        let services = self.services.clone();
        let header = &services.header;
        let page_id = loop {
            let head = header.free_empty_list();
            if head == EMPTY_PAGE_ID {
                let id = header.extend_page_id();
                self.check_size_limit(id)?;
                self.new_pages.push(id);
                break id;
            }
            let next = self.with_page(head, |page| {
                if page.page_type()? != PageType::Empty {
                    return Err(DbError::corruption(format!(
                        "free-list page {head} is not empty"
                    )));
                }
                Ok(page.next_free_page_id())
            })?;
            if header.pop_free_empty(head, next) {
                self.local.remove(&head);
                break head;
            }
            // another transaction won the head; retry
        };

        let mut page = PageBuffer::new(page_id, page_type);
        page.set_transaction_id(self.id);
        page.set_collection_id(collection_id);
        self.dirty.insert(page_id, page);
        self.header_dirty = true;
        Ok(page_id)
    }

    fn check_size_limit(&self, page_id: PageId) -> Result<()> {
        let limit = self
            .services
            .header
            .pragmas
            .limit_size
            .load(std::sync::atomic::Ordering::Relaxed);
        if limit > 0 && (page_id as u64 + 1) * PAGE_SIZE as u64 > limit {
            return Err(DbError::validation(format!(
                "database reached the LIMIT_SIZE of {limit} bytes"
            )));
        }
        Ok(())
    }

    /// Free a page: its empty image joins this transaction's run and the
    /// global free list only once the commit is confirmed.
    pub fn free_page(&mut self, page_id: PageId) -> Result<()> {
        self.with_page_mut(page_id, |page| {
            page.mark_empty();
            Ok(())
        })?;
        // re-stamp after mark_empty cleared the header fields
        if let Some(page) = self.dirty.get_mut(&page_id) {
            page.set_transaction_id(self.id);
        }
        self.freed_pages.push(page_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Safepoint
    // ------------------------------------------------------------------

    /// Called between document-level operations in bulk work: observes
    /// cancellation and spills the dirty set to the log (unconfirmed) under
    /// memory pressure.
    pub fn safepoint(&mut self) -> Result<()> {
        self.cancel.check()?;
        if self.dirty.len() >= self.services.settings.max_transaction_pages {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        // freed pages stay resident: commit still has to chain them into
        // the global empty list before the run is published
        let spillable: Vec<PageId> = self
            .dirty
            .keys()
            .copied()
            .filter(|id| !self.freed_pages.contains(id))
            .collect();
        if spillable.is_empty() {
            return Ok(());
        }
        let pages: Vec<PageBuffer> = spillable
            .iter()
            .filter_map(|id| self.dirty.remove(id))
            .collect();
        let positions = self.services.disk.append_log(&pages)?;
        debug!(
            id = self.id,
            pages = positions.len(),
            "safepoint spilled dirty pages to log"
        );
        for (page_id, position) in positions {
            self.spilled.push((page_id, position));
            self.spilled_pos.insert(page_id, position);
        }
        self.local.clear();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit / rollback
    // ------------------------------------------------------------------

    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;

        let has_writes = !self.dirty.is_empty()
            || !self.spilled.is_empty()
            || self.header_dirty
            || !self.freed_pages.is_empty();

        if has_writes {
            self.publish_commit()?;
        }
        self.finalize();
        trace!(id = self.id, "transaction committed");
        Ok(())
    }

    fn publish_commit(&mut self) -> Result<()> {
        let services = self.services.clone();
        let _guard = services.commit_lock.lock();
        let header = &services.header;

        // deferred registry hooks
        for (name, page_id) in self.pending_collections.drain(..) {
            header.insert_collection(&name, page_id)?;
        }
        for name in self.dropped_collections.drain(..) {
            header.delete_collection(&name);
        }

        // freed pages become the new head of the global empty list; they are
        // only reachable after this commit's confirm marker lands
        if !self.freed_pages.is_empty() {
            let old_head = header.free_empty_list();
            let freed = std::mem::take(&mut self.freed_pages);
            for window in freed.windows(2) {
                let (page_id, next) = (window[0], window[1]);
                if let Some(page) = self.dirty.get_mut(&page_id) {
                    page.set_next_free_page_id(next);
                }
            }
            if let Some(&last) = freed.last() {
                if let Some(page) = self.dirty.get_mut(&last) {
                    page.set_next_free_page_id(old_head);
                }
            }
            header.set_free_empty_list(freed[0]);
            self.header_dirty = true;
        }

        // assemble the run: dirty pages, then the confirm marker
        let mut run: Vec<PageBuffer> = self.dirty.drain().map(|(_, page)| page).collect();
        if self.header_dirty {
            let mut header_page = header.to_page();
            header_page.set_transaction_id(self.id);
            header_page.set_confirmed(true);
            run.push(header_page);
        } else if let Some(last) = run.last_mut() {
            last.set_confirmed(true);
        } else {
            // everything was spilled: emit a standalone confirm marker by
            // re-appending the header image
            let mut header_page = header.to_page();
            header_page.set_transaction_id(self.id);
            header_page.set_confirmed(true);
            run.push(header_page);
        }

        let appended = services.disk.append_log(&run)?;
        let mut positions = std::mem::take(&mut self.spilled);
        positions.extend(appended);
        services.wal.confirm_transaction(&positions);
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active()?;

        // new pages allocated by extending the file are handed to the free
        // list through a confirmed system transaction
        if !self.new_pages.is_empty() {
            let services = self.services.clone();
            let _guard = services.commit_lock.lock();
            let header = &services.header;
            let system_id = header.next_transaction_id();
            let new_pages = std::mem::take(&mut self.new_pages);
            let old_head = header.free_empty_list();

            let mut run = Vec::with_capacity(new_pages.len() + 1);
            for (i, &page_id) in new_pages.iter().enumerate() {
                let mut page = PageBuffer::new(page_id, PageType::Empty);
                page.set_transaction_id(system_id);
                let next = new_pages.get(i + 1).copied().unwrap_or(old_head);
                page.set_next_free_page_id(next);
                run.push(page);
            }
            header.set_free_empty_list(new_pages[0]);

            let mut header_page = header.to_page();
            header_page.set_transaction_id(system_id);
            header_page.set_confirmed(true);
            run.push(header_page);

            let positions = services.disk.append_log(&run)?;
            services.wal.confirm_transaction(&positions);
            debug!(
                id = self.id,
                returned = new_pages.len(),
                "rollback returned extended pages to the free list"
            );
        }

        // dirty and spilled pages are simply abandoned; recovery skips
        // unconfirmed runs and checkpoint truncation reclaims the space
        self.dirty.clear();
        self.spilled.clear();
        self.spilled_pos.clear();
        self.pending_collections.clear();
        self.dropped_collections.clear();
        self.freed_pages.clear();
        self.finalize();
        trace!(id = self.id, "transaction rolled back");
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.finalized {
            return Err(DbError::Concurrency(
                "transaction already finalized".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Release locks in reverse acquisition order, then leave the gate.
    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.local.clear();
        for name in self.locked_collections.drain(..).rev() {
            self.services.locks.exit_collection(&name);
        }
        if self.holds_gate {
            self.services.locks.exit_transaction();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finalized {
            warn!(id = self.id, "transaction dropped without finalize; rolling back");
            let _ = self.rollback();
        }
    }
}

// ============================================================================
// Per-thread transaction monitor
// ============================================================================

/// Binds explicit transactions to their creating thread, the way the public
/// begin/commit/rollback surface expects.
#[derive(Default)]
pub struct TransactionMonitor {
    slots: Mutex<HashMap<ThreadId, Arc<Mutex<Transaction>>>>,
}

impl TransactionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<Mutex<Transaction>>> {
        self.slots.lock().get(&thread::current().id()).cloned()
    }

    /// Register an explicit transaction for this thread; `false` when one is
    /// already open.
    pub fn register(&self, tx: Arc<Mutex<Transaction>>) -> bool {
        let mut slots = self.slots.lock();
        match slots.entry(thread::current().id()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(tx);
                true
            }
        }
    }

    pub fn take(&self) -> Option<Arc<Mutex<Transaction>>> {
        self.slots.lock().remove(&thread::current().id())
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().len()
    }
}
