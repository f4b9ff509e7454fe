//! Doubly-linked free-space lists over page prev/next header fields.
//!
//! Collections keep one list per page kind (data, index, per-vector-index)
//! whose members still have usable free space. A page is in a list iff it is
//! the head or has a neighbor link set; data content is untouched by
//! membership changes.

use super::page::{PageId, EMPTY_PAGE_ID};
use crate::error::Result;
use crate::transaction::Transaction;

/// Below this many free bytes a page leaves its free list.
pub const MIN_USEFUL_BYTES: usize = 128;

pub fn in_list(tx: &mut Transaction, head: PageId, page_id: PageId) -> Result<bool> {
    if head == page_id {
        return Ok(true);
    }
    tx.with_page(page_id, |page| {
        Ok(page.prev_page_id() != EMPTY_PAGE_ID || page.next_page_id() != EMPTY_PAGE_ID)
    })
}

/// Push `page_id` onto the front; returns the new head.
pub fn push(tx: &mut Transaction, head: PageId, page_id: PageId) -> Result<PageId> {
    if in_list(tx, head, page_id)? {
        return Ok(head);
    }
    tx.with_page_mut(page_id, |page| {
        page.set_prev_page_id(EMPTY_PAGE_ID);
        page.set_next_page_id(head);
        Ok(())
    })?;
    if head != EMPTY_PAGE_ID {
        tx.with_page_mut(head, |page| {
            page.set_prev_page_id(page_id);
            Ok(())
        })?;
    }
    Ok(page_id)
}

/// Unlink `page_id`; returns the new head.
pub fn remove(tx: &mut Transaction, head: PageId, page_id: PageId) -> Result<PageId> {
    if !in_list(tx, head, page_id)? {
        return Ok(head);
    }
    let (prev, next) = tx.with_page(page_id, |page| {
        Ok((page.prev_page_id(), page.next_page_id()))
    })?;
    if prev != EMPTY_PAGE_ID {
        tx.with_page_mut(prev, |page| {
            page.set_next_page_id(next);
            Ok(())
        })?;
    }
    if next != EMPTY_PAGE_ID {
        tx.with_page_mut(next, |page| {
            page.set_prev_page_id(prev);
            Ok(())
        })?;
    }
    tx.with_page_mut(page_id, |page| {
        page.set_prev_page_id(EMPTY_PAGE_ID);
        page.set_next_page_id(EMPTY_PAGE_ID);
        Ok(())
    })?;
    Ok(if head == page_id { next } else { head })
}

/// Reconcile membership with the page's current free space; returns the new
/// head.
pub fn ensure(tx: &mut Transaction, head: PageId, page_id: PageId) -> Result<PageId> {
    let free = tx.with_page(page_id, |page| Ok(page.free_bytes()))?;
    if free >= MIN_USEFUL_BYTES {
        push(tx, head, page_id)
    } else {
        remove(tx, head, page_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::config::EngineSettings;
    use crate::storage::disk::DiskService;
    use crate::storage::header::HeaderPage;
    use crate::storage::page::PageType;
    use crate::storage::stream::StreamFactory;
    use crate::storage::wal::WalIndex;
    use crate::transaction::{EngineServices, Transaction, TransactionMode};
    use std::sync::Arc;

    fn tx() -> Transaction {
        let settings = EngineSettings::default();
        let factory = StreamFactory::new(settings.clone());
        let disk = DiskService::new(&factory, settings.cache_size).unwrap();
        let header = HeaderPage::create(&settings, [0u8; 16]);
        let services = Arc::new(EngineServices::new(disk, WalIndex::new(), header, settings));
        Transaction::new(services, TransactionMode::Write, false, CancellationToken::none())
            .unwrap()
    }

    #[test]
    fn push_remove_middle_and_head() {
        let mut t = tx();
        let a = t.alloc_page(PageType::Data, 1).unwrap();
        let b = t.alloc_page(PageType::Data, 1).unwrap();
        let c = t.alloc_page(PageType::Data, 1).unwrap();

        let mut head = EMPTY_PAGE_ID;
        head = push(&mut t, head, a).unwrap();
        head = push(&mut t, head, b).unwrap();
        head = push(&mut t, head, c).unwrap();
        assert_eq!(head, c);

        // remove the middle element
        head = remove(&mut t, head, b).unwrap();
        assert_eq!(head, c);
        assert!(!in_list(&mut t, head, b).unwrap());
        assert!(in_list(&mut t, head, a).unwrap());

        // remove the head
        head = remove(&mut t, head, c).unwrap();
        assert_eq!(head, a);
        head = remove(&mut t, head, a).unwrap();
        assert_eq!(head, EMPTY_PAGE_ID);
        t.rollback().unwrap();
    }

    #[test]
    fn push_is_idempotent() {
        let mut t = tx();
        let a = t.alloc_page(PageType::Data, 1).unwrap();
        let head = push(&mut t, EMPTY_PAGE_ID, a).unwrap();
        let again = push(&mut t, head, a).unwrap();
        assert_eq!(head, again);
        t.rollback().unwrap();
    }
}
