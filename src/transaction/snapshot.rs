//! Per-collection snapshot: the collection's metadata as seen by one
//! transaction, with the lock mode it was entered under.
//!
//! Read snapshots resolve pages at the transaction's read version; write
//! snapshots additionally hold the collection write lock, acquired when the
//! snapshot is opened.

use super::Transaction;
use crate::error::Result;
use crate::storage::collection_page::CollectionMeta;
use crate::storage::page::{PageId, PageType};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug)]
pub struct Snapshot {
    pub collection: String,
    pub mode: LockMode,
    /// None when the collection does not exist (read mode only).
    pub meta: Option<CollectionMeta>,
}

impl Snapshot {
    /// Open a snapshot over `collection`. In write mode the collection lock
    /// is taken first, so the metadata read below is stable.
    pub fn open(tx: &mut Transaction, collection: &str, mode: LockMode) -> Result<Snapshot> {
        if mode == LockMode::Write {
            tx.enter_collection_lock(collection)?;
        }
        let meta = match tx.resolve_collection(collection) {
            Some(page_id) => Some(Self::read_meta(tx, page_id)?),
            None => None,
        };
        Ok(Snapshot {
            collection: collection.to_string(),
            mode,
            meta,
        })
    }

    fn read_meta(tx: &mut Transaction, page_id: PageId) -> Result<CollectionMeta> {
        tx.with_page(page_id, |page| {
            page.expect(page_id, PageType::Collection)?;
            CollectionMeta::from_page(page)
        })
    }

    pub fn exists(&self) -> bool {
        self.meta.is_some()
    }

    pub fn meta(&self) -> Option<&CollectionMeta> {
        self.meta.as_ref()
    }

    pub fn meta_mut(&mut self) -> Option<&mut CollectionMeta> {
        self.meta.as_mut()
    }

    /// Persist the (possibly modified) metadata back into the collection
    /// page through the transaction.
    pub fn save(&self, tx: &mut Transaction) -> Result<()> {
        if let Some(meta) = &self.meta {
            let meta = meta.clone();
            tx.with_page_mut(meta.page_id, |page| meta.write_to(page))?;
        }
        Ok(())
    }
}
