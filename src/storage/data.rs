//! Data service: variable-length document storage as chains of data blocks
//! across data pages.
//!
//! Block layout inside a page slot: 1 continuation flag, 6 bytes next-block
//! address, then payload. A document that does not fit one page's free slot
//! is split across a chain.

use tracing::trace;

use super::collection_page::CollectionMeta;
use super::freelist;
use super::page::{PageAddress, PageId, PageType, EMPTY_PAGE_ID, MAX_BLOCK_SIZE};
use crate::error::{DbError, Result};
use crate::transaction::Transaction;

pub const DATA_BLOCK_HEADER: usize = 7;
/// Largest payload a single block can carry.
pub const MAX_DATA_PAYLOAD: usize = MAX_BLOCK_SIZE - DATA_BLOCK_HEADER;
/// Serialized documents above this size are rejected.
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

fn encode_block(next: PageAddress, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; DATA_BLOCK_HEADER + payload.len()];
    bytes[0] = (!next.is_empty()) as u8;
    next.write_to(&mut bytes[1..7]);
    bytes[7..].copy_from_slice(payload);
    bytes
}

fn decode_next(block: &[u8]) -> Result<PageAddress> {
    if block.len() < DATA_BLOCK_HEADER {
        return Err(DbError::corruption("data block shorter than its header"));
    }
    Ok(if block[0] != 0 {
        PageAddress::read_from(&block[1..7])
    } else {
        PageAddress::EMPTY
    })
}

// ============================================================================
// Insert
// ============================================================================

/// Store a serialized document, returning its head block address.
pub fn insert(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    bytes: &[u8],
) -> Result<PageAddress> {
    if bytes.len() > MAX_DOCUMENT_SIZE {
        return Err(DbError::validation(format!(
            "document of {} bytes exceeds the 16 MiB limit",
            bytes.len()
        )));
    }

    // chunk the payload back-to-front so every block knows its successor
    let chunks = split_chunks(tx, meta, bytes)?;
    let mut next = PageAddress::EMPTY;
    let mut head = PageAddress::EMPTY;
    for (page_id, chunk) in chunks.into_iter().rev() {
        let block = encode_block(next, chunk_slice(bytes, chunk));
        let index = tx.with_page_mut(page_id, |page| page.insert_block(&block))?;
        head = PageAddress::new(page_id, index);
        next = head;
        meta.free_data_list = freelist::ensure(tx, meta.free_data_list, page_id)?;
    }
    trace!(address = %head, len = bytes.len(), "document inserted");
    Ok(head)
}

/// Plan (page, byte-range) chunks for a payload, reserving capacity as it
/// goes. First-fit from the collection's free-data list, then fresh pages.
fn split_chunks(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    bytes: &[u8],
) -> Result<Vec<(PageId, (usize, usize))>> {
    let mut chunks = Vec::new();
    let mut offset = 0usize;
    let mut reserved: Vec<(PageId, usize)> = Vec::new();

    while offset < bytes.len() {
        let remaining = bytes.len() - offset;
        let page_id = pick_page(tx, meta, &reserved, remaining.min(MAX_DATA_PAYLOAD))?;
        let free = tx.with_page(page_id, |page| Ok(page.free_bytes()))?;
        let already: usize = reserved
            .iter()
            .filter(|(id, _)| *id == page_id)
            .map(|(_, used)| used + DATA_BLOCK_HEADER + 4)
            .sum();
        // free_bytes already reserves this insert's slot entry
        let capacity = free
            .saturating_sub(already)
            .saturating_sub(DATA_BLOCK_HEADER);
        if capacity == 0 {
            meta.free_data_list = freelist::remove(tx, meta.free_data_list, page_id)?;
            continue;
        }
        let take = capacity.min(remaining).min(MAX_DATA_PAYLOAD);
        chunks.push((page_id, (offset, offset + take)));
        reserved.push((page_id, take));
        offset += take;
    }
    Ok(chunks)
}

fn chunk_slice(bytes: &[u8], range: (usize, usize)) -> &[u8] {
    &bytes[range.0..range.1]
}

/// A page with room for at least `needed` payload bytes plus the block
/// overhead.
fn pick_page(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    reserved: &[(PageId, usize)],
    needed: usize,
) -> Result<PageId> {
    let want = needed + DATA_BLOCK_HEADER;
    // probe the head of the free list only; stale heads get dropped
    let mut probes = 0;
    while meta.free_data_list != EMPTY_PAGE_ID && probes < 4 {
        let head = meta.free_data_list;
        let free = tx.with_page(head, |page| {
            page.expect(head, PageType::Data)?;
            Ok(page.free_bytes())
        })?;
        let already: usize = reserved
            .iter()
            .filter(|(id, _)| *id == head)
            .map(|(_, used)| used + DATA_BLOCK_HEADER + 4)
            .sum();
        if free.saturating_sub(already) >= want.min(freelist::MIN_USEFUL_BYTES.max(64)) {
            return Ok(head);
        }
        meta.free_data_list = freelist::remove(tx, meta.free_data_list, head)?;
        probes += 1;
    }
    tx.alloc_page(PageType::Data, meta.page_id)
}

// ============================================================================
// Read
// ============================================================================

/// Reassemble a document's bytes by walking its block chain. The bounded
/// counter turns a corrupt cyclic chain into an error instead of a hang.
pub fn read(tx: &mut Transaction, address: PageAddress) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut current = address;
    let mut remaining = tx.max_item_count();

    while !current.is_empty() {
        if remaining == 0 {
            return Err(DbError::corruption(format!(
                "data block chain starting at {address} exceeds the item budget"
            )));
        }
        remaining -= 1;
        let next = tx.with_page(current.page_id, |page| {
            page.expect(current.page_id, PageType::Data)?;
            let block = page.read_block(current.index)?;
            bytes.extend_from_slice(&block[DATA_BLOCK_HEADER..]);
            decode_next(block)
        })?;
        current = next;
    }
    Ok(bytes)
}

// ============================================================================
// Update
// ============================================================================

/// Rewrite a document. In place when the new payload fits the existing
/// single block's page; otherwise the chain is rebuilt and the new head
/// address is returned for the caller to re-point index entries at.
pub fn update(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    address: PageAddress,
    bytes: &[u8],
) -> Result<PageAddress> {
    if bytes.len() > MAX_DOCUMENT_SIZE {
        return Err(DbError::validation(format!(
            "document of {} bytes exceeds the 16 MiB limit",
            bytes.len()
        )));
    }

    let (next, fits) = tx.with_page(address.page_id, |page| {
        let block = page.read_block(address.index)?;
        let next = decode_next(block)?;
        let old_payload = block.len() - DATA_BLOCK_HEADER;
        let grow = bytes.len().saturating_sub(old_payload);
        Ok((next, next.is_empty() && (grow == 0 || page.free_bytes() >= grow)))
    })?;

    if fits {
        let block = encode_block(PageAddress::EMPTY, bytes);
        tx.with_page_mut(address.page_id, |page| {
            page.update_block(address.index, &block)
        })?;
        meta.free_data_list = freelist::ensure(tx, meta.free_data_list, address.page_id)?;
        return Ok(address);
    }

    let _ = next;
    delete(tx, meta, address)?;
    insert(tx, meta, bytes)
}

// ============================================================================
// Delete
// ============================================================================

/// Free every block in a chain; pages left without items are returned to
/// the global empty list.
pub fn delete(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    address: PageAddress,
) -> Result<()> {
    let mut current = address;
    let mut remaining = tx.max_item_count();

    while !current.is_empty() {
        if remaining == 0 {
            return Err(DbError::corruption(format!(
                "data block chain starting at {address} exceeds the item budget"
            )));
        }
        remaining -= 1;
        let next = tx.with_page(current.page_id, |page| {
            decode_next(page.read_block(current.index)?)
        })?;
        let items_left = tx.with_page_mut(current.page_id, |page| {
            page.delete_block(current.index)?;
            Ok(page.items_count())
        })?;
        if items_left == 0 {
            meta.free_data_list = freelist::remove(tx, meta.free_data_list, current.page_id)?;
            tx.free_page(current.page_id)?;
        } else {
            meta.free_data_list = freelist::ensure(tx, meta.free_data_list, current.page_id)?;
        }
        current = next;
    }
    Ok(())
}

/// Every data page reachable from a block chain (for drop accounting).
pub fn chain_pages(tx: &mut Transaction, address: PageAddress) -> Result<Vec<PageId>> {
    let mut pages = Vec::new();
    let mut current = address;
    let mut remaining = tx.max_item_count();
    while !current.is_empty() {
        if remaining == 0 {
            return Err(DbError::corruption("data chain exceeds the item budget"));
        }
        remaining -= 1;
        pages.push(current.page_id);
        current = tx.with_page(current.page_id, |page| {
            decode_next(page.read_block(current.index)?)
        })?;
    }
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::config::EngineSettings;
    use crate::storage::disk::DiskService;
    use crate::storage::header::HeaderPage;
    use crate::storage::stream::StreamFactory;
    use crate::storage::wal::WalIndex;
    use crate::transaction::{EngineServices, Transaction, TransactionMode};
    use std::sync::Arc;

    fn setup() -> (Transaction, CollectionMeta) {
        let settings = EngineSettings::default();
        let factory = StreamFactory::new(settings.clone());
        let disk = DiskService::new(&factory, settings.cache_size).unwrap();
        let header = HeaderPage::create(&settings, [0u8; 16]);
        let services = Arc::new(EngineServices::new(disk, WalIndex::new(), header, settings));
        let mut tx =
            Transaction::new(services, TransactionMode::Write, false, CancellationToken::none())
                .unwrap();
        let page_id = tx.alloc_page(PageType::Collection, 0).unwrap();
        (tx, CollectionMeta::new(page_id, "docs"))
    }

    #[test]
    fn small_document_round_trip() {
        let (mut tx, mut meta) = setup();
        let payload = b"a tiny document".to_vec();
        let addr = insert(&mut tx, &mut meta, &payload).unwrap();
        assert_eq!(read(&mut tx, addr).unwrap(), payload);
        tx.rollback().unwrap();
    }

    #[test]
    fn oversized_document_spans_pages() {
        let (mut tx, mut meta) = setup();
        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let addr = insert(&mut tx, &mut meta, &payload).unwrap();
        let chain = chain_pages(&mut tx, addr).unwrap();
        assert!(chain.len() >= 5);
        assert_eq!(read(&mut tx, addr).unwrap(), payload);
        tx.rollback().unwrap();
    }

    #[test]
    fn exact_single_block_fit() {
        let (mut tx, mut meta) = setup();
        let payload = vec![9u8; MAX_DATA_PAYLOAD];
        let addr = insert(&mut tx, &mut meta, &payload).unwrap();
        assert_eq!(chain_pages(&mut tx, addr).unwrap().len(), 1);
        assert_eq!(read(&mut tx, addr).unwrap(), payload);
        tx.rollback().unwrap();
    }

    #[test]
    fn update_in_place_keeps_address() {
        let (mut tx, mut meta) = setup();
        let addr = insert(&mut tx, &mut meta, &vec![1u8; 500]).unwrap();
        let updated = update(&mut tx, &mut meta, addr, &vec![2u8; 600]).unwrap();
        assert_eq!(updated, addr);
        assert_eq!(read(&mut tx, addr).unwrap(), vec![2u8; 600]);
        tx.rollback().unwrap();
    }

    #[test]
    fn update_relocates_when_chain_needed() {
        let (mut tx, mut meta) = setup();
        let addr = insert(&mut tx, &mut meta, &vec![1u8; 100]).unwrap();
        // grow far past one page: the head must move
        let big = vec![3u8; MAX_DATA_PAYLOAD * 3];
        let updated = update(&mut tx, &mut meta, addr, &big).unwrap();
        assert_eq!(read(&mut tx, updated).unwrap(), big);
        tx.rollback().unwrap();
    }

    #[test]
    fn delete_frees_emptied_pages() {
        let (mut tx, mut meta) = setup();
        let addr = insert(&mut tx, &mut meta, &vec![5u8; MAX_DATA_PAYLOAD * 2]).unwrap();
        let pages = chain_pages(&mut tx, addr).unwrap();
        delete(&mut tx, &mut meta, addr).unwrap();
        for page_id in pages {
            let t = tx.with_page(page_id, |p| p.page_type()).unwrap();
            assert_eq!(t, PageType::Empty);
        }
        tx.rollback().unwrap();
    }

    #[test]
    fn document_size_cap() {
        let (mut tx, mut meta) = setup();
        let err = insert(&mut tx, &mut meta, &vec![0u8; MAX_DOCUMENT_SIZE + 1]).unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
        tx.rollback().unwrap();
    }
}
