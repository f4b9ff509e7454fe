//! Persisted skip-list index.
//!
//! Nodes live in the slotted store of Index pages. Every index owns head and
//! tail sentinel nodes (Min/Max keys) at the full 32 levels; real nodes draw
//! their level from a geometric distribution (p = 0.5). Nodes of one
//! document link across indexes through `next_node`, which is what lets a
//! delete remove every secondary entry in one pass from the PK node.

use rand::Rng;
use tracing::trace;

use crate::bson::{codec, Value};
use crate::config::Collation;
use crate::error::{DbError, Result};
use crate::storage::collection_page::{CollectionMeta, IndexInfo, MAX_INDEX_KEY_SIZE, MAX_LEVELS};
use crate::storage::freelist;
use crate::storage::page::{PageAddress, PageBuffer, PageType, EMPTY_PAGE_ID};
use crate::transaction::Transaction;

const NODE_FIXED_HEADER: usize = 14;

// ============================================================================
// IndexNode
// ============================================================================

/// In-memory image of one skip-list node. The on-disk size is fixed by its
/// level count and key, so rewrites are always in place.
#[derive(Clone, Debug)]
pub struct IndexNode {
    pub address: PageAddress,
    /// Which of the collection's indexes this node belongs to.
    pub slot: u8,
    pub levels: u8,
    pub key: Value,
    pub data_block: PageAddress,
    /// Next index node of the same document (PK node first).
    pub next_node: PageAddress,
    pub prev: Vec<PageAddress>,
    pub next: Vec<PageAddress>,
}

impl IndexNode {
    fn new(slot: u8, levels: u8, key: Value) -> Self {
        IndexNode {
            address: PageAddress::EMPTY,
            slot,
            levels,
            key,
            data_block: PageAddress::EMPTY,
            next_node: PageAddress::EMPTY,
            prev: vec![PageAddress::EMPTY; levels as usize],
            next: vec![PageAddress::EMPTY; levels as usize],
        }
    }

    fn serialized_len(&self) -> usize {
        NODE_FIXED_HEADER + 12 * self.levels as usize + codec::value_len(&self.key)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.serialized_len()];
        bytes[0] = self.slot;
        bytes[1] = self.levels;
        self.data_block.write_to(&mut bytes[2..8]);
        self.next_node.write_to(&mut bytes[8..14]);
        let mut pos = NODE_FIXED_HEADER;
        for level in 0..self.levels as usize {
            self.prev[level].write_to(&mut bytes[pos..pos + 6]);
            self.next[level].write_to(&mut bytes[pos + 6..pos + 12]);
            pos += 12;
        }
        let mut key_bytes = Vec::with_capacity(codec::value_len(&self.key));
        codec::write_value(&mut key_bytes, &self.key);
        bytes[pos..pos + key_bytes.len()].copy_from_slice(&key_bytes);
        bytes
    }

    fn read(page: &PageBuffer, address: PageAddress) -> Result<IndexNode> {
        let block = page.read_block(address.index)?;
        if block.len() < NODE_FIXED_HEADER {
            return Err(DbError::corruption("index node shorter than its header"));
        }
        let slot = block[0];
        let levels = block[1];
        if levels == 0 || levels > MAX_LEVELS {
            return Err(DbError::corruption(format!(
                "index node at {address} has invalid level count {levels}"
            )));
        }
        let data_block = PageAddress::read_from(&block[2..8]);
        let next_node = PageAddress::read_from(&block[8..14]);
        let mut prev = Vec::with_capacity(levels as usize);
        let mut next = Vec::with_capacity(levels as usize);
        let mut pos = NODE_FIXED_HEADER;
        for _ in 0..levels {
            prev.push(PageAddress::read_from(&block[pos..pos + 6]));
            next.push(PageAddress::read_from(&block[pos + 6..pos + 12]));
            pos += 12;
        }
        let (key, _) = codec::deserialize_value(&block[pos..])?;
        Ok(IndexNode {
            address,
            slot,
            levels,
            key,
            data_block,
            next_node,
            prev,
            next,
        })
    }
}

pub fn read_node(tx: &mut Transaction, address: PageAddress) -> Result<IndexNode> {
    tx.with_page(address.page_id, |page| {
        page.expect(address.page_id, PageType::Index)?;
        IndexNode::read(page, address)
    })
}

fn write_node(tx: &mut Transaction, node: &IndexNode) -> Result<()> {
    let bytes = node.to_bytes();
    tx.with_page_mut(node.address.page_id, |page| {
        page.update_block(node.address.index, &bytes)
    })
}

// ============================================================================
// Index creation / key validation
// ============================================================================

/// Allocate head/tail sentinels and return the filled descriptor.
pub fn create_index(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    slot: u8,
    name: &str,
    expression: crate::expr::Expression,
    unique: bool,
) -> Result<IndexInfo> {
    let mut head = IndexNode::new(slot, MAX_LEVELS, Value::MinValue);
    let mut tail = IndexNode::new(slot, MAX_LEVELS, Value::MaxValue);

    let head_addr = store_node(tx, meta, &head)?;
    head.address = head_addr;
    let tail_addr = store_node(tx, meta, &tail)?;
    tail.address = tail_addr;

    for level in 0..MAX_LEVELS as usize {
        head.next[level] = tail.address;
        tail.prev[level] = head.address;
    }
    write_node(tx, &head)?;
    write_node(tx, &tail)?;

    trace!(index = name, slot, "index created");
    Ok(IndexInfo {
        slot,
        name: name.to_string(),
        expression,
        unique,
        head: head.address,
        tail: tail.address,
    })
}

pub fn validate_key(key: &Value) -> Result<()> {
    if matches!(key, Value::MinValue | Value::MaxValue) {
        return Err(DbError::validation("Min/Max values cannot be index keys"));
    }
    let len = codec::value_len(key);
    if len > MAX_INDEX_KEY_SIZE {
        return Err(DbError::validation(format!(
            "index key of {len} bytes exceeds the {MAX_INDEX_KEY_SIZE}-byte limit"
        )));
    }
    Ok(())
}

/// Place a node's bytes on an index page: free list first, fresh page
/// otherwise.
fn store_node(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    node: &IndexNode,
) -> Result<PageAddress> {
    let bytes = node.to_bytes();
    let mut probes = 0;
    let page_id = loop {
        let head = meta.free_index_list;
        if head == EMPTY_PAGE_ID || probes >= 4 {
            break tx.alloc_page(PageType::Index, meta.page_id)?;
        }
        let fits = tx.with_page(head, |page| {
            page.expect(head, PageType::Index)?;
            Ok(page.can_insert(bytes.len()))
        })?;
        if fits {
            break head;
        }
        meta.free_index_list = freelist::remove(tx, meta.free_index_list, head)?;
        probes += 1;
    };
    let index = tx.with_page_mut(page_id, |page| page.insert_block(&bytes))?;
    meta.free_index_list = freelist::ensure(tx, meta.free_index_list, page_id)?;
    Ok(PageAddress::new(page_id, index))
}

// ============================================================================
// Level draw
// ============================================================================

fn random_level() -> u8 {
    let mut level = 1u8;
    let mut rng = rand::rng();
    while level < MAX_LEVELS && rng.random::<f64>() < 0.5 {
        level += 1;
    }
    level
}

// ============================================================================
// Search
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// Exact lookup. With `sibling`, a miss returns the nearest neighbor in the
/// given order instead of None (range-scan start point).
pub fn find(
    tx: &mut Transaction,
    index: &IndexInfo,
    collation: &Collation,
    key: &Value,
    sibling: bool,
    order: Order,
) -> Result<Option<IndexNode>> {
    let mut current = read_node(tx, index.head)?;
    let mut counter = tx.max_item_count();

    for level in (0..MAX_LEVELS as usize).rev() {
        loop {
            if counter == 0 {
                return Err(DbError::corruption("Detected loop in Find"));
            }
            counter -= 1;
            if level >= current.levels as usize {
                break;
            }
            let next_addr = current.next[level];
            if next_addr.is_empty() || next_addr == index.tail {
                break;
            }
            let next = read_node(tx, next_addr)?;
            if next.key.total_cmp(key, collation) == std::cmp::Ordering::Less {
                current = next;
            } else {
                break;
            }
        }
    }

    // current is the greatest node strictly below key
    let candidate_addr = current.next[0];
    if candidate_addr != index.tail && !candidate_addr.is_empty() {
        let candidate = read_node(tx, candidate_addr)?;
        if candidate.key.total_cmp(key, collation) == std::cmp::Ordering::Equal {
            return Ok(Some(candidate));
        }
        if sibling && order == Order::Ascending {
            // first node at or above key
            return Ok(Some(candidate));
        }
    }
    if sibling && order == Order::Descending && current.address != index.head {
        // last node at or below key
        return Ok(Some(current));
    }
    Ok(None)
}

/// Advance along level 0 in the given order; sentinels terminate.
pub fn next_in_order(
    tx: &mut Transaction,
    index: &IndexInfo,
    node: &IndexNode,
    order: Order,
) -> Result<Option<IndexNode>> {
    let addr = match order {
        Order::Ascending => node.next[0],
        Order::Descending => node.prev[0],
    };
    if addr.is_empty() || addr == index.head || addr == index.tail {
        return Ok(None);
    }
    Ok(Some(read_node(tx, addr)?))
}

/// First real node in order (after the head sentinel / before the tail).
pub fn first(
    tx: &mut Transaction,
    index: &IndexInfo,
    order: Order,
) -> Result<Option<IndexNode>> {
    let sentinel = match order {
        Order::Ascending => read_node(tx, index.head)?,
        Order::Descending => read_node(tx, index.tail)?,
    };
    next_in_order(tx, index, &sentinel, order)
}

/// Complete ordered traversal; a cycle fails cleanly instead of hanging.
pub fn find_all(
    tx: &mut Transaction,
    index: &IndexInfo,
    order: Order,
) -> Result<Vec<IndexNode>> {
    let mut nodes = Vec::new();
    let mut counter = tx.max_item_count();
    let mut current = first(tx, index, order)?;
    while let Some(node) = current {
        if counter == 0 {
            return Err(DbError::corruption("Detected loop in FindAll"));
        }
        counter -= 1;
        current = next_in_order(tx, index, &node, order)?;
        nodes.push(node);
    }
    Ok(nodes)
}

// ============================================================================
// Insert
// ============================================================================

/// Insert a key for a document. `last_node` is the document's most recently
/// added index node; the new node is linked into that chain. Duplicate keys
/// on a unique index fail; multikey indexes call this once per key element.
pub fn insert(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    index: &IndexInfo,
    collation: &Collation,
    key: Value,
    data_block: PageAddress,
    last_node: Option<PageAddress>,
) -> Result<IndexNode> {
    validate_key(&key)?;

    // collect the insertion frontier at every level
    let mut prevs = [PageAddress::EMPTY; MAX_LEVELS as usize];
    let mut current = read_node(tx, index.head)?;
    let mut counter = tx.max_item_count();

    for level in (0..MAX_LEVELS as usize).rev() {
        loop {
            if counter == 0 {
                return Err(DbError::corruption("Detected loop in Insert"));
            }
            counter -= 1;
            if level >= current.levels as usize {
                break;
            }
            let next_addr = current.next[level];
            if next_addr.is_empty() || next_addr == index.tail {
                break;
            }
            let next = read_node(tx, next_addr)?;
            match next.key.total_cmp(&key, collation) {
                std::cmp::Ordering::Less => current = next,
                std::cmp::Ordering::Equal if index.unique => {
                    return Err(DbError::DuplicateKey {
                        index: index.name.clone(),
                        key: key.to_string(),
                    });
                }
                _ => break,
            }
        }
        prevs[level] = current.address;
    }

    let levels = random_level();
    let mut node = IndexNode::new(index.slot, levels, key);
    node.data_block = data_block;
    let address = store_node(tx, meta, &node)?;
    node.address = address;

    // wire each level between its frontier node and that node's successor
    for level in 0..levels as usize {
        let mut prev = read_node(tx, prevs[level])?;
        let next_addr = prev.next[level];
        node.prev[level] = prev.address;
        node.next[level] = next_addr;
        prev.next[level] = address;
        write_node(tx, &prev)?;
        if !next_addr.is_empty() {
            let mut next = read_node(tx, next_addr)?;
            next.prev[level] = address;
            write_node(tx, &next)?;
        }
    }

    // same-document chain
    if let Some(last_addr) = last_node {
        let mut last = read_node(tx, last_addr)?;
        node.next_node = last.next_node;
        last.next_node = address;
        write_node(tx, &last)?;
    }
    write_node(tx, &node)?;
    Ok(node)
}

// ============================================================================
// Delete
// ============================================================================

/// Remove every index node of one document in a single pass, starting at
/// its PK node.
pub fn delete_all(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    pk_node: PageAddress,
) -> Result<()> {
    let mut current = pk_node;
    let mut counter = tx.max_item_count();
    while !current.is_empty() {
        if counter == 0 {
            return Err(DbError::corruption("Detected loop in DeleteAll"));
        }
        counter -= 1;
        let node = read_node(tx, current)?;
        let next = node.next_node;
        unlink_and_release(tx, meta, node)?;
        current = next;
    }
    Ok(())
}

fn unlink_and_release(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    node: IndexNode,
) -> Result<()> {
    for level in 0..node.levels as usize {
        let prev_addr = node.prev[level];
        let next_addr = node.next[level];
        if !prev_addr.is_empty() {
            let mut prev = read_node(tx, prev_addr)?;
            prev.next[level] = next_addr;
            write_node(tx, &prev)?;
        }
        if !next_addr.is_empty() {
            let mut next = read_node(tx, next_addr)?;
            next.prev[level] = prev_addr;
            write_node(tx, &next)?;
        }
    }
    release_node(tx, meta, node.address)
}

fn release_node(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    address: PageAddress,
) -> Result<()> {
    let items_left = tx.with_page_mut(address.page_id, |page| {
        page.delete_block(address.index)?;
        Ok(page.items_count())
    })?;
    if items_left == 0 {
        meta.free_index_list = freelist::remove(tx, meta.free_index_list, address.page_id)?;
        tx.free_page(address.page_id)?;
    } else {
        meta.free_index_list = freelist::ensure(tx, meta.free_index_list, address.page_id)?;
    }
    Ok(())
}

/// Re-point a node's data block (document relocation); returns the next
/// node in the same-document chain.
pub fn set_data_block(
    tx: &mut Transaction,
    address: PageAddress,
    data_block: PageAddress,
) -> Result<PageAddress> {
    let mut node = read_node(tx, address)?;
    node.data_block = data_block;
    let next = node.next_node;
    write_node(tx, &node)?;
    Ok(next)
}

/// Remove one secondary node from a document's chain (key change during
/// update). `pk_node` anchors the chain walk.
pub fn delete_one(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    pk_node: PageAddress,
    target: PageAddress,
) -> Result<()> {
    let mut prev_addr = pk_node;
    let mut counter = tx.max_item_count();
    loop {
        if counter == 0 {
            return Err(DbError::corruption("Detected loop in DeleteOne"));
        }
        counter -= 1;
        let prev = read_node(tx, prev_addr)?;
        if prev.next_node.is_empty() {
            return Err(DbError::corruption(
                "index node chain ended before the target node",
            ));
        }
        if prev.next_node == target {
            let node = read_node(tx, target)?;
            let mut prev = prev;
            prev.next_node = node.next_node;
            write_node(tx, &prev)?;
            return unlink_and_release(tx, meta, node);
        }
        prev_addr = prev.next_node;
    }
}

/// Drop an entire index: unchain its nodes from every document, then free
/// the sentinels.
pub fn drop_index(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    pk: &IndexInfo,
    target: &IndexInfo,
) -> Result<()> {
    // walk every document via the PK index and strip the target's nodes
    let mut counter = tx.max_item_count();
    let mut current = first(tx, pk, Order::Ascending)?;
    while let Some(pk_node) = current {
        if counter == 0 {
            return Err(DbError::corruption("Detected loop in DropIndex"));
        }
        counter -= 1;

        let mut prev_addr = pk_node.address;
        loop {
            let prev = read_node(tx, prev_addr)?;
            let next_addr = prev.next_node;
            if next_addr.is_empty() {
                break;
            }
            let node = read_node(tx, next_addr)?;
            if node.slot == target.slot {
                let mut prev = prev;
                prev.next_node = node.next_node;
                write_node(tx, &prev)?;
                release_node(tx, meta, node.address)?;
            } else {
                prev_addr = next_addr;
            }
        }
        current = next_in_order(tx, pk, &pk_node, Order::Ascending)?;
    }

    release_node(tx, meta, target.head)?;
    release_node(tx, meta, target.tail)?;
    Ok(())
}
