//! Persisted binary metric tree for approximate nearest-neighbour search.
//!
//! Every node stores a pivot vector (inline for small dimensions, spilled to
//! a payload chain otherwise), the owning document's data-block address,
//! left/right children and, per child, the min/max distance any descendant
//! has from this node's pivot. Search prunes a child when its range cannot
//! intersect the current query ball.

use tracing::trace;

use crate::error::{DbError, Result};
use crate::expr::{cosine_distance, dot_product, euclidean_distance};
use crate::storage::collection_page::{CollectionMeta, VectorIndexInfo, VectorMetric};
use crate::storage::freelist;
use crate::storage::page::{PageAddress, PageBuffer, PageId, PageType, EMPTY_PAGE_ID};
use crate::transaction::Transaction;

const NODE_FIXED: usize = 53;
/// Nodes above this size keep their vector in a payload chain instead.
const INLINE_NODE_LIMIT: usize = 1024;
const PAYLOAD_HEADER: usize = 7;
const MAX_PAYLOAD: usize =
    crate::storage::page::MAX_BLOCK_SIZE - PAYLOAD_HEADER;

const FLAG_INLINE: u8 = 0x01;

/// Distance under the index metric; dot product is negated so that smaller
/// always means closer.
pub fn metric_distance(metric: VectorMetric, a: &[f32], b: &[f32]) -> f64 {
    match metric {
        VectorMetric::Cosine => cosine_distance(a, b),
        VectorMetric::Euclidean => euclidean_distance(a, b),
        VectorMetric::DotProduct => -dot_product(a, b),
    }
}

// ============================================================================
// Node
// ============================================================================

#[derive(Clone, Debug)]
struct VectorNode {
    address: PageAddress,
    data_block: PageAddress,
    left: PageAddress,
    right: PageAddress,
    /// (min, max) distance from this pivot to any vector in each subtree.
    left_range: (f64, f64),
    right_range: (f64, f64),
    vector: Vec<f32>,
    inline: bool,
    /// Payload chain head when not inline.
    payload: PageAddress,
}

impl VectorNode {
    fn new(vector: Vec<f32>, data_block: PageAddress) -> Self {
        let inline = NODE_FIXED + vector.len() * 4 <= INLINE_NODE_LIMIT;
        VectorNode {
            address: PageAddress::EMPTY,
            data_block,
            left: PageAddress::EMPTY,
            right: PageAddress::EMPTY,
            left_range: (f64::MAX, f64::MIN),
            right_range: (f64::MAX, f64::MIN),
            vector,
            inline,
            payload: PageAddress::EMPTY,
        }
    }

    fn serialized_len(&self) -> usize {
        if self.inline {
            NODE_FIXED + self.vector.len() * 4
        } else {
            NODE_FIXED + 6
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.serialized_len()];
        self.data_block.write_to(&mut bytes[0..6]);
        self.left.write_to(&mut bytes[6..12]);
        self.right.write_to(&mut bytes[12..18]);
        bytes[18..26].copy_from_slice(&self.left_range.0.to_le_bytes());
        bytes[26..34].copy_from_slice(&self.left_range.1.to_le_bytes());
        bytes[34..42].copy_from_slice(&self.right_range.0.to_le_bytes());
        bytes[42..50].copy_from_slice(&self.right_range.1.to_le_bytes());
        bytes[50] = if self.inline { FLAG_INLINE } else { 0 };
        bytes[51..53].copy_from_slice(&(self.vector.len() as u16).to_le_bytes());
        if self.inline {
            let mut pos = NODE_FIXED;
            for f in &self.vector {
                bytes[pos..pos + 4].copy_from_slice(&f.to_le_bytes());
                pos += 4;
            }
        } else {
            self.payload.write_to(&mut bytes[NODE_FIXED..NODE_FIXED + 6]);
        }
        bytes
    }

    fn read(page: &PageBuffer, address: PageAddress) -> Result<VectorNode> {
        let block = page.read_block(address.index)?;
        if block.len() < NODE_FIXED {
            return Err(DbError::corruption("vector node shorter than its header"));
        }
        let read_f64 = |range: std::ops::Range<usize>| {
            f64::from_le_bytes(block[range].try_into().expect("8 bytes"))
        };
        let inline = block[50] & FLAG_INLINE != 0;
        let dims = u16::from_le_bytes(block[51..53].try_into().expect("2 bytes")) as usize;
        let (vector, payload) = if inline {
            let mut vector = Vec::with_capacity(dims);
            let mut pos = NODE_FIXED;
            for _ in 0..dims {
                vector.push(f32::from_le_bytes(
                    block[pos..pos + 4].try_into().expect("4 bytes"),
                ));
                pos += 4;
            }
            (vector, PageAddress::EMPTY)
        } else {
            (Vec::new(), PageAddress::read_from(&block[NODE_FIXED..NODE_FIXED + 6]))
        };
        Ok(VectorNode {
            address,
            data_block: PageAddress::read_from(&block[0..6]),
            left: PageAddress::read_from(&block[6..12]),
            right: PageAddress::read_from(&block[12..18]),
            left_range: (read_f64(18..26), read_f64(26..34)),
            right_range: (read_f64(34..42), read_f64(42..50)),
            vector,
            inline,
            payload,
        })
    }
}

fn read_node(
    tx: &mut Transaction,
    info: &VectorIndexInfo,
    address: PageAddress,
) -> Result<VectorNode> {
    let mut node = tx.with_page(address.page_id, |page| {
        page.expect(address.page_id, PageType::VectorIndex)?;
        VectorNode::read(page, address)
    })?;
    if !node.inline {
        node.vector = read_payload(tx, node.payload, info.dimensions as usize)?;
    }
    Ok(node)
}

fn write_node(tx: &mut Transaction, node: &VectorNode) -> Result<()> {
    let bytes = node.to_bytes();
    tx.with_page_mut(node.address.page_id, |page| {
        page.update_block(node.address.index, &bytes)
    })
}

// ============================================================================
// Payload chains for large vectors
// ============================================================================

fn write_payload(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    info_index: usize,
    vector: &[f32],
) -> Result<PageAddress> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for f in vector {
        bytes.extend_from_slice(&f.to_le_bytes());
    }

    let mut head = PageAddress::EMPTY;
    let chunks: Vec<&[u8]> = bytes.chunks(MAX_PAYLOAD).collect();
    for chunk in chunks.into_iter().rev() {
        let mut block = vec![0u8; PAYLOAD_HEADER + chunk.len()];
        block[0] = (!head.is_empty()) as u8;
        head.write_to(&mut block[1..7]);
        block[7..].copy_from_slice(chunk);
        head = store_block(tx, meta, info_index, &block)?;
    }
    Ok(head)
}

fn read_payload(tx: &mut Transaction, head: PageAddress, dims: usize) -> Result<Vec<f32>> {
    let mut bytes = Vec::with_capacity(dims * 4);
    let mut current = head;
    let mut counter = tx.max_item_count();
    while !current.is_empty() {
        if counter == 0 {
            return Err(DbError::corruption("vector payload chain exceeds item budget"));
        }
        counter -= 1;
        current = tx.with_page(current.page_id, |page| {
            let block = page.read_block(current.index)?;
            bytes.extend_from_slice(&block[PAYLOAD_HEADER..]);
            Ok(if block[0] != 0 {
                PageAddress::read_from(&block[1..7])
            } else {
                PageAddress::EMPTY
            })
        })?;
    }
    let mut vector = Vec::with_capacity(dims);
    for chunk in bytes.chunks_exact(4) {
        vector.push(f32::from_le_bytes(chunk.try_into().expect("4 bytes")));
    }
    Ok(vector)
}

fn free_payload(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    info_index: usize,
    head: PageAddress,
) -> Result<()> {
    let mut current = head;
    let mut counter = tx.max_item_count();
    while !current.is_empty() {
        if counter == 0 {
            return Err(DbError::corruption("vector payload chain exceeds item budget"));
        }
        counter -= 1;
        let next = tx.with_page(current.page_id, |page| {
            let block = page.read_block(current.index)?;
            Ok(if block[0] != 0 {
                PageAddress::read_from(&block[1..7])
            } else {
                PageAddress::EMPTY
            })
        })?;
        release_block(tx, meta, info_index, current)?;
        current = next;
    }
    Ok(())
}

// ============================================================================
// Block placement on vector pages
// ============================================================================

fn store_block(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    info_index: usize,
    bytes: &[u8],
) -> Result<PageAddress> {
    let mut probes = 0;
    let page_id = loop {
        let head = meta.vector_indexes[info_index].free_list;
        if head == EMPTY_PAGE_ID || probes >= 4 {
            break tx.alloc_page(PageType::VectorIndex, meta.page_id)?;
        }
        let fits = tx.with_page(head, |page| {
            page.expect(head, PageType::VectorIndex)?;
            Ok(page.can_insert(bytes.len()))
        })?;
        if fits {
            break head;
        }
        meta.vector_indexes[info_index].free_list =
            freelist::remove(tx, meta.vector_indexes[info_index].free_list, head)?;
        probes += 1;
    };
    let index = tx.with_page_mut(page_id, |page| page.insert_block(bytes))?;
    meta.vector_indexes[info_index].free_list =
        freelist::ensure(tx, meta.vector_indexes[info_index].free_list, page_id)?;
    Ok(PageAddress::new(page_id, index))
}

fn release_block(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    info_index: usize,
    address: PageAddress,
) -> Result<()> {
    let items_left = tx.with_page_mut(address.page_id, |page| {
        page.delete_block(address.index)?;
        Ok(page.items_count())
    })?;
    if items_left == 0 {
        meta.vector_indexes[info_index].free_list =
            freelist::remove(tx, meta.vector_indexes[info_index].free_list, address.page_id)?;
        tx.free_page(address.page_id)?;
    } else {
        meta.vector_indexes[info_index].free_list =
            freelist::ensure(tx, meta.vector_indexes[info_index].free_list, address.page_id)?;
    }
    Ok(())
}

// ============================================================================
// Insert
// ============================================================================

/// Insert a vector for a document. Vectors whose length does not match the
/// index dimensions are silently absent from the index.
pub fn insert(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    info_index: usize,
    vector: &[f32],
    data_block: PageAddress,
) -> Result<()> {
    let info = meta.vector_indexes[info_index].clone();
    if vector.len() != info.dimensions as usize {
        return Ok(());
    }

    let mut node = VectorNode::new(vector.to_vec(), data_block);
    if !node.inline {
        node.payload = write_payload(tx, meta, info_index, vector)?;
    }
    let bytes = node.to_bytes();
    let address = store_block(tx, meta, info_index, &bytes)?;
    node.address = address;
    write_node(tx, &node)?;

    if info.root.is_empty() {
        meta.vector_indexes[info_index].root = address;
        return Ok(());
    }

    // descend, absorbing the new distance into the chosen child's range
    let mut current_addr = info.root;
    let mut counter = tx.max_item_count();
    loop {
        if counter == 0 {
            return Err(DbError::corruption("vector tree exceeds item budget"));
        }
        counter -= 1;

        let mut current = read_node(tx, &info, current_addr)?;
        let d = metric_distance(info.metric, &current.vector, vector);

        if current.left.is_empty() {
            current.left = address;
            current.left_range = absorb(current.left_range, d);
            write_node(tx, &current)?;
            return Ok(());
        }
        if current.right.is_empty() {
            current.right = address;
            current.right_range = absorb(current.right_range, d);
            write_node(tx, &current)?;
            return Ok(());
        }

        let left_growth = expansion(current.left_range, d);
        let right_growth = expansion(current.right_range, d);
        if left_growth <= right_growth {
            current.left_range = absorb(current.left_range, d);
            let next = current.left;
            write_node(tx, &current)?;
            current_addr = next;
        } else {
            current.right_range = absorb(current.right_range, d);
            let next = current.right;
            write_node(tx, &current)?;
            current_addr = next;
        }
    }
}

fn absorb(range: (f64, f64), d: f64) -> (f64, f64) {
    if range.0 > range.1 {
        (d, d)
    } else {
        (range.0.min(d), range.1.max(d))
    }
}

fn expansion(range: (f64, f64), d: f64) -> f64 {
    if range.0 > range.1 {
        return 0.0;
    }
    (range.0 - d).max(0.0) + (d - range.1).max(0.0)
}

// ============================================================================
// Search
// ============================================================================

/// k-NN / range search. `max_distance` bounds the query ball (for dot
/// product it is a minimum similarity); `limit` keeps the k best and
/// tightens the ball as results accumulate. Results are (data block,
/// distance) ordered closest-first.
pub fn search(
    tx: &mut Transaction,
    info: &VectorIndexInfo,
    target: &[f32],
    max_distance: Option<f64>,
    limit: Option<usize>,
) -> Result<Vec<(PageAddress, f64)>> {
    if info.root.is_empty() || target.len() != info.dimensions as usize {
        return Ok(Vec::new());
    }

    // dot-product thresholds arrive as minimum similarity
    let mut radius = match (info.metric, max_distance) {
        (VectorMetric::DotProduct, Some(s)) => -s,
        (_, Some(r)) => r,
        (_, None) => f64::MAX,
    };

    let mut results: Vec<(PageAddress, f64)> = Vec::new();
    let mut stack = vec![info.root];
    let mut counter = tx.max_item_count();

    while let Some(address) = stack.pop() {
        if counter == 0 {
            return Err(DbError::corruption("vector tree exceeds item budget"));
        }
        counter -= 1;

        let node = read_node(tx, info, address)?;
        let d = metric_distance(info.metric, &node.vector, target);

        if !d.is_nan() && d <= radius {
            let at = results
                .binary_search_by(|(_, dist)| dist.total_cmp(&d))
                .unwrap_or_else(|i| i);
            results.insert(at, (node.data_block, d));
            if let Some(k) = limit {
                if results.len() > k {
                    results.truncate(k);
                }
                // tighten the ball to the kth best seen
                if results.len() == k {
                    radius = radius.min(results[k - 1].1);
                }
            }
        }

        // visit the nearer child last so it pops first
        let mut children: Vec<(PageAddress, (f64, f64))> = Vec::new();
        if !node.left.is_empty() {
            children.push((node.left, node.left_range));
        }
        if !node.right.is_empty() {
            children.push((node.right, node.right_range));
        }
        if d.is_nan() {
            for (child, _) in children {
                stack.push(child);
            }
            continue;
        }
        children.sort_by(|a, b| {
            let mid_a = (a.1 .0 + a.1 .1) / 2.0;
            let mid_b = (b.1 .0 + b.1 .1) / 2.0;
            (d - mid_b).abs().total_cmp(&(d - mid_a).abs())
        });
        // the [d - r, d + r] ball test needs a non-negative radius; negated
        // dot products stay below zero, so that metric visits both children
        let prunable = radius < f64::MAX && radius >= 0.0;
        for (child, range) in children {
            if prunable && (range.1 < d - radius || range.0 > d + radius) {
                continue;
            }
            stack.push(child);
        }
    }
    trace!(
        index = info.name.as_str(),
        hits = results.len(),
        "vector search complete"
    );
    Ok(results)
}

// ============================================================================
// Drop / rebuild
// ============================================================================

/// Free every node (and payload chain) of the index; the root resets to
/// empty. Emptied pages go back to the global free list.
pub fn drop_tree(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    info_index: usize,
) -> Result<()> {
    let info = meta.vector_indexes[info_index].clone();
    let mut stack = vec![info.root];
    let mut counter = tx.max_item_count();

    while let Some(address) = stack.pop() {
        if address.is_empty() {
            continue;
        }
        if counter == 0 {
            return Err(DbError::corruption("vector tree exceeds item budget"));
        }
        counter -= 1;
        let node = tx.with_page(address.page_id, |page| VectorNode::read(page, address))?;
        stack.push(node.left);
        stack.push(node.right);
        if !node.inline {
            free_payload(tx, meta, info_index, node.payload)?;
        }
        release_block(tx, meta, info_index, address)?;
    }
    meta.vector_indexes[info_index].root = PageAddress::EMPTY;
    Ok(())
}

/// Update/upsert path: clear the tree and re-insert the surviving entries in
/// iteration order.
pub fn rebuild(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    info_index: usize,
    entries: &[(Vec<f32>, PageAddress)],
) -> Result<()> {
    drop_tree(tx, meta, info_index)?;
    for (vector, data_block) in entries {
        insert(tx, meta, info_index, vector, *data_block)?;
    }
    Ok(())
}

/// Every page reachable from the tree (drop-collection accounting).
pub fn tree_pages(
    tx: &mut Transaction,
    info: &VectorIndexInfo,
) -> Result<Vec<PageId>> {
    let mut pages = Vec::new();
    let mut stack = vec![info.root];
    let mut counter = tx.max_item_count();
    while let Some(address) = stack.pop() {
        if address.is_empty() {
            continue;
        }
        if counter == 0 {
            return Err(DbError::corruption("vector tree exceeds item budget"));
        }
        counter -= 1;
        pages.push(address.page_id);
        let node = tx.with_page(address.page_id, |page| VectorNode::read(page, address))?;
        stack.push(node.left);
        stack.push(node.right);
        if !node.inline {
            let mut payload = node.payload;
            while !payload.is_empty() {
                pages.push(payload.page_id);
                payload = tx.with_page(payload.page_id, |page| {
                    let block = page.read_block(payload.index)?;
                    Ok(if block[0] != 0 {
                        PageAddress::read_from(&block[1..7])
                    } else {
                        PageAddress::EMPTY
                    })
                })?;
            }
        }
    }
    Ok(pages)
}
