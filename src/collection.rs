//! Document-level operations over one collection: insert/update/upsert/
//! delete with synchronous maintenance of every index, index creation with
//! backfill, and collection drop.

use std::collections::HashSet;

use tracing::{debug, trace};

use crate::bson::{codec, Document, Value};
use crate::config::Collation;
use crate::error::{DbError, Result};
use crate::expr::Expression;
use crate::index::skiplist::{self, Order};
use crate::index::vector;
use crate::storage::collection_page::{
    CollectionMeta, IndexInfo, VectorIndexInfo, VectorMetric, MAX_INDEXES,
};
use crate::storage::page::{PageAddress, PageId, PageType, EMPTY_PAGE_ID};
use crate::storage::{data, header};
use crate::transaction::Transaction;

// ============================================================================
// Collection lifecycle
// ============================================================================

/// Create a collection with its `_id` index; registration in the header
/// happens as a deferred commit hook.
pub fn create_collection(tx: &mut Transaction, name: &str) -> Result<CollectionMeta> {
    header::validate_collection_name_internal(name)?;
    let page_id = tx.alloc_page(PageType::Collection, 0)?;
    let mut meta = CollectionMeta::new(page_id, name);
    let pk = skiplist::create_index(
        tx,
        &mut meta,
        0,
        "_id",
        Expression::parse("$._id")?,
        true,
    )?;
    meta.indexes.push(pk);
    save_meta(tx, &meta)?;
    tx.add_pending_collection(name, page_id);
    debug!(collection = name, page_id, "collection created");
    Ok(meta)
}

pub fn save_meta(tx: &mut Transaction, meta: &CollectionMeta) -> Result<()> {
    let meta = meta.clone();
    tx.with_page_mut(meta.page_id, |page| meta.write_to(page))
}

/// Free every page the collection owns and unregister it. Caller holds the
/// exclusive gate.
pub fn drop_collection(tx: &mut Transaction, meta: &mut CollectionMeta, name: &str) -> Result<()> {
    let mut pages: HashSet<PageId> = HashSet::new();

    // every index node lives on some document's chain; walk the PK
    let pk = meta.pk_index()?.clone();
    for node in skiplist::find_all(tx, &pk, Order::Ascending)? {
        for page in data::chain_pages(tx, node.data_block)? {
            pages.insert(page);
        }
        let mut current = node.address;
        let mut counter = tx.max_item_count();
        while !current.is_empty() {
            if counter == 0 {
                return Err(DbError::corruption("Detected loop in DropCollection"));
            }
            counter -= 1;
            pages.insert(current.page_id);
            current = skiplist::read_node(tx, current)?.next_node;
        }
    }
    for index in &meta.indexes {
        pages.insert(index.head.page_id);
        pages.insert(index.tail.page_id);
    }
    for info in meta.vector_indexes.clone() {
        for page in vector::tree_pages(tx, &info)? {
            pages.insert(page);
        }
    }
    for head in [meta.free_data_list, meta.free_index_list]
        .into_iter()
        .chain(meta.vector_indexes.iter().map(|v| v.free_list))
    {
        let mut current = head;
        let mut counter = tx.max_item_count();
        while current != EMPTY_PAGE_ID {
            if counter == 0 {
                return Err(DbError::corruption("Detected loop in DropCollection"));
            }
            counter -= 1;
            pages.insert(current);
            current = tx.with_page(current, |page| Ok(page.next_page_id()))?;
        }
    }
    pages.insert(meta.page_id);

    for page_id in pages {
        tx.free_page(page_id)?;
        tx.safepoint()?;
    }
    tx.mark_collection_dropped(name);
    debug!(collection = name, "collection dropped");
    Ok(())
}

// ============================================================================
// Document writes
// ============================================================================

/// Insert one document. A missing or null `_id` takes `fallback_id`;
/// explicit Min/Max ids are rejected. Returns the effective id.
pub fn insert_document(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    collation: &Collation,
    doc: &mut Document,
    fallback_id: Value,
) -> Result<Value> {
    let id = ensure_id(doc, fallback_id)?;

    // keys are validated and unique indexes pre-checked so a failure here
    // leaves no partial state behind
    let pk = meta.pk_index()?.clone();
    check_unique(tx, &pk, collation, &id, None)?;
    for index in meta.indexes.clone().iter().filter(|i| i.slot > 0) {
        for key in index_keys(index, doc, collation) {
            skiplist::validate_key(&key)?;
            if index.unique {
                check_unique(tx, index, collation, &key, None)?;
            }
        }
    }

    let bytes = codec::serialize_document(doc);
    let address = data::insert(tx, meta, &bytes)?;

    let pk_node = skiplist::insert(tx, meta, &pk, collation, id.clone(), address, None)?;
    let mut last = pk_node.address;
    for index in meta.indexes.clone().iter().filter(|i| i.slot > 0) {
        for key in index_keys(index, doc, collation) {
            let node = skiplist::insert(tx, meta, index, collation, key, address, Some(last))?;
            last = node.address;
        }
    }
    for i in 0..meta.vector_indexes.len() {
        let expr = meta.vector_indexes[i].expression.clone();
        if let Some(v) = expr.eval_scalar(doc, collation).to_vector() {
            vector::insert(tx, meta, i, &v, address)?;
        }
    }

    trace!(id = %id, "document inserted");
    Ok(id)
}

/// Update by `_id`; false when the document does not exist.
pub fn update_document(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    collation: &Collation,
    doc: &Document,
) -> Result<bool> {
    let id = doc
        .get("_id")
        .cloned()
        .ok_or_else(|| DbError::usage("update requires an _id field"))?;
    validate_id(&id)?;

    let pk = meta.pk_index()?.clone();
    let Some(pk_node) = skiplist::find(tx, &pk, collation, &id, false, Order::Ascending)? else {
        return Ok(false);
    };
    let old_address = pk_node.data_block;
    let old_doc = codec::deserialize_document(&data::read(tx, old_address)?)?;

    // key validation and unique pre-check against other documents
    for index in meta.indexes.clone().iter().filter(|i| i.slot > 0) {
        for key in index_keys(index, doc, collation) {
            skiplist::validate_key(&key)?;
            if index.unique {
                check_unique(tx, index, collation, &key, Some(old_address))?;
            }
        }
    }

    let bytes = codec::serialize_document(doc);
    let new_address = data::update(tx, meta, old_address, &bytes)?;
    if new_address != old_address {
        repoint_chain(tx, pk_node.address, new_address)?;
    }

    // reconcile changed secondary keys
    for index in meta.indexes.clone().iter().filter(|i| i.slot > 0) {
        let old_keys = index_keys(index, &old_doc, collation);
        let new_keys = index_keys(index, doc, collation);

        for removed in old_keys
            .iter()
            .filter(|k| !new_keys.iter().any(|n| n.eq_with(k, collation)))
        {
            if let Some(node) =
                find_chain_node(tx, pk_node.address, index.slot, removed, collation)?
            {
                skiplist::delete_one(tx, meta, pk_node.address, node)?;
            }
        }
        for added in new_keys
            .iter()
            .filter(|k| !old_keys.iter().any(|o| o.eq_with(k, collation)))
        {
            skiplist::insert(
                tx,
                meta,
                index,
                collation,
                added.clone(),
                new_address,
                Some(pk_node.address),
            )?;
        }
    }

    rebuild_vector_indexes(tx, meta, collation)?;
    trace!(id = %id, "document updated");
    Ok(true)
}

/// Update-or-insert; returns true when an insert happened.
pub fn upsert_document(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    collation: &Collation,
    doc: &mut Document,
    fallback_id: Value,
) -> Result<bool> {
    if doc.get("_id").map(|v| !v.is_null()).unwrap_or(false)
        && update_document(tx, meta, collation, doc)?
    {
        return Ok(false);
    }
    insert_document(tx, meta, collation, doc, fallback_id)?;
    Ok(true)
}

/// Delete by `_id`; false when absent.
pub fn delete_document(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    collation: &Collation,
    id: &Value,
) -> Result<bool> {
    let pk = meta.pk_index()?.clone();
    let Some(pk_node) = skiplist::find(tx, &pk, collation, id, false, Order::Ascending)? else {
        return Ok(false);
    };
    skiplist::delete_all(tx, meta, pk_node.address)?;
    data::delete(tx, meta, pk_node.data_block)?;
    // the metric tree re-forms over the surviving entries
    rebuild_vector_indexes(tx, meta, collation)?;
    trace!(id = %id, "document deleted");
    Ok(true)
}

// ------------------------------------------------------------------
// Write helpers
// ------------------------------------------------------------------

fn ensure_id(doc: &mut Document, fallback_id: Value) -> Result<Value> {
    match doc.get("_id") {
        None | Some(Value::Null) => {
            let mut with_id = Document::new().with("_id", fallback_id.clone());
            for (k, v) in doc.iter() {
                if k != "_id" {
                    with_id.insert(k, v.clone());
                }
            }
            *doc = with_id;
            Ok(fallback_id)
        }
        Some(id) => {
            let id = id.clone();
            validate_id(&id)?;
            Ok(id)
        }
    }
}

fn validate_id(id: &Value) -> Result<()> {
    match id {
        Value::Null => Err(DbError::validation("_id cannot be null")),
        Value::MinValue | Value::MaxValue => {
            Err(DbError::validation("_id cannot be Min or Max"))
        }
        _ => Ok(()),
    }
}

fn check_unique(
    tx: &mut Transaction,
    index: &IndexInfo,
    collation: &Collation,
    key: &Value,
    allow_block: Option<PageAddress>,
) -> Result<()> {
    skiplist::validate_key(key)?;
    if let Some(existing) = skiplist::find(tx, index, collation, key, false, Order::Ascending)? {
        if Some(existing.data_block) != allow_block {
            return Err(DbError::DuplicateKey {
                index: index.name.clone(),
                key: key.to_string(),
            });
        }
    }
    Ok(())
}

/// Index keys of one document: enumerable expressions and array values make
/// a multikey entry per element, deduplicated under the collation.
fn index_keys(index: &IndexInfo, doc: &Document, collation: &Collation) -> Vec<Value> {
    let mut raw = index.expression.eval(doc, collation);
    if raw.is_empty() {
        raw.push(Value::Null);
    }
    if raw.len() == 1 {
        if let Value::Array(arr) = &raw[0] {
            raw = arr.as_slice().to_vec();
            if raw.is_empty() {
                raw.push(Value::Null);
            }
        }
    }
    let mut keys: Vec<Value> = Vec::new();
    for key in raw {
        if !keys.iter().any(|k| k.eq_with(&key, collation)) {
            keys.push(key);
        }
    }
    keys
}

/// Point every node in a document's chain at a relocated data block.
fn repoint_chain(
    tx: &mut Transaction,
    pk_node: PageAddress,
    new_block: PageAddress,
) -> Result<()> {
    let mut current = pk_node;
    let mut counter = tx.max_item_count();
    while !current.is_empty() {
        if counter == 0 {
            return Err(DbError::corruption("Detected loop in chain repoint"));
        }
        counter -= 1;
        current = skiplist::set_data_block(tx, current, new_block)?;
    }
    Ok(())
}

fn find_chain_node(
    tx: &mut Transaction,
    pk_node: PageAddress,
    slot: u8,
    key: &Value,
    collation: &Collation,
) -> Result<Option<PageAddress>> {
    let mut current = pk_node;
    let mut counter = tx.max_item_count();
    while !current.is_empty() {
        if counter == 0 {
            return Err(DbError::corruption("Detected loop in chain search"));
        }
        counter -= 1;
        let node = skiplist::read_node(tx, current)?;
        if node.slot == slot && node.key.eq_with(key, collation) {
            return Ok(Some(node.address));
        }
        current = node.next_node;
    }
    Ok(None)
}

/// Re-read every surviving document and rebuild each vector index in PK
/// iteration order.
pub fn rebuild_vector_indexes(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    collation: &Collation,
) -> Result<()> {
    if meta.vector_indexes.is_empty() {
        return Ok(());
    }
    let pk = meta.pk_index()?.clone();
    let nodes = skiplist::find_all(tx, &pk, Order::Ascending)?;
    for i in 0..meta.vector_indexes.len() {
        let expr = meta.vector_indexes[i].expression.clone();
        let dims = meta.vector_indexes[i].dimensions as usize;
        let mut entries = Vec::new();
        for node in &nodes {
            let doc = codec::deserialize_document(&data::read(tx, node.data_block)?)?;
            if let Some(v) = expr.eval_scalar(&doc, collation).to_vector() {
                if v.len() == dims {
                    entries.push((v, node.data_block));
                }
            }
        }
        vector::rebuild(tx, meta, i, &entries)?;
        tx.safepoint()?;
    }
    Ok(())
}

// ============================================================================
// Index management
// ============================================================================

/// Create a secondary index and backfill it; returns false when an
/// identical index already exists.
pub fn ensure_index(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    collation: &Collation,
    name: &str,
    expression: Expression,
    unique: bool,
) -> Result<bool> {
    validate_index_name(name)?;
    if let Some(existing) = meta.get_index(name) {
        if existing.expression.source() == expression.source() && existing.unique == unique {
            return Ok(false);
        }
        return Err(DbError::usage(format!(
            "index '{name}' already exists with a different definition"
        )));
    }
    if meta.get_vector_index(name).is_some() {
        return Err(DbError::usage(format!(
            "a vector index named '{name}' already exists"
        )));
    }

    let slot = meta.next_index_slot()?;
    let index = skiplist::create_index(tx, meta, slot, name, expression, unique)?;
    meta.indexes.push(index.clone());

    // backfill from the PK chain
    let pk = meta.pk_index()?.clone();
    let mut current = skiplist::first(tx, &pk, Order::Ascending)?;
    while let Some(pk_node) = current {
        let doc = codec::deserialize_document(&data::read(tx, pk_node.data_block)?)?;
        for key in index_keys(&index, &doc, collation) {
            skiplist::insert(
                tx,
                meta,
                &index,
                collation,
                key,
                pk_node.data_block,
                Some(pk_node.address),
            )?;
        }
        tx.safepoint()?;
        current = skiplist::next_in_order(tx, &pk, &pk_node, Order::Ascending)?;
    }
    debug!(index = name, unique, "index created and backfilled");
    Ok(true)
}

/// Create a vector index and backfill it from existing documents.
pub fn ensure_vector_index(
    tx: &mut Transaction,
    meta: &mut CollectionMeta,
    collation: &Collation,
    name: &str,
    expression: Expression,
    dimensions: u16,
    metric: VectorMetric,
) -> Result<bool> {
    validate_index_name(name)?;
    if dimensions == 0 {
        return Err(DbError::usage("vector index dimensions must be positive"));
    }
    if let Some(existing) = meta.get_vector_index(name) {
        if existing.expression.source() == expression.source()
            && existing.dimensions == dimensions
            && existing.metric == metric
        {
            return Ok(false);
        }
        return Err(DbError::usage(format!(
            "vector index '{name}' already exists with a different definition"
        )));
    }
    if meta.get_index(name).is_some() {
        return Err(DbError::usage(format!("an index named '{name}' already exists")));
    }
    if meta.total_indexes() >= MAX_INDEXES {
        return Err(DbError::usage(format!(
            "collection reached the limit of {MAX_INDEXES} indexes"
        )));
    }

    meta.vector_indexes.push(VectorIndexInfo {
        name: name.to_string(),
        expression,
        dimensions,
        metric,
        root: PageAddress::EMPTY,
        free_list: EMPTY_PAGE_ID,
    });
    let info_index = meta.vector_indexes.len() - 1;

    let pk = meta.pk_index()?.clone();
    let expr = meta.vector_indexes[info_index].expression.clone();
    let mut current = skiplist::first(tx, &pk, Order::Ascending)?;
    while let Some(pk_node) = current {
        let doc = codec::deserialize_document(&data::read(tx, pk_node.data_block)?)?;
        if let Some(v) = expr.eval_scalar(&doc, collation).to_vector() {
            vector::insert(tx, meta, info_index, &v, pk_node.data_block)?;
        }
        tx.safepoint()?;
        current = skiplist::next_in_order(tx, &pk, &pk_node, Order::Ascending)?;
    }
    debug!(index = name, dimensions, "vector index created and backfilled");
    Ok(true)
}

/// Drop a secondary or vector index by name; false when absent.
pub fn drop_index(tx: &mut Transaction, meta: &mut CollectionMeta, name: &str) -> Result<bool> {
    if name == "_id" {
        return Err(DbError::usage("the _id index cannot be dropped"));
    }
    if let Some(target) = meta.get_index(name).cloned() {
        let pk = meta.pk_index()?.clone();
        skiplist::drop_index(tx, meta, &pk, &target)?;
        meta.indexes.retain(|i| i.name != name);
        debug!(index = name, "index dropped");
        return Ok(true);
    }
    if let Some(pos) = meta.vector_indexes.iter().position(|i| i.name == name) {
        vector::drop_tree(tx, meta, pos)?;
        meta.vector_indexes.remove(pos);
        debug!(index = name, "vector index dropped");
        return Ok(true);
    }
    Ok(false)
}

fn validate_index_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > 60
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err(DbError::usage(format!("invalid index name '{name}'")));
    }
    Ok(())
}
