//! Query executor: index scan, residual filter, sort, group/having,
//! projection and offset/limit, in that order.

use std::collections::HashSet;

use tracing::trace;

use crate::bson::{codec, Array, Document, Value};
use crate::config::Collation;
use crate::error::{DbError, Result};
use crate::expr::{Expr, Expression};
use crate::index::skiplist::{self, IndexNode, Order};
use crate::index::vector;
use crate::storage::collection_page::{CollectionMeta, IndexInfo};
use crate::storage::data;
use crate::storage::page::PageAddress;
use crate::transaction::Transaction;

use super::sort::{compare_keys, ExternalSorter};
use super::{IndexChoice, IndexRange, QueryPlan};

/// Execute a plan against one collection snapshot, materializing the result
/// set. An absent collection yields the empty result.
pub fn execute(
    tx: &mut Transaction,
    meta: Option<&CollectionMeta>,
    plan: &QueryPlan,
    collation: &Collation,
) -> Result<Vec<Document>> {
    let Some(meta) = meta else {
        return Ok(Vec::new());
    };

    let mut docs = gather(tx, meta, plan, collation)?;

    // includes referenced by filters resolve before filtering; resolution
    // itself belongs to the mapper layer above the engine
    if !plan.filters.is_empty() {
        docs.retain(|doc| {
            plan.filters
                .iter()
                .all(|f| f.eval_scalar(doc, collation).is_truthy())
        });
    }

    if !plan.sort.is_empty() {
        docs = sort_stage(tx, &docs, &plan.sort, collation)?;
    }

    if let Some(group) = &plan.group_by {
        docs = group_stage(docs, group, plan.having.as_ref(), plan.select.as_ref(), collation);
    } else if plan.key_only.is_none() {
        if let Some(select) = &plan.select {
            docs = docs
                .into_iter()
                .map(|doc| project(&doc, select, collation))
                .collect();
        }
    }

    // offset/limit close the pipeline
    let docs: Vec<Document> = docs
        .into_iter()
        .skip(plan.offset)
        .take(plan.limit.unwrap_or(usize::MAX))
        .collect();
    trace!(collection = plan.collection.as_str(), rows = docs.len(), "query executed");
    Ok(docs)
}

// ============================================================================
// Gather stage
// ============================================================================

fn gather(
    tx: &mut Transaction,
    meta: &CollectionMeta,
    plan: &QueryPlan,
    collation: &Collation,
) -> Result<Vec<Document>> {
    match &plan.index {
        IndexChoice::IndexScan {
            name,
            range,
            order,
            ..
        } => {
            let index = meta
                .get_index(name)
                .ok_or_else(|| DbError::corruption(format!("planned index '{name}' missing")))?
                .clone();

            if let Some(field) = &plan.key_only {
                let mut docs = Vec::new();
                scan_index(tx, &index, range, *order, collation, &mut |node| {
                    docs.push(Document::new().with(field.as_str(), node.key.clone()));
                    Ok(())
                })?;
                return Ok(docs);
            }

            let mut seen: HashSet<PageAddress> = HashSet::new();
            let mut blocks: Vec<PageAddress> = Vec::new();
            scan_index(tx, &index, range, *order, collation, &mut |node| {
                if seen.insert(node.data_block) {
                    blocks.push(node.data_block);
                }
                Ok(())
            })?;

            let mut docs = Vec::with_capacity(blocks.len());
            for (i, block) in blocks.iter().enumerate() {
                docs.push(codec::deserialize_document(&data::read(tx, *block)?)?);
                if i % 128 == 0 {
                    tx.safepoint()?;
                }
            }
            Ok(docs)
        }
        IndexChoice::VectorSearch {
            name,
            target,
            max_distance,
            k,
        } => {
            let info = meta
                .get_vector_index(name)
                .ok_or_else(|| DbError::corruption(format!("planned vector index '{name}' missing")))?
                .clone();
            let hits = vector::search(tx, &info, target, *max_distance, *k)?;
            let mut docs = Vec::with_capacity(hits.len());
            for (block, _) in hits {
                docs.push(codec::deserialize_document(&data::read(tx, block)?)?);
            }
            Ok(docs)
        }
    }
}

/// Ordered walk over the nodes selected by an index range.
fn scan_index(
    tx: &mut Transaction,
    index: &IndexInfo,
    range: &IndexRange,
    order: Order,
    collation: &Collation,
    visit: &mut dyn FnMut(&IndexNode) -> Result<()>,
) -> Result<()> {
    match range {
        IndexRange::All => {
            let mut current = skiplist::first(tx, index, order)?;
            let mut step = 0u32;
            while let Some(node) = current {
                visit(&node)?;
                step += 1;
                if step % 128 == 0 {
                    tx.safepoint()?;
                }
                current = skiplist::next_in_order(tx, index, &node, order)?;
            }
            Ok(())
        }
        IndexRange::Eq(value) => scan_equals(tx, index, value, collation, visit),
        IndexRange::In(values) => {
            let mut sorted: Vec<&Value> = values.iter().collect();
            sorted.sort_by(|a, b| a.total_cmp(b, collation));
            sorted.dedup_by(|a, b| a.eq_with(b, collation));
            if order == Order::Descending {
                sorted.reverse();
            }
            for value in sorted {
                scan_equals(tx, index, value, collation, visit)?;
            }
            Ok(())
        }
        IndexRange::Range {
            from,
            to,
            from_inclusive,
            to_inclusive,
        } => {
            let (seek, low, low_incl, high, high_incl) = match order {
                Order::Ascending => (from, from, from_inclusive, to, to_inclusive),
                Order::Descending => (to, from, from_inclusive, to, to_inclusive),
            };
            let mut current = match seek {
                Some(key) => skiplist::find(tx, index, collation, key, true, order)?,
                None => skiplist::first(tx, index, order)?,
            };
            let mut step = 0u32;
            while let Some(node) = current {
                let key = &node.key;
                let in_low = match low {
                    Some(bound) => match key.total_cmp(bound, collation) {
                        std::cmp::Ordering::Greater => true,
                        std::cmp::Ordering::Equal => *low_incl,
                        std::cmp::Ordering::Less => false,
                    },
                    None => true,
                };
                let in_high = match high {
                    Some(bound) => match key.total_cmp(bound, collation) {
                        std::cmp::Ordering::Less => true,
                        std::cmp::Ordering::Equal => *high_incl,
                        std::cmp::Ordering::Greater => false,
                    },
                    None => true,
                };
                match (order, in_low, in_high) {
                    // past the end of the range: stop
                    (Order::Ascending, _, false) | (Order::Descending, false, _) => break,
                    (_, true, true) => visit(&node)?,
                    // boundary-excluded keys at the start: keep walking
                    _ => {}
                }
                step += 1;
                if step % 128 == 0 {
                    tx.safepoint()?;
                }
                current = skiplist::next_in_order(tx, index, &node, order)?;
            }
            Ok(())
        }
    }
}

fn scan_equals(
    tx: &mut Transaction,
    index: &IndexInfo,
    value: &Value,
    collation: &Collation,
    visit: &mut dyn FnMut(&IndexNode) -> Result<()>,
) -> Result<()> {
    let mut current = skiplist::find(tx, index, collation, value, false, Order::Ascending)?;
    while let Some(node) = current {
        if !node.key.eq_with(value, collation) {
            break;
        }
        visit(&node)?;
        current = skiplist::next_in_order(tx, index, &node, Order::Ascending)?;
    }
    Ok(())
}

// ============================================================================
// Sort stage
// ============================================================================

fn sort_stage(
    tx: &mut Transaction,
    docs: &[Document],
    segments: &[(Expression, Order)],
    collation: &Collation,
) -> Result<Vec<Document>> {
    let directions: Vec<Order> = segments.iter().map(|(_, o)| *o).collect();
    let factory = &tx.services().factory;
    let mut sorter = ExternalSorter::new(factory, collation.clone(), directions);
    for doc in docs {
        let key: Vec<Value> = segments
            .iter()
            .map(|(expr, _)| expr.eval_scalar(doc, collation))
            .collect();
        sorter.push(key, doc.clone())?;
    }
    sorter.finish()
}

// ============================================================================
// Group stage
// ============================================================================

/// Group documents by key into `{key, items}` records, apply HAVING, then
/// the SELECT expression over each group record.
fn group_stage(
    mut docs: Vec<Document>,
    group: &Expression,
    having: Option<&Expression>,
    select: Option<&Expression>,
    collation: &Collation,
) -> Vec<Document> {
    docs.sort_by(|a, b| {
        compare_keys(
            &[group.eval_scalar(a, collation)],
            &[group.eval_scalar(b, collation)],
            &[Order::Ascending],
            collation,
        )
    });

    let mut out = Vec::new();
    let mut iter = docs.into_iter().peekable();
    while let Some(first) = iter.next() {
        let key = group.eval_scalar(&first, collation);
        let mut items = vec![Value::Document(first)];
        while let Some(next) = iter.peek() {
            if group.eval_scalar(next, collation).eq_with(&key, collation) {
                items.push(Value::Document(iter.next().expect("peeked")));
            } else {
                break;
            }
        }
        let record = Document::new()
            .with("key", key)
            .with("items", Array::from(items));
        if let Some(having) = having {
            if !having.eval_scalar(&record, collation).is_truthy() {
                continue;
            }
        }
        out.push(match select {
            Some(select) => project(&record, select, collation),
            None => record,
        });
    }
    out
}

// ============================================================================
// Projection
// ============================================================================

fn project(doc: &Document, select: &Expression, collation: &Collation) -> Document {
    match select.eval_scalar(doc, collation) {
        Value::Document(projected) => projected,
        other => {
            let name = match select.ast() {
                Expr::Field(base, name) if matches!(**base, Expr::Root) => name.clone(),
                _ => "expr".to_string(),
            };
            Document::new().with(name, other)
        }
    }
}
