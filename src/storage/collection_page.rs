//! Collection page: descriptors for the primary-key index, secondary
//! skip-list indexes and vector indexes, plus the collection's free-page
//! list heads. The whole descriptor set serializes as one document stored in
//! slot 0 of the collection page.

use super::page::{PageAddress, PageBuffer, PageId, EMPTY_PAGE_ID};
use crate::bson::{codec, Array, Document, Value};
use crate::error::{DbError, Result};
use crate::expr::Expression;

/// Indexes per collection, `_id` and vector indexes included.
pub const MAX_INDEXES: usize = 32;
/// Serialized index keys are limited to this many bytes.
pub const MAX_INDEX_KEY_SIZE: usize = 1023;
pub const MAX_LEVELS: u8 = 32;

// ============================================================================
// Descriptors
// ============================================================================

#[derive(Clone, Debug)]
pub struct IndexInfo {
    /// Slot of this index inside the collection; 0 is always `_id`.
    pub slot: u8,
    pub name: String,
    pub expression: Expression,
    pub unique: bool,
    pub head: PageAddress,
    pub tail: PageAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum VectorMetric {
    Cosine = 0,
    Euclidean = 1,
    DotProduct = 2,
}

impl VectorMetric {
    pub fn from_u8(byte: u8) -> Option<VectorMetric> {
        Some(match byte {
            0 => VectorMetric::Cosine,
            1 => VectorMetric::Euclidean,
            2 => VectorMetric::DotProduct,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug)]
pub struct VectorIndexInfo {
    pub name: String,
    pub expression: Expression,
    pub dimensions: u16,
    pub metric: VectorMetric,
    pub root: PageAddress,
    /// Head of this index's reserved (free) vector-page list.
    pub free_list: PageId,
}

// ============================================================================
// Collection metadata
// ============================================================================

#[derive(Clone, Debug)]
pub struct CollectionMeta {
    /// The collection page's own id doubles as the collection id stamped on
    /// every page the collection owns.
    pub page_id: PageId,
    /// Collection name, also kept here so a damaged header registry can be
    /// reconstructed from the collection pages.
    pub name: String,
    pub indexes: Vec<IndexInfo>,
    pub vector_indexes: Vec<VectorIndexInfo>,
    /// Data pages with remaining free space.
    pub free_data_list: PageId,
    /// Index pages with remaining free space.
    pub free_index_list: PageId,
}

impl CollectionMeta {
    pub fn new(page_id: PageId, name: &str) -> Self {
        CollectionMeta {
            page_id,
            name: name.to_string(),
            indexes: Vec::new(),
            vector_indexes: Vec::new(),
            free_data_list: EMPTY_PAGE_ID,
            free_index_list: EMPTY_PAGE_ID,
        }
    }

    pub fn pk_index(&self) -> Result<&IndexInfo> {
        self.indexes
            .first()
            .filter(|i| i.slot == 0)
            .ok_or_else(|| DbError::corruption("collection has no primary-key index"))
    }

    pub fn get_index(&self, name: &str) -> Option<&IndexInfo> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn get_vector_index(&self, name: &str) -> Option<&VectorIndexInfo> {
        self.vector_indexes.iter().find(|i| i.name == name)
    }

    pub fn find_index_by_expression(&self, source: &str) -> Option<&IndexInfo> {
        self.indexes.iter().find(|i| i.expression.source() == source)
    }

    pub fn find_vector_index_by_expression(&self, source: &str) -> Option<&VectorIndexInfo> {
        self.vector_indexes
            .iter()
            .find(|i| i.expression.source() == source)
    }

    pub fn total_indexes(&self) -> usize {
        self.indexes.len() + self.vector_indexes.len()
    }

    pub fn next_index_slot(&self) -> Result<u8> {
        if self.total_indexes() >= MAX_INDEXES {
            return Err(DbError::usage(format!(
                "collection reached the limit of {MAX_INDEXES} indexes"
            )));
        }
        let slot = self
            .indexes
            .iter()
            .map(|i| i.slot)
            .max()
            .map(|s| s + 1)
            .unwrap_or(0);
        Ok(slot)
    }

    // ------------------------------------------------------------------
    // Page (de)serialization
    // ------------------------------------------------------------------

    pub fn from_page(page: &PageBuffer) -> Result<Self> {
        let bytes = page.read_block(0)?;
        let doc = codec::deserialize_document(bytes)?;
        Self::from_document(page.page_id(), &doc)
    }

    /// Write into slot 0, creating it on a fresh page.
    pub fn write_to(&self, page: &mut PageBuffer) -> Result<()> {
        let bytes = codec::serialize_document(&self.to_document());
        if page.items_count() == 0 {
            let slot = page.insert_block(&bytes)?;
            debug_assert_eq!(slot, 0);
            Ok(())
        } else {
            page.update_block(0, &bytes)
        }
    }

    fn to_document(&self) -> Document {
        let mut indexes = Array::new();
        for index in &self.indexes {
            indexes.push(Value::Document(
                Document::new()
                    .with("slot", index.slot as i32)
                    .with("name", index.name.clone())
                    .with("expr", index.expression.source())
                    .with("unique", index.unique)
                    .with("head", index.head.to_i64())
                    .with("tail", index.tail.to_i64()),
            ));
        }
        let mut vectors = Array::new();
        for index in &self.vector_indexes {
            vectors.push(Value::Document(
                Document::new()
                    .with("name", index.name.clone())
                    .with("expr", index.expression.source())
                    .with("dim", index.dimensions as i32)
                    .with("metric", index.metric as u8 as i32)
                    .with("root", index.root.to_i64())
                    .with("free", index.free_list as i64),
            ));
        }
        Document::new()
            .with("name", self.name.clone())
            .with("indexes", indexes)
            .with("vectors", vectors)
            .with("free_data", self.free_data_list as i64)
            .with("free_index", self.free_index_list as i64)
    }

    fn from_document(page_id: PageId, doc: &Document) -> Result<Self> {
        let mut meta = CollectionMeta::new(page_id, &field_str(doc, "name")?);
        meta.free_data_list = read_page_id(doc, "free_data")?;
        meta.free_index_list = read_page_id(doc, "free_index")?;

        if let Some(Value::Array(indexes)) = doc.get("indexes") {
            for item in indexes.iter() {
                let d = item
                    .as_document()
                    .ok_or_else(|| DbError::corruption("invalid index descriptor"))?;
                meta.indexes.push(IndexInfo {
                    slot: field_i32(d, "slot")? as u8,
                    name: field_str(d, "name")?,
                    expression: Expression::parse(&field_str(d, "expr")?)?,
                    unique: d.get("unique").and_then(Value::as_bool).unwrap_or(false),
                    head: PageAddress::from_i64(field_i64(d, "head")?),
                    tail: PageAddress::from_i64(field_i64(d, "tail")?),
                });
            }
        }
        if let Some(Value::Array(vectors)) = doc.get("vectors") {
            for item in vectors.iter() {
                let d = item
                    .as_document()
                    .ok_or_else(|| DbError::corruption("invalid vector index descriptor"))?;
                let metric = VectorMetric::from_u8(field_i32(d, "metric")? as u8)
                    .ok_or_else(|| DbError::corruption("unknown vector metric"))?;
                meta.vector_indexes.push(VectorIndexInfo {
                    name: field_str(d, "name")?,
                    expression: Expression::parse(&field_str(d, "expr")?)?,
                    dimensions: field_i32(d, "dim")? as u16,
                    metric,
                    root: PageAddress::from_i64(field_i64(d, "root")?),
                    free_list: field_i64(d, "free")? as PageId,
                });
            }
        }
        Ok(meta)
    }
}

fn field_str(doc: &Document, name: &str) -> Result<String> {
    doc.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DbError::corruption(format!("missing '{name}' in descriptor")))
}

fn field_i32(doc: &Document, name: &str) -> Result<i32> {
    doc.get(name)
        .and_then(Value::as_i32)
        .ok_or_else(|| DbError::corruption(format!("missing '{name}' in descriptor")))
}

fn field_i64(doc: &Document, name: &str) -> Result<i64> {
    doc.get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| DbError::corruption(format!("missing '{name}' in descriptor")))
}

fn read_page_id(doc: &Document, name: &str) -> Result<PageId> {
    Ok(field_i64(doc, name)? as PageId)
}
