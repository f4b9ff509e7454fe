//! Declarative queries: the query value, the planner that picks an index,
//! and the pipeline executor.

pub mod executor;
pub mod planner;
pub mod sort;

use crate::bson::{Array, Document, Value};
use crate::expr::Expression;
use crate::index::Order;

// ============================================================================
// Query
// ============================================================================

/// Vector-search hint attached to a query (`WhereNear` / `TopKNear`).
#[derive(Clone, Debug)]
pub struct VectorQuery {
    pub expression: Expression,
    pub target: Vec<f32>,
    /// Max distance, or minimum similarity under dot product.
    pub max_distance: Option<f64>,
    pub k: Option<usize>,
}

/// A declarative query over one collection. Build with the fluent helpers;
/// the planner turns it into a [`QueryPlan`].
#[derive(Clone, Debug, Default)]
pub struct Query {
    pub select: Option<Expression>,
    pub predicates: Vec<Expression>,
    pub includes: Vec<Expression>,
    pub order_by: Vec<(Expression, Order)>,
    pub group_by: Option<Expression>,
    pub having: Option<Expression>,
    pub offset: usize,
    pub limit: Option<usize>,
    pub for_update: bool,
    pub into: Option<String>,
    pub vector: Option<VectorQuery>,
}

impl Query {
    pub fn all() -> Query {
        Query::default()
    }

    pub fn and_where(mut self, expr: Expression) -> Query {
        self.predicates.push(expr);
        self
    }

    pub fn select(mut self, expr: Expression) -> Query {
        self.select = Some(expr);
        self
    }

    pub fn include(mut self, expr: Expression) -> Query {
        self.includes.push(expr);
        self
    }

    pub fn order(mut self, expr: Expression, order: Order) -> Query {
        self.order_by.push((expr, order));
        self
    }

    pub fn group(mut self, expr: Expression) -> Query {
        self.group_by = Some(expr);
        self
    }

    pub fn having(mut self, expr: Expression) -> Query {
        self.having = Some(expr);
        self
    }

    pub fn offset(mut self, offset: usize) -> Query {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Query {
        self.limit = Some(limit);
        self
    }

    pub fn for_update(mut self) -> Query {
        self.for_update = true;
        self
    }

    pub fn into_collection(mut self, name: &str) -> Query {
        self.into = Some(name.to_string());
        self
    }

    /// All documents whose indexed vector lies within `max_distance` of the
    /// target (minimum similarity under dot product).
    pub fn near(mut self, field: Expression, target: &[f32], max_distance: f64) -> Query {
        self.vector = Some(VectorQuery {
            expression: field,
            target: target.to_vec(),
            max_distance: Some(max_distance),
            k: None,
        });
        self
    }

    /// The k nearest documents to the target, closest first.
    pub fn top_k_near(mut self, field: Expression, target: &[f32], k: usize) -> Query {
        self.vector = Some(VectorQuery {
            expression: field,
            target: target.to_vec(),
            max_distance: None,
            k: Some(k),
        });
        self
    }
}

// ============================================================================
// Plan
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum IndexRange {
    All,
    Eq(Value),
    In(Vec<Value>),
    Range {
        from: Option<Value>,
        to: Option<Value>,
        from_inclusive: bool,
        to_inclusive: bool,
    },
}

#[derive(Clone, Debug)]
pub enum IndexChoice {
    /// Ordered scan over a skip-list index (the `_id` full scan included).
    IndexScan {
        name: String,
        expression: Expression,
        range: IndexRange,
        order: Order,
    },
    /// Approximate nearest-neighbour search over a vector index.
    VectorSearch {
        name: String,
        target: Vec<f32>,
        max_distance: Option<f64>,
        k: Option<usize>,
    },
}

/// The executable plan produced by the planner; also serializable to a
/// document for explain.
#[derive(Clone, Debug)]
pub struct QueryPlan {
    pub collection: String,
    pub index: IndexChoice,
    /// Residual predicates applied after the index scan.
    pub filters: Vec<Expression>,
    /// Order-by segments not satisfied by the index direction.
    pub sort: Vec<(Expression, Order)>,
    /// Index scan direction already satisfies the first order-by segment.
    pub index_covers_order: bool,
    /// Serve results from index keys alone, no document materialization.
    pub key_only: Option<String>,
    pub select: Option<Expression>,
    pub group_by: Option<Expression>,
    pub having: Option<Expression>,
    pub includes_before_filter: Vec<Expression>,
    pub includes_after_filter: Vec<Expression>,
    pub offset: usize,
    pub limit: Option<usize>,
    pub for_update: bool,
    /// The whole document is required (`$` referenced somewhere).
    pub needs_full_document: bool,
}

impl QueryPlan {
    /// Explain output for `GetPlan`.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new().with("collection", self.collection.clone());
        match &self.index {
            IndexChoice::IndexScan {
                name,
                expression,
                range,
                order,
            } => {
                doc.insert("index", name.clone());
                doc.insert("expr", expression.source());
                doc.insert(
                    "mode",
                    match range {
                        IndexRange::All => "full scan".to_string(),
                        IndexRange::Eq(v) => format!("seek {v}"),
                        IndexRange::In(values) => format!("seek {} keys", values.len()),
                        IndexRange::Range { .. } => "range scan".to_string(),
                    },
                );
                doc.insert(
                    "order",
                    if *order == Order::Ascending { 1 } else { -1 },
                );
            }
            IndexChoice::VectorSearch {
                name,
                max_distance,
                k,
                ..
            } => {
                doc.insert("index", name.clone());
                doc.insert("mode", "vector search");
                if let Some(d) = max_distance {
                    doc.insert("maxDistance", *d);
                }
                if let Some(k) = k {
                    doc.insert("k", *k as i64);
                }
            }
        }
        doc.insert(
            "filters",
            Array::from(
                self.filters
                    .iter()
                    .map(|f| Value::from(f.source()))
                    .collect::<Vec<_>>(),
            ),
        );
        doc.insert(
            "sort",
            Array::from(
                self.sort
                    .iter()
                    .map(|(e, o)| {
                        Value::Document(
                            Document::new()
                                .with("expr", e.source())
                                .with("order", if *o == Order::Ascending { 1 } else { -1 }),
                        )
                    })
                    .collect::<Vec<_>>(),
            ),
        );
        doc.insert("indexCoversOrder", self.index_covers_order);
        if let Some(field) = &self.key_only {
            doc.insert("keyOnly", field.clone());
        }
        if let Some(group) = &self.group_by {
            doc.insert("groupBy", group.source());
        }
        doc.insert("needsFullDocument", self.needs_full_document);
        doc
    }
}
