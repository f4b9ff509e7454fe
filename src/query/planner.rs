//! Query planner: AND-term decomposition, peephole rewrites, index choice
//! by estimated cost, order-by reuse and the key-only optimization.

use std::collections::BTreeSet;

use tracing::debug;

use crate::bson::{Array, Value};
use crate::config::Collation;
use crate::error::Result;
use crate::expr::{BinOp, Expr, Expression, Func, Quant};
use crate::index::Order;
use crate::storage::collection_page::CollectionMeta;

use super::{IndexChoice, IndexRange, Query, QueryPlan, VectorQuery};

pub fn plan(
    collection: &str,
    query: &Query,
    meta: &CollectionMeta,
    collation: &Collation,
) -> Result<QueryPlan> {
    // 1. split every WHERE into AND-terms, applying peephole rewrites
    let mut terms: Vec<Expression> = Vec::new();
    for predicate in &query.predicates {
        for term in predicate.split_and() {
            terms.push(rewrite_term(term));
        }
    }

    // 3. the field set decides whether full deserialization is required
    let mut fields = BTreeSet::new();
    for term in &terms {
        fields.extend(term.fields());
    }
    if let Some(select) = &query.select {
        fields.extend(select.fields());
    }
    for (expr, _) in &query.order_by {
        fields.extend(expr.fields());
    }
    for expr in query.group_by.iter().chain(query.having.iter()) {
        fields.extend(expr.fields());
    }
    let needs_full_document = fields.contains("$");

    // 4a. a vector hint or VECTOR_SIM term consumes a matching vector index
    let (vector_choice, mut residual) = choose_vector(query, meta, &mut terms, collation);

    let (index, index_covers_order, covered_segments) = match vector_choice {
        Some(choice) => (choice, false, 0),
        None => choose_skiplist(query, meta, collation, &mut residual),
    };

    // 5. order-by segments not satisfied by the index go to the sorter
    let sort: Vec<(Expression, Order)> = query
        .order_by
        .iter()
        .skip(covered_segments)
        .map(|(e, o)| (e.clone(), *o))
        .collect();

    // 6. single-field projections equal to the index expression skip
    // document materialization entirely
    let key_only = key_only_field(query, &index, &residual, needs_full_document);

    // 7. includes referenced by filters or ordering run before the filter
    let mut filter_fields = BTreeSet::new();
    for term in &residual {
        filter_fields.extend(term.fields());
    }
    for (expr, _) in &query.order_by {
        filter_fields.extend(expr.fields());
    }
    let (includes_before, includes_after): (Vec<_>, Vec<_>) = query
        .includes
        .iter()
        .cloned()
        .partition(|inc| inc.fields().iter().any(|f| filter_fields.contains(f)));

    let plan = QueryPlan {
        collection: collection.to_string(),
        index,
        filters: residual,
        sort,
        index_covers_order,
        key_only,
        select: query.select.clone(),
        group_by: query.group_by.clone(),
        having: query.having.clone(),
        includes_before_filter: includes_before,
        includes_after_filter: includes_after,
        offset: query.offset,
        limit: query.limit,
        for_update: query.for_update,
        needs_full_document,
    };
    debug!(collection, plan = %plan.to_document(), "query planned");
    Ok(plan)
}

// ============================================================================
// Peephole rewrites
// ============================================================================

/// `<enumerable> ANY = <path>`  →  `<path> IN ARRAY(<enumerable>)`
fn rewrite_term(term: Expression) -> Expression {
    if let Expr::Quantified(Quant::Any, BinOp::Eq, left, right) = term.ast() {
        let right_expr = Expression::from_ast((**right).clone());
        if right_expr.is_path() && !left.is_scalar() {
            let rewritten = Expr::Binary(
                BinOp::In,
                right.clone(),
                Box::new(Expr::Call(Func::Array, vec![(**left).clone()])),
            );
            return Expression::from_ast(rewritten);
        }
    }
    term
}

// ============================================================================
// Vector index choice
// ============================================================================

/// Consume a vector hint, a `VECTOR_SIM(..) <= d` term or a leading
/// `VECTOR_SIM` order-by. Returns the choice and the surviving terms.
fn choose_vector(
    query: &Query,
    meta: &CollectionMeta,
    terms: &mut Vec<Expression>,
    collation: &Collation,
) -> (Option<IndexChoice>, Vec<Expression>) {
    // explicit hint first
    if let Some(hint) = &query.vector {
        if let Some(index) = meta.find_vector_index_by_expression(hint.expression.source()) {
            if index.dimensions as usize == hint.target.len() {
                return (
                    Some(IndexChoice::VectorSearch {
                        name: index.name.clone(),
                        target: hint.target.clone(),
                        max_distance: hint.max_distance,
                        k: hint.k,
                    }),
                    std::mem::take(terms),
                );
            }
        }
        // mismatched dimensions (or no index): fall back to a full scan with
        // an equivalent residual predicate / sort
        let mut residual = std::mem::take(terms);
        if let Some(expr) = fallback_filter(hint) {
            residual.push(expr);
        }
        return (None, residual);
    }

    // a predicate term of the form VECTOR_SIM(path, const) <= d
    for (i, term) in terms.iter().enumerate() {
        if let Expr::Binary(BinOp::Lte | BinOp::Lt, left, right) = term.ast() {
            if let Expr::Call(Func::VectorSim, args) = &**left {
                if let (Some(path), Some(target), Some(threshold)) = (
                    args.first(),
                    args.get(1)
                        .and_then(|a| Expression::from_ast(a.clone()).try_constant(collation))
                        .and_then(|v| v.to_vector()),
                    Expression::from_ast((**right).clone())
                        .try_constant(collation)
                        .and_then(|v| v.as_f64()),
                ) {
                    let source = Expression::from_ast(path.clone());
                    if let Some(index) = meta.find_vector_index_by_expression(source.source()) {
                        if index.dimensions as usize == target.len() {
                            let name = index.name.clone();
                            let mut residual = terms.clone();
                            residual.remove(i);
                            return (
                                Some(IndexChoice::VectorSearch {
                                    name,
                                    target,
                                    max_distance: Some(threshold),
                                    k: None,
                                }),
                                residual,
                            );
                        }
                    }
                }
            }
        }
    }

    // ORDER BY VECTOR_SIM(path, const) with a limit is a top-k search
    if let Some((expr, Order::Ascending)) = query.order_by.first() {
        if let (Expr::Call(Func::VectorSim, args), Some(k)) = (expr.ast(), query.limit) {
            if let (Some(path), Some(target)) = (
                args.first(),
                args.get(1)
                    .and_then(|a| Expression::from_ast(a.clone()).try_constant(collation))
                    .and_then(|v| v.to_vector()),
            ) {
                let source = Expression::from_ast(path.clone());
                if let Some(index) = meta.find_vector_index_by_expression(source.source()) {
                    if index.dimensions as usize == target.len() {
                        return (
                            Some(IndexChoice::VectorSearch {
                                name: index.name.clone(),
                                target,
                                max_distance: None,
                                k: Some(k + query.offset),
                            }),
                            std::mem::take(terms),
                        );
                    }
                }
            }
        }
    }

    (None, std::mem::take(terms))
}

fn fallback_filter(hint: &VectorQuery) -> Option<Expression> {
    let target = Expr::Literal(Value::Array(Array::from(
        hint.target
            .iter()
            .map(|f| Value::Double(*f as f64))
            .collect::<Vec<_>>(),
    )));
    let sim = Expr::Call(
        Func::VectorSim,
        vec![hint.expression.ast().clone(), target],
    );
    // VECTOR_SIM yields Null for missing or mismatched vectors, and Null
    // sorts below every number; exclude it explicitly
    hint.max_distance.map(|d| {
        let not_null = Expr::Binary(
            BinOp::Ne,
            Box::new(sim.clone()),
            Box::new(Expr::Literal(Value::Null)),
        );
        let within = Expr::Binary(
            BinOp::Lte,
            Box::new(sim),
            Box::new(Expr::Literal(Value::Double(d))),
        );
        Expression::from_ast(Expr::Binary(
            BinOp::And,
            Box::new(not_null),
            Box::new(within),
        ))
    })
}

// ============================================================================
// Skip-list index choice
// ============================================================================

struct Candidate {
    term_index: usize,
    index_name: String,
    expression: Expression,
    range: IndexRange,
    cost: u64,
}

/// Returns (choice, covers-order flag, number of order segments covered).
fn choose_skiplist(
    query: &Query,
    meta: &CollectionMeta,
    collation: &Collation,
    terms: &mut Vec<Expression>,
) -> (IndexChoice, bool, usize) {
    // 4b. lowest-cost indexable term
    let mut best: Option<Candidate> = None;
    for (i, term) in terms.iter().enumerate() {
        if let Some((source, range)) = indexable(term, collation) {
            if let Some(index) = meta.find_index_by_expression(&source) {
                let cost = match (&range, index.unique) {
                    (IndexRange::Eq(_), true) => 1,
                    (IndexRange::Eq(_), false) => 10,
                    (IndexRange::In(values), _) => values.len() as u64 * 10,
                    (IndexRange::Range { .. }, _) => 50,
                    (IndexRange::All, _) => u64::MAX,
                };
                if best.as_ref().map(|b| cost < b.cost).unwrap_or(true) {
                    best = Some(Candidate {
                        term_index: i,
                        index_name: index.name.clone(),
                        expression: index.expression.clone(),
                        range,
                        cost,
                    });
                }
            }
        }
    }

    let order_hint = query.order_by.first();
    if let Some(candidate) = best {
        terms.remove(candidate.term_index);
        let covers = order_hint
            .map(|(expr, _)| expr.source() == candidate.expression.source())
            .unwrap_or(false);
        // a seek over one key is ordered trivially; ranges follow the
        // requested direction
        let order = match (covers, order_hint) {
            (true, Some((_, o))) => *o,
            _ => Order::Ascending,
        };
        return (
            IndexChoice::IndexScan {
                name: candidate.index_name,
                expression: candidate.expression,
                range: candidate.range,
                order,
            },
            covers,
            usize::from(covers),
        );
    }

    // 4c. no indexable term: reuse an index for group-by, then order-by,
    // then a preferred single-field projection
    let preferred = query
        .group_by
        .as_ref()
        .and_then(|g| meta.find_index_by_expression(g.source()))
        .or_else(|| {
            order_hint.and_then(|(expr, _)| meta.find_index_by_expression(expr.source()))
        })
        .or_else(|| {
            query
                .select
                .as_ref()
                .filter(|s| s.is_path())
                .and_then(|s| meta.find_index_by_expression(s.source()))
        });

    if let Some(index) = preferred {
        let covers = order_hint
            .map(|(expr, _)| expr.source() == index.expression.source())
            .unwrap_or(false);
        let order = match (covers, order_hint) {
            (true, Some((_, o))) => *o,
            _ => Order::Ascending,
        };
        return (
            IndexChoice::IndexScan {
                name: index.name.clone(),
                expression: index.expression.clone(),
                range: IndexRange::All,
                order,
            },
            covers,
            usize::from(covers),
        );
    }

    // 4d. `_id` full scan
    let pk = meta
        .pk_index()
        .map(|i| (i.name.clone(), i.expression.clone()))
        .unwrap_or_else(|_| ("_id".to_string(), Expression::field("_id")));
    let covers = order_hint
        .map(|(expr, _)| expr.source() == pk.1.source())
        .unwrap_or(false);
    let order = match (covers, order_hint) {
        (true, Some((_, o))) => *o,
        _ => Order::Ascending,
    };
    (
        IndexChoice::IndexScan {
            name: pk.0,
            expression: pk.1,
            range: IndexRange::All,
            order,
        },
        covers,
        usize::from(covers),
    )
}

/// Decompose `expr <op> constant` (either side) into an index range. The
/// non-constant side only has to match an index expression by source, so
/// computed and multikey index expressions qualify too.
fn indexable(term: &Expression, collation: &Collation) -> Option<(String, IndexRange)> {
    let Expr::Binary(op, left, right) = term.ast() else {
        return None;
    };
    let (path, constant, op) = {
        let left_expr = Expression::from_ast((**left).clone());
        let right_expr = Expression::from_ast((**right).clone());
        if let Some(constant) = right_expr.try_constant(collation) {
            (left_expr, constant, *op)
        } else if op.is_comparison() {
            (right_expr, left_expr.try_constant(collation)?, op.mirrored())
        } else {
            return None;
        }
    };

    let range = match op {
        BinOp::Eq => IndexRange::Eq(constant),
        BinOp::In => match constant {
            Value::Array(values) => IndexRange::In(values.into_vec()),
            _ => return None,
        },
        BinOp::Gt | BinOp::Gte => IndexRange::Range {
            from: Some(constant),
            to: None,
            from_inclusive: op == BinOp::Gte,
            to_inclusive: false,
        },
        BinOp::Lt | BinOp::Lte => IndexRange::Range {
            from: None,
            to: Some(constant),
            from_inclusive: false,
            to_inclusive: op == BinOp::Lte,
        },
        _ => return None,
    };
    Some((path.source().to_string(), range))
}

fn key_only_field(
    query: &Query,
    index: &IndexChoice,
    residual: &[Expression],
    needs_full_document: bool,
) -> Option<String> {
    if needs_full_document
        || !residual.is_empty()
        || query.group_by.is_some()
        || !query.order_by.is_empty() && !matches!(index, IndexChoice::IndexScan { .. })
    {
        return None;
    }
    let select = query.select.as_ref()?;
    if !select.is_path() {
        return None;
    }
    let IndexChoice::IndexScan { expression, .. } = index else {
        return None;
    };
    if select.source() != expression.source() {
        return None;
    }
    // single-segment paths only: the key becomes {field: key}
    match select.ast() {
        Expr::Field(base, name) if matches!(**base, Expr::Root) => Some(name.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::collection_page::{IndexInfo, VectorIndexInfo, VectorMetric};
    use crate::storage::page::PageAddress;

    fn meta() -> CollectionMeta {
        let mut meta = CollectionMeta::new(4, "people");
        meta.indexes.push(IndexInfo {
            slot: 0,
            name: "_id".into(),
            expression: Expression::parse("$._id").unwrap(),
            unique: true,
            head: PageAddress::new(5, 0),
            tail: PageAddress::new(5, 1),
        });
        meta.indexes.push(IndexInfo {
            slot: 1,
            name: "ix_age".into(),
            expression: Expression::parse("$.age").unwrap(),
            unique: false,
            head: PageAddress::new(6, 0),
            tail: PageAddress::new(6, 1),
        });
        meta.vector_indexes.push(VectorIndexInfo {
            name: "vx_emb".into(),
            expression: Expression::parse("$.emb").unwrap(),
            dimensions: 2,
            metric: VectorMetric::Cosine,
            root: PageAddress::EMPTY,
            free_list: crate::storage::page::EMPTY_PAGE_ID,
        });
        meta
    }

    fn plan_of(query: Query) -> QueryPlan {
        plan("people", &query, &meta(), &Collation::ordinal()).unwrap()
    }

    #[test]
    fn equality_picks_matching_index() {
        let p = plan_of(Query::all().and_where(Expression::parse("$.age = 30").unwrap()));
        match &p.index {
            IndexChoice::IndexScan { name, range, .. } => {
                assert_eq!(name, "ix_age");
                assert_eq!(*range, IndexRange::Eq(Value::Int32(30)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(p.filters.is_empty());
    }

    #[test]
    fn unindexed_terms_become_residual_filters() {
        let p = plan_of(
            Query::all().and_where(Expression::parse("$.age = 30 AND $.name = \"ada\"").unwrap()),
        );
        assert!(matches!(
            &p.index,
            IndexChoice::IndexScan { name, .. } if name == "ix_age"
        ));
        assert_eq!(p.filters.len(), 1);
        assert_eq!(p.filters[0].source(), "$.name = \"ada\"");
    }

    #[test]
    fn range_terms_produce_range_scans() {
        let p = plan_of(Query::all().and_where(Expression::parse("$.age >= 18").unwrap()));
        match &p.index {
            IndexChoice::IndexScan { range, .. } => match range {
                IndexRange::Range {
                    from,
                    from_inclusive,
                    ..
                } => {
                    assert_eq!(*from, Some(Value::Int32(18)));
                    assert!(from_inclusive);
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reversed_operands_are_mirrored() {
        let p = plan_of(Query::all().and_where(Expression::parse("18 <= $.age").unwrap()));
        assert!(matches!(
            &p.index,
            IndexChoice::IndexScan { name, range: IndexRange::Range { .. }, .. } if name == "ix_age"
        ));
    }

    #[test]
    fn order_by_reuses_index_and_clears_sort() {
        let p = plan_of(
            Query::all()
                .and_where(Expression::parse("$.age > 10").unwrap())
                .order(Expression::parse("$.age").unwrap(), Order::Descending),
        );
        assert!(p.index_covers_order);
        assert!(p.sort.is_empty());
        match &p.index {
            IndexChoice::IndexScan { order, .. } => assert_eq!(*order, Order::Descending),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unmatched_order_goes_to_sorter() {
        let p = plan_of(
            Query::all()
                .and_where(Expression::parse("$.age > 10").unwrap())
                .order(Expression::parse("$.name").unwrap(), Order::Ascending),
        );
        assert!(!p.index_covers_order);
        assert_eq!(p.sort.len(), 1);
    }

    #[test]
    fn fallback_is_pk_scan() {
        let p = plan_of(Query::all().and_where(Expression::parse("$.name = \"x\"").unwrap()));
        assert!(matches!(
            &p.index,
            IndexChoice::IndexScan { name, range: IndexRange::All, .. } if name == "_id"
        ));
        assert_eq!(p.filters.len(), 1);
    }

    #[test]
    fn vector_hint_consumes_vector_index() {
        let p = plan_of(Query::all().near(
            Expression::parse("$.emb").unwrap(),
            &[1.0, 0.0],
            0.25,
        ));
        assert!(matches!(
            &p.index,
            IndexChoice::VectorSearch { name, max_distance: Some(d), .. }
                if name == "vx_emb" && (*d - 0.25).abs() < 1e-9
        ));
    }

    #[test]
    fn vector_dim_mismatch_falls_back_to_scan() {
        let p = plan_of(Query::all().near(
            Expression::parse("$.emb").unwrap(),
            &[1.0, 0.0, 0.0],
            0.25,
        ));
        assert!(matches!(&p.index, IndexChoice::IndexScan { .. }));
        assert_eq!(p.filters.len(), 1);
    }

    #[test]
    fn vector_sim_predicate_uses_index() {
        let p = plan_of(
            Query::all()
                .and_where(Expression::parse("VECTOR_SIM($.emb, [1.0, 0.0]) <= 0.5").unwrap()),
        );
        assert!(matches!(&p.index, IndexChoice::VectorSearch { .. }));
        assert!(p.filters.is_empty());
    }

    #[test]
    fn order_by_vector_sim_with_limit_is_top_k() {
        let p = plan_of(
            Query::all()
                .order(
                    Expression::parse("VECTOR_SIM($.emb, [1.0, 0.0])").unwrap(),
                    Order::Ascending,
                )
                .limit(2),
        );
        assert!(matches!(
            &p.index,
            IndexChoice::VectorSearch { k: Some(2), .. }
        ));
    }

    #[test]
    fn any_rewrite_enables_in() {
        let term = Expression::parse("[1, 2] ANY = $.age").unwrap();
        let rewritten = rewrite_term(term);
        assert!(matches!(rewritten.ast(), Expr::Binary(BinOp::In, _, _)));
    }

    #[test]
    fn key_only_projection() {
        let p = plan_of(
            Query::all().select(Expression::parse("$.age").unwrap()),
        );
        assert_eq!(p.key_only.as_deref(), Some("age"));
        // with a residual filter the document is needed
        let p = plan_of(
            Query::all()
                .select(Expression::parse("$.age").unwrap())
                .and_where(Expression::parse("$.name = \"x\"").unwrap()),
        );
        assert!(p.key_only.is_none());
    }
}
