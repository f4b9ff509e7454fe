//! Query pipeline: index usage, ordering, group/having, projection,
//! offset/limit, explain, and the plan-equals-naive-scan property.

mod common;

use std::collections::BTreeSet;

use common::{insert_people, memory_engine};
use harborlite::{doc, AutoId, Expression, Order, Query, Value};

#[test]
fn filter_uses_secondary_index_and_matches_scan() {
    let engine = memory_engine();
    insert_people(&engine, "people", 0..300);
    engine.ensure_index("people", "ix_age", "$.age", false).unwrap();

    let plan = engine
        .get_plan(
            "people",
            Query::all().and_where(Expression::parse("$.age = 30").unwrap()),
        )
        .unwrap();
    assert_eq!(plan.get("index").unwrap().as_str(), Some("ix_age"));

    // the same multiset as the naive scan with a residual filter
    let indexed: BTreeSet<i32> = engine
        .query(
            "people",
            Query::all().and_where(Expression::parse("$.age = 30").unwrap()),
        )
        .unwrap()
        .to_vec()
        .unwrap()
        .iter()
        .map(|d| d.get("_id").unwrap().as_i32().unwrap())
        .collect();
    let scanned: BTreeSet<i32> = engine
        .query("people", Query::all())
        .unwrap()
        .to_vec()
        .unwrap()
        .iter()
        .filter(|d| d.get("age").unwrap().as_i32() == Some(30))
        .map(|d| d.get("_id").unwrap().as_i32().unwrap())
        .collect();
    assert_eq!(indexed, scanned);
    assert!(!indexed.is_empty());
}

#[test]
fn range_scan_and_order_reuse() {
    let engine = memory_engine();
    insert_people(&engine, "people", 0..100);
    engine.ensure_index("people", "ix_age", "$.age", false).unwrap();

    let docs = engine
        .query(
            "people",
            Query::all()
                .and_where(Expression::parse("$.age >= 40 AND $.age < 60").unwrap())
                .order(Expression::parse("$.age").unwrap(), Order::Descending),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert!(!docs.is_empty());
    let ages: Vec<i32> = docs
        .iter()
        .map(|d| d.get("age").unwrap().as_i32().unwrap())
        .collect();
    assert!(ages.windows(2).all(|w| w[0] >= w[1]));
    assert!(ages.iter().all(|a| (40..60).contains(a)));
}

#[test]
fn sort_without_index_support() {
    let engine = memory_engine();
    engine
        .insert(
            "words",
            vec![
                doc! { "_id" => 1, "w" => "pear" },
                doc! { "_id" => 2, "w" => "apple" },
                doc! { "_id" => 3, "w" => "mango" },
            ],
            AutoId::ObjectId,
        )
        .unwrap();
    let docs = engine
        .query(
            "words",
            Query::all().order(Expression::parse("$.w").unwrap(), Order::Ascending),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    let words: Vec<&str> = docs.iter().map(|d| d.get("w").unwrap().as_str().unwrap()).collect();
    assert_eq!(words, vec!["apple", "mango", "pear"]);
}

#[test]
fn offset_and_limit() {
    let engine = memory_engine();
    insert_people(&engine, "people", 0..20);
    let docs = engine
        .query(
            "people",
            Query::all()
                .order(Expression::parse("$._id").unwrap(), Order::Ascending)
                .offset(5)
                .limit(3),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    let ids: Vec<i32> = docs
        .iter()
        .map(|d| d.get("_id").unwrap().as_i32().unwrap())
        .collect();
    assert_eq!(ids, vec![5, 6, 7]);
}

#[test]
fn key_only_projection_uses_index_keys() {
    let engine = memory_engine();
    insert_people(&engine, "people", 0..50);
    engine.ensure_index("people", "ix_age", "$.age", false).unwrap();

    let plan = engine
        .get_plan(
            "people",
            Query::all().select(Expression::parse("$.age").unwrap()),
        )
        .unwrap();
    assert_eq!(plan.get("keyOnly").unwrap().as_str(), Some("age"));

    let docs = engine
        .query(
            "people",
            Query::all().select(Expression::parse("$.age").unwrap()),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(docs.len(), 50);
    assert!(docs.iter().all(|d| d.len() == 1 && d.contains_key("age")));
}

#[test]
fn group_by_with_having() {
    let engine = memory_engine();
    engine
        .insert(
            "orders",
            vec![
                doc! { "_id" => 1, "cat" => "a", "amount" => 10 },
                doc! { "_id" => 2, "cat" => "a", "amount" => 20 },
                doc! { "_id" => 3, "cat" => "b", "amount" => 5 },
                doc! { "_id" => 4, "cat" => "b", "amount" => 1 },
                doc! { "_id" => 5, "cat" => "c", "amount" => 100 },
            ],
            AutoId::ObjectId,
        )
        .unwrap();

    let groups = engine
        .query(
            "orders",
            Query::all()
                .group(Expression::parse("$.cat").unwrap())
                .having(Expression::parse("COUNT($.items[*]) >= 2").unwrap())
                .select(
                    Expression::parse("{cat: $.key, total: SUM($.items[*].amount)}").unwrap(),
                ),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(groups.len(), 2);
    let totals: Vec<(String, i32)> = groups
        .iter()
        .map(|g| {
            (
                g.get("cat").unwrap().as_str().unwrap().to_string(),
                g.get("total").unwrap().as_i32().unwrap(),
            )
        })
        .collect();
    assert!(totals.contains(&("a".to_string(), 30)));
    assert!(totals.contains(&("b".to_string(), 6)));
}

#[test]
fn projection_wraps_scalars() {
    let engine = memory_engine();
    insert_people(&engine, "people", 0..3);
    let docs = engine
        .query(
            "people",
            Query::all().select(Expression::parse("{name: $.name, next: $.age + 1}").unwrap()),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert!(docs.iter().all(|d| d.contains_key("name") && d.contains_key("next")));
}

#[test]
fn in_and_like_predicates() {
    let engine = memory_engine();
    insert_people(&engine, "people", 0..30);
    let hits = engine
        .count(
            "people",
            Some(Expression::parse("$._id IN [1, 5, 9, 999]").unwrap()),
        )
        .unwrap();
    assert_eq!(hits, 3);

    let likes = engine
        .count(
            "people",
            Some(Expression::parse("$.name LIKE \"person-1%\"").unwrap()),
        )
        .unwrap();
    // person-1 and person-10..person-19
    assert_eq!(likes, 11);
}

#[test]
fn multikey_index_over_arrays() {
    let engine = memory_engine();
    engine
        .insert(
            "posts",
            vec![
                doc! { "_id" => 1, "tags" => harborlite::array!["rust", "db"] },
                doc! { "_id" => 2, "tags" => harborlite::array!["rust"] },
                doc! { "_id" => 3, "tags" => harborlite::array!["cooking"] },
            ],
            AutoId::ObjectId,
        )
        .unwrap();
    engine
        .ensure_index("posts", "ix_tags", "$.tags[*]", false)
        .unwrap();

    let rust_posts: BTreeSet<i32> = engine
        .query(
            "posts",
            Query::all().and_where(Expression::parse("$.tags[*] = \"rust\"").unwrap()),
        )
        .unwrap()
        .to_vec()
        .unwrap()
        .iter()
        .map(|d| d.get("_id").unwrap().as_i32().unwrap())
        .collect();
    assert_eq!(rust_posts, BTreeSet::from([1, 2]));
}

#[test]
fn into_writes_results_to_target_collection() {
    let engine = memory_engine();
    insert_people(&engine, "people", 0..20);
    let copied = engine
        .query(
            "people",
            Query::all()
                .and_where(Expression::parse("$.age >= 30").unwrap())
                .into_collection("older"),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(engine.count("older", None).unwrap(), copied.len());
    assert!(!copied.is_empty());
}

#[test]
fn cursor_is_restartable() {
    let engine = memory_engine();
    insert_people(&engine, "people", 0..10);
    let mut cursor = engine.query("people", Query::all()).unwrap();
    let first: Vec<_> = cursor.by_ref().take(4).collect();
    assert_eq!(first.len(), 4);
    cursor.reset();
    let all: Vec<_> = cursor.collect();
    assert_eq!(all.len(), 10);
}

#[test]
fn min_max_through_index_ends() {
    let engine = memory_engine();
    insert_people(&engine, "people", 0..50);
    engine.ensure_index("people", "ix_age", "$.age", false).unwrap();
    let min = engine.min("people", "age").unwrap();
    let max = engine.max("people", "age").unwrap();
    assert_eq!(min, Value::Int32(20));
    assert_eq!(max, Value::Int32(69));
    assert!(engine
        .exists("people", Expression::parse("$.age = 42").unwrap())
        .unwrap());
}
