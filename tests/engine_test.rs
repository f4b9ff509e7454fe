//! End-to-end engine behavior: CRUD, auto-ids, pragmas, persistence across
//! reopen, and the concurrency scenarios.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{file_settings, insert_people, memory_engine, person, setup};
use harborlite::{
    doc, AutoId, DbEngine, DbError, EngineSettings, Expression, Query, Value,
};

#[test]
fn insert_and_find_by_id() {
    let engine = memory_engine();
    let inserted = engine
        .insert("people", vec![person(1, "ada", 36)], AutoId::ObjectId)
        .unwrap();
    assert_eq!(inserted, 1);

    let found = engine
        .query(
            "people",
            Query::all().and_where(Expression::parse("$._id = 1").unwrap()),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("name").unwrap().as_str(), Some("ada"));
}

#[test]
fn insert_then_delete_then_find_nothing() {
    let engine = memory_engine();
    engine
        .insert("people", vec![person(1, "ada", 36)], AutoId::ObjectId)
        .unwrap();
    assert!(engine.delete("people", &Value::Int32(1)).unwrap());
    assert_eq!(engine.count("people", None).unwrap(), 0);
    assert!(!engine.delete("people", &Value::Int32(1)).unwrap());
}

#[test]
fn missing_id_gets_object_id() {
    let engine = memory_engine();
    engine
        .insert("notes", vec![doc! { "text" => "hello" }], AutoId::ObjectId)
        .unwrap();
    let docs = engine.query("notes", Query::all()).unwrap().to_vec().unwrap();
    assert!(matches!(docs[0].get("_id"), Some(Value::ObjectId(_))));
}

#[test]
fn auto_increment_ids() {
    let engine = memory_engine();
    engine
        .insert(
            "seq",
            vec![doc! { "v" => 1 }, doc! { "v" => 2 }],
            AutoId::Int64,
        )
        .unwrap();
    engine
        .insert("seq", vec![doc! { "v" => 3 }], AutoId::Int64)
        .unwrap();
    let ids: Vec<i64> = engine
        .query("seq", Query::all())
        .unwrap()
        .to_vec()
        .unwrap()
        .iter()
        .map(|d| d.get("_id").unwrap().as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[test]
fn invalid_ids_are_validation_errors() {
    let engine = memory_engine();
    let err = engine
        .insert(
            "x",
            vec![doc! { "_id" => Value::MinValue }],
            AutoId::ObjectId,
        )
        .unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
}

#[test]
fn update_and_upsert() {
    let engine = memory_engine();
    engine
        .insert("people", vec![person(1, "ada", 36)], AutoId::ObjectId)
        .unwrap();

    assert_eq!(
        engine
            .update("people", vec![person(1, "ada lovelace", 37)])
            .unwrap(),
        1
    );
    assert_eq!(engine.update("people", vec![person(9, "ghost", 1)]).unwrap(), 0);

    // upsert inserts the missing one and updates the existing one
    let inserted = engine
        .upsert(
            "people",
            vec![person(1, "ada byron", 37), person(2, "grace", 45)],
            AutoId::ObjectId,
        )
        .unwrap();
    assert_eq!(inserted, 1);
    assert_eq!(engine.count("people", None).unwrap(), 2);

    let ada = engine
        .query(
            "people",
            Query::all().and_where(Expression::parse("$._id = 1").unwrap()),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(ada[0].get("name").unwrap().as_str(), Some("ada byron"));
}

#[test]
fn update_many_applies_transform() {
    let engine = memory_engine();
    insert_people(&engine, "people", 0..10);
    let changed = engine
        .update_many(
            "people",
            Expression::parse("EXTEND($, {flagged: true})").unwrap(),
            Expression::parse("$.age >= 25").unwrap(),
        )
        .unwrap();
    assert!(changed > 0);
    let flagged = engine
        .count(
            "people",
            Some(Expression::parse("$.flagged = true").unwrap()),
        )
        .unwrap();
    assert_eq!(flagged, changed);
}

#[test]
fn delete_many_with_predicate() {
    let engine = memory_engine();
    insert_people(&engine, "people", 0..100);
    let deleted = engine
        .delete_many("people", Expression::parse("$._id < 50").unwrap())
        .unwrap();
    assert_eq!(deleted, 50);
    assert_eq!(engine.count("people", None).unwrap(), 50);
}

#[test]
fn collections_are_auto_created_and_listed() {
    let engine = memory_engine();
    engine
        .insert("alpha", vec![doc! { "x" => 1 }], AutoId::ObjectId)
        .unwrap();
    engine
        .insert("beta", vec![doc! { "x" => 1 }], AutoId::ObjectId)
        .unwrap();
    let mut names = engine.get_collection_names();
    names.sort();
    assert_eq!(names, vec!["alpha", "beta"]);

    // queries against unknown collections yield empty results
    assert_eq!(engine.count("gamma", None).unwrap(), 0);
    assert!(!engine.drop_collection("gamma").unwrap());
}

#[test]
fn rename_collection_keeps_documents() {
    let engine = memory_engine();
    insert_people(&engine, "old", 0..5);
    assert!(engine.rename_collection("old", "new").unwrap());
    assert_eq!(engine.count("new", None).unwrap(), 5);
    assert_eq!(engine.count("old", None).unwrap(), 0);
}

#[test]
fn pragmas_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let settings = file_settings(&dir);
    {
        let engine = DbEngine::open(settings.clone()).unwrap();
        engine
            .pragma_set("USER_VERSION", &Value::Int32(42))
            .unwrap();
        insert_people(&engine, "people", 0..10);
    }
    let engine = DbEngine::open(settings).unwrap();
    assert_eq!(
        engine.pragma_get("USER_VERSION").unwrap(),
        Value::Int32(42)
    );
    assert_eq!(engine.count("people", None).unwrap(), 10);
    assert!(matches!(
        engine.pragma_set("COLLATION", &Value::from("x")),
        Err(DbError::Usage(_))
    ));
}

#[test]
fn reopen_after_checkpoint_preserves_everything() {
    let dir = tempfile::tempdir().unwrap();
    let settings = file_settings(&dir);
    {
        let engine = DbEngine::open(settings.clone()).unwrap();
        insert_people(&engine, "people", 0..200);
        engine.ensure_index("people", "ix_age", "$.age", false).unwrap();
        engine.checkpoint().unwrap();
        engine.checkpoint().unwrap(); // applying twice equals applying once
    }
    let engine = DbEngine::open(settings).unwrap();
    assert_eq!(engine.count("people", None).unwrap(), 200);
    let (indexes, _) = engine.get_indexes("people").unwrap();
    assert!(indexes.iter().any(|(name, _, _)| name == "ix_age"));
}

#[test]
fn reopen_without_checkpoint_replays_log() {
    let dir = tempfile::tempdir().unwrap();
    let settings = file_settings(&dir);
    {
        let engine = DbEngine::open(settings.clone()).unwrap();
        insert_people(&engine, "people", 0..50);
        // drop without an explicit checkpoint; close-time checkpoint plus
        // log replay must agree
    }
    let engine = DbEngine::open(settings).unwrap();
    assert_eq!(engine.count("people", None).unwrap(), 50);
}

// ============================================================================
// Concurrency scenarios
// ============================================================================

/// A reader outside any transaction sees the pre-commit state, then the
/// post-commit state.
#[test]
fn dirty_read_isolation() {
    let engine = Arc::new(memory_engine());
    insert_people(&engine, "people", 0..100);

    assert!(engine.begin_trans().unwrap());
    insert_people(&engine, "people", 100..200);

    let reader = engine.clone();
    let counted = thread::spawn(move || reader.count("people", None).unwrap())
        .join()
        .unwrap();
    assert_eq!(counted, 100);

    assert!(engine.commit().unwrap());

    let reader = engine.clone();
    let counted = thread::spawn(move || reader.count("people", None).unwrap())
        .join()
        .unwrap();
    assert_eq!(counted, 200);
}

/// A second writer on the same collection times out while the first holds
/// its write lock, without corrupting anything.
#[test]
fn write_lock_timeout() {
    setup();
    let engine = Arc::new(DbEngine::open(EngineSettings::default()).unwrap());
    engine.pragma_set("TIMEOUT", &Value::Int32(1)).unwrap();
    insert_people(&engine, "people", 0..10);

    assert!(engine.begin_trans().unwrap());
    insert_people(&engine, "people", 10..110);

    let contender = engine.clone();
    let result = thread::spawn(move || {
        contender.begin_trans().unwrap();
        let result = contender.delete_many(
            "people",
            Expression::parse("1 = 1").unwrap(),
        );
        contender.rollback().unwrap();
        result
    })
    .join()
    .unwrap();
    assert!(matches!(result, Err(DbError::LockTimeout(_))));

    assert!(engine.commit().unwrap());
    assert_eq!(engine.count("people", None).unwrap(), 110);
}

#[test]
fn begin_trans_twice_reports_already_open() {
    let engine = memory_engine();
    assert!(engine.begin_trans().unwrap());
    assert!(!engine.begin_trans().unwrap());
    assert!(engine.rollback().unwrap());
    assert!(!engine.rollback().unwrap());
}

#[test]
fn rollback_discards_changes() {
    let engine = memory_engine();
    insert_people(&engine, "people", 0..10);
    engine.begin_trans().unwrap();
    insert_people(&engine, "people", 10..20);
    assert_eq!(engine.count("people", None).unwrap(), 20);
    engine.rollback().unwrap();
    assert_eq!(engine.count("people", None).unwrap(), 10);
}

#[test]
fn cancellation_rolls_back_bulk_write() {
    let engine = memory_engine();
    insert_people(&engine, "people", 0..5);
    let token = engine.cancellation_token();
    token.cancel();
    let err = engine
        .insert("people", vec![person(100, "late", 1)], AutoId::ObjectId)
        .unwrap_err();
    assert!(matches!(err, DbError::Cancelled));
}

#[test]
fn concurrent_readers_share_the_gate() {
    let engine = Arc::new(memory_engine());
    insert_people(&engine, "people", 0..500);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let reader = engine.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..10 {
                assert_eq!(reader.count("people", None).unwrap(), 500);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn concurrent_writers_on_distinct_collections() {
    let engine = Arc::new(memory_engine());
    let mut handles = Vec::new();
    for n in 0..4 {
        let writer = engine.clone();
        handles.push(thread::spawn(move || {
            let name = format!("col-{n}");
            for chunk in 0..5 {
                let docs: Vec<_> = (0..20)
                    .map(|i| doc! { "_id" => chunk * 20 + i, "w" => n })
                    .collect();
                writer.insert(&name, docs, AutoId::ObjectId).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    for n in 0..4 {
        assert_eq!(engine.count(&format!("col-{n}"), None).unwrap(), 100);
    }
}

#[test]
fn lock_timeout_has_expected_latency() {
    setup();
    let engine = Arc::new(DbEngine::open(EngineSettings::default()).unwrap());
    engine.pragma_set("TIMEOUT", &Value::Int32(1)).unwrap();
    engine.begin_trans().unwrap();
    insert_people(&engine, "people", 0..1);

    let contender = engine.clone();
    let start = std::time::Instant::now();
    let result = thread::spawn(move || {
        contender.delete_many("people", Expression::parse("1 = 1").unwrap())
    })
    .join()
    .unwrap();
    let waited = start.elapsed();
    assert!(matches!(result, Err(DbError::LockTimeout(_))));
    assert!(waited >= Duration::from_millis(900), "waited {waited:?}");
    engine.rollback().unwrap();
}
