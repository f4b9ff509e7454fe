#![allow(dead_code)]

use std::sync::Once;

use harborlite::{doc, AutoId, DbEngine, Document, EngineSettings};

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn memory_engine() -> DbEngine {
    setup();
    DbEngine::open(EngineSettings::default()).unwrap()
}

pub fn file_settings(dir: &tempfile::TempDir) -> EngineSettings {
    setup();
    EngineSettings {
        filename: dir.path().join("test.db").to_string_lossy().to_string(),
        ..EngineSettings::default()
    }
}

pub fn person(id: i32, name: &str, age: i32) -> Document {
    doc! { "_id" => id, "name" => name, "age" => age }
}

pub fn insert_people(engine: &DbEngine, collection: &str, range: std::ops::Range<i32>) {
    let docs: Vec<Document> = range
        .map(|i| person(i, &format!("person-{i}"), 20 + (i % 50)))
        .collect();
    engine.insert(collection, docs, AutoId::ObjectId).unwrap();
}
