//! Vector index scenarios: cosine radius and top-k, dot-product thresholds,
//! dimension mismatches, updates forcing rebuilds, and drop accounting.

mod common;

use common::memory_engine;
use harborlite::{
    doc, AutoId, DbEngine, EngineSettings, Expression, Query, Value, VectorMetric,
};

fn embedded(id: i32, v: &[f32]) -> harborlite::Document {
    doc! { "_id" => id, "embedding" => v.to_vec() }
}

fn ids(docs: &[harborlite::Document]) -> Vec<i32> {
    docs.iter()
        .map(|d| d.get("_id").unwrap().as_i32().unwrap())
        .collect()
}

#[test]
fn cosine_radius_and_top_k() {
    let engine = memory_engine();
    engine
        .insert(
            "vectors",
            vec![
                embedded(1, &[1.0, 0.0]),
                embedded(2, &[0.0, 1.0]),
                embedded(3, &[1.0, 1.0]),
            ],
            AutoId::ObjectId,
        )
        .unwrap();
    engine
        .ensure_vector_index("vectors", "vx", "$.embedding", 2, VectorMetric::Cosine)
        .unwrap();

    let near = engine
        .query(
            "vectors",
            Query::all().near(Expression::parse("$.embedding").unwrap(), &[1.0, 0.0], 0.25),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(ids(&near), vec![1]);

    let top2 = engine
        .query(
            "vectors",
            Query::all().top_k_near(Expression::parse("$.embedding").unwrap(), &[1.0, 0.0], 2),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(ids(&top2), vec![1, 3]);
}

#[test]
fn dot_product_threshold_is_min_similarity() {
    let engine = memory_engine();
    engine
        .insert(
            "vectors",
            vec![
                embedded(1, &[1.0, 0.0]),
                embedded(2, &[0.6, 0.6]),
                embedded(3, &[0.0, 1.0]),
            ],
            AutoId::ObjectId,
        )
        .unwrap();
    engine
        .ensure_vector_index("vectors", "vx", "$.embedding", 2, VectorMetric::DotProduct)
        .unwrap();

    let strict = engine
        .query(
            "vectors",
            Query::all().near(Expression::parse("$.embedding").unwrap(), &[1.0, 0.0], 0.75),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(ids(&strict), vec![1]);

    let loose = engine
        .query(
            "vectors",
            Query::all().near(Expression::parse("$.embedding").unwrap(), &[1.0, 0.0], 0.4),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(ids(&loose), vec![1, 2]);
}

#[test]
fn mismatched_dimensions_stay_out_of_the_index() {
    let engine = memory_engine();
    engine
        .insert(
            "vectors",
            vec![
                embedded(1, &[1.0, 0.0]),
                doc! { "_id" => 2, "embedding" => vec![1.0f32, 0.0, 0.0] },
            ],
            AutoId::ObjectId,
        )
        .unwrap();
    engine
        .ensure_vector_index("vectors", "vx", "$.embedding", 2, VectorMetric::Euclidean)
        .unwrap();

    // the 3-dim document is stored but absent from the 2-dim index
    let all = engine
        .query(
            "vectors",
            Query::all().near(
                Expression::parse("$.embedding").unwrap(),
                &[1.0, 0.0],
                f64::MAX,
            ),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(ids(&all), vec![1]);
    assert_eq!(engine.count("vectors", None).unwrap(), 2);

    // a mismatched-dimension query falls back to a scan plan
    let plan = engine
        .get_plan(
            "vectors",
            Query::all().near(
                Expression::parse("$.embedding").unwrap(),
                &[1.0, 0.0, 0.0],
                0.5,
            ),
        )
        .unwrap();
    assert_ne!(plan.get("mode").unwrap().as_str(), Some("vector search"));
}

#[test]
fn update_rebuilds_the_tree() {
    let engine = memory_engine();
    engine
        .insert(
            "vectors",
            vec![embedded(1, &[1.0, 0.0]), embedded(2, &[0.0, 1.0])],
            AutoId::ObjectId,
        )
        .unwrap();
    engine
        .ensure_vector_index("vectors", "vx", "$.embedding", 2, VectorMetric::Euclidean)
        .unwrap();

    // move vector 2 close to the target
    engine
        .update("vectors", vec![embedded(2, &[0.9, 0.1])])
        .unwrap();
    let top = engine
        .query(
            "vectors",
            Query::all().top_k_near(Expression::parse("$.embedding").unwrap(), &[1.0, 0.0], 1),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(ids(&top), vec![1]);

    engine.delete("vectors", &Value::Int32(1)).unwrap();
    let top = engine
        .query(
            "vectors",
            Query::all().top_k_near(Expression::parse("$.embedding").unwrap(), &[1.0, 0.0], 1),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(ids(&top), vec![2]);
}

#[test]
fn unbounded_search_returns_all_matching_dimension() {
    let engine = memory_engine();
    let docs: Vec<_> = (0..64)
        .map(|i| embedded(i, &[i as f32, (i % 7) as f32]))
        .collect();
    engine.insert("vectors", docs, AutoId::ObjectId).unwrap();
    engine
        .ensure_vector_index("vectors", "vx", "$.embedding", 2, VectorMetric::Euclidean)
        .unwrap();
    let all = engine
        .query(
            "vectors",
            Query::all().near(
                Expression::parse("$.embedding").unwrap(),
                &[0.0, 0.0],
                f64::MAX,
            ),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(all.len(), 64);
}

/// Dropping a collection with a vector index releases its VectorIndex pages
/// back to empties once a checkpoint relocates them.
#[test]
fn drop_collection_releases_vector_pages() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let settings = EngineSettings {
        filename: dir.path().join("v.db").to_string_lossy().to_string(),
        ..EngineSettings::default()
    };
    let path = settings.filename.clone();

    let engine = DbEngine::open(settings.clone()).unwrap();
    let docs: Vec<_> = (0..8)
        .map(|i| doc! { "_id" => i, "embedding" => vec![i as f32, 1.0, 2.0, 3.0, 4.0, 5.0] })
        .collect();
    engine.insert("vectors", docs, AutoId::ObjectId).unwrap();
    engine
        .ensure_vector_index("vectors", "vx", "$.embedding", 6, VectorMetric::Cosine)
        .unwrap();
    engine.checkpoint().unwrap();

    let before = count_vector_pages(&path);
    assert!(before > 0);

    engine.drop_collection("vectors").unwrap();
    engine.checkpoint().unwrap();
    let after = count_vector_pages(&path);
    assert!(after < before, "expected {after} < {before}");
}

fn count_vector_pages(path: &str) -> usize {
    const PAGE_SIZE: usize = 8192;
    let bytes = std::fs::read(path).unwrap();
    bytes
        .chunks(PAGE_SIZE)
        .filter(|page| page.len() == PAGE_SIZE && page[12] == 5)
        .count()
}
