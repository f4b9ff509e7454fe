// HarborLite - embedded serverless document database
// Core library module

pub mod bson;
pub mod cancel;
pub mod collection;
pub mod config;
pub mod engine;
pub mod error;
pub mod expr;
pub mod index;
pub mod query;
pub mod rebuild;
pub mod storage;
pub mod transaction;

pub use bson::{Array, DateTime, Decimal, Document, ObjectId, Value};
pub use cancel::CancellationToken;
pub use config::{Collation, ConnectionString, EngineSettings};
pub use engine::{AutoId, Cursor, DbEngine};
pub use error::{DbError, Result};
pub use expr::Expression;
pub use index::Order;
pub use query::Query;
pub use rebuild::{RebuildOptions, RebuildReport};
pub use storage::collection_page::VectorMetric;
