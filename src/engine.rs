//! Engine handle: open/recover, the public operation surface, per-thread
//! explicit transactions, auto-transactions around single operations, and
//! checkpointing.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bson::{Document, ObjectId, Value};
use crate::cancel::CancellationToken;
use crate::collection;
use crate::config::{Collation, ConnectionString, EngineSettings};
use crate::error::{DbError, Result};
use crate::expr::Expression;
use crate::index::skiplist::{self, Order};
use crate::query::{executor, planner, Query, QueryPlan};
use crate::storage::aes::AesStream;
use crate::storage::collection_page::VectorMetric;
use crate::storage::disk::DiskService;
use crate::storage::header::HeaderPage;
use crate::storage::page::PAGE_SIZE;
use crate::storage::stream::{StreamFactory, StreamKind};
use crate::storage::wal::WalIndex;
use crate::transaction::{
    EngineServices, LockMode, Snapshot, Transaction, TransactionMode, TransactionMonitor,
};

/// `_id` generation strategy for inserts without an explicit id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AutoId {
    #[default]
    ObjectId,
    Int64,
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug)]
pub struct DbEngine {
    services: Arc<EngineServices>,
    monitor: TransactionMonitor,
    cancel: CancellationToken,
    /// Auto-increment `_id` cache per collection.
    sequences: Mutex<HashMap<String, i64>>,
}

impl DbEngine {
    /// Open (or create) a database from a connection string.
    pub fn connect(connection: &str) -> Result<DbEngine> {
        let conn = ConnectionString::from_str(connection)?;
        Self::open(EngineSettings::from_connection_string(&conn))
    }

    /// Open (or create) a database with explicit settings.
    ///
    /// With `auto_rebuild` set, structural corruption found during open
    /// triggers an offline rebuild (bounded by the cooldown); the failure
    /// then surfaces as [`DbError::Rebuilt`] so the caller can retry against
    /// the repaired file.
    pub fn open(settings: EngineSettings) -> Result<DbEngine> {
        match Self::open_services(settings.clone()) {
            Ok(services) => {
                info!(
                    filename = services.settings.filename.as_str(),
                    "database opened"
                );
                Ok(DbEngine {
                    services,
                    monitor: TransactionMonitor::new(),
                    cancel: CancellationToken::new(),
                    sequences: Mutex::new(HashMap::new()),
                })
            }
            Err(DbError::Corruption(message))
                if settings.auto_rebuild && crate::rebuild::cooldown_allows(&settings) =>
            {
                warn!(error = message.as_str(), "corrupt database; rebuilding");
                let options = crate::rebuild::RebuildOptions {
                    password: settings.password.clone(),
                    collation: None,
                };
                crate::rebuild::rebuild_file(&settings, &options)?;
                crate::rebuild::mark_rebuilt(&settings);
                Err(DbError::Rebuilt(message))
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn open_services(settings: EngineSettings) -> Result<Arc<EngineServices>> {
        let factory = StreamFactory::new(settings.clone());
        factory.delete(StreamKind::Temp)?;

        let exists = factory.data_exists()?;
        let (disk, wal, header) = if exists {
            Self::open_existing(&factory, &settings)?
        } else {
            Self::create_new(&factory, &settings)?
        };
        Ok(Arc::new(EngineServices::new(disk, wal, header, settings)))
    }

    fn open_existing(
        factory: &StreamFactory,
        settings: &EngineSettings,
    ) -> Result<(DiskService, WalIndex, HeaderPage)> {
        // probe the plaintext prefix for the magic and salt before any
        // cipher is stacked
        let mut page0 = vec![0u8; PAGE_SIZE];
        factory
            .open_raw(StreamKind::Data)?
            .read_page(0, &mut page0)?;
        let salt = HeaderPage::read_salt(&page0)?;
        let encrypted = salt != [0u8; 16];
        match (&settings.password, encrypted) {
            (Some(password), true) => factory.set_crypto(AesStream::new(password, salt)),
            (Some(_), false) => {
                return Err(DbError::crypto("file is not encrypted but a password was given"))
            }
            (None, true) => return Err(DbError::crypto("encrypted file requires a password")),
            (None, false) => {}
        }

        let disk = DiskService::new(factory, settings.cache_size)?;
        let wal = WalIndex::new();
        wal.restore(&disk)?;

        // the header itself may have a newer confirmed version in the log
        let header_page = match wal.get_page_position(0, wal.current_version()) {
            Some(position) => disk.read_log_page(position)?,
            None => disk.read_data_page(0)?,
        };
        let header = HeaderPage::load(&header_page)?;
        Ok((disk, wal, header))
    }

    fn create_new(
        factory: &StreamFactory,
        settings: &EngineSettings,
    ) -> Result<(DiskService, WalIndex, HeaderPage)> {
        if settings.read_only {
            return Err(DbError::usage("cannot create a database in read-only mode"));
        }
        let salt = match &settings.password {
            Some(password) => {
                let salt = AesStream::generate_salt();
                factory.set_crypto(AesStream::new(password, salt));
                salt
            }
            None => [0u8; 16],
        };
        let disk = DiskService::new(factory, settings.cache_size)?;
        let header = HeaderPage::create(settings, salt);
        disk.write_data_page(&header.to_page())?;
        disk.ensure_data_size(settings.initial_size)?;
        disk.flush_data()?;
        debug!("new database file initialized");
        Ok((disk, WalIndex::new(), header))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.services.settings
    }

    pub fn collation(&self) -> Collation {
        self.services.header.pragmas.collation.clone()
    }

    /// Engine-wide cancellation token, observed at safepoints and page I/O
    /// boundaries of every running operation.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cache_stats(&self) -> crate::storage::cache::CacheStats {
        self.services.disk.cache_stats()
    }

    // ------------------------------------------------------------------
    // Explicit transactions
    // ------------------------------------------------------------------

    /// Begin an explicit transaction on this thread; false when one is
    /// already open.
    pub fn begin_trans(&self) -> Result<bool> {
        if self.monitor.current().is_some() {
            return Ok(false);
        }
        let tx = Transaction::new(
            self.services.clone(),
            TransactionMode::Write,
            true,
            self.cancel.clone(),
        )?;
        Ok(self.monitor.register(Arc::new(Mutex::new(tx))))
    }

    /// Commit this thread's transaction; false when none is open.
    pub fn commit(&self) -> Result<bool> {
        let Some(slot) = self.monitor.take() else {
            return Ok(false);
        };
        slot.lock().commit()?;
        self.try_auto_checkpoint();
        Ok(true)
    }

    /// Roll back this thread's transaction; false when none is open.
    pub fn rollback(&self) -> Result<bool> {
        let Some(slot) = self.monitor.take() else {
            return Ok(false);
        };
        slot.lock().rollback()?;
        Ok(true)
    }

    /// Run `f` inside the current explicit transaction, or inside a
    /// dedicated auto-transaction committed on success.
    fn auto_transaction<R>(
        &self,
        mode: TransactionMode,
        f: impl FnOnce(&mut Transaction) -> Result<R>,
    ) -> Result<R> {
        if let Some(slot) = self.monitor.current() {
            let mut tx = slot.lock();
            if tx.is_finalized() {
                drop(tx);
                self.monitor.take();
                return Err(DbError::Concurrency(
                    "current transaction is already finalized".to_string(),
                ));
            }
            match f(&mut tx) {
                Err(e) if e.aborts_transaction() => {
                    let _ = tx.rollback();
                    drop(tx);
                    self.monitor.take();
                    Err(e)
                }
                other => other,
            }
        } else {
            let mut tx =
                Transaction::new(self.services.clone(), mode, false, self.cancel.clone())?;
            match f(&mut tx) {
                Ok(value) => {
                    tx.commit()?;
                    self.try_auto_checkpoint();
                    Ok(value)
                }
                Err(e) => {
                    let _ = tx.rollback();
                    Err(e)
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Write operations
    // ------------------------------------------------------------------

    /// Insert documents; returns how many were stored.
    pub fn insert(&self, collection: &str, docs: Vec<Document>, auto_id: AutoId) -> Result<usize> {
        self.auto_transaction(TransactionMode::Write, |tx| {
            let mut meta = Self::write_collection_or_create(tx, collection)?;
            let collation = self.collation();
            let mut count = 0usize;
            for mut doc in docs {
                let fallback = self.generate_id(tx, &meta, collection, auto_id)?;
                collection::insert_document(tx, &mut meta, &collation, &mut doc, fallback)?;
                count += 1;
                tx.safepoint()?;
            }
            collection::save_meta(tx, &meta)?;
            Ok(count)
        })
    }

    /// Update documents by `_id`; returns how many existed.
    pub fn update(&self, collection: &str, docs: Vec<Document>) -> Result<usize> {
        self.auto_transaction(TransactionMode::Write, |tx| {
            let Some(mut meta) = Self::write_collection(tx, collection)? else {
                return Ok(0);
            };
            let collation = self.collation();
            let mut count = 0usize;
            for doc in &docs {
                if collection::update_document(tx, &mut meta, &collation, doc)? {
                    count += 1;
                }
                tx.safepoint()?;
            }
            collection::save_meta(tx, &meta)?;
            Ok(count)
        })
    }

    /// Update-or-insert; returns how many inserts happened.
    pub fn upsert(
        &self,
        collection: &str,
        docs: Vec<Document>,
        auto_id: AutoId,
    ) -> Result<usize> {
        self.auto_transaction(TransactionMode::Write, |tx| {
            let mut meta = Self::write_collection_or_create(tx, collection)?;
            let collation = self.collation();
            let mut inserted = 0usize;
            for mut doc in docs {
                let fallback = self.generate_id(tx, &meta, collection, auto_id)?;
                if collection::upsert_document(tx, &mut meta, &collation, &mut doc, fallback)? {
                    inserted += 1;
                }
                tx.safepoint()?;
            }
            collection::save_meta(tx, &meta)?;
            Ok(inserted)
        })
    }

    /// Apply an EXTEND-style transform to every document matching the
    /// predicate; returns how many changed.
    pub fn update_many(
        &self,
        collection: &str,
        transform: Expression,
        predicate: Expression,
    ) -> Result<usize> {
        if !transform.is_scalar() {
            return Err(DbError::usage("update transform must be a scalar expression"));
        }
        self.auto_transaction(TransactionMode::Write, |tx| {
            let Some(mut meta) = Self::write_collection(tx, collection)? else {
                return Ok(0);
            };
            let collation = self.collation();
            let plan = planner::plan(
                collection,
                &Query::all().and_where(predicate.clone()),
                &meta,
                &collation,
            )?;
            let matches = executor::execute(tx, Some(&meta), &plan, &collation)?;
            let mut count = 0usize;
            for doc in matches {
                let transformed = transform.eval_scalar(&doc, &collation);
                let Value::Document(mut new_doc) = transformed else {
                    return Err(DbError::usage(
                        "update transform must evaluate to a document",
                    ));
                };
                // the primary key never changes through UpdateMany
                if let Some(id) = doc.get("_id") {
                    new_doc.insert("_id", id.clone());
                }
                if collection::update_document(tx, &mut meta, &collation, &new_doc)? {
                    count += 1;
                }
                tx.safepoint()?;
            }
            collection::save_meta(tx, &meta)?;
            Ok(count)
        })
    }

    /// Delete one document by id.
    pub fn delete(&self, collection: &str, id: &Value) -> Result<bool> {
        self.auto_transaction(TransactionMode::Write, |tx| {
            let Some(mut meta) = Self::write_collection(tx, collection)? else {
                return Ok(false);
            };
            let collation = self.collation();
            let deleted = collection::delete_document(tx, &mut meta, &collation, id)?;
            collection::save_meta(tx, &meta)?;
            Ok(deleted)
        })
    }

    /// Delete every document matching the predicate; returns the count.
    pub fn delete_many(&self, collection: &str, predicate: Expression) -> Result<usize> {
        self.auto_transaction(TransactionMode::Write, |tx| {
            let Some(mut meta) = Self::write_collection(tx, collection)? else {
                return Ok(0);
            };
            let collation = self.collation();
            let plan = planner::plan(
                collection,
                &Query::all().and_where(predicate.clone()),
                &meta,
                &collation,
            )?;
            let matches = executor::execute(tx, Some(&meta), &plan, &collation)?;
            let mut count = 0usize;
            for doc in matches {
                if let Some(id) = doc.get("_id") {
                    if collection::delete_document(tx, &mut meta, &collation, id)? {
                        count += 1;
                    }
                }
                tx.safepoint()?;
            }
            collection::save_meta(tx, &meta)?;
            Ok(count)
        })
    }

    /// Open a write snapshot over an existing collection.
    fn write_collection(
        tx: &mut Transaction,
        name: &str,
    ) -> Result<Option<crate::storage::collection_page::CollectionMeta>> {
        Ok(Snapshot::open(tx, name, LockMode::Write)?.meta)
    }

    /// Open a write snapshot, creating the collection when missing.
    fn write_collection_or_create(
        tx: &mut Transaction,
        name: &str,
    ) -> Result<crate::storage::collection_page::CollectionMeta> {
        match Snapshot::open(tx, name, LockMode::Write)?.meta {
            Some(meta) => Ok(meta),
            None => collection::create_collection(tx, name),
        }
    }

    fn generate_id(
        &self,
        tx: &mut Transaction,
        meta: &crate::storage::collection_page::CollectionMeta,
        collection: &str,
        auto_id: AutoId,
    ) -> Result<Value> {
        match auto_id {
            AutoId::ObjectId => Ok(Value::ObjectId(ObjectId::new())),
            AutoId::Int64 => {
                let mut sequences = self.sequences.lock();
                let next = match sequences.get(&collection.to_ascii_lowercase()) {
                    Some(last) => last + 1,
                    None => {
                        // seed from the current greatest numeric key
                        let pk = meta.pk_index()?.clone();
                        let greatest =
                            skiplist::first(tx, &pk, Order::Descending)?.and_then(|n| n.key.as_i64());
                        greatest.unwrap_or(0) + 1
                    }
                };
                sequences.insert(collection.to_ascii_lowercase(), next);
                Ok(Value::Int64(next))
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Run a query and return its cursor. Outside an explicit transaction
    /// the cursor owns an auto-transaction that ends when it is dropped.
    pub fn query(&self, collection: &str, query: Query) -> Result<Cursor> {
        let collation = self.collation();
        let write_mode = query.for_update || query.into.is_some();

        let (slot, owns) = match self.monitor.current() {
            Some(slot) => (slot, false),
            None => {
                let mode = if write_mode {
                    TransactionMode::Write
                } else {
                    TransactionMode::Read
                };
                let tx =
                    Transaction::new(self.services.clone(), mode, false, self.cancel.clone())?;
                (Arc::new(Mutex::new(tx)), true)
            }
        };

        type PlanAndMeta = (QueryPlan, Option<crate::storage::collection_page::CollectionMeta>);
        let result = (|| -> Result<PlanAndMeta> {
            let mut tx = slot.lock();
            let mode = if write_mode {
                LockMode::Write
            } else {
                LockMode::Read
            };
            let snapshot = Snapshot::open(&mut tx, collection, mode)?;
            let meta = snapshot.meta;
            let plan = match &meta {
                Some(meta) => planner::plan(collection, &query, meta, &collation)?,
                None => planner::plan(
                    collection,
                    &query,
                    &crate::storage::collection_page::CollectionMeta::new(0, collection),
                    &collation,
                )?,
            };
            Ok((plan, meta))
        })();

        match result {
            Ok((plan, meta)) => {
                let mut cursor = Cursor {
                    engine: self,
                    slot,
                    owns_tx: owns,
                    plan,
                    meta,
                    collation,
                    into: query.into.clone(),
                    buffer: None,
                    finished: false,
                };
                if cursor.into.is_some() {
                    cursor.fill()?;
                }
                Ok(cursor)
            }
            Err(e) => {
                if owns {
                    let _ = slot.lock().rollback();
                }
                Err(e)
            }
        }
    }

    /// Explain: the chosen plan as a document, without executing.
    pub fn get_plan(&self, collection: &str, query: Query) -> Result<Document> {
        let collation = self.collation();
        self.auto_transaction(TransactionMode::Read, |tx| {
            let snapshot = Snapshot::open(tx, collection, LockMode::Read)?;
            let meta = snapshot
                .meta
                .unwrap_or_else(|| crate::storage::collection_page::CollectionMeta::new(0, collection));
            Ok(planner::plan(collection, &query, &meta, &collation)?.to_document())
        })
    }

    pub fn count(&self, collection: &str, predicate: Option<Expression>) -> Result<usize> {
        let mut query = Query::all();
        if let Some(predicate) = predicate {
            query = query.and_where(predicate);
        }
        Ok(self.query(collection, query)?.to_vec()?.len())
    }

    pub fn exists(&self, collection: &str, predicate: Expression) -> Result<bool> {
        Ok(self
            .query(collection, Query::all().and_where(predicate).limit(1))?
            .to_vec()?
            .first()
            .is_some())
    }

    /// Smallest value of a field, via an ordered index end when one exists.
    pub fn min(&self, collection: &str, field: &str) -> Result<Value> {
        self.field_end(collection, field, Order::Ascending)
    }

    pub fn max(&self, collection: &str, field: &str) -> Result<Value> {
        self.field_end(collection, field, Order::Descending)
    }

    fn field_end(&self, collection: &str, field: &str, order: Order) -> Result<Value> {
        let expr = Expression::field(field);
        let collation = self.collation();
        self.auto_transaction(TransactionMode::Read, |tx| {
            let snapshot = Snapshot::open(tx, collection, LockMode::Read)?;
            let Some(meta) = snapshot.meta else {
                return Ok(Value::Null);
            };
            if let Some(index) = meta.find_index_by_expression(expr.source()) {
                let index = index.clone();
                return Ok(skiplist::first(tx, &index, order)?
                    .map(|n| n.key)
                    .unwrap_or(Value::Null));
            }
            // no index: scan and fold
            let plan = planner::plan(collection, &Query::all(), &meta, &collation)?;
            let docs = executor::execute(tx, Some(&meta), &plan, &collation)?;
            let mut best = Value::Null;
            for doc in docs {
                let value = expr.eval_scalar(&doc, &collation);
                if value.is_null() {
                    continue;
                }
                let better = best.is_null()
                    || match order {
                        Order::Ascending => {
                            value.total_cmp(&best, &collation) == std::cmp::Ordering::Less
                        }
                        Order::Descending => {
                            value.total_cmp(&best, &collation) == std::cmp::Ordering::Greater
                        }
                    };
                if better {
                    best = value;
                }
            }
            Ok(best)
        })
    }

    // ------------------------------------------------------------------
    // Schema operations (exclusive gate)
    // ------------------------------------------------------------------

    /// Run `f` under the exclusive writer gate with a gate-free transaction.
    fn exclusive_op<R>(&self, f: impl FnOnce(&mut Transaction) -> Result<R>) -> Result<R> {
        if self.monitor.current().is_some() {
            return Err(DbError::Concurrency(
                "schema operations cannot run inside an open transaction".to_string(),
            ));
        }
        let timeout = self.services.header.pragmas.timeout_duration();
        self.services.locks.enter_exclusive(timeout)?;
        let result = (|| {
            let mut tx = Transaction::new_in_exclusive(
                self.services.clone(),
                self.cancel.clone(),
            )?;
            match f(&mut tx) {
                Ok(value) => {
                    tx.commit()?;
                    Ok(value)
                }
                Err(e) => {
                    let _ = tx.rollback();
                    Err(e)
                }
            }
        })();
        self.services.locks.exit_exclusive();
        self.try_auto_checkpoint();
        result
    }

    pub fn ensure_index(
        &self,
        collection: &str,
        name: &str,
        expression: &str,
        unique: bool,
    ) -> Result<bool> {
        let expression = Expression::parse(expression)?;
        let collation = self.collation();
        self.exclusive_op(|tx| {
            let mut meta = Self::write_collection_or_create(tx, collection)?;
            let created =
                collection::ensure_index(tx, &mut meta, &collation, name, expression, unique)?;
            collection::save_meta(tx, &meta)?;
            Ok(created)
        })
    }

    pub fn ensure_vector_index(
        &self,
        collection: &str,
        name: &str,
        expression: &str,
        dimensions: u16,
        metric: VectorMetric,
    ) -> Result<bool> {
        let expression = Expression::parse(expression)?;
        let collation = self.collation();
        self.exclusive_op(|tx| {
            let mut meta = Self::write_collection_or_create(tx, collection)?;
            let created = collection::ensure_vector_index(
                tx,
                &mut meta,
                &collation,
                name,
                expression,
                dimensions,
                metric,
            )?;
            collection::save_meta(tx, &meta)?;
            Ok(created)
        })
    }

    pub fn drop_index(&self, collection: &str, name: &str) -> Result<bool> {
        self.exclusive_op(|tx| {
            let Some(mut meta) = Self::write_collection(tx, collection)? else {
                return Ok(false);
            };
            let dropped = collection::drop_index(tx, &mut meta, name)?;
            collection::save_meta(tx, &meta)?;
            Ok(dropped)
        })
    }

    pub fn drop_collection(&self, name: &str) -> Result<bool> {
        let dropped = self.exclusive_op(|tx| {
            let Some(mut meta) = Self::write_collection(tx, name)? else {
                return Ok(false);
            };
            collection::drop_collection(tx, &mut meta, name)?;
            Ok(true)
        })?;
        if dropped {
            self.sequences.lock().remove(&name.to_ascii_lowercase());
        }
        Ok(dropped)
    }

    pub fn rename_collection(&self, old_name: &str, new_name: &str) -> Result<bool> {
        self.exclusive_op(|tx| {
            if tx.resolve_collection(old_name).is_none() {
                return Ok(false);
            }
            self.services.header.rename_collection(old_name, new_name)?;
            tx.mark_header_dirty();
            Ok(true)
        })
    }

    pub fn get_collection_names(&self) -> Vec<String> {
        self.services.header.collection_names()
    }

    /// Index descriptors of a collection: (name, expression, unique) plus
    /// (name, expression, dimensions, metric) for vector indexes.
    #[allow(clippy::type_complexity)]
    pub fn get_indexes(
        &self,
        collection: &str,
    ) -> Result<(Vec<(String, String, bool)>, Vec<(String, String, u16, VectorMetric)>)> {
        self.auto_transaction(TransactionMode::Read, |tx| {
            let snapshot = Snapshot::open(tx, collection, LockMode::Read)?;
            let Some(meta) = snapshot.meta else {
                return Ok((Vec::new(), Vec::new()));
            };
            Ok((
                meta.indexes
                    .iter()
                    .map(|i| (i.name.clone(), i.expression.source().to_string(), i.unique))
                    .collect(),
                meta.vector_indexes
                    .iter()
                    .map(|i| {
                        (
                            i.name.clone(),
                            i.expression.source().to_string(),
                            i.dimensions,
                            i.metric,
                        )
                    })
                    .collect(),
            ))
        })
    }

    // ------------------------------------------------------------------
    // Pragmas / checkpoint
    // ------------------------------------------------------------------

    pub fn pragma_get(&self, name: &str) -> Result<Value> {
        self.services.header.pragmas.get(name)
    }

    /// Set a writable pragma; persists through an exclusive mini-commit.
    pub fn pragma_set(&self, name: &str, value: &Value) -> Result<()> {
        self.exclusive_op(|tx| {
            self.services.header.pragmas.set(name, value)?;
            tx.mark_header_dirty();
            Ok(())
        })
    }

    /// Copy confirmed log pages into the data file and truncate the log.
    pub fn checkpoint(&self) -> Result<usize> {
        if self.monitor.current().is_some() {
            return Err(DbError::Concurrency(
                "checkpoint cannot run inside an open transaction".to_string(),
            ));
        }
        let timeout = self.services.header.pragmas.timeout_duration();
        self.services.locks.enter_exclusive(timeout)?;
        let result = self
            .services
            .wal
            .checkpoint(&self.services.disk, &self.services.header);
        self.services.locks.exit_exclusive();
        result
    }

    /// Opportunistic checkpoint once the log passes the CHECKPOINT pragma.
    fn try_auto_checkpoint(&self) {
        let threshold = self
            .services
            .header
            .pragmas
            .checkpoint
            .load(std::sync::atomic::Ordering::Relaxed) as u64;
        if threshold == 0 || self.services.disk.log_page_count() < threshold {
            return;
        }
        if !self.services.locks.try_enter_exclusive() {
            return;
        }
        let result = self
            .services
            .wal
            .checkpoint(&self.services.disk, &self.services.header);
        self.services.locks.exit_exclusive();
        if let Err(e) = result {
            warn!(error = %e, "auto-checkpoint failed");
        }
    }

}

impl Drop for DbEngine {
    fn drop(&mut self) {
        // best-effort checkpoint on close, then clean the temp spill file
        if !self.services.settings.read_only && self.services.locks.try_enter_exclusive() {
            if let Err(e) = self
                .services
                .wal
                .checkpoint(&self.services.disk, &self.services.header)
            {
                warn!(error = %e, "checkpoint on close failed");
            }
            self.services.locks.exit_exclusive();
        }
        let _ = self.services.factory.delete(StreamKind::Temp);
        info!(
            filename = self.services.settings.filename.as_str(),
            "database closed"
        );
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// Lazy, restartable query result. Execution happens on the first pull; an
/// auto-transaction backing the cursor ends when the cursor is dropped, so a
/// `for_update` cursor holds its collection lock until closed.
pub struct Cursor<'a> {
    engine: &'a DbEngine,
    slot: Arc<Mutex<Transaction>>,
    owns_tx: bool,
    plan: QueryPlan,
    meta: Option<crate::storage::collection_page::CollectionMeta>,
    collation: Collation,
    into: Option<String>,
    buffer: Option<VecDeque<Document>>,
    finished: bool,
}

impl<'a> Cursor<'a> {
    fn fill(&mut self) -> Result<()> {
        if self.buffer.is_some() {
            return Ok(());
        }
        let docs = {
            let mut tx = self.slot.lock();
            executor::execute(&mut tx, self.meta.as_ref(), &self.plan, &self.collation)?
        };

        // INTO: write results to the target collection inside the same
        // transaction
        if let Some(target) = self.into.clone() {
            let mut tx = self.slot.lock();
            let mut meta = DbEngine::write_collection_or_create(&mut tx, &target)?;
            for doc in &docs {
                let mut doc = doc.clone();
                let fallback = Value::ObjectId(ObjectId::new());
                collection::insert_document(&mut tx, &mut meta, &self.collation, &mut doc, fallback)?;
                tx.safepoint()?;
            }
            collection::save_meta(&mut tx, &meta)?;
        }

        self.buffer = Some(docs.into());
        Ok(())
    }

    /// Restart the sequence from the beginning (re-executes the plan).
    pub fn reset(&mut self) {
        self.buffer = None;
        self.finished = false;
    }

    /// Drain the remaining documents.
    pub fn to_vec(mut self) -> Result<Vec<Document>> {
        self.fill()?;
        let docs: Vec<Document> = self.buffer.take().map(Vec::from).unwrap_or_default();
        self.close()?;
        Ok(docs)
    }

    fn close(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if self.owns_tx {
            {
                let mut tx = self.slot.lock();
                if !tx.is_finalized() {
                    tx.commit()?;
                }
            }
            self.engine.try_auto_checkpoint();
        }
        Ok(())
    }

    pub fn plan(&self) -> Document {
        self.plan.to_document()
    }
}

impl<'a> Iterator for Cursor<'a> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished && self.buffer.as_ref().map_or(true, |b| b.is_empty()) {
            return None;
        }
        if self.buffer.is_none() {
            if let Err(e) = self.fill() {
                self.finished = true;
                if self.owns_tx {
                    let _ = self.slot.lock().rollback();
                }
                return Some(Err(e));
            }
        }
        match self.buffer.as_mut().and_then(|b| b.pop_front()) {
            Some(doc) => Some(Ok(doc)),
            None => {
                let _ = self.close();
                None
            }
        }
    }
}

impl<'a> Drop for Cursor<'a> {
    fn drop(&mut self) {
        if self.owns_tx {
            let mut tx = self.slot.lock();
            if !tx.is_finalized() {
                // cursor teardown publishes nothing
                let _ = tx.rollback();
            }
        }
    }
}
