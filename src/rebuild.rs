//! Offline rebuild: read every collection from a source file through a
//! fault-tolerant reader, write it into a fresh database, then swap the
//! fresh file into place keeping the original as a backup. Per-document
//! failures land in the `_rebuild_errors` pseudo-collection of the new file.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use tracing::{info, warn};

use crate::bson::{codec, DateTime, Document, Value};
use crate::cancel::CancellationToken;
use crate::config::{Collation, EngineSettings};
use crate::engine::{AutoId, DbEngine};
use crate::error::{DbError, Result};
use crate::index::skiplist::{self, Order};
use crate::storage::collection_page::{CollectionMeta, VectorMetric};
use crate::storage::data;
use crate::storage::page::{PageAddress, PageType};
use crate::transaction::{EngineServices, Transaction, TransactionMode};

#[derive(Clone, Debug, Default)]
pub struct RebuildOptions {
    /// Password for the rebuilt file (and the source, when encrypted).
    pub password: Option<String>,
    /// Collation for the rebuilt file; defaults to the source collation.
    pub collation: Option<Collation>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RebuildReport {
    pub collections: usize,
    pub documents: usize,
    /// Documents that could not be salvaged; one `_rebuild_errors` row each.
    pub document_errors: usize,
    /// New file size minus old file size.
    pub size_delta: i64,
}

pub const ERRORS_COLLECTION: &str = "_rebuild_errors";

// ============================================================================
// Source reader
// ============================================================================

/// Reads collections, index descriptors and documents out of a database
/// file. The contract the rebuild needs from any source: enumerate
/// collections, then enumerate each collection's descriptors and documents.
pub trait SourceReader {
    fn collections(&mut self) -> Result<Vec<String>>;

    #[allow(clippy::type_complexity)]
    fn indexes(
        &mut self,
        collection: &str,
    ) -> Result<(
        Vec<(String, String, bool)>,
        Vec<(String, String, u16, VectorMetric)>,
    )>;

    /// Documents in primary-key order; unreadable documents yield `Err`
    /// entries instead of aborting the scan.
    fn documents(&mut self, collection: &str) -> Result<Vec<Result<Document>>>;

    fn user_version(&self) -> i32;

    fn collation(&self) -> Collation;
}

/// Reader over a database file using the normal storage primitives, with
/// two salvage levels: a raw data-page scan when a primary-key chain is
/// corrupt, and a registry reconstructed from collection pages (which carry
/// their own name) when the header's copy is unreadable.
pub struct FileSourceReader {
    services: Arc<EngineServices>,
    tx: Transaction,
    salvaged_registry: Option<Vec<(String, crate::storage::page::PageId)>>,
}

impl FileSourceReader {
    pub fn open(settings: &EngineSettings) -> Result<Self> {
        match DbEngine::open_services(settings.clone()) {
            Ok(services) => {
                let tx = Transaction::new(
                    services.clone(),
                    TransactionMode::Read,
                    true,
                    CancellationToken::none(),
                )?;
                Ok(FileSourceReader {
                    services,
                    tx,
                    salvaged_registry: None,
                })
            }
            Err(DbError::Corruption(message)) => {
                warn!(
                    error = message.as_str(),
                    "header unreadable; salvaging the registry from collection pages"
                );
                Self::open_salvage(settings)
            }
            Err(e) => Err(e),
        }
    }

    /// Degraded open: a default header sized from the file, then a sweep for
    /// collection pages.
    fn open_salvage(settings: &EngineSettings) -> Result<Self> {
        use crate::storage::disk::DiskService;
        use crate::storage::header::HeaderPage;
        use crate::storage::page::PAGE_SIZE;
        use crate::storage::stream::{StreamFactory, StreamKind};
        use crate::storage::wal::WalIndex;

        let factory = StreamFactory::new(settings.clone());
        let mut page0 = vec![0u8; PAGE_SIZE];
        factory
            .open_raw(StreamKind::Data)?
            .read_page(0, &mut page0)?;
        let salt = HeaderPage::read_salt(&page0)?;
        if salt != [0u8; 16] {
            let password = settings
                .password
                .as_deref()
                .ok_or_else(|| DbError::crypto("encrypted file requires a password"))?;
            factory.set_crypto(crate::storage::aes::AesStream::new(password, salt));
        }
        let disk = DiskService::new(&factory, settings.cache_size)?;
        let wal = WalIndex::new();
        wal.restore(&disk)?;

        let header = HeaderPage::create(settings, salt);
        let last_page = (disk.data_len()? / PAGE_SIZE as u64) as u32;
        header.restore_last_page_id(last_page);

        let services = Arc::new(EngineServices::new(
            disk,
            wal,
            header,
            settings.clone(),
        ));
        let mut tx = Transaction::new(
            services.clone(),
            TransactionMode::Read,
            true,
            CancellationToken::none(),
        )?;

        let mut registry = Vec::new();
        for page_id in 1..=last_page {
            let found = tx.with_page(page_id, |page| {
                if page.page_type()? == PageType::Collection {
                    Ok(Some(CollectionMeta::from_page(page)?))
                } else {
                    Ok(None)
                }
            });
            if let Ok(Some(meta)) = found {
                registry.push((meta.name.clone(), page_id));
            }
        }
        Ok(FileSourceReader {
            services,
            tx,
            salvaged_registry: Some(registry),
        })
    }

    fn resolve(&self, collection: &str) -> Option<crate::storage::page::PageId> {
        match &self.salvaged_registry {
            Some(registry) => registry
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(collection))
                .map(|(_, page_id)| *page_id),
            None => self.services.header.get_collection_page(collection),
        }
    }

    fn meta(&mut self, collection: &str) -> Result<Option<CollectionMeta>> {
        let Some(page_id) = self.resolve(collection) else {
            return Ok(None);
        };
        let meta = self.tx.with_page(page_id, |page| {
            page.expect(page_id, PageType::Collection)?;
            CollectionMeta::from_page(page)
        })?;
        Ok(Some(meta))
    }

    /// Last-resort scan: walk every data page of the collection, find chain
    /// heads (blocks nothing points to) and decode each chain.
    fn raw_scan(&mut self, meta: &CollectionMeta) -> Result<Vec<Result<Document>>> {
        let last_page = self.services.header.last_page_id();
        let mut blocks: HashSet<PageAddress> = HashSet::new();
        let mut pointed: HashSet<PageAddress> = HashSet::new();

        for page_id in 1..=last_page {
            let collected = self.tx.with_page(page_id, |page| {
                if page.page_type()? != PageType::Data
                    || page.collection_id() != meta.page_id
                {
                    return Ok(Vec::new());
                }
                let mut found = Vec::new();
                for index in page.block_indexes() {
                    let block = page.read_block(index)?;
                    let next = if !block.is_empty() && block[0] != 0 {
                        Some(PageAddress::read_from(&block[1..7]))
                    } else {
                        None
                    };
                    found.push((PageAddress::new(page_id, index), next));
                }
                Ok(found)
            });
            let Ok(collected) = collected else { continue };
            for (address, next) in collected {
                blocks.insert(address);
                if let Some(next) = next {
                    pointed.insert(next);
                }
            }
        }

        let mut heads: Vec<PageAddress> = blocks.difference(&pointed).copied().collect();
        heads.sort();
        let mut docs = Vec::with_capacity(heads.len());
        for head in heads {
            let doc = data::read(&mut self.tx, head)
                .and_then(|bytes| codec::deserialize_document(&bytes));
            docs.push(doc);
        }
        Ok(docs)
    }
}

impl Drop for FileSourceReader {
    fn drop(&mut self) {
        let _ = self.tx.rollback();
    }
}

impl SourceReader for FileSourceReader {
    fn collections(&mut self) -> Result<Vec<String>> {
        let names = match &self.salvaged_registry {
            Some(registry) => registry.iter().map(|(name, _)| name.clone()).collect(),
            None => self.services.header.collection_names(),
        };
        Ok(names
            .into_iter()
            .filter(|name| name != ERRORS_COLLECTION)
            .collect())
    }

    fn indexes(
        &mut self,
        collection: &str,
    ) -> Result<(
        Vec<(String, String, bool)>,
        Vec<(String, String, u16, VectorMetric)>,
    )> {
        let Some(meta) = self.meta(collection)? else {
            return Ok((Vec::new(), Vec::new()));
        };
        Ok((
            meta.indexes
                .iter()
                .filter(|i| i.slot > 0)
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
    }

    fn documents(&mut self, collection: &str) -> Result<Vec<Result<Document>>> {
        let Some(meta) = self.meta(collection)? else {
            return Ok(Vec::new());
        };
        let pk = meta.pk_index()?.clone();

        match skiplist::find_all(&mut self.tx, &pk, Order::Ascending) {
            Ok(nodes) => {
                let mut docs = Vec::with_capacity(nodes.len());
                for node in nodes {
                    let doc = data::read(&mut self.tx, node.data_block)
                        .and_then(|bytes| codec::deserialize_document(&bytes));
                    docs.push(doc);
                }
                Ok(docs)
            }
            Err(DbError::Corruption(message)) => {
                // broken PK chain: recover what the data pages still hold
                warn!(
                    collection,
                    error = message.as_str(),
                    "primary-key walk failed; falling back to raw page scan"
                );
                self.raw_scan(&meta)
            }
            Err(e) => Err(e),
        }
    }

    fn user_version(&self) -> i32 {
        self.services
            .header
            .pragmas
            .user_version
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    fn collation(&self) -> Collation {
        self.services.header.pragmas.collation.clone()
    }
}

// ============================================================================
// Rebuild driver
// ============================================================================

/// Rebuild `settings.filename` into a fresh file. The original survives as
/// `<name>-backup.db`.
pub fn rebuild_file(settings: &EngineSettings, options: &RebuildOptions) -> Result<RebuildReport> {
    if settings.is_in_memory() || settings.is_temp() {
        return Err(DbError::usage("rebuild requires a file-backed database"));
    }
    let started = Instant::now();
    let source_path = std::path::PathBuf::from(&settings.filename);
    let old_size = std::fs::metadata(&source_path)?.len() as i64;

    let mut reader = FileSourceReader::open(settings)?;
    let fresh_path = source_path.with_extension("rebuild.tmp");
    let dest_settings = EngineSettings {
        filename: fresh_path.to_string_lossy().to_string(),
        password: options.password.clone(),
        collation: options
            .collation
            .clone()
            .unwrap_or_else(|| reader.collation()),
        read_only: false,
        auto_rebuild: false,
        ..settings.clone()
    };
    let _ = std::fs::remove_file(&fresh_path);

    let dest_log = dest_settings.log_path();
    let report = {
        let dest = DbEngine::open(dest_settings)?;
        let report = copy_all(&mut reader, &dest)?;
        dest.checkpoint()?;
        report
    };
    drop(reader);

    // swap files: original becomes the backup
    let backup = settings.backup_path();
    let _ = std::fs::remove_file(&backup);
    std::fs::rename(&source_path, &backup)?;
    std::fs::rename(&fresh_path, &source_path)?;
    let _ = std::fs::remove_file(settings.log_path());
    let _ = std::fs::remove_file(dest_log);

    let new_size = std::fs::metadata(&source_path)?.len() as i64;
    let report = RebuildReport {
        size_delta: new_size - old_size,
        ..report
    };
    info!(
        collections = report.collections,
        documents = report.documents,
        errors = report.document_errors,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "rebuild complete"
    );
    Ok(report)
}

fn copy_all(reader: &mut dyn SourceReader, dest: &DbEngine) -> Result<RebuildReport> {
    let mut report = RebuildReport::default();
    dest.pragma_set("USER_VERSION", &Value::Int32(reader.user_version()))?;

    for name in reader.collections()? {
        report.collections += 1;
        let (indexes, vector_indexes) = reader.indexes(&name)?;

        let mut errors: Vec<Document> = Vec::new();
        let mut good: Vec<Document> = Vec::new();
        for doc in reader.documents(&name)? {
            match doc {
                Ok(doc) => good.push(doc),
                Err(e) => errors.push(
                    Document::new()
                        .with("collection", name.clone())
                        .with("error", e.to_string())
                        .with("created", DateTime::now()),
                ),
            }
        }
        report.documents += good.len();
        report.document_errors += errors.len();

        if !good.is_empty() {
            // insert in source PK order so document order is preserved
            for chunk in good.chunks(1000) {
                dest.insert(&name, chunk.to_vec(), AutoId::ObjectId)?;
            }
        } else {
            // keep empty collections alive in the new file
            dest.insert(&name, Vec::new(), AutoId::ObjectId)?;
        }
        for (index_name, expression, unique) in indexes {
            dest.ensure_index(&name, &index_name, &expression, unique)?;
        }
        for (index_name, expression, dimensions, metric) in vector_indexes {
            dest.ensure_vector_index(&name, &index_name, &expression, dimensions, metric)?;
        }
        if !errors.is_empty() {
            dest.insert(ERRORS_COLLECTION, errors, AutoId::ObjectId)?;
        }
    }
    Ok(report)
}

impl DbEngine {
    /// Close this handle, rebuild the underlying file, and reopen it.
    pub fn rebuild(self, options: &RebuildOptions) -> Result<(DbEngine, RebuildReport)> {
        let mut settings = self.settings().clone();
        drop(self);
        let report = rebuild_file(&settings, options)?;
        if let Some(password) = &options.password {
            settings.password = Some(password.clone());
        }
        if let Some(collation) = &options.collation {
            settings.collation = collation.clone();
        }
        let engine = DbEngine::open(settings)?;
        Ok((engine, report))
    }
}

// ============================================================================
// Auto-rebuild cooldown
// ============================================================================

fn cooldown_map() -> &'static Mutex<HashMap<String, Instant>> {
    static MAP: OnceLock<Mutex<HashMap<String, Instant>>> = OnceLock::new();
    MAP.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Whether enough time has passed since the last automatic rebuild of this
/// file.
pub fn cooldown_allows(settings: &EngineSettings) -> bool {
    let map = cooldown_map().lock().expect("cooldown map");
    match map.get(&settings.filename) {
        Some(last) => last.elapsed() >= settings.auto_rebuild_cooldown,
        None => true,
    }
}

pub fn mark_rebuilt(settings: &EngineSettings) {
    cooldown_map()
        .lock()
        .expect("cooldown map")
        .insert(settings.filename.clone(), Instant::now());
}
