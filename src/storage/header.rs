//! Header page (page 0): container magic, file version, encryption salt,
//! pragmas, allocation heads and the collection registry.
//!
//! The shared in-memory instance is mutated directly by transactions (under
//! its state lock); a transaction that touched it logs a fresh serialization
//! of the page as its confirm marker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::aes::SALT_SIZE;
use super::page::{PageBuffer, PageId, PageType, EMPTY_PAGE_ID};
use crate::bson::{codec, DateTime, Document};
use crate::config::{Collation, EngineSettings, Pragmas};
use crate::error::{DbError, Result};

/// 27-byte container magic, fixed by the file format.
const HEADER_INFO: &[u8; 27] = b"** This is a LiteDB file **";
const FILE_VERSION: u8 = 8;
/// Constant inside the encrypted region; scrambled marker means wrong
/// password.
const ENCRYPTION_MARKER: &[u8; 4] = b"HBLT";

const P_HEADER_INFO: usize = 32; // 32-58
const P_FILE_VERSION: usize = 59; // 59
const P_CREATION_TIME: usize = 60; // 60-67
const P_SALT: usize = 68; // 68-83
const P_LAST_TRANSACTION_ID: usize = 84; // 84-87
const P_FREE_EMPTY_LIST: usize = 88; // 88-91
const P_LAST_PAGE_ID: usize = 92; // 92-95
// ---- encrypted region starts at 96 (see aes::PLAIN_PREFIX) ----
const P_ENCRYPTION_MARKER: usize = 96; // 96-99
const P_CHECKPOINT_LSN: usize = 100; // 100-103
const P_USER_VERSION: usize = 104; // 104-107
const P_TIMEOUT: usize = 108; // 108-111
const P_LIMIT_SIZE: usize = 112; // 112-119
const P_UTC_DATE: usize = 120; // 120
const P_CHECKPOINT: usize = 121; // 121-124
const P_COLLATION_LEN: usize = 125; // 125
const P_COLLATION: usize = 126; // 126-175
const COLLATION_MAX: usize = 50;
const P_COLLECTIONS: usize = 192; // 192..8191
const COLLECTIONS_SIZE: usize = crate::storage::page::PAGE_SIZE - P_COLLECTIONS;

pub const MAX_COLLECTION_NAME: usize = 60;

struct HeaderState {
    last_page_id: PageId,
    free_empty_list: PageId,
    /// Collection name -> first collection page id (Int32).
    collections: Document,
}

pub struct HeaderPage {
    pub pragmas: Arc<Pragmas>,
    creation_time: DateTime,
    salt: [u8; SALT_SIZE],
    last_transaction_id: AtomicU32,
    checkpoint_lsn: AtomicU32,
    state: Mutex<HeaderState>,
}

impl HeaderPage {
    // ------------------------------------------------------------------
    // Create / load
    // ------------------------------------------------------------------

    pub fn create(settings: &EngineSettings, salt: [u8; SALT_SIZE]) -> Self {
        HeaderPage {
            pragmas: Arc::new(Pragmas::new(settings.collation.clone())),
            creation_time: DateTime::now(),
            salt,
            last_transaction_id: AtomicU32::new(0),
            checkpoint_lsn: AtomicU32::new(0),
            state: Mutex::new(HeaderState {
                last_page_id: 0,
                free_empty_list: EMPTY_PAGE_ID,
                collections: Document::new(),
            }),
        }
    }

    /// Peek at the plaintext prefix of a raw page-0 image: validates the
    /// magic and returns the salt (all-zero means unencrypted).
    pub fn read_salt(bytes: &[u8]) -> Result<[u8; SALT_SIZE]> {
        if &bytes[P_HEADER_INFO..P_HEADER_INFO + HEADER_INFO.len()] != HEADER_INFO {
            return Err(DbError::corruption("invalid database file header"));
        }
        if bytes[P_FILE_VERSION] != FILE_VERSION {
            return Err(DbError::usage(format!(
                "unsupported file version {}; rebuild with Upgrade=true",
                bytes[P_FILE_VERSION]
            )));
        }
        Ok(bytes[P_SALT..P_SALT + SALT_SIZE]
            .try_into()
            .expect("16 bytes"))
    }

    pub fn load(page: &PageBuffer) -> Result<Self> {
        let bytes = page.as_bytes();
        let salt = Self::read_salt(bytes)?;
        if &bytes[P_ENCRYPTION_MARKER..P_ENCRYPTION_MARKER + 4] != ENCRYPTION_MARKER {
            return Err(DbError::crypto("invalid password"));
        }

        let collation_len = (bytes[P_COLLATION_LEN] as usize).min(COLLATION_MAX);
        let collation_text = std::str::from_utf8(&bytes[P_COLLATION..P_COLLATION + collation_len])
            .map_err(|_| DbError::corruption("invalid collation in header"))?;
        let pragmas = Pragmas::new(Collation::parse(collation_text)?);
        pragmas.user_version.store(
            i32::from_le_bytes(bytes[P_USER_VERSION..P_USER_VERSION + 4].try_into().expect("4")),
            Ordering::Relaxed,
        );
        pragmas.timeout.store(
            u32::from_le_bytes(bytes[P_TIMEOUT..P_TIMEOUT + 4].try_into().expect("4")),
            Ordering::Relaxed,
        );
        pragmas.limit_size.store(
            u64::from_le_bytes(bytes[P_LIMIT_SIZE..P_LIMIT_SIZE + 8].try_into().expect("8")),
            Ordering::Relaxed,
        );
        pragmas
            .utc_date
            .store(bytes[P_UTC_DATE] != 0, Ordering::Relaxed);
        pragmas.checkpoint.store(
            u32::from_le_bytes(bytes[P_CHECKPOINT..P_CHECKPOINT + 4].try_into().expect("4")),
            Ordering::Relaxed,
        );

        let collections = codec::deserialize_document(&bytes[P_COLLECTIONS..])
            .map_err(|_| DbError::corruption("invalid collection registry in header"))?;

        Ok(HeaderPage {
            pragmas: Arc::new(pragmas),
            creation_time: DateTime::from_ticks(i64::from_le_bytes(
                bytes[P_CREATION_TIME..P_CREATION_TIME + 8].try_into().expect("8"),
            )),
            salt,
            last_transaction_id: AtomicU32::new(u32::from_le_bytes(
                bytes[P_LAST_TRANSACTION_ID..P_LAST_TRANSACTION_ID + 4]
                    .try_into()
                    .expect("4"),
            )),
            checkpoint_lsn: AtomicU32::new(u32::from_le_bytes(
                bytes[P_CHECKPOINT_LSN..P_CHECKPOINT_LSN + 4].try_into().expect("4"),
            )),
            state: Mutex::new(HeaderState {
                last_page_id: u32::from_le_bytes(
                    bytes[P_LAST_PAGE_ID..P_LAST_PAGE_ID + 4].try_into().expect("4"),
                ),
                free_empty_list: u32::from_le_bytes(
                    bytes[P_FREE_EMPTY_LIST..P_FREE_EMPTY_LIST + 4].try_into().expect("4"),
                ),
                collections,
            }),
        })
    }

    /// Serialize the current in-memory state into a page-0 image.
    pub fn to_page(&self) -> PageBuffer {
        let mut page = PageBuffer::new(0, PageType::Header);
        let state = self.state.lock();
        let bytes = page.as_bytes_mut();

        bytes[P_HEADER_INFO..P_HEADER_INFO + HEADER_INFO.len()].copy_from_slice(HEADER_INFO);
        bytes[P_FILE_VERSION] = FILE_VERSION;
        bytes[P_CREATION_TIME..P_CREATION_TIME + 8]
            .copy_from_slice(&self.creation_time.ticks().to_le_bytes());
        bytes[P_SALT..P_SALT + SALT_SIZE].copy_from_slice(&self.salt);
        bytes[P_LAST_TRANSACTION_ID..P_LAST_TRANSACTION_ID + 4]
            .copy_from_slice(&self.last_transaction_id.load(Ordering::Relaxed).to_le_bytes());
        bytes[P_FREE_EMPTY_LIST..P_FREE_EMPTY_LIST + 4]
            .copy_from_slice(&state.free_empty_list.to_le_bytes());
        bytes[P_LAST_PAGE_ID..P_LAST_PAGE_ID + 4]
            .copy_from_slice(&state.last_page_id.to_le_bytes());
        bytes[P_ENCRYPTION_MARKER..P_ENCRYPTION_MARKER + 4].copy_from_slice(ENCRYPTION_MARKER);
        bytes[P_CHECKPOINT_LSN..P_CHECKPOINT_LSN + 4]
            .copy_from_slice(&self.checkpoint_lsn.load(Ordering::Relaxed).to_le_bytes());
        bytes[P_USER_VERSION..P_USER_VERSION + 4].copy_from_slice(
            &self.pragmas.user_version.load(Ordering::Relaxed).to_le_bytes(),
        );
        bytes[P_TIMEOUT..P_TIMEOUT + 4]
            .copy_from_slice(&self.pragmas.timeout.load(Ordering::Relaxed).to_le_bytes());
        bytes[P_LIMIT_SIZE..P_LIMIT_SIZE + 8]
            .copy_from_slice(&self.pragmas.limit_size.load(Ordering::Relaxed).to_le_bytes());
        bytes[P_UTC_DATE] = self.pragmas.utc_date.load(Ordering::Relaxed) as u8;
        bytes[P_CHECKPOINT..P_CHECKPOINT + 4]
            .copy_from_slice(&self.pragmas.checkpoint.load(Ordering::Relaxed).to_le_bytes());

        let collation = self.pragmas.collation.to_string();
        let collation_bytes = collation.as_bytes();
        let len = collation_bytes.len().min(COLLATION_MAX);
        bytes[P_COLLATION_LEN] = len as u8;
        bytes[P_COLLATION..P_COLLATION + len].copy_from_slice(&collation_bytes[..len]);

        let registry = codec::serialize_document(&state.collections);
        debug_assert!(registry.len() <= COLLECTIONS_SIZE);
        bytes[P_COLLECTIONS..P_COLLECTIONS + registry.len()].copy_from_slice(&registry);

        page
    }

    // ------------------------------------------------------------------
    // Transaction ids and checkpoint marker
    // ------------------------------------------------------------------

    pub fn next_transaction_id(&self) -> u32 {
        self.last_transaction_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn last_transaction_id(&self) -> u32 {
        self.last_transaction_id.load(Ordering::Acquire)
    }

    pub fn set_checkpoint_lsn(&self, lsn: u32) {
        self.checkpoint_lsn.store(lsn, Ordering::Release);
    }

    pub fn checkpoint_lsn(&self) -> u32 {
        self.checkpoint_lsn.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Page allocation heads
    // ------------------------------------------------------------------

    pub fn last_page_id(&self) -> PageId {
        self.state.lock().last_page_id
    }

    /// Allocate a brand-new page id at the end of the file.
    pub fn extend_page_id(&self) -> PageId {
        let mut state = self.state.lock();
        state.last_page_id += 1;
        state.last_page_id
    }

    /// Used by recovery paths that reconstruct a header from the file size.
    pub fn restore_last_page_id(&self, page_id: PageId) {
        let mut state = self.state.lock();
        state.last_page_id = state.last_page_id.max(page_id);
    }

    pub fn free_empty_list(&self) -> PageId {
        self.state.lock().free_empty_list
    }

    pub fn set_free_empty_list(&self, page_id: PageId) {
        self.state.lock().free_empty_list = page_id;
    }

    /// Pop the free-list head, storing the provided successor. Caller reads
    /// the head page to discover the successor before calling.
    pub fn pop_free_empty(&self, expected_head: PageId, next: PageId) -> bool {
        let mut state = self.state.lock();
        if state.free_empty_list != expected_head {
            return false;
        }
        state.free_empty_list = next;
        true
    }

    // ------------------------------------------------------------------
    // Collection registry
    // ------------------------------------------------------------------

    pub fn get_collection_page(&self, name: &str) -> Option<PageId> {
        let state = self.state.lock();
        lookup(&state.collections, name).map(|(_, id)| id)
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.state
            .lock()
            .collections
            .keys()
            .map(|k| k.to_string())
            .collect()
    }

    pub fn insert_collection(&self, name: &str, page_id: PageId) -> Result<()> {
        validate_collection_name_internal(name)?;
        let mut state = self.state.lock();
        if lookup(&state.collections, name).is_some() {
            return Err(DbError::usage(format!("collection '{name}' already exists")));
        }
        state.collections.insert(name, page_id as i32);
        let registry_len = codec::document_len(&state.collections);
        if registry_len > COLLECTIONS_SIZE {
            state.collections.remove(name);
            return Err(DbError::validation("collection registry is full"));
        }
        Ok(())
    }

    pub fn delete_collection(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some((stored, _)) = lookup(&state.collections, name) {
            state.collections.remove(&stored);
        }
    }

    pub fn rename_collection(&self, old_name: &str, new_name: &str) -> Result<()> {
        validate_collection_name(new_name)?;
        let mut state = self.state.lock();
        if lookup(&state.collections, new_name).is_some() {
            return Err(DbError::usage(format!(
                "collection '{new_name}' already exists"
            )));
        }
        let (stored, page_id) = lookup(&state.collections, old_name)
            .ok_or_else(|| DbError::usage(format!("collection '{old_name}' not found")))?;
        state.collections.remove(&stored);
        state.collections.insert(new_name, page_id as i32);
        Ok(())
    }
}

/// Case-insensitive registry lookup; returns the stored name and page id.
fn lookup(collections: &Document, name: &str) -> Option<(String, PageId)> {
    collections.iter().find_map(|(key, value)| {
        if key.eq_ignore_ascii_case(name) {
            value.as_i32().map(|id| (key.to_string(), id as PageId))
        } else {
            None
        }
    })
}

pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_COLLECTION_NAME {
        return Err(DbError::usage(
            "collection name must be 1..=60 bytes".to_string(),
        ));
    }
    if name.starts_with('_') {
        return Err(DbError::usage(format!(
            "collection name '{name}' is reserved"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '$'))
    {
        return Err(DbError::usage(format!(
            "collection name '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Registry check that also admits internal pseudo-collections.
pub fn validate_collection_name_internal(name: &str) -> Result<()> {
    if let Some(stripped) = name.strip_prefix('_') {
        return validate_collection_name(stripped);
    }
    validate_collection_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> HeaderPage {
        HeaderPage::create(&EngineSettings::default(), [0u8; SALT_SIZE])
    }

    #[test]
    fn serialize_load_round_trip() {
        let h = header();
        h.pragmas
            .user_version
            .store(7, Ordering::Relaxed);
        h.insert_collection("people", 4).unwrap();
        h.next_transaction_id();
        let loaded = HeaderPage::load(&h.to_page()).unwrap();
        assert_eq!(
            loaded.pragmas.user_version.load(Ordering::Relaxed),
            7
        );
        assert_eq!(loaded.get_collection_page("people"), Some(4));
        assert_eq!(loaded.last_transaction_id(), 1);
    }

    #[test]
    fn collection_lookup_is_case_insensitive() {
        let h = header();
        h.insert_collection("People", 4).unwrap();
        assert_eq!(h.get_collection_page("people"), Some(4));
        assert!(h.insert_collection("PEOPLE", 9).is_err());
    }

    #[test]
    fn rename_keeps_page_id() {
        let h = header();
        h.insert_collection("a", 2).unwrap();
        h.rename_collection("a", "b").unwrap();
        assert_eq!(h.get_collection_page("b"), Some(2));
        assert_eq!(h.get_collection_page("a"), None);
    }

    #[test]
    fn invalid_names_rejected() {
        assert!(validate_collection_name("ok-name$1").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("_reserved").is_err());
        assert!(validate_collection_name("has space").is_err());
        assert!(validate_collection_name(&"x".repeat(61)).is_err());
    }

    #[test]
    fn bad_magic_is_corruption() {
        let h = header();
        let mut page = h.to_page();
        page.as_bytes_mut()[P_HEADER_INFO] = b'X';
        assert!(matches!(
            HeaderPage::load(&page),
            Err(DbError::Corruption(_))
        ));
    }

    #[test]
    fn free_list_pop_detects_stale_head() {
        let h = header();
        h.set_free_empty_list(5);
        assert!(!h.pop_free_empty(9, 1));
        assert!(h.pop_free_empty(5, 11));
        assert_eq!(h.free_empty_list(), 11);
    }
}
