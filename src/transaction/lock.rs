//! Lock service: a global reader/writer gate plus per-collection write
//! locks, all with pragma-driven timed acquisition.
//!
//! Transactions enter the gate shared; checkpoint and schema-changing
//! commands enter it exclusive. A collection write lock is only taken
//! inside a transaction scope and is released in reverse acquisition order
//! when the transaction finalizes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::lock_api::{RawMutex as RawMutexTrait, RawMutexTimed, RawRwLock as RawRwLockTrait, RawRwLockTimed};
use parking_lot::{Mutex, RawMutex, RawRwLock};
use tracing::warn;

use crate::error::{DbError, Result};

struct CollectionLock {
    raw: RawMutex,
}

impl CollectionLock {
    fn new() -> Self {
        CollectionLock {
            raw: RawMutex::INIT,
        }
    }
}

pub struct LockService {
    /// Shared = transaction in progress; exclusive = checkpoint or schema
    /// change.
    main: RawRwLock,
    collections: Mutex<HashMap<String, Arc<CollectionLock>>>,
}

impl Default for LockService {
    fn default() -> Self {
        Self::new()
    }
}

impl LockService {
    pub fn new() -> Self {
        LockService {
            main: RawRwLock::INIT,
            collections: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Main gate
    // ------------------------------------------------------------------

    pub fn enter_transaction(&self, timeout: Duration) -> Result<()> {
        if self.main.try_lock_shared_for(timeout) {
            Ok(())
        } else {
            warn!(?timeout, "transaction gate acquisition timed out");
            Err(DbError::LockTimeout(timeout))
        }
    }

    pub fn exit_transaction(&self) {
        unsafe { self.main.unlock_shared() };
    }

    pub fn enter_exclusive(&self, timeout: Duration) -> Result<()> {
        if self.main.try_lock_exclusive_for(timeout) {
            Ok(())
        } else {
            warn!(?timeout, "exclusive gate acquisition timed out");
            Err(DbError::LockTimeout(timeout))
        }
    }

    /// Non-blocking exclusive probe, used by opportunistic auto-checkpoint.
    pub fn try_enter_exclusive(&self) -> bool {
        self.main.try_lock_exclusive()
    }

    pub fn exit_exclusive(&self) {
        unsafe { self.main.unlock_exclusive() };
    }

    // ------------------------------------------------------------------
    // Collection write locks
    // ------------------------------------------------------------------

    fn collection_lock(&self, name: &str) -> Arc<CollectionLock> {
        let mut map = self.collections.lock();
        map.entry(name.to_ascii_lowercase())
            .or_insert_with(|| Arc::new(CollectionLock::new()))
            .clone()
    }

    pub fn enter_collection(&self, name: &str, timeout: Duration) -> Result<()> {
        let lock = self.collection_lock(name);
        if lock.raw.try_lock_for(timeout) {
            Ok(())
        } else {
            warn!(collection = name, ?timeout, "collection lock timed out");
            Err(DbError::LockTimeout(timeout))
        }
    }

    pub fn exit_collection(&self, name: &str) {
        let lock = self.collection_lock(name);
        unsafe { lock.raw.unlock() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;
    use std::time::Instant;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn shared_gate_admits_many_readers() {
        let locks = LockService::new();
        locks.enter_transaction(SHORT).unwrap();
        locks.enter_transaction(SHORT).unwrap();
        locks.exit_transaction();
        locks.exit_transaction();
    }

    #[test]
    fn exclusive_blocks_until_timeout() {
        let locks = StdArc::new(LockService::new());
        locks.enter_transaction(SHORT).unwrap();

        let contender = locks.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let result = contender.enter_exclusive(SHORT);
            (result, start.elapsed())
        });
        let (result, waited) = handle.join().unwrap();
        assert!(matches!(result, Err(DbError::LockTimeout(_))));
        assert!(waited >= SHORT);
        locks.exit_transaction();
    }

    #[test]
    fn collection_lock_serializes_writers() {
        let locks = StdArc::new(LockService::new());
        locks.enter_collection("people", LONG).unwrap();

        // same collection, different case: same lock
        assert!(matches!(
            locks.enter_collection("People", SHORT),
            Err(DbError::LockTimeout(_))
        ));
        // other collections stay independent
        locks.enter_collection("orders", SHORT).unwrap();
        locks.exit_collection("orders");

        let contender = locks.clone();
        let handle = thread::spawn(move || contender.enter_collection("people", LONG));
        thread::sleep(Duration::from_millis(20));
        locks.exit_collection("people");
        handle.join().unwrap().unwrap();
        locks.exit_collection("people");
    }
}
