//! Raw string key-value backends behind the caches.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::database::Database;
use crate::error::{Result, StoreError};

/// A namespaced string store.  Implementations must tolerate concurrent
/// callers; conflicting writes resolve as last-write-wins.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    /// Keys beginning with `prefix`.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// [`KeyValueStore`] persisted in a SQLite file.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Database::open_at(path).map(Self::new)
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let guard = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&guard)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_db(|db| db.kv_get(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_db(|db| db.kv_set(key, value))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_db(|db| db.kv_remove(key).map(|_| ()))
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.with_db(|db| db.kv_keys(prefix))
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Volatile [`KeyValueStore`].  `set_failing(true)` makes every call fail,
/// which stands in for a storage layer the OS has pulled away.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        self.entries.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries()?.remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KeyValueStore) {
        store.set("app_cache_a", "1").unwrap();
        store.set("app_cache_b", "2").unwrap();
        store.set("room_messages_x", "[]").unwrap();
        assert_eq!(store.get("app_cache_a").unwrap().as_deref(), Some("1"));
        assert_eq!(store.keys("app_cache_").unwrap().len(), 2);

        store.remove("app_cache_a").unwrap();
        assert!(store.get("app_cache_a").unwrap().is_none());
        // removing a missing key is not an error
        store.remove("app_cache_a").unwrap();
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn sqlite_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_at(&dir.path().join("kv.db")).unwrap();
        exercise(&store);
    }

    #[test]
    fn failing_memory_store_errors() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(matches!(store.get("k"), Err(StoreError::Unavailable)));
        store.set_failing(false);
        assert!(store.get("k").unwrap().is_none());
    }
}
