//! Key-value persistence and the record collections built on it.
//!
//! Storage is injected as `Arc<dyn KeyValueStore>`; nothing in the crate
//! reaches for an ambient global store. Values are JSON strings keyed by
//! `{tenant}.{collection}`.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bulk::RecordPatch;
use crate::error::CrmError;
use crate::types::Record;
use crate::util::slugify;

/// Load/replace by string key. No transactional guarantees.
pub trait KeyValueStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, CrmError>;
    fn save(&self, key: &str, value: &str) -> Result<(), CrmError>;
}

/// Storage key for one tenant's collection.
pub fn storage_key(tenant: &str, collection: &str) -> String {
    let tenant = slugify(tenant);
    let tenant = if tenant.is_empty() { "default".to_string() } else { tenant };
    format!("{}.{}", tenant, collection)
}

/// Suffix of the key an undecodable value is copied to before anything can
/// overwrite it.
pub const CORRUPT_SUFFIX: &str = "corrupt";

/// Load and decode `key`. Storage errors propagate. An undecodable value is
/// copied to `{key}.corrupt` and reported as absent; if that copy fails the
/// load fails too.
pub fn load_json<T: DeserializeOwned>(kv: &dyn KeyValueStore, key: &str) -> Result<Option<T>, CrmError> {
    let Some(raw) = kv.load(key)? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            let backup = format!("{}.{}", key, CORRUPT_SUFFIX);
            log::warn!("Stored value for {} is unreadable ({}), copied to {}", key, e, backup);
            kv.save(&backup, &raw)?;
            Ok(None)
        }
    }
}

pub fn save_json<T: Serialize + ?Sized>(kv: &dyn KeyValueStore, key: &str, value: &T) -> Result<(), CrmError> {
    let raw = serde_json::to_string(value)?;
    kv.save(key, &raw)
}

// =============================================================================
// Backends
// =============================================================================

/// Process-local store, used by tests and the `memory` backend.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<String>, CrmError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<(), CrmError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One `<key>.json` file per key under a directory.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn open(dir: &Path) -> Result<Self, CrmError> {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .map_err(|e| CrmError::Storage(format!("Failed to create {}: {}", dir.display(), e)))?;
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl KeyValueStore for JsonFileStore {
    fn load(&self, key: &str) -> Result<Option<String>, CrmError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| CrmError::Storage(format!("Failed to read {}: {}", path.display(), e)))
    }

    fn save(&self, key: &str, value: &str) -> Result<(), CrmError> {
        // Write to a sibling temp file and rename so readers never see a torn file.
        let path = self.path_for(key);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(value.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path)
            .map_err(|e| CrmError::Storage(format!("Failed to write {}: {}", path.display(), e)))?;
        Ok(())
    }
}

/// Single-table SQLite store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, CrmError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, CrmError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CrmError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn load(&self, key: &str) -> Result<Option<String>, CrmError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn save(&self, key: &str, value: &str) -> Result<(), CrmError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }
}

// =============================================================================
// Record collections
// =============================================================================

/// Ordered, id-unique collection of one record type.
#[derive(Debug, Clone)]
pub struct RecordStore<R: Record> {
    key: String,
    records: Vec<Arc<R>>,
}

impl<R: Record> RecordStore<R> {
    pub fn new(tenant: &str) -> Self {
        Self {
            key: storage_key(tenant, R::KIND.collection()),
            records: Vec::new(),
        }
    }

    /// Load the tenant's collection. Duplicate ids keep the first occurrence.
    /// A storage error fails the load so nothing gets written over data that
    /// could not be read.
    pub fn load(kv: &dyn KeyValueStore, tenant: &str) -> Result<Self, CrmError> {
        let key = storage_key(tenant, R::KIND.collection());
        let loaded: Vec<R> = load_json(kv, &key)?.unwrap_or_default();
        let mut store = Self {
            key,
            records: Vec::with_capacity(loaded.len()),
        };
        for record in loaded {
            if store.get(record.id()).is_some() {
                log::warn!("Dropping duplicate {} id {} from {}", R::KIND, record.id(), store.key);
                continue;
            }
            store.records.push(Arc::new(record));
        }
        log::info!("Loaded {} {} from {}", store.records.len(), R::KIND.collection(), store.key);
        Ok(store)
    }

    pub fn persist(&self, kv: &dyn KeyValueStore) -> Result<(), CrmError> {
        let plain: Vec<&R> = self.records.iter().map(|r| r.as_ref()).collect();
        save_json(kv, &self.key, &plain)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn records(&self) -> &[Arc<R>] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<R>> {
        self.records.iter().find(|r| r.id() == id)
    }

    /// Append a new record. Fails if the id is already present.
    pub fn insert(&mut self, record: R) -> Result<Arc<R>, CrmError> {
        if self.get(record.id()).is_some() {
            return Err(CrmError::DuplicateId(record.id().to_string()));
        }
        let record = Arc::new(record);
        self.records.push(Arc::clone(&record));
        Ok(record)
    }

    /// Direct edit of a single record through a patch.
    pub fn update(&mut self, id: &str, patch: &RecordPatch, now: DateTime<Utc>) -> Result<Arc<R>, CrmError> {
        let idx = self
            .records
            .iter()
            .position(|r| r.id() == id)
            .ok_or_else(|| CrmError::RecordNotFound(id.to_string()))?;
        let updated = Arc::new(patch.apply_to(self.records[idx].as_ref(), now)?);
        self.records[idx] = Arc::clone(&updated);
        Ok(updated)
    }

    /// Swap in a collection produced by the bulk mutator or pipeline.
    pub fn replace(&mut self, records: Vec<Arc<R>>) {
        self.records = records;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// Memory store whose loads or saves can be switched to fail.
    #[derive(Default)]
    pub struct FlakyStore {
        pub inner: MemoryStore,
        fail_loads: AtomicBool,
        fail_saves: AtomicBool,
    }

    impl FlakyStore {
        pub fn set_fail_loads(&self, fail: bool) {
            self.fail_loads.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_saves(&self, fail: bool) {
            self.fail_saves.store(fail, Ordering::SeqCst);
        }
    }

    impl KeyValueStore for FlakyStore {
        fn load(&self, key: &str) -> Result<Option<String>, CrmError> {
            if self.fail_loads.load(Ordering::SeqCst) {
                return Err(CrmError::Storage(format!("database is locked reading {}", key)));
            }
            self.inner.load(key)
        }

        fn save(&self, key: &str, value: &str) -> Result<(), CrmError> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(CrmError::Storage(format!("disk full writing {}", key)));
            }
            self.inner.save(key, value)
        }
    }
}
