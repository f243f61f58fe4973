//! Durable tier behind the in-memory cache.

use crate::entry::{PersistedEntry, SessionStamp};
use crate::error::{CacheError, CacheResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Storage for entries that outlive the process.
pub trait PersistenceBackend: Send + Sync {
    fn load(&self, key: &str) -> CacheResult<Option<PersistedEntry>>;
    fn save(&self, key: &str, entry: &PersistedEntry) -> CacheResult<()>;
    /// Returns true if the key existed.
    fn remove(&self, key: &str) -> CacheResult<bool>;
    fn keys(&self) -> CacheResult<Vec<String>>;
    fn clear(&self) -> CacheResult<()>;
}

/// In-process backend, for tests and for hosts without durable storage.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, PersistedEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceBackend for MemoryBackend {
    fn load(&self, key: &str) -> CacheResult<Option<PersistedEntry>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn save(&self, key: &str, entry: &PersistedEntry) -> CacheResult<()> {
        self.entries.lock().insert(key.to_string(), entry.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> CacheResult<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn keys(&self) -> CacheResult<Vec<String>> {
        Ok(self.entries.lock().keys().cloned().collect())
    }

    fn clear(&self) -> CacheResult<()> {
        self.entries.lock().clear();
        Ok(())
    }
}

/// SQLite-backed persistence.
///
/// `data` and `metadata` are stored as JSON text; the session stamp gets its
/// own columns so other writers can be detected without parsing.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Opens (or creates) a cache database at the given path.
    pub fn open(path: impl AsRef<Path>) -> CacheResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CacheError::Storage(format!("failed to open cache store: {e}")))?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> CacheResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            CacheError::Storage(format!("failed to open in-memory cache store: {e}"))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> CacheResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> CacheResult<()> {
        self.conn
            .lock()
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS cache_entries (
                    key TEXT PRIMARY KEY,
                    data TEXT NOT NULL,
                    metadata TEXT NOT NULL,
                    session_id TEXT,
                    writer_id TEXT
                );
                ",
            )
            .map_err(|e| CacheError::Storage(format!("failed to init cache schema: {e}")))
    }
}

impl PersistenceBackend for SqliteBackend {
    fn load(&self, key: &str) -> CacheResult<Option<PersistedEntry>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT data, metadata, session_id, writer_id FROM cache_entries WHERE key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| CacheError::Storage(format!("failed to load cache entry: {e}")))?;

        let Some((data, metadata, session_id, writer_id)) = row else {
            return Ok(None);
        };
        let session = match (session_id, writer_id) {
            (Some(session_id), Some(writer_id)) => Some(SessionStamp {
                session_id,
                writer_id,
            }),
            _ => None,
        };
        Ok(Some(PersistedEntry {
            data: serde_json::from_str(&data)?,
            metadata: serde_json::from_str(&metadata)?,
            session,
        }))
    }

    fn save(&self, key: &str, entry: &PersistedEntry) -> CacheResult<()> {
        let data = serde_json::to_string(&entry.data)?;
        let metadata = serde_json::to_string(&entry.metadata)?;
        let (session_id, writer_id) = match &entry.session {
            Some(s) => (Some(s.session_id.as_str()), Some(s.writer_id.as_str())),
            None => (None, None),
        };
        self.conn
            .lock()
            .execute(
                "INSERT INTO cache_entries (key, data, metadata, session_id, writer_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                    data = excluded.data,
                    metadata = excluded.metadata,
                    session_id = excluded.session_id,
                    writer_id = excluded.writer_id",
                params![key, data, metadata, session_id, writer_id],
            )
            .map_err(|e| CacheError::Storage(format!("failed to save cache entry: {e}")))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> CacheResult<bool> {
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
            .map_err(|e| CacheError::Storage(format!("failed to delete cache entry: {e}")))?;
        Ok(n > 0)
    }

    fn keys(&self) -> CacheResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key FROM cache_entries ORDER BY key")
            .map_err(|e| CacheError::Storage(format!("failed to prepare key query: {e}")))?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| CacheError::Storage(format!("failed to list keys: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CacheError::Storage(format!("failed to read key: {e}")))?;
        Ok(keys)
    }

    fn clear(&self) -> CacheResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM cache_entries", [])
            .map_err(|e| CacheError::Storage(format!("failed to clear cache store: {e}")))?;
        Ok(())
    }
}
