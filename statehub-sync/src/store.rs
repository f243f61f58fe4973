//! Durable storage for the operation queue, open conflicts and known
//! remote versions.

use crate::conflict::ConflictRecord;
use crate::error::{SyncError, SyncResult};
use crate::operation::SyncOperation;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use statehub_types::VersionRecord;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Persistence for sync manager state. Queue and conflict saves replace
/// the stored set.
pub trait QueueStore: Send + Sync {
    /// Operations in queue order.
    fn load_queue(&self) -> SyncResult<Vec<SyncOperation>>;
    fn save_queue(&self, ops: &[SyncOperation]) -> SyncResult<()>;
    fn load_conflicts(&self) -> SyncResult<Vec<ConflictRecord>>;
    fn save_conflicts(&self, conflicts: &[ConflictRecord]) -> SyncResult<()>;
    fn load_versions(&self) -> SyncResult<HashMap<String, VersionRecord>>;
    /// `None` forgets the key.
    fn save_version(&self, key: &str, version: Option<&VersionRecord>) -> SyncResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    queue: Mutex<Vec<SyncOperation>>,
    conflicts: Mutex<Vec<ConflictRecord>>,
    versions: Mutex<HashMap<String, VersionRecord>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueueStore {
    fn load_queue(&self) -> SyncResult<Vec<SyncOperation>> {
        Ok(self.queue.lock().clone())
    }

    fn save_queue(&self, ops: &[SyncOperation]) -> SyncResult<()> {
        *self.queue.lock() = ops.to_vec();
        Ok(())
    }

    fn load_conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        Ok(self.conflicts.lock().clone())
    }

    fn save_conflicts(&self, conflicts: &[ConflictRecord]) -> SyncResult<()> {
        *self.conflicts.lock() = conflicts.to_vec();
        Ok(())
    }

    fn load_versions(&self) -> SyncResult<HashMap<String, VersionRecord>> {
        Ok(self.versions.lock().clone())
    }

    fn save_version(&self, key: &str, version: Option<&VersionRecord>) -> SyncResult<()> {
        let mut versions = self.versions.lock();
        match version {
            Some(v) => {
                versions.insert(key.to_string(), v.clone());
            }
            None => {
                versions.remove(key);
            }
        }
        Ok(())
    }
}

/// SQLite-backed sync state. Rows hold JSON bodies.
pub struct SqliteQueueStore {
    conn: Arc<Mutex<Connection>>,
}

fn storage(context: &str) -> impl FnOnce(rusqlite::Error) -> SyncError + '_ {
    move |e| SyncError::Storage(format!("failed to {context}: {e}"))
}

impl SqliteQueueStore {
    /// Opens (or creates) a sync database at the given path.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let conn = Connection::open(path).map_err(storage("open sync store"))?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory().map_err(storage("open in-memory sync store"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> SyncResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sync_queue (
                position INTEGER NOT NULL,
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sync_conflicts (
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sync_versions (
                key TEXT PRIMARY KEY,
                body TEXT NOT NULL
            );
            ",
        )
        .map_err(storage("init sync schema"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn load_bodies(&self, sql: &str) -> SyncResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(storage("prepare query"))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage("query rows"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage("read row"))?;
        Ok(rows)
    }
}

impl QueueStore for SqliteQueueStore {
    fn load_queue(&self) -> SyncResult<Vec<SyncOperation>> {
        self.load_bodies("SELECT body FROM sync_queue ORDER BY position")?
            .iter()
            .map(|body| serde_json::from_str(body).map_err(SyncError::from))
            .collect()
    }

    fn save_queue(&self, ops: &[SyncOperation]) -> SyncResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(storage("begin transaction"))?;
        tx.execute("DELETE FROM sync_queue", [])
            .map_err(storage("clear sync queue"))?;
        for (position, op) in ops.iter().enumerate() {
            let body = serde_json::to_string(op)?;
            tx.execute(
                "INSERT INTO sync_queue (position, id, body) VALUES (?1, ?2, ?3)",
                params![position as i64, op.id.to_string(), body],
            )
            .map_err(storage("save operation"))?;
        }
        tx.commit().map_err(storage("commit sync queue"))
    }

    fn load_conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        self.load_bodies("SELECT body FROM sync_conflicts ORDER BY id")?
            .iter()
            .map(|body| serde_json::from_str(body).map_err(SyncError::from))
            .collect()
    }

    fn save_conflicts(&self, conflicts: &[ConflictRecord]) -> SyncResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(storage("begin transaction"))?;
        tx.execute("DELETE FROM sync_conflicts", [])
            .map_err(storage("clear conflicts"))?;
        for conflict in conflicts {
            let body = serde_json::to_string(conflict)?;
            tx.execute(
                "INSERT INTO sync_conflicts (id, body) VALUES (?1, ?2)",
                params![conflict.id.to_string(), body],
            )
            .map_err(storage("save conflict"))?;
        }
        tx.commit().map_err(storage("commit conflicts"))
    }

    fn load_versions(&self) -> SyncResult<HashMap<String, VersionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key, body FROM sync_versions")
            .map_err(storage("prepare version query"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(storage("query versions"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage("read version"))?;
        rows.into_iter()
            .map(|(key, body)| {
                serde_json::from_str(&body)
                    .map(|version| (key, version))
                    .map_err(SyncError::from)
            })
            .collect()
    }

    fn save_version(&self, key: &str, version: Option<&VersionRecord>) -> SyncResult<()> {
        let conn = self.conn.lock();
        match version {
            Some(v) => {
                let body = serde_json::to_string(v)?;
                conn.execute(
                    "INSERT INTO sync_versions (key, body) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET body = excluded.body",
                    params![key, body],
                )
                .map_err(storage("save version"))?;
            }
            None => {
                conn.execute("DELETE FROM sync_versions WHERE key = ?1", params![key])
                    .map_err(storage("delete version"))?;
            }
        }
        Ok(())
    }
}
