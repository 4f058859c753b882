//! Relaylink Storage -- archive for persistent tasks.
//!
//! Tasks that must survive a process restart are archived as `(kind, json)`
//! when scheduled and removed once they complete or fail permanently. On
//! startup the archive is replayed in insertion order.
//!
//! WAL mode + busy_timeout so the CLI can read the archive while a node runs.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },
    #[error("invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// One archived task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedTask {
    pub id: i64,
    /// Task kind, used to pick the decoder on reload.
    pub kind: String,
    /// Task state as JSON.
    pub data: String,
    pub archived_at: DateTime<Utc>,
}

/// Storage for persistent tasks.
pub trait TaskArchive: Send + Sync {
    /// Archive a task, returning its archive id.
    fn add(&self, kind: &str, data: &str) -> Result<i64>;
    /// Remove an archived task. Returns false if it was not archived.
    fn remove(&self, id: i64) -> Result<bool>;
    /// All archived tasks in insertion order.
    fn load_all(&self) -> Result<Vec<ArchivedTask>>;
    fn count(&self) -> Result<u64>;
}

/// SQLite-backed task archive.
pub struct SqliteTaskArchive {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteTaskArchive {
    fn db(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Open (or create) the archive at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        let archive = Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        };
        archive.ensure_schema()?;
        Ok(archive)
    }

    /// Open in read-only mode (for listing from the CLI).
    pub fn open_readonly(db_path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.db()?;
        let table_exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get(0),
        )?;

        if !table_exists {
            conn.execute_batch(include_str!("schema_v1.sql"))?;
            tracing::info!(path = %self.db_path.display(), "storage: created task archive");
        }

        let version: u32 = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);

        if version != SCHEMA_VERSION {
            return Err(StorageError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found: version,
            });
        }
        Ok(())
    }
}

impl TaskArchive for SqliteTaskArchive {
    fn add(&self, kind: &str, data: &str) -> Result<i64> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO archived_tasks (kind, data, archived_at) VALUES (?1, ?2, ?3)",
            params![kind, data, Utc::now().to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        tracing::debug!(id, kind, "storage: archived task");
        Ok(id)
    }

    fn remove(&self, id: i64) -> Result<bool> {
        let conn = self.db()?;
        let changed = conn.execute("DELETE FROM archived_tasks WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    fn load_all(&self) -> Result<Vec<ArchivedTask>> {
        let conn = self.db()?;
        let mut stmt =
            conn.prepare("SELECT id, kind, data, archived_at FROM archived_tasks ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, kind, data, archived_at)| {
                Ok(ArchivedTask {
                    id,
                    kind,
                    data,
                    archived_at: parse_timestamp(&archived_at)?,
                })
            })
            .collect()
    }

    fn count(&self) -> Result<u64> {
        let conn = self.db()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM archived_tasks", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Volatile archive for tests and for running without a database.
#[derive(Default)]
pub struct MemoryTaskArchive {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    rows: Vec<ArchivedTask>,
}

impl MemoryTaskArchive {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

impl TaskArchive for MemoryTaskArchive {
    fn add(&self, kind: &str, data: &str) -> Result<i64> {
        let mut inner = self.inner()?;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.rows.push(ArchivedTask {
            id,
            kind: kind.to_string(),
            data: data.to_string(),
            archived_at: Utc::now(),
        });
        Ok(id)
    }

    fn remove(&self, id: i64) -> Result<bool> {
        let mut inner = self.inner()?;
        let before = inner.rows.len();
        inner.rows.retain(|row| row.id != id);
        Ok(inner.rows.len() != before)
    }

    fn load_all(&self) -> Result<Vec<ArchivedTask>> {
        Ok(self.inner()?.rows.clone())
    }

    fn count(&self) -> Result<u64> {
        Ok(self.inner()?.rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, SqliteTaskArchive) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tasks.db");
        let archive = SqliteTaskArchive::open(&db_path).unwrap();
        (dir, archive)
    }

    fn exercise(archive: &dyn TaskArchive) {
        assert_eq!(archive.count().unwrap(), 0);

        let a = archive.add("outgoing-message", r#"{"n":1}"#).unwrap();
        let b = archive.add("drop-device", r#"{"n":2}"#).unwrap();
        let c = archive.add("outgoing-message", r#"{"n":3}"#).unwrap();
        assert!(a < b && b < c);

        assert!(archive.remove(b).unwrap());
        assert!(!archive.remove(b).unwrap());

        let rows = archive.load_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, a);
        assert_eq!(rows[0].kind, "outgoing-message");
        assert_eq!(rows[0].data, r#"{"n":1}"#);
        assert_eq!(rows[1].id, c);
        assert_eq!(archive.count().unwrap(), 2);
    }

    #[test]
    fn test_sqlite_archive() {
        let (_dir, archive) = test_db();
        exercise(&archive);
    }

    #[test]
    fn test_memory_archive() {
        exercise(&MemoryTaskArchive::new());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("tasks.db");

        let id = {
            let archive = SqliteTaskArchive::open(&db_path).unwrap();
            archive.add("reflect", "{}").unwrap()
        };

        let archive = SqliteTaskArchive::open(&db_path).unwrap();
        let rows = archive.load_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);

        let readonly = SqliteTaskArchive::open_readonly(&db_path).unwrap();
        assert_eq!(readonly.count().unwrap(), 1);
    }

    #[test]
    fn test_archived_at_is_recent() {
        let (_dir, archive) = test_db();
        let before = Utc::now() - chrono::Duration::seconds(1);
        archive.add("k", "{}").unwrap();
        let row = &archive.load_all().unwrap()[0];
        assert!(row.archived_at >= before);
    }

    #[test]
    fn test_schema_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tasks.db");
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE schema_version (version INTEGER NOT NULL);
                 INSERT INTO schema_version (version) VALUES (7);",
            )
            .unwrap();
        }
        assert!(matches!(
            SqliteTaskArchive::open(&db_path),
            Err(StorageError::SchemaVersionMismatch {
                expected: 1,
                found: 7
            })
        ));
    }
}
