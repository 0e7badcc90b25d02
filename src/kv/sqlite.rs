//! SQLite-backed key-value storage.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use super::{BatchOp, KvStorage};
use crate::error::StorageError;

/// Schema for the key-value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Database file name inside the data directory.
const DB_FILE: &str = "smartcart.db";

/// SQLite-based storage. One row per key; each statement is atomic per key and
/// batches run inside a transaction.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStorage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SqliteStorage").finish_non_exhaustive()
  }
}

fn sqlite(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> StorageError {
  move |source| StorageError::Sqlite { operation, source }
}

impl SqliteStorage {
  /// Open or create the database inside `data_dir`.
  pub fn open_in(data_dir: &Path) -> Result<Self, StorageError> {
    std::fs::create_dir_all(data_dir).map_err(|e| StorageError::Io {
      operation: "create data directory",
      path: data_dir.display().to_string(),
      source: e,
    })?;

    Self::open(&data_dir.join(DB_FILE))
  }

  /// Open or create the database file at `path`.
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    let conn = Connection::open(path).map_err(sqlite("open"))?;
    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(sqlite("configure busy timeout"))?;
    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self, StorageError> {
    let conn = Connection::open_in_memory().map_err(sqlite("open"))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self, StorageError> {
    conn
      .execute_batch(KV_SCHEMA)
      .map_err(sqlite("create schema"))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default data directory.
  pub fn default_dir() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("smartcart"))
  }
}

impl KvStorage for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(sqlite("read"))
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)",
        params![key, value, Utc::now().to_rfc3339()],
      )
      .map_err(sqlite("write"))?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(sqlite("delete"))?;
    Ok(())
  }

  fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
    // substr() instead of LIKE so `%` and `_` in prefixes match literally
    let mut stmt = conn
      .prepare("SELECT key FROM kv_store WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
      .map_err(sqlite("prepare key scan"))?;

    let keys = stmt
      .query_map(params![prefix], |row| row.get::<_, String>(0))
      .map_err(sqlite("scan keys"))?
      .collect::<Result<Vec<_>, _>>()
      .map_err(sqlite("scan keys"))?;

    Ok(keys)
  }

  fn write_batch(&self, ops: &[BatchOp]) -> Result<(), StorageError> {
    let mut conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
    let tx = conn.transaction().map_err(sqlite("begin transaction"))?;
    let now = Utc::now().to_rfc3339();

    for op in ops {
      match op {
        BatchOp::Set { key, value } => {
          tx.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)",
            params![key, value, now],
          )
          .map_err(sqlite("batch write"))?;
        }
        BatchOp::Remove { key } => {
          tx.execute("DELETE FROM kv_store WHERE key = ?", params![key])
            .map_err(sqlite("batch delete"))?;
        }
      }
    }

    tx.commit().map_err(sqlite("commit transaction"))?;
    Ok(())
  }
}
