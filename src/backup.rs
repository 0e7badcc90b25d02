//! Backup files of the state slices.
//!
//! A backup is a JSON document:
//!
//! ```json
//! { "version": "1.0", "timestamp": "...", "checksum": "<sha256 hex>", "data": { "lists": {...} } }
//! ```
//!
//! The checksum covers the serialized `data` object. Object keys serialize in
//! sorted order, so the encoding is canonical.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{BackupError, StorageError, StoreError};
use crate::store::{PersistentStore, SliceKey, Snapshot};

/// Format version written into every backup.
pub const BACKUP_FORMAT_VERSION: &str = "1.0";

/// Minimum age in days of the last automatic backup before another one is taken.
pub const AUTO_BACKUP_INTERVAL_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFile {
  pub version: String,
  pub timestamp: DateTime<Utc>,
  pub checksum: String,
  pub data: Map<String, Value>,
}

/// Summary of a written or restored backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
  pub path: PathBuf,
  pub timestamp: DateTime<Utc>,
  pub slices: Vec<SliceKey>,
}

/// SHA-256 hex of the serialized `data` object.
pub fn compute_checksum(data: &Map<String, Value>) -> Result<String, StoreError> {
  let bytes = serde_json::to_vec(data).map_err(|e| StoreError::serialization("backup data", e))?;
  Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Whether an automatic backup is due, given the time of the last one.
pub fn backup_due(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
  match last {
    None => true,
    Some(last) => now.signed_duration_since(last) > Duration::days(AUTO_BACKUP_INTERVAL_DAYS),
  }
}

/// Default file name for a backup taken at `now`.
pub fn backup_file_name(now: DateTime<Utc>) -> String {
  format!("smartcart_backup_{}.json", now.timestamp_millis())
}

/// Write every present slice to `path`.
///
/// Slices that are not valid JSON or fail their shape check are left out. The file is written to a
/// temporary sibling and renamed into place.
pub async fn create_backup(store: &PersistentStore, path: &Path) -> Result<BackupSummary, BackupError> {
  let mut snapshot = store.snapshot().await?;
  snapshot.retain(|key, value| match key.check_shape(value) {
    Ok(()) => true,
    Err(e) => {
      warn!(slice = %key, error = %e, "leaving corrupted slice out of backup");
      false
    }
  });
  let timestamp = Utc::now();

  let data: Map<String, Value> = snapshot
    .iter()
    .map(|(key, value)| (key.name().to_owned(), value.clone()))
    .collect();
  let backup = BackupFile {
    version: BACKUP_FORMAT_VERSION.to_owned(),
    timestamp,
    checksum: compute_checksum(&data)?,
    data,
  };
  let bytes =
    serde_json::to_vec_pretty(&backup).map_err(|e| StoreError::serialization("backup", e))?;

  let target = path.to_path_buf();
  tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
    .await
    .map_err(|e| StorageError::Task(e.to_string()))??;

  info!(path = %path.display(), slices = snapshot.len(), "backup created");
  Ok(BackupSummary {
    path: path.to_path_buf(),
    timestamp,
    slices: snapshot.keys().copied().collect(),
  })
}

/// Replace the current slices with the contents of the backup at `path`.
///
/// The whole file is validated first; nothing is touched unless the format,
/// the checksum and every slice check out. Slices missing from the backup are
/// cleared in the same batch.
pub async fn restore_backup(store: &PersistentStore, path: &Path) -> Result<BackupSummary, BackupError> {
  let source = path.to_path_buf();
  let bytes = tokio::task::spawn_blocking(move || {
    fs::read(&source).map_err(|e| io_error("read", &source, e))
  })
  .await
  .map_err(|e| StorageError::Task(e.to_string()))??;

  let (backup, snapshot) = parse_backup(&bytes)?;
  store.commit(&snapshot, Vec::new()).await?;

  info!(path = %path.display(), slices = snapshot.len(), "backup restored");
  Ok(BackupSummary {
    path: path.to_path_buf(),
    timestamp: backup.timestamp,
    slices: snapshot.keys().copied().collect(),
  })
}

/// Decode and validate a backup document.
pub fn parse_backup(bytes: &[u8]) -> Result<(BackupFile, Snapshot), BackupError> {
  let backup: BackupFile =
    serde_json::from_slice(bytes).map_err(|e| BackupError::Format(e.to_string()))?;

  if backup.version != BACKUP_FORMAT_VERSION {
    return Err(BackupError::Format(format!(
      "unsupported format version {}",
      backup.version
    )));
  }

  let actual = compute_checksum(&backup.data)?;
  if actual != backup.checksum {
    return Err(BackupError::ChecksumMismatch {
      expected: backup.checksum,
      actual,
    });
  }

  let mut snapshot = Snapshot::new();
  for (name, value) in &backup.data {
    let Some(key) = SliceKey::from_name(name) else {
      warn!(entry = %name, "ignoring unknown entry in backup");
      continue;
    };
    key
      .check_shape(value)
      .map_err(|source| BackupError::InvalidSlice {
        slice: name.clone(),
        source,
      })?;
    snapshot.insert(key, value.clone());
  }

  Ok((backup, snapshot))
}

fn io_error(operation: &'static str, path: &Path, source: std::io::Error) -> StorageError {
  StorageError::Io {
    operation,
    path: path.display().to_string(),
    source,
  }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
  if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
    fs::create_dir_all(parent).map_err(|e| io_error("create directory", parent, e))?;
  }

  let temp_path = path.with_extension("json.tmp");
  let mut file = File::create(&temp_path).map_err(|e| io_error("create", &temp_path, e))?;
  file
    .write_all(bytes)
    .map_err(|e| io_error("write", &temp_path, e))?;
  file.sync_all().map_err(|e| io_error("sync", &temp_path, e))?;

  fs::rename(&temp_path, path).map_err(|e| io_error("rename", &temp_path, e))
}
