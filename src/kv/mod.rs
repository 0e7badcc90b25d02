//! Durable key-value I/O.
//!
//! [`KvStorage`] is the collaborator every component persists through. It is
//! synchronous and atomic per key; [`Kv`] wraps a backend for async callers and
//! moves each call onto the blocking pool so the runtime never stalls on disk.

mod memory;
mod sqlite;

use std::fmt;
use std::sync::Arc;

use crate::error::StorageError;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// One operation inside a [`KvStorage::write_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
  Set { key: String, value: Vec<u8> },
  Remove { key: String },
}

/// Trait for durable key-value backends.
pub trait KvStorage: Send + Sync {
  /// Read the bytes stored under `key`.
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

  /// Replace the bytes stored under `key`.
  fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

  /// Delete `key`. Deleting a missing key is not an error.
  fn remove(&self, key: &str) -> Result<(), StorageError>;

  /// All keys starting with `prefix`, in ascending order.
  fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

  /// Apply several operations.
  ///
  /// Backends that support transactions apply the batch all-or-nothing. The
  /// default applies the operations in order and stops at the first failure.
  fn write_batch(&self, ops: &[BatchOp]) -> Result<(), StorageError> {
    for op in ops {
      match op {
        BatchOp::Set { key, value } => self.set(key, value)?,
        BatchOp::Remove { key } => self.remove(key)?,
      }
    }
    Ok(())
  }
}

/// Cloneable async handle over a shared [`KvStorage`] backend.
#[derive(Clone)]
pub struct Kv {
  backend: Arc<dyn KvStorage>,
}

impl fmt::Debug for Kv {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Kv").finish_non_exhaustive()
  }
}

impl Kv {
  pub fn new<S: KvStorage + 'static>(backend: S) -> Self {
    Self {
      backend: Arc::new(backend),
    }
  }

  pub fn from_arc(backend: Arc<dyn KvStorage>) -> Self {
    Self { backend }
  }

  /// Run a backend call on the blocking pool.
  async fn run<T, F>(&self, f: F) -> Result<T, StorageError>
  where
    T: Send + 'static,
    F: FnOnce(&dyn KvStorage) -> Result<T, StorageError> + Send + 'static,
  {
    let backend = Arc::clone(&self.backend);
    tokio::task::spawn_blocking(move || f(backend.as_ref()))
      .await
      .map_err(|e| StorageError::Task(e.to_string()))?
  }

  pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    let key = key.to_owned();
    self.run(move |b| b.get(&key)).await
  }

  pub async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
    let key = key.to_owned();
    self.run(move |b| b.set(&key, &value)).await
  }

  pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
    let key = key.to_owned();
    self.run(move |b| b.remove(&key)).await
  }

  pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
    let prefix = prefix.to_owned();
    self.run(move |b| b.list_keys(&prefix)).await
  }

  pub async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
    self.run(move |b| b.write_batch(&ops)).await
  }
}
