//! In-memory backend for tests and throwaway sessions.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{BatchOp, KvStorage};
use crate::error::StorageError;

/// Storage that keeps everything in a `BTreeMap` for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KvStorage for MemoryStorage {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    let entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
    Ok(entries.get(key).cloned())
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
    let mut entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
    entries.insert(key.to_owned(), value.to_vec());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    let mut entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
    entries.remove(key);
    Ok(())
  }

  fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
    let entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
    Ok(
      entries
        .range(prefix.to_owned()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect(),
    )
  }

  fn write_batch(&self, ops: &[BatchOp]) -> Result<(), StorageError> {
    // Single lock for the whole batch keeps it atomic.
    let mut entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
    for op in ops {
      match op {
        BatchOp::Set { key, value } => {
          entries.insert(key.clone(), value.clone());
        }
        BatchOp::Remove { key } => {
          entries.remove(key);
        }
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_list_keys_by_prefix() {
    let storage = MemoryStorage::new();
    storage.set("@smartcart/cache/a", b"1").unwrap();
    storage.set("@smartcart/cache/b", b"2").unwrap();
    storage.set("@smartcart/lists", b"3").unwrap();

    let keys = storage.list_keys("@smartcart/cache/").unwrap();
    assert_eq!(keys, vec!["@smartcart/cache/a", "@smartcart/cache/b"]);
  }

  #[test]
  fn test_batch_applies_sets_and_removes() {
    let storage = MemoryStorage::new();
    storage.set("gone", b"x").unwrap();

    storage
      .write_batch(&[
        BatchOp::Set {
          key: "kept".into(),
          value: b"y".to_vec(),
        },
        BatchOp::Remove { key: "gone".into() },
      ])
      .unwrap();

    assert_eq!(storage.get("kept").unwrap(), Some(b"y".to_vec()));
    assert_eq!(storage.get("gone").unwrap(), None);
  }
}
