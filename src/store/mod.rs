//! Durable storage of application state slices.
//!
//! Each slice is a JSON document under a fixed key. Writes are validated before
//! they reach the backend and serialized per slice; reads validate again and
//! contain corruption by discarding the record, so a bad slice never blocks
//! startup.

mod slice;
mod state;

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::kv::{BatchOp, Kv};

pub use slice::{SliceKey, SliceSchema};
pub use state::{
  AppState, ListRecord, ListsState, MallRecord, MallsState, PriceRecord, PricesState,
  SettingsState,
};

/// Raw documents of every present slice, as seen by migrations and backups.
pub type Snapshot = BTreeMap<SliceKey, Value>;

/// Store for the four state slices.
#[derive(Debug, Clone)]
pub struct PersistentStore {
  kv: Kv,
  /// One writer lock per slice, indexed by [`SliceKey::index`].
  writers: Arc<[Mutex<()>; 4]>,
}

impl PersistentStore {
  pub fn new(kv: Kv) -> Self {
    Self {
      kv,
      writers: Arc::new([Mutex::new(()), Mutex::new(()), Mutex::new(()), Mutex::new(())]),
    }
  }

  pub(crate) fn kv(&self) -> &Kv {
    &self.kv
  }

  /// Persist a typed slice.
  ///
  /// The encoded bytes are run through [`SliceSchema::validate`] before they are
  /// written, so a document the store would later discard is never stored.
  pub async fn save<S: SliceSchema>(&self, value: &S) -> Result<()> {
    let bytes =
      serde_json::to_vec(value).map_err(|e| StoreError::serialization(S::KEY.name(), e))?;
    S::validate(&bytes).map_err(|e| StoreError::corruption(S::KEY.name(), e))?;
    self.write(S::KEY, bytes).await
  }

  /// Persist an untyped document after checking the slice's shape.
  pub async fn save_raw(&self, key: SliceKey, value: &Value) -> Result<()> {
    key
      .check_shape(value)
      .map_err(|e| StoreError::corruption(key.name(), e))?;
    let bytes = serde_json::to_vec(value).map_err(|e| StoreError::serialization(key.name(), e))?;
    self.write(key, bytes).await
  }

  async fn write(&self, key: SliceKey, bytes: Vec<u8>) -> Result<()> {
    let _writer = self.writer(key).lock().await;
    match self.kv.set(key.storage_key(), bytes).await {
      Ok(()) => {
        debug!(slice = %key, "slice saved");
        Ok(())
      }
      Err(e) => {
        warn!(slice = %key, error = %e, "failed to save slice");
        Err(e.into())
      }
    }
  }

  fn writer(&self, key: SliceKey) -> &Mutex<()> {
    // index() is always < 4
    &self.writers[key.index()]
  }

  /// Load a typed slice, or `None` if it is absent, unreadable or corrupted.
  pub async fn load<S: SliceSchema>(&self) -> Option<S> {
    let bytes = self.read(S::KEY).await?;
    match S::validate(&bytes) {
      Ok(value) => Some(value),
      Err(e) => {
        self.discard(S::KEY, &bytes, &e.to_string()).await;
        None
      }
    }
  }

  /// Load a slice as an untyped document, with the same containment as [`load`](Self::load).
  pub async fn load_raw(&self, key: SliceKey) -> Option<Value> {
    let bytes = self.read(key).await?;
    let parsed = serde_json::from_slice::<Value>(&bytes)
      .map_err(|e| e.to_string())
      .and_then(|value| key.check_shape(&value).map(|()| value).map_err(|e| e.to_string()));

    match parsed {
      Ok(value) => Some(value),
      Err(reason) => {
        self.discard(key, &bytes, &reason).await;
        None
      }
    }
  }

  async fn read(&self, key: SliceKey) -> Option<Vec<u8>> {
    match self.kv.get(key.storage_key()).await {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!(slice = %key, error = %e, "failed to read slice, treating as absent");
        None
      }
    }
  }

  /// Remove `corrupt` from the slice, unless a writer replaced it after it was read.
  async fn discard(&self, key: SliceKey, corrupt: &[u8], reason: &str) {
    warn!(slice = %key, reason, "invalid slice structure, clearing corrupted data");
    let _writer = self.writer(key).lock().await;
    match self.kv.get(key.storage_key()).await {
      Ok(Some(current)) if current == corrupt => {}
      Ok(_) => {
        debug!(slice = %key, "slice rewritten since read, keeping it");
        return;
      }
      Err(e) => {
        warn!(slice = %key, error = %e, "failed to re-read corrupted slice");
        return;
      }
    }
    if let Err(e) = self.kv.remove(key.storage_key()).await {
      warn!(slice = %key, error = %e, "failed to remove corrupted slice");
    }
  }

  /// Remove one slice.
  pub async fn clear(&self, key: SliceKey) -> Result<()> {
    let _writer = self.writer(key).lock().await;
    self.kv.remove(key.storage_key()).await?;
    debug!(slice = %key, "slice cleared");
    Ok(())
  }

  /// Remove every slice in one batch.
  pub async fn clear_all(&self) -> Result<()> {
    self.commit(&Snapshot::new(), Vec::new()).await
  }

  /// Load every slice, substituting defaults for anything missing.
  pub async fn hydrate(&self) -> AppState {
    let (lists, malls, settings, prices) = tokio::join!(
      self.load::<ListsState>(),
      self.load::<MallsState>(),
      self.load::<SettingsState>(),
      self.load::<PricesState>(),
    );

    AppState {
      lists: lists.unwrap_or_default(),
      malls: malls.unwrap_or_default(),
      settings: settings.unwrap_or_default(),
      prices: prices.unwrap_or_default(),
    }
  }

  /// Read every present slice as raw JSON without shape checks.
  ///
  /// Documents that are not JSON at all are dropped from the snapshot. Backend
  /// failures are returned so the caller can decide how to contain them.
  pub(crate) async fn snapshot(&self) -> Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    for key in SliceKey::ALL {
      let Some(bytes) = self.kv.get(key.storage_key()).await? else {
        continue;
      };
      match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => {
          snapshot.insert(key, value);
        }
        Err(e) => warn!(slice = %key, error = %e, "dropping undecodable slice from snapshot"),
      }
    }
    Ok(snapshot)
  }

  /// Replace every slice with the contents of `snapshot` (absent keys are
  /// removed) together with `extra` operations, in one batch.
  pub(crate) async fn commit(&self, snapshot: &Snapshot, extra: Vec<BatchOp>) -> Result<()> {
    let mut ops = Vec::with_capacity(SliceKey::ALL.len() + extra.len());
    for key in SliceKey::ALL {
      match snapshot.get(&key) {
        Some(value) => ops.push(BatchOp::Set {
          key: key.storage_key().to_owned(),
          value: serde_json::to_vec(value).map_err(|e| StoreError::serialization(key.name(), e))?,
        }),
        None => ops.push(BatchOp::Remove {
          key: key.storage_key().to_owned(),
        }),
      }
    }
    ops.extend(extra);

    // Lock in index order so two commits cannot deadlock.
    let _lists = self.writer(SliceKey::Lists).lock().await;
    let _malls = self.writer(SliceKey::Malls).lock().await;
    let _settings = self.writer(SliceKey::Settings).lock().await;
    let _prices = self.writer(SliceKey::Prices).lock().await;

    self.kv.write_batch(ops).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::StorageError;
  use crate::kv::{KvStorage, MemoryStorage};
  use serde_json::json;
  use std::sync::atomic::{AtomicBool, Ordering};

  fn store() -> (PersistentStore, Kv) {
    let kv = Kv::new(MemoryStorage::new());
    (PersistentStore::new(kv.clone()), kv)
  }

  fn sample_lists() -> ListsState {
    serde_json::from_value(json!({
      "lists": [
        { "id": "1", "name": "Weekly", "items": [{ "id": "a", "name": "Milk", "quantity": 2 }] },
        { "id": "2", "name": "Party", "items": [] }
      ],
      "history": [{ "listId": "0", "completedAt": "2024-03-01T10:00:00Z" }]
    }))
    .unwrap()
  }

  #[tokio::test]
  async fn test_round_trip_every_slice() {
    let (store, _) = store();

    let lists = sample_lists();
    let malls: MallsState = serde_json::from_value(json!({
      "malls": [{ "id": "m1", "name": "Centro", "location": { "lat": 1.5, "lng": 2.5 } }],
      "favorites": ["m1"]
    }))
    .unwrap();
    let mut settings = SettingsState::default();
    settings.set("currency", "EUR");
    let prices = PricesState {
      price_history: vec![PriceRecord {
        id: "p1".into(),
        mall_id: "m1".into(),
        item_id: "a".into(),
        price: 1.99,
        date: "2024-03-01T10:00:00Z".into(),
      }],
      last_update: Some("2024-03-01T10:00:00Z".into()),
    };

    store.save(&lists).await.unwrap();
    store.save(&malls).await.unwrap();
    store.save(&settings).await.unwrap();
    store.save(&prices).await.unwrap();

    assert_eq!(store.load::<ListsState>().await, Some(lists));
    assert_eq!(store.load::<MallsState>().await, Some(malls));
    assert_eq!(store.load::<SettingsState>().await, Some(settings));
    assert_eq!(store.load::<PricesState>().await, Some(prices));
  }

  #[tokio::test]
  async fn test_absent_slice_loads_as_none() {
    let (store, _) = store();
    assert_eq!(store.load::<MallsState>().await, None);
  }

  #[tokio::test]
  async fn test_malformed_bytes_are_discarded() {
    let (store, kv) = store();
    kv.set(SliceKey::Lists.storage_key(), b"{not json".to_vec())
      .await
      .unwrap();

    assert_eq!(store.load::<ListsState>().await, None);
    assert_eq!(kv.get(SliceKey::Lists.storage_key()).await.unwrap(), None);

    // The slice is usable again afterwards.
    let lists = sample_lists();
    store.save(&lists).await.unwrap();
    assert_eq!(store.load::<ListsState>().await, Some(lists));
  }

  #[tokio::test]
  async fn test_wrong_shape_is_discarded() {
    let (store, kv) = store();
    kv.set(
      SliceKey::Prices.storage_key(),
      serde_json::to_vec(&json!({ "priceHistory": "oops" })).unwrap(),
    )
    .await
    .unwrap();

    assert_eq!(store.load_raw(SliceKey::Prices).await, None);
    assert_eq!(kv.get(SliceKey::Prices.storage_key()).await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_save_raw_rejects_bad_shape() {
    let (store, kv) = store();
    let err = store
      .save_raw(SliceKey::Malls, &json!({ "malls": 3 }))
      .await
      .unwrap_err();
    assert!(matches!(err, StoreError::Corruption { .. }));
    assert_eq!(kv.get(SliceKey::Malls.storage_key()).await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_hydrate_fills_defaults() {
    let (store, kv) = store();
    store.save(&sample_lists()).await.unwrap();
    kv.set(SliceKey::Settings.storage_key(), b"[]".to_vec())
      .await
      .unwrap();

    let state = store.hydrate().await;
    assert_eq!(state.lists, sample_lists());
    assert_eq!(state.malls, MallsState::default());
    assert_eq!(state.settings, SettingsState::default());
    assert!(state.prices.price_history.is_empty());
  }

  #[tokio::test]
  async fn test_clear_one_and_all() {
    let (store, _) = store();
    store.save(&sample_lists()).await.unwrap();
    store.save(&SettingsState::default()).await.unwrap();

    store.clear(SliceKey::Lists).await.unwrap();
    assert_eq!(store.load::<ListsState>().await, None);
    assert!(store.load::<SettingsState>().await.is_some());

    store.clear_all().await.unwrap();
    assert_eq!(store.load::<SettingsState>().await, None);
  }

  #[tokio::test]
  async fn test_concurrent_saves_leave_one_whole_document() {
    let (store, _) = store();
    let mut tasks = Vec::new();
    for n in 0..16 {
      let store = store.clone();
      tasks.push(tokio::spawn(async move {
        let mut settings = SettingsState::default();
        settings.set("writer", n);
        store.save(&settings).await
      }));
    }
    for task in tasks {
      task.await.unwrap().unwrap();
    }

    let settings = store.load::<SettingsState>().await.unwrap();
    assert!(settings.get("writer").and_then(Value::as_i64).is_some());
    assert_eq!(settings.0.len(), 4);
  }

  /// Backend whose writes fail while `failing` is set.
  #[derive(Default)]
  struct FlakyStorage {
    inner: MemoryStorage,
    failing: AtomicBool,
  }

  impl KvStorage for FlakyStorage {
    fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, StorageError> {
      self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> std::result::Result<(), StorageError> {
      if self.failing.load(Ordering::SeqCst) {
        return Err(StorageError::Unavailable("disk full".into()));
      }
      self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> std::result::Result<(), StorageError> {
      self.inner.remove(key)
    }

    fn list_keys(&self, prefix: &str) -> std::result::Result<Vec<String>, StorageError> {
      self.inner.list_keys(prefix)
    }
  }

  #[tokio::test]
  async fn test_io_failure_is_reported_not_fatal() {
    let backend = Arc::new(FlakyStorage::default());
    backend.failing.store(true, Ordering::SeqCst);
    let store = PersistentStore::new(Kv::from_arc(backend.clone()));

    let err = store.save(&sample_lists()).await.unwrap_err();
    assert!(matches!(err, StoreError::StorageIo(_)));

    backend.failing.store(false, Ordering::SeqCst);
    store.save(&sample_lists()).await.unwrap();
    assert_eq!(store.load::<ListsState>().await, Some(sample_lists()));
  }

  /// Pauses the first read of the lists slice until released.
  struct GatedStorage {
    inner: MemoryStorage,
    gate: std::sync::Mutex<Option<(tokio::sync::oneshot::Sender<()>, std::sync::mpsc::Receiver<()>)>>,
  }

  impl KvStorage for GatedStorage {
    fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, StorageError> {
      let value = self.inner.get(key)?;
      if key == SliceKey::Lists.storage_key() {
        let gate = self.gate.lock().unwrap().take();
        if let Some((read_done, release)) = gate {
          let _ = read_done.send(());
          let _ = release.recv();
        }
      }
      Ok(value)
    }

    fn set(&self, key: &str, value: &[u8]) -> std::result::Result<(), StorageError> {
      self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> std::result::Result<(), StorageError> {
      self.inner.remove(key)
    }

    fn list_keys(&self, prefix: &str) -> std::result::Result<Vec<String>, StorageError> {
      self.inner.list_keys(prefix)
    }
  }

  #[tokio::test]
  async fn test_discard_keeps_slice_saved_after_corrupt_read() {
    let (read_tx, read_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let backend = Arc::new(GatedStorage {
      inner: MemoryStorage::new(),
      gate: std::sync::Mutex::new(Some((read_tx, release_rx))),
    });
    backend
      .inner
      .set(SliceKey::Lists.storage_key(), b"{corrupt")
      .unwrap();
    let store = PersistentStore::new(Kv::from_arc(backend.clone()));

    let loader = tokio::spawn({
      let store = store.clone();
      async move { store.load::<ListsState>().await }
    });
    read_rx.await.unwrap();

    // Lands between the loader's read and its discard.
    store.save(&sample_lists()).await.unwrap();
    release_tx.send(()).unwrap();

    assert_eq!(loader.await.unwrap(), None);
    assert_eq!(store.load::<ListsState>().await, Some(sample_lists()));
  }
}
