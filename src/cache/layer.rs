//! Cache manager orchestrating the memory and persistent tiers.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheHit, CacheSource, CacheStats};
use crate::error::{Result, StoreError};
use crate::kv::{BatchOp, Kv};

/// Prefix of every persistent cache key.
pub const CACHE_PREFIX: &str = "@smartcart/cache/";

/// TTL used when none is given.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Two-tier cache.
///
/// The memory tier is unbounded and cleared on restart. The persistent tier is
/// reclaimed only by [`remove`](Self::remove), [`clear`](Self::clear) or lazy
/// eviction when an expired entry is read. Persistent-tier failures on reads
/// are reported as misses.
#[derive(Debug, Clone)]
pub struct CacheManager {
  kv: Kv,
  memory: Arc<Mutex<HashMap<String, CacheEntry>>>,
  default_ttl: Duration,
}

fn now_ms() -> i64 {
  Utc::now().timestamp_millis()
}

fn storage_key(key: &str) -> String {
  format!("{CACHE_PREFIX}{key}")
}

fn ttl_ms(ttl: Duration) -> u64 {
  u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

impl CacheManager {
  /// Create a cache manager persisting through `kv`.
  pub fn new(kv: Kv) -> Self {
    Self {
      kv,
      memory: Arc::new(Mutex::new(HashMap::new())),
      default_ttl: DEFAULT_TTL,
    }
  }

  /// Set the TTL used by [`set`](Self::set).
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  fn memory(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
    // Entries are plain data, so a panicked holder cannot leave them half-written.
    self.memory.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Get a value, or `None` on a miss.
  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.lookup(key).await.map(|hit| hit.data)
  }

  /// Get a value together with the tier that served it.
  ///
  /// 1. Memory tier - if present and unexpired, return it
  /// 2. Persistent tier - if present and unexpired, promote into memory
  /// 3. Expired or undecodable entries are evicted from both tiers
  pub async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<CacheHit<T>> {
    let now = now_ms();

    let cached = self.memory().get(key).cloned();
    if let Some(entry) = cached {
      if !entry.is_expired(now) {
        return match serde_json::from_value::<T>(entry.value.clone()) {
          Ok(data) => Some(CacheHit {
            data,
            source: CacheSource::Memory,
            cached_at: entry.stored_at_utc(),
          }),
          Err(e) => {
            warn!(key, error = %e, "cached value has unexpected type, evicting");
            self.evict(key).await;
            None
          }
        };
      }
    }

    let bytes = match self.kv.get(&storage_key(key)).await {
      Ok(Some(bytes)) => bytes,
      Ok(None) => {
        // Drop any expired memory copy left behind.
        self.memory().remove(key);
        return None;
      }
      Err(e) => {
        warn!(key, error = %e, "persistent cache read failed, treating as miss");
        return None;
      }
    };

    let entry = match serde_json::from_slice::<CacheEntry>(&bytes) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key, error = %e, "undecodable cache entry, evicting");
        self.evict(key).await;
        return None;
      }
    };

    if entry.is_expired(now) {
      debug!(key, "cache entry expired");
      self.evict(key).await;
      return None;
    }

    match serde_json::from_value::<T>(entry.value.clone()) {
      Ok(data) => {
        let cached_at = entry.stored_at_utc();
        self.memory().insert(key.to_owned(), entry);
        Some(CacheHit {
          data,
          source: CacheSource::Persistent,
          cached_at,
        })
      }
      Err(e) => {
        warn!(key, error = %e, "cached value has unexpected type, evicting");
        self.evict(key).await;
        None
      }
    }
  }

  /// Store a value with the default TTL.
  pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    self.set_with_ttl(key, value, self.default_ttl).await
  }

  /// Store a value in both tiers, stamped with the current time.
  ///
  /// The memory tier is updated even when the persistent write fails; the
  /// failure is returned so the caller can decide whether to retry.
  pub async fn set_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
    let value =
      serde_json::to_value(value).map_err(|e| StoreError::serialization(format!("cache entry {key}"), e))?;
    let entry = CacheEntry::new(value, now_ms(), ttl_ms(ttl));
    let bytes =
      serde_json::to_vec(&entry).map_err(|e| StoreError::serialization(format!("cache entry {key}"), e))?;

    self.memory().insert(key.to_owned(), entry);

    if let Err(e) = self.kv.set(&storage_key(key), bytes).await {
      warn!(key, error = %e, "failed to persist cache entry");
      return Err(e.into());
    }
    Ok(())
  }

  /// Evict a key from both tiers.
  pub async fn remove(&self, key: &str) -> Result<()> {
    self.memory().remove(key);
    self.kv.remove(&storage_key(key)).await?;
    Ok(())
  }

  /// Best-effort eviction used on read paths.
  async fn evict(&self, key: &str) {
    if let Err(e) = self.remove(key).await {
      warn!(key, error = %e, "failed to evict cache entry");
    }
  }

  /// Remove every cache entry from both tiers. Returns the number of persistent
  /// entries removed.
  pub async fn clear(&self) -> Result<usize> {
    self.memory().clear();

    let keys = self.kv.list_keys(CACHE_PREFIX).await?;
    let count = keys.len();
    let ops = keys.into_iter().map(|key| BatchOp::Remove { key }).collect();
    self.kv.write_batch(ops).await?;

    debug!(count, "cache cleared");
    Ok(count)
  }

  /// Counts and keys for both tiers. Keys are reported without the prefix.
  pub async fn stats(&self) -> Result<CacheStats> {
    let mut memory_keys: Vec<String> = self.memory().keys().cloned().collect();
    memory_keys.sort();

    let persistent_keys: Vec<String> = self
      .kv
      .list_keys(CACHE_PREFIX)
      .await?
      .into_iter()
      .map(|k| k.trim_start_matches(CACHE_PREFIX).to_owned())
      .collect();

    Ok(CacheStats {
      memory_item_count: memory_keys.len(),
      persistent_item_count: persistent_keys.len(),
      memory_keys,
      persistent_keys,
    })
  }

  /// Warm the memory tier from unexpired persistent entries.
  ///
  /// Returns how many keys were loaded. Missing, expired or unreadable entries
  /// are skipped and left for the next read to evict.
  pub async fn prefetch(&self, keys: &[&str]) -> usize {
    let now = now_ms();
    let mut loaded = 0;

    for key in keys {
      let Ok(Some(bytes)) = self.kv.get(&storage_key(key)).await else {
        continue;
      };
      let Ok(entry) = serde_json::from_slice::<CacheEntry>(&bytes) else {
        continue;
      };
      if !entry.is_expired(now) {
        self.memory().insert((*key).to_owned(), entry);
        loaded += 1;
      }
    }

    loaded
  }

  /// Return the cached value for `key`, or fetch, cache and return it.
  ///
  /// A failure to cache the fetched value is logged and does not fail the call.
  pub async fn get_or_fetch<T, E, F, Fut>(&self, key: &str, ttl: Duration, fetcher: F) -> std::result::Result<T, E>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
  {
    if let Some(data) = self.get::<T>(key).await {
      return Ok(data);
    }

    let data = fetcher().await?;
    if let Err(e) = self.set_with_ttl(key, &data, ttl).await {
      debug!(key, error = %e, "fetched value was not cached");
    }
    Ok(data)
  }

  /// Cache the latest price of an item at a mall under `price_<mall>_<item>`.
  pub async fn cache_price_data(&self, mall_id: &str, item_id: &str, price: f64) -> Result<()> {
    let key = format!("price_{mall_id}_{item_id}");
    self
      .set(&key, &json!({ "price": price, "lastUpdated": now_ms() }))
      .await
  }

  /// Cache derived list data under `list_<id>`.
  pub async fn cache_list_data<T: Serialize>(&self, list_id: &str, data: &T) -> Result<()> {
    self.set(&format!("list_{list_id}"), data).await
  }

  /// Cache derived mall data under `mall_<id>`.
  pub async fn cache_mall_data<T: Serialize>(&self, mall_id: &str, data: &T) -> Result<()> {
    self.set(&format!("mall_{mall_id}"), data).await
  }

  /// Latest cached price for an item at a mall.
  pub async fn cached_price(&self, mall_id: &str, item_id: &str) -> Option<f64> {
    let value: Value = self.get(&format!("price_{mall_id}_{item_id}")).await?;
    value.get("price").and_then(Value::as_f64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::StorageError;
  use crate::kv::{KvStorage, MemoryStorage};
  use serde::Deserialize;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

  fn cache() -> (CacheManager, Kv) {
    let kv = Kv::new(MemoryStorage::new());
    (CacheManager::new(kv.clone()), kv)
  }

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Summary {
    total: u32,
    label: String,
  }

  #[tokio::test]
  async fn test_ttl_expiry_evicts_both_tiers() {
    let (cache, kv) = cache();
    cache
      .set_with_ttl("k", &"v", Duration::from_millis(100))
      .await
      .unwrap();

    assert_eq!(cache.get::<String>("k").await.as_deref(), Some("v"));

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(cache.get::<String>("k").await, None);
    assert_eq!(kv.get(&storage_key("k")).await.unwrap(), None);
    assert_eq!(cache.stats().await.unwrap().memory_item_count, 0);
  }

  #[tokio::test]
  async fn test_persistent_hit_is_promoted() {
    let (cache, kv) = cache();
    let summary = Summary {
      total: 3,
      label: "weekly".into(),
    };
    cache.set("summary", &summary).await.unwrap();

    // A fresh manager over the same storage simulates a restart.
    let restarted = CacheManager::new(kv);
    let hit = restarted.lookup::<Summary>("summary").await.unwrap();
    assert_eq!(hit.source, CacheSource::Persistent);
    assert_eq!(hit.data, summary);
    assert!(hit.cached_at.is_some());

    let hit = restarted.lookup::<Summary>("summary").await.unwrap();
    assert_eq!(hit.source, CacheSource::Memory);
  }

  #[tokio::test]
  async fn test_undecodable_entry_is_evicted() {
    let (cache, kv) = cache();
    kv.set(&storage_key("bad"), b"{{{".to_vec()).await.unwrap();

    assert_eq!(cache.get::<Value>("bad").await, None);
    assert_eq!(kv.get(&storage_key("bad")).await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_type_mismatch_is_a_miss_and_evicts() {
    let (cache, kv) = cache();
    cache.set("n", &42).await.unwrap();

    assert_eq!(cache.get::<Summary>("n").await, None);
    assert_eq!(kv.get(&storage_key("n")).await.unwrap(), None);
    assert_eq!(cache.get::<u32>("n").await, None);
  }

  #[tokio::test]
  async fn test_remove_evicts_both_tiers() {
    let (cache, kv) = cache();
    cache.set("k", &1).await.unwrap();
    cache.remove("k").await.unwrap();

    assert_eq!(cache.get::<u32>("k").await, None);
    assert_eq!(kv.get(&storage_key("k")).await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_clear_leaves_other_keys_alone() {
    let (cache, kv) = cache();
    kv.set("@smartcart/lists", b"{}".to_vec()).await.unwrap();
    cache.set("a", &1).await.unwrap();
    cache.set("b", &2).await.unwrap();

    assert_eq!(cache.clear().await.unwrap(), 2);
    assert_eq!(cache.stats().await.unwrap(), CacheStats::default());
    assert!(kv.get("@smartcart/lists").await.unwrap().is_some());
  }

  #[tokio::test]
  async fn test_stats_and_prefetch() {
    let (cache, kv) = cache();
    cache.cache_price_data("m1", "milk", 1.25).await.unwrap();
    cache.cache_list_data("7", &vec!["eggs"]).await.unwrap();
    cache
      .set_with_ttl("stale", &0, Duration::ZERO)
      .await
      .unwrap();

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.persistent_item_count, 3);
    assert!(stats.persistent_keys.contains(&"price_m1_milk".to_string()));

    let restarted = CacheManager::new(kv);
    let loaded = restarted
      .prefetch(&["price_m1_milk", "list_7", "stale", "missing"])
      .await;
    assert_eq!(loaded, 2);
    assert_eq!(
      restarted.stats().await.unwrap().memory_keys,
      vec!["list_7", "price_m1_milk"]
    );
    assert_eq!(restarted.cached_price("m1", "milk").await, Some(1.25));
  }

  #[tokio::test]
  async fn test_get_or_fetch_only_fetches_on_miss() {
    let (cache, _) = cache();
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
      let value: std::result::Result<u32, String> = cache
        .get_or_fetch("answer", Duration::from_secs(60), || async {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(42)
        })
        .await;
      assert_eq!(value, Ok(42));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  /// Backend that fails every call while `down` is set.
  #[derive(Default)]
  struct BrokenStorage {
    inner: MemoryStorage,
    down: AtomicBool,
  }

  impl BrokenStorage {
    fn check(&self) -> std::result::Result<(), StorageError> {
      if self.down.load(Ordering::SeqCst) {
        return Err(StorageError::Unavailable("io".into()));
      }
      Ok(())
    }
  }

  impl KvStorage for BrokenStorage {
    fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, StorageError> {
      self.check()?;
      self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> std::result::Result<(), StorageError> {
      self.check()?;
      self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> std::result::Result<(), StorageError> {
      self.check()?;
      self.inner.remove(key)
    }

    fn list_keys(&self, prefix: &str) -> std::result::Result<Vec<String>, StorageError> {
      self.check()?;
      self.inner.list_keys(prefix)
    }
  }

  #[tokio::test]
  async fn test_persistent_failures_never_fail_reads() {
    let backend = Arc::new(BrokenStorage::default());
    let kv = Kv::from_arc(backend.clone());
    let cache = CacheManager::new(kv.clone());
    cache.set("warm", &1).await.unwrap();

    backend.down.store(true, Ordering::SeqCst);

    // Memory tier still answers.
    assert_eq!(cache.get::<u32>("warm").await, Some(1));
    // Cold key: persistent read fails, reported as a miss.
    assert_eq!(CacheManager::new(kv).get::<u32>("warm").await, None);
    // Writes surface the failure but keep the memory copy.
    assert!(cache.set("new", &2).await.is_err());
    assert_eq!(cache.get::<u32>("new").await, Some(2));
  }
}
