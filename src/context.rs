//! Startup and shutdown of the whole data layer.
//!
//! [`DataLayer`] owns one instance of each component and is handed to
//! consumers explicitly. [`DataLayer::init`] runs the schema migration before
//! anything reads a slice, then hydrates the initial state.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::backup::{self, BackupSummary};
use crate::cache::{CacheManager, DEFAULT_TTL};
use crate::connectivity::ConnectivityMonitor;
use crate::error::BackupError;
use crate::kv::Kv;
use crate::migration::{MigrationEngine, MigrationOutcome};
use crate::store::{AppState, PersistentStore, SettingsState};
use crate::sync::{RemoteApplier, SyncQueue};

/// Key the time of the last automatic backup is stored under.
pub const LAST_AUTO_BACKUP_KEY: &str = "@smartcart/last_auto_backup";

#[derive(Debug, Clone)]
pub struct DataLayerOptions {
  pub default_ttl: Duration,
}

impl Default for DataLayerOptions {
  fn default() -> Self {
    Self {
      default_ttl: DEFAULT_TTL,
    }
  }
}

/// The initialized data layer.
#[derive(Debug)]
pub struct DataLayer {
  kv: Kv,
  store: PersistentStore,
  cache: CacheManager,
  sync: SyncQueue,
  migration: MigrationOutcome,
  initial_state: AppState,
}

impl DataLayer {
  /// Migrate, hydrate and start the sync queue.
  ///
  /// Never fails: every component contains its own failures and falls back to
  /// empty state.
  pub async fn init(
    kv: Kv,
    remote: Arc<dyn RemoteApplier>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    options: DataLayerOptions,
  ) -> Self {
    Self::init_with_migrations(kv, MigrationEngine::new, remote, connectivity, options).await
  }

  /// Like [`init`](Self::init) with a caller-built migration engine.
  pub async fn init_with_migrations<F>(
    kv: Kv,
    build_engine: F,
    remote: Arc<dyn RemoteApplier>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    options: DataLayerOptions,
  ) -> Self
  where
    F: FnOnce(PersistentStore) -> MigrationEngine,
  {
    let store = PersistentStore::new(kv.clone());
    let migration = build_engine(store.clone()).run().await;

    let initial_state = store.hydrate().await;
    let cache = CacheManager::new(kv.clone()).with_default_ttl(options.default_ttl);
    let sync = SyncQueue::init(kv.clone(), remote, connectivity).await;

    info!(migration = ?migration, "data layer ready");
    Self {
      kv,
      store,
      cache,
      sync,
      migration,
      initial_state,
    }
  }

  pub fn store(&self) -> &PersistentStore {
    &self.store
  }

  pub fn cache(&self) -> &CacheManager {
    &self.cache
  }

  pub fn sync(&self) -> &SyncQueue {
    &self.sync
  }

  /// What the startup migration did.
  pub fn migration(&self) -> &MigrationOutcome {
    &self.migration
  }

  /// State hydrated right after migration.
  pub fn initial_state(&self) -> &AppState {
    &self.initial_state
  }

  /// Time of the last automatic backup, if one was recorded.
  pub async fn last_auto_backup(&self) -> Option<DateTime<Utc>> {
    let bytes = match self.kv.get(LAST_AUTO_BACKUP_KEY).await {
      Ok(bytes) => bytes?,
      Err(e) => {
        warn!(error = %e, "failed to read last backup time");
        return None;
      }
    };
    let text = String::from_utf8(bytes).ok()?;
    DateTime::parse_from_rfc3339(text.trim())
      .ok()
      .map(|t| t.with_timezone(&Utc))
  }

  /// Write a backup into `dir` if the weekly one is due.
  ///
  /// Skipped when the `autoBackup` setting is `false`. Returns the backup
  /// written, or `None` when nothing was due.
  pub async fn run_scheduled_backup(&self, dir: &Path) -> Result<Option<BackupSummary>, BackupError> {
    let settings = self.store.load::<SettingsState>().await.unwrap_or_default();
    if settings.get("autoBackup") == Some(&Value::Bool(false)) {
      return Ok(None);
    }

    let now = Utc::now();
    if !backup::backup_due(self.last_auto_backup().await, now) {
      return Ok(None);
    }

    let summary = backup::create_backup(&self.store, &dir.join(backup::backup_file_name(now))).await?;
    if let Err(e) = self
      .kv
      .set(LAST_AUTO_BACKUP_KEY, now.to_rfc3339().into_bytes())
      .await
    {
      warn!(error = %e, "failed to record backup time");
    }
    Ok(Some(summary))
  }

  /// Stop background work. Persisted data is untouched.
  pub fn dispose(&self) {
    self.sync.dispose();
    info!("data layer disposed");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::ManualConnectivity;
  use crate::kv::{MemoryStorage, SqliteStorage};
  use crate::migration::{CURRENT_VERSION, VERSION_KEY};
  use crate::store::{ListsState, SliceKey};
  use crate::sync::UnavailableRemote;
  use serde_json::json;
  use tempfile::tempdir;

  async fn layer(kv: Kv) -> DataLayer {
    DataLayer::init(
      kv,
      Arc::new(UnavailableRemote),
      Arc::new(ManualConnectivity::new(false)),
      DataLayerOptions::default(),
    )
    .await
  }

  #[tokio::test]
  async fn test_fresh_install() {
    let kv = Kv::new(MemoryStorage::new());
    let data = layer(kv.clone()).await;

    assert_eq!(
      data.migration(),
      &MigrationOutcome::Migrated {
        from: 0,
        to: CURRENT_VERSION
      }
    );
    assert_eq!(data.initial_state(), &AppState::default());
    assert_eq!(
      kv.get(VERSION_KEY).await.unwrap(),
      Some(CURRENT_VERSION.to_string().into_bytes())
    );
    data.dispose();
  }

  #[tokio::test]
  async fn test_newer_version_resets_before_hydration() {
    let kv = Kv::new(MemoryStorage::new());
    kv.set(VERSION_KEY, b"99".to_vec()).await.unwrap();
    kv.set(
      SliceKey::Lists.storage_key(),
      br#"{"lists":[{"id":"old"}]}"#.to_vec(),
    )
    .await
    .unwrap();

    let data = layer(kv).await;
    assert!(matches!(data.migration(), MigrationOutcome::Reset { from: 99, .. }));
    assert!(data.initial_state().lists.lists.is_empty());
  }

  #[tokio::test]
  async fn test_state_survives_restart_on_disk() {
    let dir = tempdir().unwrap();

    {
      let kv = Kv::new(SqliteStorage::open_in(dir.path()).unwrap());
      let data = layer(kv).await;
      data
        .store()
        .save_raw(SliceKey::Lists, &json!({ "lists": [{ "id": "l1", "name": "Weekly" }] }))
        .await
        .unwrap();
      data.sync().enqueue("list.create", &json!({ "id": "l1" })).await.unwrap();
      data.cache().set("list_l1", &json!({ "n": 1 })).await.unwrap();
      data.dispose();
    }

    let kv = Kv::new(SqliteStorage::open_in(dir.path()).unwrap());
    let data = layer(kv).await;
    assert_eq!(
      data.migration(),
      &MigrationOutcome::UpToDate {
        version: CURRENT_VERSION
      }
    );
    let lists: &ListsState = &data.initial_state().lists;
    assert_eq!(lists.lists[0].fields["name"], json!("Weekly"));
    assert_eq!(data.sync().get_status().queue_length, 1);
    assert_eq!(data.cache().get::<Value>("list_l1").await, Some(json!({ "n": 1 })));
  }

  #[tokio::test]
  async fn test_scheduled_backup_runs_weekly() {
    let dir = tempdir().unwrap();
    let data = layer(Kv::new(MemoryStorage::new())).await;
    data
      .store()
      .save_raw(SliceKey::Malls, &json!({ "malls": [] }))
      .await
      .unwrap();

    let first = data.run_scheduled_backup(dir.path()).await.unwrap();
    assert!(first.is_some_and(|s| s.path.exists()));
    assert!(data.last_auto_backup().await.is_some());

    assert_eq!(data.run_scheduled_backup(dir.path()).await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_scheduled_backup_respects_setting() {
    let dir = tempdir().unwrap();
    let data = layer(Kv::new(MemoryStorage::new())).await;
    let mut settings = SettingsState::default();
    settings.set("autoBackup", false);
    data.store().save(&settings).await.unwrap();

    assert_eq!(data.run_scheduled_backup(dir.path()).await.unwrap(), None);
    assert_eq!(data.last_auto_backup().await, None);
  }
}
