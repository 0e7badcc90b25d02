//! Durable outbox of local mutations.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::change::{next_id, ChangeId, QueuedChange};
use super::device::DeviceId;
use super::remote::RemoteApplier;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Result, StoreError, SyncError};
use crate::kv::{BatchOp, Kv};

/// Key the pending-changes sequence is stored under.
pub const QUEUE_KEY: &str = "@smartcart/sync_queue";

/// Key the highest id ever issued is stored under. Survives an empty queue so
/// ids keep increasing across restarts even if the clock moves backwards.
pub const LAST_ID_KEY: &str = "@smartcart/sync_last_id";

/// Key the time of the last confirmed remote application is stored under.
pub const LAST_SYNC_KEY: &str = "@smartcart/last_sync";

/// Read-only snapshot of the queue for observability.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
  pub online: bool,
  pub syncing: bool,
  pub queue_length: usize,
  pub queue: Vec<QueuedChange>,
  pub last_synced_at: Option<DateTime<Utc>>,
}

/// Why a drain did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  AlreadySyncing,
  Offline,
  Empty,
}

/// Result of one drain pass.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
  /// The pass did not run.
  Skipped(SkipReason),
  /// Every change in the starting snapshot was applied.
  Completed { applied: usize },
  /// A remote call failed; the failed change and everything after it remain.
  Stalled {
    applied: usize,
    failed: ChangeId,
    error: SyncError,
  },
  /// Connectivity dropped mid-pass; remaining changes wait for the next pass.
  Paused { applied: usize },
}

struct Pending {
  changes: Vec<QueuedChange>,
  last_id: ChangeId,
}

struct Shared {
  kv: Kv,
  remote: Arc<dyn RemoteApplier>,
  connectivity: Arc<dyn ConnectivityMonitor>,
  device_id: DeviceId,
  /// Sole writer of the persisted queue; held across the persist call.
  pending: Mutex<Pending>,
  /// Single-flight guard for [`SyncQueue::drain`].
  syncing: AtomicBool,
  status: watch::Sender<SyncStatus>,
  listener: StdMutex<Option<JoinHandle<()>>>,
}

/// Connectivity-aware outbox.
///
/// Cloning is cheap; all clones share one queue.
#[derive(Clone)]
pub struct SyncQueue {
  shared: Arc<Shared>,
}

impl fmt::Debug for SyncQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SyncQueue")
      .field("device_id", &self.shared.device_id)
      .field("status", &*self.shared.status.borrow())
      .finish_non_exhaustive()
  }
}

/// Clears the single-flight flag when a drain ends, however it ends.
struct SyncingGuard<'a> {
  shared: &'a Shared,
}

impl Drop for SyncingGuard<'_> {
  fn drop(&mut self) {
    self.shared.syncing.store(false, Ordering::Release);
    self.shared.status.send_modify(|s| s.syncing = false);
  }
}

impl SyncQueue {
  /// Restore the persisted queue and start listening for connectivity changes.
  ///
  /// Never fails: an unreadable queue record is discarded and the queue starts
  /// empty. Must be called inside a Tokio runtime.
  pub async fn init(
    kv: Kv,
    remote: Arc<dyn RemoteApplier>,
    connectivity: Arc<dyn ConnectivityMonitor>,
  ) -> Self {
    let changes = load_queue(&kv).await;
    let last_synced_at = load_last_sync(&kv).await;
    let device_id = DeviceId::load_or_create(&kv).await;
    let last_id = changes
      .last()
      .map_or(0, |c| c.id)
      .max(load_last_id(&kv).await);

    let (status, _) = watch::channel(SyncStatus {
      online: connectivity.is_online_now(),
      syncing: false,
      queue_length: changes.len(),
      queue: changes.clone(),
      last_synced_at,
    });

    let queue = Self {
      shared: Arc::new(Shared {
        kv,
        remote,
        connectivity,
        device_id,
        pending: Mutex::new(Pending { changes, last_id }),
        syncing: AtomicBool::new(false),
        status,
        listener: StdMutex::new(None),
      }),
    };

    let handle = spawn_listener(Arc::downgrade(&queue.shared), queue.shared.connectivity.subscribe());
    if let Ok(mut listener) = queue.shared.listener.lock() {
      *listener = Some(handle);
    }

    let pending = queue.shared.status.borrow().queue_length;
    info!(pending, device_id = %queue.shared.device_id, "sync queue ready");

    if pending > 0 && queue.is_online() {
      let startup = queue.clone();
      tokio::spawn(async move {
        startup.drain().await;
      });
    }
    queue
  }

  /// Stop reacting to connectivity changes. Queued changes stay persisted.
  pub fn dispose(&self) {
    let handle = match self.shared.listener.lock() {
      Ok(mut listener) => listener.take(),
      Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(handle) = handle {
      handle.abort();
      debug!("sync queue listener stopped");
    }
  }

  pub fn device_id(&self) -> &DeviceId {
    &self.shared.device_id
  }

  pub fn is_online(&self) -> bool {
    self.shared.connectivity.is_online_now()
  }

  /// Current status snapshot.
  pub fn get_status(&self) -> SyncStatus {
    let mut status = self.shared.status.borrow().clone();
    status.online = self.is_online();
    status
  }

  /// Receiver that observes every status change.
  pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
    self.shared.status.subscribe()
  }

  /// Record a mutation for remote application.
  ///
  /// The change is persisted before this returns. If persisting fails the
  /// change is dropped again and the error returned: the enqueue did not
  /// happen. When idle and online a drain is started in the background.
  pub async fn enqueue<T: Serialize>(&self, change_type: &str, payload: &T) -> Result<ChangeId> {
    let payload = serde_json::to_value(payload)
      .map_err(|e| StoreError::serialization(format!("{change_type} payload"), e))?;

    let id = {
      let mut pending = self.shared.pending.lock().await;
      let now = Utc::now();
      let id = next_id(pending.last_id, now);

      pending.changes.push(QueuedChange {
        id,
        change_type: change_type.to_owned(),
        payload,
        created_at: now,
        origin_device_id: self.shared.device_id.as_str().to_owned(),
      });

      if let Err(e) = self.persist_enqueued(&pending.changes, id).await {
        pending.changes.pop();
        warn!(change_type, error = %e, "failed to persist queued change");
        return Err(e);
      }

      pending.last_id = id;
      self.publish_queue(&pending.changes);
      id
    };

    debug!(id, change_type, "change queued");

    if self.is_online() && !self.shared.syncing.load(Ordering::Acquire) {
      let queue = self.clone();
      tokio::spawn(async move {
        queue.drain().await;
      });
    }

    Ok(id)
  }

  /// Deliver queued changes in ascending id order.
  ///
  /// Works on the queue as it was when the pass started; changes enqueued
  /// meanwhile wait for the next pass. Stops at the first failure so ordering
  /// is preserved. Never runs concurrently with itself.
  pub async fn drain(&self) -> DrainOutcome {
    if !self.is_online() {
      return DrainOutcome::Skipped(SkipReason::Offline);
    }

    if self
      .shared
      .syncing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return DrainOutcome::Skipped(SkipReason::AlreadySyncing);
    }
    let _guard = SyncingGuard {
      shared: &self.shared,
    };

    let snapshot = self.shared.pending.lock().await.changes.clone();
    if snapshot.is_empty() {
      return DrainOutcome::Skipped(SkipReason::Empty);
    }

    self.shared.status.send_modify(|s| s.syncing = true);
    debug!(count = snapshot.len(), "sync pass started");

    let mut applied = 0;
    for change in &snapshot {
      if !self.is_online() {
        info!(applied, "went offline, pausing sync");
        return DrainOutcome::Paused { applied };
      }

      match self.shared.remote.apply(change).await {
        Ok(()) => {
          self.acknowledge(change.id).await;
          applied += 1;
        }
        Err(error) => {
          warn!(id = change.id, change_type = %change.change_type, error = %error, "sync failed, change kept in queue");
          return DrainOutcome::Stalled {
            applied,
            failed: change.id,
            error,
          };
        }
      }
    }

    info!(applied, "sync pass complete");
    DrainOutcome::Completed { applied }
  }

  /// Remove a remotely applied change and persist the shorter queue.
  async fn acknowledge(&self, id: ChangeId) {
    let now = Utc::now();
    {
      let mut pending = self.shared.pending.lock().await;
      pending.changes.retain(|c| c.id != id);
      if let Err(e) = self.persist(&pending.changes).await {
        // Applied remotely already; a stale record only causes a redundant delivery.
        warn!(id, error = %e, "failed to persist queue after sync");
      }
      self.publish_queue(&pending.changes);
    }

    if let Err(e) = self
      .shared
      .kv
      .set(LAST_SYNC_KEY, now.to_rfc3339().into_bytes())
      .await
    {
      warn!(error = %e, "failed to record last sync time");
    }
    self
      .shared
      .status
      .send_modify(|s| s.last_synced_at = Some(now));
  }

  /// Drop every pending change.
  pub async fn clear_queue(&self) -> Result<()> {
    let mut pending = self.shared.pending.lock().await;
    self.shared.kv.remove(QUEUE_KEY).await?;
    pending.changes.clear();
    self.publish_queue(&pending.changes);
    info!("sync queue cleared");
    Ok(())
  }

  /// Time of the last confirmed remote application.
  pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
    self.shared.status.borrow().last_synced_at
  }

  /// Store the queue together with the new high-water id in one batch.
  async fn persist_enqueued(&self, changes: &[QueuedChange], last_id: ChangeId) -> Result<()> {
    let bytes = serde_json::to_vec(changes).map_err(|e| StoreError::serialization("sync queue", e))?;
    self
      .shared
      .kv
      .write_batch(vec![
        BatchOp::Set {
          key: QUEUE_KEY.to_owned(),
          value: bytes,
        },
        BatchOp::Set {
          key: LAST_ID_KEY.to_owned(),
          value: last_id.to_string().into_bytes(),
        },
      ])
      .await?;
    Ok(())
  }

  async fn persist(&self, changes: &[QueuedChange]) -> Result<()> {
    let bytes = serde_json::to_vec(changes).map_err(|e| StoreError::serialization("sync queue", e))?;
    self.shared.kv.set(QUEUE_KEY, bytes).await?;
    Ok(())
  }

  fn publish_queue(&self, changes: &[QueuedChange]) {
    self.shared.status.send_modify(|s| {
      s.queue_length = changes.len();
      s.queue = changes.to_vec();
    });
  }
}

fn spawn_listener(weak: Weak<Shared>, mut rx: watch::Receiver<bool>) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut was_online = *rx.borrow_and_update();
    while rx.changed().await.is_ok() {
      let online = *rx.borrow_and_update();
      let Some(shared) = weak.upgrade() else {
        break;
      };
      shared.status.send_modify(|s| s.online = online);

      if online && !was_online {
        info!("connectivity restored, syncing queued changes");
        let queue = SyncQueue { shared };
        tokio::spawn(async move {
          queue.drain().await;
        });
      } else if !online && was_online {
        info!("connectivity lost, sync paused");
      }
      was_online = online;
    }
  })
}

async fn load_queue(kv: &Kv) -> Vec<QueuedChange> {
  let bytes = match kv.get(QUEUE_KEY).await {
    Ok(Some(bytes)) => bytes,
    Ok(None) => return Vec::new(),
    Err(e) => {
      warn!(error = %e, "failed to read sync queue, starting empty");
      return Vec::new();
    }
  };

  match serde_json::from_slice::<Vec<QueuedChange>>(&bytes) {
    Ok(mut changes) => {
      changes.sort_by_key(|c| c.id);
      changes
    }
    Err(e) => {
      warn!(error = %e, "sync queue record is corrupted, discarding it");
      if let Err(e) = kv.remove(QUEUE_KEY).await {
        warn!(error = %e, "failed to remove corrupted sync queue");
      }
      Vec::new()
    }
  }
}

async fn load_last_id(kv: &Kv) -> ChangeId {
  match kv.get(LAST_ID_KEY).await {
    Ok(Some(bytes)) => std::str::from_utf8(&bytes)
      .ok()
      .and_then(|s| s.trim().parse().ok())
      .unwrap_or_else(|| {
        warn!("stored change id high-water mark is unreadable, ignoring it");
        0
      }),
    Ok(None) => 0,
    Err(e) => {
      warn!(error = %e, "failed to read change id high-water mark");
      0
    }
  }
}

async fn load_last_sync(kv: &Kv) -> Option<DateTime<Utc>> {
  let bytes = kv.get(LAST_SYNC_KEY).await.ok()??;
  let text = String::from_utf8(bytes).ok()?;
  DateTime::parse_from_rfc3339(&text)
    .ok()
    .map(|t| t.with_timezone(&Utc))
}
