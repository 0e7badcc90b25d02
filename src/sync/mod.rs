//! Offline-first outbox.
//!
//! Local mutations are recorded as [`QueuedChange`]s and persisted before
//! [`SyncQueue::enqueue`] returns. While the device is online the queue is
//! drained in id order through a [`RemoteApplier`]; a failure stops the pass and
//! the remaining changes wait for the next trigger (reconnect or enqueue).
//! Delivery is at-least-once.

mod change;
mod device;
mod queue;
mod remote;

pub use change::{ChangeId, QueuedChange};
pub use device::{DeviceId, DEVICE_ID_KEY};
pub use queue::{
  DrainOutcome, SkipReason, SyncQueue, SyncStatus, LAST_ID_KEY, LAST_SYNC_KEY, QUEUE_KEY,
};
pub use remote::{RemoteApplier, UnavailableRemote};
