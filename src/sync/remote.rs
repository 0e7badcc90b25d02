//! Remote application of queued changes.

use futures::future::BoxFuture;

use super::change::QueuedChange;
use crate::error::SyncError;

/// Applies one change on the remote system.
///
/// Implementations own transport concerns such as timeouts and authentication.
/// Application must be idempotent per `(origin_device_id, id)`: after a crash
/// the same change may be delivered again.
pub trait RemoteApplier: Send + Sync {
  fn apply<'a>(&'a self, change: &'a QueuedChange) -> BoxFuture<'a, Result<(), SyncError>>;
}

/// Remote that is never reachable. Changes stay queued.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableRemote;

impl RemoteApplier for UnavailableRemote {
  fn apply<'a>(&'a self, _change: &'a QueuedChange) -> BoxFuture<'a, Result<(), SyncError>> {
    Box::pin(async { Err(SyncError::Unavailable("no remote endpoint configured".into())) })
  }
}
