//! Connectivity signal consumed by the sync queue.
//!
//! The platform's network monitor is an external collaborator; it is adapted to
//! [`ConnectivityMonitor`]. [`ManualConnectivity`] is a settable implementation
//! for tests, the CLI, and hosts that push connectivity changes themselves.

use tokio::sync::watch;

/// Source of online/offline transitions.
pub trait ConnectivityMonitor: Send + Sync {
  /// Whether the device is online right now.
  fn is_online_now(&self) -> bool;

  /// Receiver that observes every change of the online flag.
  fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity flag driven by explicit [`set_online`](Self::set_online) calls.
#[derive(Debug)]
pub struct ManualConnectivity {
  tx: watch::Sender<bool>,
}

impl ManualConnectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx }
  }

  /// Update the flag. Subscribers are only notified when the value changes.
  pub fn set_online(&self, online: bool) {
    self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });
  }
}

impl ConnectivityMonitor for ManualConnectivity {
  fn is_online_now(&self) -> bool {
    *self.tx.borrow()
  }

  fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_subscribers_see_changes() {
    let monitor = ManualConnectivity::new(false);
    let mut rx = monitor.subscribe();
    assert!(!monitor.is_online_now());

    monitor.set_online(true);
    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());
    assert!(monitor.is_online_now());
  }

  #[test]
  fn test_repeated_value_does_not_notify() {
    let monitor = ManualConnectivity::new(true);
    let rx = monitor.subscribe();
    monitor.set_online(true);
    assert!(!rx.has_changed().unwrap());
  }
}
