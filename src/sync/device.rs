//! Per-install device identifier.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hasher};
use tracing::{info, warn};

use crate::kv::Kv;

/// Key the device id is stored under.
pub const DEVICE_ID_KEY: &str = "@smartcart/device_id";

/// Opaque identifier generated once per install.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Load the persisted id, generating and storing a new one on first use.
  ///
  /// If storage is unavailable the generated id is still returned so the
  /// caller can proceed; it will be replaced on a later launch.
  pub async fn load_or_create(kv: &Kv) -> Self {
    match kv.get(DEVICE_ID_KEY).await {
      Ok(Some(bytes)) => match String::from_utf8(bytes) {
        Ok(id) if !id.trim().is_empty() => return Self(id),
        _ => warn!("stored device id is unreadable, generating a new one"),
      },
      Ok(None) => {}
      Err(e) => {
        warn!(error = %e, "failed to read device id, using a temporary one");
        return Self::generate();
      }
    }

    let id = Self::generate();
    match kv.set(DEVICE_ID_KEY, id.0.clone().into_bytes()).await {
      Ok(()) => info!(device_id = %id, "generated device id"),
      Err(e) => warn!(error = %e, "failed to persist device id"),
    }
    id
  }

  /// `<os>-<epoch ms>-<12 hex chars>`.
  fn generate() -> Self {
    let now = Utc::now();
    let mut hasher = Sha256::new();
    hasher.update(now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    // RandomState is seeded from the OS per process.
    let mut seed = RandomState::new().build_hasher();
    seed.write_u64(now.timestamp_subsec_nanos().into());
    hasher.update(seed.finish().to_le_bytes());
    let digest = hex::encode(hasher.finalize());

    Self(format!(
      "{}-{}-{}",
      std::env::consts::OS,
      now.timestamp_millis(),
      &digest[..12]
    ))
  }
}

impl fmt::Display for DeviceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}
