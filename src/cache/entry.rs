//! Cache entry format and lookup results.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cached value as stored in both tiers.
///
/// Persisted as `{ "value": ..., "storedAt": <epoch ms>, "ttl": <ms> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
  pub value: Value,
  /// Milliseconds since the Unix epoch.
  pub stored_at: i64,
  /// Time to live in milliseconds.
  pub ttl: u64,
}

impl CacheEntry {
  pub fn new(value: Value, stored_at: i64, ttl: u64) -> Self {
    Self {
      value,
      stored_at,
      ttl,
    }
  }

  /// An entry is valid while `now - stored_at < ttl`.
  pub fn is_expired(&self, now: i64) -> bool {
    let age = now.saturating_sub(self.stored_at);
    // A clock that went backwards yields a negative age; treat it as fresh.
    age >= 0 && age as u64 >= self.ttl
  }

  pub fn stored_at_utc(&self) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(self.stored_at).single()
  }
}

/// A successful cache lookup, including where the value came from.
#[derive(Debug, Clone)]
pub struct CacheHit<T> {
  /// The cached value
  pub data: T,
  /// Which tier answered
  pub source: CacheSource,
  /// When the value was stored
  pub cached_at: Option<DateTime<Utc>>,
}

/// Indicates which tier served a cache hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// In-process memory tier
  Memory,
  /// Persistent tier; the entry has now been promoted into memory
  Persistent,
}

/// Counts and keys held by each tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
  pub memory_item_count: usize,
  pub persistent_item_count: usize,
  pub memory_keys: Vec<String>,
  pub persistent_keys: Vec<String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_expiry_boundary() {
    let entry = CacheEntry::new(json!(1), 1_000, 100);
    assert!(!entry.is_expired(1_000));
    assert!(!entry.is_expired(1_099));
    assert!(entry.is_expired(1_100));
  }

  #[test]
  fn test_zero_ttl_is_never_valid() {
    let entry = CacheEntry::new(json!(1), 1_000, 0);
    assert!(entry.is_expired(1_000));
  }

  #[test]
  fn test_persisted_field_names() {
    let entry = CacheEntry::new(json!({ "a": 1 }), 5, 10);
    assert_eq!(
      serde_json::to_value(&entry).unwrap(),
      json!({ "value": { "a": 1 }, "storedAt": 5, "ttl": 10 })
    );
  }
}
