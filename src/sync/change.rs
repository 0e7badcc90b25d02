//! Queued change records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a queued change. Strictly increasing in enqueue order.
pub type ChangeId = u64;

/// A local mutation waiting to be applied remotely.
///
/// `(origin_device_id, id)` identifies a change globally, so the remote side
/// can discard redundant deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedChange {
  pub id: ChangeId,
  #[serde(rename = "type")]
  pub change_type: String,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  pub origin_device_id: String,
}

/// Next id after `last`: the current time in milliseconds, or `last + 1` if
/// the clock has not moved past it.
pub(crate) fn next_id(last: ChangeId, now: DateTime<Utc>) -> ChangeId {
  let millis = u64::try_from(now.timestamp_millis()).unwrap_or(0);
  millis.max(last.saturating_add(1))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;
  use serde_json::json;

  #[test]
  fn test_next_id_is_strictly_increasing() {
    let now = Utc.timestamp_millis_opt(1_000).unwrap();
    assert_eq!(next_id(0, now), 1_000);
    assert_eq!(next_id(1_000, now), 1_001);
    assert_eq!(next_id(5_000, now), 5_001);
  }

  #[test]
  fn test_wire_format() {
    let change = QueuedChange {
      id: 7,
      change_type: "list.create".into(),
      payload: json!({ "id": "1" }),
      created_at: Utc.timestamp_millis_opt(0).unwrap(),
      origin_device_id: "linux-1-abc".into(),
    };
    let value = serde_json::to_value(&change).unwrap();
    assert_eq!(value["type"], json!("list.create"));
    assert_eq!(value["originDeviceId"], json!("linux-1-abc"));
    assert_eq!(value["createdAt"], json!("1970-01-01T00:00:00Z"));
  }
}
