//! Slice keys and per-slice shape definitions.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use crate::error::ShapeError;

/// Named partition of persisted application state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SliceKey {
  Lists,
  Malls,
  Settings,
  Prices,
}

impl SliceKey {
  pub const ALL: [SliceKey; 4] = [
    SliceKey::Lists,
    SliceKey::Malls,
    SliceKey::Settings,
    SliceKey::Prices,
  ];

  /// Short name used in logs, backups and the CLI.
  pub fn name(self) -> &'static str {
    match self {
      Self::Lists => "lists",
      Self::Malls => "malls",
      Self::Settings => "settings",
      Self::Prices => "prices",
    }
  }

  /// Key the slice is stored under.
  pub fn storage_key(self) -> &'static str {
    match self {
      Self::Lists => "@smartcart/lists",
      Self::Malls => "@smartcart/malls",
      Self::Settings => "@smartcart/settings",
      Self::Prices => "@smartcart/prices",
    }
  }

  pub fn from_name(name: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|k| k.name() == name)
  }

  pub(crate) fn index(self) -> usize {
    match self {
      Self::Lists => 0,
      Self::Malls => 1,
      Self::Settings => 2,
      Self::Prices => 3,
    }
  }

  /// Structural check of a decoded document.
  ///
  /// Only the containers are checked here; record-level typing happens when
  /// the document is decoded into its [`SliceSchema`] type.
  pub fn check_shape(self, value: &Value) -> Result<(), ShapeError> {
    let object = value.as_object().ok_or(ShapeError::NotAnObject)?;
    let require_array = |member: &'static str| match object.get(member) {
      Some(Value::Array(_)) => Ok(()),
      _ => Err(ShapeError::Member {
        member,
        expected: "an array",
      }),
    };

    match self {
      Self::Lists => require_array("lists"),
      Self::Malls => require_array("malls"),
      Self::Settings => Ok(()),
      Self::Prices => require_array("priceHistory"),
    }
  }
}

impl fmt::Display for SliceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// A typed slice document.
///
/// Implementors bind a Rust type to its [`SliceKey`]; [`SliceSchema::validate`]
/// is the single decode path used at the store boundary.
pub trait SliceSchema: Serialize + DeserializeOwned + Send + Sync + 'static {
  const KEY: SliceKey;

  /// Decode stored bytes, rejecting anything that does not match the slice shape.
  fn validate(bytes: &[u8]) -> Result<Self, ShapeError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| ShapeError::Decode(e.to_string()))?;
    Self::from_value(value)
  }

  /// Decode an already-parsed document.
  fn from_value(value: Value) -> Result<Self, ShapeError> {
    Self::KEY.check_shape(&value)?;
    serde_json::from_value(value).map_err(|e| ShapeError::Decode(e.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_lists_requires_lists_array() {
    assert!(SliceKey::Lists.check_shape(&json!({ "lists": [] })).is_ok());
    assert_eq!(
      SliceKey::Lists.check_shape(&json!({ "lists": {} })),
      Err(ShapeError::Member {
        member: "lists",
        expected: "an array"
      })
    );
    assert_eq!(
      SliceKey::Lists.check_shape(&json!([])),
      Err(ShapeError::NotAnObject)
    );
  }

  #[test]
  fn test_settings_accepts_any_mapping() {
    assert!(SliceKey::Settings.check_shape(&json!({})).is_ok());
    assert!(SliceKey::Settings.check_shape(&json!("dark")).is_err());
  }

  #[test]
  fn test_prices_requires_price_history() {
    assert!(SliceKey::Prices
      .check_shape(&json!({ "priceHistory": [], "lastUpdate": null }))
      .is_ok());
    assert!(SliceKey::Prices.check_shape(&json!({ "prices": [] })).is_err());
  }

  #[test]
  fn test_names_round_trip() {
    for key in SliceKey::ALL {
      assert_eq!(SliceKey::from_name(key.name()), Some(key));
    }
    assert_eq!(SliceKey::from_name("profile"), None);
  }
}
