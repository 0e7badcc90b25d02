//! Typed slice documents and their hydration defaults.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::slice::{SliceKey, SliceSchema};

/// A shopping list. Fields other than `id` and `items` are owned by the view
/// layer and preserved untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRecord {
  pub id: String,
  #[serde(default)]
  pub items: Vec<Value>,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

/// The `lists` slice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListsState {
  pub lists: Vec<ListRecord>,
  #[serde(default)]
  pub history: Vec<Value>,
}

impl SliceSchema for ListsState {
  const KEY: SliceKey = SliceKey::Lists;
}

/// A mall the user shops at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MallRecord {
  pub id: String,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

/// The `malls` slice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MallsState {
  pub malls: Vec<MallRecord>,
  #[serde(default)]
  pub favorites: Vec<String>,
}

impl SliceSchema for MallsState {
  const KEY: SliceKey = SliceKey::Malls;
}

/// The `settings` slice: a free-form mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettingsState(pub Map<String, Value>);

impl Default for SettingsState {
  fn default() -> Self {
    let mut map = Map::new();
    map.insert("theme".into(), Value::from("system"));
    map.insert("notifications".into(), Value::from(true));
    map.insert("autoBackup".into(), Value::from(true));
    Self(map)
  }
}

impl SettingsState {
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.0.get(key)
  }

  pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
    self.0.insert(key.into(), value.into());
  }
}

impl SliceSchema for SettingsState {
  const KEY: SliceKey = SliceKey::Settings;
}

/// One observed price of an item at a mall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceRecord {
  pub id: String,
  pub mall_id: String,
  pub item_id: String,
  pub price: f64,
  pub date: String,
}

/// The `prices` slice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricesState {
  pub price_history: Vec<PriceRecord>,
  #[serde(default)]
  pub last_update: Option<String>,
}

impl SliceSchema for PricesState {
  const KEY: SliceKey = SliceKey::Prices;
}

/// Everything the client needs at startup. Absent or discarded slices are
/// replaced by their defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppState {
  pub lists: ListsState,
  pub malls: MallsState,
  pub settings: SettingsState,
  pub prices: PricesState,
}
