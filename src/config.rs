use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use smartcart_store::kv::SqliteStorage;

/// Overrides `data_dir` when set.
pub const DATA_DIR_ENV: &str = "SMARTCART_DATA_DIR";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Directory holding the database and log files
  pub data_dir: Option<PathBuf>,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_secs: 60 * 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Initial connectivity assumption
  pub start_online: bool,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self { start_online: true }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter directive when SMARTCART_LOG is unset
  pub level: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./smartcart.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/smartcart/config.yaml
  ///
  /// Without a config file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    Ok(config.with_env_overrides(std::env::var_os(DATA_DIR_ENV).map(PathBuf::from)))
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("smartcart.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("smartcart").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty file deserializes to null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  fn with_env_overrides(mut self, data_dir: Option<PathBuf>) -> Self {
    if let Some(dir) = data_dir.filter(|d| !d.as_os_str().is_empty()) {
      self.data_dir = Some(dir);
    }
    self
  }

  /// Resolved data directory.
  pub fn data_dir(&self) -> Result<PathBuf> {
    match &self.data_dir {
      Some(dir) => Ok(dir.clone()),
      None => SqliteStorage::default_dir()
        .ok_or_else(|| eyre!("Could not determine a data directory. Set data_dir or {DATA_DIR_ENV}.")),
    }
  }

  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.cache.default_ttl_secs)
  }
}
