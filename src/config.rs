use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::ReadOptions;
use crate::engine::EngineSettings;
use crate::persist::{PersistSettings, SqliteKeyStore};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
  pub server: ServerConfig,
  pub cache: CacheConfig,
  pub persistence: PersistenceConfig,
  pub retry: RetryConfig,
  pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
  /// Base URL of the notes server
  pub url: String,
  pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:3000".to_string(),
      request_timeout_secs: 10,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
  pub stale_time_secs: u64,
  pub gc_time_secs: u64,
  pub gc_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 300,
      gc_time_secs: 86_400,
      gc_interval_secs: 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PersistenceConfig {
  pub enabled: bool,
  /// SQLite file (default: $XDG_DATA_HOME/notesync/store.db)
  pub path: Option<PathBuf>,
  pub throttle_ms: u64,
  pub max_age_hours: u64,
}

impl Default for PersistenceConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      throttle_ms: 1000,
      max_age_hours: 24,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 500,
      max_delay_ms: 8000,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 5,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./notesync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/notesync/config.yaml
  ///
  /// Without a file the defaults apply. `NOTESYNC_URL` overrides the
  /// server url either way.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.apply_overrides(std::env::var("NOTESYNC_URL").ok());
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("notesync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("notesync").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    // An empty file is a valid, all-defaults config.
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  fn apply_overrides(&mut self, url: Option<String>) {
    if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
      self.server.url = url;
    }
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.server.url)
      .map_err(|e| eyre!("Invalid server url '{}': {}", self.server.url, e))?;
    if self.retry.max_attempts == 0 {
      return Err(eyre!("retry.max_attempts must be at least 1"));
    }
    Ok(())
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.server.request_timeout_secs)
  }

  /// Location of the local store.
  pub fn store_path(&self) -> Result<PathBuf> {
    match &self.persistence.path {
      Some(path) => Ok(path.clone()),
      None => SqliteKeyStore::default_path(),
    }
  }

  /// Engine tunables derived from this config.
  pub fn engine_settings(&self, offline: bool) -> EngineSettings {
    EngineSettings {
      read: ReadOptions::default()
        .with_stale_time(Duration::from_secs(self.cache.stale_time_secs))
        .with_gc_time(Duration::from_secs(self.cache.gc_time_secs)),
      gc_interval: Duration::from_secs(self.cache.gc_interval_secs.max(1)),
      retry: RetryPolicy {
        max_attempts: self.retry.max_attempts,
        base_delay: Duration::from_millis(self.retry.base_delay_ms),
        max_delay: Duration::from_millis(self.retry.max_delay_ms),
      },
      persist: PersistSettings {
        throttle: Duration::from_millis(self.persistence.throttle_ms),
        max_age: Duration::from_secs(self.persistence.max_age_hours * 60 * 60),
      },
      probe_interval: match self.connectivity.probe_interval_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
      },
      offline,
    }
  }

  /// Get a bearer token from the environment.
  ///
  /// Checks NOTESYNC_TOKEN; when set it takes precedence over the stored
  /// session for this process.
  pub fn get_token() -> Option<String> {
    std::env::var("NOTESYNC_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }

  /// Get the account password from environment variables.
  ///
  /// Checks NOTESYNC_PASSWORD.
  pub fn get_password() -> Result<String> {
    std::env::var("NOTESYNC_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set NOTESYNC_PASSWORD or pass --password-stdin."))
  }
}
