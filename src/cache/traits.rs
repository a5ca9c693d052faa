//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::key::QueryKey;

/// Trait for domain records that live in cached collections.
///
/// The cache itself only stores JSON; optimistic list splicing matches on
/// the record's `"id"` field.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Collection name used as the first query key segment (e.g. "entries")
  fn collection() -> &'static str;
}

/// Fetch status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
  /// Never fetched
  Idle,
  /// First fetch in progress, no data yet
  Loading,
  /// Last fetch succeeded (or restored from a successful snapshot)
  Success,
  /// Last fetch failed; `data` still holds the last good value
  Error,
}

/// Per-read policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
  /// Whether a read may hit the network at all
  pub enabled: bool,
  /// How long a successful fetch stays fresh
  pub stale_time: Duration,
  /// How long an unobserved entry is retained
  pub gc_time: Duration,
}

impl Default for ReadOptions {
  fn default() -> Self {
    Self {
      enabled: true,
      stale_time: Duration::from_secs(5 * 60),
      gc_time: Duration::from_secs(24 * 60 * 60),
    }
  }
}

impl ReadOptions {
  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = gc_time;
    self
  }
}

/// Point-in-time view of one cached collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: QueryKey,
  /// Last known value
  pub data: Option<Value>,
  pub status: CacheStatus,
  /// When `data` last came from the server
  pub last_updated_at: Option<DateTime<Utc>>,
  /// A fetch for this key is outstanding
  pub is_fetching: bool,
  /// Message of the last failed fetch
  pub error: Option<String>,
  /// Explicitly invalidated since the last successful fetch
  pub invalidated: bool,
  /// Freshness window taken from the most recent read
  pub stale_time: Duration,
}

impl CacheEntry {
  pub(crate) fn empty(key: QueryKey, stale_time: Duration) -> Self {
    Self {
      key,
      data: None,
      status: CacheStatus::Idle,
      last_updated_at: None,
      is_fetching: false,
      error: None,
      invalidated: false,
      stale_time,
    }
  }

  /// Check if data is stale: never fetched, invalidated, or older than
  /// `stale_time`.
  pub fn is_stale(&self) -> bool {
    if self.invalidated {
      return true;
    }
    match self.last_updated_at {
      Some(at) => (Utc::now() - at).to_std().unwrap_or_default() > self.stale_time,
      None => true,
    }
  }

  /// Decode the data into a typed value.
  pub fn decode<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
    self
      .data
      .as_ref()
      .map(|data| serde_json::from_value(data.clone()))
  }
}

/// Change notification emitted by the entity cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  /// Data or status of the key changed
  Updated(QueryKey),
  /// The key was marked stale
  Invalidated(QueryKey),
  /// The key was garbage collected
  Removed(QueryKey),
  /// Every entry was dropped (logout)
  Cleared,
}

impl CacheEvent {
  /// Whether this event concerns `key`.
  pub fn affects(&self, key: &QueryKey) -> bool {
    match self {
      CacheEvent::Updated(k) | CacheEvent::Invalidated(k) | CacheEvent::Removed(k) => k == key,
      CacheEvent::Cleared => true,
    }
  }
}
