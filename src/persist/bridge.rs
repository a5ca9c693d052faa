//! Cache persistence bridge.
//!
//! Mirrors the entity cache and the paused mutation queue into a
//! [`KeyValueStore`] as a single JSON snapshot. Flushes are throttled;
//! pausing a mutation flushes right away so a queued write survives a crash.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::storage::KeyValueStore;
use crate::cache::{EntityCache, PersistedEntry};
use crate::mutation::{Mutation, MutationCoordinator, MutationState};

/// Key the snapshot is stored under.
pub const SNAPSHOT_STORAGE_KEY: &str = "notesync.cache.v1";

const SNAPSHOT_VERSION: u32 = 1;

/// Stored form: the serialized body plus its SHA-256.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
  checksum: String,
  body: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
  version: u32,
  saved_at: DateTime<Utc>,
  entries: Vec<PersistedEntry>,
  mutations: Vec<Mutation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistSettings {
  /// Minimum spacing between two flushes
  pub throttle: Duration,
  /// Snapshots older than this are discarded on load
  pub max_age: Duration,
}

impl Default for PersistSettings {
  fn default() -> Self {
    Self {
      throttle: Duration::from_secs(1),
      max_age: Duration::from_secs(24 * 60 * 60),
    }
  }
}

/// What [`PersistenceBridge::restore`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
  /// Nothing stored
  Empty,
  Restored { entries: usize, mutations: usize },
  /// Older than the max age; dropped
  Expired,
  /// Unreadable; ignored
  Corrupt,
}

#[derive(Clone)]
pub struct PersistenceBridge {
  cache: EntityCache,
  coordinator: MutationCoordinator,
  store: Arc<dyn KeyValueStore>,
  settings: PersistSettings,
}

impl PersistenceBridge {
  pub fn new(
    cache: EntityCache,
    coordinator: MutationCoordinator,
    store: Arc<dyn KeyValueStore>,
    settings: PersistSettings,
  ) -> Self {
    Self {
      cache,
      coordinator,
      store,
      settings,
    }
  }

  /// Serialize and store the current state.
  pub fn persist_now(&self) -> Result<()> {
    let snapshot = Snapshot {
      version: SNAPSHOT_VERSION,
      saved_at: Utc::now(),
      entries: self.cache.persistable(),
      mutations: self.coordinator.paused(),
    };
    let raw = encode(&snapshot)?;
    self.store.set_item(SNAPSHOT_STORAGE_KEY, &raw)?;
    debug!(
      entries = snapshot.entries.len(),
      mutations = snapshot.mutations.len(),
      "cache snapshot flushed"
    );
    Ok(())
  }

  fn flush(&self) {
    if let Err(e) = self.persist_now() {
      warn!(error = %e, "failed to flush cache snapshot");
    }
  }

  /// Load the stored snapshot into the cache and the mutation queue.
  ///
  /// Never fails: unreadable or expired snapshots leave an empty cache.
  pub fn restore(&self) -> RestoreOutcome {
    let snapshot = match self.load() {
      Ok(Some(snapshot)) => snapshot,
      Ok(None) => return RestoreOutcome::Empty,
      Err(e) => {
        warn!(error = %e, "ignoring unreadable cache snapshot");
        return RestoreOutcome::Corrupt;
      }
    };

    let age = Utc::now()
      .signed_duration_since(snapshot.saved_at)
      .to_std()
      .unwrap_or(Duration::ZERO);
    if age > self.settings.max_age {
      info!(saved_at = %snapshot.saved_at, "cache snapshot expired, discarding");
      self.clear();
      return RestoreOutcome::Expired;
    }

    let entries = self.cache.restore(snapshot.entries);
    let mutations = self.coordinator.restore(snapshot.mutations);
    info!(entries, mutations, "cache snapshot restored");
    RestoreOutcome::Restored { entries, mutations }
  }

  fn load(&self) -> Result<Option<Snapshot>> {
    let Some(raw) = self.store.get_item(SNAPSHOT_STORAGE_KEY)? else {
      return Ok(None);
    };
    decode(&raw).map(Some)
  }

  /// Remove the stored snapshot.
  pub fn clear(&self) {
    if let Err(e) = self.store.remove_item(SNAPSHOT_STORAGE_KEY) {
      warn!(error = %e, "failed to remove cache snapshot");
    }
  }

  /// Flush on cache and mutation changes, at most once per throttle
  /// interval.
  pub fn spawn(&self) -> JoinHandle<()> {
    let bridge = self.clone();
    let mut cache_events = self.cache.subscribe();
    let mut mutation_events = self.coordinator.subscribe();
    let throttle = self.settings.throttle;

    tokio::spawn(async move {
      let mut deadline: Option<Instant> = None;
      loop {
        tokio::select! {
          event = cache_events.recv() => match event {
            Ok(_) | Err(RecvError::Lagged(_)) => {
              deadline.get_or_insert_with(|| Instant::now() + throttle);
            }
            Err(RecvError::Closed) => break,
          },
          event = mutation_events.recv() => match event {
            Ok(event) if event.state == MutationState::Paused => {
              deadline = None;
              bridge.flush();
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {
              deadline.get_or_insert_with(|| Instant::now() + throttle);
            }
            Err(RecvError::Closed) => break,
          },
          _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
            deadline = None;
            bridge.flush();
          }
        }
      }
      if deadline.is_some() {
        bridge.flush();
      }
    })
  }
}

fn checksum(body: &str) -> String {
  hex::encode(Sha256::digest(body.as_bytes()))
}

fn encode(snapshot: &Snapshot) -> Result<String> {
  let body = serde_json::to_string(snapshot).map_err(|e| eyre!("Failed to serialize snapshot: {}", e))?;
  let envelope = Envelope {
    checksum: checksum(&body),
    body,
  };
  serde_json::to_string(&envelope).map_err(|e| eyre!("Failed to serialize snapshot: {}", e))
}

fn decode(raw: &str) -> Result<Snapshot> {
  let envelope: Envelope =
    serde_json::from_str(raw).map_err(|e| eyre!("Failed to parse snapshot envelope: {}", e))?;
  if checksum(&envelope.body) != envelope.checksum {
    return Err(eyre!("Snapshot checksum mismatch"));
  }
  let snapshot: Snapshot =
    serde_json::from_str(&envelope.body).map_err(|e| eyre!("Failed to parse snapshot: {}", e))?;
  if snapshot.version != SNAPSHOT_VERSION {
    return Err(eyre!("Unsupported snapshot version {}", snapshot.version));
  }
  Ok(snapshot)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{fetcher, QueryKey, ReadOptions};
  use crate::connectivity::ConnectivityMonitor;
  use crate::gateway::Method;
  use crate::mutation::{MutationKind, MutationRequest, OptimisticOp};
  use crate::persist::MemoryKeyStore;
  use crate::retry::RetryPolicy;
  use crate::session::SessionStore;
  use crate::test_support::ScriptedGateway;
  use pretty_assertions::assert_eq;
  use serde_json::json;

  struct Parts {
    cache: EntityCache,
    coordinator: MutationCoordinator,
    bridge: PersistenceBridge,
  }

  fn parts(store: Arc<dyn KeyValueStore>, online: bool, settings: PersistSettings) -> Parts {
    let cache = EntityCache::new(RetryPolicy::none());
    let coordinator = MutationCoordinator::new(
      cache.clone(),
      ScriptedGateway::shared(),
      ConnectivityMonitor::new(online),
      SessionStore::load(Arc::clone(&store)),
      RetryPolicy::none(),
    );
    let bridge = PersistenceBridge::new(cache.clone(), coordinator.clone(), store, settings);
    Parts {
      cache,
      coordinator,
      bridge,
    }
  }

  fn entries() -> QueryKey {
    QueryKey::from(["entries", "list"])
  }

  async fn populate(cache: &EntityCache, data: serde_json::Value) {
    let f = fetcher(move || {
      let data = data.clone();
      async move { Ok(data) }
    });
    cache.fetch(&entries(), f, ReadOptions::default()).await;
  }

  fn delete(id: i64) -> MutationRequest {
    MutationRequest {
      kind: MutationKind::Delete,
      target_key: entries(),
      method: Method::Delete,
      endpoint: format!("/api/entries/{}", id),
      payload: None,
      optimistic: OptimisticOp::Remove { id: json!(id) },
    }
  }

  #[tokio::test]
  async fn test_round_trip_restores_data_as_stale() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyStore::new());
    let first = parts(Arc::clone(&store), true, PersistSettings::default());
    let data = json!([{"id": 1, "text": "kept"}, {"id": 2, "text": "also kept"}]);
    populate(&first.cache, data.clone()).await;
    first.bridge.persist_now().unwrap();

    let second = parts(store, true, PersistSettings::default());
    let outcome = second.bridge.restore();

    assert_eq!(
      outcome,
      RestoreOutcome::Restored {
        entries: 1,
        mutations: 0
      }
    );
    let entry = second.cache.entry(&entries()).unwrap();
    assert_eq!(entry.data, Some(data));
    assert!(entry.is_stale());
  }

  #[tokio::test]
  async fn test_missing_and_garbage_snapshots_are_harmless() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyStore::new());
    let p = parts(Arc::clone(&store), true, PersistSettings::default());
    assert_eq!(p.bridge.restore(), RestoreOutcome::Empty);

    store.set_item(SNAPSHOT_STORAGE_KEY, "{{{ not json").unwrap();
    assert_eq!(p.bridge.restore(), RestoreOutcome::Corrupt);
    assert!(p.cache.keys().is_empty());
  }

  #[tokio::test]
  async fn test_tampered_snapshot_is_rejected() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyStore::new());
    let p = parts(Arc::clone(&store), true, PersistSettings::default());
    populate(&p.cache, json!([{"id": 1}])).await;
    p.bridge.persist_now().unwrap();

    let raw = store.get_item(SNAPSHOT_STORAGE_KEY).unwrap().unwrap();
    let mut envelope: Envelope = serde_json::from_str(&raw).unwrap();
    envelope.body = envelope.body.replace("\"id\":1", "\"id\":9");
    store
      .set_item(SNAPSHOT_STORAGE_KEY, &serde_json::to_string(&envelope).unwrap())
      .unwrap();

    let fresh = parts(store, true, PersistSettings::default());
    assert_eq!(fresh.bridge.restore(), RestoreOutcome::Corrupt);
    assert!(fresh.cache.entry(&entries()).is_none());
  }

  #[tokio::test]
  async fn test_expired_snapshot_is_discarded_wholesale() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyStore::new());
    let old = Snapshot {
      version: SNAPSHOT_VERSION,
      saved_at: Utc::now() - chrono::Duration::hours(25),
      entries: vec![PersistedEntry {
        key: entries(),
        data: json!([{"id": 1}]),
        updated_at: Utc::now() - chrono::Duration::hours(25),
      }],
      mutations: vec![],
    };
    store
      .set_item(SNAPSHOT_STORAGE_KEY, &encode(&old).unwrap())
      .unwrap();

    let p = parts(Arc::clone(&store), true, PersistSettings::default());
    assert_eq!(p.bridge.restore(), RestoreOutcome::Expired);
    assert!(p.cache.keys().is_empty());
    assert_eq!(store.get_item(SNAPSHOT_STORAGE_KEY).unwrap(), None);
  }

  #[tokio::test]
  async fn test_paused_mutations_survive_restart() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyStore::new());
    let first = parts(Arc::clone(&store), false, PersistSettings::default());
    populate(&first.cache, json!([{"id": 5}, {"id": 6}])).await;
    first.coordinator.mutate(delete(5)).await;
    first.bridge.persist_now().unwrap();

    let second = parts(store, false, PersistSettings::default());
    assert_eq!(
      second.bridge.restore(),
      RestoreOutcome::Restored {
        entries: 1,
        mutations: 1
      }
    );
    let paused = second.coordinator.paused();
    assert_eq!(paused.len(), 1);
    assert_eq!(paused[0].endpoint, "/api/entries/5");
    assert_eq!(paused[0].optimistic_snapshot, Some(json!([{"id": 5}, {"id": 6}])));
    assert_eq!(second.cache.data(&entries()), Some(json!([{"id": 6}])));
  }

  #[tokio::test]
  async fn test_changes_are_flushed_after_throttle() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyStore::new());
    let settings = PersistSettings {
      throttle: Duration::from_millis(40),
      ..PersistSettings::default()
    };
    let p = parts(Arc::clone(&store), true, settings);
    let task = p.bridge.spawn();

    populate(&p.cache, json!([{"id": 1}])).await;
    assert_eq!(store.get_item(SNAPSHOT_STORAGE_KEY).unwrap(), None);

    tokio::time::sleep(Duration::from_millis(120)).await;
    let raw = store.get_item(SNAPSHOT_STORAGE_KEY).unwrap().unwrap();
    assert_eq!(decode(&raw).unwrap().entries.len(), 1);
    task.abort();
  }

  #[tokio::test]
  async fn test_paused_mutation_flushes_immediately() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyStore::new());
    let settings = PersistSettings {
      throttle: Duration::from_secs(3600),
      ..PersistSettings::default()
    };
    let p = parts(Arc::clone(&store), false, settings);
    let task = p.bridge.spawn();

    p.coordinator.mutate(delete(1)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let raw = store.get_item(SNAPSHOT_STORAGE_KEY).unwrap().unwrap();
    assert_eq!(decode(&raw).unwrap().mutations.len(), 1);
    task.abort();
  }
}
