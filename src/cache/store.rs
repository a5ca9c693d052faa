//! The entity cache: last known value of every named collection.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::key::QueryKey;
use super::traits::{CacheEntry, CacheEvent, CacheStatus, ReadOptions};
use crate::error::SyncError;
use crate::retry::RetryPolicy;
use crate::session::UnauthorizedHandler;

/// A boxed future that resolves to the fetched collection.
pub type FetchFuture = BoxFuture<'static, Result<Value, SyncError>>;

/// A factory function that creates futures for fetching data.
pub type Fetcher = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// Wrap a closure returning a future into a [`Fetcher`].
pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Value, SyncError>> + Send + 'static,
{
  Arc::new(move || f().boxed())
}

/// Generation of the cache. Bumped by [`EntityCache::teardown`]; writes
/// tagged with an older epoch are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEpoch(u64);

/// A cached entry in its persisted form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
  pub key: QueryKey,
  pub data: Value,
  pub updated_at: DateTime<Utc>,
}

struct InFlight {
  id: u64,
  done: Shared<BoxFuture<'static, ()>>,
}

struct Slot {
  entry: CacheEntry,
  fetcher: Option<Fetcher>,
  options: ReadOptions,
  in_flight: Option<InFlight>,
  observers: usize,
  holds: usize,
  last_accessed: Instant,
}

impl Slot {
  fn new(key: QueryKey, options: ReadOptions) -> Self {
    Self {
      entry: CacheEntry::empty(key, options.stale_time),
      fetcher: None,
      options,
      in_flight: None,
      observers: 0,
      holds: 0,
      last_accessed: Instant::now(),
    }
  }
}

struct State {
  slots: HashMap<QueryKey, Slot>,
  epoch: u64,
  next_fetch: u64,
  /// Network reads are off for every key (rejected session)
  reads_suspended: bool,
}

struct Inner {
  state: Mutex<State>,
  events: broadcast::Sender<CacheEvent>,
  retry: RetryPolicy,
  unauthorized: Mutex<Option<UnauthorizedHandler>>,
}

/// Process-wide store of cached collections.
///
/// Cheap to clone; clones share the same state. Reads never block on the
/// network: they return the current entry and, when the entry is stale,
/// start a background fetch. At most one fetch per key is in flight.
#[derive(Clone)]
pub struct EntityCache {
  inner: Arc<Inner>,
}

impl EntityCache {
  pub fn new(retry: RetryPolicy) -> Self {
    let (events, _) = broadcast::channel(256);
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State {
          slots: HashMap::new(),
          epoch: 0,
          next_fetch: 0,
          reads_suspended: false,
        }),
        events,
        retry,
        unauthorized: Mutex::new(None),
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn emit(&self, event: CacheEvent) {
    // No receivers is fine
    let _ = self.inner.events.send(event);
  }

  /// Register the hook called when a fetch comes back 401.
  pub fn set_unauthorized_handler(&self, handler: UnauthorizedHandler) {
    *self
      .inner
      .unauthorized
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = Some(handler);
  }

  fn notify_unauthorized(&self) {
    let handler = self
      .inner
      .unauthorized
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    if let Some(handler) = handler {
      handler();
    }
  }

  /// Subscribe to change notifications for every key.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.inner.events.subscribe()
  }

  pub fn epoch(&self) -> CacheEpoch {
    CacheEpoch(self.lock().epoch)
  }

  /// Return the current entry for `key` and start a background fetch if
  /// the entry is stale, reads are enabled, and nothing is in flight.
  ///
  /// Must be called within a Tokio runtime.
  pub fn read(&self, key: &QueryKey, fetcher: Fetcher, options: ReadOptions) -> CacheEntry {
    let mut state = self.lock();
    let suspended = state.reads_suspended;
    let slot = state
      .slots
      .entry(key.clone())
      .or_insert_with(|| Slot::new(key.clone(), options));
    slot.fetcher = Some(fetcher);
    slot.options = options;
    slot.entry.stale_time = options.stale_time;
    slot.last_accessed = Instant::now();

    let should_fetch =
      options.enabled && !suspended && slot.in_flight.is_none() && slot.entry.is_stale();
    if should_fetch {
      self.start_fetch(&mut state, key);
    }

    state
      .slots
      .get(key)
      .map(|slot| slot.entry.clone())
      .unwrap_or_else(|| CacheEntry::empty(key.clone(), options.stale_time))
  }

  /// Like [`read`](Self::read), but waits for the in-flight fetch (new or
  /// already running) to settle before returning the entry.
  pub async fn fetch(&self, key: &QueryKey, fetcher: Fetcher, options: ReadOptions) -> CacheEntry {
    self.read(key, fetcher, options);
    let done = self
      .lock()
      .slots
      .get(key)
      .and_then(|slot| slot.in_flight.as_ref().map(|f| f.done.clone()));

    if let Some(done) = done {
      debug!(%key, "awaiting in-flight fetch");
      done.await;
    }

    self
      .entry(key)
      .unwrap_or_else(|| CacheEntry::empty(key.clone(), options.stale_time))
  }

  fn start_fetch(&self, state: &mut State, key: &QueryKey) {
    let id = state.next_fetch;
    state.next_fetch += 1;
    let epoch = state.epoch;

    let Some(slot) = state.slots.get_mut(key) else {
      return;
    };
    let Some(fetcher) = slot.fetcher.clone() else {
      return;
    };

    debug!(%key, hash = %key.storage_hash(), fetch = id, "starting fetch");
    let task = self
      .clone()
      .run_fetch(key.clone(), id, epoch, fetcher)
      .boxed()
      .shared();

    slot.in_flight = Some(InFlight {
      id,
      done: task.clone(),
    });
    slot.entry.is_fetching = true;
    if slot.entry.data.is_none() {
      slot.entry.status = CacheStatus::Loading;
    }
    self.emit(CacheEvent::Updated(key.clone()));

    tokio::spawn(task);
  }

  async fn run_fetch(self, key: QueryKey, id: u64, epoch: u64, fetcher: Fetcher) {
    let result = self.inner.retry.run(|| fetcher()).await;
    let unauthorized = matches!(result, Err(SyncError::Unauthorized));
    self.apply_fetch_result(&key, id, epoch, result);
    if unauthorized {
      // Stay off the network until someone signs in again.
      self.set_reads_enabled(false);
      self.notify_unauthorized();
    }
  }

  fn apply_fetch_result(
    &self,
    key: &QueryKey,
    id: u64,
    epoch: u64,
    result: Result<Value, SyncError>,
  ) {
    let mut state = self.lock();
    if state.epoch != epoch {
      debug!(%key, fetch = id, "dropping fetch result from torn-down cache");
      return;
    }
    let Some(slot) = state.slots.get_mut(key) else {
      return;
    };
    if slot.in_flight.as_ref().map(|f| f.id) != Some(id) {
      debug!(%key, fetch = id, "discarding cancelled fetch result");
      return;
    }

    slot.in_flight = None;
    slot.entry.is_fetching = false;
    match result {
      Ok(data) => {
        slot.entry.data = Some(data);
        slot.entry.status = CacheStatus::Success;
        slot.entry.last_updated_at = Some(Utc::now());
        slot.entry.invalidated = false;
        slot.entry.error = None;
        debug!(%key, fetch = id, "fetch succeeded");
      }
      Err(err) => {
        // Keep the last good data
        slot.entry.status = CacheStatus::Error;
        slot.entry.error = Some(err.to_string());
        warn!(%key, fetch = id, error = %err, "fetch failed");
      }
    }
    self.emit(CacheEvent::Updated(key.clone()));
  }

  /// Current entry without side effects.
  pub fn entry(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.lock().slots.get(key).map(|slot| slot.entry.clone())
  }

  /// Current data without side effects.
  pub fn data(&self, key: &QueryKey) -> Option<Value> {
    self.lock().slots.get(key).and_then(|slot| slot.entry.data.clone())
  }

  pub fn keys(&self) -> Vec<QueryKey> {
    let mut keys: Vec<QueryKey> = self.lock().slots.keys().cloned().collect();
    keys.sort();
    keys
  }

  /// Synchronously replace the data of `key` with `updater(old)`.
  pub fn write<F>(&self, key: &QueryKey, updater: F)
  where
    F: FnOnce(Option<Value>) -> Option<Value>,
  {
    let epoch = self.epoch();
    self.write_in(epoch, key, updater);
  }

  /// Write only if the cache is still in `epoch`. Returns whether the
  /// write happened.
  pub fn write_in<F>(&self, epoch: CacheEpoch, key: &QueryKey, updater: F) -> bool
  where
    F: FnOnce(Option<Value>) -> Option<Value>,
  {
    let mut state = self.lock();
    if state.epoch != epoch.0 {
      debug!(%key, "skipping write for torn-down cache");
      return false;
    }
    let slot = state
      .slots
      .entry(key.clone())
      .or_insert_with(|| Slot::new(key.clone(), ReadOptions::default()));
    let current = slot.entry.data.take();
    slot.entry.data = updater(current);
    slot.last_accessed = Instant::now();
    self.emit(CacheEvent::Updated(key.clone()));
    true
  }

  /// Mark `key` stale. Observed keys refetch right away.
  pub fn invalidate(&self, key: &QueryKey) {
    let epoch = self.epoch();
    self.invalidate_in(epoch, key);
  }

  pub fn invalidate_in(&self, epoch: CacheEpoch, key: &QueryKey) -> bool {
    let mut state = self.lock();
    if state.epoch != epoch.0 {
      return false;
    }
    let suspended = state.reads_suspended;
    let Some(slot) = state.slots.get_mut(key) else {
      return false;
    };
    slot.entry.invalidated = true;
    let refetch = slot.observers > 0
      && !suspended
      && slot.options.enabled
      && slot.in_flight.is_none()
      && slot.fetcher.is_some();
    debug!(%key, refetch, "invalidated");
    self.emit(CacheEvent::Invalidated(key.clone()));

    if refetch {
      self.start_fetch(&mut state, key);
    }
    true
  }

  /// Switch network reads off or back on for every key, whatever the
  /// options of individual reads say. Turning them back on refetches
  /// observed keys that went stale meanwhile.
  pub fn set_reads_enabled(&self, enabled: bool) {
    let mut state = self.lock();
    if state.reads_suspended != enabled {
      return;
    }
    state.reads_suspended = !enabled;
    info!(enabled, "network reads toggled");
    if !enabled {
      return;
    }
    let stale: Vec<QueryKey> = state
      .slots
      .iter()
      .filter(|(_, slot)| {
        slot.observers > 0
          && slot.options.enabled
          && slot.in_flight.is_none()
          && slot.entry.is_stale()
      })
      .map(|(key, _)| key.clone())
      .collect();
    for key in stale {
      self.start_fetch(&mut state, &key);
    }
  }

  pub fn reads_enabled(&self) -> bool {
    !self.lock().reads_suspended
  }

  /// Make the outstanding fetch for `key` (if any) land nowhere. The
  /// request itself keeps running.
  pub fn cancel_in_flight(&self, key: &QueryKey) -> bool {
    let mut state = self.lock();
    let Some(slot) = state.slots.get_mut(key) else {
      return false;
    };
    let Some(in_flight) = slot.in_flight.take() else {
      return false;
    };
    slot.entry.is_fetching = false;
    if slot.entry.status == CacheStatus::Loading {
      slot.entry.status = CacheStatus::Idle;
    }
    debug!(%key, fetch = in_flight.id, "cancelled in-flight fetch");
    self.emit(CacheEvent::Updated(key.clone()));
    true
  }

  /// Drop every entry. Outstanding fetches and writes from the previous
  /// epoch become no-ops.
  pub fn teardown(&self) {
    let mut state = self.lock();
    let dropped = state.slots.len();
    state.slots.clear();
    state.epoch += 1;
    info!(dropped, "cache torn down");
    self.emit(CacheEvent::Cleared);
  }

  pub(crate) fn observe(&self, key: &QueryKey, options: ReadOptions) {
    let mut state = self.lock();
    let slot = state
      .slots
      .entry(key.clone())
      .or_insert_with(|| Slot::new(key.clone(), options));
    slot.observers += 1;
  }

  pub(crate) fn unobserve(&self, key: &QueryKey) {
    if let Some(slot) = self.lock().slots.get_mut(key) {
      slot.observers = slot.observers.saturating_sub(1);
      slot.last_accessed = Instant::now();
    }
  }

  /// Pin `key` against garbage collection while a mutation targets it.
  pub(crate) fn hold(&self, key: &QueryKey) {
    let mut state = self.lock();
    let slot = state
      .slots
      .entry(key.clone())
      .or_insert_with(|| Slot::new(key.clone(), ReadOptions::default()));
    slot.holds += 1;
  }

  pub(crate) fn release(&self, key: &QueryKey) {
    if let Some(slot) = self.lock().slots.get_mut(key) {
      slot.holds = slot.holds.saturating_sub(1);
      slot.last_accessed = Instant::now();
    }
  }

  /// Remove entries nobody watches, no mutation holds, and nobody read
  /// for longer than their `gc_time`.
  pub fn collect_garbage(&self) -> usize {
    let mut state = self.lock();
    let now = Instant::now();
    let expired: Vec<QueryKey> = state
      .slots
      .iter()
      .filter(|(_, slot)| {
        slot.observers == 0
          && slot.holds == 0
          && slot.in_flight.is_none()
          && now.duration_since(slot.last_accessed) >= slot.options.gc_time
      })
      .map(|(key, _)| key.clone())
      .collect();

    for key in &expired {
      state.slots.remove(key);
      debug!(%key, "garbage collected");
      self.emit(CacheEvent::Removed(key.clone()));
    }
    expired.len()
  }

  /// Sweep for garbage every `interval`.
  pub fn spawn_gc(&self, interval: Duration) -> JoinHandle<()> {
    let cache = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        cache.collect_garbage();
      }
    })
  }

  /// Entries worth restoring after a restart: successful ones only.
  pub fn persistable(&self) -> Vec<PersistedEntry> {
    let state = self.lock();
    let mut entries: Vec<PersistedEntry> = state
      .slots
      .values()
      .filter(|slot| slot.entry.status == CacheStatus::Success)
      .filter_map(|slot| {
        Some(PersistedEntry {
          key: slot.entry.key.clone(),
          data: slot.entry.data.clone()?,
          updated_at: slot.entry.last_updated_at?,
        })
      })
      .collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries
  }

  /// Seed the cache from persisted entries. Restored entries are stale so
  /// the first read refreshes them; keys already present are left alone.
  pub fn restore(&self, entries: Vec<PersistedEntry>) -> usize {
    let mut state = self.lock();
    let mut restored = 0;
    for persisted in entries {
      if state.slots.contains_key(&persisted.key) {
        continue;
      }
      let mut slot = Slot::new(persisted.key.clone(), ReadOptions::default());
      slot.entry.data = Some(persisted.data);
      slot.entry.status = CacheStatus::Success;
      slot.entry.last_updated_at = Some(persisted.updated_at);
      slot.entry.invalidated = true;
      state.slots.insert(persisted.key.clone(), slot);
      self.emit(CacheEvent::Updated(persisted.key));
      restored += 1;
    }
    restored
  }
}

impl Default for EntityCache {
  fn default() -> Self {
    Self::new(RetryPolicy::default())
  }
}
