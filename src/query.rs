//! Typed, subscribed view over one cached collection.
//!
//! An [`EntityCollection<T>`] registers itself as an observer of its key,
//! kicks off a background fetch when the cached entry is stale, and keeps a
//! decoded copy of the entry that callers refresh with [`poll`] or
//! [`changed`].
//!
//! # Example
//!
//! ```ignore
//! let mut entries = client.entries();
//!
//! // In event loop tick
//! if entries.poll() {
//!     // State changed, redraw
//! }
//!
//! let state = entries.state();
//! if state.is_loading {
//!     render_spinner();
//! } else if let Some(list) = &state.data {
//!     render_entries(list);
//! }
//! ```
//!
//! [`poll`]: EntityCollection::poll
//! [`changed`]: EntityCollection::changed

use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::cache::{CacheEntry, CacheEvent, CacheStatus, EntityCache, Fetcher, QueryKey, ReadOptions};

/// What a reader sees of a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionState<T> {
  pub data: Option<T>,
  /// First load with nothing cached yet
  pub is_loading: bool,
  /// Any fetch outstanding, including background revalidation
  pub is_fetching: bool,
  pub error: Option<String>,
  pub is_stale: bool,
}

impl<T> Default for CollectionState<T> {
  fn default() -> Self {
    Self {
      data: None,
      is_loading: false,
      is_fetching: false,
      error: None,
      is_stale: true,
    }
  }
}

impl<T: DeserializeOwned> CollectionState<T> {
  pub(crate) fn from_entry(entry: &CacheEntry) -> Self {
    let (data, decode_error) = match entry.decode::<T>() {
      Some(Ok(data)) => (Some(data), None),
      Some(Err(e)) => (None, Some(format!("invalid response: {}", e))),
      None => (None, None),
    };
    Self {
      data,
      is_loading: entry.status == CacheStatus::Loading,
      is_fetching: entry.is_fetching,
      error: decode_error.or_else(|| entry.error.clone()),
      is_stale: entry.is_stale(),
    }
  }
}

/// Read-only subscription to a cached collection.
///
/// Dropping it stops observing the key; the cached entry itself stays until
/// garbage collection.
pub struct EntityCollection<T> {
  cache: EntityCache,
  key: QueryKey,
  fetcher: Fetcher,
  options: ReadOptions,
  events: broadcast::Receiver<CacheEvent>,
  state: CollectionState<T>,
}

impl<T: DeserializeOwned> EntityCollection<T> {
  /// Start observing `key`. Returns at once with whatever is cached; a
  /// fetch starts in the background when the entry is stale.
  ///
  /// Must be called within a Tokio runtime.
  pub fn new(cache: EntityCache, key: QueryKey, fetcher: Fetcher, options: ReadOptions) -> Self {
    let events = cache.subscribe();
    cache.observe(&key, options);
    let entry = cache.read(&key, fetcher.clone(), options);
    Self {
      state: CollectionState::from_entry(&entry),
      cache,
      key,
      fetcher,
      options,
      events,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Get the current state of the collection.
  pub fn state(&self) -> &CollectionState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading
  }

  pub fn is_fetching(&self) -> bool {
    self.state.is_fetching
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error.as_deref()
  }

  pub fn is_stale(&self) -> bool {
    self.state.is_stale
  }

  /// Drain pending cache notifications without blocking.
  ///
  /// Returns `true` if the collection changed. Call this in your event loop
  /// tick handler.
  pub fn poll(&mut self) -> bool {
    let mut relevant = false;
    loop {
      match self.events.try_recv() {
        Ok(event) => relevant |= self.note(&event),
        Err(TryRecvError::Lagged(_)) => relevant = true,
        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
      }
    }
    if relevant {
      self.refresh();
    }
    relevant
  }

  /// Wait until the collection changes. Returns `false` once the cache is
  /// gone.
  pub async fn changed(&mut self) -> bool {
    loop {
      match self.events.recv().await {
        Ok(event) => {
          if self.note(&event) {
            self.refresh();
            return true;
          }
        }
        Err(RecvError::Lagged(_)) => {
          self.refresh();
          return true;
        }
        Err(RecvError::Closed) => return false,
      }
    }
  }

  fn note(&self, event: &CacheEvent) -> bool {
    if *event == CacheEvent::Cleared {
      // Teardown dropped our slot along with the observer count.
      self.cache.observe(&self.key, self.options);
    }
    event.affects(&self.key)
  }

  fn refresh(&mut self) {
    self.state = match self.cache.entry(&self.key) {
      Some(entry) => CollectionState::from_entry(&entry),
      None => CollectionState::default(),
    };
  }

  /// Mark the collection stale and fetch it again.
  pub fn refetch(&mut self) {
    self.cache.invalidate(&self.key);
    let entry = self.cache.read(&self.key, self.fetcher.clone(), self.options);
    self.state = CollectionState::from_entry(&entry);
  }

  /// Turn fetching on or off (e.g. when the session changes).
  pub fn set_enabled(&mut self, enabled: bool) {
    self.options = self.options.enabled(enabled);
    let entry = self.cache.read(&self.key, self.fetcher.clone(), self.options);
    self.state = CollectionState::from_entry(&entry);
  }
}

impl<T> Drop for EntityCollection<T> {
  fn drop(&mut self) {
    self.cache.unobserve(&self.key);
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for EntityCollection<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EntityCollection")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::fetcher;
  use crate::error::SyncError;
  use crate::retry::RetryPolicy;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  fn key() -> QueryKey {
    QueryKey::from(["entries", "list"])
  }

  fn counting(counter: Arc<AtomicU32>) -> Fetcher {
    fetcher(move || {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(json!([n]))
      }
    })
  }

  #[tokio::test]
  async fn test_collection_loads_in_background() {
    let cache = EntityCache::default();
    let counter = Arc::new(AtomicU32::new(0));
    let mut numbers: EntityCollection<Vec<u32>> =
      EntityCollection::new(cache, key(), counting(counter), ReadOptions::default());

    assert!(numbers.is_loading());
    assert!(numbers.is_fetching());
    assert_eq!(numbers.data(), None);

    // Wait for the result
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(numbers.poll());
    assert!(!numbers.is_loading());
    assert!(!numbers.is_stale());
    assert_eq!(numbers.data(), Some(&vec![0]));
  }

  #[tokio::test]
  async fn test_two_subscribers_share_a_fetch() {
    let cache = EntityCache::default();
    let counter = Arc::new(AtomicU32::new(0));
    let opts = ReadOptions::default();

    let _a: EntityCollection<Vec<u32>> =
      EntityCollection::new(cache.clone(), key(), counting(counter.clone()), opts);
    let mut b: EntityCollection<Vec<u32>> =
      EntityCollection::new(cache, key(), counting(counter.clone()), opts);

    assert!(b.changed().await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    b.poll();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(b.data(), Some(&vec![0]));
  }

  #[tokio::test]
  async fn test_sees_optimistic_writes() {
    let cache = EntityCache::default();
    cache.write(&key(), |_| Some(json!([1, 2])));
    let mut numbers: EntityCollection<Vec<u32>> = EntityCollection::new(
      cache.clone(),
      key(),
      fetcher(|| async { Ok(json!([1, 2])) }),
      ReadOptions::default().enabled(false),
    );
    assert_eq!(numbers.data(), Some(&vec![1, 2]));

    cache.write(&key(), |_| Some(json!([3, 1, 2])));

    assert!(numbers.poll());
    assert_eq!(numbers.data(), Some(&vec![3, 1, 2]));
    assert!(!numbers.poll());
  }

  #[tokio::test]
  async fn test_invalidation_refetches_while_observed() {
    let cache = EntityCache::default();
    let counter = Arc::new(AtomicU32::new(0));
    let mut numbers: EntityCollection<Vec<u32>> =
      EntityCollection::new(cache.clone(), key(), counting(counter.clone()), ReadOptions::default());
    tokio::time::sleep(Duration::from_millis(30)).await;
    numbers.poll();

    cache.invalidate(&key());
    tokio::time::sleep(Duration::from_millis(30)).await;
    numbers.poll();

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(numbers.data(), Some(&vec![1]));
  }

  #[tokio::test]
  async fn test_drop_stops_observing() {
    let cache = EntityCache::default();
    let counter = Arc::new(AtomicU32::new(0));
    let numbers: EntityCollection<Vec<u32>> =
      EntityCollection::new(cache.clone(), key(), counting(counter.clone()), ReadOptions::default());
    tokio::time::sleep(Duration::from_millis(30)).await;
    drop(numbers);

    cache.invalidate(&key());
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_disabled_until_enabled() {
    let cache = EntityCache::default();
    let counter = Arc::new(AtomicU32::new(0));
    let mut numbers: EntityCollection<Vec<u32>> = EntityCollection::new(
      cache,
      key(),
      counting(counter.clone()),
      ReadOptions::default().enabled(false),
    );
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert!(!numbers.is_loading());

    numbers.set_enabled(true);
    assert!(numbers.is_fetching());
    tokio::time::sleep(Duration::from_millis(30)).await;
    numbers.poll();
    assert_eq!(numbers.data(), Some(&vec![0]));
  }

  #[tokio::test]
  async fn test_error_and_shape_mismatch_surface() {
    let cache = EntityCache::new(RetryPolicy::none());
    let mut failing: EntityCollection<Vec<u32>> = EntityCollection::new(
      cache.clone(),
      key(),
      fetcher(|| async { Err(SyncError::from_status(404, None)) }),
      ReadOptions::default(),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    failing.poll();
    assert_eq!(failing.error(), Some("not found"));

    let other = QueryKey::from(["files", "list"]);
    cache.write(&other, |_| Some(json!({"not": "a list"})));
    let mismatched: EntityCollection<Vec<u32>> = EntityCollection::new(
      cache,
      other,
      fetcher(|| async { Ok(json!([])) }),
      ReadOptions::default().enabled(false),
    );
    assert!(mismatched
      .error()
      .is_some_and(|e| e.starts_with("invalid response")));
  }
}
