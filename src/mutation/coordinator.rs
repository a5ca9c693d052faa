//! Mutation coordinator: optimistic apply, commit, rollback and offline replay.

use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{
  Mutation, MutationEvent, MutationId, MutationOutcome, MutationRequest, MutationState,
  ReplayReport,
};
use crate::cache::EntityCache;
use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;
use crate::gateway::{RemoteGateway, RequestOptions};
use crate::retry::RetryPolicy;
use crate::session::{SessionStore, UnauthorizedHandler};

/// How many settled mutations are kept around for inspection.
const SETTLED_HISTORY: usize = 64;

#[derive(Default)]
struct Queue {
  /// Mutations that can still affect the cache, ordered by creation
  live: BTreeMap<MutationId, Mutation>,
  settled: VecDeque<Mutation>,
  next_id: u64,
  /// Bumped on every successful commit
  commits: u64,
  last_error: Option<String>,
}

struct Inner {
  cache: EntityCache,
  gateway: Arc<dyn RemoteGateway>,
  connectivity: ConnectivityMonitor,
  session: SessionStore,
  retry: RetryPolicy,
  queue: Mutex<Queue>,
  replay: tokio::sync::Mutex<()>,
  unauthorized: Mutex<Option<UnauthorizedHandler>>,
  events: broadcast::Sender<MutationEvent>,
}

/// Sole writer of the entity cache during mutation flows.
#[derive(Clone)]
pub struct MutationCoordinator {
  inner: Arc<Inner>,
}

impl MutationCoordinator {
  pub fn new(
    cache: EntityCache,
    gateway: Arc<dyn RemoteGateway>,
    connectivity: ConnectivityMonitor,
    session: SessionStore,
    retry: RetryPolicy,
  ) -> Self {
    let (events, _) = broadcast::channel(256);
    Self {
      inner: Arc::new(Inner {
        cache,
        gateway,
        connectivity,
        session,
        retry,
        queue: Mutex::new(Queue::default()),
        replay: tokio::sync::Mutex::new(()),
        unauthorized: Mutex::new(None),
        events,
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Queue> {
    self
      .inner
      .queue
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn emit(&self, id: MutationId, state: MutationState) {
    let _ = self.inner.events.send(MutationEvent { id, state });
  }

  /// Register the hook called when a commit comes back 401.
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

  pub fn subscribe(&self) -> broadcast::Receiver<MutationEvent> {
    self.inner.events.subscribe()
  }

  /// Apply `request` optimistically, then commit it or queue it.
  ///
  /// Never fails: the outcome carries the error message, which is also
  /// kept as [`last_error`](Self::last_error).
  pub async fn mutate(&self, request: MutationRequest) -> MutationOutcome {
    // Earlier paused writes go first. The replay lock also covers a
    // replay that is committing its last queued write right now.
    let replaying = if self.inner.connectivity.is_online() {
      let guard = self.inner.replay.lock().await;
      if self.has_paused() {
        self.replay_paused().await;
      }
      Some(guard)
    } else {
      None
    };

    let id = self.begin(request);
    drop(replaying);
    if !self.inner.connectivity.is_online() {
      self.transition(id, MutationState::Paused);
      info!(%id, "offline, mutation paused");
      return MutationOutcome::Queued;
    }
    self.commit(id).await
  }

  /// Steps 1-2: capture the snapshot and apply the optimistic update.
  fn begin(&self, request: MutationRequest) -> MutationId {
    let cache = &self.inner.cache;
    let mut queue = self.lock();
    let id = MutationId(queue.next_id);
    queue.next_id += 1;

    let epoch = cache.epoch();
    let key = request.target_key.clone();
    let cancelled = cache.cancel_in_flight(&key);
    cache.hold(&key);

    let mut snapshot = None;
    let op = request.optimistic.clone();
    cache.write_in(epoch, &key, |current| {
      snapshot = current.clone();
      op.apply(current)
    });

    debug!(%id, kind = ?request.kind, %key, "optimistic update applied");
    let commit_mark = queue.commits;
    queue.live.insert(
      id,
      Mutation {
        id,
        kind: request.kind,
        target_key: request.target_key,
        method: request.method,
        endpoint: request.endpoint,
        payload: request.payload,
        optimistic: request.optimistic,
        state: MutationState::Pending,
        optimistic_snapshot: snapshot,
        created_at: Utc::now(),
        attempts: 0,
        error: None,
        epoch: Some(epoch),
        commit_mark,
        snapshot_unreconciled: cancelled,
      },
    );
    drop(queue);
    self.emit(id, MutationState::Pending);
    id
  }

  fn transition(&self, id: MutationId, state: MutationState) -> Option<Mutation> {
    let mutation = {
      let mut queue = self.lock();
      let mutation = queue.live.get_mut(&id)?;
      mutation.state = state;
      mutation.clone()
    };
    self.emit(id, state);
    Some(mutation)
  }

  /// Step 4: send the write and reconcile.
  async fn commit(&self, id: MutationId) -> MutationOutcome {
    let Some(mutation) = self.transition(id, MutationState::Committing) else {
      return MutationOutcome::Failed(format!("unknown mutation {}", id));
    };
    let token = self.inner.session.token();

    let result = self
      .inner
      .retry
      .run(|| {
        self.record_attempt(id);
        let gateway = Arc::clone(&self.inner.gateway);
        let endpoint = mutation.endpoint.clone();
        let mut options = RequestOptions::new(mutation.method).with_token(token.clone());
        options.body = mutation.payload.clone();
        async move { gateway.request(&endpoint, options).await.into_result() }
      })
      .await;

    match result {
      Ok(_) => self.settle_success(id),
      Err(err) if err.is_connectivity() => self.pause(id, err),
      Err(err) => {
        if err.is_unauthorized() {
          self.inner.cache.set_reads_enabled(false);
          self.notify_unauthorized();
        }
        self.rollback(id);
        self.settle_failure(id, err)
      }
    }
  }

  fn record_attempt(&self, id: MutationId) {
    if let Some(mutation) = self.lock().live.get_mut(&id) {
      mutation.attempts += 1;
    }
  }

  fn settle_success(&self, id: MutationId) -> MutationOutcome {
    let Some(mutation) = self.settle(id, MutationState::Success, None) else {
      return MutationOutcome::Committed;
    };
    let cache = &self.inner.cache;
    let epoch = mutation.epoch.unwrap_or_else(|| cache.epoch());
    // Server-assigned fields replace the placeholders on the next read.
    cache.invalidate_in(epoch, &mutation.target_key);
    cache.release(&mutation.target_key);
    info!(%id, key = %mutation.target_key, "mutation committed");
    MutationOutcome::Committed
  }

  fn settle_failure(&self, id: MutationId, err: SyncError) -> MutationOutcome {
    let message = err.to_string();
    if let Some(mutation) = self.settle(id, MutationState::Error, Some(message.clone())) {
      self.inner.cache.release(&mutation.target_key);
    }
    self.lock().last_error = Some(message.clone());
    warn!(%id, error = %message, "mutation failed and was rolled back");
    MutationOutcome::Failed(message)
  }

  fn settle(&self, id: MutationId, state: MutationState, error: Option<String>) -> Option<Mutation> {
    let mutation = {
      let mut queue = self.lock();
      let mut mutation = queue.live.remove(&id)?;
      if state == MutationState::Success {
        queue.commits += 1;
        mutation.commit_mark = queue.commits;
      }
      mutation.state = state;
      mutation.error = error;
      queue.settled.push_back(mutation.clone());
      while queue.settled.len() > SETTLED_HISTORY {
        queue.settled.pop_front();
      }
      mutation
    };
    self.emit(id, state);
    Some(mutation)
  }

  fn pause(&self, id: MutationId, err: SyncError) -> MutationOutcome {
    let current = self.inner.cache.epoch();
    let orphaned = {
      let mut queue = self.lock();
      match queue.live.get_mut(&id) {
        Some(mutation) if mutation.epoch.is_some_and(|epoch| epoch != current) => true,
        Some(mutation) => {
          mutation.state = MutationState::Paused;
          mutation.error = Some(err.to_string());
          false
        }
        None => false,
      }
    };
    if orphaned {
      // The cache was torn down (logout) while the write was in flight.
      return self.discard(id);
    }
    self.emit(id, MutationState::Paused);
    info!(%id, error = %err, "server unreachable, mutation paused");
    self.inner.connectivity.set_online(false);
    MutationOutcome::Queued
  }

  fn discard(&self, id: MutationId) -> MutationOutcome {
    let message = "session ended before the write reached the server".to_string();
    if let Some(mutation) = self.settle(id, MutationState::Error, Some(message.clone())) {
      self.inner.cache.release(&mutation.target_key);
    }
    warn!(%id, "dropping unsent mutation from a previous session");
    MutationOutcome::Failed(message)
  }

  /// Restore the snapshot captured for `id`, re-applying the optimistic
  /// updates of later live mutations on the same key in creation order.
  fn rollback(&self, id: MutationId) {
    let cache = &self.inner.cache;
    let mut queue = self.lock();
    let Some(failed) = queue.live.get(&id) else {
      return;
    };
    let key = failed.target_key.clone();
    let epoch = failed.epoch.unwrap_or_else(|| cache.epoch());
    let mark = failed.commit_mark;
    let unreconciled = failed.snapshot_unreconciled;
    let mut rebuilt = failed.optimistic_snapshot.clone();

    let mut rebased = 0;
    for later in queue
      .live
      .range_mut((Excluded(id), Unbounded))
      .map(|(_, m)| m)
      .filter(|m| m.target_key == key && m.state.is_live())
    {
      later.optimistic_snapshot = rebuilt.clone();
      later.commit_mark = later.commit_mark.min(mark);
      later.snapshot_unreconciled |= unreconciled;
      rebuilt = later.optimistic.apply(rebuilt);
      rebased += 1;
    }

    // Writes committed on this key after the snapshot was taken are
    // missing from it or still show up as placeholders.
    let committed_since = queue
      .settled
      .iter()
      .any(|m| m.target_key == key && m.state == MutationState::Success && m.commit_mark > mark);

    let cancelled = cache.cancel_in_flight(&key);
    let reconcile = committed_since || unreconciled || cancelled;
    let written = cache.write_in(epoch, &key, |_| rebuilt);
    if written && reconcile {
      cache.invalidate_in(epoch, &key);
    }
    drop(queue);
    debug!(%id, %key, rebased, reconcile, written, "rolled back");
  }

  fn has_paused(&self) -> bool {
    self
      .lock()
      .live
      .values()
      .any(|m| m.state == MutationState::Paused)
  }

  /// Replay paused mutations one at a time, oldest first, while online.
  /// Stops at the first one that hits a connectivity error again.
  pub async fn resume_paused(&self) -> ReplayReport {
    let _replaying = self.inner.replay.lock().await;
    self.replay_paused().await
  }

  /// Caller holds the replay lock.
  async fn replay_paused(&self) -> ReplayReport {
    let mut report = ReplayReport::default();

    while self.inner.connectivity.is_online() {
      let next = self
        .lock()
        .live
        .values()
        .find(|m| m.state == MutationState::Paused)
        .map(|m| m.id);
      let Some(id) = next else {
        break;
      };

      info!(%id, "replaying paused mutation");
      match self.commit(id).await {
        MutationOutcome::Committed => report.committed += 1,
        MutationOutcome::Failed(_) => report.failed += 1,
        MutationOutcome::Queued => break,
      }
    }

    report.remaining = self.paused().len();
    if report.committed + report.failed > 0 {
      info!(?report, "replay finished");
    }
    report
  }

  /// Replay automatically whenever connectivity comes back.
  pub fn start(&self) -> JoinHandle<()> {
    let coordinator = self.clone();
    let mut online = self.inner.connectivity.watch();
    tokio::spawn(async move {
      while online.changed().await.is_ok() {
        let is_online = *online.borrow_and_update();
        if is_online {
          coordinator.resume_paused().await;
        }
      }
    })
  }

  /// Re-queue mutations loaded from disk. They keep their ids; new ids
  /// continue after the highest one.
  pub fn restore(&self, mutations: Vec<Mutation>) -> usize {
    let cache = &self.inner.cache;
    let epoch = cache.epoch();
    let mut queue = self.lock();
    let mut restored = 0;
    for mut mutation in mutations {
      if queue.live.contains_key(&mutation.id) {
        continue;
      }
      mutation.state = MutationState::Paused;
      mutation.epoch = Some(epoch);
      cache.hold(&mutation.target_key);
      queue.next_id = queue.next_id.max(mutation.id.0 + 1);
      queue.live.insert(mutation.id, mutation);
      restored += 1;
    }
    restored
  }

  /// Drop every paused mutation (logout). Mutations already committing
  /// finish on their own against the torn-down cache; one that would be
  /// paused is dropped instead.
  pub fn clear_paused(&self) -> usize {
    let mut queue = self.lock();
    let paused: Vec<MutationId> = queue
      .live
      .values()
      .filter(|m| m.state == MutationState::Paused)
      .map(|m| m.id)
      .collect();
    for id in &paused {
      if let Some(mutation) = queue.live.remove(id) {
        self.inner.cache.release(&mutation.target_key);
      }
    }
    paused.len()
  }

  /// Paused mutations in creation order.
  pub fn paused(&self) -> Vec<Mutation> {
    self
      .lock()
      .live
      .values()
      .filter(|m| m.state == MutationState::Paused)
      .cloned()
      .collect()
  }

  /// Look up a live or recently settled mutation.
  pub fn mutation(&self, id: MutationId) -> Option<Mutation> {
    let queue = self.lock();
    queue
      .live
      .get(&id)
      .or_else(|| queue.settled.iter().rev().find(|m| m.id == id))
      .cloned()
  }

  /// Id of the most recently created mutation.
  pub fn last_id(&self) -> Option<MutationId> {
    self.lock().next_id.checked_sub(1).map(MutationId)
  }

  pub fn last_error(&self) -> Option<String> {
    self.lock().last_error.clone()
  }

  pub fn live_count(&self) -> usize {
    self.lock().live.len()
  }
}
