//! The sync engine: one constructed object owning the cache, the mutation
//! queue, connectivity, the session and persistence, with an explicit
//! `init` / `teardown` / `logout` lifecycle.

use color_eyre::Result;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{fetcher, EntityCache, Fetcher, QueryKey, ReadOptions};
use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::gateway::{RemoteGateway, RequestOptions};
use crate::mutation::{MutationCoordinator, MutationOutcome, MutationRequest};
use crate::persist::{KeyValueStore, PersistSettings, PersistenceBridge, RestoreOutcome};
use crate::query::EntityCollection;
use crate::retry::RetryPolicy;
use crate::session::{SessionStore, UnauthorizedHandler};

/// Tunables of a [`SyncEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
  /// Default read policy; `enabled` is derived from the session
  pub read: ReadOptions,
  pub gc_interval: Duration,
  pub retry: RetryPolicy,
  pub persist: PersistSettings,
  /// Reachability polling period; `None` disables the prober
  pub probe_interval: Option<Duration>,
  /// Never touch the network
  pub offline: bool,
}

impl Default for EngineSettings {
  fn default() -> Self {
    Self {
      read: ReadOptions::default(),
      gc_interval: Duration::from_secs(60),
      retry: RetryPolicy::default(),
      persist: PersistSettings::default(),
      probe_interval: Some(Duration::from_secs(5)),
      offline: false,
    }
  }
}

struct EngineInner {
  cache: EntityCache,
  coordinator: MutationCoordinator,
  connectivity: ConnectivityMonitor,
  session: SessionStore,
  bridge: PersistenceBridge,
  gateway: Arc<dyn RemoteGateway>,
  settings: EngineSettings,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SyncEngine {
  inner: Arc<EngineInner>,
}

impl SyncEngine {
  pub fn new(
    gateway: Arc<dyn RemoteGateway>,
    store: Arc<dyn KeyValueStore>,
    settings: EngineSettings,
  ) -> Self {
    let cache = EntityCache::new(settings.retry);
    let connectivity = ConnectivityMonitor::new(!settings.offline);
    let session = SessionStore::load(Arc::clone(&store));
    let coordinator = MutationCoordinator::new(
      cache.clone(),
      Arc::clone(&gateway),
      connectivity.clone(),
      session.clone(),
      settings.retry,
    );
    let bridge = PersistenceBridge::new(cache.clone(), coordinator.clone(), store, settings.persist);

    // Any 401 ends the session; cached data stays visible but reads stop.
    let on_unauthorized: UnauthorizedHandler = {
      let session = session.clone();
      Arc::new(move || {
        warn!("server rejected the session token, signing out");
        session.clear();
      })
    };
    cache.set_unauthorized_handler(Arc::clone(&on_unauthorized));
    coordinator.set_unauthorized_handler(on_unauthorized);

    Self {
      inner: Arc::new(EngineInner {
        cache,
        coordinator,
        connectivity,
        session,
        bridge,
        gateway,
        settings,
        tasks: Mutex::new(Vec::new()),
      }),
    }
  }

  /// Restore the persisted snapshot, find out whether the server is
  /// reachable, start the background tasks and replay paused mutations.
  ///
  /// Must be called within a Tokio runtime.
  pub async fn init(&self) -> RestoreOutcome {
    let inner = &self.inner;
    let restored = inner.bridge.restore();

    if !inner.settings.offline {
      inner.connectivity.probe(inner.gateway.as_ref()).await;
    }

    let mut tasks = vec![
      inner.bridge.spawn(),
      inner.coordinator.start(),
      inner.cache.spawn_gc(inner.settings.gc_interval),
    ];
    match inner.settings.probe_interval {
      Some(interval) if !inner.settings.offline => {
        tasks.push(
          inner
            .connectivity
            .spawn_prober(Arc::clone(&inner.gateway), interval),
        );
      }
      _ => {}
    }
    inner
      .tasks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .extend(tasks);

    if inner.connectivity.is_online() {
      let report = inner.coordinator.resume_paused().await;
      if report.remaining > 0 {
        info!(remaining = report.remaining, "some mutations are still paused");
      }
    }
    info!(online = inner.connectivity.is_online(), ?restored, "sync engine started");
    restored
  }

  /// Stop background tasks and flush the snapshot one last time.
  pub fn teardown(&self) {
    let tasks: Vec<JoinHandle<()>> = self
      .inner
      .tasks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .drain(..)
      .collect();
    for task in tasks {
      task.abort();
    }
    if let Err(e) = self.inner.bridge.persist_now() {
      warn!(error = %e, "failed to flush cache snapshot on shutdown");
    }
    info!("sync engine stopped");
  }

  /// Forget everything tied to the signed-in user: cached data, the
  /// session, paused mutations and the stored snapshot.
  pub fn logout(&self) {
    self.inner.cache.teardown();
    self.inner.session.clear();
    let dropped = self.inner.coordinator.clear_paused();
    self.inner.bridge.clear();
    info!(dropped, "logged out");
  }

  /// Store a fresh session token and let reads reach the server again.
  pub fn sign_in(&self, token: String) -> Result<()> {
    self.inner.session.sign_in(token)?;
    self.inner.cache.set_reads_enabled(true);
    Ok(())
  }

  /// Read policy for the current session and connectivity.
  pub fn read_options(&self) -> ReadOptions {
    let enabled = self.inner.session.is_authenticated() && self.inner.connectivity.is_online();
    self.inner.settings.read.enabled(enabled)
  }

  /// Fetcher that GETs `endpoint` with the current session token.
  pub fn gateway_fetcher(&self, endpoint: impl Into<String>) -> Fetcher {
    let endpoint = endpoint.into();
    let gateway = Arc::clone(&self.inner.gateway);
    let session = self.inner.session.clone();
    fetcher(move || {
      let gateway = Arc::clone(&gateway);
      let endpoint = endpoint.clone();
      let options = RequestOptions::get().with_token(session.token());
      async move {
        let data = gateway.request(&endpoint, options).await.into_result()?;
        Ok(data.unwrap_or(Value::Null))
      }
    })
  }

  /// Subscribe to the collection under `key`, fetched from `endpoint`.
  pub fn use_entity_collection<T: DeserializeOwned>(
    &self,
    key: QueryKey,
    endpoint: impl Into<String>,
  ) -> EntityCollection<T> {
    EntityCollection::new(
      self.inner.cache.clone(),
      key,
      self.gateway_fetcher(endpoint),
      self.read_options(),
    )
  }

  /// Apply, commit and reconcile a write. `true` unless it was rolled back.
  pub async fn mutate(&self, request: MutationRequest) -> bool {
    self.submit(request).await.is_success()
  }

  /// Like [`mutate`](Self::mutate), with the full outcome.
  pub async fn submit(&self, request: MutationRequest) -> MutationOutcome {
    if !self.inner.session.is_authenticated() {
      return MutationOutcome::Failed("not signed in".to_string());
    }
    self.inner.coordinator.mutate(request).await
  }

  pub fn is_online(&self) -> bool {
    self.inner.connectivity.is_online()
  }

  pub fn subscribe_online_status<F>(&self, callback: F) -> Subscription
  where
    F: Fn(bool) + Send + Sync + 'static,
  {
    self.inner.connectivity.subscribe(callback)
  }

  pub fn cache(&self) -> &EntityCache {
    &self.inner.cache
  }

  pub fn coordinator(&self) -> &MutationCoordinator {
    &self.inner.coordinator
  }

  pub fn session(&self) -> &SessionStore {
    &self.inner.session
  }

  pub fn connectivity(&self) -> &ConnectivityMonitor {
    &self.inner.connectivity
  }

  pub fn gateway(&self) -> &Arc<dyn RemoteGateway> {
    &self.inner.gateway
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheStatus;
  use crate::connectivity::HEALTH_ENDPOINT;
  use crate::gateway::{GatewayResponse, Method};
  use crate::mutation::{MutationKind, OptimisticOp};
  use crate::persist::{MemoryKeyStore, SNAPSHOT_STORAGE_KEY};
  use crate::test_support::ScriptedGateway;
  use pretty_assertions::assert_eq;
  use serde_json::json;

  fn settings() -> EngineSettings {
    EngineSettings {
      retry: RetryPolicy::none(),
      probe_interval: None,
      ..EngineSettings::default()
    }
  }

  fn entries() -> QueryKey {
    QueryKey::from(["entries", "list"])
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

  fn signed_in(gateway: Arc<ScriptedGateway>, store: Arc<dyn KeyValueStore>) -> SyncEngine {
    let engine = SyncEngine::new(gateway, store, settings());
    engine.session().sign_in("token".into()).unwrap();
    engine
  }

  #[tokio::test]
  async fn test_restart_replays_paused_mutations_once_online() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyStore::new());

    // First run: offline, queue a delete.
    let offline = ScriptedGateway::shared();
    offline.on_get(HEALTH_ENDPOINT, GatewayResponse::network_error("down"));
    let engine = signed_in(offline.clone(), Arc::clone(&store));
    engine.init().await;
    assert!(!engine.is_online());
    engine.cache().write(&entries(), |_| Some(json!([{"id": 5}])));
    assert!(engine.mutate(delete(5)).await);
    engine.teardown();

    // Second run: server is back.
    let online = ScriptedGateway::shared();
    online.on_get(HEALTH_ENDPOINT, GatewayResponse::ok(200, Some(json!({"ok": true}))));
    online.respond(Method::Delete, "/api/entries/5", GatewayResponse::ok(200, None));
    let engine = SyncEngine::new(online.clone(), store, settings());
    let restored = engine.init().await;

    assert_eq!(
      restored,
      RestoreOutcome::Restored {
        entries: 0,
        mutations: 1
      }
    );
    assert!(engine.is_online());
    assert_eq!(online.call_log(), vec!["DELETE /api/entries/5".to_string()]);
    assert_eq!(
      online.calls().last().unwrap().token.as_deref(),
      Some("token")
    );
    assert!(engine.coordinator().paused().is_empty());
    engine.teardown();
  }

  #[tokio::test]
  async fn test_logout_clears_cache_session_queue_and_snapshot() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyStore::new());
    let gateway = ScriptedGateway::shared();
    let engine = SyncEngine::new(
      gateway,
      Arc::clone(&store),
      EngineSettings {
        offline: true,
        ..settings()
      },
    );
    engine.session().sign_in("token".into()).unwrap();
    engine.init().await;
    engine.cache().write(&entries(), |_| Some(json!([{"id": 1}])));
    engine.mutate(delete(1)).await;
    engine.teardown();
    assert!(store.get_item(SNAPSHOT_STORAGE_KEY).unwrap().is_some());

    engine.logout();

    assert!(engine.cache().keys().is_empty());
    assert!(!engine.session().is_authenticated());
    assert!(engine.coordinator().paused().is_empty());
    assert_eq!(store.get_item(SNAPSHOT_STORAGE_KEY).unwrap(), None);
  }

  #[tokio::test]
  async fn test_unauthorized_read_signs_out_but_keeps_data() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyStore::new());
    let gateway = ScriptedGateway::shared();
    gateway.on_get("/api/entries", GatewayResponse::failed(401, "expired"));
    let engine = signed_in(gateway, store);
    engine.cache().write(&entries(), |_| Some(json!([{"id": 1}])));

    let entry = engine
      .cache()
      .fetch(&entries(), engine.gateway_fetcher("/api/entries"), engine.read_options())
      .await;

    assert_eq!(entry.status, CacheStatus::Error);
    assert_eq!(entry.data, Some(json!([{"id": 1}])));
    assert!(!engine.session().is_authenticated());
    assert!(!engine.read_options().enabled);
  }

  #[tokio::test]
  async fn test_reads_stay_off_the_network_after_401_until_sign_in() {
    let gateway = ScriptedGateway::shared();
    gateway.respond_once(
      Method::Get,
      "/api/entries",
      GatewayResponse::ok(200, Some(json!([{"id": 1, "text": "a"}]))),
    );
    gateway.respond_once(Method::Get, "/api/entries", GatewayResponse::failed(401, "expired"));
    gateway.on_get("/api/entries", GatewayResponse::ok(200, Some(json!([{"id": 2, "text": "b"}]))));
    let engine = signed_in(gateway.clone(), Arc::new(MemoryKeyStore::new()));

    let mut collection: EntityCollection<Vec<serde_json::Value>> =
      engine.use_entity_collection(entries(), "/api/entries");
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.cache().invalidate(&entries());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!engine.session().is_authenticated());
    assert!(!engine.cache().reads_enabled());

    engine.cache().invalidate(&entries());
    collection.refetch();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(gateway.count(Method::Get, "/api/entries"), 2);
    assert_eq!(
      engine.cache().data(&entries()),
      Some(json!([{"id": 1, "text": "a"}]))
    );

    engine.sign_in("fresh".into()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(gateway.count(Method::Get, "/api/entries"), 3);
    assert_eq!(gateway.calls().last().unwrap().token.as_deref(), Some("fresh"));
    assert_eq!(
      engine.cache().data(&entries()),
      Some(json!([{"id": 2, "text": "b"}]))
    );
  }

  #[tokio::test]
  async fn test_signed_out_engine_neither_reads_nor_writes() {
    let gateway = ScriptedGateway::shared();
    let engine = SyncEngine::new(gateway.clone(), Arc::new(MemoryKeyStore::new()), settings());

    let collection: EntityCollection<Vec<serde_json::Value>> =
      engine.use_entity_collection(entries(), "/api/entries");
    let outcome = engine.submit(delete(1)).await;

    assert!(!collection.is_fetching());
    assert_eq!(outcome, MutationOutcome::Failed("not signed in".into()));
    assert!(gateway.calls().is_empty());
  }

  #[tokio::test]
  async fn test_online_status_subscription() {
    let gateway = ScriptedGateway::shared();
    let engine = SyncEngine::new(gateway, Arc::new(MemoryKeyStore::new()), settings());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = engine.subscribe_online_status(move |online| sink.lock().unwrap().push(online));

    engine.connectivity().set_online(false);
    engine.connectivity().set_online(true);

    assert_eq!(*seen.lock().unwrap(), vec![false, true]);
  }
}
