//! Connectivity monitor.
//!
//! Holds the single authoritative "are we online" flag. Platform signals
//! (or the reachability prober) feed it through [`ConnectivityMonitor::set_online`];
//! listeners are told about actual transitions only, never about a repeat of
//! the current state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::gateway::{RemoteGateway, RequestOptions};

/// Endpoint polled by the prober.
pub const HEALTH_ENDPOINT: &str = "/api/health";

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

struct Shared {
  state: watch::Sender<bool>,
  listeners: Mutex<Vec<(u64, Listener)>>,
  next_listener: AtomicU64,
}

/// Online/offline flag with subscriptions.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  shared: Arc<Shared>,
}

impl ConnectivityMonitor {
  pub fn new(online: bool) -> Self {
    let (state, _) = watch::channel(online);
    Self {
      shared: Arc::new(Shared {
        state,
        listeners: Mutex::new(Vec::new()),
        next_listener: AtomicU64::new(0),
      }),
    }
  }

  /// Current snapshot.
  pub fn is_online(&self) -> bool {
    *self.shared.state.borrow()
  }

  /// Feed a new platform signal. Returns true if this was a transition.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.shared.state.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });

    if changed {
      info!(online, "connectivity changed");
      // Snapshot the listeners so callbacks may subscribe or unsubscribe.
      let listeners: Vec<Listener> = self
        .shared
        .listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(_, cb)| Arc::clone(cb))
        .collect();
      for cb in listeners {
        cb(online);
      }
    }
    changed
  }

  /// Register `callback` for every transition. Dropping (or calling
  /// `unsubscribe` on) the returned handle removes it.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(bool) + Send + Sync + 'static,
  {
    let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
    self
      .shared
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push((id, Arc::new(callback)));
    Subscription {
      shared: Arc::clone(&self.shared),
      id: Some(id),
    }
  }

  /// Async view of the flag, for tasks that await transitions.
  pub fn watch(&self) -> watch::Receiver<bool> {
    self.shared.state.subscribe()
  }

  /// Ask the server once whether it is reachable and record the answer.
  pub async fn probe(&self, gateway: &dyn RemoteGateway) -> bool {
    let resp = gateway.request(HEALTH_ENDPOINT, RequestOptions::get()).await;
    let reachable = resp.status != 0;
    debug!(status = resp.status, reachable, "connectivity probe");
    self.set_online(reachable);
    reachable
  }

  /// Poll the server at `interval` for as long as the task lives.
  pub fn spawn_prober(&self, gateway: Arc<dyn RemoteGateway>, interval: Duration) -> JoinHandle<()> {
    let monitor = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        monitor.probe(gateway.as_ref()).await;
      }
    })
  }
}

impl Default for ConnectivityMonitor {
  fn default() -> Self {
    Self::new(true)
  }
}

/// Handle returned by [`ConnectivityMonitor::subscribe`].
#[must_use = "dropping the subscription unsubscribes the callback"]
pub struct Subscription {
  shared: Arc<Shared>,
  id: Option<u64>,
}

impl Subscription {
  pub fn unsubscribe(mut self) {
    self.remove();
  }

  fn remove(&mut self) {
    if let Some(id) = self.id.take() {
      self
        .shared
        .listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|(listener, _)| *listener != id);
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.remove();
  }
}
