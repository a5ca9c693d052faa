//! Scripted gateway used by unit tests.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::gateway::{GatewayResponse, Method, RemoteGateway, RequestOptions};

/// A request the scripted gateway received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
  pub method: Method,
  pub endpoint: String,
  pub body: Option<Value>,
  pub token: Option<String>,
}

struct Scripted {
  response: GatewayResponse,
  delay: Option<Duration>,
  gate: Option<Arc<Notify>>,
}

#[derive(Default)]
struct Routes {
  once: HashMap<(Method, String), VecDeque<Scripted>>,
  sticky: HashMap<(Method, String), GatewayResponse>,
}

/// In-memory gateway answering from a script.
///
/// One-shot responses are consumed in order; afterwards the sticky
/// response for the route (if any) is returned; otherwise a 404.
#[derive(Default)]
pub struct ScriptedGateway {
  routes: Mutex<Routes>,
  calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedGateway {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn shared() -> Arc<Self> {
    Arc::new(Self::new())
  }

  /// Answer every call to the route with `response`.
  pub fn respond(&self, method: Method, endpoint: &str, response: GatewayResponse) {
    self
      .routes
      .lock()
      .unwrap()
      .sticky
      .insert((method, endpoint.to_string()), response);
  }

  pub fn on_get(&self, endpoint: &str, response: GatewayResponse) {
    self.respond(Method::Get, endpoint, response);
  }

  /// Answer the next call to the route with `response`.
  pub fn respond_once(&self, method: Method, endpoint: &str, response: GatewayResponse) {
    self.push(method, endpoint, Scripted {
      response,
      delay: None,
      gate: None,
    });
  }

  /// Answer the next call after sleeping for `delay`.
  pub fn respond_once_after(
    &self,
    method: Method,
    endpoint: &str,
    response: GatewayResponse,
    delay: Duration,
  ) {
    self.push(method, endpoint, Scripted {
      response,
      delay: Some(delay),
      gate: None,
    });
  }

  /// Answer the next call only once the returned gate is notified.
  pub fn respond_once_gated(
    &self,
    method: Method,
    endpoint: &str,
    response: GatewayResponse,
  ) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    self.push(method, endpoint, Scripted {
      response,
      delay: None,
      gate: Some(Arc::clone(&gate)),
    });
    gate
  }

  fn push(&self, method: Method, endpoint: &str, scripted: Scripted) {
    self
      .routes
      .lock()
      .unwrap()
      .once
      .entry((method, endpoint.to_string()))
      .or_default()
      .push_back(scripted);
  }

  pub fn calls(&self) -> Vec<RecordedCall> {
    self.calls.lock().unwrap().clone()
  }

  pub fn count(&self, method: Method, endpoint: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|c| c.method == method && c.endpoint == endpoint)
      .count()
  }

  /// Calls other than health probes, as "METHOD endpoint" strings.
  pub fn call_log(&self) -> Vec<String> {
    self
      .calls()
      .into_iter()
      .filter(|c| c.endpoint != crate::connectivity::HEALTH_ENDPOINT)
      .map(|c| format!("{} {}", c.method, c.endpoint))
      .collect()
  }

  fn next(&self, method: Method, endpoint: &str) -> Scripted {
    let mut routes = self.routes.lock().unwrap();
    let key = (method, endpoint.to_string());
    if let Some(scripted) = routes.once.get_mut(&key).and_then(VecDeque::pop_front) {
      return scripted;
    }
    let response = routes
      .sticky
      .get(&key)
      .cloned()
      .unwrap_or_else(|| GatewayResponse::failed(404, format!("no route for {} {}", method, endpoint)));
    Scripted {
      response,
      delay: None,
      gate: None,
    }
  }
}

impl RemoteGateway for ScriptedGateway {
  fn request<'a>(
    &'a self,
    endpoint: &'a str,
    options: RequestOptions,
  ) -> BoxFuture<'a, GatewayResponse> {
    self.calls.lock().unwrap().push(RecordedCall {
      method: options.method,
      endpoint: endpoint.to_string(),
      body: options.body.clone(),
      token: options.token.clone(),
    });
    let scripted = self.next(options.method, endpoint);

    async move {
      if let Some(gate) = scripted.gate {
        gate.notified().await;
      }
      if let Some(delay) = scripted.delay {
        tokio::time::sleep(delay).await;
      }
      scripted.response
    }
    .boxed()
  }
}
