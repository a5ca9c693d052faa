//! Authentication session held alongside (not inside) the entity cache.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

use crate::persist::KeyValueStore;

/// Hook invoked whenever the server answers 401.
pub type UnauthorizedHandler = Arc<dyn Fn() + Send + Sync>;

/// Key under which the session token is persisted.
pub const SESSION_STORAGE_KEY: &str = "auth.session";

/// Bearer token of the signed-in user, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
  pub token: Option<String>,
}

impl AuthSession {
  pub fn is_authenticated(&self) -> bool {
    self.token.is_some()
  }
}

/// Shared, persisted session state.
#[derive(Clone)]
pub struct SessionStore {
  session: Arc<RwLock<AuthSession>>,
  store: Arc<dyn KeyValueStore>,
}

impl SessionStore {
  /// Load the persisted session. A missing or unreadable record means
  /// "signed out".
  pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
    let session = match store.get_item(SESSION_STORAGE_KEY) {
      Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(error = %e, "ignoring unreadable session record");
        AuthSession::default()
      }),
      Ok(None) => AuthSession::default(),
      Err(e) => {
        warn!(error = %e, "failed to read session record");
        AuthSession::default()
      }
    };

    Self {
      session: Arc::new(RwLock::new(session)),
      store,
    }
  }

  pub fn snapshot(&self) -> AuthSession {
    self
      .session
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn token(&self) -> Option<String> {
    self.snapshot().token
  }

  pub fn is_authenticated(&self) -> bool {
    self.snapshot().is_authenticated()
  }

  /// Start a session with `token` and persist it.
  pub fn sign_in(&self, token: String) -> Result<()> {
    let session = AuthSession { token: Some(token) };
    self
      .store
      .set_item(SESSION_STORAGE_KEY, &serde_json::to_string(&session)?)?;
    *self
      .session
      .write()
      .unwrap_or_else(PoisonError::into_inner) = session;
    info!("signed in");
    Ok(())
  }

  /// Drop the session in memory and on disk.
  pub fn clear(&self) {
    let was_authenticated = {
      let mut session = self
        .session
        .write()
        .unwrap_or_else(PoisonError::into_inner);
      let was = session.is_authenticated();
      *session = AuthSession::default();
      was
    };
    if let Err(e) = self.store.remove_item(SESSION_STORAGE_KEY) {
      warn!(error = %e, "failed to remove session record");
    }
    if was_authenticated {
      info!("session cleared");
    }
  }

  /// Use `token` for this process only (e.g. from an environment variable).
  pub fn override_token(&self, token: String) {
    *self
      .session
      .write()
      .unwrap_or_else(PoisonError::into_inner) = AuthSession { token: Some(token) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::persist::MemoryKeyStore;

  #[test]
  fn test_sign_in_persists_across_loads() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyStore::new());

    let session = SessionStore::load(Arc::clone(&store));
    assert!(!session.is_authenticated());
    session.sign_in("abc".into()).unwrap();

    let reloaded = SessionStore::load(Arc::clone(&store));
    assert_eq!(reloaded.token().as_deref(), Some("abc"));

    reloaded.clear();
    assert!(!reloaded.is_authenticated());
    assert!(!SessionStore::load(store).is_authenticated());
  }

  #[test]
  fn test_corrupt_record_means_signed_out() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyStore::new());
    store.set_item(SESSION_STORAGE_KEY, "{not json").unwrap();

    assert!(!SessionStore::load(store).is_authenticated());
  }

  #[test]
  fn test_override_is_not_persisted() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyStore::new());
    let session = SessionStore::load(Arc::clone(&store));

    session.override_token("env-token".into());

    assert!(session.is_authenticated());
    assert!(!SessionStore::load(store).is_authenticated());
  }
}
