//! Typed client for the notes service on top of the sync engine.

use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::cache::Record;
use crate::engine::SyncEngine;
use crate::gateway::{Method, RequestOptions};
use crate::mutation::{fields, MutationKind, MutationOutcome, MutationRequest, OptimisticOp, PlaceholderIds};
use crate::query::{CollectionState, EntityCollection};

use super::keys::{collection_endpoint, list_key, record_endpoint};
use super::types::{AuthToken, Credentials, Entry, FileMetadata};

const LOGIN_ENDPOINT: &str = "/api/auth/login";
const REGISTER_ENDPOINT: &str = "/api/auth/register";

/// Notes client with optimistic writes and offline support.
///
/// Reads go through the entity cache; writes go through the mutation
/// coordinator, so they show up immediately and survive going offline.
#[derive(Clone)]
pub struct NotesClient {
  engine: SyncEngine,
  placeholders: Arc<PlaceholderIds>,
}

impl NotesClient {
  pub fn new(engine: SyncEngine) -> Self {
    Self {
      engine,
      placeholders: Arc::new(PlaceholderIds::new()),
    }
  }

  pub fn engine(&self) -> &SyncEngine {
    &self.engine
  }

  /// Live view of the entry list.
  pub fn entries(&self) -> EntityCollection<Vec<Entry>> {
    self.collection::<Entry>()
  }

  /// Live view of the file list.
  pub fn files(&self) -> EntityCollection<Vec<FileMetadata>> {
    self.collection::<FileMetadata>()
  }

  fn collection<R: Record>(&self) -> EntityCollection<Vec<R>> {
    self
      .engine
      .use_entity_collection(list_key::<R>(), collection_endpoint::<R>())
  }

  /// Entry list, waiting for a refresh when the cached copy is stale.
  pub async fn list_entries(&self) -> CollectionState<Vec<Entry>> {
    self.load::<Entry>().await
  }

  pub async fn list_files(&self) -> CollectionState<Vec<FileMetadata>> {
    self.load::<FileMetadata>().await
  }

  async fn load<R: Record>(&self) -> CollectionState<Vec<R>> {
    let entry = self
      .engine
      .cache()
      .fetch(
        &list_key::<R>(),
        self.engine.gateway_fetcher(collection_endpoint::<R>()),
        self.engine.read_options(),
      )
      .await;
    CollectionState::from_entry(&entry)
  }

  /// Create an entry. It appears at the top of the list with a placeholder
  /// id until the server confirms it.
  pub async fn create_entry(&self, text: &str) -> MutationOutcome {
    let placeholder = Entry {
      id: self.placeholders.next(),
      text: text.to_string(),
    };
    let record = match serde_json::to_value(&placeholder) {
      Ok(record) => record,
      Err(e) => return MutationOutcome::Failed(e.to_string()),
    };
    self
      .engine
      .submit(MutationRequest {
        kind: MutationKind::Create,
        target_key: list_key::<Entry>(),
        method: Method::Post,
        endpoint: collection_endpoint::<Entry>(),
        payload: Some(json!({ "text": text })),
        optimistic: OptimisticOp::Prepend { record },
      })
      .await
  }

  pub async fn update_entry(&self, id: i64, text: &str) -> MutationOutcome {
    let changes = fields([("text", json!(text))]);
    self.patch::<Entry>(Method::Put, id, changes).await
  }

  pub async fn delete_entry(&self, id: i64) -> MutationOutcome {
    self.remove::<Entry>(id).await
  }

  /// Set or clear the description of an uploaded file.
  pub async fn update_file_description(&self, id: i64, description: Option<&str>) -> MutationOutcome {
    let changes = fields([("description", json!(description))]);
    self.patch::<FileMetadata>(Method::Patch, id, changes).await
  }

  pub async fn delete_file(&self, id: i64) -> MutationOutcome {
    self.remove::<FileMetadata>(id).await
  }

  async fn patch<R: Record>(&self, method: Method, id: i64, changes: Value) -> MutationOutcome {
    self
      .engine
      .submit(MutationRequest {
        kind: MutationKind::Update,
        target_key: list_key::<R>(),
        method,
        endpoint: record_endpoint::<R>(id),
        payload: Some(changes.clone()),
        optimistic: OptimisticOp::Patch {
          id: json!(id),
          fields: changes,
        },
      })
      .await
  }

  async fn remove<R: Record>(&self, id: i64) -> MutationOutcome {
    self
      .engine
      .submit(MutationRequest {
        kind: MutationKind::Delete,
        target_key: list_key::<R>(),
        method: Method::Delete,
        endpoint: record_endpoint::<R>(id),
        payload: None,
        optimistic: OptimisticOp::Remove { id: json!(id) },
      })
      .await
  }

  /// Exchange credentials for a session token and keep it.
  pub async fn login(&self, username: &str, password: &str) -> Result<()> {
    let token = self.authenticate(LOGIN_ENDPOINT, username, password).await?;
    let token = token.ok_or_else(|| eyre!("Login response did not contain a token"))?;
    self.engine.sign_in(token)?;
    info!(username, "logged in");
    Ok(())
  }

  /// Create an account and sign in with it.
  pub async fn register(&self, username: &str, password: &str) -> Result<()> {
    match self.authenticate(REGISTER_ENDPOINT, username, password).await? {
      Some(token) => {
        self.engine.sign_in(token)?;
        info!(username, "registered");
        Ok(())
      }
      None => self.login(username, password).await,
    }
  }

  async fn authenticate(&self, endpoint: &str, username: &str, password: &str) -> Result<Option<String>> {
    let credentials = Credentials {
      username: username.to_string(),
      password: password.to_string(),
    };
    let body = serde_json::to_value(&credentials)?;
    let data = self
      .engine
      .gateway()
      .request(endpoint, RequestOptions::new(Method::Post).with_body(body))
      .await
      .into_result()
      .map_err(|e| eyre!("{} failed: {}", endpoint, e))?;

    Ok(
      data
        .and_then(|data| serde_json::from_value::<AuthToken>(data).ok())
        .map(|auth| auth.token),
    )
  }

  pub fn logout(&self) {
    self.engine.logout();
  }
}
