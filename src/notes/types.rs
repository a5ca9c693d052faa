use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mutation::is_placeholder_id;

/// A personal text entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
  pub id: i64,
  pub text: String,
}

impl Entry {
  /// Created locally and not yet confirmed by the server
  pub fn is_pending(&self) -> bool {
    is_placeholder_id(self.id)
  }
}

/// Metadata of an uploaded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
  pub id: i64,
  pub original_name: String,
  pub stored_name: String,
  pub mime_type: String,
  pub size: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  pub user_id: i64,
  pub created_at: DateTime<Utc>,
}

/// Response of the login and register endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct AuthToken {
  pub token: String,
}

/// Credentials sent to the login and register endpoints
#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
  pub username: String,
  pub password: String,
}
