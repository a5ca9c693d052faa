//! Error taxonomy for the sync paths.
//!
//! Every gateway outcome that is not a 2xx is folded into a [`SyncError`].
//! The variant decides what the cache and the mutation coordinator do with
//! it: pause, roll back, retry or call the unauthorized hook.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified failure of a read or a commit.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncError {
  /// No HTTP response was received (status 0), or we are known to be offline.
  #[error("network unreachable: {0}")]
  Connectivity(String),

  /// The server rejected our credentials (401).
  #[error("unauthorized")]
  Unauthorized,

  /// The request was refused as invalid (4xx other than 401).
  #[error("{message}")]
  Validation { status: u16, message: String },

  /// The server failed (5xx). Eligible for bounded retry.
  #[error("server error ({status}): {message}")]
  Server { status: u16, message: String },

  /// The response arrived but its payload had an unexpected shape.
  #[error("invalid response: {0}")]
  Decode(String),
}

impl SyncError {
  /// Classify a gateway status code.
  pub fn from_status(status: u16, message: Option<String>) -> Self {
    let message = message.unwrap_or_else(|| default_message(status));
    match status {
      0 => Self::Connectivity(message),
      401 => Self::Unauthorized,
      500..=599 => Self::Server { status, message },
      _ => Self::Validation { status, message },
    }
  }

  /// Only server errors are retried automatically.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Server { .. })
  }

  pub fn is_connectivity(&self) -> bool {
    matches!(self, Self::Connectivity(_))
  }

  pub fn is_unauthorized(&self) -> bool {
    matches!(self, Self::Unauthorized)
  }

  /// The HTTP status this error was derived from (0 when none).
  pub fn status(&self) -> u16 {
    match self {
      Self::Connectivity(_) | Self::Decode(_) => 0,
      Self::Unauthorized => 401,
      Self::Validation { status, .. } | Self::Server { status, .. } => *status,
    }
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(err: serde_json::Error) -> Self {
    Self::Decode(err.to_string())
  }
}

fn default_message(status: u16) -> String {
  match status {
    0 => "no response from server".to_string(),
    400 => "bad request".to_string(),
    401 => "unauthorized".to_string(),
    403 => "forbidden".to_string(),
    404 => "not found".to_string(),
    409 => "conflict".to_string(),
    _ => format!("request failed with status {}", status),
  }
}
