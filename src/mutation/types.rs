use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::optimistic::OptimisticOp;
use crate::cache::{CacheEpoch, QueryKey};
use crate::gateway::Method;

/// Creation-ordered mutation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(pub u64);

impl std::fmt::Display for MutationId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "m{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
  Create,
  Update,
  Delete,
}

/// Lifecycle of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationState {
  /// Created, optimistic update applied, not yet sent
  Pending,
  /// Waiting for connectivity; replayed on reconnect
  Paused,
  /// Gateway call outstanding
  Committing,
  /// Server accepted it
  Success,
  /// Server refused it; cache rolled back
  Error,
}

impl MutationState {
  /// Still able to affect the cache.
  pub fn is_live(&self) -> bool {
    matches!(
      self,
      MutationState::Pending | MutationState::Paused | MutationState::Committing
    )
  }
}

/// What a caller asks the coordinator to do.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
  pub kind: MutationKind,
  pub target_key: QueryKey,
  pub method: Method,
  pub endpoint: String,
  pub payload: Option<Value>,
  pub optimistic: OptimisticOp,
}

/// A single write, from optimistic apply to commit or rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
  pub id: MutationId,
  pub kind: MutationKind,
  pub target_key: QueryKey,
  pub method: Method,
  pub endpoint: String,
  pub payload: Option<Value>,
  pub optimistic: OptimisticOp,
  pub state: MutationState,
  /// Cached data captured right before the optimistic apply
  pub optimistic_snapshot: Option<Value>,
  pub created_at: DateTime<Utc>,
  pub attempts: u32,
  pub error: Option<String>,
  /// Cache generation the optimistic update was applied in
  #[serde(skip)]
  pub(crate) epoch: Option<CacheEpoch>,
  /// Commit counter at the time the snapshot was taken
  #[serde(skip)]
  pub(crate) commit_mark: u64,
  /// The snapshot was taken over a refresh that got cancelled
  #[serde(skip)]
  pub(crate) snapshot_unreconciled: bool,
}

/// How a `mutate` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
  /// The server accepted the write
  Committed,
  /// Offline: kept optimistically and queued for replay
  Queued,
  /// Rolled back; carries the message to show the user
  Failed(String),
}

impl MutationOutcome {
  /// The boolean the UI sees. A queued write is pending sync, not failed.
  pub fn is_success(&self) -> bool {
    !matches!(self, MutationOutcome::Failed(_))
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      MutationOutcome::Failed(message) => Some(message),
      _ => None,
    }
  }
}

/// Notification emitted whenever a mutation changes state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationEvent {
  pub id: MutationId,
  pub state: MutationState,
}

/// Summary of a replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
  pub committed: usize,
  pub failed: usize,
  pub remaining: usize,
}
