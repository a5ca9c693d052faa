//! Mutation reconciliation.
//!
//! Every write goes through the [`MutationCoordinator`]: the cache is
//! updated optimistically first, then the request is committed, paused
//! while offline, or rolled back when the server refuses it.

mod coordinator;
mod optimistic;
mod types;

pub use coordinator::MutationCoordinator;
pub use optimistic::{fields, is_placeholder_id, OptimisticOp, PlaceholderIds};
pub use types::{
  Mutation, MutationEvent, MutationId, MutationKind, MutationOutcome, MutationRequest,
  MutationState, ReplayReport,
};
