//! Optimistic updaters expressed as data.
//!
//! An [`OptimisticOp`] is a pure function from the cached collection to its
//! speculated next value. Keeping it as data lets paused mutations be
//! persisted and re-applied after a rollback of an earlier mutation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::warn;

/// Speculative change to a cached list of records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OptimisticOp {
  /// Insert `record` at the head of the list
  Prepend { record: Value },
  /// Merge `fields` into the record whose `id` matches
  Patch { id: Value, fields: Value },
  /// Drop the record whose `id` matches
  Remove { id: Value },
  /// Replace the whole value
  Replace { data: Option<Value> },
  /// Leave the cache untouched
  Keep,
}

impl OptimisticOp {
  /// Apply the op to the current cached value.
  pub fn apply(&self, current: Option<Value>) -> Option<Value> {
    match self {
      OptimisticOp::Keep => current,
      OptimisticOp::Replace { data } => data.clone(),
      OptimisticOp::Prepend { record } => match current {
        None | Some(Value::Null) => Some(Value::Array(vec![record.clone()])),
        Some(Value::Array(mut items)) => {
          items.insert(0, record.clone());
          Some(Value::Array(items))
        }
        Some(other) => {
          warn!("cannot prepend to a non-list value");
          Some(other)
        }
      },
      OptimisticOp::Patch { id, fields } => map_list(current, |items| {
        for item in items.iter_mut().filter(|item| item.get("id") == Some(id)) {
          merge_fields(item, fields);
        }
      }),
      OptimisticOp::Remove { id } => map_list(current, |items| {
        items.retain(|item| item.get("id") != Some(id));
      }),
    }
  }
}

fn map_list<F>(current: Option<Value>, f: F) -> Option<Value>
where
  F: FnOnce(&mut Vec<Value>),
{
  match current {
    Some(Value::Array(mut items)) => {
      f(&mut items);
      Some(Value::Array(items))
    }
    other => other,
  }
}

fn merge_fields(target: &mut Value, fields: &Value) {
  if let (Value::Object(target), Value::Object(fields)) = (target, fields) {
    for (name, value) in fields {
      target.insert(name.clone(), value.clone());
    }
  }
}

/// Source of temporary, clearly non-authoritative record ids.
///
/// Ids are negative and unique within the process; seeding from the clock
/// keeps them from colliding with placeholders restored from disk.
pub struct PlaceholderIds {
  next: AtomicI64,
}

impl PlaceholderIds {
  pub fn new() -> Self {
    Self {
      next: AtomicI64::new(-Utc::now().timestamp_millis().max(1)),
    }
  }

  pub fn starting_at(first: i64) -> Self {
    Self {
      next: AtomicI64::new(first.min(-1)),
    }
  }

  pub fn next(&self) -> i64 {
    self.next.fetch_sub(1, Ordering::Relaxed)
  }
}

impl Default for PlaceholderIds {
  fn default() -> Self {
    Self::new()
  }
}

/// Whether `id` was produced by [`PlaceholderIds`].
pub fn is_placeholder_id(id: i64) -> bool {
  id < 0
}

/// Build a JSON object from `(name, value)` pairs.
pub fn fields<I, K>(pairs: I) -> Value
where
  I: IntoIterator<Item = (K, Value)>,
  K: Into<String>,
{
  Value::Object(
    pairs
      .into_iter()
      .map(|(k, v)| (k.into(), v))
      .collect::<Map<String, Value>>(),
  )
}
