//! Query keys and cache bindings for the notes service.

use crate::cache::{QueryKey, Record};

use super::types::{Entry, FileMetadata};

impl Record for Entry {
  fn collection() -> &'static str {
    "entries"
  }
}

impl Record for FileMetadata {
  fn collection() -> &'static str {
    "files"
  }
}

/// Key of the full list of a record type, e.g. `["entries", "list"]`.
pub fn list_key<R: Record>() -> QueryKey {
  QueryKey::from([R::collection(), "list"])
}

pub fn entries_key() -> QueryKey {
  list_key::<Entry>()
}

pub fn files_key() -> QueryKey {
  list_key::<FileMetadata>()
}

/// REST path of a single record, e.g. `/api/entries/7`.
pub fn record_endpoint<R: Record>(id: i64) -> String {
  format!("/api/{}/{}", R::collection(), id)
}

/// REST path of a record collection, e.g. `/api/files`.
pub fn collection_endpoint<R: Record>() -> String {
  format!("/api/{}", R::collection())
}
