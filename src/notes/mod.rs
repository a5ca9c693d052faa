//! Notes service domain: entries, file metadata and authentication.

mod client;
mod keys;
mod types;

pub use client::NotesClient;
pub use keys::{collection_endpoint, entries_key, files_key, list_key, record_endpoint};
pub use types::{AuthToken, Credentials, Entry, FileMetadata};
