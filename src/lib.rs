//! Offline-first client for the notes/files service.
//!
//! The [`engine::SyncEngine`] owns an optimistic entity cache, a mutation
//! coordinator that reconciles local writes with the server, a connectivity
//! monitor and a persistence bridge that keeps both across restarts.
//! [`notes::NotesClient`] puts the notes domain on top of it.

pub mod app;
pub mod cache;
pub mod commands;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod mutation;
pub mod notes;
pub mod persist;
pub mod query;
pub mod retry;
pub mod session;

#[cfg(test)]
mod test_support;
