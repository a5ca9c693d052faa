//! Durable local storage for the cache and the session.

mod bridge;
mod storage;

pub use bridge::{PersistSettings, PersistenceBridge, RestoreOutcome, SNAPSHOT_STORAGE_KEY};
pub use storage::{KeyValueStore, MemoryKeyStore, NoopKeyStore, SqliteKeyStore};
