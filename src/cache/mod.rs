//! Client-resident entity cache.
//!
//! This module provides the in-memory half of the offline-first layer:
//! - Keys collections by a structural [`QueryKey`]
//! - Serves cached data immediately and revalidates stale data in the background
//! - Deduplicates concurrent fetches per key and lets writers discard in-flight results
//! - Accepts synchronous optimistic writes from the mutation coordinator

mod key;
mod store;
mod traits;

pub use key::QueryKey;
pub use store::{fetcher, CacheEpoch, EntityCache, FetchFuture, Fetcher, PersistedEntry};
pub use traits::{CacheEntry, CacheEvent, CacheStatus, ReadOptions, Record};
