//! Query cache for offline-first reads.
//!
//! This module provides the `CacheStore`, a keyed in-memory table of query
//! results with stale-while-revalidate reads, in-flight fetch deduplication
//! and prefix invalidation, and the `Persister` that mirrors the table to a
//! single JSON blob so cached data survives restarts.
//!
//! Entries are identified by a `QueryKey` (entity kind, owning user and any
//! parameters). Staleness is decided per read from the entry's `fetched_at`
//! and the caller's stale time.

pub mod clock;
pub mod config;
pub mod error;
pub mod key;
pub mod persist;
pub mod retry;
pub mod state;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use error::{CacheError, PersistError};
pub use key::{KeyPart, QueryKey};
pub use persist::{Persister, STORAGE_KEY};
pub use retry::RetryPolicy;
pub use state::QueryState;
pub use store::{CacheStore, EntrySnapshot, Fetcher};
