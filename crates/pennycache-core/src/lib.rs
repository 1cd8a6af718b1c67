//! Offline-first caching and sync layer for the PennyPilot expense tracker.
//!
//! Screens read through `hooks::Queries` (stale-while-revalidate over a
//! shared `cache::CacheStore`) and write through `hooks::Mutations`, which
//! invalidate the affected queries once the remote store accepts a write.
//! `SyncContext` ties the cache, its persistence and the signed-in session
//! together for one app run.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod hooks;
pub mod models;
pub mod utils;

#[cfg(test)]
mod testing;

pub use api::{ApiClient, ApiError, RemoteStore};
pub use auth::{Session, SessionData, SessionProvider};
pub use cache::{CacheConfig, CacheError, CacheStore, QueryKey, QueryState};
pub use config::Config;
pub use context::{watch_session, SyncContext};
pub use hooks::{
    ExpenseCache, MutationError, MutationKind, Mutations, Queries, QueryData, QueryKind,
    QueryResult, DEFAULT_TRANSACTION_LIMIT,
};
