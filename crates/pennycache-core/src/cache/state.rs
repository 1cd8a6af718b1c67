use chrono::{DateTime, Utc};

use crate::utils::format_age;

use super::CacheError;

/// A consistent snapshot of one cache entry, as seen by readers and
/// subscribers.
#[derive(Debug, Clone)]
pub struct QueryState<V> {
    /// Last successfully fetched (or written) value.
    pub data: Option<V>,
    /// When `data` was fetched. Always set together with `data`.
    pub fetched_at: Option<DateTime<Utc>>,
    /// A fetch for this key is in flight.
    pub is_loading: bool,
    /// The entry was invalidated and will refetch on the next read.
    pub is_invalidated: bool,
    /// Error from the most recent fetch, cleared by the next success.
    pub error: Option<CacheError>,
}

impl<V> Default for QueryState<V> {
    fn default() -> Self {
        Self {
            data: None,
            fetched_at: None,
            is_loading: false,
            is_invalidated: false,
            error: None,
        }
    }
}

impl<V> QueryState<V> {
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> Option<i64> {
        self.fetched_at.map(|at| (now - at).num_minutes())
    }

    /// Human readable age of the data ("just now", "5m ago", "2h ago"),
    /// or "never" if nothing has been fetched.
    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        match self.age_minutes(now) {
            Some(minutes) => format_age(minutes),
            None => "never".to_string(),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> QueryState<U> {
        QueryState {
            data: self.data.map(f),
            fetched_at: self.fetched_at,
            is_loading: self.is_loading,
            is_invalidated: self.is_invalidated,
            error: self.error,
        }
    }
}
