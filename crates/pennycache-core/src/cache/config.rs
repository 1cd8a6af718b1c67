use std::time::Duration;

use super::RetryPolicy;

/// Stale time used when a caller does not pick one.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(2 * 60);

/// Unobserved entries are purged after this long without use.
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(5 * 60);

/// Persist at most once per this interval.
pub const DEFAULT_PERSIST_THROTTLE: Duration = Duration::from_secs(1);

/// Persisted entries older than this are not restored.
pub const DEFAULT_PERSIST_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Runtime configuration for the cache store and its persister.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_stale_time: Duration,
    pub gc_time: Duration,
    pub retry: RetryPolicy,
    pub persist_throttle: Duration,
    pub persist_max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_stale_time: DEFAULT_STALE_TIME,
            gc_time: DEFAULT_GC_TIME,
            retry: RetryPolicy::default(),
            persist_throttle: DEFAULT_PERSIST_THROTTLE,
            persist_max_age: DEFAULT_PERSIST_MAX_AGE,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_stale_time(mut self, stale_time: Duration) -> Self {
        self.default_stale_time = stale_time;
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_persist_throttle(mut self, throttle: Duration) -> Self {
        self.persist_throttle = throttle;
        self
    }

    pub fn with_persist_max_age(mut self, max_age: Duration) -> Self {
        self.persist_max_age = max_age;
        self
    }
}
