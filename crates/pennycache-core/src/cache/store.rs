//! The in-memory query table.
//!
//! Every entry owns a `watch` channel holding its current `QueryState`, so
//! subscribers always observe a consistent {data, fetched_at} pair. All table
//! mutations happen under one lock and publish through the entry's channel
//! before the lock is released.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::api::ApiError;

use super::{CacheConfig, CacheError, Clock, QueryKey, QueryState, SystemClock};

/// Produces a fresh value for one query key.
pub struct Fetcher<V> {
    f: Arc<dyn Fn() -> BoxFuture<'static, Result<V, ApiError>> + Send + Sync>,
}

impl<V> Clone for Fetcher<V> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
        }
    }
}

impl<V> fmt::Debug for Fetcher<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Fetcher")
    }
}

impl<V: 'static> Fetcher<V> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, ApiError>> + Send + 'static,
    {
        Self {
            f: Arc::new(move || f().boxed()),
        }
    }

    fn call(&self) -> BoxFuture<'static, Result<V, ApiError>> {
        (self.f)()
    }
}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;

struct InFlight<V> {
    id: u64,
    result: SharedFetch<V>,
    abort: AbortHandle,
    /// Invalidated while this fetch was running; its result may predate
    /// the write that caused the invalidation.
    invalidated: bool,
    /// A value was written while this fetch was running. The written value
    /// wins over the fetch result.
    overwritten: bool,
}

struct CacheEntry<V> {
    state: watch::Sender<QueryState<V>>,
    in_flight: Option<InFlight<V>>,
    fetcher: Option<Fetcher<V>>,
    stale_time: Duration,
    last_used: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
    fn new(state: QueryState<V>, stale_time: Duration, now: DateTime<Utc>) -> Self {
        let (state, _) = watch::channel(state);
        Self {
            state,
            in_flight: None,
            fetcher: None,
            stale_time,
            last_used: now,
        }
    }

    fn subscribers(&self) -> usize {
        self.state.receiver_count()
    }

    fn needs_fetch(&self, now: DateTime<Utc>, stale_time: Duration) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        let state = self.state.borrow();
        if state.is_invalidated {
            return true;
        }
        match state.fetched_at {
            Some(at) => is_stale(now, at, stale_time),
            None => true,
        }
    }
}

/// Age of `at`, or `None` when it lies in the future.
fn age(now: DateTime<Utc>, at: DateTime<Utc>) -> Option<Duration> {
    (now - at).to_std().ok()
}

/// A fetch time in the future means the clock moved; it counts as stale.
fn is_stale(now: DateTime<Utc>, at: DateTime<Utc>, stale_time: Duration) -> bool {
    age(now, at).map_or(true, |age| age >= stale_time)
}

/// Persistable part of one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot<V> {
    pub key: QueryKey,
    pub data: V,
    pub fetched_at: DateTime<Utc>,
    pub invalidated: bool,
}

struct Inner<V> {
    entries: Mutex<HashMap<QueryKey, CacheEntry<V>>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    next_fetch_id: AtomicU64,
    version: watch::Sender<u64>,
}

/// Keyed table of query results with stale-while-revalidate reads.
///
/// Cloning is cheap and yields another handle to the same table. Operations
/// that may start a fetch (`read`, `fetch`, `invalidate`) spawn onto the
/// current Tokio runtime and must be called from within one.
pub struct CacheStore<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CacheStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                config,
                clock,
                next_fetch_id: AtomicU64::new(1),
                version,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, CacheEntry<V>>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn bump_version(&self) {
        self.inner.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    // ===== Reads =====

    /// Return the current state for `key` without waiting.
    ///
    /// Starts a background fetch when there is no data, the data is at
    /// least `stale_time` old, or the entry was invalidated, unless a fetch
    /// is already in flight. Prior data stays in the returned state while
    /// the fetch runs (`is_loading` is set).
    pub fn read(&self, key: &QueryKey, fetcher: Fetcher<V>, stale_time: Duration) -> QueryState<V> {
        self.ensure(key, fetcher, stale_time).0
    }

    /// Like `read`, but wait for the value.
    ///
    /// Fresh data is returned immediately; otherwise the caller joins the
    /// in-flight fetch for `key`, shared with every other waiter.
    pub async fn fetch(
        &self,
        key: &QueryKey,
        fetcher: Fetcher<V>,
        stale_time: Duration,
    ) -> Result<V, CacheError> {
        let (state, pending) = self.ensure(key, fetcher, stale_time);
        match pending {
            Some(pending) => pending.await,
            None => state.data.ok_or(CacheError::UnexpectedData),
        }
    }

    fn ensure(
        &self,
        key: &QueryKey,
        fetcher: Fetcher<V>,
        stale_time: Duration,
    ) -> (QueryState<V>, Option<SharedFetch<V>>) {
        let now = self.now();
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            debug!(%key, "Creating cache entry");
            CacheEntry::new(QueryState::default(), stale_time, now)
        });
        entry.fetcher = Some(fetcher);
        entry.stale_time = stale_time;
        entry.last_used = now;

        if entry.needs_fetch(now, stale_time) {
            self.start_fetch(key, entry);
        }

        let pending = entry.in_flight.as_ref().map(|flight| flight.result.clone());
        let state = entry.state.borrow().clone();
        (state, pending)
    }

    /// Subscribe to state changes for `key`. Dropping the receiver
    /// unsubscribes; an in-flight fetch keeps running regardless.
    pub fn subscribe(&self, key: &QueryKey) -> watch::Receiver<QueryState<V>> {
        let now = self.now();
        let default_stale = self.inner.config.default_stale_time;
        let mut entries = self.lock();
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(QueryState::default(), default_stale, now));
        entry.last_used = now;
        entry.state.subscribe()
    }

    pub fn state(&self, key: &QueryKey) -> Option<QueryState<V>> {
        self.lock().get(key).map(|entry| entry.state.borrow().clone())
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.lock().get(key).map(CacheEntry::subscribers).unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|entry| entry.in_flight.is_some())
            .count()
    }

    // ===== Fetch lifecycle =====

    fn start_fetch(&self, key: &QueryKey, entry: &mut CacheEntry<V>) {
        let Some(fetcher) = entry.fetcher.clone() else {
            return;
        };
        let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let retry = self.inner.config.retry.clone();
        let store = self.clone();
        let task_key = key.clone();
        debug!(%key, fetch_id = id, "Starting fetch");

        let handle: JoinHandle<Result<V, CacheError>> = tokio::spawn(async move {
            let label = task_key.to_string();
            let result = retry.run(&label, || fetcher.call()).await;
            store.complete(&task_key, id, result)
        });
        let abort = handle.abort_handle();
        let result = async move { handle.await.unwrap_or(Err(CacheError::Cancelled)) }
            .boxed()
            .shared();

        entry.in_flight = Some(InFlight {
            id,
            result,
            abort,
            invalidated: false,
            overwritten: false,
        });
        entry.state.send_modify(|state| state.is_loading = true);
    }

    /// Apply a finished fetch. Results for entries that were cleared, or
    /// superseded by a newer fetch, are discarded.
    fn complete(&self, key: &QueryKey, id: u64, result: Result<V, ApiError>) -> Result<V, CacheError> {
        let now = self.now();
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            debug!(%key, fetch_id = id, "Entry cleared while fetching, discarding result");
            return Err(CacheError::Cancelled);
        };
        let flight = match entry.in_flight.take() {
            Some(flight) if flight.id == id => flight,
            other => {
                entry.in_flight = other;
                debug!(%key, fetch_id = id, "Fetch superseded, discarding result");
                return Err(CacheError::Cancelled);
            }
        };
        entry.last_used = now;

        match result {
            Ok(value) => {
                let value = if flight.overwritten {
                    debug!(%key, fetch_id = id, "Value written during fetch, keeping it");
                    entry.state.send_modify(|state| {
                        state.is_loading = false;
                        state.is_invalidated |= flight.invalidated;
                    });
                    entry.state.borrow().data.clone().unwrap_or(value)
                } else {
                    entry.state.send_modify(|state| {
                        state.data = Some(value.clone());
                        state.fetched_at = Some(now);
                        state.is_loading = false;
                        state.is_invalidated = flight.invalidated;
                        state.error = None;
                    });
                    value
                };
                if flight.invalidated && entry.subscribers() > 0 {
                    debug!(%key, "Invalidated during fetch, refetching");
                    self.start_fetch(key, entry);
                }
                drop(entries);
                self.bump_version();
                Ok(value)
            }
            Err(e) => {
                let error = CacheError::from(e);
                warn!(%key, error = %error, "Fetch failed");
                entry.state.send_modify(|state| {
                    state.is_loading = false;
                    state.error = Some(error.clone());
                });
                Err(error)
            }
        }
    }

    // ===== Writes =====

    /// Mark every entry whose key starts with `prefix` as stale.
    ///
    /// Data is kept. Entries with active subscribers refetch right away;
    /// the rest refetch on their next read. Returns the number of matched
    /// entries.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let mut entries = self.lock();
        let mut matched = 0;
        for (key, entry) in entries.iter_mut() {
            if !key.starts_with(prefix) {
                continue;
            }
            matched += 1;
            entry.state.send_if_modified(|state| {
                let changed = !state.is_invalidated;
                state.is_invalidated = true;
                changed
            });
            let subscribers = entry.subscribers();
            match entry.in_flight.as_mut() {
                Some(flight) => flight.invalidated = true,
                None if subscribers > 0 => self.start_fetch(key, entry),
                None => {}
            }
        }
        drop(entries);

        debug!(%prefix, matched, "Invalidated entries");
        if matched > 0 {
            self.bump_version();
        }
        matched
    }

    pub fn invalidate_all(&self) -> usize {
        self.invalidate(&QueryKey::all())
    }

    /// Refetch every observed entry that is invalidated or older than the
    /// stale time it was last read with. Used when connectivity returns.
    /// Returns the number of fetches started.
    pub fn refetch_observed(&self) -> usize {
        let now = self.now();
        let mut entries = self.lock();
        let mut started = 0;
        for (key, entry) in entries.iter_mut() {
            if entry.subscribers() == 0 || entry.fetcher.is_none() {
                continue;
            }
            if entry.needs_fetch(now, entry.stale_time) {
                self.start_fetch(key, entry);
                started += 1;
            }
        }
        drop(entries);

        debug!(started, "Refetched observed entries");
        started
    }

    /// Store a value that is already known, without a round trip. A fetch
    /// already in flight for `key` still completes for its waiters, but its
    /// result does not replace the written value.
    pub fn write(&self, key: &QueryKey, value: V) {
        let now = self.now();
        let default_stale = self.inner.config.default_stale_time;
        let mut entries = self.lock();
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(QueryState::default(), default_stale, now));
        entry.last_used = now;
        if let Some(flight) = entry.in_flight.as_mut() {
            flight.overwritten = true;
            flight.invalidated = false;
        }
        entry.state.send_modify(|state| {
            state.data = Some(value);
            state.fetched_at = Some(now);
            state.is_invalidated = false;
            state.error = None;
        });
        drop(entries);

        debug!(%key, "Wrote cache entry");
        self.bump_version();
    }

    /// Drop every entry and abort every in-flight fetch.
    pub fn clear_all(&self) {
        let mut entries = self.lock();
        let dropped = entries.len();
        let mut aborted = 0;
        for flight in entries.values().filter_map(|entry| entry.in_flight.as_ref()) {
            flight.abort.abort();
            aborted += 1;
        }
        entries.clear();
        drop(entries);

        info!(dropped, aborted, "Cleared query cache");
        self.bump_version();
    }

    // ===== Garbage collection =====

    /// Purge entries nobody has used for `gc_time`. Entries with
    /// subscribers or a fetch in flight are kept and count as used now.
    pub fn collect_garbage(&self) -> usize {
        let now = self.now();
        let gc_time = self.inner.config.gc_time;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, entry| {
            if entry.subscribers() > 0 || entry.in_flight.is_some() {
                entry.last_used = now;
                return true;
            }
            let keep = age(now, entry.last_used).map_or(true, |age| age < gc_time);
            if !keep {
                debug!(%key, "Collecting unused cache entry");
            }
            keep
        });
        let removed = before - entries.len();
        drop(entries);

        if removed > 0 {
            self.bump_version();
        }
        removed
    }

    /// Run `collect_garbage` every `every` until the task is aborted.
    pub fn spawn_gc(&self, every: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.collect_garbage();
                if removed > 0 {
                    debug!(removed, "Garbage collected cache entries");
                }
            }
        })
    }

    // ===== Persistence support =====

    /// Version counter bumped after every change worth persisting.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    /// Entries that hold data, with their fetch times.
    pub fn snapshot(&self) -> Vec<EntrySnapshot<V>> {
        let entries = self.lock();
        let mut snapshot: Vec<EntrySnapshot<V>> = entries
            .iter()
            .filter_map(|(key, entry)| {
                let state = entry.state.borrow();
                Some(EntrySnapshot {
                    key: key.clone(),
                    data: state.data.clone()?,
                    fetched_at: state.fetched_at?,
                    invalidated: state.is_invalidated,
                })
            })
            .collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot
    }

    /// Load persisted entries, keeping their original `fetched_at`. Keys
    /// already present in the table are left alone.
    pub fn hydrate(&self, snapshot: Vec<EntrySnapshot<V>>) -> usize {
        let now = self.now();
        let default_stale = self.inner.config.default_stale_time;
        let mut entries = self.lock();
        let mut restored = 0;
        for item in snapshot {
            if entries.contains_key(&item.key) {
                continue;
            }
            let state = QueryState {
                data: Some(item.data),
                fetched_at: Some(item.fetched_at),
                is_loading: false,
                is_invalidated: item.invalidated,
                error: None,
            };
            entries.insert(item.key, CacheEntry::new(state, default_stale, now));
            restored += 1;
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ManualClock, RetryPolicy};
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    const STALE: Duration = Duration::from_secs(60);

    /// Scripted data source that counts calls.
    #[derive(Clone, Default)]
    struct Source {
        calls: Arc<AtomicUsize>,
        value: Arc<Mutex<Vec<u32>>>,
        failures: Arc<Mutex<VecDeque<ApiError>>>,
        delay: Duration,
    }

    impl Source {
        fn with_value(value: Vec<u32>) -> Self {
            let source = Self::default();
            source.set(value);
            source
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn set(&self, value: Vec<u32>) {
            *self.value.lock().unwrap() = value;
        }

        fn fail_next(&self, error: ApiError) {
            self.failures.lock().unwrap().push_back(error);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn fetcher(&self) -> Fetcher<Vec<u32>> {
            let source = self.clone();
            Fetcher::new(move || {
                let source = source.clone();
                async move {
                    source.calls.fetch_add(1, Ordering::SeqCst);
                    if !source.delay.is_zero() {
                        tokio::time::sleep(source.delay).await;
                    }
                    let failure = source.failures.lock().unwrap().pop_front();
                    if let Some(e) = failure {
                        return Err(e);
                    }
                    let value = source.value.lock().unwrap().clone();
                    Ok(value)
                }
            })
        }
    }

    fn key(kind: &str, user: &str) -> QueryKey {
        QueryKey::new().with(kind).with(user)
    }

    fn manual_store() -> (CacheStore<Vec<u32>>, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let store = CacheStore::with_clock(CacheConfig::default(), Arc::new(clock.clone()));
        (store, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_share_one_call() {
        let store = CacheStore::new(CacheConfig::default());
        let source = Source::with_value(vec![7]).with_delay(Duration::from_millis(200));
        let key = key("transactions", "u1");

        let waits = (0..5).map(|_| store.fetch(&key, source.fetcher(), STALE));
        let results = futures::future::join_all(waits).await;

        assert!(results.iter().all(|r| r.as_ref().ok() == Some(&vec![7])));
        assert_eq!(source.calls(), 1);
        assert_eq!(store.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_scenario() {
        let (store, clock) = manual_store();
        let source = Source::with_value(vec![1, 2, 3, 4, 5]);
        let key = key("transactions", "u1");

        let first = store.read(&key, source.fetcher(), STALE);
        assert!(first.is_loading);
        assert!(first.data.is_none());
        let data = store.fetch(&key, source.fetcher(), STALE).await.unwrap();
        assert_eq!(data.len(), 5);
        assert_eq!(source.calls(), 1);

        clock.advance(chrono::Duration::seconds(30));
        let state = store.read(&key, source.fetcher(), STALE);
        assert!(!state.is_loading);
        assert_eq!(state.data.map(|d| d.len()), Some(5));
        assert_eq!(source.calls(), 1);

        source.set(vec![1, 2, 3, 4, 5, 6]);
        let mut rx = store.subscribe(&key);
        clock.advance(chrono::Duration::seconds(31));
        let state = store.read(&key, source.fetcher(), STALE);
        assert!(state.is_loading);
        assert_eq!(state.data.map(|d| d.len()), Some(5));

        let updated = rx.wait_for(|s| !s.is_loading).await.unwrap().clone();
        assert_eq!(updated.data.map(|d| d.len()), Some(6));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_fetch_returns_fresh_data_without_calling() {
        let (store, _clock) = manual_store();
        let source = Source::with_value(vec![1]);
        let key = key("settings", "u1");

        store.fetch(&key, source.fetcher(), STALE).await.unwrap();
        store.fetch(&key, source.fetcher(), STALE).await.unwrap();
        assert_eq!(source.calls(), 1);

        // A zero stale time always refetches
        store.fetch(&key, source.fetcher(), Duration::ZERO).await.unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidated_entry_keeps_data_and_refetches_on_read() {
        let (store, _clock) = manual_store();
        let source = Source::with_value(vec![1]);
        let key = key("transactions", "u1");
        store.fetch(&key, source.fetcher(), STALE).await.unwrap();

        assert_eq!(store.invalidate(&QueryKey::new().with("transactions")), 1);
        let state = store.state(&key).unwrap();
        assert!(state.is_invalidated);
        assert_eq!(state.data, Some(vec![1]));
        assert_eq!(source.calls(), 1);

        source.set(vec![2]);
        let state = store.read(&key, source.fetcher(), STALE);
        assert!(state.is_loading);
        assert_eq!(state.data, Some(vec![1]));
        assert_eq!(store.fetch(&key, source.fetcher(), STALE).await.unwrap(), vec![2]);
        assert!(!store.state(&key).unwrap().is_invalidated);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_refetches_entries_with_subscribers() {
        let (store, _clock) = manual_store();
        let source = Source::with_value(vec![1]);
        let watched = key("transactions", "u1");
        let idle = QueryKey::new().with("transactions").with("u1").with(50_usize);
        store.fetch(&watched, source.fetcher(), STALE).await.unwrap();
        store.fetch(&idle, source.fetcher(), STALE).await.unwrap();

        let mut rx = store.subscribe(&watched);
        source.set(vec![9]);
        assert_eq!(store.invalidate(&key("transactions", "u1")), 2);
        assert!(rx.borrow().is_loading);

        let state = rx.wait_for(|s| !s.is_loading).await.unwrap().clone();
        assert_eq!(state.data, Some(vec![9]));
        assert!(!state.is_invalidated);
        assert_eq!(source.calls(), 3);

        let idle_state = store.state(&idle).unwrap();
        assert!(idle_state.is_invalidated);
        assert!(!idle_state.is_loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_during_fetch_leaves_result_stale() {
        let (store, _clock) = manual_store();
        let source = Source::with_value(vec![1]).with_delay(Duration::from_millis(100));
        let key = key("transactions", "u1");

        store.read(&key, source.fetcher(), STALE);
        store.invalidate(&key);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let state = store.state(&key).unwrap();
        assert_eq!(state.data, Some(vec![1]));
        assert!(state.is_invalidated);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_cancels_in_flight() {
        let (store, _clock) = manual_store();
        let source = Source::with_value(vec![1]).with_delay(Duration::from_secs(1));
        let key = key("transactions", "u1");

        let pending = tokio::spawn({
            let store = store.clone();
            let fetcher = source.fetcher();
            let key = key.clone();
            async move { store.fetch(&key, fetcher, STALE).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.in_flight_count(), 1);
        assert_eq!(source.calls(), 1);

        store.clear_all();
        assert!(store.is_empty());
        assert_eq!(store.in_flight_count(), 0);
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(CacheError::Cancelled)));

        let state = store.read(&key, source.fetcher(), STALE);
        assert!(state.is_loading);
        assert!(state.data.is_none());
        assert_eq!(store.fetch(&key, source.fetcher(), STALE).await.unwrap(), vec![1]);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_refetch_keeps_previous_data() {
        let (store, _clock) = manual_store();
        let source = Source::with_value(vec![1]);
        let key = key("categories", "u1");
        store.fetch(&key, source.fetcher(), STALE).await.unwrap();

        store.invalidate(&key);
        source.fail_next(ApiError::AccessDenied("revoked".to_string()));
        let err = store.fetch(&key, source.fetcher(), STALE).await.unwrap_err();
        assert!(matches!(err.api_error(), Some(ApiError::AccessDenied(_))));

        let state = store.state(&key).unwrap();
        assert_eq!(state.data, Some(vec![1]));
        assert!(state.error.is_some());
        assert!(!state.is_loading);
        assert_eq!(source.calls(), 2);

        source.set(vec![2]);
        assert_eq!(store.fetch(&key, source.fetcher(), STALE).await.unwrap(), vec![2]);
        assert!(store.state(&key).unwrap().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let (store, _clock) = manual_store();
        let source = Source::with_value(vec![3]);
        source.fail_next(ApiError::ServerError("503".to_string()));
        source.fail_next(ApiError::Timeout);
        let key = key("settings", "u1");

        assert_eq!(store.fetch(&key, source.fetcher(), STALE).await.unwrap(), vec![3]);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let clock = ManualClock::new(Utc::now());
        let config = CacheConfig::default().with_retry(RetryPolicy::default().with_retries(1));
        let store = CacheStore::with_clock(config, Arc::new(clock));
        let source = Source::with_value(vec![3]);
        for _ in 0..3 {
            source.fail_next(ApiError::RateLimited);
        }
        let key = key("settings", "u1");

        let err = store.fetch(&key, source.fetcher(), STALE).await.unwrap_err();
        assert!(matches!(err.api_error(), Some(ApiError::RateLimited)));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_cached_after_last_subscriber_leaves() {
        let (store, _clock) = manual_store();
        let source = Source::with_value(vec![4]).with_delay(Duration::from_millis(100));
        let key = key("categories", "u1");

        let rx = store.subscribe(&key);
        store.read(&key, source.fetcher(), STALE);
        drop(rx);
        assert_eq!(store.subscriber_count(&key), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.state(&key).unwrap().data, Some(vec![4]));
        assert_eq!(store.in_flight_count(), 0);
    }

    #[test]
    fn test_write_sets_data_without_fetch() {
        let (store, clock) = manual_store();
        let key = key("settings", "u1");
        store.write(&key, vec![5]);

        let state = store.state(&key).unwrap();
        assert_eq!(state.data, Some(vec![5]));
        assert_eq!(state.fetched_at, Some(clock.now()));
        assert!(!state.is_loading);
        assert_eq!(*store.changes().borrow(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_wins_over_fetch_in_flight() {
        let (store, _clock) = manual_store();
        let source = Source::with_value(vec![1]).with_delay(Duration::from_millis(100));
        let key = key("settings", "u1");

        store.read(&key, source.fetcher(), STALE);
        store.write(&key, vec![2]);
        assert_eq!(store.state(&key).unwrap().data, Some(vec![2]));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let state = store.state(&key).unwrap();
        assert_eq!(state.data, Some(vec![2]));
        assert!(!state.is_loading);
        assert!(!state.is_invalidated);
        assert_eq!(store.in_flight_count(), 0);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_waiter_gets_written_value() {
        let (store, _clock) = manual_store();
        let source = Source::with_value(vec![1]).with_delay(Duration::from_millis(100));
        let key = key("settings", "u1");

        let pending = tokio::spawn({
            let store = store.clone();
            let fetcher = source.fetcher();
            let key = key.clone();
            async move { store.fetch(&key, fetcher, STALE).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.write(&key, vec![2]);

        assert_eq!(pending.await.unwrap().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_future_fetch_time_counts_as_stale() {
        let (store, clock) = manual_store();
        let key = key("categories", "u1");
        let ahead = EntrySnapshot {
            key: key.clone(),
            data: vec![1],
            fetched_at: clock.now() + chrono::Duration::hours(2),
            invalidated: false,
        };
        store.hydrate(vec![ahead]);

        let source = Source::with_value(vec![2]);
        let state = store.read(&key, source.fetcher(), STALE);
        assert!(state.is_loading);
        assert_eq!(store.fetch(&key, source.fetcher(), STALE).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_refetch_observed_only_touches_stale_watched_entries() {
        let (store, clock) = manual_store();
        let source = Source::with_value(vec![1]);
        let watched = key("transactions", "u1");
        let fresh = key("settings", "u1");
        let idle = key("categories", "u1");
        store.fetch(&watched, source.fetcher(), STALE).await.unwrap();
        store.fetch(&fresh, source.fetcher(), Duration::from_secs(600)).await.unwrap();
        store.fetch(&idle, source.fetcher(), STALE).await.unwrap();
        let mut rx = store.subscribe(&watched);
        let _fresh_rx = store.subscribe(&fresh);

        clock.advance(chrono::Duration::minutes(2));
        source.set(vec![2]);
        assert_eq!(store.refetch_observed(), 1);

        let state = rx.wait_for(|s| !s.is_loading).await.unwrap().clone();
        assert_eq!(state.data, Some(vec![2]));
        assert_eq!(store.state(&fresh).unwrap().data, Some(vec![1]));
        assert_eq!(store.state(&idle).unwrap().data, Some(vec![1]));
        assert_eq!(source.calls(), 4);
    }

    #[test]
    fn test_collect_garbage_keeps_observed_entries() {
        let clock = ManualClock::new(Utc::now());
        let config = CacheConfig::default().with_gc_time(Duration::from_secs(5 * 60));
        let store = CacheStore::with_clock(config, Arc::new(clock.clone()));
        let unused = key("categories", "u1");
        let observed = key("settings", "u1");
        store.write(&unused, vec![1]);
        store.write(&observed, vec![2]);
        let rx = store.subscribe(&observed);

        clock.advance(chrono::Duration::minutes(6));
        assert_eq!(store.collect_garbage(), 1);
        assert!(store.state(&unused).is_none());
        assert!(store.state(&observed).is_some());

        drop(rx);
        clock.advance(chrono::Duration::minutes(4));
        assert_eq!(store.collect_garbage(), 0);
        clock.advance(chrono::Duration::minutes(2));
        assert_eq!(store.collect_garbage(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_hydrated_entries_keep_fetched_at() {
        let (first, clock) = manual_store();
        let key = key("transactions", "u1");
        first.write(&key, vec![1, 2]);
        let snapshot = first.snapshot();
        let fetched_at = snapshot[0].fetched_at;

        clock.advance(chrono::Duration::minutes(2));
        let second = CacheStore::with_clock(CacheConfig::default(), Arc::new(clock.clone()));
        assert_eq!(second.hydrate(snapshot.clone()), 1);
        assert_eq!(second.snapshot(), snapshot);

        let state = second.state(&key).unwrap();
        assert_eq!(state.fetched_at, Some(fetched_at));

        let source = Source::with_value(vec![3]);
        let state = second.read(&key, source.fetcher(), STALE);
        assert!(state.is_loading);
        assert_eq!(state.data, Some(vec![1, 2]));
    }

    #[test]
    fn test_hydrate_does_not_overwrite_live_entries() {
        let (store, _clock) = manual_store();
        let key = key("settings", "u1");
        store.write(&key, vec![9]);

        let stale = EntrySnapshot {
            key: key.clone(),
            data: vec![1],
            fetched_at: Utc::now() - chrono::Duration::days(1),
            invalidated: false,
        };
        assert_eq!(store.hydrate(vec![stale]), 0);
        assert_eq!(store.state(&key).unwrap().data, Some(vec![9]));
    }

    fn arb_key() -> impl Strategy<Value = QueryKey> {
        (
            prop::sample::select(vec!["transactions", "settings"]),
            prop::sample::select(vec!["u1", "u2"]),
            prop::option::of(0_i64..3),
        )
            .prop_map(|(kind, user, param)| {
                let key = QueryKey::new().with(kind).with(user);
                match param {
                    Some(p) => key.with(p),
                    None => key,
                }
            })
    }

    fn arb_prefix() -> impl Strategy<Value = QueryKey> {
        (arb_key(), 0_usize..=3).prop_map(|(key, len)| {
            key.parts().iter().take(len).cloned().collect()
        })
    }

    proptest! {
        #[test]
        fn prop_invalidate_marks_all_and_only_matching(
            keys in prop::collection::vec(arb_key(), 1..12),
            prefix in arb_prefix(),
        ) {
            let store = CacheStore::new(CacheConfig::default());
            for key in &keys {
                store.write(key, vec![1_u32]);
            }

            let expected = store.keys().iter().filter(|k| k.starts_with(&prefix)).count();
            prop_assert_eq!(store.invalidate(&prefix), expected);
            prop_assert_eq!(store.invalidate(&prefix), expected);

            for key in store.keys() {
                let state = store.state(&key).unwrap();
                prop_assert_eq!(state.is_invalidated, key.starts_with(&prefix));
                prop_assert_eq!(state.data, Some(vec![1_u32]));
            }
        }
    }
}
