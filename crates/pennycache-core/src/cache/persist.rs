//! Mirrors the query table to a single JSON blob so cached data survives
//! restarts.
//!
//! Persistence is best effort: failures are logged and the cache carries on
//! in memory. A blob written by a different crate version (the "buster") is
//! discarded on restore, as are entries older than the configured max age.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CacheConfig, CacheStore, EntrySnapshot, PersistError, QueryKey};

/// Fixed storage key; the blob lives at `<cache dir>/<STORAGE_KEY>.json`.
pub const STORAGE_KEY: &str = "pennycache-query-cache";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedBlob<V> {
    buster: String,
    saved_at: DateTime<Utc>,
    entries: BTreeMap<String, PersistedEntry<V>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedEntry<V> {
    data: V,
    fetched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    invalidated: bool,
}

/// Entry read from the blob whose data is decoded once the target store's
/// value type is known.
#[derive(Debug)]
struct PendingEntry {
    key: QueryKey,
    entry: PersistedEntry<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct Persister {
    path: PathBuf,
    buster: String,
    throttle: Duration,
    max_age: Duration,
    disabled: Arc<AtomicBool>,
    pending: Arc<Mutex<Vec<PendingEntry>>>,
    ready: Arc<watch::Sender<bool>>,
}

impl Persister {
    pub fn new(cache_dir: impl AsRef<Path>, config: &CacheConfig) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            path: cache_dir.as_ref().join(format!("{}.json", STORAGE_KEY)),
            buster: env!("CARGO_PKG_VERSION").to_string(),
            throttle: config.persist_throttle,
            max_age: config.persist_max_age,
            disabled: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(Mutex::new(Vec::new())),
            ready: Arc::new(ready),
        }
    }

    pub fn with_buster(mut self, buster: impl Into<String>) -> Self {
        self.buster = buster.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once a write failed; the session is memory-only from then on.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// True once persisted entries were handed to a store. The spawned
    /// writer stays idle until then so it never replaces an unread blob.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    fn mark_ready(&self) {
        self.ready.send_if_modified(|ready| !std::mem::replace(ready, true));
    }

    fn pending(&self) -> MutexGuard<'_, Vec<PendingEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the persisted blob into `store`. Returns the number of restored
    /// entries; any failure is logged and yields an empty cache.
    pub async fn restore<V>(&self, store: &CacheStore<V>) -> usize
    where
        V: Clone + Send + Sync + DeserializeOwned + 'static,
    {
        self.restore_where(store, |_| true).await
    }

    /// Like `restore`, but only entries whose key passes `keep` are loaded.
    pub async fn restore_where<V, F>(&self, store: &CacheStore<V>, keep: F) -> usize
    where
        V: Clone + Send + Sync + DeserializeOwned + 'static,
        F: Fn(&QueryKey) -> bool,
    {
        self.preload(store.now()).await;
        self.restore_pending_where(store, keep)
    }

    /// Read the blob into memory without touching any store. Entries are
    /// handed over later by `restore_pending_where`, which does no IO and
    /// can run inside a session transition.
    pub async fn preload(&self, now: DateTime<Utc>) -> usize {
        match self.load(now).await {
            Ok(entries) => {
                let count = entries.len();
                *self.pending() = entries;
                debug!(count, path = %self.path.display(), "Preloaded query cache");
                count
            }
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "Could not restore query cache, starting empty");
                self.pending().clear();
                0
            }
        }
    }

    /// Hydrate `store` with the preloaded entries whose key passes `keep`,
    /// then let the writer run.
    pub fn restore_pending_where<V, F>(&self, store: &CacheStore<V>, keep: F) -> usize
    where
        V: Clone + Send + Sync + DeserializeOwned + 'static,
        F: Fn(&QueryKey) -> bool,
    {
        let taken: Vec<PendingEntry> = {
            let mut pending = self.pending();
            let (taken, rest): (Vec<PendingEntry>, Vec<PendingEntry>) =
                pending.drain(..).partition(|item| keep(&item.key));
            *pending = rest;
            taken
        };

        let mut snapshot = Vec::with_capacity(taken.len());
        for PendingEntry { key, entry } in taken {
            match serde_json::from_value(entry.data) {
                Ok(data) => snapshot.push(EntrySnapshot {
                    key,
                    data,
                    fetched_at: entry.fetched_at,
                    invalidated: entry.invalidated,
                }),
                Err(e) => warn!(%key, error = %e, "Skipping persisted entry with unreadable data"),
            }
        }
        let restored = store.hydrate(snapshot);
        self.mark_ready();
        info!(restored, path = %self.path.display(), "Restored query cache");
        restored
    }

    async fn load(&self, now: DateTime<Utc>) -> Result<Vec<PendingEntry>, PersistError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let blob: PersistedBlob<serde_json::Value> = serde_json::from_str(&contents)?;

        if blob.buster != self.buster {
            info!(
                persisted = %blob.buster,
                current = %self.buster,
                "Discarding query cache written by another version"
            );
            self.purge().await;
            return Ok(Vec::new());
        }

        let mut entries = Vec::with_capacity(blob.entries.len());
        let mut expired = 0;
        for (serialized, entry) in blob.entries {
            let Some(key) = QueryKey::parse(&serialized) else {
                warn!(key = %serialized, "Skipping persisted entry with unreadable key");
                continue;
            };
            // A fetch time in the future means the writer's clock was off
            let too_old = (now - entry.fetched_at)
                .to_std()
                .map_or(true, |age| age > self.max_age);
            if too_old {
                expired += 1;
                continue;
            }
            entries.push(PendingEntry { key, entry });
        }
        if expired > 0 {
            debug!(expired, "Skipped persisted entries past max age");
        }
        Ok(entries)
    }

    /// Write the current table immediately. No-op once disabled.
    pub async fn flush<V>(&self, store: &CacheStore<V>) -> Result<(), PersistError>
    where
        V: Clone + Send + Sync + Serialize + 'static,
    {
        if self.is_disabled() {
            return Ok(());
        }
        let contents = self.encode(store)?;
        self.write(&contents).await
    }

    fn encode<V>(&self, store: &CacheStore<V>) -> Result<String, PersistError>
    where
        V: Clone + Send + Sync + Serialize + 'static,
    {
        let entries = store
            .snapshot()
            .into_iter()
            .map(|item| {
                let entry = PersistedEntry {
                    data: item.data,
                    fetched_at: item.fetched_at,
                    invalidated: item.invalidated,
                };
                (item.key.serialized(), entry)
            })
            .collect();
        let blob = PersistedBlob {
            buster: self.buster.clone(),
            saved_at: store.now(),
            entries,
        };
        Ok(serde_json::to_string(&blob)?)
    }

    async fn write(&self, contents: &str) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(bytes = contents.len(), "Persisted query cache");
        Ok(())
    }

    /// Persist after changes, at most once per throttle interval. Nothing
    /// is written before a restore ran. The task stops after the first
    /// failed write.
    pub fn spawn<V>(&self, store: &CacheStore<V>) -> JoinHandle<()>
    where
        V: Clone + Send + Sync + Serialize + 'static,
    {
        let persister = self.clone();
        let store = store.clone();
        let mut changes = store.changes();
        let mut ready = self.ready.subscribe();
        tokio::spawn(async move {
            if ready.wait_for(|ready| *ready).await.is_err() {
                return;
            }
            while changes.changed().await.is_ok() {
                tokio::time::sleep(persister.throttle).await;
                changes.borrow_and_update();

                if let Err(e) = persister.flush(&store).await {
                    warn!(
                        error = %e,
                        path = %persister.path.display(),
                        "Cache persistence failed, continuing in memory only"
                    );
                    persister.disabled.store(true, Ordering::Relaxed);
                    break;
                }
            }
        })
    }

    /// Remove the persisted blob and drop any preloaded entries.
    pub async fn purge(&self) {
        self.pending().clear();
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => info!(path = %self.path.display(), "Purged persisted query cache"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Failed to purge persisted query cache"),
        }
    }

    /// `purge` for synchronous callers such as session hooks. Preloaded
    /// entries are dropped at once; the file is removed on the runtime.
    pub fn purge_in_background(&self) -> Option<JoinHandle<()>> {
        self.pending().clear();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let persister = self.clone();
                Some(runtime.spawn(async move { persister.purge().await }))
            }
            Err(_) => {
                warn!("No runtime available, persisted query cache left in place");
                None
            }
        }
    }
}
