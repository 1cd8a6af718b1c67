//! Lifecycle of the cache for one app run.
//!
//! `SyncContext` owns the `ExpenseCache` and its background tasks: the
//! throttled persister, periodic garbage collection and the session hook
//! that clears everything when the signed-in user goes away.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::RemoteStore;
use crate::auth::{HookId, SessionProvider};
use crate::cache::{CacheConfig, CacheStore, Clock, KeyPart, Persister, QueryKey, SystemClock};
use crate::hooks::{ExpenseCache, Mutations, Queries};

/// How often unobserved entries are checked against the GC time.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// True when `key` belongs to `user_id`; the owner is the second key part.
fn owned_by(key: &QueryKey, user_id: &str) -> bool {
    key.parts().get(1) == Some(&KeyPart::from(user_id))
}

/// Keep `store` in step with the signed-in user.
///
/// Moving away from a user (sign-out or switch) clears `store` and purges
/// the persisted blob. Moving to a user hands that user's preloaded
/// entries from `persister` to `store`.
pub fn watch_session<V>(
    session: &SessionProvider,
    store: &CacheStore<V>,
    persister: Option<Persister>,
) -> HookId
where
    V: Clone + Send + Sync + DeserializeOwned + 'static,
{
    let store = store.clone();
    session.on_transition(move |previous, next| {
        if let Some(previous) = previous {
            info!(from = previous, to = ?next, "User session ended, clearing query cache");
            store.clear_all();
            if let Some(ref persister) = persister {
                persister.purge_in_background();
            }
        }
        if let (Some(user_id), Some(persister)) = (next, persister.as_ref()) {
            let restored = persister.restore_pending_where(&store, |key| owned_by(key, user_id));
            debug!(user = user_id, restored, "Restored persisted entries for user");
        }
    })
}

pub struct SyncContext<R: RemoteStore> {
    store: ExpenseCache,
    session: SessionProvider,
    queries: Queries<R>,
    mutations: Mutations<R>,
    persister: Option<Persister>,
    hook: HookId,
    tasks: Vec<JoinHandle<()>>,
}

impl<R: RemoteStore> SyncContext<R> {
    /// Build the cache, restore the signed-in user's persisted entries from
    /// `cache_dir` and start background tasks. Without a `cache_dir` the
    /// cache lives in memory only.
    pub async fn init(
        config: CacheConfig,
        remote: Arc<R>,
        session: SessionProvider,
        cache_dir: Option<PathBuf>,
    ) -> Self {
        Self::init_with_clock(config, remote, session, cache_dir, Arc::new(SystemClock)).await
    }

    pub async fn init_with_clock(
        config: CacheConfig,
        remote: Arc<R>,
        session: SessionProvider,
        cache_dir: Option<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let persister = cache_dir.map(|dir| Persister::new(dir, &config));
        let store = ExpenseCache::with_clock(config, clock);
        let mut tasks = Vec::new();

        if let Some(ref persister) = persister {
            persister.preload(store.now()).await;
        }
        // Registered before the restore below so a sign-in racing init is
        // still restored by the hook.
        let hook = watch_session(&session, &store, persister.clone());

        if let Some(ref persister) = persister {
            match session.current_user() {
                Some(user_id) => {
                    persister.restore_pending_where(&store, |key| owned_by(key, &user_id));
                }
                None => info!("No user signed in, restoring cache on sign-in"),
            }
            tasks.push(persister.spawn(&store));
        }
        tasks.push(store.spawn_gc(GC_INTERVAL));

        let queries = Queries::new(store.clone(), Arc::clone(&remote), session.clone());
        let mutations = Mutations::new(store.clone(), remote, session.clone());
        info!(
            persisted = persister.is_some(),
            entries = store.len(),
            "Sync context ready"
        );

        Self {
            store,
            session,
            queries,
            mutations,
            persister,
            hook,
            tasks,
        }
    }

    pub fn queries(&self) -> &Queries<R> {
        &self.queries
    }

    pub fn mutations(&self) -> &Mutations<R> {
        &self.mutations
    }

    pub fn store(&self) -> &ExpenseCache {
        &self.store
    }

    pub fn session(&self) -> &SessionProvider {
        &self.session
    }

    pub fn persister(&self) -> Option<&Persister> {
        self.persister.as_ref()
    }

    /// Mark every cached query stale; observed ones refetch right away.
    pub fn refresh_all(&self) -> usize {
        self.store.invalidate_all()
    }

    /// Refetch observed queries that went stale while offline. Call when
    /// connectivity returns.
    pub fn on_reconnect(&self) -> usize {
        let started = self.store.refetch_observed();
        info!(started, "Connectivity restored, refetching observed queries");
        started
    }

    /// Drop all cached data, in memory and on disk.
    pub async fn clear_all(&self) {
        self.store.clear_all();
        if let Some(ref persister) = self.persister {
            persister.purge().await;
        }
    }

    /// Stop background tasks and write the cache out one last time.
    pub async fn teardown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.session.remove_hook(self.hook);
        // Nothing was restored yet, so the table would replace an unread blob
        if let Some(persister) = self.persister.as_ref().filter(|p| p.is_ready()) {
            if let Err(e) = persister.flush(&self.store).await {
                warn!(error = %e, "Final cache flush failed");
            }
        }
        info!("Sync context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::hooks::keys;
    use crate::models::{Category, Collection, NewTransaction, Record};
    use crate::testing::FakeRemote;
    use chrono::Utc;

    fn category(name: &str) -> Record {
        let mut category = Category::defaults().remove(0);
        category.name = name.to_string();
        Record::Category(category)
    }

    async fn context(
        remote: &Arc<FakeRemote>,
        session: &SessionProvider,
        dir: Option<&tempfile::TempDir>,
    ) -> SyncContext<FakeRemote> {
        SyncContext::init(
            CacheConfig::default(),
            Arc::clone(remote),
            session.clone(),
            dir.map(|d| d.path().to_path_buf()),
        )
        .await
    }

    async fn wait_until(done: impl Fn() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(done());
    }

    #[tokio::test]
    async fn test_sign_out_clears_cache_and_blob() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        let session = SessionProvider::signed_in("u1");
        let ctx = context(&remote, &session, Some(&dir)).await;

        ctx.queries().fetch_transactions(10).await.unwrap();
        ctx.queries().fetch_categories().await.unwrap();
        let persister = ctx.persister().unwrap().clone();
        persister.flush(ctx.store()).await.unwrap();
        assert!(persister.path().exists());

        session.sign_out();
        assert!(ctx.store().is_empty());
        assert!(ctx.queries().transactions(10).data.is_none());
        wait_until(|| !persister.path().exists()).await;

        session.sign_in("u2");
        ctx.queries().fetch_transactions(10).await.unwrap();
        assert_eq!(remote.fetch_count(Collection::Transactions), 2);
        ctx.teardown().await;
    }

    #[tokio::test]
    async fn test_user_switch_clears_cache() {
        let remote = FakeRemote::new();
        let session = SessionProvider::signed_in("u1");
        let ctx = context(&remote, &session, None).await;
        ctx.queries().fetch_settings().await.unwrap();
        assert_eq!(ctx.store().len(), 1);

        session.sign_in("u2");
        assert!(ctx.store().is_empty());
        ctx.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_finishing_after_sign_out_is_discarded() {
        let remote = FakeRemote::new();
        remote.set_delay(Duration::from_millis(100));
        let session = SessionProvider::signed_in("u1");
        let ctx = context(&remote, &session, None).await;

        assert!(ctx.queries().categories().is_loading);
        session.sign_out();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(ctx.store().is_empty());
        assert_eq!(ctx.store().in_flight_count(), 0);
        ctx.teardown().await;
    }

    #[tokio::test]
    async fn test_restart_serves_persisted_data_without_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        remote.seed("u1", "c1", category("Food"));
        let session = SessionProvider::signed_in("u1");

        let first = context(&remote, &session, Some(&dir)).await;
        first.queries().fetch_categories().await.unwrap();
        first.teardown().await;

        let second = context(&remote, &session, Some(&dir)).await;
        let result = second.queries().categories();
        assert!(!result.is_loading);
        assert_eq!(result.data.map(|c| c.len()), Some(1));
        assert_eq!(remote.fetch_count(Collection::Categories), 1);
        second.teardown().await;
    }

    #[tokio::test]
    async fn test_restore_waits_for_late_sign_in() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        remote.seed("u1", "c1", category("Food"));
        let first_session = SessionProvider::signed_in("u1");
        let first = context(&remote, &first_session, Some(&dir)).await;
        first.queries().fetch_categories().await.unwrap();
        first.teardown().await;

        let session = SessionProvider::new();
        let second = context(&remote, &session, Some(&dir)).await;
        assert!(second.store().is_empty());
        assert!(!second.persister().unwrap().is_ready());

        session.sign_in("u1");
        let result = second.queries().categories();
        assert!(!result.is_loading);
        assert_eq!(result.data.map(|c| c.len()), Some(1));
        assert_eq!(remote.fetch_count(Collection::Categories), 1);
        second.teardown().await;

        let third_session = SessionProvider::signed_in("u1");
        let third = context(&remote, &third_session, Some(&dir)).await;
        assert!(third.store().state(&keys::categories("u1")).is_some());
        third.teardown().await;
    }

    #[tokio::test]
    async fn test_blob_kept_while_nobody_signed_in() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        let first_session = SessionProvider::signed_in("u1");
        let first = context(&remote, &first_session, Some(&dir)).await;
        first.queries().fetch_settings().await.unwrap();
        first.teardown().await;

        let session = SessionProvider::new();
        let idle = context(&remote, &session, Some(&dir)).await;
        idle.store().write(&keys::settings("u9"), crate::hooks::QueryData::Settings(None));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        idle.teardown().await;

        let restored = context(&remote, &first_session, Some(&dir)).await;
        assert!(restored.store().state(&keys::settings("u1")).is_some());
        restored.teardown().await;
    }

    #[tokio::test]
    async fn test_on_reconnect_refetches_stale_observed_queries() {
        let remote = FakeRemote::new();
        let session = SessionProvider::signed_in("u1");
        let clock = ManualClock::new(Utc::now());
        let ctx = SyncContext::init_with_clock(
            CacheConfig::default(),
            Arc::clone(&remote),
            session.clone(),
            None,
            Arc::new(clock.clone()),
        )
        .await;
        ctx.queries().fetch_transactions(10).await.unwrap();
        ctx.queries().fetch_settings().await.unwrap();
        let mut transactions = ctx.queries().subscribe_transactions(10);
        let _settings = ctx.queries().subscribe_settings();
        while transactions.current().is_loading {
            transactions.changed().await;
        }

        clock.advance(chrono::Duration::minutes(2));
        remote.seed("u1", "t1", Record::Transaction(NewTransaction::new(5.0).into_transaction(Utc::now())));
        assert_eq!(ctx.on_reconnect(), 1);

        let mut latest = transactions.current();
        while latest.is_loading {
            latest = transactions.changed().await.unwrap();
        }
        assert_eq!(latest.data.map(|t| t.len()), Some(1));
        assert_eq!(remote.fetch_count(Collection::Settings), 1);
        ctx.teardown().await;
    }

    #[tokio::test]
    async fn test_restore_skips_other_users() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        let first_session = SessionProvider::signed_in("u1");
        let first = context(&remote, &first_session, Some(&dir)).await;
        first.queries().fetch_categories().await.unwrap();
        first.teardown().await;

        let second_session = SessionProvider::signed_in("u2");
        let second = context(&remote, &second_session, Some(&dir)).await;
        assert!(second.store().state(&keys::categories("u1")).is_none());
        assert!(second.store().is_empty());
        second.teardown().await;
    }

    #[tokio::test]
    async fn test_stale_persisted_data_shown_while_revalidating() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        let session = SessionProvider::signed_in("u1");
        let clock = ManualClock::new(Utc::now());

        let first = SyncContext::init_with_clock(
            CacheConfig::default(),
            Arc::clone(&remote),
            session.clone(),
            Some(dir.path().to_path_buf()),
            Arc::new(clock.clone()),
        )
        .await;
        first.queries().fetch_transactions(10).await.unwrap();
        first.teardown().await;

        clock.advance(chrono::Duration::minutes(2));
        remote.seed("u1", "t1", Record::Transaction(NewTransaction::new(9.0).into_transaction(Utc::now())));
        let second = SyncContext::init_with_clock(
            CacheConfig::default(),
            Arc::clone(&remote),
            session.clone(),
            Some(dir.path().to_path_buf()),
            Arc::new(clock.clone()),
        )
        .await;
        let result = second.queries().transactions(10);
        assert!(result.is_loading);
        assert_eq!(result.data.map(|t| t.len()), Some(0));
        assert_eq!(second.queries().fetch_transactions(10).await.unwrap().len(), 1);
        second.teardown().await;
    }

    #[tokio::test]
    async fn test_add_transaction_then_list_refetches() {
        let remote = FakeRemote::new();
        let session = SessionProvider::signed_in("u1");
        let ctx = context(&remote, &session, None).await;
        assert!(ctx.queries().fetch_transactions(10).await.unwrap().is_empty());

        ctx.mutations()
            .add_transaction(NewTransaction::new(120.0).with_note("tea"))
            .await
            .unwrap();

        let list = ctx.queries().fetch_transactions(10).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].note.as_deref(), Some("tea"));
        assert_eq!(remote.fetch_count(Collection::Transactions), 2);
        ctx.teardown().await;
    }

    #[tokio::test]
    async fn test_refresh_all_and_clear_all() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        let session = SessionProvider::signed_in("u1");
        let ctx = context(&remote, &session, Some(&dir)).await;
        ctx.queries().fetch_settings().await.unwrap();
        ctx.queries().fetch_categories().await.unwrap();

        assert_eq!(ctx.refresh_all(), 2);
        assert!(ctx.store().state(&keys::settings("u1")).unwrap().is_invalidated);

        ctx.clear_all().await;
        assert!(ctx.store().is_empty());
        assert!(!ctx.persister().unwrap().path().exists());
        ctx.teardown().await;
    }

    #[tokio::test]
    async fn test_teardown_unregisters_session_hook() {
        let remote = FakeRemote::new();
        let session = SessionProvider::signed_in("u1");
        let ctx = context(&remote, &session, None).await;
        let store = ctx.store().clone();
        store.write(&keys::settings("u1"), crate::hooks::QueryData::Settings(None));
        ctx.teardown().await;

        session.sign_out();
        assert_eq!(store.len(), 1);
    }
}
