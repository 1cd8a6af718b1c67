use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

use crate::api::{ApiError, ListParams, RemoteStore};
use crate::auth::SessionProvider;
use crate::cache::{CacheError, Fetcher, QueryKey, QueryState};
use crate::models::{Category, CategoryBudget, Settings, Transaction};
use crate::utils::format_age;

use super::{keys, ExpenseCache, FromQueryData, QueryData, QueryKind};

/// Number of transactions shown when a screen does not ask for more.
pub const DEFAULT_TRANSACTION_LIMIT: usize = 10;

/// What a screen renders for one query.
#[derive(Debug, Clone)]
pub struct QueryResult<T> {
    pub data: Option<T>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub is_loading: bool,
    pub is_invalidated: bool,
    pub error: Option<CacheError>,
}

impl<T> QueryResult<T> {
    /// Result of a query that is not enabled: no data, nothing loading.
    pub fn disabled() -> Self {
        Self {
            data: None,
            fetched_at: None,
            is_loading: false,
            is_invalidated: false,
            error: None,
        }
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        match self.fetched_at {
            Some(at) => format_age((now - at).num_minutes()),
            None => "never".to_string(),
        }
    }
}

impl<T: FromQueryData> QueryResult<T> {
    fn from_state(state: QueryState<QueryData>) -> Self {
        let mut error = state.error;
        let data = match state.data {
            Some(data) => {
                let typed = T::from_query_data(data);
                if typed.is_none() {
                    error = Some(CacheError::UnexpectedData);
                }
                typed
            }
            None => None,
        };
        Self {
            data,
            fetched_at: state.fetched_at,
            is_loading: state.is_loading,
            is_invalidated: state.is_invalidated,
            error,
        }
    }
}

/// Live view of one query. Holding it keeps the query observed, so it
/// refetches as soon as it is invalidated.
pub struct QuerySubscription<T> {
    rx: Option<watch::Receiver<QueryState<QueryData>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: FromQueryData> QuerySubscription<T> {
    fn new(rx: Option<watch::Receiver<QueryState<QueryData>>>) -> Self {
        Self {
            rx,
            _marker: PhantomData,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.rx.is_some()
    }

    pub fn current(&self) -> QueryResult<T> {
        match self.rx {
            Some(ref rx) => QueryResult::from_state(rx.borrow().clone()),
            None => QueryResult::disabled(),
        }
    }

    /// Wait for the next change. Returns `None` for a disabled query or
    /// once the entry has been cleared (for example on sign-out).
    pub async fn changed(&mut self) -> Option<QueryResult<T>> {
        let rx = self.rx.as_mut()?;
        rx.changed().await.ok()?;
        let state = rx.borrow_and_update().clone();
        Some(QueryResult::from_state(state))
    }
}

struct QueryRequest {
    key: QueryKey,
    fetcher: Fetcher<QueryData>,
    stale_time: Duration,
}

/// Read side of the cache, scoped to the signed-in user.
///
/// Every query is disabled while nobody is signed in: it reports no data
/// and never calls the remote store.
pub struct Queries<R: RemoteStore> {
    store: ExpenseCache,
    remote: Arc<R>,
    session: SessionProvider,
}

impl<R: RemoteStore> Clone for Queries<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            remote: Arc::clone(&self.remote),
            session: self.session.clone(),
        }
    }
}

impl<R: RemoteStore> Queries<R> {
    pub fn new(store: ExpenseCache, remote: Arc<R>, session: SessionProvider) -> Self {
        Self {
            store,
            remote,
            session,
        }
    }

    // ===== Transactions =====

    /// Most recent transactions, newest first.
    pub fn transactions(&self, limit: usize) -> QueryResult<Vec<Transaction>> {
        self.read(self.transactions_request(limit))
    }

    pub async fn fetch_transactions(&self, limit: usize) -> Result<Vec<Transaction>, CacheError> {
        self.fetch(self.transactions_request(limit)).await
    }

    pub fn subscribe_transactions(&self, limit: usize) -> QuerySubscription<Vec<Transaction>> {
        self.subscribe(self.transactions_request(limit))
    }

    fn transactions_request(&self, limit: usize) -> Option<QueryRequest> {
        let user_id = self.session.current_user()?;
        Some(self.request(
            QueryKind::Transactions,
            keys::transactions(&user_id, limit),
            user_id,
            ListParams::limit(limit),
        ))
    }

    // ===== Categories =====

    pub fn categories(&self) -> QueryResult<Vec<Category>> {
        self.read(self.categories_request())
    }

    pub async fn fetch_categories(&self) -> Result<Vec<Category>, CacheError> {
        self.fetch(self.categories_request()).await
    }

    pub fn subscribe_categories(&self) -> QuerySubscription<Vec<Category>> {
        self.subscribe(self.categories_request())
    }

    fn categories_request(&self) -> Option<QueryRequest> {
        let user_id = self.session.current_user()?;
        Some(self.request(
            QueryKind::Categories,
            keys::categories(&user_id),
            user_id,
            ListParams::default(),
        ))
    }

    // ===== Settings =====

    /// The user's settings; `Some(None)` in `data` means none saved yet.
    pub fn settings(&self) -> QueryResult<Option<Settings>> {
        self.read(self.settings_request())
    }

    pub async fn fetch_settings(&self) -> Result<Option<Settings>, CacheError> {
        self.fetch(self.settings_request()).await
    }

    pub fn subscribe_settings(&self) -> QuerySubscription<Option<Settings>> {
        self.subscribe(self.settings_request())
    }

    fn settings_request(&self) -> Option<QueryRequest> {
        let user_id = self.session.current_user()?;
        Some(self.request(
            QueryKind::Settings,
            keys::settings(&user_id),
            user_id,
            ListParams::default(),
        ))
    }

    // ===== Category budgets =====

    /// Budgets for a `YYYY-MM` month. Disabled when `month` is empty.
    pub fn category_budgets(&self, month: &str) -> QueryResult<Vec<CategoryBudget>> {
        self.read(self.category_budgets_request(month))
    }

    pub async fn fetch_category_budgets(&self, month: &str) -> Result<Vec<CategoryBudget>, CacheError> {
        self.fetch(self.category_budgets_request(month)).await
    }

    pub fn subscribe_category_budgets(&self, month: &str) -> QuerySubscription<Vec<CategoryBudget>> {
        self.subscribe(self.category_budgets_request(month))
    }

    fn category_budgets_request(&self, month: &str) -> Option<QueryRequest> {
        if month.is_empty() {
            return None;
        }
        let user_id = self.session.current_user()?;
        Some(self.request(
            QueryKind::CategoryBudgets,
            keys::category_budgets(&user_id, month),
            user_id,
            ListParams::month(month),
        ))
    }

    // ===== Manual invalidation =====

    pub fn invalidate_transactions(&self) -> usize {
        self.invalidate_kind(QueryKind::Transactions)
    }

    pub fn invalidate_categories(&self) -> usize {
        self.invalidate_kind(QueryKind::Categories)
    }

    pub fn invalidate_settings(&self) -> usize {
        self.invalidate_kind(QueryKind::Settings)
    }

    pub fn invalidate_category_budgets(&self) -> usize {
        self.invalidate_kind(QueryKind::CategoryBudgets)
    }

    /// Invalidate every cached query, whoever it belongs to.
    pub fn invalidate_all(&self) -> usize {
        self.store.invalidate_all()
    }

    fn invalidate_kind(&self, kind: QueryKind) -> usize {
        match self.session.current_user() {
            Some(user_id) => self.store.invalidate(&kind.prefix(&user_id)),
            None => 0,
        }
    }

    // ===== Plumbing =====

    fn request(
        &self,
        kind: QueryKind,
        key: QueryKey,
        user_id: String,
        params: ListParams,
    ) -> QueryRequest {
        QueryRequest {
            key,
            fetcher: self.fetcher(kind, user_id, params),
            stale_time: kind.stale_time(),
        }
    }

    /// Fetch `kind` for `user_id`. Refuses to run once that user is no
    /// longer signed in, so a late refetch cannot load another user's data.
    fn fetcher(&self, kind: QueryKind, user_id: String, params: ListParams) -> Fetcher<QueryData> {
        let remote = Arc::clone(&self.remote);
        let session = self.session.clone();
        Fetcher::new(move || {
            let remote = Arc::clone(&remote);
            let session = session.clone();
            let user_id = user_id.clone();
            let params = params.clone();
            async move {
                if session.current_user().as_deref() != Some(user_id.as_str()) {
                    debug!(%kind, "Signed-in user changed, refusing fetch");
                    return Err(ApiError::Unauthenticated);
                }
                let records = remote.fetch_list(kind.collection(), &user_id, &params).await?;
                Ok(QueryData::from_records(kind, records))
            }
        })
    }

    fn read<T: FromQueryData>(&self, request: Option<QueryRequest>) -> QueryResult<T> {
        match request {
            Some(request) => QueryResult::from_state(self.store.read(
                &request.key,
                request.fetcher,
                request.stale_time,
            )),
            None => QueryResult::disabled(),
        }
    }

    async fn fetch<T: FromQueryData>(&self, request: Option<QueryRequest>) -> Result<T, CacheError> {
        let request = request.ok_or(CacheError::Disabled)?;
        let data = self
            .store
            .fetch(&request.key, request.fetcher, request.stale_time)
            .await?;
        T::from_query_data(data).ok_or(CacheError::UnexpectedData)
    }

    fn subscribe<T: FromQueryData>(&self, request: Option<QueryRequest>) -> QuerySubscription<T> {
        match request {
            Some(request) => {
                let rx = self.store.subscribe(&request.key);
                self.store.read(&request.key, request.fetcher, request.stale_time);
                QuerySubscription::new(Some(rx))
            }
            None => QuerySubscription::new(None),
        }
    }
}
