use std::fmt;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ListParams, RemoteStore};
use crate::auth::SessionProvider;
use crate::cache::{QueryKey, RetryPolicy};
use crate::models::{
    is_valid_month, Category, CategoryBudget, Collection, NewTransaction, PaymentMethod, Record,
    Settings, SETTINGS_DOC_ID,
};

use super::{keys, ExpenseCache, QueryData, QueryKind};

/// Mutations retry a transient failure once.
const MUTATION_RETRIES: u32 = 1;

#[derive(Error, Debug, Clone)]
pub enum MutationError {
    #[error("Not signed in")]
    Unauthenticated,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Remote write failed: {0}")]
    Remote(Arc<ApiError>),
}

impl From<ApiError> for MutationError {
    fn from(e: ApiError) -> Self {
        MutationError::Remote(Arc::new(e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    AddTransaction,
    DeleteTransaction,
    SaveSettings,
    SaveCategoryBudget,
    SeedDefaults,
}

impl MutationKind {
    pub const ALL: [MutationKind; 5] = [
        MutationKind::AddTransaction,
        MutationKind::DeleteTransaction,
        MutationKind::SaveSettings,
        MutationKind::SaveCategoryBudget,
        MutationKind::SeedDefaults,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::AddTransaction => "add_transaction",
            MutationKind::DeleteTransaction => "delete_transaction",
            MutationKind::SaveSettings => "save_settings",
            MutationKind::SaveCategoryBudget => "save_category_budget",
            MutationKind::SeedDefaults => "seed_defaults",
        }
    }

    /// Query kinds made stale by a successful mutation of this kind.
    ///
    /// Saving settings invalidates nothing: the saved value is written
    /// straight into the cache instead.
    pub fn invalidates(&self) -> &'static [QueryKind] {
        match self {
            MutationKind::AddTransaction => &[QueryKind::Transactions, QueryKind::Settings],
            MutationKind::DeleteTransaction => &[
                QueryKind::Transactions,
                QueryKind::Settings,
                QueryKind::CategoryBudgets,
            ],
            MutationKind::SaveSettings => &[],
            MutationKind::SaveCategoryBudget => &[QueryKind::CategoryBudgets],
            MutationKind::SeedDefaults => &[QueryKind::Categories],
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key prefixes invalidated after `kind` succeeds for `user_id`.
pub fn invalidation_prefixes(kind: MutationKind, user_id: &str) -> Vec<QueryKey> {
    kind.invalidates()
        .iter()
        .map(|query| query.prefix(user_id))
        .collect()
}

/// Progress of the latest mutation of one kind.
#[derive(Debug, Clone, Default)]
pub struct MutationState {
    pub is_pending: bool,
    pub error: Option<MutationError>,
}

/// Write side: each operation writes through the remote store and, on
/// success, invalidates the queries its kind affects. Nothing is updated
/// optimistically; on failure the cache is left untouched.
pub struct Mutations<R: RemoteStore> {
    store: ExpenseCache,
    remote: Arc<R>,
    session: SessionProvider,
    retry: RetryPolicy,
    states: Arc<[watch::Sender<MutationState>; 5]>,
}

impl<R: RemoteStore> Clone for Mutations<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            remote: Arc::clone(&self.remote),
            session: self.session.clone(),
            retry: self.retry.clone(),
            states: Arc::clone(&self.states),
        }
    }
}

impl<R: RemoteStore> Mutations<R> {
    pub fn new(store: ExpenseCache, remote: Arc<R>, session: SessionProvider) -> Self {
        let retry = store.config().retry.clone().with_retries(MUTATION_RETRIES);
        Self {
            store,
            remote,
            session,
            retry,
            states: Arc::new(std::array::from_fn(|_| watch::channel(MutationState::default()).0)),
        }
    }

    pub fn state(&self, kind: MutationKind) -> MutationState {
        self.states[kind.index()].borrow().clone()
    }

    pub fn subscribe(&self, kind: MutationKind) -> watch::Receiver<MutationState> {
        self.states[kind.index()].subscribe()
    }

    /// Log a new transaction. Returns the id assigned by the store.
    pub async fn add_transaction(&self, payload: NewTransaction) -> Result<String, MutationError> {
        let kind = MutationKind::AddTransaction;
        if !payload.amount.is_finite() || payload.amount <= 0.0 {
            return Err(self.reject(kind, format!("amount must be positive, got {}", payload.amount)));
        }
        let record = Record::Transaction(payload.into_transaction(self.store.now()));
        let remote = &self.remote;
        let record = &record;
        self.run(kind, move |user_id| async move {
            remote.create(Collection::Transactions, &user_id, record).await
        })
        .await
    }

    pub async fn delete_transaction(&self, id: &str) -> Result<(), MutationError> {
        let kind = MutationKind::DeleteTransaction;
        if id.is_empty() {
            return Err(self.reject(kind, "transaction id is empty".to_string()));
        }
        let remote = &self.remote;
        self.run(kind, move |user_id| async move {
            remote.delete(Collection::Transactions, &user_id, id).await
        })
        .await
    }

    /// Save settings and put them straight into the cache.
    pub async fn save_settings(&self, settings: Settings) -> Result<(), MutationError> {
        let record = Record::Settings(settings.clone());
        let remote = &self.remote;
        let record_ref = &record;
        let user_id = self
            .run(MutationKind::SaveSettings, move |user_id| async move {
                remote
                    .put(Collection::Settings, &user_id, SETTINGS_DOC_ID, record_ref)
                    .await
                    .map(|()| user_id)
            })
            .await?;

        if self.session.current_user().as_deref() == Some(user_id.as_str()) {
            self.store
                .write(&keys::settings(&user_id), QueryData::Settings(Some(settings)));
        }
        Ok(())
    }

    /// Set the budget for one category in a `YYYY-MM` month, replacing any
    /// earlier amount.
    pub async fn save_category_budget(
        &self,
        category_id: &str,
        amount: f64,
        month: &str,
    ) -> Result<(), MutationError> {
        let kind = MutationKind::SaveCategoryBudget;
        if !is_valid_month(month) {
            return Err(self.reject(kind, format!("month must be YYYY-MM, got {:?}", month)));
        }
        if !amount.is_finite() || amount < 0.0 {
            return Err(self.reject(kind, format!("amount must not be negative, got {}", amount)));
        }
        let budget = CategoryBudget::new(category_id, amount, month);
        let id = budget.id.clone();
        let record = Record::CategoryBudget(budget);
        let remote = &self.remote;
        let (id, record) = (&id, &record);
        self.run(kind, move |user_id| async move {
            remote
                .put(Collection::CategoryBudgets, &user_id, id, record)
                .await
        })
        .await
    }

    /// Create the default categories and payment methods for a new
    /// account. Collections that already hold records are left alone.
    /// Returns the number of records created.
    pub async fn seed_defaults(&self) -> Result<usize, MutationError> {
        let remote = &self.remote;
        self.run(MutationKind::SeedDefaults, move |user_id| async move {
            let categories = Category::defaults().into_iter().map(Record::Category).collect();
            let methods = PaymentMethod::defaults()
                .into_iter()
                .map(Record::PaymentMethod)
                .collect();
            let remote: &R = remote;
            let mut created = 0;
            created += seed_collection(remote, &user_id, Collection::Categories, categories).await?;
            created += seed_collection(remote, &user_id, Collection::PaymentMethods, methods).await?;
            Ok(created)
        })
        .await
    }

    fn reject(&self, kind: MutationKind, reason: String) -> MutationError {
        let error = MutationError::InvalidInput(reason);
        self.states[kind.index()].send_replace(MutationState {
            is_pending: false,
            error: Some(error.clone()),
        });
        error
    }

    async fn run<T, F, Fut>(&self, kind: MutationKind, op: F) -> Result<T, MutationError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let state = &self.states[kind.index()];
        let Some(user_id) = self.session.current_user() else {
            let error = MutationError::Unauthenticated;
            state.send_replace(MutationState {
                is_pending: false,
                error: Some(error.clone()),
            });
            return Err(error);
        };
        state.send_replace(MutationState {
            is_pending: true,
            error: None,
        });

        let result = self.retry.run(kind.as_str(), || op(user_id.clone())).await;
        match result {
            Ok(value) => {
                if self.session.current_user().as_deref() == Some(user_id.as_str()) {
                    for prefix in invalidation_prefixes(kind, &user_id) {
                        self.store.invalidate(&prefix);
                    }
                } else {
                    debug!(mutation = %kind, "User changed during mutation, skipping invalidation");
                }
                state.send_replace(MutationState::default());
                info!(mutation = %kind, "Mutation succeeded");
                Ok(value)
            }
            Err(e) => {
                warn!(mutation = %kind, error = %e, "Mutation failed");
                let error = MutationError::from(e);
                state.send_replace(MutationState {
                    is_pending: false,
                    error: Some(error.clone()),
                });
                Err(error)
            }
        }
    }
}

async fn seed_collection<R: RemoteStore>(
    remote: &R,
    user_id: &str,
    collection: Collection,
    records: Vec<Record>,
) -> Result<usize, ApiError> {
    let existing = remote
        .fetch_list(collection, user_id, &ListParams::limit(1))
        .await?;
    if !existing.is_empty() {
        debug!(%collection, "Collection already populated, not seeding");
        return Ok(0);
    }
    for record in &records {
        remote.create(collection, user_id, record).await?;
    }
    info!(%collection, count = records.len(), "Seeded default records");
    Ok(records.len())
}
