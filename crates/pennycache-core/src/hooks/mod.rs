//! Typed query and mutation entry points for app screens.
//!
//! `Queries` reads transactions, categories, settings and category budgets
//! through the shared `ExpenseCache`; `Mutations` writes through the remote
//! store and invalidates the affected queries afterwards. Both are scoped to
//! the user currently signed in on the `SessionProvider`.

pub mod keys;
pub mod mutations;
pub mod queries;

use serde::{Deserialize, Serialize};

use crate::cache::CacheStore;
use crate::models::{Category, CategoryBudget, Record, Settings, Transaction};

pub use keys::QueryKind;
pub use mutations::{invalidation_prefixes, MutationError, MutationKind, MutationState, Mutations};
pub use queries::{Queries, QueryResult, QuerySubscription, DEFAULT_TRANSACTION_LIMIT};

/// A cached query result. One variant per query kind; this is what the
/// cache stores and persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum QueryData {
    Transactions(Vec<Transaction>),
    Categories(Vec<Category>),
    Settings(Option<Settings>),
    CategoryBudgets(Vec<CategoryBudget>),
}

/// The cache store shared by all queries of one app session.
pub type ExpenseCache = CacheStore<QueryData>;

impl QueryData {
    /// Collect fetched records into the value cached for `kind`. Records of
    /// other kinds are ignored.
    pub fn from_records(kind: QueryKind, records: Vec<Record>) -> Self {
        let records = records.into_iter();
        match kind {
            QueryKind::Transactions => {
                QueryData::Transactions(records.filter_map(Record::into_transaction).collect())
            }
            QueryKind::Categories => {
                QueryData::Categories(records.filter_map(Record::into_category).collect())
            }
            QueryKind::Settings => QueryData::Settings(records.filter_map(Record::into_settings).next()),
            QueryKind::CategoryBudgets => QueryData::CategoryBudgets(
                records.filter_map(Record::into_category_budget).collect(),
            ),
        }
    }

    pub fn kind(&self) -> QueryKind {
        match self {
            QueryData::Transactions(_) => QueryKind::Transactions,
            QueryData::Categories(_) => QueryKind::Categories,
            QueryData::Settings(_) => QueryKind::Settings,
            QueryData::CategoryBudgets(_) => QueryKind::CategoryBudgets,
        }
    }
}

/// Typed view of a `QueryData` variant.
pub trait FromQueryData: Sized {
    fn from_query_data(data: QueryData) -> Option<Self>;
}

impl FromQueryData for Vec<Transaction> {
    fn from_query_data(data: QueryData) -> Option<Self> {
        match data {
            QueryData::Transactions(items) => Some(items),
            _ => None,
        }
    }
}

impl FromQueryData for Vec<Category> {
    fn from_query_data(data: QueryData) -> Option<Self> {
        match data {
            QueryData::Categories(items) => Some(items),
            _ => None,
        }
    }
}

impl FromQueryData for Option<Settings> {
    fn from_query_data(data: QueryData) -> Option<Self> {
        match data {
            QueryData::Settings(settings) => Some(settings),
            _ => None,
        }
    }
}

impl FromQueryData for Vec<CategoryBudget> {
    fn from_query_data(data: QueryData) -> Option<Self> {
        match data {
            QueryData::CategoryBudgets(items) => Some(items),
            _ => None,
        }
    }
}
