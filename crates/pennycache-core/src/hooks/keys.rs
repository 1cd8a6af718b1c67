use std::fmt;
use std::time::Duration;

use crate::cache::QueryKey;
use crate::models::Collection;

/// Transactions change with every logged expense.
pub const TRANSACTIONS_STALE_TIME: Duration = Duration::from_secs(60);

/// Categories rarely change.
pub const CATEGORIES_STALE_TIME: Duration = Duration::from_secs(5 * 60);

pub const CATEGORY_BUDGETS_STALE_TIME: Duration = Duration::from_secs(5 * 60);

/// Settings change least of all.
pub const SETTINGS_STALE_TIME: Duration = Duration::from_secs(10 * 60);

/// The kinds of cached query. A key always starts with the kind's name
/// followed by the owning user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Transactions,
    Categories,
    Settings,
    CategoryBudgets,
}

impl QueryKind {
    pub const ALL: [QueryKind; 4] = [
        QueryKind::Transactions,
        QueryKind::Categories,
        QueryKind::Settings,
        QueryKind::CategoryBudgets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Transactions => "transactions",
            QueryKind::Categories => "categories",
            QueryKind::Settings => "settings",
            QueryKind::CategoryBudgets => "categoryBudgets",
        }
    }

    pub fn collection(&self) -> Collection {
        match self {
            QueryKind::Transactions => Collection::Transactions,
            QueryKind::Categories => Collection::Categories,
            QueryKind::Settings => Collection::Settings,
            QueryKind::CategoryBudgets => Collection::CategoryBudgets,
        }
    }

    pub fn stale_time(&self) -> Duration {
        match self {
            QueryKind::Transactions => TRANSACTIONS_STALE_TIME,
            QueryKind::Categories => CATEGORIES_STALE_TIME,
            QueryKind::Settings => SETTINGS_STALE_TIME,
            QueryKind::CategoryBudgets => CATEGORY_BUDGETS_STALE_TIME,
        }
    }

    /// `[kind, user]`, matching every query of this kind for the user.
    pub fn prefix(&self, user_id: &str) -> QueryKey {
        QueryKey::new().with(self.as_str()).with(user_id)
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `["transactions", user, limit]`
pub fn transactions(user_id: &str, limit: usize) -> QueryKey {
    QueryKind::Transactions.prefix(user_id).with(limit)
}

/// `["categories", user]`
pub fn categories(user_id: &str) -> QueryKey {
    QueryKind::Categories.prefix(user_id)
}

/// `["settings", user]`
pub fn settings(user_id: &str) -> QueryKey {
    QueryKind::Settings.prefix(user_id)
}

/// `["categoryBudgets", user, month]`
pub fn category_budgets(user_id: &str, month: &str) -> QueryKey {
    QueryKind::CategoryBudgets.prefix(user_id).with(month)
}
