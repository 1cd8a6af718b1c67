use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Category, CategoryBudget, PaymentMethod, Settings, Transaction};

/// Per-user collections held by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    #[serde(rename = "transactions")]
    Transactions,
    #[serde(rename = "categories")]
    Categories,
    #[serde(rename = "settings")]
    Settings,
    #[serde(rename = "categoryBudgets")]
    CategoryBudgets,
    #[serde(rename = "paymentMethods")]
    PaymentMethods,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Transactions => "transactions",
            Collection::Categories => "categories",
            Collection::Settings => "settings",
            Collection::CategoryBudgets => "categoryBudgets",
            Collection::PaymentMethods => "paymentMethods",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed document from one of the remote collections.
///
/// Remote documents arrive as loosely shaped JSON; they are mapped to one of
/// these variants as soon as they cross into the client so nothing downstream
/// handles untyped values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record")]
pub enum Record {
    Transaction(Transaction),
    Category(Category),
    Settings(Settings),
    CategoryBudget(CategoryBudget),
    PaymentMethod(PaymentMethod),
}

impl Record {
    /// Map a raw document from `collection` onto its typed record.
    /// The document id is authoritative over any `id` field in the body.
    pub fn from_document(collection: Collection, id: &str, doc: Value) -> serde_json::Result<Self> {
        let record = match collection {
            Collection::Transactions => {
                let mut tx: Transaction = serde_json::from_value(doc)?;
                tx.id = id.to_string();
                Record::Transaction(tx)
            }
            Collection::Categories => {
                let mut category: Category = serde_json::from_value(doc)?;
                category.id = id.to_string();
                Record::Category(category)
            }
            Collection::Settings => Record::Settings(serde_json::from_value(doc)?),
            Collection::CategoryBudgets => {
                let mut budget: CategoryBudget = serde_json::from_value(doc)?;
                budget.id = id.to_string();
                Record::CategoryBudget(budget)
            }
            Collection::PaymentMethods => {
                let mut method: PaymentMethod = serde_json::from_value(doc)?;
                method.id = id.to_string();
                Record::PaymentMethod(method)
            }
        };
        Ok(record)
    }

    pub fn collection(&self) -> Collection {
        match self {
            Record::Transaction(_) => Collection::Transactions,
            Record::Category(_) => Collection::Categories,
            Record::Settings(_) => Collection::Settings,
            Record::CategoryBudget(_) => Collection::CategoryBudgets,
            Record::PaymentMethod(_) => Collection::PaymentMethods,
        }
    }

    /// Document body to send to the remote store, without the id.
    pub fn to_document(&self) -> serde_json::Result<Value> {
        let mut doc = match self {
            Record::Transaction(tx) => serde_json::to_value(tx)?,
            Record::Category(category) => serde_json::to_value(category)?,
            Record::Settings(settings) => serde_json::to_value(settings)?,
            Record::CategoryBudget(budget) => serde_json::to_value(budget)?,
            Record::PaymentMethod(method) => serde_json::to_value(method)?,
        };
        if let Value::Object(ref mut map) = doc {
            map.remove("id");
        }
        Ok(doc)
    }

    pub fn into_transaction(self) -> Option<Transaction> {
        match self {
            Record::Transaction(tx) => Some(tx),
            _ => None,
        }
    }

    pub fn into_category(self) -> Option<Category> {
        match self {
            Record::Category(category) => Some(category),
            _ => None,
        }
    }

    pub fn into_settings(self) -> Option<Settings> {
        match self {
            Record::Settings(settings) => Some(settings),
            _ => None,
        }
    }

    pub fn into_category_budget(self) -> Option<CategoryBudget> {
        match self {
            Record::CategoryBudget(budget) => Some(budget),
            _ => None,
        }
    }
}
