use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Currency applied when a payload or stored document does not name one.
pub const DEFAULT_CURRENCY: &str = "PKR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Transaction {
    #[serde(default)]
    pub id: String,
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
    /// Milliseconds since the epoch. Stored as `createdAt` remotely.
    #[serde(rename = "timestamp", alias = "createdAt", default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(rename = "categoryId", default)]
    pub category_id: Option<String>,
    #[serde(rename = "paymentMethodId", default)]
    pub payment_method_id: Option<String>,
}

impl Transaction {
    pub fn currency(&self) -> &str {
        self.currency.as_deref().unwrap_or(DEFAULT_CURRENCY)
    }

    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

/// Payload for logging a new transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct NewTransaction {
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(rename = "categoryId", default)]
    pub category_id: Option<String>,
    #[serde(rename = "paymentMethodId", default)]
    pub payment_method_id: Option<String>,
}

impl NewTransaction {
    pub fn new(amount: f64) -> Self {
        Self {
            amount,
            currency: None,
            timestamp: None,
            note: None,
            category_id: None,
            payment_method_id: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_category(mut self, category_id: impl Into<String>) -> Self {
        self.category_id = Some(category_id.into());
        self
    }

    /// Fill in the defaults the remote store expects and produce a record
    /// ready to be created. The id is assigned by the store.
    pub fn into_transaction(self, now: DateTime<Utc>) -> Transaction {
        Transaction {
            id: String::new(),
            amount: self.amount,
            currency: Some(self.currency.unwrap_or_else(|| DEFAULT_CURRENCY.to_string())),
            timestamp: Some(self.timestamp.unwrap_or_else(|| now.timestamp_millis())),
            note: self.note,
            category_id: self.category_id,
            payment_method_id: self.payment_method_id,
        }
    }
}
