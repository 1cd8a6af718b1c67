//! Data models for PennyPilot entities.
//!
//! This module contains the typed records exchanged with the remote store:
//!
//! - `Transaction`, `NewTransaction`: logged spending
//! - `Category`, `PaymentMethod`: classification of spending, with defaults
//! - `Settings`: per-user income, budget and reminder preferences
//! - `CategoryBudget`: per-category monthly budget
//! - `Record`, `Collection`: the tagged boundary type for remote documents

pub mod budget;
pub mod category;
pub mod record;
pub mod settings;
pub mod transaction;

pub use budget::{budget_id, is_valid_month, CategoryBudget};
pub use category::{
    Category, PaymentMethod, PaymentMethodType, DEFAULT_CATEGORIES, DEFAULT_PAYMENT_METHODS,
};
pub use record::{Collection, Record};
pub use settings::{Settings, SETTINGS_DOC_ID};
pub use transaction::{NewTransaction, Transaction, DEFAULT_CURRENCY};
