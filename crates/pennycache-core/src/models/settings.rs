use serde::{Deserialize, Serialize};

use super::transaction::DEFAULT_CURRENCY;

/// Settings are a single document per user stored under this id.
pub const SETTINGS_DOC_ID: &str = "user_settings";

const DEFAULT_REMINDER_TIME: &str = "02:00";

fn default_reminder_time() -> String {
    DEFAULT_REMINDER_TIME.to_string()
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Settings {
    #[serde(rename = "monthlyIncome", default)]
    pub monthly_income: f64,
    #[serde(rename = "monthlyBudget", default)]
    pub monthly_budget: f64,
    #[serde(rename = "reminderTime", default = "default_reminder_time")]
    pub reminder_time: String,
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            monthly_income: 0.0,
            monthly_budget: 0.0,
            reminder_time: default_reminder_time(),
            currency: default_currency(),
        }
    }
}

impl Settings {
    /// Budget left for the month given what has been spent so far.
    pub fn remaining_budget(&self, spent: f64) -> f64 {
        self.monthly_budget - spent
    }
}
