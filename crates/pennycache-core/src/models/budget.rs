use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct CategoryBudget {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "categoryId")]
    pub category_id: String,
    pub amount: f64,
    /// `YYYY-MM`
    pub month: String,
}

impl CategoryBudget {
    pub fn new(category_id: impl Into<String>, amount: f64, month: impl Into<String>) -> Self {
        let category_id = category_id.into();
        let month = month.into();
        Self {
            id: budget_id(&category_id, &month),
            category_id,
            amount,
            month,
        }
    }
}

/// Budgets are keyed by category and month so saving twice overwrites.
pub fn budget_id(category_id: &str, month: &str) -> String {
    format!("{}_{}", category_id, month)
}

/// Check that a month string is in `YYYY-MM` form.
pub fn is_valid_month(month: &str) -> bool {
    let bytes = month.as_bytes();
    if bytes.len() != 7 || bytes[4] != b'-' {
        return false;
    }
    let digits_ok = bytes[..4].iter().chain(&bytes[5..]).all(u8::is_ascii_digit);
    digits_ok && matches!(&month[5..], "01" | "02" | "03" | "04" | "05" | "06" | "07" | "08" | "09" | "10" | "11" | "12")
}
