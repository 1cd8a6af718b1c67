use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Category {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub color: String,
    #[serde(rename = "isDefault", default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethodType {
    Cash,
    Bank,
    Card,
    Upi,
    Wallet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PaymentMethod {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(rename = "type")]
    pub kind: PaymentMethodType,
}

/// (name, icon, color) for the categories seeded into a new account.
pub const DEFAULT_CATEGORIES: &[(&str, &str, &str)] = &[
    ("Food", "🍽️", "#FF6B6B"),
    ("Transport", "🚗", "#4ECDC4"),
    ("Shopping", "🛍️", "#FFE66D"),
    ("Bills", "💳", "#A8E6CF"),
    ("Health", "⚕️", "#FF6B9D"),
    ("Entertainment", "🎬", "#C44569"),
    ("Travel", "✈️", "#4834DF"),
    ("Education", "📚", "#6A89CC"),
    ("Misc", "📦", "#95A5A6"),
];

pub const DEFAULT_PAYMENT_METHODS: &[(&str, &str, PaymentMethodType)] = &[
    ("Cash", "💵", PaymentMethodType::Cash),
    ("Bank Account", "🏦", PaymentMethodType::Bank),
    ("Credit/Debit Card", "💳", PaymentMethodType::Card),
    ("UPI/EasyPaisa", "📱", PaymentMethodType::Upi),
    ("Wallet", "👛", PaymentMethodType::Wallet),
];

impl Category {
    pub fn defaults() -> Vec<Category> {
        DEFAULT_CATEGORIES
            .iter()
            .map(|(name, icon, color)| Category {
                id: String::new(),
                name: name.to_string(),
                icon: icon.to_string(),
                color: color.to_string(),
                is_default: true,
            })
            .collect()
    }
}

impl PaymentMethod {
    pub fn defaults() -> Vec<PaymentMethod> {
        DEFAULT_PAYMENT_METHODS
            .iter()
            .map(|(name, icon, kind)| PaymentMethod {
                id: String::new(),
                name: name.to_string(),
                icon: icon.to_string(),
                kind: *kind,
            })
            .collect()
    }
}
