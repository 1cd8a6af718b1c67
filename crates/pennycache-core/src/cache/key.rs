use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One primitive element of a query key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Null,
    Int(i64),
    Str(String),
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        KeyPart::Str(s.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        KeyPart::Str(s)
    }
}

impl From<i64> for KeyPart {
    fn from(n: i64) -> Self {
        KeyPart::Int(n)
    }
}

impl From<usize> for KeyPart {
    fn from(n: usize) -> Self {
        KeyPart::Int(i64::try_from(n).unwrap_or(i64::MAX))
    }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(KeyPart::Null)
    }
}

impl KeyPart {
    fn to_json(&self) -> Value {
        match self {
            KeyPart::Null => Value::Null,
            KeyPart::Int(n) => Value::from(*n),
            KeyPart::Str(s) => Value::String(s.clone()),
        }
    }
}

/// Identity of a cacheable read: an ordered tuple of primitives such as
/// `["transactions", "uid-1", 10]`.
///
/// Two keys are equal iff their serialized tuples are equal. A key used as an
/// invalidation prefix matches every key that begins with the same parts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// The empty prefix, which matches every key.
    pub fn all() -> Self {
        Self::new()
    }

    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.0.push(part.into());
        self
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Compact JSON array form, used as the key in the persisted blob.
    pub fn serialized(&self) -> String {
        Value::Array(self.0.iter().map(KeyPart::to_json).collect()).to_string()
    }

    /// Inverse of `serialized`. Returns `None` for anything that is not an
    /// array of strings, integers and nulls.
    pub fn parse(serialized: &str) -> Option<Self> {
        serde_json::from_str::<Vec<KeyPart>>(serialized).ok().map(Self)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialized())
    }
}

impl<P: Into<KeyPart>> FromIterator<P> for QueryKey {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}
