//! Row keys and key ranges
//!
//! Keys are compared component-wise, so a composite primary key orders the
//! same way an index over its columns would.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One component of a primary key.
///
/// Components of different kinds order by variant (`Int < Text < Bytes`);
/// a well-formed table never mixes kinds within one key column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyValue {
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl KeyValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            KeyValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Text(v) => write!(f, "'{}'", v),
            KeyValue::Bytes(v) => {
                write!(f, "0x")?;
                for b in v {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Text(v.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::Text(v)
    }
}

/// A primary key value, ordered lexicographically over its components.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(pub Vec<KeyValue>);

impl RowKey {
    pub fn new(parts: Vec<KeyValue>) -> Self {
        Self(parts)
    }

    /// Single integer key.
    pub fn int(v: i64) -> Self {
        Self(vec![KeyValue::Int(v)])
    }

    /// Single text key.
    pub fn text(v: impl Into<String>) -> Self {
        Self(vec![KeyValue::Text(v.into())])
    }

    pub fn parts(&self) -> &[KeyValue] {
        &self.0
    }

    /// The integer value of a single-column integer key.
    pub fn as_single_int(&self) -> Option<i64> {
        match self.0.as_slice() {
            [KeyValue::Int(v)] => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{}", single),
            parts => {
                write!(f, "(")?;
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Half-open key interval `[lower, upper)`.
///
/// A missing lower bound is negative infinity, a missing upper bound is
/// positive infinity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub lower: Option<RowKey>,
    pub upper: Option<RowKey>,
}

impl KeyRange {
    pub fn new(lower: Option<RowKey>, upper: Option<RowKey>) -> Self {
        Self { lower, upper }
    }

    /// The whole key space.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_unbounded(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    pub fn contains(&self, key: &RowKey) -> bool {
        let above_lower = self.lower.as_ref().map_or(true, |l| key >= l);
        let below_upper = self.upper.as_ref().map_or(true, |u| key < u);
        above_lower && below_upper
    }

    /// Whether every key in this range is below `key`.
    pub fn ends_at_or_before(&self, key: &RowKey) -> bool {
        self.upper.as_ref().map_or(false, |u| u <= key)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.lower {
            Some(l) => write!(f, "[{}", l)?,
            None => write!(f, "[-inf")?,
        }
        match &self.upper {
            Some(u) => write!(f, ", {})", u),
            None => write!(f, ", +inf)"),
        }
    }
}
