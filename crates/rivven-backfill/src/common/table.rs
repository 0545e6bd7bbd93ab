//! Table identity and primary-key metadata

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully qualified table name (`namespace.name`).
///
/// The namespace is the schema on PostgreSQL and the database on MySQL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId {
    pub namespace: String,
    pub name: String,
}

impl TableId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse `namespace.name`. The namespace is everything before the last dot.
    pub fn parse(qualified: &str) -> Option<Self> {
        let (ns, name) = qualified.rsplit_once('.')?;
        if ns.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(ns, name))
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Primary-key column type, as far as chunking cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Integer,
    Text,
    Binary,
}

/// One primary-key column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyColumn {
    pub name: String,
    pub key_type: KeyType,
}

impl KeyColumn {
    pub fn new(name: impl Into<String>, key_type: KeyType) -> Self {
        Self {
            name: name.into(),
            key_type,
        }
    }
}

/// A capturable table and its primary key. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub id: TableId,
    pub key_columns: Vec<KeyColumn>,
}

impl TableDescriptor {
    pub fn new(id: TableId, key_columns: Vec<KeyColumn>) -> Self {
        Self { id, key_columns }
    }

    /// Table keyed by a single integer column.
    pub fn with_int_key(id: TableId, column: impl Into<String>) -> Self {
        Self::new(id, vec![KeyColumn::new(column, KeyType::Integer)])
    }

    /// Whether the key is a single integer column (eligible for even chunking).
    pub fn has_single_int_key(&self) -> bool {
        matches!(self.key_columns.as_slice(), [c] if c.key_type == KeyType::Integer)
    }
}
