//! Change events and scanned rows
//!
//! A [`ChangeEvent`] is what the engine hands to the output sink, whether it
//! came from a backfilled snapshot split or from the live change log. Every
//! event carries the log position it is valid at.

use crate::common::{RowKey, TableId};
use serde::{Deserialize, Serialize};

/// Change operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeOp::Insert => write!(f, "INSERT"),
            ChangeOp::Update => write!(f, "UPDATE"),
            ChangeOp::Delete => write!(f, "DELETE"),
        }
    }
}

/// A row-level change at a log position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent<W> {
    /// Table the row belongs to
    pub table: TableId,
    /// Primary key of the row
    pub key: RowKey,
    /// Previous row state (for UPDATE/DELETE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    /// Current row state (absent only for DELETE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
    /// Operation type
    pub op: ChangeOp,
    /// Log position the event is valid at
    pub position: W,
}

impl<W> ChangeEvent<W> {
    /// Create a new INSERT event
    pub fn insert(table: TableId, key: RowKey, after: serde_json::Value, position: W) -> Self {
        Self {
            table,
            key,
            before: None,
            after: Some(after),
            op: ChangeOp::Insert,
            position,
        }
    }

    /// Create a new UPDATE event
    pub fn update(
        table: TableId,
        key: RowKey,
        before: Option<serde_json::Value>,
        after: serde_json::Value,
        position: W,
    ) -> Self {
        Self {
            table,
            key,
            before,
            after: Some(after),
            op: ChangeOp::Update,
            position,
        }
    }

    /// Create a new DELETE event
    pub fn delete(
        table: TableId,
        key: RowKey,
        before: Option<serde_json::Value>,
        position: W,
    ) -> Self {
        Self {
            table,
            key,
            before,
            after: None,
            op: ChangeOp::Delete,
            position,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.op == ChangeOp::Delete
    }
}

/// A row produced by a range scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: RowKey,
    pub image: serde_json::Value,
}

impl Row {
    pub fn new(key: RowKey, image: serde_json::Value) -> Self {
        Self { key, image }
    }

    /// Turn the row into an INSERT stamped at `position`.
    pub fn into_event<W>(self, table: TableId, position: W) -> ChangeEvent<W> {
        ChangeEvent::insert(table, self.key, self.image, position)
    }
}
