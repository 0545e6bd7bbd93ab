//! # Splits
//!
//! A split is one bounded key range of one table, the unit of parallel
//! snapshot work. The splits of a table partition its key space: the first
//! starts at negative infinity, the last ends at positive infinity, and each
//! split's upper bound is the next one's lower bound.
//!
//! ```text
//!   [-inf, 100)  [100, 200)  ...  [900, +inf)
//!   UNASSIGNED ──► ASSIGNED ──► FINISHED
//!        ▲            │
//!        └── failure ─┘
//! ```

mod splitter;

pub use splitter::{validate_partition, ChunkSplitter, SplitterConfig};

use crate::common::{KeyRange, TableId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Deterministic split identifier, `<namespace>.<table>:<index>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SplitId(String);

impl SplitId {
    pub fn new(table: &TableId, index: usize) -> Self {
        Self(format!("{}:{}", table, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SplitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStatus {
    Unassigned,
    Assigned,
    Finished,
}

impl fmt::Display for SplitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitStatus::Unassigned => write!(f, "UNASSIGNED"),
            SplitStatus::Assigned => write!(f, "ASSIGNED"),
            SplitStatus::Finished => write!(f, "FINISHED"),
        }
    }
}

/// A snapshot split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub id: SplitId,
    pub table: TableId,
    pub range: KeyRange,
    pub status: SplitStatus,
}

impl Split {
    pub fn new(table: TableId, index: usize, range: KeyRange) -> Self {
        Self {
            id: SplitId::new(&table, index),
            table,
            range,
            status: SplitStatus::Unassigned,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == SplitStatus::Finished
    }
}

/// Persisted once a split's merged output has been delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitFinishedRecord<W> {
    pub split_id: SplitId,
    pub high_watermark: W,
}

/// The single assignment that moves the engine into the stream phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSplit<W> {
    /// Position to read the change log from (inclusive).
    pub start: W,
    /// Events at or below this position were already delivered by an
    /// earlier run and are skipped.
    pub skip_through: Option<W>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RowKey;

    #[test]
    fn test_split_id_is_deterministic() {
        let table = TableId::new("inventory", "orders");
        assert_eq!(SplitId::new(&table, 4).as_str(), "inventory.orders:4");
        assert_eq!(SplitId::new(&table, 4), SplitId::new(&table, 4));
    }

    #[test]
    fn test_new_split_is_unassigned() {
        let split = Split::new(
            TableId::new("public", "users"),
            0,
            KeyRange::new(None, Some(RowKey::int(100))),
        );
        assert_eq!(split.status, SplitStatus::Unassigned);
        assert!(!split.is_finished());
        assert_eq!(split.status.to_string(), "UNASSIGNED");
    }

    #[test]
    fn test_split_serde() {
        let split = Split::new(
            TableId::new("public", "users"),
            1,
            KeyRange::new(Some(RowKey::int(100)), None),
        );
        let json = serde_json::to_string(&split).unwrap();
        assert!(json.contains("\"public.users:1\""));
        let back: Split = serde_json::from_str(&json).unwrap();
        assert_eq!(back, split);
    }
}
