//! Global capture state
//!
//! [`GlobalState`] is everything a checkpoint records: the captured tables,
//! every split with its status, the high watermark of each finished split,
//! and the stream phase positions. Only the registry task mutates it; the
//! transitions here are plain synchronous functions so they can be tested
//! without a runtime.

use crate::common::{CdcError, Result, TableDescriptor, TableId, Watermark};
use crate::split::{validate_partition, Split, SplitFinishedRecord, SplitId, SplitStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A table known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedTable<W> {
    pub descriptor: TableDescriptor,
    /// Log position read before the table's key distribution was
    /// inspected. `None` for tables captured by the stream only.
    pub discovered_at: Option<W>,
    /// Number of snapshot splits the table was partitioned into.
    pub split_count: usize,
}

impl<W> CapturedTable<W> {
    pub fn id(&self) -> &TableId {
        &self.descriptor.id
    }

    /// Captured from the stream alone, without a snapshot.
    pub fn is_stream_only(&self) -> bool {
        self.split_count == 0 && self.discovered_at.is_none()
    }
}

/// A newly discovered table with its computed splits.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRegistration<W> {
    pub descriptor: TableDescriptor,
    pub splits: Vec<Split>,
    pub discovered_at: Option<W>,
}

impl<W> TableRegistration<W> {
    pub fn new(descriptor: TableDescriptor, splits: Vec<Split>, discovered_at: Option<W>) -> Self {
        Self {
            descriptor,
            splits,
            discovered_at,
        }
    }

    /// Table captured by the stream only.
    pub fn stream_only(descriptor: TableDescriptor) -> Self {
        Self::new(descriptor, Vec::new(), None)
    }
}

/// Checkpointable capture state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalState<W> {
    pub tables: Vec<CapturedTable<W>>,
    /// Splits in assignment order.
    pub splits: Vec<Split>,
    pub finished: BTreeMap<SplitId, SplitFinishedRecord<W>>,
    /// Where the stream phase starts. Computed once, when the stream split
    /// is first issued.
    pub stream_start: Option<W>,
    /// Position of the last stream event delivered downstream.
    pub stream_position: Option<W>,
}

impl<W> Default for GlobalState<W> {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            splits: Vec::new(),
            finished: BTreeMap::new(),
            stream_start: None,
            stream_position: None,
        }
    }
}

impl<W: Watermark> GlobalState<W> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, id: &TableId) -> Option<&CapturedTable<W>> {
        self.tables.iter().find(|t| t.id() == id)
    }

    pub fn contains_table(&self, id: &TableId) -> bool {
        self.table(id).is_some()
    }

    pub fn splits_of<'a>(&'a self, table: &'a TableId) -> impl Iterator<Item = &'a Split> + 'a {
        self.splits.iter().filter(move |s| &s.table == table)
    }

    pub fn split_index(&self, id: &SplitId) -> Option<usize> {
        self.splits.iter().position(|s| &s.id == id)
    }

    pub fn high_watermark(&self, id: &SplitId) -> Option<&W> {
        self.finished.get(id).map(|r| &r.high_watermark)
    }

    pub fn next_unassigned(&self) -> Option<usize> {
        self.splits
            .iter()
            .position(|s| s.status == SplitStatus::Unassigned)
    }

    pub fn all_finished(&self) -> bool {
        self.splits.iter().all(Split::is_finished)
    }

    /// Splits not yet finished.
    pub fn pending_splits(&self) -> usize {
        self.splits.iter().filter(|s| !s.is_finished()).count()
    }

    /// Add a table and its splits. Returns `false` if the table is already known.
    pub fn register(&mut self, registration: TableRegistration<W>) -> Result<bool> {
        if self.contains_table(&registration.descriptor.id) {
            return Ok(false);
        }
        if registration
            .splits
            .iter()
            .any(|s| s.table != registration.descriptor.id || s.status != SplitStatus::Unassigned)
        {
            return Err(CdcError::invalid_boundaries(format!(
                "splits registered for {} must be unassigned splits of that table",
                registration.descriptor.id
            )));
        }
        validate_partition(&registration.splits)?;

        self.tables.push(CapturedTable {
            split_count: registration.splits.len(),
            descriptor: registration.descriptor,
            discovered_at: registration.discovered_at,
        });
        self.splits.extend(registration.splits);
        Ok(true)
    }

    pub fn assign(&mut self, index: usize) {
        self.splits[index].status = SplitStatus::Assigned;
    }

    pub fn revert(&mut self, index: usize) {
        self.splits[index].status = SplitStatus::Unassigned;
    }

    pub fn finish(&mut self, index: usize, high_watermark: W) {
        let split = &mut self.splits[index];
        split.status = SplitStatus::Finished;
        self.finished.insert(
            split.id.clone(),
            SplitFinishedRecord {
                split_id: split.id.clone(),
                high_watermark,
            },
        );
    }

    /// Minimum over every finished split's high watermark and the discovery
    /// position of every table that was empty when discovered.
    pub fn compute_stream_start(&self) -> Option<W> {
        let from_splits = self.finished.values().map(|r| &r.high_watermark);
        let from_empty_tables = self
            .tables
            .iter()
            .filter(|t| t.split_count == 0)
            .filter_map(|t| t.discovered_at.as_ref());
        from_splits.chain(from_empty_tables).min().cloned()
    }

    /// Record stream progress, rejecting any backward move.
    pub fn advance_stream(&mut self, position: W) -> Result<()> {
        if let Some(previous) = &self.stream_position {
            if position < *previous {
                return Err(CdcError::regression(previous, &position));
            }
        }
        self.stream_position = Some(position);
        Ok(())
    }

    /// Prepare a restored state for a new run: splits that were in flight
    /// when the checkpoint was taken go back to the queue.
    pub fn revert_in_flight(&mut self) -> usize {
        let mut reverted = 0;
        for split in &mut self.splits {
            if split.status == SplitStatus::Assigned {
                split.status = SplitStatus::Unassigned;
                reverted += 1;
            }
        }
        reverted
    }

    /// Structural consistency of a restored state.
    pub fn validate(&self) -> Result<()> {
        for table in &self.tables {
            let splits: Vec<Split> = self.splits_of(table.id()).cloned().collect();
            if splits.len() != table.split_count {
                return Err(CdcError::invalid_state(format!(
                    "table {} records {} splits but state holds {}",
                    table.id(),
                    table.split_count,
                    splits.len()
                )));
            }
            validate_partition(&splits)?;
        }
        for split in &self.splits {
            if !self.contains_table(&split.table) {
                return Err(CdcError::invalid_state(format!(
                    "split {} belongs to unknown table {}",
                    split.id, split.table
                )));
            }
            if split.is_finished() != self.finished.contains_key(&split.id) {
                return Err(CdcError::invalid_state(format!(
                    "split {} is {} but finished record is {}",
                    split.id,
                    split.status,
                    if split.is_finished() { "missing" } else { "present" }
                )));
            }
        }
        if self.finished.len() != self.splits.iter().filter(|s| s.is_finished()).count() {
            return Err(CdcError::invalid_state(
                "finished records reference unknown splits",
            ));
        }
        Ok(())
    }
}
