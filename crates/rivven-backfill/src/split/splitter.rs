//! Chunk splitter
//!
//! Partitions a table's key space into splits of roughly `chunk_size` rows.
//!
//! | Situation | Result |
//! |-----------|--------|
//! | parallel snapshot disabled | one split `[-inf, +inf)` |
//! | empty table | no splits |
//! | single integer key, dense enough | even boundaries every `step` keys |
//! | anything else | boundaries walked row by row through the source |
//!
//! Density is `(max - min + 1) / approximate_rows`. A table is split evenly
//! when the density lies inside the configured bounds; `step` is then
//! `chunk_size * density`, and the boundaries are the multiples of `step`
//! strictly between `min` and `max`.

use super::Split;
use crate::common::{CdcError, KeyRange, Result, RowKey, RowScanner, TableDescriptor, TableId};
use tracing::debug;

/// Chunking configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitterConfig {
    /// Target rows per split
    pub chunk_size: usize,
    /// Chunked (parallel) snapshot; when off every table is one split
    pub enabled: bool,
    /// Lowest key density still split evenly
    pub even_distribution_lower: f64,
    /// Highest key density still split evenly
    pub even_distribution_upper: f64,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8096,
            enabled: true,
            even_distribution_lower: 0.05,
            even_distribution_upper: 1000.0,
        }
    }
}

/// Computes the splits of a table from its current key distribution.
#[derive(Debug, Clone)]
pub struct ChunkSplitter {
    config: SplitterConfig,
}

impl ChunkSplitter {
    pub fn new(config: SplitterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SplitterConfig {
        &self.config
    }

    /// Split `table` into an ordered, gap-free sequence of key ranges.
    pub async fn split(
        &self,
        scanner: &dyn RowScanner,
        table: &TableDescriptor,
    ) -> Result<Vec<Split>> {
        if !self.config.enabled {
            debug!(table = %table.id, "Parallel snapshot disabled, single split");
            return Ok(vec![Split::new(table.id.clone(), 0, KeyRange::unbounded())]);
        }

        let Some(stats) = scanner.key_stats(table).await? else {
            debug!(table = %table.id, "Table is empty, no splits");
            return Ok(Vec::new());
        };

        let boundaries = match self.even_step(table, &stats.min, &stats.max, stats.approximate_rows)
        {
            Some((min, max, step)) => {
                debug!(table = %table.id, min, max, step, "Splitting evenly");
                even_boundaries(min, max, step)
            }
            None => {
                debug!(table = %table.id, "Splitting by probing chunk starts");
                self.walk_boundaries(scanner, table, &stats.min).await?
            }
        };

        let splits = build_splits(&table.id, boundaries);
        validate_partition(&splits)?;
        debug!(table = %table.id, splits = splits.len(), "Computed splits");
        Ok(splits)
    }

    /// `(min, max, step)` when the table qualifies for even splitting.
    fn even_step(
        &self,
        table: &TableDescriptor,
        min: &RowKey,
        max: &RowKey,
        approximate_rows: u64,
    ) -> Option<(i64, i64, i64)> {
        if !table.has_single_int_key() {
            return None;
        }
        let (min, max) = (min.as_single_int()?, max.as_single_int()?);
        if max < min {
            return None;
        }

        let span = (i128::from(max) - i128::from(min) + 1) as f64;
        let factor = span / approximate_rows.max(1) as f64;
        if factor < self.config.even_distribution_lower
            || factor > self.config.even_distribution_upper
        {
            return None;
        }

        let step = (self.config.chunk_size as f64 * factor).round();
        let step = if step >= i64::MAX as f64 {
            i64::MAX
        } else {
            (step as i64).max(1)
        };
        Some((min, max, step))
    }

    async fn walk_boundaries(
        &self,
        scanner: &dyn RowScanner,
        table: &TableDescriptor,
        min: &RowKey,
    ) -> Result<Vec<RowKey>> {
        let chunk_size = self.config.chunk_size.max(1);
        let mut boundaries = Vec::new();
        let mut current = min.clone();

        while let Some(next) = scanner
            .next_chunk_start(table, &current, chunk_size)
            .await?
        {
            if next <= current {
                return Err(CdcError::invalid_boundaries(format!(
                    "chunk start for {} did not advance past {} (got {})",
                    table.id, current, next
                )));
            }
            boundaries.push(next.clone());
            current = next;
        }
        Ok(boundaries)
    }
}

/// Multiples of `step` strictly between `min` and `max`.
fn even_boundaries(min: i64, max: i64, step: i64) -> Vec<RowKey> {
    let mut boundaries = Vec::new();
    let mut next = min
        .div_euclid(step)
        .checked_add(1)
        .and_then(|n| n.checked_mul(step));

    while let Some(b) = next {
        if b >= max {
            break;
        }
        if b > min {
            boundaries.push(RowKey::int(b));
        }
        next = b.checked_add(step);
    }
    boundaries
}

fn build_splits(table: &TableId, boundaries: Vec<RowKey>) -> Vec<Split> {
    let mut splits = Vec::with_capacity(boundaries.len() + 1);
    let mut lower = None;
    for (index, upper) in boundaries.into_iter().enumerate() {
        splits.push(Split::new(
            table.clone(),
            index,
            KeyRange::new(lower, Some(upper.clone())),
        ));
        lower = Some(upper);
    }
    splits.push(Split::new(
        table.clone(),
        splits.len(),
        KeyRange::new(lower, None),
    ));
    splits
}

/// Check that `splits` exactly partition one table's key space.
///
/// An empty sequence is valid (empty table).
pub fn validate_partition(splits: &[Split]) -> Result<()> {
    let (Some(first), Some(last)) = (splits.first(), splits.last()) else {
        return Ok(());
    };

    if first.range.lower.is_some() {
        return Err(CdcError::invalid_boundaries(format!(
            "first split {} does not start at -inf",
            first.id
        )));
    }
    if last.range.upper.is_some() {
        return Err(CdcError::invalid_boundaries(format!(
            "last split {} does not end at +inf",
            last.id
        )));
    }

    for split in splits {
        if split.table != first.table {
            return Err(CdcError::invalid_boundaries(format!(
                "split {} belongs to {}, expected {}",
                split.id, split.table, first.table
            )));
        }
        if let (Some(lower), Some(upper)) = (&split.range.lower, &split.range.upper) {
            if lower >= upper {
                return Err(CdcError::invalid_boundaries(format!(
                    "split {} has empty range {}",
                    split.id, split.range
                )));
            }
        }
    }

    for pair in splits.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        match (&a.range.upper, &b.range.lower) {
            (Some(upper), Some(lower)) if upper == lower => {}
            _ => {
                return Err(CdcError::invalid_boundaries(format!(
                    "splits {} {} and {} {} are not adjacent",
                    a.id, a.range, b.id, b.range
                )))
            }
        }
    }
    Ok(())
}
