//! Engine counters
//!
//! Lock-free counters shared by every task of a running engine. Export to a
//! metrics backend is left to the host; [`EngineStats::snapshot`] gives a
//! consistent-enough copy for that.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EngineStats {
    splits_assigned: AtomicU64,
    splits_finished: AtomicU64,
    splits_failed: AtomicU64,
    rows_scanned: AtomicU64,
    backfill_events_buffered: AtomicU64,
    snapshot_events_emitted: AtomicU64,
    stream_events_emitted: AtomicU64,
    stream_events_dropped: AtomicU64,
    checkpoints_taken: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_split_assigned(&self) {
        self.splits_assigned.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished split and the events its merge emitted.
    pub fn record_split_finished(&self, rows_scanned: u64, buffered: u64, emitted: u64) {
        self.splits_finished.fetch_add(1, Ordering::Relaxed);
        self.rows_scanned.fetch_add(rows_scanned, Ordering::Relaxed);
        self.backfill_events_buffered
            .fetch_add(buffered, Ordering::Relaxed);
        self.snapshot_events_emitted
            .fetch_add(emitted, Ordering::Relaxed);
    }

    pub fn record_split_failed(&self) {
        self.splits_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_batch(&self, emitted: u64, dropped: u64) {
        self.stream_events_emitted
            .fetch_add(emitted, Ordering::Relaxed);
        self.stream_events_dropped
            .fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self) {
        self.checkpoints_taken.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            splits_assigned: self.splits_assigned.load(Ordering::Relaxed),
            splits_finished: self.splits_finished.load(Ordering::Relaxed),
            splits_failed: self.splits_failed.load(Ordering::Relaxed),
            rows_scanned: self.rows_scanned.load(Ordering::Relaxed),
            backfill_events_buffered: self.backfill_events_buffered.load(Ordering::Relaxed),
            snapshot_events_emitted: self.snapshot_events_emitted.load(Ordering::Relaxed),
            stream_events_emitted: self.stream_events_emitted.load(Ordering::Relaxed),
            stream_events_dropped: self.stream_events_dropped.load(Ordering::Relaxed),
            checkpoints_taken: self.checkpoints_taken.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatsSnapshot {
    pub splits_assigned: u64,
    pub splits_finished: u64,
    pub splits_failed: u64,
    pub rows_scanned: u64,
    pub backfill_events_buffered: u64,
    pub snapshot_events_emitted: u64,
    pub stream_events_emitted: u64,
    pub stream_events_dropped: u64,
    pub checkpoints_taken: u64,
}
