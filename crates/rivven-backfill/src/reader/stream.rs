//! Stream split reader
//!
//! Reads the change log forward from the stream start and emits every event
//! that no snapshot split has already folded into its backfilled output.
//!
//! ## Filter
//!
//! | Table | Event emitted when |
//! |-------|--------------------|
//! | not captured | never |
//! | captured from the stream only | always |
//! | empty at discovery | `position > discovered_at` |
//! | split | `position > high watermark` of the split holding the key |
//!
//! The largest high watermark of a table is checked first; past it no range
//! lookup is needed.
//!
//! ## Gate
//!
//! The registry publishes a [`StreamGate`] over a `watch` channel. When a
//! table is discovered mid-stream the gate closes; the reader flushes what
//! it has and holds the next event until the gate reopens with a filter that
//! covers the new table's splits.

use super::deliver;
use crate::common::{
    CdcError, ChangeEvent, EngineStats, EventSink, KeyRange, LogReader, Result, RetryConfig,
    TableId, Watermark,
};
use crate::registry::{GlobalState, ReaderId, RegistryHandle, StreamAssignment};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of filtering one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Emit,
    Drop,
}

#[derive(Debug, Clone, PartialEq)]
enum TableFilter<W> {
    StreamOnly,
    Discovered(W),
    Splits {
        /// Ranges in key order with their split's high watermark
        ranges: Vec<(KeyRange, W)>,
        max_high_watermark: W,
    },
}

/// Per-table dedup filter built from finished splits.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFilter<W> {
    tables: HashMap<TableId, TableFilter<W>>,
}

impl<W> Default for StreamFilter<W> {
    fn default() -> Self {
        Self {
            tables: HashMap::new(),
        }
    }
}

impl<W: Watermark> StreamFilter<W> {
    /// Build the filter for every captured table. Every split must be finished.
    pub fn from_state(state: &GlobalState<W>) -> Result<Self> {
        let mut tables = HashMap::with_capacity(state.tables.len());
        for table in &state.tables {
            let filter = if table.split_count > 0 {
                let mut ranges = Vec::with_capacity(table.split_count);
                for split in state.splits_of(table.id()) {
                    let hw = state.high_watermark(&split.id).ok_or_else(|| {
                        CdcError::invalid_state(format!(
                            "split {} is not finished, cannot build stream filter",
                            split.id
                        ))
                    })?;
                    ranges.push((split.range.clone(), hw.clone()));
                }
                let max_high_watermark = ranges
                    .iter()
                    .map(|(_, hw)| hw)
                    .max()
                    .cloned()
                    .ok_or_else(|| {
                        CdcError::invalid_state(format!("table {} has no splits", table.id()))
                    })?;
                TableFilter::Splits {
                    ranges,
                    max_high_watermark,
                }
            } else if let Some(at) = &table.discovered_at {
                TableFilter::Discovered(at.clone())
            } else {
                TableFilter::StreamOnly
            };
            tables.insert(table.id().clone(), filter);
        }
        Ok(Self { tables })
    }

    pub fn decide(&self, event: &ChangeEvent<W>) -> FilterDecision {
        let emit = match self.tables.get(&event.table) {
            None => false,
            Some(TableFilter::StreamOnly) => true,
            Some(TableFilter::Discovered(at)) => event.position > *at,
            Some(TableFilter::Splits {
                ranges,
                max_high_watermark,
            }) => {
                if event.position > *max_high_watermark {
                    true
                } else {
                    let index = ranges.partition_point(|(r, _)| r.ends_at_or_before(&event.key));
                    match ranges.get(index) {
                        Some((_, hw)) => event.position > *hw,
                        None => true,
                    }
                }
            }
        };
        if emit {
            FilterDecision::Emit
        } else {
            FilterDecision::Drop
        }
    }

    pub fn captures(&self, table: &TableId) -> bool {
        self.tables.contains_key(table)
    }
}

/// State published by the registry to the stream reader.
#[derive(Debug, Clone)]
pub struct StreamGate<W> {
    pub open: bool,
    pub filter: Arc<StreamFilter<W>>,
    /// Bumped on every reopen
    pub generation: u64,
}

impl<W> StreamGate<W> {
    pub fn closed() -> Self {
        Self {
            open: false,
            filter: Arc::new(StreamFilter::default()),
            generation: 0,
        }
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    pub fn reopen(&mut self, filter: Arc<StreamFilter<W>>) {
        self.open = true;
        self.filter = filter;
        self.generation += 1;
    }
}

/// Stream reader tuning.
#[derive(Debug, Clone)]
pub struct StreamReaderConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for StreamReaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            flush_interval: Duration::from_millis(200),
            retry: RetryConfig::default(),
        }
    }
}

/// Executes the stream split.
pub struct StreamSplitReader<W> {
    reader: ReaderId,
    log: Arc<dyn LogReader<W>>,
    sink: Arc<dyn EventSink<W>>,
    registry: RegistryHandle<W>,
    stats: Arc<EngineStats>,
    config: StreamReaderConfig,
    cancel: CancellationToken,
}

/// Pending output of the current segment.
struct Batch<W> {
    events: Vec<ChangeEvent<W>>,
    dropped: u64,
}

impl<W: Watermark> StreamSplitReader<W> {
    pub fn new(
        reader: ReaderId,
        log: Arc<dyn LogReader<W>>,
        sink: Arc<dyn EventSink<W>>,
        registry: RegistryHandle<W>,
        stats: Arc<EngineStats>,
        config: StreamReaderConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader,
            log,
            sink,
            registry,
            stats,
            config,
            cancel,
        }
    }

    /// Run until cancelled. Returns an error only when the stream cannot
    /// continue.
    pub async fn run(&self, assignment: StreamAssignment<W>) -> Result<()> {
        let StreamAssignment { split, mut gate } = assignment;
        let mut delivered = split.skip_through.clone();
        let mut failures = 0u32;

        info!(
            reader = %self.reader,
            start = %split.start,
            skip_through = ?split.skip_through,
            "Stream reader started"
        );

        loop {
            let from = delivered.clone().unwrap_or_else(|| split.start.clone());
            let before = delivered.clone();
            match self.read_segment(&from, &mut delivered, &mut gate).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_cancelled() => return Ok(()),
                Err(e) if e.is_retriable() => {
                    if delivered != before {
                        failures = 0;
                    }
                    failures += 1;
                    if !self.config.retry.should_retry(failures) {
                        return Err(e);
                    }
                    let delay = self.config.retry.delay_for_attempt(failures - 1);
                    warn!(
                        reader = %self.reader,
                        error = %e,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "Stream segment failed, restarting from last delivered position"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One uninterrupted read of the log. `Ok` only on cancellation.
    async fn read_segment(
        &self,
        from: &W,
        delivered: &mut Option<W>,
        gate: &mut watch::Receiver<StreamGate<W>>,
    ) -> Result<()> {
        let Some(mut filter) = self.await_open_gate(gate).await? else {
            return Ok(());
        };

        let mut events = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            stream = self.log.read_from(from) => stream?,
        };
        let flush_interval = self.config.flush_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let batch_size = self.config.batch_size.max(1);
        let mut batch = Batch {
            events: Vec::with_capacity(batch_size),
            dropped: 0,
        };
        let mut last_seen: Option<W> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    self.flush(&mut batch, delivered).await?;
                    continue;
                }
                next = events.next() => next,
            };
            let event = match next {
                Some(event) => event?,
                None => return Err(CdcError::transient("change log stream ended")),
            };

            if let Some(previous) = &last_seen {
                if event.position < *previous {
                    return Err(CdcError::regression(previous, &event.position));
                }
            }
            last_seen = Some(event.position.clone());

            if gate.has_changed().map_err(|_| CdcError::RegistryClosed)? {
                self.flush(&mut batch, delivered).await?;
                match self.await_open_gate(gate).await? {
                    Some(f) => filter = f,
                    None => return Ok(()),
                }
            }

            if delivered.as_ref().is_some_and(|d| event.position <= *d) {
                continue;
            }

            match filter.decide(&event) {
                FilterDecision::Emit => batch.events.push(event),
                FilterDecision::Drop => batch.dropped += 1,
            }
            if batch.events.len() >= batch_size {
                self.flush(&mut batch, delivered).await?;
            }
        }
    }

    /// Wait for an open gate and return its filter. `None` when cancelled.
    async fn await_open_gate(
        &self,
        gate: &mut watch::Receiver<StreamGate<W>>,
    ) -> Result<Option<Arc<StreamFilter<W>>>> {
        let mut announced = false;
        loop {
            let current = gate.borrow_and_update().clone();
            if current.open {
                if announced {
                    info!(reader = %self.reader, generation = current.generation, "Stream resumed");
                }
                return Ok(Some(current.filter));
            }
            if !announced {
                info!(reader = %self.reader, "Stream paused, waiting for re-snapshot");
                announced = true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                changed = gate.changed() => changed.map_err(|_| CdcError::RegistryClosed)?,
            }
        }
    }

    async fn flush(&self, batch: &mut Batch<W>, delivered: &mut Option<W>) -> Result<()> {
        let dropped = std::mem::take(&mut batch.dropped);
        let Some(last) = batch.events.last().map(|e| e.position.clone()) else {
            self.stats.record_stream_batch(0, dropped);
            return Ok(());
        };
        let events = std::mem::take(&mut batch.events);
        let emitted = events.len() as u64;

        deliver(self.sink.as_ref(), events, &self.cancel).await?;
        self.registry.report_stream_progress(last.clone()).await?;
        self.stats.record_stream_batch(emitted, dropped);
        debug!(reader = %self.reader, emitted, dropped, position = %last, "Stream batch delivered");
        *delivered = Some(last);
        Ok(())
    }
}
