//! Snapshot split reader
//!
//! Executes one split with the bounded backfill procedure:
//!
//! ```text
//!   low = current log position
//!   ┌── scan rows in [lower, upper) ──────────────┐   concurrently: tail the
//!   └─────────────────────────────────────────────┘   log from low into B
//!   high = current log position
//!   drain the tail up to high into B
//!   emit merge(S, B) stamped at high, then report (split, high)
//! ```
//!
//! `B` keeps only the latest event per key. The merge gives every key its
//! state exactly as of `high`: a buffered DELETE removes the row, a buffered
//! INSERT or UPDATE replaces it, anything else comes from the scan.
//!
//! Scan and tail share one task, so every event in `B` before `high` is
//! read is at or below `high`. While `B` holds `buffer_capacity` distinct
//! keys the log is not polled; the drain after `high` is unbounded but
//! limited to the events between the two watermarks.

use super::deliver;
use crate::common::{
    CdcError, ChangeEvent, ChangeOp, ChangeStream, EventSink, KeyRange, LogReader, Result, RowKey,
    RowScanner, TableDescriptor, TableId, Watermark,
};
use crate::registry::ReaderId;
use crate::split::Split;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Latest in-range change event per key.
#[derive(Debug)]
pub struct BackfillBuffer<W> {
    table: TableId,
    range: KeyRange,
    capacity: usize,
    events: HashMap<RowKey, ChangeEvent<W>>,
}

impl<W: Watermark> BackfillBuffer<W> {
    pub fn new(table: TableId, range: KeyRange, capacity: usize) -> Self {
        Self {
            table,
            range,
            capacity: capacity.max(1),
            events: HashMap::new(),
        }
    }

    /// Keep `event` if it belongs to this split. Returns whether it was kept.
    pub fn absorb(&mut self, event: ChangeEvent<W>) -> bool {
        if event.table != self.table || !self.range.contains(&event.key) {
            return false;
        }
        self.events.insert(event.key.clone(), event);
        true
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> HashMap<RowKey, ChangeEvent<W>> {
        self.events
    }
}

/// Reconcile scanned rows with buffered events.
///
/// Output is ordered by key; every event is an INSERT stamped at `high`.
pub fn merge_backfill<W: Watermark>(
    table: &TableId,
    scanned: BTreeMap<RowKey, serde_json::Value>,
    buffered: HashMap<RowKey, ChangeEvent<W>>,
    high: &W,
) -> Vec<ChangeEvent<W>> {
    let mut merged: BTreeMap<RowKey, Option<serde_json::Value>> =
        scanned.into_iter().map(|(k, v)| (k, Some(v))).collect();

    for (key, event) in buffered {
        let image = match event.op {
            ChangeOp::Delete => None,
            ChangeOp::Insert | ChangeOp::Update => event.after,
        };
        merged.insert(key, image);
    }

    merged
        .into_iter()
        .filter_map(|(key, image)| {
            image.map(|image| ChangeEvent::insert(table.clone(), key, image, high.clone()))
        })
        .collect()
}

/// Snapshot reader tuning.
#[derive(Debug, Clone)]
pub struct SnapshotReaderConfig {
    /// Distinct keys buffered before the log tail is throttled
    pub buffer_capacity: usize,
    /// Events per sink delivery
    pub batch_size: usize,
    /// Emit the raw scan at the low watermark without merging
    pub skip_backfill: bool,
}

impl Default for SnapshotReaderConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            batch_size: 1024,
            skip_backfill: false,
        }
    }
}

/// Result of one executed split.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitOutcome<W> {
    pub low_watermark: W,
    pub high_watermark: W,
    pub rows_scanned: u64,
    pub events_buffered: u64,
    pub events_emitted: u64,
}

/// Executes snapshot splits.
pub struct SnapshotSplitReader<W> {
    reader: ReaderId,
    scanner: Arc<dyn RowScanner>,
    log: Arc<dyn LogReader<W>>,
    sink: Arc<dyn EventSink<W>>,
    config: SnapshotReaderConfig,
    cancel: CancellationToken,
}

impl<W: Watermark> SnapshotSplitReader<W> {
    pub fn new(
        reader: ReaderId,
        scanner: Arc<dyn RowScanner>,
        log: Arc<dyn LogReader<W>>,
        sink: Arc<dyn EventSink<W>>,
        config: SnapshotReaderConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader,
            scanner,
            log,
            sink,
            config,
            cancel,
        }
    }

    /// Execute `split` and deliver its merged output.
    ///
    /// Retriable failures come back as [`CdcError::SplitExecution`]; the
    /// caller re-runs the whole split.
    pub async fn execute(&self, split: &Split, table: &TableDescriptor) -> Result<SplitOutcome<W>> {
        match self.run_split(split, table).await {
            Err(e) if e.is_retriable() && !matches!(e, CdcError::SplitExecution { .. }) => {
                Err(CdcError::split_execution(&split.id, e))
            }
            other => other,
        }
    }

    async fn run_split(&self, split: &Split, table: &TableDescriptor) -> Result<SplitOutcome<W>> {
        let low = self.current_position().await?;
        debug!(reader = %self.reader, split_id = %split.id, low = %low, "Split started");

        let mut rows = tokio::select! {
            _ = self.cancel.cancelled() => return Err(CdcError::Cancelled),
            rows = self.scanner.scan(table, &split.range) => rows?,
        };

        if self.config.skip_backfill {
            let mut events = Vec::new();
            loop {
                let row = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(CdcError::Cancelled),
                    row = rows.next() => row,
                };
                match row {
                    Some(row) => events.push(row?.into_event(table.id.clone(), low.clone())),
                    None => break,
                }
            }
            let rows_scanned = events.len() as u64;
            self.deliver_batches(events).await?;
            return Ok(SplitOutcome {
                high_watermark: low.clone(),
                low_watermark: low,
                rows_scanned,
                events_buffered: 0,
                events_emitted: rows_scanned,
            });
        }

        let mut tail = tokio::select! {
            _ = self.cancel.cancelled() => return Err(CdcError::Cancelled),
            tail = self.log.read_from(&low) => tail?,
        };
        let mut buffer = BackfillBuffer::new(
            table.id.clone(),
            split.range.clone(),
            self.config.buffer_capacity,
        );
        let mut scanned: BTreeMap<RowKey, serde_json::Value> = BTreeMap::new();
        let mut last_seen: Option<W> = None;
        let mut absorbed = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CdcError::Cancelled),
                row = rows.next() => match row {
                    Some(row) => {
                        let row = row?;
                        scanned.insert(row.key, row.image);
                    }
                    None => break,
                },
                event = tail.next(), if !buffer.is_full() => {
                    let event = next_in_order(event, &mut last_seen)?;
                    if buffer.absorb(event) {
                        absorbed += 1;
                    }
                }
            }
        }
        let rows_scanned = scanned.len() as u64;

        let high = self.current_position().await?;
        if high < low {
            return Err(CdcError::regression(&low, &high));
        }

        if high > low {
            absorbed += self.drain_to(&mut tail, &mut buffer, &mut last_seen, &high).await?;
        }

        let buffered = buffer.len() as u64;
        let events = merge_backfill(&table.id, scanned, buffer.into_events(), &high);
        let emitted = events.len() as u64;
        self.deliver_batches(events).await?;

        debug!(
            reader = %self.reader,
            split_id = %split.id,
            low = %low,
            high = %high,
            rows_scanned,
            absorbed,
            buffered,
            emitted,
            "Split merged and delivered"
        );

        Ok(SplitOutcome {
            low_watermark: low,
            high_watermark: high,
            rows_scanned,
            events_buffered: buffered,
            events_emitted: emitted,
        })
    }

    /// Absorb tail events until the high watermark has been seen.
    async fn drain_to(
        &self,
        tail: &mut ChangeStream<W>,
        buffer: &mut BackfillBuffer<W>,
        last_seen: &mut Option<W>,
        high: &W,
    ) -> Result<u64> {
        let mut absorbed = 0u64;
        while last_seen.as_ref().map_or(true, |p| p < high) {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Err(CdcError::Cancelled),
                event = tail.next() => next_in_order(event, last_seen)?,
            };
            if event.position <= *high && buffer.absorb(event) {
                absorbed += 1;
            }
        }
        Ok(absorbed)
    }

    async fn current_position(&self) -> Result<W> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CdcError::Cancelled),
            position = self.log.current_position() => position,
        }
    }

    async fn deliver_batches(&self, mut events: Vec<ChangeEvent<W>>) -> Result<()> {
        let batch_size = self.config.batch_size.max(1);
        while !events.is_empty() {
            let rest = events.split_off(batch_size.min(events.len()));
            deliver(self.sink.as_ref(), events, &self.cancel).await?;
            events = rest;
        }
        Ok(())
    }
}

/// Unwrap a tail item, enforcing log order.
fn next_in_order<W: Watermark>(
    item: Option<Result<ChangeEvent<W>>>,
    last_seen: &mut Option<W>,
) -> Result<ChangeEvent<W>> {
    let event = item.ok_or_else(|| CdcError::transient("change log stream ended"))??;
    if let Some(previous) = last_seen.as_ref() {
        if event.position < *previous {
            return Err(CdcError::regression(previous, &event.position));
        }
    }
    *last_seen = Some(event.position.clone());
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySink, MemorySource};
    use serde_json::json;

    fn users() -> TableDescriptor {
        TableDescriptor::with_int_key(TableId::new("public", "users"), "id")
    }

    fn reader(
        source: &MemorySource,
        sink: &MemorySink<u64>,
        config: SnapshotReaderConfig,
    ) -> SnapshotSplitReader<u64> {
        SnapshotSplitReader::new(
            ReaderId(0),
            Arc::new(source.clone()),
            Arc::new(source.clone()),
            Arc::new(sink.clone()),
            config,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_merge_update_and_delete() {
        let t = users().id;
        let scanned = BTreeMap::from([
            (RowKey::int(1), json!("a")),
            (RowKey::int(2), json!("b")),
        ]);
        let mut buffer = BackfillBuffer::new(t.clone(), KeyRange::unbounded(), 10);
        buffer.absorb(ChangeEvent::update(
            t.clone(),
            RowKey::int(1),
            Some(json!("a")),
            json!("a'"),
            5u64,
        ));
        buffer.absorb(ChangeEvent::delete(t.clone(), RowKey::int(2), Some(json!("b")), 6u64));

        let merged = merge_backfill(&t, scanned, buffer.into_events(), &7u64);
        assert_eq!(
            merged,
            vec![ChangeEvent::insert(t.clone(), RowKey::int(1), json!("a'"), 7u64)]
        );
    }

    #[test]
    fn test_merge_buffered_insert_without_scan_row() {
        let t = users().id;
        let mut buffer = BackfillBuffer::new(t.clone(), KeyRange::unbounded(), 10);
        buffer.absorb(ChangeEvent::insert(t.clone(), RowKey::int(3), json!("c"), 4u64));
        let merged = merge_backfill(&t, BTreeMap::new(), buffer.into_events(), &9u64);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].op, ChangeOp::Insert);
        assert_eq!(merged[0].position, 9);
    }

    #[test]
    fn test_buffer_last_write_wins_and_scope() {
        let t = users().id;
        let range = KeyRange::new(Some(RowKey::int(10)), Some(RowKey::int(20)));
        let mut buffer = BackfillBuffer::new(t.clone(), range, 2);

        assert!(!buffer.absorb(ChangeEvent::insert(t.clone(), RowKey::int(9), json!(9), 1u64)));
        let other = TableId::new("public", "other");
        assert!(!buffer.absorb(ChangeEvent::insert(other, RowKey::int(10), json!(1), 2u64)));
        assert!(buffer.absorb(ChangeEvent::insert(t.clone(), RowKey::int(10), json!("v1"), 3u64)));
        let update = ChangeEvent::update(t.clone(), RowKey::int(10), None, json!("v2"), 4u64);
        assert!(buffer.absorb(update));
        assert_eq!(buffer.len(), 1);
        assert!(!buffer.is_full());
        assert!(buffer.absorb(ChangeEvent::insert(t.clone(), RowKey::int(11), json!("x"), 5u64)));
        assert!(buffer.is_full());

        let events = buffer.into_events();
        assert_eq!(events[&RowKey::int(10)].after, Some(json!("v2")));
    }

    #[tokio::test]
    async fn test_execute_quiet_table() {
        let source = MemorySource::new();
        let desc = users();
        source.create_table(desc.clone());
        for k in 1..=5 {
            source.insert(&desc.id, RowKey::int(k), json!({"id": k}));
        }
        let sink = MemorySink::new();
        let split = Split::new(desc.id.clone(), 0, KeyRange::unbounded());

        let outcome = reader(&source, &sink, SnapshotReaderConfig::default())
            .execute(&split, &desc)
            .await
            .unwrap();
        assert_eq!(outcome.low_watermark, 5);
        assert_eq!(outcome.high_watermark, 5);
        assert_eq!(outcome.rows_scanned, 5);

        let events = sink.events();
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| e.op == ChangeOp::Insert && e.position == 5));
        assert_eq!(events[0].key, RowKey::int(1));
    }

    #[tokio::test]
    async fn test_execute_folds_concurrent_writes() {
        let source = MemorySource::new();
        let desc = users();
        source.create_table(desc.clone());
        for k in 1..=10 {
            source.insert(&desc.id, RowKey::int(k), json!({"id": k, "v": 0}));
        }
        let target = desc.id.clone();
        source.set_scan_hook(move |src: &MemorySource, table: &TableId, _range: &KeyRange| {
            if *table == target {
                src.update(table, RowKey::int(3), json!({"id": 3, "v": 1}));
                src.delete(table, RowKey::int(4));
                src.insert(table, RowKey::int(11), json!({"id": 11, "v": 1}));
            }
        });

        let sink = MemorySink::new();
        let split = Split::new(desc.id.clone(), 0, KeyRange::new(None, Some(RowKey::int(11))));
        let outcome = reader(&source, &sink, SnapshotReaderConfig::default())
            .execute(&split, &desc)
            .await
            .unwrap();

        assert_eq!(outcome.low_watermark, 10);
        assert_eq!(outcome.high_watermark, 13);
        let state = sink.final_state();
        assert_eq!(state.get(&(desc.id.clone(), RowKey::int(3))), Some(&json!({"id": 3, "v": 1})));
        assert!(!state.contains_key(&(desc.id.clone(), RowKey::int(4))));
        // key 11 lies outside the split
        assert!(!state.contains_key(&(desc.id.clone(), RowKey::int(11))));
        assert_eq!(state.len(), 9);
        assert!(sink.events().iter().all(|e| e.position == 13));
    }

    /// Delays every scanned row so the log tail gets polled mid-scan.
    struct SlowScan(MemorySource);

    #[async_trait::async_trait]
    impl RowScanner for SlowScan {
        async fn list_tables(&self) -> Result<Vec<TableId>> {
            self.0.list_tables().await
        }

        async fn describe(&self, table: &TableId) -> Result<Option<TableDescriptor>> {
            self.0.describe(table).await
        }

        async fn key_stats(
            &self,
            table: &TableDescriptor,
        ) -> Result<Option<crate::common::KeyStats>> {
            self.0.key_stats(table).await
        }

        async fn next_chunk_start(
            &self,
            table: &TableDescriptor,
            from: &RowKey,
            chunk_size: usize,
        ) -> Result<Option<RowKey>> {
            self.0.next_chunk_start(table, from, chunk_size).await
        }

        async fn scan(
            &self,
            table: &TableDescriptor,
            range: &KeyRange,
        ) -> Result<crate::common::RowStream> {
            let rows = self.0.scan(table, range).await?;
            Ok(rows
                .then(|row| async move {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    row
                })
                .boxed())
        }
    }

    #[tokio::test]
    async fn test_full_buffer_pauses_tail_and_drain_catches_up() {
        let source = MemorySource::new();
        let desc = users();
        source.create_table(desc.clone());
        for k in 1..=10 {
            source.insert(&desc.id, RowKey::int(k), json!({"id": k, "v": 0}));
        }
        let target = desc.id.clone();
        source.set_scan_hook(move |src: &MemorySource, table: &TableId, _range: &KeyRange| {
            if *table == target {
                for k in 1..=6 {
                    src.update(table, RowKey::int(k), json!({"id": k, "v": 1}));
                }
                src.delete(table, RowKey::int(7));
            }
        });

        let sink = MemorySink::new();
        let split = Split::new(desc.id.clone(), 0, KeyRange::unbounded());
        let config = SnapshotReaderConfig {
            buffer_capacity: 2,
            ..Default::default()
        };
        let outcome = SnapshotSplitReader::new(
            ReaderId(0),
            Arc::new(SlowScan(source.clone())),
            Arc::new(source.clone()),
            Arc::new(sink.clone()),
            config,
            CancellationToken::new(),
        )
        .execute(&split, &desc)
        .await
        .unwrap();

        assert_eq!(outcome.high_watermark, 17);
        // the drain to the high watermark is not bounded by the capacity
        assert!(outcome.events_buffered > 2);
        assert_eq!(sink.final_state(), source.contents());
        assert!(sink.events().iter().all(|e| e.position == 17));
    }

    #[tokio::test]
    async fn test_execute_skip_backfill_uses_low_watermark() {
        let source = MemorySource::new();
        let desc = users();
        source.create_table(desc.clone());
        source.insert(&desc.id, RowKey::int(1), json!({"id": 1}));
        let target = desc.id.clone();
        source.set_scan_hook(move |src: &MemorySource, table: &TableId, _range: &KeyRange| {
            if *table == target {
                src.delete(table, RowKey::int(1));
            }
        });

        let sink = MemorySink::new();
        let split = Split::new(desc.id.clone(), 0, KeyRange::unbounded());
        let outcome = reader(
            &source,
            &sink,
            SnapshotReaderConfig {
                skip_backfill: true,
                ..Default::default()
            },
        )
        .execute(&split, &desc)
        .await
        .unwrap();

        assert_eq!(outcome.high_watermark, outcome.low_watermark);
        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.events()[0].position, 1);
    }

    #[tokio::test]
    async fn test_execute_wraps_transient_failures() {
        let source = MemorySource::new();
        let desc = users();
        source.create_table(desc.clone());
        source.fail_next_scans(1);

        let sink = MemorySink::new();
        let split = Split::new(desc.id.clone(), 0, KeyRange::unbounded());
        let r = reader(&source, &sink, SnapshotReaderConfig::default());

        let err = r.execute(&split, &desc).await.unwrap_err();
        assert!(matches!(err, CdcError::SplitExecution { .. }));
        assert!(err.is_retriable());
        r.execute(&split, &desc).await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_delivers_in_batches() {
        let source = MemorySource::new();
        let desc = users();
        source.create_table(desc.clone());
        for k in 0..25 {
            source.insert(&desc.id, RowKey::int(k), json!({"id": k}));
        }
        let sink = MemorySink::new();
        let split = Split::new(desc.id.clone(), 0, KeyRange::unbounded());
        reader(
            &source,
            &sink,
            SnapshotReaderConfig {
                batch_size: 10,
                ..Default::default()
            },
        )
        .execute(&split, &desc)
        .await
        .unwrap();
        assert_eq!(sink.batch_sizes(), vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn test_execute_cancelled() {
        let source = MemorySource::new();
        let desc = users();
        source.create_table(desc.clone());
        let sink = MemorySink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let r = SnapshotSplitReader::new(
            ReaderId(0),
            Arc::new(source.clone()),
            Arc::new(source.clone()),
            Arc::new(sink.clone()),
            SnapshotReaderConfig::default(),
            cancel,
        );
        let split = Split::new(desc.id.clone(), 0, KeyRange::unbounded());
        assert!(r.execute(&split, &desc).await.unwrap_err().is_cancelled());
    }
}
