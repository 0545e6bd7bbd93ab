//! In-memory source and sink
//!
//! [`MemorySource`] is a tiny table store with a change log. Every write
//! updates the row and appends the event under one lock, so the log and the
//! rows never disagree. Positions are `u64`, starting at 1; an empty log
//! reports position 0.
//!
//! Hooks for tests:
//!
//! - [`MemorySource::set_scan_hook`] runs a callback after a scan has taken
//!   its point-in-time copy, to inject writes concurrent with the scan
//! - [`MemorySource::fail_next_scans`] and
//!   [`MemorySource::fail_next_log_reads`] inject transient failures
//!
//! [`MemorySink`] records every delivered batch and can replay them into the
//! final per-key state.

use crate::common::{
    CdcError, ChangeEvent, ChangeOp, ChangeStream, EventSink, KeyColumn, KeyRange, KeyStats,
    KeyType, KeyValue, LogReader, Result, Row, RowKey, RowScanner, RowStream, TableDescriptor,
    TableId, Watermark,
};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Callback run after a scan copied its rows.
pub type ScanHook = Arc<dyn Fn(&MemorySource, &TableId, &KeyRange) + Send + Sync>;

struct MemoryTable {
    descriptor: TableDescriptor,
    rows: BTreeMap<RowKey, serde_json::Value>,
}

#[derive(Default)]
struct Data {
    tables: BTreeMap<TableId, MemoryTable>,
    log: Vec<ChangeEvent<u64>>,
}

struct Inner {
    data: RwLock<Data>,
    head: watch::Sender<u64>,
    scan_hook: RwLock<Option<ScanHook>>,
    scan_failures: AtomicU32,
    log_read_failures: AtomicU32,
    tail_failures: AtomicU32,
}

/// In-process table store with a change log.
#[derive(Clone)]
pub struct MemorySource {
    inner: Arc<Inner>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn bounds(range: &KeyRange) -> (Bound<&RowKey>, Bound<&RowKey>) {
    let lower = range.lower.as_ref().map_or(Bound::Unbounded, Bound::Included);
    let upper = range.upper.as_ref().map_or(Bound::Unbounded, Bound::Excluded);
    (lower, upper)
}

impl MemorySource {
    pub fn new() -> Self {
        let (head, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                data: RwLock::new(Data::default()),
                head,
                scan_hook: RwLock::new(None),
                scan_failures: AtomicU32::new(0),
                log_read_failures: AtomicU32::new(0),
                tail_failures: AtomicU32::new(0),
            }),
        }
    }

    /// Create an empty table. Existing tables are left alone.
    pub fn create_table(&self, descriptor: TableDescriptor) {
        self.inner
            .data
            .write()
            .tables
            .entry(descriptor.id.clone())
            .or_insert_with(|| MemoryTable {
                descriptor,
                rows: BTreeMap::new(),
            });
    }

    pub fn insert(&self, table: &TableId, key: RowKey, image: serde_json::Value) -> u64 {
        self.write(table, key, ChangeOp::Insert, Some(image))
    }

    pub fn update(&self, table: &TableId, key: RowKey, image: serde_json::Value) -> u64 {
        self.write(table, key, ChangeOp::Update, Some(image))
    }

    pub fn delete(&self, table: &TableId, key: RowKey) -> u64 {
        self.write(table, key, ChangeOp::Delete, None)
    }

    /// Apply a row change and append its event atomically. Returns the
    /// event's position. Unknown tables are created with a key shaped
    /// like `key`.
    fn write(
        &self,
        table: &TableId,
        key: RowKey,
        op: ChangeOp,
        after: Option<serde_json::Value>,
    ) -> u64 {
        let position = {
            let mut data = self.inner.data.write();
            let entry = data.tables.entry(table.clone()).or_insert_with(|| MemoryTable {
                descriptor: inferred_descriptor(table, &key),
                rows: BTreeMap::new(),
            });
            let before = match &after {
                Some(image) => entry.rows.insert(key.clone(), image.clone()),
                None => entry.rows.remove(&key),
            };

            let position = data.log.len() as u64 + 1;
            data.log.push(ChangeEvent {
                table: table.clone(),
                key,
                before,
                after,
                op,
                position,
            });
            position
        };
        self.inner.head.send_replace(position);
        position
    }

    /// Install a hook run after every scan copied its rows.
    pub fn set_scan_hook<F>(&self, hook: F)
    where
        F: Fn(&MemorySource, &TableId, &KeyRange) + Send + Sync + 'static,
    {
        *self.inner.scan_hook.write() = Some(Arc::new(hook));
    }

    pub fn clear_scan_hook(&self) {
        *self.inner.scan_hook.write() = None;
    }

    /// The next `n` scans fail with a transient error.
    pub fn fail_next_scans(&self, n: u32) {
        self.inner.scan_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` `read_from` calls fail with a transient error.
    pub fn fail_next_log_reads(&self, n: u32) {
        self.inner.log_read_failures.store(n, Ordering::SeqCst);
    }

    /// Open log streams yield `n` transient errors in total, one at a time.
    pub fn fail_open_streams(&self, n: u32) {
        self.inner.tail_failures.store(n, Ordering::SeqCst);
    }

    /// Current rows of one table.
    pub fn rows(&self, table: &TableId) -> BTreeMap<RowKey, serde_json::Value> {
        self.inner
            .data
            .read()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Current rows of every table.
    pub fn contents(&self) -> BTreeMap<(TableId, RowKey), serde_json::Value> {
        let data = self.inner.data.read();
        data.tables
            .iter()
            .flat_map(|(id, t)| {
                t.rows
                    .iter()
                    .map(move |(k, v)| ((id.clone(), k.clone()), v.clone()))
            })
            .collect()
    }

    /// Every event written so far.
    pub fn log(&self) -> Vec<ChangeEvent<u64>> {
        self.inner.data.read().log.clone()
    }

    pub fn head(&self) -> u64 {
        *self.inner.head.borrow()
    }

    fn event_at(&self, position: u64) -> Option<ChangeEvent<u64>> {
        let index = usize::try_from(position.checked_sub(1)?).ok()?;
        self.inner.data.read().log.get(index).cloned()
    }
}

fn inferred_descriptor(table: &TableId, key: &RowKey) -> TableDescriptor {
    let columns = key
        .parts()
        .iter()
        .enumerate()
        .map(|(i, part)| {
            let key_type = match part {
                KeyValue::Int(_) => KeyType::Integer,
                KeyValue::Text(_) => KeyType::Text,
                KeyValue::Bytes(_) => KeyType::Binary,
            };
            let name = if i == 0 { "id".to_string() } else { format!("id{}", i) };
            KeyColumn::new(name, key_type)
        })
        .collect();
    TableDescriptor::new(table.clone(), columns)
}

#[async_trait]
impl RowScanner for MemorySource {
    async fn list_tables(&self) -> Result<Vec<TableId>> {
        Ok(self.inner.data.read().tables.keys().cloned().collect())
    }

    async fn describe(&self, table: &TableId) -> Result<Option<TableDescriptor>> {
        Ok(self
            .inner
            .data
            .read()
            .tables
            .get(table)
            .map(|t| t.descriptor.clone()))
    }

    async fn key_stats(&self, table: &TableDescriptor) -> Result<Option<KeyStats>> {
        let data = self.inner.data.read();
        let Some(t) = data.tables.get(&table.id) else {
            return Ok(None);
        };
        let (Some((min, _)), Some((max, _))) = (t.rows.first_key_value(), t.rows.last_key_value())
        else {
            return Ok(None);
        };
        Ok(Some(KeyStats {
            min: min.clone(),
            max: max.clone(),
            approximate_rows: t.rows.len() as u64,
        }))
    }

    async fn next_chunk_start(
        &self,
        table: &TableDescriptor,
        from: &RowKey,
        chunk_size: usize,
    ) -> Result<Option<RowKey>> {
        let data = self.inner.data.read();
        Ok(data.tables.get(&table.id).and_then(|t| {
            t.rows
                .range((Bound::Included(from), Bound::Unbounded))
                .nth(chunk_size)
                .map(|(k, _)| k.clone())
        }))
    }

    async fn scan(&self, table: &TableDescriptor, range: &KeyRange) -> Result<RowStream> {
        if take_one(&self.inner.scan_failures) {
            return Err(CdcError::transient(format!("injected scan failure on {}", table.id)));
        }

        let rows: Vec<Result<Row>> = {
            let data = self.inner.data.read();
            let t = data.tables.get(&table.id).ok_or_else(|| {
                CdcError::invalid_state(format!("unknown table {}", table.id))
            })?;
            t.rows
                .range(bounds(range))
                .map(|(k, v)| Ok(Row::new(k.clone(), v.clone())))
                .collect()
        };

        let hook = self.inner.scan_hook.read().clone();
        if let Some(hook) = hook {
            hook(self, &table.id, range);
        }

        Ok(futures::stream::iter(rows).boxed())
    }
}

#[async_trait]
impl LogReader<u64> for MemorySource {
    async fn current_position(&self) -> Result<u64> {
        Ok(self.inner.data.read().log.len() as u64)
    }

    async fn read_from(&self, from: &u64) -> Result<ChangeStream<u64>> {
        if take_one(&self.inner.log_read_failures) {
            return Err(CdcError::transient("injected log read failure"));
        }

        let source = self.clone();
        let head = self.inner.head.subscribe();
        let start = (*from).max(1);

        let stream = futures::stream::unfold(
            (source, head, start),
            |(source, mut head, next)| async move {
                loop {
                    if take_one(&source.inner.tail_failures) {
                        let err = CdcError::transient("injected log stream failure");
                        return Some((Err(err), (source, head, next)));
                    }
                    if let Some(event) = source.event_at(next) {
                        return Some((Ok(event), (source, head, next + 1)));
                    }
                    if head.changed().await.is_err() {
                        return None;
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}

struct SinkInner<W> {
    events: Mutex<Vec<ChangeEvent<W>>>,
    batches: Mutex<Vec<usize>>,
    failures: AtomicU32,
}

/// Sink that records every delivered event.
pub struct MemorySink<W> {
    inner: Arc<SinkInner<W>>,
}

impl<W> Clone for MemorySink<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W> Default for MemorySink<W> {
    fn default() -> Self {
        Self {
            inner: Arc::new(SinkInner {
                events: Mutex::new(Vec::new()),
                batches: Mutex::new(Vec::new()),
                failures: AtomicU32::new(0),
            }),
        }
    }
}

impl<W: Watermark> MemorySink<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` deliveries fail with a transient error.
    pub fn fail_next_deliveries(&self, n: u32) {
        self.inner.failures.store(n, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<ChangeEvent<W>> {
        self.inner.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.events.lock().is_empty()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.inner.batches.lock().clone()
    }

    /// Replay every delivered event into the resulting per-key state.
    pub fn final_state(&self) -> BTreeMap<(TableId, RowKey), serde_json::Value> {
        let mut state = BTreeMap::new();
        for event in self.inner.events.lock().iter() {
            let id = (event.table.clone(), event.key.clone());
            match (&event.op, &event.after) {
                (ChangeOp::Delete, _) | (_, None) => {
                    state.remove(&id);
                }
                (_, Some(after)) => {
                    state.insert(id, after.clone());
                }
            }
        }
        state
    }
}

#[async_trait]
impl<W: Watermark> EventSink<W> for MemorySink<W> {
    async fn deliver(&self, events: Vec<ChangeEvent<W>>) -> Result<()> {
        if take_one(&self.inner.failures) {
            return Err(CdcError::transient("injected delivery failure"));
        }
        self.inner.batches.lock().push(events.len());
        self.inner.events.lock().extend(events);
        Ok(())
    }
}
