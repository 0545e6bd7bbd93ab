//! Shared harness for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use rivven_backfill::checkpoint::{CheckpointSink, MemoryCheckpointSink};
use rivven_backfill::common::{
    ChangeEvent, ChangeStream, EventSink, KeyRange, KeyStats, LogReader, Result, RowKey,
    RowScanner, RowStream, TableDescriptor, TableId,
};
use rivven_backfill::memory::{MemorySink, MemorySource};
use rivven_backfill::{Capabilities, CaptureEngine, EngineConfig, EngineConfigBuilder, EngineHandle};
use futures::StreamExt;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

static INIT: Once = Once::new();

/// Initialize test logging once per process.
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rivven_backfill=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// How long convergence waiters poll before giving up.
pub const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(15);

pub fn products() -> TableId {
    TableId::new("inventory", "products")
}

pub fn orders() -> TableId {
    TableId::new("inventory", "orders")
}

pub fn row(id: i64, version: u32) -> serde_json::Value {
    json!({"id": id, "version": version})
}

/// Create `table` with an integer key and rows `1..=rows`.
pub fn seed_table(source: &MemorySource, table: &TableId, rows: i64) {
    source.create_table(TableDescriptor::with_int_key(table.clone(), "id"));
    for k in 1..=rows {
        source.insert(table, RowKey::int(k), row(k, 0));
    }
}

/// Engine config with fast timings, for the in-memory source.
pub fn base_config() -> EngineConfigBuilder {
    EngineConfig::builder()
        .hosts(["memory"])
        .tables(["inventory.*"])
        .retry_delay(Duration::from_millis(10))
        .stream_flush_interval(Duration::from_millis(20))
}

pub fn capabilities(
    source: &MemorySource,
    sink: Arc<dyn EventSink<u64>>,
    checkpoints: Arc<dyn CheckpointSink<u64>>,
) -> Capabilities<u64> {
    Capabilities {
        scanner: Arc::new(source.clone()),
        log: Arc::new(source.clone()),
        sink,
        checkpoints,
    }
}

/// A running engine and the handle to steer it.
pub struct Running {
    pub handle: EngineHandle<u64>,
    pub task: tokio::task::JoinHandle<Result<()>>,
}

impl Running {
    pub async fn stop(self) -> Result<()> {
        self.handle.shutdown();
        self.task.await.expect("engine task panicked")
    }

    pub async fn join(self) -> Result<()> {
        tokio::time::timeout(CONVERGENCE_TIMEOUT, self.task)
            .await
            .expect("engine did not finish in time")
            .expect("engine task panicked")
    }
}

pub fn start(config: EngineConfig, capabilities: Capabilities<u64>) -> Running {
    let engine = CaptureEngine::new(config, capabilities).expect("valid engine");
    let handle = engine.handle();
    let task = tokio::spawn(engine.run());
    Running { handle, task }
}

pub fn start_in_memory(
    config: EngineConfig,
    source: &MemorySource,
    sink: &MemorySink<u64>,
    checkpoints: &Arc<MemoryCheckpointSink<u64>>,
) -> Running {
    start(
        config,
        capabilities(source, Arc::new(sink.clone()), checkpoints.clone()),
    )
}

/// Current source rows of the given tables.
pub fn source_state(
    source: &MemorySource,
    tables: &[TableId],
) -> BTreeMap<(TableId, RowKey), serde_json::Value> {
    source
        .contents()
        .into_iter()
        .filter(|((t, _), _)| tables.contains(t))
        .collect()
}

/// Poll `check` until it holds or the timeout elapses.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Wait until the sink replays to exactly the source contents of `tables`.
pub async fn converges(source: &MemorySource, sink: &MemorySink<u64>, tables: &[TableId]) -> bool {
    eventually(|| sink.final_state() == source_state(source, tables)).await
}

/// Wait until the registry has issued the stream split.
pub async fn stream_started(handle: &EngineHandle<u64>) -> bool {
    let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
    while Instant::now() < deadline {
        if let Ok(state) = handle.state().await {
            if state.stream_start.is_some() && state.all_finished() {
                // give the stream reader a moment to open the log
                sleep(Duration::from_millis(50)).await;
                return true;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Sink that holds every delivery past the first `limit` until released.
pub struct GatedSink {
    inner: MemorySink<u64>,
    limit: usize,
    started: AtomicUsize,
    held: AtomicUsize,
    open: watch::Sender<bool>,
}

impl GatedSink {
    pub fn hold_after(inner: MemorySink<u64>, limit: usize) -> Self {
        let (open, _) = watch::channel(false);
        Self {
            inner,
            limit,
            started: AtomicUsize::new(0),
            held: AtomicUsize::new(0),
            open,
        }
    }

    /// Deliveries that reached the gate while it was closed.
    pub fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.open.send_replace(true);
    }
}

#[async_trait]
impl EventSink<u64> for GatedSink {
    async fn deliver(&self, events: Vec<ChangeEvent<u64>>) -> Result<()> {
        let index = self.started.fetch_add(1, Ordering::SeqCst);
        if index >= self.limit && !*self.open.borrow() {
            self.held.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.subscribe();
            let _ = open.wait_for(|open| *open).await;
        }
        self.inner.deliver(events).await
    }
}

/// Wait until the stream reader reported progress up to `position`.
pub async fn stream_progress_reaches(handle: &EngineHandle<u64>, position: u64) -> bool {
    let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
    while Instant::now() < deadline {
        if let Ok(state) = handle.state().await {
            if state.stream_position.is_some_and(|p| p >= position) {
                return true;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Scanner that yields each row only after `per_row`.
pub struct SlowScanner {
    inner: MemorySource,
    per_row: Duration,
}

impl SlowScanner {
    pub fn new(inner: MemorySource, per_row: Duration) -> Self {
        Self { inner, per_row }
    }
}

#[async_trait]
impl RowScanner for SlowScanner {
    async fn list_tables(&self) -> Result<Vec<TableId>> {
        self.inner.list_tables().await
    }

    async fn describe(&self, table: &TableId) -> Result<Option<TableDescriptor>> {
        self.inner.describe(table).await
    }

    async fn key_stats(&self, table: &TableDescriptor) -> Result<Option<KeyStats>> {
        self.inner.key_stats(table).await
    }

    async fn next_chunk_start(
        &self,
        table: &TableDescriptor,
        from: &RowKey,
        chunk_size: usize,
    ) -> Result<Option<RowKey>> {
        self.inner.next_chunk_start(table, from, chunk_size).await
    }

    async fn scan(&self, table: &TableDescriptor, range: &KeyRange) -> Result<RowStream> {
        let rows = self.inner.scan(table, range).await?;
        let per_row = self.per_row;
        Ok(rows
            .then(move |row| async move {
                sleep(per_row).await;
                row
            })
            .boxed())
    }
}

/// Log whose reported position falls back by `by` after the first `honest` calls.
pub struct RewindingLog {
    inner: MemorySource,
    honest: u32,
    by: u64,
    calls: AtomicU32,
}

impl RewindingLog {
    pub fn new(inner: MemorySource, honest: u32, by: u64) -> Self {
        Self {
            inner,
            honest,
            by,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl LogReader<u64> for RewindingLog {
    async fn current_position(&self) -> Result<u64> {
        let position = self.inner.current_position().await?;
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.honest {
            Ok(position)
        } else {
            Ok(position.saturating_sub(self.by))
        }
    }

    async fn read_from(&self, from: &u64) -> Result<ChangeStream<u64>> {
        self.inner.read_from(from).await
    }
}

/// Log that stamps the event at `position` with `stamped` instead.
pub struct MisorderedLog {
    inner: MemorySource,
    position: u64,
    stamped: u64,
}

impl MisorderedLog {
    pub fn new(inner: MemorySource, position: u64, stamped: u64) -> Self {
        Self {
            inner,
            position,
            stamped,
        }
    }
}

#[async_trait]
impl LogReader<u64> for MisorderedLog {
    async fn current_position(&self) -> Result<u64> {
        self.inner.current_position().await
    }

    async fn read_from(&self, from: &u64) -> Result<ChangeStream<u64>> {
        let (position, stamped) = (self.position, self.stamped);
        let events = self.inner.read_from(from).await?;
        Ok(events
            .map(move |event| {
                event.map(|mut event| {
                    if event.position == position {
                        event.position = stamped;
                    }
                    event
                })
            })
            .boxed())
    }
}
