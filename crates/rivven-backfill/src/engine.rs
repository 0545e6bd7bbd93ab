//! # Capture engine
//!
//! Wires the splitter, the registry task and N reader tasks together.
//!
//! ```text
//!                       ┌─────────────────┐
//!  EngineHandle ───────►│  SplitRegistry  │◄──── reader-0 ─┐
//!  (checkpoint,         │   (one task)    │◄──── reader-1 ─┼──► EventSink
//!   discover, stop)     └────────┬────────┘◄──── reader-N ─┘
//!                                │
//!                                ▼
//!                          CheckpointSink
//! ```
//!
//! A run restores the last checkpoint (or starts fresh according to the
//! startup mode), discovers every table selected by the `tables` patterns,
//! and then lets the readers pull work until the run ends:
//!
//! - every reader was told there is nothing left (snapshot-only runs)
//! - the host called [`EngineHandle::shutdown`]
//! - a reader hit a fatal error; the registry is halted first so no later
//!   checkpoint can record state past the failure
//!
//! Every non-fatal exit persists a final checkpoint.

use crate::checkpoint::CheckpointSink;
use crate::common::{
    CdcError, EngineStats, EngineStatsSnapshot, EventSink, LogReader, Result, RowScanner, TableId,
    Watermark,
};
use crate::config::{EngineConfig, StartupMode};
use crate::reader::{SnapshotSplitReader, StreamSplitReader};
use crate::registry::{
    Assignment, GlobalState, ReaderId, RegistryConfig, RegistryHandle, RegistryInbox,
    SplitRegistry, TableRegistration,
};
use crate::split::ChunkSplitter;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const REGISTRY_CHANNEL_CAPACITY: usize = 256;

/// The external collaborators an engine runs against.
pub struct Capabilities<W> {
    pub scanner: Arc<dyn RowScanner>,
    pub log: Arc<dyn LogReader<W>>,
    pub sink: Arc<dyn EventSink<W>>,
    pub checkpoints: Arc<dyn CheckpointSink<W>>,
}

impl<W> Clone for Capabilities<W> {
    fn clone(&self) -> Self {
        Self {
            scanner: self.scanner.clone(),
            log: self.log.clone(),
            sink: self.sink.clone(),
            checkpoints: self.checkpoints.clone(),
        }
    }
}

struct EngineShared<W: Watermark> {
    config: EngineConfig,
    run_id: Uuid,
    capabilities: Capabilities<W>,
    splitter: ChunkSplitter,
    registry: RegistryHandle<W>,
    stats: Arc<EngineStats>,
    cancel: CancellationToken,
}

impl<W: Watermark> EngineShared<W> {
    /// Describe and split a table for registration.
    async fn registration(&self, table: &TableId) -> Result<TableRegistration<W>> {
        let descriptor = self
            .capabilities
            .scanner
            .describe(table)
            .await?
            .ok_or_else(|| CdcError::config(format!("Table {} does not exist", table)))?;

        if !self.config.startup_mode.snapshots() {
            return Ok(TableRegistration::stream_only(descriptor));
        }

        let discovered_at = self.capabilities.log.current_position().await?;
        let splits = self
            .splitter
            .split(self.capabilities.scanner.as_ref(), &descriptor)
            .await?;
        Ok(TableRegistration::new(descriptor, splits, Some(discovered_at)))
    }

    async fn discover(&self, table: &TableId) -> Result<bool> {
        let registration = self.registration(table).await?;
        let splits = registration.splits.len();
        let added = self.registry.discover_table(registration).await?;
        if added {
            debug!(run_id = %self.run_id, table = %table, splits, "Table registered");
        }
        Ok(added)
    }
}

/// Cloneable control surface of an engine, usable before and during `run`.
///
/// Calls that go through the registry complete once `run` has started it.
pub struct EngineHandle<W: Watermark> {
    shared: Arc<EngineShared<W>>,
}

impl<W: Watermark> Clone for EngineHandle<W> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<W: Watermark> EngineHandle<W> {
    pub fn run_id(&self) -> Uuid {
        self.shared.run_id
    }

    /// Persist the current state. Fails once the engine halted on a fatal
    /// error.
    pub async fn checkpoint(&self) -> Result<GlobalState<W>> {
        self.shared.registry.checkpoint().await
    }

    /// Add a table to the capture. Returns `false` if it was already captured.
    ///
    /// After the stream phase began the outcome depends on the
    /// newly-added-table policy: `reject` answers with
    /// [`CdcError::LateTableDiscoveryConflict`] and leaves the engine running.
    pub async fn discover_table(&self, table: TableId) -> Result<bool> {
        self.shared.discover(&table).await
    }

    /// Copy of the current state, without persisting it.
    pub async fn state(&self) -> Result<GlobalState<W>> {
        self.shared.registry.state().await
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Ask the engine to stop. `run` returns `Ok` once every task wound down.
    pub fn shutdown(&self) {
        if !self.shared.cancel.is_cancelled() {
            info!(run_id = %self.shared.run_id, "Capture engine shutdown requested");
        }
        self.shared.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

/// Parallel snapshot and change stream engine over one source.
pub struct CaptureEngine<W: Watermark> {
    shared: Arc<EngineShared<W>>,
    inbox: RegistryInbox<W>,
}

impl<W> CaptureEngine<W>
where
    W: Watermark + FromStr,
    <W as FromStr>::Err: fmt::Display,
{
    pub fn new(config: EngineConfig, capabilities: Capabilities<W>) -> Result<Self> {
        config.validate()?;
        let (registry, inbox) = RegistryHandle::channel(REGISTRY_CHANNEL_CAPACITY);
        let shared = EngineShared {
            splitter: ChunkSplitter::new(config.splitter_config()),
            config,
            run_id: Uuid::new_v4(),
            capabilities,
            registry,
            stats: Arc::new(EngineStats::new()),
            cancel: CancellationToken::new(),
        };
        Ok(Self {
            shared: Arc::new(shared),
            inbox,
        })
    }

    pub fn handle(&self) -> EngineHandle<W> {
        EngineHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Run until the work is done, the host shuts the engine down, or a
    /// fatal error occurs.
    pub async fn run(self) -> Result<()> {
        let Self { shared, inbox } = self;
        let config = &shared.config;
        info!(
            run_id = %shared.run_id,
            startup_mode = %config.startup_mode,
            parallelism = config.parallelism,
            chunk_size = config.chunk_size,
            late_discovery = %config.late_discovery,
            "Capture engine starting"
        );

        let startup_position = shared.capabilities.log.current_position().await?;
        let state = initial_state(&shared, startup_position.clone()).await?;

        let registry = SplitRegistry::new(
            state,
            RegistryConfig {
                stream_enabled: config.startup_mode.streams(),
                late_discovery: config.late_discovery,
                max_retries: config.max_retries,
                startup_position,
            },
            shared.capabilities.checkpoints.clone(),
            shared.stats.clone(),
            inbox,
        );
        let registry_task = tokio::spawn(registry.run());

        let result = match discover_selected(&shared).await {
            Ok(()) => drive(&shared).await,
            Err(e) => {
                error!(run_id = %shared.run_id, error = %e, "Table discovery failed");
                Err(e)
            }
        };

        match &result {
            Ok(()) => match shared.registry.checkpoint().await {
                Ok(state) => debug!(
                    run_id = %shared.run_id,
                    pending = state.pending_splits(),
                    "Final checkpoint persisted"
                ),
                Err(e) => warn!(run_id = %shared.run_id, error = %e, "Final checkpoint failed"),
            },
            Err(_) => {
                let _ = shared.registry.halt().await;
            }
        }

        shared.cancel.cancel();
        let _ = shared.registry.shutdown().await;
        if let Err(e) = registry_task.await {
            warn!(run_id = %shared.run_id, error = %e, "Registry task ended abnormally");
        }

        info!(
            run_id = %shared.run_id,
            ok = result.is_ok(),
            stats = ?shared.stats.snapshot(),
            "Capture engine stopped"
        );
        result
    }
}

/// Restored state, or a fresh one positioned for the startup mode.
async fn initial_state<W>(shared: &EngineShared<W>, current: W) -> Result<GlobalState<W>>
where
    W: Watermark + FromStr,
    <W as FromStr>::Err: fmt::Display,
{
    if let Some(mut state) = shared.capabilities.checkpoints.restore().await? {
        state.validate()?;
        let reverted = state.revert_in_flight();
        info!(
            run_id = %shared.run_id,
            tables = state.tables.len(),
            splits = state.splits.len(),
            pending = state.pending_splits(),
            reverted,
            stream_position = ?state.stream_position,
            "Restored from checkpoint"
        );
        return Ok(state);
    }

    let mut state = GlobalState::new();
    match &shared.config.startup_mode {
        StartupMode::Initial | StartupMode::SnapshotOnly => {}
        StartupMode::LatestOffset => {
            state.stream_start = Some(current.clone());
            state.stream_position = Some(current);
        }
        StartupMode::SpecificOffset(offset) => {
            let position = offset.parse::<W>().map_err(|e| {
                CdcError::config(format!("Invalid startup offset '{}': {}", offset, e))
            })?;
            state.stream_start = Some(position);
        }
    }
    Ok(state)
}

/// Register every selected table that the state does not know yet.
async fn discover_selected<W: Watermark>(shared: &EngineShared<W>) -> Result<()> {
    let selector = shared.config.table_selector()?;
    let available = shared.capabilities.scanner.list_tables().await?;
    let selected = selector.select(&available);
    let known = shared.registry.state().await?;

    if selected.is_empty() {
        warn!(
            run_id = %shared.run_id,
            tables = ?shared.config.tables,
            "No table matches the configured patterns"
        );
    }

    let mut added = 0usize;
    let mut rejected = 0usize;
    for table in selected.iter().filter(|t| !known.contains_table(t)) {
        if shared.cancel.is_cancelled() {
            return Ok(());
        }
        match shared.discover(table).await {
            Ok(true) => added += 1,
            Ok(false) => {}
            // restored past the snapshot phase under the reject policy
            Err(CdcError::LateTableDiscoveryConflict(_)) => {
                warn!(
                    run_id = %shared.run_id,
                    table = %table,
                    "Skipping table added after stream start"
                );
                rejected += 1;
            }
            Err(e) => return Err(e),
        }
    }
    info!(
        run_id = %shared.run_id,
        selected = selected.len(),
        added,
        rejected,
        "Tables discovered"
    );
    Ok(())
}

/// Run the reader tasks (plus the periodic checkpointer) to completion.
async fn drive<W: Watermark>(shared: &Arc<EngineShared<W>>) -> Result<()> {
    let checkpointer = shared.config.checkpoint_interval.map(|interval| {
        let stop = shared.cancel.child_token();
        let task = tokio::spawn(periodic_checkpoints(shared.clone(), interval, stop.clone()));
        (task, stop)
    });

    let mut readers = JoinSet::new();
    for id in 0..shared.config.parallelism {
        let reader = ReaderId(id as u32);
        readers.spawn(reader_loop(shared.clone(), reader));
    }

    let mut outcome = Ok(());
    while let Some(joined) = readers.join_next().await {
        let result = joined
            .map_err(|e| CdcError::other(format!("reader task failed: {}", e)))
            .and_then(|r| r);
        if let Err(e) = result {
            if outcome.is_ok() {
                error!(
                    run_id = %shared.run_id,
                    error = %e,
                    code = e.error_code(),
                    "Fatal error, halting engine"
                );
                let _ = shared.registry.halt().await;
                shared.cancel.cancel();
                outcome = Err(e);
            } else {
                debug!(run_id = %shared.run_id, error = %e, "Further reader error after halt");
            }
        }
    }

    if let Some((task, stop)) = checkpointer {
        stop.cancel();
        let _ = task.await;
    }
    outcome
}

async fn periodic_checkpoints<W: Watermark>(
    shared: Arc<EngineShared<W>>,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = shared.registry.checkpoint().await {
                    warn!(run_id = %shared.run_id, error = %e, "Periodic checkpoint failed");
                }
            }
        }
    }
}

/// Pull work from the registry until told there is none left.
async fn reader_loop<W: Watermark>(shared: Arc<EngineShared<W>>, reader: ReaderId) -> Result<()> {
    let caps = &shared.capabilities;
    let cancel = &shared.cancel;
    let retry = shared.config.retry_config();
    let snapshot = SnapshotSplitReader::new(
        reader,
        caps.scanner.clone(),
        caps.log.clone(),
        caps.sink.clone(),
        shared.config.snapshot_reader_config(),
        cancel.clone(),
    );

    loop {
        let assignment = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            assignment = shared.registry.request_split(reader) => assignment,
        };
        let assignment = match assignment {
            Ok(assignment) => assignment,
            Err(CdcError::RegistryClosed) if cancel.is_cancelled() => return Ok(()),
            Err(e) => return Err(e),
        };

        match assignment {
            Assignment::Snapshot { split, table } => {
                match snapshot.execute(&split, &table).await {
                    Ok(outcome) => {
                        shared
                            .registry
                            .report_finished(reader, split.id.clone(), outcome.high_watermark)
                            .await?;
                        shared.stats.record_split_finished(
                            outcome.rows_scanned,
                            outcome.events_buffered,
                            outcome.events_emitted,
                        );
                    }
                    Err(e) if e.is_cancelled() => return Ok(()),
                    Err(e) if e.is_retriable() => {
                        let failures = shared.registry.report_failure(reader, e.to_string()).await?;
                        let delay = retry.delay_for_attempt(failures.saturating_sub(1));
                        warn!(
                            reader = %reader,
                            split_id = %split.id,
                            error = %e,
                            failures,
                            delay_ms = delay.as_millis() as u64,
                            "Split failed, backing off"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            Assignment::Stream(assignment) => {
                let stream = StreamSplitReader::new(
                    reader,
                    caps.log.clone(),
                    caps.sink.clone(),
                    shared.registry.clone(),
                    shared.stats.clone(),
                    shared.config.stream_reader_config(),
                    cancel.clone(),
                );
                return match stream.run(assignment).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        let _ = shared.registry.report_failure(reader, e.to_string()).await;
                        Err(e)
                    }
                };
            }
            Assignment::NoMoreSplits => {
                debug!(reader = %reader, "No more splits, reader exiting");
                return Ok(());
            }
        }
    }
}

/// Builds engines for a fixed set of capabilities from flat host options.
pub struct EngineFactory<W> {
    capabilities: Capabilities<W>,
}

impl<W> EngineFactory<W>
where
    W: Watermark + FromStr,
    <W as FromStr>::Err: fmt::Display,
{
    pub fn new(capabilities: Capabilities<W>) -> Self {
        Self { capabilities }
    }

    pub fn create(&self, options: &HashMap<String, String>) -> Result<CaptureEngine<W>> {
        create(options, self.capabilities.clone())
    }
}

/// Build an engine from flat key/value options.
pub fn create<W>(
    options: &HashMap<String, String>,
    capabilities: Capabilities<W>,
) -> Result<CaptureEngine<W>>
where
    W: Watermark + FromStr,
    <W as FromStr>::Err: fmt::Display,
{
    let config = EngineConfig::from_options(options)?;
    CaptureEngine::new(config, capabilities)
}
