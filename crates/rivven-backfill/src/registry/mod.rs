//! # Split registry
//!
//! The single owner of [`GlobalState`]. The registry runs as its own task and
//! receives every request over a channel, so state transitions are applied one
//! at a time and no two readers can ever be handed the same split.
//!
//! ```text
//!  reader-0 ─┐                       ┌──────────────────────────┐
//!  reader-1 ─┼── RegistryCommand ───►│ SplitRegistry (one task) │──► CheckpointSink
//!  engine   ─┘    + oneshot reply    │   GlobalState            │
//!                                    └────────────┬─────────────┘
//!                                                 │ watch
//!                                                 ▼
//!                                      StreamGate (stream reader)
//! ```
//!
//! Readers ask for work with [`RegistryHandle::request_split`]. While a
//! snapshot split is unassigned they get one; once every split is finished
//! exactly one reader gets the stream split; requests that cannot be served
//! yet are parked until something changes.

mod state;

pub use state::{CapturedTable, GlobalState, TableRegistration};

use crate::checkpoint::CheckpointSink;
use crate::common::{CdcError, EngineStats, KeyRange, Result, TableDescriptor, Watermark};
use crate::reader::stream::{StreamFilter, StreamGate};
use crate::split::{Split, SplitId, SplitStatus, StreamSplit};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Identity of a reader task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReaderId(pub u32);

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reader-{}", self.0)
    }
}

/// What to do with a table discovered after the stream split was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LateDiscoveryPolicy {
    /// Pause the stream, snapshot the new table, then resume.
    Resnapshot,
    /// Refuse the table with [`CdcError::LateTableDiscoveryConflict`].
    #[default]
    Reject,
}

impl FromStr for LateDiscoveryPolicy {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "resnapshot" => Ok(Self::Resnapshot),
            "reject" => Ok(Self::Reject),
            other => Err(CdcError::config(format!(
                "Unknown newly-added-table policy '{}' (expected resnapshot or reject)",
                other
            ))),
        }
    }
}

impl fmt::Display for LateDiscoveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resnapshot => write!(f, "resnapshot"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// Registry behavior.
#[derive(Debug, Clone)]
pub struct RegistryConfig<W> {
    /// Issue a stream split once the snapshot is done. Off for snapshot-only runs.
    pub stream_enabled: bool,
    pub late_discovery: LateDiscoveryPolicy,
    /// Failure reports tolerated per split; the next one is fatal.
    pub max_retries: u32,
    /// Stream start when no table contributes a position.
    pub startup_position: W,
}

/// Answer to a split request.
#[derive(Debug)]
pub enum Assignment<W> {
    /// Execute one snapshot split.
    Snapshot {
        split: Split,
        table: TableDescriptor,
    },
    /// Read the change log from here on.
    Stream(StreamAssignment<W>),
    /// No more work will ever be handed out; the reader may exit.
    NoMoreSplits,
}

/// The stream split plus the gate that pauses it during a re-snapshot.
#[derive(Debug)]
pub struct StreamAssignment<W> {
    pub split: StreamSplit<W>,
    pub gate: watch::Receiver<StreamGate<W>>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum RegistryCommand<W> {
    RequestSplit {
        reader: ReaderId,
        reply: Reply<Assignment<W>>,
    },
    ReportFinished {
        reader: ReaderId,
        split: SplitId,
        high_watermark: W,
        reply: Reply<()>,
    },
    ReportFailure {
        reader: ReaderId,
        reason: String,
        reply: Reply<u32>,
    },
    DiscoverTable {
        registration: TableRegistration<W>,
        reply: Reply<bool>,
    },
    ReportStreamProgress {
        position: W,
        reply: Reply<()>,
    },
    Checkpoint {
        reply: Reply<GlobalState<W>>,
    },
    State {
        reply: Reply<GlobalState<W>>,
    },
    Halt {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Receiving end of the registry channel, consumed by [`SplitRegistry::new`].
pub struct RegistryInbox<W>(mpsc::Receiver<RegistryCommand<W>>);

/// Cloneable client of the registry task.
pub struct RegistryHandle<W> {
    tx: mpsc::Sender<RegistryCommand<W>>,
}

impl<W> Clone for RegistryHandle<W> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<W: Watermark> RegistryHandle<W> {
    /// Create a handle and the inbox the registry task will drain.
    pub fn channel(capacity: usize) -> (Self, RegistryInbox<W>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, RegistryInbox(rx))
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> RegistryCommand<W>) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| CdcError::RegistryClosed)?;
        rx.await.map_err(|_| CdcError::RegistryClosed)?
    }

    /// Ask for the next unit of work. Suspends while nothing is assignable.
    pub async fn request_split(&self, reader: ReaderId) -> Result<Assignment<W>> {
        self.call(|reply| RegistryCommand::RequestSplit { reader, reply })
            .await
    }

    /// Report a split whose merged output has been delivered.
    pub async fn report_finished(
        &self,
        reader: ReaderId,
        split: SplitId,
        high_watermark: W,
    ) -> Result<()> {
        self.call(|reply| RegistryCommand::ReportFinished {
            reader,
            split,
            high_watermark,
            reply,
        })
        .await
    }

    /// Return the reader's split to the queue. Yields the split's failure
    /// count, or an error once its retries are exhausted.
    pub async fn report_failure(&self, reader: ReaderId, reason: impl Into<String>) -> Result<u32> {
        let reason = reason.into();
        self.call(|reply| RegistryCommand::ReportFailure {
            reader,
            reason,
            reply,
        })
        .await
    }

    /// Add a table. Returns `false` if it was already known.
    pub async fn discover_table(&self, registration: TableRegistration<W>) -> Result<bool> {
        self.call(|reply| RegistryCommand::DiscoverTable {
            registration,
            reply,
        })
        .await
    }

    /// Record the position of the last stream event delivered downstream.
    pub async fn report_stream_progress(&self, position: W) -> Result<()> {
        self.call(|reply| RegistryCommand::ReportStreamProgress { position, reply })
            .await
    }

    /// Persist the current state through the checkpoint sink.
    pub async fn checkpoint(&self) -> Result<GlobalState<W>> {
        self.call(|reply| RegistryCommand::Checkpoint { reply }).await
    }

    /// Copy of the current state, without persisting it.
    pub async fn state(&self) -> Result<GlobalState<W>> {
        self.call(|reply| RegistryCommand::State { reply }).await
    }

    /// Refuse further checkpoints and release parked readers.
    pub async fn halt(&self) -> Result<()> {
        self.call(|reply| RegistryCommand::Halt { reply }).await
    }

    /// Stop the registry task.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| RegistryCommand::Shutdown { reply }).await
    }
}

enum Held {
    Snapshot(SplitId),
    Stream,
}

struct Waiter<W> {
    reader: ReaderId,
    reply: Reply<Assignment<W>>,
}

/// The registry task.
pub struct SplitRegistry<W: Watermark> {
    state: GlobalState<W>,
    config: RegistryConfig<W>,
    checkpoints: Arc<dyn CheckpointSink<W>>,
    stats: Arc<EngineStats>,
    inbox: mpsc::Receiver<RegistryCommand<W>>,
    assignments: HashMap<ReaderId, Held>,
    failures: HashMap<SplitId, u32>,
    waiting: VecDeque<Waiter<W>>,
    stream_issued: bool,
    halted: bool,
    closed: bool,
    gate: watch::Sender<StreamGate<W>>,
}

impl<W: Watermark> SplitRegistry<W> {
    pub fn new(
        state: GlobalState<W>,
        config: RegistryConfig<W>,
        checkpoints: Arc<dyn CheckpointSink<W>>,
        stats: Arc<EngineStats>,
        inbox: RegistryInbox<W>,
    ) -> Self {
        let (gate, _) = watch::channel(StreamGate::closed());
        Self {
            state,
            config,
            checkpoints,
            stats,
            inbox: inbox.0,
            assignments: HashMap::new(),
            failures: HashMap::new(),
            waiting: VecDeque::new(),
            stream_issued: false,
            halted: false,
            closed: false,
            gate,
        }
    }

    /// Serve commands until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!(
            tables = self.state.tables.len(),
            splits = self.state.splits.len(),
            pending = self.state.pending_splits(),
            "Split registry started"
        );

        while let Some(command) = self.inbox.recv().await {
            match command {
                RegistryCommand::RequestSplit { reader, reply } => {
                    self.handle_request(reader, reply);
                }
                RegistryCommand::ReportFinished {
                    reader,
                    split,
                    high_watermark,
                    reply,
                } => {
                    let result = self.handle_finished(reader, split, high_watermark);
                    let _ = reply.send(result);
                }
                RegistryCommand::ReportFailure {
                    reader,
                    reason,
                    reply,
                } => {
                    let result = self.handle_failure(reader, &reason);
                    let _ = reply.send(result);
                }
                RegistryCommand::DiscoverTable {
                    registration,
                    reply,
                } => {
                    let result = self.handle_discover(registration);
                    let _ = reply.send(result);
                }
                RegistryCommand::ReportStreamProgress { position, reply } => {
                    let result = self.state.advance_stream(position);
                    if let Err(e) = &result {
                        error!(error = %e, "Stream progress moved backward");
                    }
                    let _ = reply.send(result);
                }
                RegistryCommand::Checkpoint { reply } => {
                    let result = self.handle_checkpoint().await;
                    let _ = reply.send(result);
                }
                RegistryCommand::State { reply } => {
                    let _ = reply.send(Ok(self.state.clone()));
                }
                RegistryCommand::Halt { reply } => {
                    if !self.halted {
                        error!("Split registry halted, checkpoints disabled");
                    }
                    self.halted = true;
                    self.release_waiting();
                    let _ = reply.send(Ok(()));
                }
                RegistryCommand::Shutdown { reply } => {
                    self.close();
                    let _ = reply.send(Ok(()));
                    break;
                }
            }
        }

        self.close();
        debug!("Split registry stopped");
    }

    fn close(&mut self) {
        self.closed = true;
        self.release_waiting();
    }

    fn release_waiting(&mut self) {
        for waiter in self.waiting.drain(..) {
            let _ = waiter.reply.send(Ok(Assignment::NoMoreSplits));
        }
    }

    fn handle_request(&mut self, reader: ReaderId, reply: Reply<Assignment<W>>) {
        if self.halted || self.closed {
            let _ = reply.send(Ok(Assignment::NoMoreSplits));
            return;
        }
        if let Some(held) = self.assignments.get(&reader) {
            let holding = match held {
                Held::Snapshot(id) => id.to_string(),
                Held::Stream => "the stream split".to_string(),
            };
            let _ = reply.send(Err(CdcError::protocol(format!(
                "{} requested a split while holding {}",
                reader, holding
            ))));
            return;
        }

        match self.try_assign(reader) {
            Ok(Some(assignment)) => self.send_assignment(reader, reply, assignment),
            Ok(None) => {
                debug!(reader = %reader, "No split assignable, parking reader");
                self.waiting.push_back(Waiter { reader, reply });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// `None` parks the reader until something changes.
    fn try_assign(&mut self, reader: ReaderId) -> Result<Option<Assignment<W>>> {
        if let Some(index) = self.state.next_unassigned() {
            let split = self.state.splits[index].clone();
            let table = self
                .state
                .table(&split.table)
                .map(|t| t.descriptor.clone())
                .ok_or_else(|| {
                    CdcError::invalid_state(format!(
                        "split {} belongs to unregistered table {}",
                        split.id, split.table
                    ))
                })?;
            self.state.assign(index);
            self.assignments
                .insert(reader, Held::Snapshot(split.id.clone()));
            self.stats.record_split_assigned();
            debug!(reader = %reader, split_id = %split.id, range = %split.range, "Assigned split");
            return Ok(Some(Assignment::Snapshot { split, table }));
        }

        if !self.state.all_finished() {
            return Ok(None);
        }

        if self.config.stream_enabled && !self.stream_issued {
            return self.issue_stream(reader).map(Some);
        }

        let exhausted = !self.config.stream_enabled
            || self.config.late_discovery == LateDiscoveryPolicy::Reject;
        Ok(exhausted.then_some(Assignment::NoMoreSplits))
    }

    fn issue_stream(&mut self, reader: ReaderId) -> Result<Assignment<W>> {
        let stream_start = match &self.state.stream_start {
            Some(start) => start.clone(),
            None => {
                let start = self
                    .state
                    .compute_stream_start()
                    .unwrap_or_else(|| self.config.startup_position.clone());
                self.state.stream_start = Some(start.clone());
                start
            }
        };
        let split = StreamSplit {
            start: self
                .state
                .stream_position
                .clone()
                .unwrap_or_else(|| stream_start.clone()),
            skip_through: self.state.stream_position.clone(),
        };

        self.open_gate()?;
        self.stream_issued = true;
        self.assignments.insert(reader, Held::Stream);
        info!(
            reader = %reader,
            stream_start = %stream_start,
            start = %split.start,
            finished_splits = self.state.finished.len(),
            "Snapshot phase complete, issuing stream split"
        );

        Ok(Assignment::Stream(StreamAssignment {
            split,
            gate: self.gate.subscribe(),
        }))
    }

    fn open_gate(&mut self) -> Result<()> {
        let filter = Arc::new(StreamFilter::from_state(&self.state)?);
        self.gate.send_modify(|gate| gate.reopen(filter));
        Ok(())
    }

    fn send_assignment(
        &mut self,
        reader: ReaderId,
        reply: Reply<Assignment<W>>,
        assignment: Assignment<W>,
    ) {
        if let Err(Ok(undelivered)) = reply.send(Ok(assignment)) {
            // requester went away; take the work back
            self.assignments.remove(&reader);
            match undelivered {
                Assignment::Snapshot { split, .. } => {
                    if let Some(index) = self.state.split_index(&split.id) {
                        self.state.revert(index);
                    }
                    debug!(
                        reader = %reader,
                        split_id = %split.id,
                        "Assignment undeliverable, reverted"
                    );
                }
                Assignment::Stream(_) => {
                    self.stream_issued = false;
                    debug!(reader = %reader, "Stream assignment undeliverable, withdrawn");
                }
                Assignment::NoMoreSplits => {}
            }
        }
    }

    fn drain_waiting(&mut self) {
        while let Some(waiter) = self.waiting.pop_front() {
            if waiter.reply.is_closed() {
                continue;
            }
            match self.try_assign(waiter.reader) {
                Ok(Some(assignment)) => {
                    self.send_assignment(waiter.reader, waiter.reply, assignment)
                }
                Ok(None) => {
                    self.waiting.push_front(waiter);
                    break;
                }
                Err(e) => {
                    let _ = waiter.reply.send(Err(e));
                }
            }
        }
    }

    fn holds(&self, reader: ReaderId, split_id: &SplitId) -> bool {
        matches!(self.assignments.get(&reader), Some(Held::Snapshot(id)) if id == split_id)
    }

    fn handle_finished(
        &mut self,
        reader: ReaderId,
        split_id: SplitId,
        high_watermark: W,
    ) -> Result<()> {
        let index = self.state.split_index(&split_id).ok_or_else(|| {
            CdcError::protocol(format!("{} reported unknown split {}", reader, split_id))
        })?;

        match self.state.splits[index].status {
            SplitStatus::Finished => {
                if self.holds(reader, &split_id) {
                    self.assignments.remove(&reader);
                }
                debug!(reader = %reader, split_id = %split_id, "Duplicate finish report ignored");
                return Ok(());
            }
            SplitStatus::Unassigned => {
                return Err(CdcError::protocol(format!(
                    "{} reported split {} which is not assigned",
                    reader, split_id
                )));
            }
            SplitStatus::Assigned => {}
        }

        if !self.holds(reader, &split_id) {
            return Err(CdcError::protocol(format!(
                "{} reported split {} assigned to another reader",
                reader, split_id
            )));
        }

        debug!(
            reader = %reader,
            split_id = %split_id,
            high_watermark = %high_watermark,
            "Split finished"
        );
        self.state.finish(index, high_watermark);
        self.assignments.remove(&reader);
        self.failures.remove(&split_id);

        if self.stream_issued && self.state.all_finished() && !self.gate.borrow().open {
            self.open_gate()?;
            info!("Re-snapshot complete, stream resumed");
        }
        self.drain_waiting();
        Ok(())
    }

    fn handle_failure(&mut self, reader: ReaderId, reason: &str) -> Result<u32> {
        let held = self.assignments.remove(&reader).ok_or_else(|| {
            CdcError::protocol(format!("{} reported a failure while holding no split", reader))
        })?;

        let split_id = match held {
            Held::Stream => {
                warn!(reader = %reader, reason, "Stream reader failed, stream split withdrawn");
                self.stream_issued = false;
                self.drain_waiting();
                return Ok(0);
            }
            Held::Snapshot(id) => id,
        };

        if let Some(index) = self.state.split_index(&split_id) {
            self.state.revert(index);
        }
        self.stats.record_split_failed();
        let failures = self.failures.entry(split_id.clone()).or_insert(0);
        *failures += 1;
        let failures = *failures;

        if failures > self.config.max_retries {
            error!(
                reader = %reader,
                split_id = %split_id,
                failures,
                reason,
                "Split failed too many times"
            );
            return Err(CdcError::split_execution(
                &split_id,
                format!("gave up after {} failures: {}", failures, reason),
            ));
        }

        warn!(
            reader = %reader,
            split_id = %split_id,
            failures,
            reason,
            "Split failed, returned to queue"
        );
        self.drain_waiting();
        Ok(failures)
    }

    fn handle_discover(&mut self, mut registration: TableRegistration<W>) -> Result<bool> {
        let table = registration.descriptor.id.clone();
        if self.state.contains_table(&table) {
            debug!(table = %table, "Table already captured");
            return Ok(false);
        }

        // a restored stream-phase state counts even before the stream is re-issued
        let stream_phase = self.stream_issued || self.state.stream_start.is_some();
        let stream_only = registration.splits.is_empty() && registration.discovered_at.is_none();
        let late = stream_phase && !stream_only;
        if late {
            if self.config.late_discovery == LateDiscoveryPolicy::Reject {
                warn!(table = %table, "Rejecting table discovered after stream start");
                return Err(CdcError::late_discovery(&table));
            }
            if registration.splits.is_empty() && registration.discovered_at.is_some() {
                // the stream has already skipped this table's recent events
                registration.splits = vec![Split::new(table.clone(), 0, KeyRange::unbounded())];
            }
        }

        self.state.register(registration)?;
        let pending = self.state.pending_splits();
        info!(table = %table, late, pending, "Table discovered");

        if self.stream_issued {
            if self.state.all_finished() {
                self.open_gate()?;
            } else {
                self.gate.send_modify(StreamGate::close);
                info!(table = %table, "Stream paused for re-snapshot");
            }
        }
        self.drain_waiting();
        Ok(true)
    }

    async fn handle_checkpoint(&mut self) -> Result<GlobalState<W>> {
        if self.halted {
            return Err(CdcError::invalid_state(
                "engine halted after a fatal error, checkpoint refused",
            ));
        }
        let snapshot = self.state.clone();
        self.checkpoints.persist(&snapshot).await?;
        self.stats.record_checkpoint();
        info!(
            finished = snapshot.finished.len(),
            splits = snapshot.splits.len(),
            stream_position = ?snapshot.stream_position,
            "Checkpoint persisted"
        );
        Ok(snapshot)
    }
}
