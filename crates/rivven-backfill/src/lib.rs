//! # rivven-backfill - Parallel incremental snapshots for Rivven CDC
//!
//! Captures the full contents of a set of tables and then follows their
//! change log, without locking the tables and without ever emitting a row
//! twice or losing one across the switch from snapshot to stream.
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────┐  splits   ┌──────────────────────┐
//!  tables ──►│ChunkSplitter │──────────►│    SplitRegistry     │──► CheckpointSink
//!            └──────────────┘           │  (single owner task) │
//!                                       └──┬──────────┬────────┘
//!                          request/report  │          │ stream split + gate
//!                           ┌──────────────┘          └──────────────┐
//!                           ▼                                        ▼
//!              ┌─────────────────────────┐              ┌──────────────────────┐
//!              │ SnapshotSplitReader × N │              │  StreamSplitReader   │
//!              │ scan + tail + merge     │              │  filter by watermark │
//!              └────────────┬────────────┘              └──────────┬───────────┘
//!                           └──────────────► EventSink ◄───────────┘
//! ```
//!
//! Each table is cut into key-range splits. A snapshot reader brackets the
//! scan of one split with a low and a high log position, folds the change
//! events between them into the scanned rows, and emits every row exactly as
//! of the high position. Once every split is finished, one reader follows the
//! log and drops the events the snapshot already covered.
//!
//! The engine talks to a source only through [`RowScanner`] and
//! [`LogReader`], and never interprets a log position beyond ordering (see
//! [`Watermark`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> rivven_backfill::Result<()> {
//! use rivven_backfill::checkpoint::MemoryCheckpointSink;
//! use rivven_backfill::memory::{MemorySink, MemorySource};
//! use rivven_backfill::{Capabilities, CaptureEngine, EngineConfig};
//! use std::sync::Arc;
//!
//! let source = MemorySource::new();
//! let sink = MemorySink::<u64>::new();
//!
//! let config = EngineConfig::builder()
//!     .hosts(["localhost"])
//!     .tables(["inventory.*"])
//!     .chunk_size(1000)
//!     .build()?;
//!
//! let engine = CaptureEngine::new(
//!     config,
//!     Capabilities {
//!         scanner: Arc::new(source.clone()),
//!         log: Arc::new(source.clone()),
//!         sink: Arc::new(sink.clone()),
//!         checkpoints: Arc::new(MemoryCheckpointSink::new()),
//!     },
//! )?;
//! let handle = engine.handle();
//! let running = tokio::spawn(engine.run());
//!
//! // later
//! handle.checkpoint().await?;
//! handle.shutdown();
//! # let _ = running.await;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod common;
pub mod config;
pub mod engine;
pub mod memory;
pub mod reader;
pub mod registry;
pub mod split;

// Core types
pub use common::{
    CdcError, ChangeEvent, ChangeOp, ErrorCategory, EventSink, KeyRange, KeyValue, LogReader,
    Result, Row, RowKey, RowScanner, TableDescriptor, TableId, Watermark,
};

// Engine surface
pub use checkpoint::{CheckpointSink, FileCheckpointSink, MemoryCheckpointSink};
pub use config::{EngineConfig, EngineConfigBuilder, StartupMode};
pub use engine::{create, Capabilities, CaptureEngine, EngineFactory, EngineHandle};
pub use registry::{GlobalState, LateDiscoveryPolicy};
pub use split::{Split, SplitId, SplitStatus};
