//! Checkpoint sinks
//!
//! The registry hands every checkpoint to a [`CheckpointSink`] and waits for
//! `persist` to return before it processes another command, so a persisted
//! state never runs ahead of what was delivered downstream.
//!
//! Two sinks ship with the crate:
//!
//! - [`MemoryCheckpointSink`] keeps the latest state in memory (tests, hosts
//!   with their own state backend)
//! - [`FileCheckpointSink`] writes a JSON envelope atomically (temp file,
//!   fsync, rename)

use crate::common::{CdcError, Result, Watermark};
use crate::registry::GlobalState;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Host-provided durable storage for [`GlobalState`].
#[async_trait]
pub trait CheckpointSink<W>: Send + Sync {
    /// Durably store `state`, replacing any previous checkpoint.
    async fn persist(&self, state: &GlobalState<W>) -> Result<()>;

    /// The last persisted state, if any.
    async fn restore(&self) -> Result<Option<GlobalState<W>>>;
}

/// In-memory checkpoint sink.
pub struct MemoryCheckpointSink<W> {
    latest: Mutex<Option<GlobalState<W>>>,
    persisted: AtomicU64,
}

impl<W> Default for MemoryCheckpointSink<W> {
    fn default() -> Self {
        Self {
            latest: Mutex::new(None),
            persisted: AtomicU64::new(0),
        }
    }
}

impl<W: Watermark> MemoryCheckpointSink<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeded with a state, as if a previous run had persisted it.
    pub fn with_state(state: GlobalState<W>) -> Self {
        Self {
            latest: Mutex::new(Some(state)),
            persisted: AtomicU64::new(0),
        }
    }

    pub fn latest(&self) -> Option<GlobalState<W>> {
        self.latest.lock().clone()
    }

    /// Number of `persist` calls served.
    pub fn persisted_count(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<W: Watermark> CheckpointSink<W> for MemoryCheckpointSink<W> {
    async fn persist(&self, state: &GlobalState<W>) -> Result<()> {
        *self.latest.lock() = Some(state.clone());
        self.persisted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn restore(&self) -> Result<Option<GlobalState<W>>> {
        Ok(self.latest.lock().clone())
    }
}

const ENVELOPE_VERSION: u32 = 1;

/// On-disk checkpoint format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEnvelope<W> {
    pub version: u32,
    /// Monotonic per file
    pub checkpoint_id: u64,
    /// Unix epoch millis
    pub created_at: i64,
    /// Engine run that wrote the checkpoint
    pub run_id: Uuid,
    pub state: GlobalState<W>,
}

/// Checkpoint sink backed by a single JSON file.
pub struct FileCheckpointSink<W> {
    path: PathBuf,
    run_id: Uuid,
    fsync: bool,
    next_id: AtomicU64,
    _watermark: PhantomData<fn() -> W>,
}

impl<W: Watermark> FileCheckpointSink<W> {
    /// Open (or prepare) the checkpoint file at `path`.
    pub async fn new(path: impl AsRef<Path>, run_id: Uuid) -> Result<Self> {
        Self::with_options(path, run_id, true).await
    }

    pub async fn with_options(path: impl AsRef<Path>, run_id: Uuid, fsync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let sink = Self {
            path,
            run_id,
            fsync,
            next_id: AtomicU64::new(1),
            _watermark: PhantomData,
        };
        if let Some(existing) = sink.read_envelope().await? {
            sink.next_id.store(existing.checkpoint_id + 1, Ordering::Relaxed);
        }
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored envelope with its metadata.
    pub async fn read_envelope(&self) -> Result<Option<CheckpointEnvelope<W>>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CdcError::Io(e)),
        };
        let envelope: CheckpointEnvelope<W> = serde_json::from_slice(&bytes)
            .map_err(|e| CdcError::serialization(format!("{}: {}", self.path.display(), e)))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(CdcError::serialization(format!(
                "unsupported checkpoint version {} in {}",
                envelope.version,
                self.path.display()
            )));
        }
        Ok(Some(envelope))
    }
}

#[async_trait]
impl<W: Watermark> CheckpointSink<W> for FileCheckpointSink<W> {
    async fn persist(&self, state: &GlobalState<W>) -> Result<()> {
        let envelope = CheckpointEnvelope {
            version: ENVELOPE_VERSION,
            checkpoint_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            created_at: chrono::Utc::now().timestamp_millis(),
            run_id: self.run_id,
            state: state.clone(),
        };
        let json = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| CdcError::serialization(e.to_string()))?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(&json).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, &self.path).await?;

        debug!(
            checkpoint_id = envelope.checkpoint_id,
            path = %self.path.display(),
            "Checkpoint written"
        );
        Ok(())
    }

    async fn restore(&self) -> Result<Option<GlobalState<W>>> {
        Ok(self.read_envelope().await?.map(|e| e.state))
    }
}
