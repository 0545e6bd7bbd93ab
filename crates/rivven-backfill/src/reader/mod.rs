//! Split readers
//!
//! - [`snapshot`] executes one snapshot split (scan, backfill, merge)
//! - [`stream`] follows the change log once the snapshot phase is over

pub mod snapshot;
pub mod stream;

pub use snapshot::{
    merge_backfill, BackfillBuffer, SnapshotReaderConfig, SnapshotSplitReader, SplitOutcome,
};
pub use stream::{FilterDecision, StreamFilter, StreamGate, StreamReaderConfig, StreamSplitReader};

use crate::common::{CdcError, ChangeEvent, EventSink, Result};
use tokio_util::sync::CancellationToken;

/// Hand one batch to the sink, giving up if the engine is cancelled.
pub(crate) async fn deliver<W>(
    sink: &dyn EventSink<W>,
    events: Vec<ChangeEvent<W>>,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(CdcError::Cancelled),
        result = sink.deliver(events) => result,
    }
}
