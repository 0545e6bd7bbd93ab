//! Capability traits
//!
//! The engine talks to a database only through these narrow interfaces.
//! A source implements [`RowScanner`] for range reads and [`LogReader`] for
//! its change log; the host implements [`EventSink`] for output.

use crate::common::{ChangeEvent, KeyRange, Result, Row, RowKey, TableDescriptor, TableId};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Lazy, infinite sequence of change events in log order.
pub type ChangeStream<W> = BoxStream<'static, Result<ChangeEvent<W>>>;

/// Lazy, finite sequence of rows in key order.
pub type RowStream = BoxStream<'static, Result<Row>>;

/// Primary-key distribution of a non-empty table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStats {
    pub min: RowKey,
    pub max: RowKey,
    pub approximate_rows: u64,
}

/// Range reads over a table's current contents.
///
/// Scans must not take locks that block concurrent writers.
#[async_trait]
pub trait RowScanner: Send + Sync {
    /// List every table the source can capture.
    async fn list_tables(&self) -> Result<Vec<TableId>>;

    /// Describe a table's primary key. `None` if the table does not exist.
    async fn describe(&self, table: &TableId) -> Result<Option<TableDescriptor>>;

    /// Key bounds and approximate row count. `None` for an empty table.
    async fn key_stats(&self, table: &TableDescriptor) -> Result<Option<KeyStats>>;

    /// The key `chunk_size` rows past `from` (inclusive), or `None` when
    /// fewer rows remain.
    async fn next_chunk_start(
        &self,
        table: &TableDescriptor,
        from: &RowKey,
        chunk_size: usize,
    ) -> Result<Option<RowKey>>;

    /// Rows whose key lies in `range`, ordered by key.
    async fn scan(&self, table: &TableDescriptor, range: &KeyRange) -> Result<RowStream>;
}

/// Access to a source's change log.
#[async_trait]
pub trait LogReader<W>: Send + Sync {
    /// Position of the most recent event in the log. Every event at or
    /// below it is readable.
    async fn current_position(&self) -> Result<W>;

    /// Every event at or after `from`, in position order, without end.
    async fn read_from(&self, from: &W) -> Result<ChangeStream<W>>;
}

/// Downstream output.
///
/// `deliver` returns only once the batch is durable downstream. The engine
/// never reorders events for the same key.
#[async_trait]
pub trait EventSink<W>: Send + Sync {
    async fn deliver(&self, events: Vec<ChangeEvent<W>>) -> Result<()>;
}
