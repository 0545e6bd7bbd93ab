//! # Common Types and Traits
//!
//! Source-agnostic building blocks shared by the splitter, registry and
//! readers:
//!
//! - [`Watermark`] - Opaque, ordered change log position
//! - [`RowKey`] / [`KeyRange`] - Primary keys and half-open key ranges
//! - [`TableDescriptor`] - Table identity and key columns
//! - [`ChangeEvent`] - Unified change event representation
//! - [`RowScanner`] / [`LogReader`] / [`EventSink`] - Capability traits
//! - [`TableSelector`] - Glob table selection
//! - [`RetryConfig`] - Backoff for re-running failed work
//! - [`EngineStats`] - Engine counters
//! - [`CdcError`] - Error type

mod error;
mod event;
mod key;
pub mod pattern;
mod resilience;
mod stats;
mod table;
mod traits;
pub mod watermark;

pub use error::{CdcError, ErrorCategory, Result};
pub use event::{ChangeEvent, ChangeOp, Row};
pub use key::{KeyRange, KeyValue, RowKey};
pub use pattern::{TablePattern, TableSelector};
pub use resilience::{RetryConfig, RetryConfigBuilder};
pub use stats::{EngineStats, EngineStatsSnapshot};
pub use table::{KeyColumn, KeyType, TableDescriptor, TableId};
pub use traits::{ChangeStream, EventSink, KeyStats, LogReader, RowScanner, RowStream};
pub use watermark::{BinlogPosition, Lsn, Watermark};
