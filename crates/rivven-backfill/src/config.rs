//! Engine configuration
//!
//! [`EngineConfig`] can be built in code with [`EngineConfig::builder`] or
//! parsed from the flat key/value options a host passes through
//! [`EngineConfig::from_options`].
//!
//! # Example
//!
//! ```
//! use rivven_backfill::config::{EngineConfig, StartupMode};
//!
//! let config = EngineConfig::builder()
//!     .hosts(["db-1.internal"])
//!     .tables(["inventory.*"])
//!     .chunk_size(1000)
//!     .parallelism(8)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.startup_mode, StartupMode::Initial);
//! assert_eq!(config.parallelism, 8);
//! ```

use crate::common::{CdcError, Result, RetryConfig, TableSelector};
use crate::reader::{SnapshotReaderConfig, StreamReaderConfig};
use crate::registry::LateDiscoveryPolicy;
use crate::split::SplitterConfig;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const HOSTS: &str = "hosts";
pub const PORT: &str = "port";
pub const USERNAME: &str = "username";
pub const PASSWORD: &str = "password";
pub const DATABASE: &str = "database";
pub const TABLES: &str = "tables";
pub const SNAPSHOT_ENABLED: &str = "scan.incremental.snapshot.enabled";
pub const CHUNK_SIZE: &str = "scan.incremental.snapshot.chunk.size";
pub const PARALLELISM: &str = "scan.incremental.snapshot.parallelism";
pub const BACKFILL_SKIP: &str = "scan.incremental.snapshot.backfill.skip";
pub const BACKFILL_BUFFER_SIZE: &str = "scan.incremental.snapshot.backfill.buffer.size";
pub const EVEN_DISTRIBUTION_LOWER: &str = "chunk-key.even-distribution.factor.lower-bound";
pub const EVEN_DISTRIBUTION_UPPER: &str = "chunk-key.even-distribution.factor.upper-bound";
pub const STARTUP_MODE: &str = "scan.startup.mode";
pub const STARTUP_SPECIFIC_OFFSET: &str = "scan.startup.specific-offset";
pub const NEWLY_ADDED_TABLE_POLICY: &str = "scan.newly-added-table.policy";
pub const MAX_RETRIES: &str = "connect.max-retries";
pub const RETRY_DELAY_MS: &str = "connect.retry.delay.ms";
pub const STREAM_BATCH_SIZE: &str = "stream.batch.size";
pub const STREAM_FLUSH_INTERVAL_MS: &str = "stream.flush.interval.ms";
pub const CHECKPOINT_INTERVAL_MS: &str = "checkpoint.interval.ms";

/// Where a run begins.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StartupMode {
    /// Snapshot every selected table, then follow the log.
    #[default]
    Initial,
    /// Snapshot every selected table, then finish.
    SnapshotOnly,
    /// Skip the snapshot and follow the log from its current end.
    LatestOffset,
    /// Skip the snapshot and follow the log from this position (inclusive).
    SpecificOffset(String),
}

impl StartupMode {
    /// Whether selected tables are snapshotted.
    pub fn snapshots(&self) -> bool {
        matches!(self, Self::Initial | Self::SnapshotOnly)
    }

    /// Whether the change log is followed after the snapshot phase.
    pub fn streams(&self) -> bool {
        !matches!(self, Self::SnapshotOnly)
    }
}

impl fmt::Display for StartupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::SnapshotOnly => write!(f, "snapshot"),
            Self::LatestOffset => write!(f, "latest-offset"),
            Self::SpecificOffset(offset) => write!(f, "specific-offset({})", offset),
        }
    }
}

/// Full engine configuration.
#[derive(Clone)]
pub struct EngineConfig {
    pub hosts: Vec<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    /// Glob patterns selecting the captured tables
    pub tables: Vec<String>,
    /// Split tables into key-range chunks; off means one split per table
    pub parallel_snapshot: bool,
    pub chunk_size: usize,
    /// Number of reader tasks
    pub parallelism: usize,
    /// Emit raw scans without the watermark merge (at-least-once)
    pub skip_backfill: bool,
    pub backfill_buffer_size: usize,
    pub even_distribution_lower: f64,
    pub even_distribution_upper: f64,
    pub startup_mode: StartupMode,
    pub late_discovery: LateDiscoveryPolicy,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub stream_batch_size: usize,
    pub stream_flush_interval: Duration,
    /// Periodic automatic checkpoints; `None` leaves checkpoints to the host
    pub checkpoint_interval: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let splitter = SplitterConfig::default();
        Self {
            hosts: Vec::new(),
            port: None,
            username: None,
            password: None,
            database: None,
            tables: Vec::new(),
            parallel_snapshot: splitter.enabled,
            chunk_size: splitter.chunk_size,
            parallelism: 4,
            skip_backfill: false,
            backfill_buffer_size: 10_000,
            even_distribution_lower: splitter.even_distribution_lower,
            even_distribution_upper: splitter.even_distribution_upper,
            startup_mode: StartupMode::Initial,
            late_discovery: LateDiscoveryPolicy::Reject,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            stream_batch_size: 1024,
            stream_flush_interval: Duration::from_millis(200),
            checkpoint_interval: None,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("hosts", &self.hosts)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("database", &self.database)
            .field("tables", &self.tables)
            .field("parallel_snapshot", &self.parallel_snapshot)
            .field("chunk_size", &self.chunk_size)
            .field("parallelism", &self.parallelism)
            .field("skip_backfill", &self.skip_backfill)
            .field("backfill_buffer_size", &self.backfill_buffer_size)
            .field("even_distribution_lower", &self.even_distribution_lower)
            .field("even_distribution_upper", &self.even_distribution_upper)
            .field("startup_mode", &self.startup_mode)
            .field("late_discovery", &self.late_discovery)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("stream_batch_size", &self.stream_batch_size)
            .field("stream_flush_interval", &self.stream_flush_interval)
            .field("checkpoint_interval", &self.checkpoint_interval)
            .finish()
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Parse flat host options. Unknown keys are rejected.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        let mut mode: Option<String> = None;
        let mut specific_offset: Option<String> = None;

        for (key, value) in options {
            let value = value.trim();
            match key.as_str() {
                HOSTS => config.hosts = split_list(value),
                PORT => config.port = Some(parse(key, value)?),
                USERNAME => config.username = Some(value.to_string()),
                PASSWORD => config.password = Some(value.to_string()),
                DATABASE => config.database = Some(value.to_string()),
                TABLES => config.tables = split_list(value),
                SNAPSHOT_ENABLED => config.parallel_snapshot = parse(key, value)?,
                CHUNK_SIZE => config.chunk_size = parse(key, value)?,
                PARALLELISM => config.parallelism = parse(key, value)?,
                BACKFILL_SKIP => config.skip_backfill = parse(key, value)?,
                BACKFILL_BUFFER_SIZE => config.backfill_buffer_size = parse(key, value)?,
                EVEN_DISTRIBUTION_LOWER => config.even_distribution_lower = parse(key, value)?,
                EVEN_DISTRIBUTION_UPPER => config.even_distribution_upper = parse(key, value)?,
                STARTUP_MODE => mode = Some(value.to_lowercase()),
                STARTUP_SPECIFIC_OFFSET => specific_offset = Some(value.to_string()),
                NEWLY_ADDED_TABLE_POLICY => config.late_discovery = value.parse()?,
                MAX_RETRIES => config.max_retries = parse(key, value)?,
                RETRY_DELAY_MS => config.retry_delay = Duration::from_millis(parse(key, value)?),
                STREAM_BATCH_SIZE => config.stream_batch_size = parse(key, value)?,
                STREAM_FLUSH_INTERVAL_MS => {
                    config.stream_flush_interval = Duration::from_millis(parse(key, value)?)
                }
                CHECKPOINT_INTERVAL_MS => {
                    let ms: u64 = parse(key, value)?;
                    config.checkpoint_interval = (ms > 0).then(|| Duration::from_millis(ms));
                }
                other => return Err(CdcError::config(format!("Unknown option '{}'", other))),
            }
        }

        config.startup_mode = match mode.as_deref() {
            None | Some("initial") => StartupMode::Initial,
            Some("snapshot") => StartupMode::SnapshotOnly,
            Some("latest-offset") => StartupMode::LatestOffset,
            Some("specific-offset") => StartupMode::SpecificOffset(specific_offset.ok_or_else(
                || {
                    CdcError::config(format!(
                        "'{}' is required when {} is specific-offset",
                        STARTUP_SPECIFIC_OFFSET, STARTUP_MODE
                    ))
                },
            )?),
            Some(other) => {
                return Err(CdcError::config(format!(
                    "Unknown startup mode '{}' (expected initial, snapshot, latest-offset or specific-offset)",
                    other
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() || self.hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(CdcError::config(format!("'{}' must list at least one host", HOSTS)));
        }
        if self.port == Some(0) {
            return Err(CdcError::config("port must be non-zero"));
        }
        self.table_selector()?;
        if self.chunk_size == 0 {
            return Err(CdcError::config("chunk size must be at least 1"));
        }
        if self.parallelism == 0 {
            return Err(CdcError::config("parallelism must be at least 1"));
        }
        if self.backfill_buffer_size == 0 {
            return Err(CdcError::config("backfill buffer size must be at least 1"));
        }
        if self.stream_batch_size == 0 {
            return Err(CdcError::config("stream batch size must be at least 1"));
        }
        if self.stream_flush_interval.is_zero() {
            return Err(CdcError::config("stream flush interval must be positive"));
        }
        let (lower, upper) = (self.even_distribution_lower, self.even_distribution_upper);
        if !lower.is_finite() || !upper.is_finite() || lower <= 0.0 || upper < lower {
            return Err(CdcError::config(format!(
                "invalid even-distribution bounds [{}, {}]",
                lower, upper
            )));
        }
        if let StartupMode::SpecificOffset(offset) = &self.startup_mode {
            if offset.trim().is_empty() {
                return Err(CdcError::config("specific startup offset is empty"));
            }
        }
        Ok(())
    }

    pub fn table_selector(&self) -> Result<TableSelector> {
        TableSelector::parse(&self.tables.join(","))
    }

    pub fn splitter_config(&self) -> SplitterConfig {
        SplitterConfig {
            chunk_size: self.chunk_size,
            enabled: self.parallel_snapshot,
            even_distribution_lower: self.even_distribution_lower,
            even_distribution_upper: self.even_distribution_upper,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::builder()
            .max_retries(self.max_retries)
            .retry_delay(self.retry_delay)
            .build()
    }

    pub fn snapshot_reader_config(&self) -> SnapshotReaderConfig {
        SnapshotReaderConfig {
            buffer_capacity: self.backfill_buffer_size,
            batch_size: self.stream_batch_size,
            skip_backfill: self.skip_backfill,
        }
    }

    pub fn stream_reader_config(&self) -> StreamReaderConfig {
        StreamReaderConfig {
            batch_size: self.stream_batch_size,
            flush_interval: self.stream_flush_interval,
            retry: self.retry_config(),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .parse()
        .map_err(|e| CdcError::config(format!("Invalid value '{}' for '{}': {}", value, key, e)))
}

/// Builder for EngineConfig.
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self.config.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = Some(database.into());
        self
    }

    pub fn tables<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.tables = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn parallel_snapshot(mut self, enabled: bool) -> Self {
        self.config.parallel_snapshot = enabled;
        self
    }

    pub fn chunk_size(mut self, rows: usize) -> Self {
        self.config.chunk_size = rows;
        self
    }

    pub fn parallelism(mut self, readers: usize) -> Self {
        self.config.parallelism = readers;
        self
    }

    pub fn skip_backfill(mut self, skip: bool) -> Self {
        self.config.skip_backfill = skip;
        self
    }

    pub fn backfill_buffer_size(mut self, keys: usize) -> Self {
        self.config.backfill_buffer_size = keys;
        self
    }

    pub fn even_distribution(mut self, lower: f64, upper: f64) -> Self {
        self.config.even_distribution_lower = lower;
        self.config.even_distribution_upper = upper;
        self
    }

    pub fn startup_mode(mut self, mode: StartupMode) -> Self {
        self.config.startup_mode = mode;
        self
    }

    pub fn late_discovery(mut self, policy: LateDiscoveryPolicy) -> Self {
        self.config.late_discovery = policy;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn stream_batch_size(mut self, events: usize) -> Self {
        self.config.stream_batch_size = events;
        self
    }

    pub fn stream_flush_interval(mut self, interval: Duration) -> Self {
        self.config.stream_flush_interval = interval;
        self
    }

    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.config.checkpoint_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
