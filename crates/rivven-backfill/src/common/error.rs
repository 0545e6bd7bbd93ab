//! Error types for snapshot and stream operations
//!
//! Every failure in the engine is a [`CdcError`]. Errors are classified so the
//! engine can tell transient failures (re-run the whole split or stream
//! segment) from fatal ones (halt, never checkpoint again).

use crate::split::SplitId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for alerting and log aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Snapshot split execution (scan, backfill, delivery)
    Snapshot,
    /// Split registry coordination
    Coordination,
    /// Change log position handling
    Replication,
    /// Configuration errors (invalid settings, rejected discovery)
    Configuration,
    /// Network errors (connection, timeout)
    Network,
    /// Serialization errors (JSON, checkpoint files)
    Serialization,
    /// Shutdown and cancellation
    Lifecycle,
    /// Other/unknown errors
    Other,
}

/// Errors raised by the backfill engine and its capabilities.
#[derive(Error, Debug)]
pub enum CdcError {
    /// A snapshot split failed mid-execution; the whole split is re-assigned.
    #[error("Split {split} failed: {reason}")]
    SplitExecution { split: SplitId, reason: String },

    /// The registry received a request that breaks the assignment protocol.
    #[error("Registry protocol violation: {0}")]
    RegistryProtocolViolation(String),

    /// The change log reported a position older than one already observed.
    #[error("Watermark regression: observed {observed} after {previous}")]
    WatermarkRegression { previous: String, observed: String },

    /// A table was discovered after the stream phase began and the policy rejects it.
    #[error("Late table discovery rejected for {0}")]
    LateTableDiscoveryConflict(String),

    /// Split boundaries do not partition the key space.
    #[error("Invalid split boundaries: {0}")]
    InvalidSplitBoundaries(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection refused
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Temporary source or sink failure that succeeds on retry
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The registry task is gone
    #[error("Split registry closed")]
    RegistryClosed,

    /// The engine was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CdcError {
    /// Create a split execution error.
    pub fn split_execution(split: &SplitId, reason: impl std::fmt::Display) -> Self {
        Self::SplitExecution {
            split: split.clone(),
            reason: reason.to_string(),
        }
    }

    /// Create a protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::RegistryProtocolViolation(msg.into())
    }

    /// Create a watermark regression error.
    pub fn regression(previous: impl std::fmt::Display, observed: impl std::fmt::Display) -> Self {
        Self::WatermarkRegression {
            previous: previous.to_string(),
            observed: observed.to_string(),
        }
    }

    /// Create a late discovery conflict error
    pub fn late_discovery(table: impl std::fmt::Display) -> Self {
        Self::LateTableDiscoveryConflict(table.to_string())
    }

    /// Create an invalid boundaries error
    pub fn invalid_boundaries(msg: impl Into<String>) -> Self {
        Self::InvalidSplitBoundaries(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn connection_refused(msg: impl Into<String>) -> Self {
        Self::ConnectionRefused(msg.into())
    }

    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether re-running the entire failed split or stream segment can
    /// succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::SplitExecution { .. } => true,
            Self::ConnectionClosed => true,
            Self::ConnectionRefused(_) => true,
            Self::Timeout(_) => true,
            Self::Transient(_) => true,

            // I/O errors may be retriable
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::RegistryProtocolViolation(_)
            | Self::WatermarkRegression { .. }
            | Self::LateTableDiscoveryConflict(_)
            | Self::InvalidSplitBoundaries(_)
            | Self::Config(_)
            | Self::Serialization(_)
            | Self::Json(_)
            | Self::RegistryClosed
            | Self::Cancelled
            | Self::InvalidState(_)
            | Self::Other(_) => false,
        }
    }

    /// Check if this error must halt the engine.
    ///
    /// Cancellation is neither retriable nor fatal: it is a clean stop.
    pub fn is_fatal(&self) -> bool {
        !self.is_retriable() && !self.is_cancelled()
    }

    /// Check if this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Get the error category for alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SplitExecution { .. } => ErrorCategory::Snapshot,
            Self::InvalidSplitBoundaries(_) => ErrorCategory::Snapshot,
            Self::RegistryProtocolViolation(_) => ErrorCategory::Coordination,
            Self::RegistryClosed => ErrorCategory::Coordination,
            Self::WatermarkRegression { .. } => ErrorCategory::Replication,
            Self::LateTableDiscoveryConflict(_) => ErrorCategory::Configuration,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Timeout(_) => ErrorCategory::Network,
            Self::ConnectionClosed => ErrorCategory::Network,
            Self::ConnectionRefused(_) => ErrorCategory::Network,
            Self::Transient(_) => ErrorCategory::Network,
            Self::Io(_) => ErrorCategory::Network,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Cancelled => ErrorCategory::Lifecycle,
            Self::InvalidState(_) => ErrorCategory::Other,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Stable snake_case code for logs and counters.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SplitExecution { .. } => "split_execution_failure",
            Self::RegistryProtocolViolation(_) => "registry_protocol_violation",
            Self::WatermarkRegression { .. } => "watermark_regression",
            Self::LateTableDiscoveryConflict(_) => "late_table_discovery_conflict",
            Self::InvalidSplitBoundaries(_) => "invalid_split_boundaries",
            Self::Config(_) => "config_error",
            Self::Serialization(_) => "serialization_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Timeout(_) => "timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionRefused(_) => "connection_refused",
            Self::Transient(_) => "transient",
            Self::RegistryClosed => "registry_closed",
            Self::Cancelled => "cancelled",
            Self::InvalidState(_) => "invalid_state",
            Self::Other(_) => "unknown",
        }
    }
}

/// Result type for backfill operations
pub type Result<T> = std::result::Result<T, CdcError>;
