//! Change log positions
//!
//! The engine never interprets a position beyond ordering and equality. Any
//! type that is totally ordered, printable and serializable can serve as a
//! watermark; this module ships the two shapes real databases use.

use crate::common::{CdcError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A totally ordered position in a change log.
///
/// Positions are persisted inside checkpoints, so they must round-trip
/// through serde without loss.
pub trait Watermark:
    Clone + Ord + fmt::Debug + fmt::Display + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> Watermark for T
where
    T: Clone
        + Ord
        + fmt::Debug
        + fmt::Display
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static
{
}

/// PostgreSQL-style log sequence number, printed as `XXXXXXXX/XXXXXXXX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| CdcError::config(format!("Invalid LSN format: {}", s)))?;
        let high = u64::from_str_radix(high, 16)
            .map_err(|e| CdcError::config(format!("Invalid LSN high part '{}': {}", high, e)))?;
        let low = u64::from_str_radix(low, 16)
            .map_err(|e| CdcError::config(format!("Invalid LSN low part '{}': {}", low, e)))?;
        if high > u64::from(u32::MAX) || low > u64::from(u32::MAX) {
            return Err(CdcError::config(format!("LSN out of range: {}", s)));
        }
        Ok(Lsn((high << 32) | low))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

/// MySQL-style binlog coordinate, printed as `file:offset`.
///
/// Ordering compares the file name first, then the offset. Binlog file names
/// carry a zero-padded sequence suffix, so lexical order is log order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BinlogPosition {
    pub file: String,
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, position: u64) -> Self {
        Self {
            file: file.into(),
            position,
        }
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.position)
    }
}

impl FromStr for BinlogPosition {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let (file, position) = s
            .rsplit_once(':')
            .ok_or_else(|| CdcError::config(format!("Invalid binlog position: {}", s)))?;
        if file.is_empty() {
            return Err(CdcError::config(format!("Missing binlog file name: {}", s)));
        }
        let position = position
            .parse::<u64>()
            .map_err(|e| CdcError::config(format!("Invalid binlog offset '{}': {}", position, e)))?;
        Ok(Self::new(file, position))
    }
}
