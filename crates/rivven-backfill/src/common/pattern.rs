//! # Table selection
//!
//! The `tables` option is a comma-separated list of glob patterns. Patterns
//! are compiled once to case-insensitive regular expressions.
//!
//! - `*` matches zero or more characters
//! - `?` matches exactly one character
//! - A pattern with a dot matches the qualified `namespace.name`; a pattern
//!   without one matches the bare table name in any namespace.
//!
//! ```rust
//! use rivven_backfill::common::{TableId, TableSelector};
//!
//! let selector = TableSelector::parse("inventory.*, audit_log").unwrap();
//! assert!(selector.matches(&TableId::new("inventory", "orders")));
//! assert!(selector.matches(&TableId::new("ops", "audit_log")));
//! assert!(!selector.matches(&TableId::new("billing", "invoices")));
//! ```

use crate::common::{CdcError, Result, TableId};
use regex::Regex;

/// A compiled table pattern.
#[derive(Debug, Clone)]
pub struct TablePattern {
    pattern: String,
    regex: Regex,
    qualified: bool,
}

impl TablePattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(CdcError::config("Empty table pattern"));
        }

        let regex = regex::RegexBuilder::new(&glob_to_regex(pattern))
            .case_insensitive(true)
            .build()
            .map_err(|e| CdcError::config(format!("Invalid table pattern '{}': {}", pattern, e)))?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            qualified: pattern.contains('.'),
        })
    }

    #[inline]
    pub fn matches(&self, table: &TableId) -> bool {
        if self.qualified {
            self.regex.is_match(&table.to_string())
        } else {
            self.regex.is_match(&table.name)
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// Include-list of table patterns.
#[derive(Debug, Clone, Default)]
pub struct TableSelector {
    patterns: Vec<TablePattern>,
}

impl TableSelector {
    pub fn new(patterns: Vec<TablePattern>) -> Self {
        Self { patterns }
    }

    /// Parse a comma-separated pattern list.
    pub fn parse(list: &str) -> Result<Self> {
        let patterns = list
            .split(',')
            .filter(|p| !p.trim().is_empty())
            .map(TablePattern::new)
            .collect::<Result<Vec<_>>>()?;
        if patterns.is_empty() {
            return Err(CdcError::config("No table patterns given"));
        }
        Ok(Self { patterns })
    }

    /// Check if a table matches any pattern
    pub fn matches(&self, table: &TableId) -> bool {
        self.patterns.iter().any(|p| p.matches(table))
    }

    /// Filter `candidates` down to the selected tables, sorted by name.
    pub fn select(&self, candidates: &[TableId]) -> Vec<TableId> {
        let mut selected: Vec<TableId> = candidates
            .iter()
            .filter(|t| self.matches(t))
            .cloned()
            .collect();
        selected.sort();
        selected.dedup();
        selected
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TablePattern> {
        self.patterns.iter()
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let escaped = regex::escape(pattern);
    let regex_pattern = escaped.replace(r"\*", ".*").replace(r"\?", ".");
    format!("^{}$", regex_pattern)
}
