//! Static destination map: logical name → upstream `host:port`.
//!
//! The table is loaded once at startup from newline-delimited `name,address`
//! records and only read afterwards, so lookups need no synchronization.
//! Blank lines and lines whose first non-blank character is `#` are skipped;
//! any other line without a `name,address` pair aborts the load.

use crate::error::MappingError;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Destination name → upstream address lookup table.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    entries: HashMap<String, String>,
}

impl Mapping {
    /// An empty table (every destination resolves to not-found).
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the table from a map file, or return an empty table when no
    /// file is configured.
    pub fn load(path: Option<&Path>) -> Result<Self, MappingError> {
        let Some(path) = path else {
            return Ok(Self::new());
        };
        let content = std::fs::read_to_string(path).map_err(|source| MappingError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse map records from text.
    pub fn parse(content: &str) -> Result<Self, MappingError> {
        let mut mapping = Self::new();
        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (name, address) = line
                .split_once(',')
                .map(|(n, a)| (n.trim(), a.trim()))
                .filter(|(n, a)| !n.is_empty() && !a.is_empty())
                .ok_or_else(|| MappingError::InvalidLine {
                    line: idx + 1,
                    content: line.to_string(),
                })?;

            info!(from = %name, to = %address, "created map");
            mapping.insert(name, address);
        }
        Ok(mapping)
    }

    /// Look up the upstream address for a destination name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Add or replace an entry. Only possible while the table is still
    /// exclusively owned, i.e. before it is shared with the server.
    pub fn insert(&mut self, name: impl Into<String>, address: impl Into<String>) {
        self.entries.insert(name.into(), address.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
