//! Ledger Record Types
//!
//! Clock records, typed records and the bounded export bundle
//! exchanged between replicas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-user version counter. 1-indexed; 0 means "no history".
pub type Clock = u64;

/// Kind of metadata a record carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTable {
    /// Profile metadata
    Profile,
    /// Track metadata
    Track,
    /// Content-addressed file metadata
    Content,
}

impl SourceTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTable::Profile => "profile",
            SourceTable::Track => "track",
            SourceTable::Content => "content",
        }
    }
}

impl std::fmt::Display for SourceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceTable {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "profile" => Ok(SourceTable::Profile),
            "track" => Ok(SourceTable::Track),
            "content" => Ok(SourceTable::Content),
            other => Err(crate::Error::State(format!("unknown source table {}", other))),
        }
    }
}

/// Immutable log entry marking one mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockRecord {
    pub user_key: String,
    pub clock: Clock,
    pub source_table: SourceTable,
    pub created_at: DateTime<Utc>,
}

/// Typed record written at a given clock value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub clock: Clock,
    pub source_table: SourceTable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub payload: serde_json::Value,
    /// Content referenced by `content_hash` could not be fetched
    #[serde(default)]
    pub skipped: bool,
    pub created_at: DateTime<Utc>,
}

impl Record {
    /// Whether two records describe the same mutation, ignoring clock and skip state
    pub fn same_content(&self, other: &Record) -> bool {
        self.source_table == other.source_table
            && self.content_hash == other.content_hash
            && self.payload == other.payload
    }

    /// Matching clock record for this record
    pub fn clock_record(&self, user_key: &str) -> ClockRecord {
        ClockRecord {
            user_key: user_key.to_string(),
            clock: self.clock,
            source_table: self.source_table,
            created_at: self.created_at,
        }
    }
}

/// A mutation to append to a user's ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRecord {
    pub source_table: SourceTable,
    #[serde(default)]
    pub content_hash: Option<String>,
    pub payload: serde_json::Value,
}

/// Range metadata attached to every export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockInfo {
    pub requested_clock_range_min: Clock,
    pub requested_clock_range_max: Clock,
    /// `min(current clock, requested max)`
    pub local_clock_max: Clock,
}

/// Bounded slice of one user's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserExport {
    pub wallet: String,
    /// Full current clock of the exporting node, not clamped to the page
    pub clock: Clock,
    pub created_at: DateTime<Utc>,
    pub records: Vec<Record>,
    pub clock_records: Vec<ClockRecord>,
    pub clock_info: ClockInfo,
}

impl UserExport {
    /// Whether the exporter holds history beyond this page
    pub fn has_more(&self) -> bool {
        self.clock > self.clock_info.local_clock_max
    }
}
