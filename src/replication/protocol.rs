//! Replication Protocol
//!
//! JSON bodies exchanged between replica nodes over HTTP.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::{Clock, UserExport};

/// What triggered a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// Background anti-entropy from the state machine
    Recurring,
    /// User-triggered, latency-sensitive
    Manual,
}

impl std::fmt::Display for SyncType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncType::Recurring => write!(f, "RECURRING"),
            SyncType::Manual => write!(f, "MANUAL"),
        }
    }
}

// ========== Export ==========

/// `GET /export` query string
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportQuery {
    pub user: String,
    #[serde(default)]
    pub clock_range_min: Clock,
}

/// `GET /export` body, keyed by user; empty when the user is unknown
pub type ExportResponse = BTreeMap<String, UserExport>;

// ========== Sync ==========

/// `POST /sync` body asking this node to pull from a primary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub wallet: Vec<String>,
    pub creator_node_endpoint: String,
    pub sync_type: SyncType,
    #[serde(default)]
    pub immediate: bool,
    /// Wipe local state before pulling
    #[serde(default)]
    pub force_resync: bool,
}

/// Outcome of one secondary pull
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub user: String,
    pub pages: u32,
    /// Records written this run
    pub applied: u64,
    /// Records written with `skipped = true`
    pub skipped: u64,
    /// Previously skipped content recovered this run
    pub recovered: u64,
    pub final_clock: Clock,
}

/// Outcome of a primary merge from a secondary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub user: String,
    /// Primary clock before the merge; rebased records start after it
    pub base_clock: Clock,
    pub appended: u64,
    pub skipped: u64,
    pub final_clock: Clock,
}

// ========== Clock status ==========

/// `POST /users/batch_clock_status` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchClockStatusRequest {
    pub wallet_public_keys: Vec<String>,
}

/// `POST /users/batch_clock_status` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchClockStatusResponse {
    pub users: Vec<UserClockStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserClockStatus {
    pub wallet_public_key: String,
    pub clock: Clock,
}

/// `GET /users/clock_status/:wallet` response
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockStatusResponse {
    pub clock_value: Clock,
}

// ========== Health ==========

/// `GET /health_check` response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub healthy: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub uptime_secs: u64,
    #[serde(default)]
    pub available_memory: Option<u64>,
    #[serde(default)]
    pub total_memory: Option<u64>,
    #[serde(default)]
    pub daily_sync_success_count: u64,
    #[serde(default)]
    pub daily_sync_fail_count: u64,
    #[serde(default)]
    pub rolling_sync_success_count: u64,
    #[serde(default)]
    pub rolling_sync_fail_count: u64,
    #[serde(default)]
    pub latest_sync_success: Option<DateTime<Utc>>,
    #[serde(default)]
    pub latest_sync_fail: Option<DateTime<Utc>>,
}
