//! Sync History
//!
//! Per-endpoint daily counters of triggered, successful and failed
//! syncs, plus the latest success and failure timestamps. Buckets older
//! than the retention window are pruned on write.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Days of history kept per endpoint
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// Outcome of one sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub triggered: u64,
    pub success: u64,
    pub fail: u64,
}

impl SyncCounts {
    fn add(&mut self, other: &SyncCounts) {
        self.triggered += other.triggered;
        self.success += other.success;
        self.fail += other.fail;
    }

    /// Samples with a known outcome
    pub fn total(&self) -> u64 {
        self.success + self.fail
    }

    /// Success percentage, `None` without samples
    pub fn success_percentage(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some(self.success as f64 * 100.0 / total as f64),
        }
    }
}

/// Point-in-time view of one endpoint's history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncHistorySnapshot {
    pub daily: SyncCounts,
    pub rolling: SyncCounts,
    pub latest_success: Option<DateTime<Utc>>,
    pub latest_fail: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct EndpointHistory {
    days: BTreeMap<NaiveDate, SyncCounts>,
    latest_success: Option<DateTime<Utc>>,
    latest_fail: Option<DateTime<Utc>>,
}

/// Rolling sync counters keyed by endpoint
pub struct SyncHistoryAggregator {
    retention_days: i64,
    endpoints: RwLock<HashMap<String, EndpointHistory>>,
}

impl Default for SyncHistoryAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_DAYS)
    }
}

impl SyncHistoryAggregator {
    pub fn new(retention_days: i64) -> Self {
        Self {
            retention_days: retention_days.max(1),
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Record an outcome now
    pub async fn record(&self, endpoint: &str, outcome: SyncOutcome) {
        self.record_at(endpoint, outcome, Utc::now()).await
    }

    /// Record an outcome at a given time
    pub async fn record_at(&self, endpoint: &str, outcome: SyncOutcome, at: DateTime<Utc>) {
        let mut endpoints = self.endpoints.write().await;
        let history = endpoints.entry(endpoint.to_string()).or_default();

        let bucket = history.days.entry(at.date_naive()).or_default();
        bucket.triggered += 1;
        match outcome {
            SyncOutcome::Success => {
                bucket.success += 1;
                history.latest_success = history.latest_success.max(Some(at));
            }
            SyncOutcome::Failure => {
                bucket.fail += 1;
                history.latest_fail = history.latest_fail.max(Some(at));
            }
        }

        let cutoff = (at - Duration::days(self.retention_days)).date_naive();
        history.days.retain(|day, _| *day > cutoff);
    }

    /// Counters for an endpoint as of now
    pub async fn snapshot(&self, endpoint: &str) -> SyncHistorySnapshot {
        self.snapshot_at(endpoint, Utc::now()).await
    }

    /// Counters for an endpoint as of a given time
    pub async fn snapshot_at(&self, endpoint: &str, now: DateTime<Utc>) -> SyncHistorySnapshot {
        let endpoints = self.endpoints.read().await;
        let history = match endpoints.get(endpoint) {
            Some(history) => history,
            None => return SyncHistorySnapshot::default(),
        };

        let today = now.date_naive();
        let cutoff = (now - Duration::days(self.retention_days)).date_naive();

        let mut snapshot = SyncHistorySnapshot {
            latest_success: history.latest_success,
            latest_fail: history.latest_fail,
            ..Default::default()
        };
        for (day, counts) in history.days.range(cutoff.succ_opt().unwrap_or(cutoff)..) {
            if *day > today {
                continue;
            }
            snapshot.rolling.add(counts);
            if *day == today {
                snapshot.daily.add(counts);
            }
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_and_latest() {
        let history = SyncHistoryAggregator::default();

        history.record("http://cn2", SyncOutcome::Success).await;
        history.record("http://cn2", SyncOutcome::Success).await;
        history.record("http://cn2", SyncOutcome::Failure).await;

        let snapshot = history.snapshot("http://cn2").await;
        assert_eq!(snapshot.daily, SyncCounts { triggered: 3, success: 2, fail: 1 });
        assert_eq!(snapshot.rolling, snapshot.daily);
        assert!(snapshot.latest_success.is_some());
        assert!(snapshot.latest_fail.is_some());

        assert_eq!(history.snapshot("http://cn3").await, SyncHistorySnapshot::default());
    }

    #[tokio::test]
    async fn test_rolling_window_and_pruning() {
        let history = SyncHistoryAggregator::new(7);
        let now = Utc::now();

        history.record_at("http://cn2", SyncOutcome::Failure, now - Duration::days(10)).await;
        history.record_at("http://cn2", SyncOutcome::Failure, now - Duration::days(3)).await;
        history.record_at("http://cn2", SyncOutcome::Success, now).await;

        let snapshot = history.snapshot_at("http://cn2", now).await;
        assert_eq!(snapshot.daily, SyncCounts { triggered: 1, success: 1, fail: 0 });
        assert_eq!(snapshot.rolling, SyncCounts { triggered: 2, success: 1, fail: 1 });
        assert_eq!(snapshot.rolling.success_percentage(), Some(50.0));
    }
}
