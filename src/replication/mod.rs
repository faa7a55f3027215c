//! Replication Module
//!
//! Pull-based sync between replicas. A secondary pulls missing history
//! from the primary page by page; a primary that fell behind its
//! secondaries merges their history by rebasing it onto its own clock.

mod fetch;
mod primary;
pub mod protocol;
mod secondary;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

pub use fetch::{ContentFetcher, FetchOutcome};
pub use primary::rebase;
pub use protocol::{MergeReport, SyncReport, SyncRequest, SyncType};

use crate::config::SyncConfig;
use crate::content::ContentStore;
use crate::error::{Error, Result};
use crate::ledger::{ClockLedger, Record, UserExport};
use crate::network::PeerClient;
use crate::registry::ReplicaSetRegistry;
use crate::state::{SyncHistoryAggregator, UserSyncFailureCounter};

/// Runs the two sync algorithms against the local ledger
pub struct ReplicationEngine {
    /// This node's endpoint
    endpoint: String,
    config: SyncConfig,
    ledger: Arc<ClockLedger>,
    client: Arc<dyn PeerClient>,
    registry: Arc<dyn ReplicaSetRegistry>,
    history: Arc<SyncHistoryAggregator>,
    fetcher: ContentFetcher,
    failures: UserSyncFailureCounter,
    /// Users with a sync or merge running on this node
    in_progress: Mutex<HashSet<String>>,
}

impl ReplicationEngine {
    pub fn new(
        endpoint: String,
        config: SyncConfig,
        ledger: Arc<ClockLedger>,
        content: Arc<dyn ContentStore>,
        client: Arc<dyn PeerClient>,
        registry: Arc<dyn ReplicaSetRegistry>,
        history: Arc<SyncHistoryAggregator>,
    ) -> Self {
        let fetcher = ContentFetcher::new(
            content,
            client.clone(),
            config.content_fetch_max_retries,
            config.content_fetch_retry_delay(),
            config.content_fetch_concurrency,
        );

        Self {
            endpoint,
            config,
            ledger,
            client,
            registry,
            history,
            fetcher,
            failures: UserSyncFailureCounter::new(),
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    /// This node's endpoint
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Consecutive merge failures per user
    pub fn failures(&self) -> &UserSyncFailureCounter {
        &self.failures
    }

    /// Whether a sync or merge is running for the user
    pub fn is_syncing(&self, user_key: &str) -> bool {
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(user_key)
    }

    /// Claim the per-user sync slot, failing with `SyncInProgress` if taken
    fn claim(&self, user_key: &str) -> Result<UserSyncGuard<'_>> {
        let mut users = self.in_progress.lock().unwrap_or_else(PoisonError::into_inner);
        if !users.insert(user_key.to_string()) {
            return Err(Error::SyncInProgress(user_key.to_string()));
        }
        Ok(UserSyncGuard {
            users: &self.in_progress,
            user_key: user_key.to_string(),
        })
    }

    /// Content sources for a user: `first`, then the other replica set members, never self
    async fn content_sources(&self, user_key: &str, first: &str) -> Vec<String> {
        let mut sources = vec![first.to_string()];

        match self.registry.get_replica_set(user_key).await {
            Ok(Some(assignment)) => {
                for member in assignment.replica_set.members() {
                    if member != self.endpoint && !sources.iter().any(|s| s == member) {
                        sources.push(member.to_string());
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(user = user_key, error = %e, "Replica set lookup failed, fetching from {} only", first);
            }
        }

        sources
    }
}

/// Releases a user's sync slot on drop
struct UserSyncGuard<'a> {
    users: &'a Mutex<HashSet<String>>,
    user_key: String,
}

impl Drop for UserSyncGuard<'_> {
    fn drop(&mut self) {
        self.users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.user_key);
    }
}

/// Check that an export's records and clock records pair up by clock
fn validate_export(export: &UserExport) -> Result<()> {
    if export.records.len() != export.clock_records.len() {
        return Err(Error::Consistency(format!(
            "Export for {} has {} records but {} clock records",
            export.wallet,
            export.records.len(),
            export.clock_records.len()
        )));
    }

    for (record, clock_record) in export.records.iter().zip(&export.clock_records) {
        if record.clock != clock_record.clock || record.source_table != clock_record.source_table {
            return Err(Error::Consistency(format!(
                "Export for {} pairs record at clock {} with clock record {}",
                export.wallet, record.clock, clock_record.clock
            )));
        }
    }

    Ok(())
}

/// Unique content hashes referenced by records, in first-seen order
fn referenced_hashes(records: &[Record]) -> Vec<String> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter_map(|r| r.content_hash.clone())
        .filter(|h| seen.insert(h.clone()))
        .collect()
}
