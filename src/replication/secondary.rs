//! Secondary Sync
//!
//! A secondary pulls the primary's history one export page at a time,
//! fetching referenced content before persisting each page atomically.
//! Content that cannot be fetched is persisted with `skipped = true`;
//! a later sync retries it.

use super::{referenced_hashes, validate_export, ReplicationEngine};
use crate::error::{Error, Result};
use crate::ledger::{Clock, Record, UserExport};
use crate::replication::protocol::SyncReport;
use crate::state::SyncOutcome;

impl ReplicationEngine {
    /// Bring the local replica of a user up to the primary's clock
    pub async fn sync_from_primary(&self, user_key: &str, primary: &str, force_resync: bool) -> Result<SyncReport> {
        let _guard = self.claim(user_key)?;

        let result = self.pull_from_primary(user_key, primary, force_resync).await;
        match &result {
            Ok(report) => {
                self.history.record(&self.endpoint, SyncOutcome::Success).await;
                tracing::info!(
                    user = user_key,
                    primary,
                    pages = report.pages,
                    applied = report.applied,
                    skipped = report.skipped,
                    clock = report.final_clock,
                    "Secondary sync complete"
                );
            }
            Err(e) => {
                self.history.record(&self.endpoint, SyncOutcome::Failure).await;
                tracing::error!(user = user_key, primary, error = %e, "Secondary sync failed");
            }
        }
        result
    }

    async fn pull_from_primary(&self, user_key: &str, primary: &str, force_resync: bool) -> Result<SyncReport> {
        if force_resync {
            if self.config.force_wipe_enabled {
                self.ledger.wipe(user_key).await?;
            } else {
                tracing::warn!(user = user_key, "Force resync requested but wiping is disabled, syncing incrementally");
            }
        }

        let sources = self.content_sources(user_key, primary).await;
        let mut report = SyncReport {
            user: user_key.to_string(),
            ..Default::default()
        };

        loop {
            let local_clock = self.ledger.clock(user_key).await?;
            let export = match self.client.export(primary, user_key, local_clock).await? {
                Some(export) => export,
                None => {
                    tracing::debug!(user = user_key, primary, "Primary has no state for user");
                    break;
                }
            };

            let pending = pending_records(&export, local_clock)?;
            if pending.is_empty() {
                break;
            }

            let outcomes = self
                .fetcher
                .fetch_all(referenced_hashes(&pending), &sources)
                .await?;

            let records: Vec<Record> = pending
                .into_iter()
                .map(|mut record| {
                    record.skipped = record
                        .content_hash
                        .as_ref()
                        .map_or(false, |hash| !outcomes.get(hash).map_or(false, |o| o.is_available()));
                    record
                })
                .collect();

            let skipped = records.iter().filter(|r| r.skipped).count() as u64;
            let clock = self
                .ledger
                .import_page(user_key, export.created_at, &records)
                .await?;

            report.pages += 1;
            report.applied += records.len() as u64;
            report.skipped += skipped;

            if !export.has_more() || clock >= export.clock {
                break;
            }
        }

        report.recovered = self.recover_skipped(user_key, &sources).await?;
        report.final_clock = self.ledger.clock(user_key).await?;
        Ok(report)
    }

    /// Retry content for records previously persisted as skipped
    async fn recover_skipped(&self, user_key: &str, sources: &[String]) -> Result<u64> {
        let skipped = self.ledger.skipped_records(user_key).await?;
        if skipped.is_empty() {
            return Ok(0);
        }

        let outcomes = self
            .fetcher
            .fetch_all(referenced_hashes(&skipped), sources)
            .await?;

        let mut recovered = 0;
        for record in skipped {
            let available = record
                .content_hash
                .as_ref()
                .map_or(true, |hash| outcomes.get(hash).map_or(false, |o| o.is_available()));
            if available {
                self.ledger.mark_recovered(user_key, record.clock).await?;
                recovered += 1;
            }
        }

        if recovered > 0 {
            tracing::info!(user = user_key, recovered, "Recovered previously skipped content");
        }
        Ok(recovered)
    }
}

/// Records in an export that are newer than the local clock, checked for contiguity
fn pending_records(export: &UserExport, local_clock: Clock) -> Result<Vec<Record>> {
    validate_export(export)?;

    let pending: Vec<Record> = export
        .records
        .iter()
        .filter(|r| r.clock > local_clock)
        .cloned()
        .collect();

    for (offset, record) in pending.iter().enumerate() {
        let expected = local_clock + 1 + offset as Clock;
        if record.clock != expected {
            return Err(Error::Replication(format!(
                "Cannot sync {} - export is not contiguous: expected clock {}, got {}",
                export.wallet, expected, record.clock
            )));
        }
    }

    Ok(pending)
}
