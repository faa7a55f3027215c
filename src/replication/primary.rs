//! Primary Merge
//!
//! A primary that missed writes (for example while it was replaced and
//! later restored) absorbs a secondary's history by rebasing it: every
//! secondary record the primary does not already hold at the same
//! position is appended after the primary's current clock, keeping the
//! secondary's relative order. Concurrent writes are not reconciled;
//! the primary's history always stays first.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::{referenced_hashes, validate_export, ReplicationEngine};
use crate::error::{Error, Result};
use crate::ledger::{Clock, Record};
use crate::replication::protocol::MergeReport;

/// Reassign clocks so `records` follow `base_clock` contiguously
pub fn rebase(base_clock: Clock, records: Vec<Record>) -> Vec<Record> {
    records
        .into_iter()
        .enumerate()
        .map(|(offset, mut record)| {
            record.clock = base_clock + 1 + offset as Clock;
            record
        })
        .collect()
}

impl ReplicationEngine {
    /// Merge a secondary's history into the local (primary) ledger
    ///
    /// Runs in two passes over the secondary's export pages. The first
    /// fetches content for every record the primary lacks and holds only
    /// the set of unavailable hashes. Content that cannot be fetched aborts
    /// the merge with [`Error::ContentUnavailable`], writing nothing, until
    /// the user has failed `user_failure_threshold` times in a row; after
    /// that the records are persisted with `skipped = true`. The second pass
    /// rebases and persists one page at a time.
    pub async fn merge_from_secondary(&self, user_key: &str, secondary: &str) -> Result<MergeReport> {
        let _guard = self.claim(user_key)?;

        let base_clock = self.ledger.clock(user_key).await?;
        let sources = self.content_sources(user_key, secondary).await;

        let mut report = MergeReport {
            user: user_key.to_string(),
            base_clock,
            final_clock: base_clock,
            ..Default::default()
        };

        let mut pending = 0usize;
        let mut unavailable: HashSet<String> = HashSet::new();
        let mut pages = SecondaryPages::new(user_key, secondary, base_clock);
        while let Some(page) = pages.next(self).await? {
            if page.records.is_empty() {
                continue;
            }
            pending += page.records.len();
            let outcomes = self
                .fetcher
                .fetch_all(referenced_hashes(&page.records), &sources)
                .await?;
            unavailable.extend(
                outcomes
                    .into_iter()
                    .filter(|(_, outcome)| !outcome.is_available())
                    .map(|(hash, _)| hash),
            );
        }

        if pending == 0 {
            tracing::debug!(user = user_key, secondary, "Primary already holds secondary history");
            self.failures.reset(user_key).await;
            return Ok(report);
        }

        if !unavailable.is_empty() {
            let failure_count = self.failures.increment(user_key).await;
            let threshold = self.config.user_failure_threshold;
            if failure_count < threshold {
                return Err(Error::ContentUnavailable {
                    user: user_key.to_string(),
                    failed: unavailable.len(),
                    failure_count,
                    threshold,
                });
            }
            tracing::warn!(
                user = user_key,
                unavailable = unavailable.len(),
                failure_count,
                "Failure threshold reached, persisting merge with skipped content"
            );
        }

        let mut clock = base_clock;
        let mut pages = SecondaryPages::new(user_key, secondary, base_clock);
        while let Some(page) = pages.next(self).await? {
            if page.records.is_empty() {
                continue;
            }

            // Anything new since the first pass is fetched now and skipped if it fails
            let unseen: Vec<String> = referenced_hashes(&page.records)
                .into_iter()
                .filter(|hash| !unavailable.contains(hash))
                .collect();
            let outcomes = self.fetcher.fetch_all(unseen, &sources).await?;

            let records: Vec<Record> = rebase(clock, page.records)
                .into_iter()
                .map(|mut record| {
                    record.skipped = record.content_hash.as_ref().map_or(false, |hash| {
                        unavailable.contains(hash) || !outcomes.get(hash).map_or(true, |o| o.is_available())
                    });
                    record
                })
                .collect();

            report.skipped += records.iter().filter(|r| r.skipped).count() as u64;
            report.appended += records.len() as u64;
            clock = self.ledger.import_page(user_key, page.created_at, &records).await?;
        }
        report.final_clock = clock;
        self.failures.reset(user_key).await;

        tracing::info!(
            user = user_key,
            secondary,
            base_clock,
            appended = report.appended,
            skipped = report.skipped,
            clock = report.final_clock,
            "Merged secondary history into primary"
        );
        Ok(report)
    }

    /// Records in `page` the primary does not already hold at the same clock
    async fn missing_from_primary(&self, user_key: &str, base_clock: Clock, page: Vec<Record>) -> Result<Vec<Record>> {
        let (first, last) = match (page.first(), page.last()) {
            (Some(first), Some(last)) => (first.clock, last.clock),
            _ => return Ok(page),
        };
        if first > base_clock {
            return Ok(page);
        }

        let local: HashMap<Clock, Record> = self
            .ledger
            .records_between(user_key, first, last.min(base_clock))
            .await?
            .into_iter()
            .map(|r| (r.clock, r))
            .collect();

        Ok(page
            .into_iter()
            .filter(|record| {
                !local
                    .get(&record.clock)
                    .map_or(false, |existing| existing.same_content(record))
            })
            .collect())
    }
}

/// One export page reduced to the records the primary lacks
struct MissingPage {
    created_at: DateTime<Utc>,
    records: Vec<Record>,
}

/// Cursor over a secondary's export pages
struct SecondaryPages<'a> {
    user_key: &'a str,
    secondary: &'a str,
    base_clock: Clock,
    from: Option<Clock>,
}

impl<'a> SecondaryPages<'a> {
    fn new(user_key: &'a str, secondary: &'a str, base_clock: Clock) -> Self {
        Self {
            user_key,
            secondary,
            base_clock,
            from: Some(0),
        }
    }

    async fn next(&mut self, engine: &ReplicationEngine) -> Result<Option<MissingPage>> {
        let Some(from) = self.from else {
            return Ok(None);
        };
        let Some(export) = engine.client.export(self.secondary, self.user_key, from).await? else {
            self.from = None;
            return Ok(None);
        };
        validate_export(&export)?;

        self.from = export
            .has_more()
            .then(|| export.clock_info.local_clock_max + 1);
        let records = engine
            .missing_from_primary(self.user_key, self.base_clock, export.records)
            .await?;
        Ok(Some(MissingPage {
            created_at: export.created_at,
            records,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use tempfile::tempdir;

    use crate::config::SyncConfig;
    use crate::content::ContentStore;
    use crate::ledger::{NewRecord, SourceTable};
    use crate::registry::{LocalRegistry, ReplicaSet};
    use crate::state::SyncHistoryAggregator;
    use crate::testing::{FakeNetwork, FakeNode};

    const PRIMARY: &str = "http://cn1";
    const SECONDARY: &str = "http://cn2";
    const USER: &str = "0xabc";

    async fn setup(range: u64) -> (Arc<FakeNetwork>, Arc<FakeNode>, Arc<FakeNode>, ReplicationEngine, tempfile::TempDir) {
        let network = FakeNetwork::new();
        let primary = network.add_node(PRIMARY, range).await;
        let secondary = network.add_node(SECONDARY, range).await;

        let dir = tempdir().unwrap();
        let registry = Arc::new(LocalRegistry::open(dir.path()).unwrap());
        registry
            .register(USER, 1, &ReplicaSet::new(PRIMARY, SECONDARY, "http://cn3"))
            .await
            .unwrap();

        let engine = ReplicationEngine::new(
            PRIMARY.into(),
            SyncConfig {
                max_export_clock_value_range: range,
                content_fetch_retry_delay_ms: 0,
                content_fetch_max_retries: 1,
                user_failure_threshold: 3,
                ..Default::default()
            },
            primary.ledger.clone(),
            primary.content.clone(),
            network.clone(),
            registry,
            Arc::new(SyncHistoryAggregator::default()),
        );
        (network, primary, secondary, engine, dir)
    }

    fn track(label: &str) -> NewRecord {
        NewRecord {
            source_table: SourceTable::Track,
            content_hash: None,
            payload: json!({ "title": label }),
        }
    }

    async fn titles(node: &FakeNode) -> Vec<String> {
        node.ledger
            .records_between(USER, 1, u64::MAX >> 1)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.payload["title"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_rebase_keeps_relative_order() {
        let now = Utc::now();
        let records = (1..=3)
            .map(|clock| Record {
                clock,
                source_table: SourceTable::Profile,
                content_hash: None,
                payload: json!({ "n": clock }),
                skipped: false,
                created_at: now,
            })
            .collect();
        let rebased = rebase(7, records);
        let clocks: Vec<_> = rebased.iter().map(|r| r.clock).collect();
        assert_eq!(clocks, vec![8, 9, 10]);
        assert_eq!(rebased[0].payload, json!({ "n": 1 }));
    }

    #[tokio::test]
    async fn test_divergent_history_is_rebased() {
        let (_network, primary, secondary, engine, _dir) = setup(10).await;
        for label in ["p1", "p2"] {
            primary.ledger.append(USER, track(label)).await.unwrap();
        }
        for label in ["s1", "s2", "s3", "s4"] {
            secondary.ledger.append(USER, track(label)).await.unwrap();
        }

        let report = engine.merge_from_secondary(USER, SECONDARY).await.unwrap();
        assert_eq!(report.base_clock, 2);
        assert_eq!(report.appended, 4);
        assert_eq!(report.final_clock, 6);
        assert_eq!(titles(&primary).await, vec!["p1", "p2", "s1", "s2", "s3", "s4"]);
        assert_eq!(primary.ledger.clock(USER).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_shared_prefix_is_not_duplicated() {
        let (_network, primary, secondary, engine, _dir) = setup(10).await;

        // Records replicated earlier are identical on both sides
        for label in ["a", "b"] {
            primary.ledger.append(USER, track(label)).await.unwrap();
        }
        let shared = primary.ledger.export_range(USER, 0).await.unwrap().unwrap();
        secondary
            .ledger
            .import_page(USER, shared.created_at, &shared.records)
            .await
            .unwrap();
        for label in ["c", "d", "e"] {
            secondary.ledger.append(USER, track(label)).await.unwrap();
        }

        let report = engine.merge_from_secondary(USER, SECONDARY).await.unwrap();
        assert_eq!(report.appended, 3);
        assert_eq!(titles(&primary).await, titles(&secondary).await);
    }

    #[tokio::test]
    async fn test_superset_is_noop_across_pages() {
        let (_network, primary, secondary, engine, _dir) = setup(4).await;
        for n in 0..9 {
            primary.ledger.append(USER, track(&format!("t{}", n))).await.unwrap();
        }
        let mut from = 0;
        loop {
            let page = primary.ledger.export_range(USER, from).await.unwrap().unwrap();
            let local = secondary.ledger.clock(USER).await.unwrap();
            let missing: Vec<_> = page.records.iter().filter(|r| r.clock > local).cloned().collect();
            secondary.ledger.import_page(USER, page.created_at, &missing).await.unwrap();
            if !page.has_more() {
                break;
            }
            from = page.clock_info.local_clock_max + 1;
        }
        assert_eq!(secondary.ledger.clock(USER).await.unwrap(), 9);
        primary.ledger.append(USER, track("t9")).await.unwrap();

        let report = engine.merge_from_secondary(USER, SECONDARY).await.unwrap();
        assert_eq!(report.appended, 0);
        assert_eq!(report.final_clock, 10);
    }

    #[tokio::test]
    async fn test_long_history_is_merged_page_by_page() {
        let (_network, primary, secondary, engine, _dir) = setup(4).await;
        primary.ledger.append(USER, track("p1")).await.unwrap();
        let labels: Vec<String> = (0..9).map(|n| format!("s{}", n)).collect();
        for label in &labels {
            secondary.ledger.append(USER, track(label)).await.unwrap();
        }

        let report = engine.merge_from_secondary(USER, SECONDARY).await.unwrap();
        assert_eq!(report.base_clock, 1);
        assert_eq!(report.appended, 9);
        assert_eq!(report.final_clock, 10);

        let mut expected = vec!["p1".to_string()];
        expected.extend(labels);
        assert_eq!(titles(&primary).await, expected);

        // Every page landed contiguously, so a full export passes the consistency check
        let export = primary.ledger.export_range(USER, 8).await.unwrap().unwrap();
        assert_eq!(export.clock, 10);
    }

    #[tokio::test]
    async fn test_unavailable_content_aborts_until_threshold() {
        let (network, primary, secondary, engine, _dir) = setup(10).await;
        primary.ledger.append(USER, track("p1")).await.unwrap();

        let mut hashes = Vec::new();
        for n in 0..2u8 {
            let hash = secondary.content.put(&[n; 8]).await.unwrap();
            secondary
                .ledger
                .append(
                    USER,
                    NewRecord {
                        source_table: SourceTable::Content,
                        content_hash: Some(hash.clone()),
                        payload: json!({ "title": format!("file{}", n) }),
                    },
                )
                .await
                .unwrap();
            network.deny_content(&hash).await;
            hashes.push(hash);
        }

        for attempt in 1..=2u32 {
            let err = engine.merge_from_secondary(USER, SECONDARY).await.unwrap_err();
            match err {
                Error::ContentUnavailable { failed, failure_count, threshold, .. } => {
                    assert_eq!(failed, 2);
                    assert_eq!(failure_count, attempt);
                    assert_eq!(threshold, 3);
                }
                other => panic!("unexpected error {:?}", other),
            }
            assert_eq!(primary.ledger.clock(USER).await.unwrap(), 1);
        }

        let report = engine.merge_from_secondary(USER, SECONDARY).await.unwrap();
        assert_eq!(report.appended, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(primary.ledger.skipped_records(USER).await.unwrap().len(), 2);
        assert_eq!(engine.failures().get(USER).await, 0);
    }
}
