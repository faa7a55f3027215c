//! State Machine
//!
//! Periodic anti-entropy pass over one slice of this node's users.
//! Each run slices the population by `user_id % modulo_base`, probes the
//! secondaries of users this node is primary for, and then dispatches
//! syncs, inline merges and reconfigurations. A slice holding more than
//! `users_per_job` users is covered over successive visits: a cursor per
//! slice picks up where the previous visit stopped. A run that fails part
//! way is logged and retried from scratch on the next tick.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Notify, RwLock};
use tokio::time::MissedTickBehavior;

use super::decision::DecisionLog;
use super::queue::{QueueStats, SyncQueues};
use crate::config::StateMachineConfig;
use crate::error::{Error, Result};
use crate::ledger::{Clock, ClockLedger};
use crate::network::PeerClient;
use crate::registry::{ReplicaSet, ReplicaSetRegistry, UserAssignment};
use crate::replication::{ReplicationEngine, SyncType};
use crate::state::{Enqueued, PeerHealth, PeerHealthEvaluator, SyncHistoryAggregator, SyncOutcome};

/// Where the state machine is within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Idle,
    Slicing,
    Evaluating,
    Dispatching,
}

/// Something a run decided about one (user, secondary) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    /// Secondary trails this primary
    SyncNeeded { user: String, secondary: String, secondary_clock: Clock },
    /// Secondary is ahead of this primary
    PrimaryMergeNeeded { user: String, secondary: String },
    /// Secondary failed health evaluation
    ReplicaUnhealthy { user: String, secondary: String },
    /// Secondary's clock could not be read this run
    Unreachable { user: String, secondary: String },
}

/// Outcome of one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub run: u64,
    pub slice: u64,
    pub modulo_base: u64,
    /// Position within the slice this run started at
    pub slice_offset: usize,
    pub users_in_slice: usize,
    pub users_as_primary: usize,
    /// Users in the slice this node is only a secondary for
    pub users_skipped: usize,
    pub unhealthy_peers: Vec<String>,
    pub findings: Vec<Finding>,
    pub syncs_enqueued: usize,
    pub syncs_deduplicated: usize,
    pub merges: usize,
    pub merge_failures: usize,
    pub reconfigurations: usize,
    pub reconfigurations_deferred: usize,
    pub errors: Vec<String>,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Snapshot exposed over the admin API
#[derive(Debug, Clone, Serialize)]
pub struct MachineStatus {
    pub state: MachineState,
    pub current_slice: u64,
    pub modulo_base: u64,
    pub last_run: Option<RunSummary>,
    pub queues: QueueStats,
}

/// Services the state machine drives
#[derive(Clone)]
pub struct MachineContext {
    pub registry: Arc<dyn ReplicaSetRegistry>,
    pub ledger: Arc<ClockLedger>,
    pub client: Arc<dyn PeerClient>,
    pub health: Arc<PeerHealthEvaluator>,
    pub history: Arc<SyncHistoryAggregator>,
    pub replication: Arc<ReplicationEngine>,
    pub queues: Arc<SyncQueues>,
}

pub struct StateMachine {
    endpoint: String,
    config: StateMachineConfig,
    /// Population replacements are drawn from
    peers: Vec<String>,
    ctx: MachineContext,
    state: RwLock<MachineState>,
    current_slice: RwLock<u64>,
    slice_offsets: RwLock<HashMap<u64, usize>>,
    last_run: RwLock<Option<RunSummary>>,
    runs: AtomicU64,
    shutdown: RwLock<bool>,
    wake: Notify,
}

impl StateMachine {
    pub fn new(endpoint: String, config: StateMachineConfig, peers: Vec<String>, ctx: MachineContext) -> Self {
        let modulo_base = config.modulo_base.max(1);
        let slice = rand::thread_rng().gen_range(0..modulo_base);
        tracing::info!(slice, modulo_base, "Starting at data slice");

        Self {
            endpoint,
            config,
            peers,
            ctx,
            state: RwLock::new(MachineState::Idle),
            current_slice: RwLock::new(slice),
            slice_offsets: RwLock::new(HashMap::new()),
            last_run: RwLock::new(None),
            runs: AtomicU64::new(0),
            shutdown: RwLock::new(false),
            wake: Notify::new(),
        }
    }

    fn modulo_base(&self) -> u64 {
        self.config.modulo_base.max(1)
    }

    pub async fn state(&self) -> MachineState {
        *self.state.read().await
    }

    pub async fn current_slice(&self) -> u64 {
        *self.current_slice.read().await
    }

    pub async fn last_run(&self) -> Option<RunSummary> {
        self.last_run.read().await.clone()
    }

    pub async fn status(&self) -> MachineStatus {
        MachineStatus {
            state: self.state().await,
            current_slice: self.current_slice().await,
            modulo_base: self.modulo_base(),
            last_run: self.last_run().await,
            queues: self.ctx.queues.stats(),
        }
    }

    async fn set_state(&self, state: MachineState) {
        *self.state.write().await = state;
    }

    /// Run on the configured interval until [`shutdown`](Self::shutdown)
    pub async fn start(&self) {
        let mut ticker = tokio::time::interval(self.config.job_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_ms = self.config.job_interval_ms, "State machine started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            if *self.shutdown.read().await {
                break;
            }
            self.run_once().await;
        }
        tracing::info!("State machine stopped");
    }

    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;
        self.wake.notify_one();
    }

    /// One full pass over the current slice
    pub async fn run_once(&self) -> RunSummary {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let slice = self.current_slice().await;
        let modulo_base = self.modulo_base();
        let slice_offset = self.slice_offsets.read().await.get(&slice).copied().unwrap_or(0);

        let mut log = DecisionLog::new();
        log.add("begin", json!({ "slice": slice, "modulo_base": modulo_base }));

        let mut summary = RunSummary {
            run,
            slice,
            modulo_base,
            slice_offset,
            started_at: Utc::now(),
            ..Default::default()
        };

        match self.run_stages(slice, slice_offset, &mut log, &mut summary).await {
            Ok(next_offset) => {
                self.slice_offsets.write().await.insert(slice, next_offset);
                let next = (slice + 1) % modulo_base;
                *self.current_slice.write().await = next;
                summary.success = true;
                log.add(
                    "end",
                    json!({
                        "slice": slice,
                        "next_slice": next,
                        "syncs_enqueued": summary.syncs_enqueued,
                        "merges": summary.merges,
                        "reconfigurations": summary.reconfigurations,
                    }),
                );
            }
            Err(e) => {
                tracing::error!(run, slice, error = %e, "State machine run aborted");
                summary.errors.push(e.to_string());
                log.add("error", json!({ "error": e.to_string() }));
            }
        }

        self.set_state(MachineState::Idle).await;
        summary.finished_at = Some(Utc::now());
        log.emit(run, summary.success);
        *self.last_run.write().await = Some(summary.clone());
        summary
    }

    /// Returns where the next visit to `slice` starts
    async fn run_stages(
        &self,
        slice: u64,
        offset: usize,
        log: &mut DecisionLog,
        summary: &mut RunSummary,
    ) -> Result<usize> {
        self.set_state(MachineState::Slicing).await;
        let node_users = match self.ctx.registry.users_for_node(&self.endpoint).await {
            Ok(users) => users,
            Err(e) => {
                log.add("slice_users_error", json!({ "error": e.to_string() }));
                return Err(e);
            }
        };
        let node_user_count = node_users.len();
        let (users, next_offset) = slice_users(
            node_users,
            self.modulo_base(),
            slice,
            offset,
            self.config.users_per_job.max(1),
        );
        summary.users_in_slice = users.len();
        log.add(
            "slice_users",
            json!({
                "node_users": node_user_count,
                "users_in_slice": users.len(),
                "offset": offset,
                "next_offset": next_offset,
            }),
        );

        self.set_state(MachineState::Evaluating).await;
        let primary_users: Vec<UserAssignment> = users
            .into_iter()
            .filter(|u| u.replica_set.is_primary(&self.endpoint))
            .collect();
        summary.users_as_primary = primary_users.len();
        summary.users_skipped = summary.users_in_slice - primary_users.len();

        let secondaries: Vec<String> = primary_users
            .iter()
            .flat_map(|u| u.replica_set.secondaries())
            .filter(|s| *s != self.endpoint)
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let health = self.ctx.health.evaluate(&secondaries).await;
        let unhealthy: BTreeSet<String> = health
            .values()
            .filter(|h| !h.healthy)
            .map(|h| h.endpoint.clone())
            .collect();
        summary.unhealthy_peers = unhealthy.iter().cloned().collect();
        log.add(
            "evaluate_health",
            json!({ "peers": secondaries.len(), "unhealthy_peers": summary.unhealthy_peers }),
        );

        let secondary_clocks = self.secondary_clocks(&primary_users, &unhealthy).await;
        let user_keys: Vec<String> = primary_users.iter().map(|u| u.user_key.clone()).collect();
        let primary_clocks = match self.ctx.ledger.clocks(&user_keys).await {
            Ok(clocks) => clocks,
            Err(e) => {
                log.add("primary_clocks_error", json!({ "error": e.to_string() }));
                return Err(e);
            }
        };

        let findings = evaluate_users(&primary_users, &unhealthy, &primary_clocks, &secondary_clocks);
        log.add("findings", findings_summary(&findings));

        self.set_state(MachineState::Dispatching).await;
        self.dispatch_syncs(&findings, summary).await;
        self.dispatch_merges(&findings, summary).await;
        self.dispatch_reconfigurations(&primary_users, &findings, &health, log, summary)
            .await;
        log.add(
            "dispatch",
            json!({
                "syncs_enqueued": summary.syncs_enqueued,
                "syncs_deduplicated": summary.syncs_deduplicated,
                "merges": summary.merges,
                "merge_failures": summary.merge_failures,
                "reconfigurations": summary.reconfigurations,
                "reconfigurations_deferred": summary.reconfigurations_deferred,
                "errors": summary.errors,
            }),
        );

        summary.findings = findings;
        Ok(next_offset)
    }

    /// Clocks reported by each healthy secondary; `None` when it could not be asked
    async fn secondary_clocks(
        &self,
        users: &[UserAssignment],
        unhealthy: &BTreeSet<String>,
    ) -> HashMap<String, Option<HashMap<String, Clock>>> {
        let mut by_secondary: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for user in users {
            for secondary in user.replica_set.secondaries() {
                if secondary != self.endpoint && !unhealthy.contains(secondary) {
                    by_secondary
                        .entry(secondary.to_string())
                        .or_default()
                        .push(user.user_key.clone());
                }
            }
        }

        let requests = by_secondary.into_iter().map(|(secondary, user_keys)| async move {
            let result = self.ctx.client.batch_clock_status(&secondary, &user_keys).await;
            (secondary, result)
        });

        let mut clocks = HashMap::new();
        for (secondary, result) in futures::future::join_all(requests).await {
            match result {
                Ok(statuses) => {
                    let map = statuses
                        .into_iter()
                        .map(|s| (s.wallet_public_key, s.clock))
                        .collect();
                    clocks.insert(secondary, Some(map));
                }
                Err(e) => {
                    tracing::warn!(secondary = %secondary, error = %e, "Batch clock status failed");
                    if matches!(e, Error::PeerUnreachable { .. }) {
                        self.ctx.history.record(&secondary, SyncOutcome::Failure).await;
                    }
                    clocks.insert(secondary, None);
                }
            }
        }
        clocks
    }

    async fn dispatch_syncs(&self, findings: &[Finding], summary: &mut RunSummary) {
        for finding in findings {
            let Finding::SyncNeeded { user, secondary, .. } = finding else {
                continue;
            };
            match self.ctx.queues.enqueue(SyncType::Recurring, user, secondary).await {
                Ok(Enqueued::New(_)) => summary.syncs_enqueued += 1,
                Ok(Enqueued::Duplicate(_)) => summary.syncs_deduplicated += 1,
                Err(e) => summary.errors.push(format!("enqueue sync {} -> {}: {}", user, secondary, e)),
            }
        }
    }

    async fn dispatch_merges(&self, findings: &[Finding], summary: &mut RunSummary) {
        for finding in findings {
            let Finding::PrimaryMergeNeeded { user, secondary } = finding else {
                continue;
            };
            match self.ctx.replication.merge_from_secondary(user, secondary).await {
                Ok(report) => {
                    summary.merges += 1;
                    tracing::info!(user = %user, secondary = %secondary, appended = report.appended, "Merged secondary into primary");
                }
                Err(e) => {
                    summary.merge_failures += 1;
                    tracing::warn!(user = %user, secondary = %secondary, error = %e, "Primary merge failed");
                    summary.errors.push(format!("merge {} from {}: {}", user, secondary, e));
                }
            }
        }
    }

    async fn dispatch_reconfigurations(
        &self,
        users: &[UserAssignment],
        findings: &[Finding],
        health: &HashMap<String, PeerHealth>,
        log: &mut DecisionLog,
        summary: &mut RunSummary,
    ) {
        let mut unhealthy_by_user: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for finding in findings {
            if let Finding::ReplicaUnhealthy { user, secondary } = finding {
                unhealthy_by_user
                    .entry(user.as_str())
                    .or_default()
                    .push(secondary.as_str());
            }
        }
        if unhealthy_by_user.is_empty() {
            return;
        }

        if !self.config.reconfig_enabled {
            log.add("reconfiguration_disabled", json!({ "users": unhealthy_by_user.len() }));
            return;
        }

        let self_health = self.ctx.health.self_health(&self.endpoint);
        let candidates = self.replacement_candidates(health).await;
        log.add(
            "replacement_candidates",
            json!({ "primary_healthy": self_health.healthy, "candidates": candidates }),
        );

        for assignment in users {
            let Some(unhealthy) = unhealthy_by_user.get(assignment.user_key.as_str()) else {
                continue;
            };

            match self.reconfigure(assignment, unhealthy, &self_health, &candidates).await {
                Ok(_) => summary.reconfigurations += 1,
                Err(e @ Error::ReconfigurationDeferred { .. }) => {
                    summary.reconfigurations_deferred += 1;
                    tracing::info!(user = %assignment.user_key, reason = %e, "Reconfiguration deferred");
                }
                Err(e) => {
                    tracing::error!(user = %assignment.user_key, error = %e, "Reconfiguration failed");
                    summary.errors.push(format!("reconfigure {}: {}", assignment.user_key, e));
                }
            }
        }
    }

    /// Healthy configured peers eligible to become a secondary
    async fn replacement_candidates(&self, known: &HashMap<String, PeerHealth>) -> Vec<String> {
        let whitelist = &self.config.reconfig_node_whitelist;
        let eligible: Vec<String> = self
            .peers
            .iter()
            .filter(|p| **p != self.endpoint)
            .filter(|p| whitelist.is_empty() || whitelist.contains(*p))
            .cloned()
            .collect();

        let unprobed: Vec<String> = eligible.iter().filter(|p| !known.contains_key(*p)).cloned().collect();
        let probed = self.ctx.health.evaluate(&unprobed).await;

        eligible
            .into_iter()
            .filter(|p| {
                known
                    .get(p)
                    .or_else(|| probed.get(p))
                    .map_or(false, |h| h.healthy)
            })
            .collect()
    }

    /// Replace a single unhealthy secondary and queue a sync to its replacement
    async fn reconfigure(
        &self,
        assignment: &UserAssignment,
        unhealthy: &[&str],
        self_health: &PeerHealth,
        candidates: &[String],
    ) -> Result<ReplicaSet> {
        let user = &assignment.user_key;
        let current = &assignment.replica_set;
        let deferred = |reason: String| Error::ReconfigurationDeferred {
            user: user.clone(),
            reason,
        };

        if !self_health.healthy {
            return Err(deferred(format!(
                "primary is unhealthy: {}",
                self_health.reason.as_deref().unwrap_or("unknown")
            )));
        }
        let failed = match unhealthy {
            [single] => *single,
            _ => return Err(deferred(format!("{} replicas unhealthy", unhealthy.len()))),
        };

        let pool: Vec<&String> = candidates.iter().filter(|c| !current.contains(c)).collect();
        let replacement = pool
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| deferred("no healthy replacement available".into()))?;

        let updated = current.replace(failed, replacement);
        self.ctx
            .registry
            .set_replica_set(user, &updated.primary, &updated.secondary1, &updated.secondary2)
            .await?;
        tracing::info!(
            user = %user,
            user_id = assignment.user_id,
            old = %current,
            new = %updated,
            "Replica set reconfigured"
        );

        self.ctx.queues.enqueue(SyncType::Manual, user, replacement).await?;
        Ok(updated)
    }
}

/// Up to `limit` users of `slice` in user id order, starting at `offset`
///
/// Also returns the offset for the next visit, wrapping to 0 once the
/// end of the slice is reached.
fn slice_users(
    users: Vec<UserAssignment>,
    modulo_base: u64,
    slice: u64,
    offset: usize,
    limit: usize,
) -> (Vec<UserAssignment>, usize) {
    let mut in_slice: Vec<UserAssignment> = users
        .into_iter()
        .filter(|u| u.user_id % modulo_base == slice)
        .collect();
    in_slice.sort_by_key(|u| u.user_id);

    let total = in_slice.len();
    // The slice may have shrunk since the last visit
    let start = if offset < total { offset } else { 0 };
    let taken: Vec<UserAssignment> = in_slice.into_iter().skip(start).take(limit).collect();

    let end = start + taken.len();
    let next = if end < total { end } else { 0 };
    (taken, next)
}

/// Findings for users this node is primary for
fn evaluate_users(
    users: &[UserAssignment],
    unhealthy: &BTreeSet<String>,
    primary_clocks: &HashMap<String, Clock>,
    secondary_clocks: &HashMap<String, Option<HashMap<String, Clock>>>,
) -> Vec<Finding> {
    let mut findings = Vec::new();

    for assignment in users {
        let user = &assignment.user_key;
        let primary_clock = primary_clocks.get(user).copied().unwrap_or(0);

        for secondary in assignment.replica_set.secondaries() {
            if secondary == assignment.replica_set.primary {
                continue;
            }
            if unhealthy.contains(secondary) {
                findings.push(Finding::ReplicaUnhealthy {
                    user: user.clone(),
                    secondary: secondary.to_string(),
                });
                continue;
            }

            let Some(Some(clocks)) = secondary_clocks.get(secondary) else {
                findings.push(Finding::Unreachable {
                    user: user.clone(),
                    secondary: secondary.to_string(),
                });
                continue;
            };

            let secondary_clock = clocks.get(user).copied().unwrap_or(0);
            if secondary_clock < primary_clock {
                findings.push(Finding::SyncNeeded {
                    user: user.clone(),
                    secondary: secondary.to_string(),
                    secondary_clock,
                });
            } else if secondary_clock > primary_clock {
                findings.push(Finding::PrimaryMergeNeeded {
                    user: user.clone(),
                    secondary: secondary.to_string(),
                });
            }
        }
    }

    findings
}

fn findings_summary(findings: &[Finding]) -> serde_json::Value {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for finding in findings {
        let kind = match finding {
            Finding::SyncNeeded { .. } => "sync_needed",
            Finding::PrimaryMergeNeeded { .. } => "primary_merge_needed",
            Finding::ReplicaUnhealthy { .. } => "replica_unhealthy",
            Finding::Unreachable { .. } => "unreachable",
        };
        *counts.entry(kind).or_default() += 1;
    }
    json!(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    use crate::config::{HealthConfig, SyncConfig};
    use crate::ledger::{NewRecord, SourceTable};
    use crate::registry::LocalRegistry;
    use crate::testing::{FakeNetwork, FakeNode};

    const CN1: &str = "http://cn1";
    const CN2: &str = "http://cn2";
    const CN3: &str = "http://cn3";
    const CN4: &str = "http://cn4";
    const CN5: &str = "http://cn5";
    const USER: &str = "0xabc";

    struct Harness {
        network: Arc<FakeNetwork>,
        nodes: HashMap<&'static str, Arc<FakeNode>>,
        registry: Arc<LocalRegistry>,
        queues: Arc<SyncQueues>,
        machine: StateMachine,
        _dir: tempfile::TempDir,
    }

    async fn harness(config: StateMachineConfig, health: HealthConfig) -> Harness {
        let network = FakeNetwork::new();
        let mut nodes = HashMap::new();
        for endpoint in [CN1, CN2, CN3, CN4, CN5] {
            nodes.insert(endpoint, network.add_node(endpoint, 10).await);
        }
        let primary = nodes[CN1].clone();

        let dir = tempdir().unwrap();
        let registry = Arc::new(LocalRegistry::open(dir.path()).unwrap());
        let history = Arc::new(SyncHistoryAggregator::default());
        let replication = Arc::new(ReplicationEngine::new(
            CN1.into(),
            SyncConfig {
                content_fetch_retry_delay_ms: 0,
                ..Default::default()
            },
            primary.ledger.clone(),
            primary.content.clone(),
            network.clone(),
            registry.clone(),
            history.clone(),
        ));
        let queues = Arc::new(SyncQueues::new(1, 1));

        let machine = StateMachine::new(
            CN1.into(),
            config,
            vec![CN1.into(), CN2.into(), CN3.into(), CN4.into(), CN5.into()],
            MachineContext {
                registry: registry.clone(),
                ledger: primary.ledger.clone(),
                client: network.clone(),
                health: Arc::new(PeerHealthEvaluator::new(health, network.clone(), history.clone())),
                history,
                replication,
                queues: queues.clone(),
            },
        );

        Harness {
            network,
            nodes,
            registry,
            queues,
            machine,
            _dir: dir,
        }
    }

    fn config(modulo_base: u64) -> StateMachineConfig {
        StateMachineConfig {
            modulo_base,
            ..Default::default()
        }
    }

    fn health() -> HealthConfig {
        HealthConfig {
            minimum_memory_available: 0,
            ..Default::default()
        }
    }

    async fn append(node: &FakeNode, user: &str, count: u64) {
        for n in 0..count {
            node.ledger
                .append(
                    user,
                    NewRecord {
                        source_table: SourceTable::Profile,
                        content_hash: None,
                        payload: json!({ "n": n }),
                    },
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_unhealthy_secondary_is_replaced() {
        let h = harness(config(1), health()).await;
        h.registry
            .register(USER, 7, &ReplicaSet::new(CN1, CN2, CN3))
            .await
            .unwrap();
        h.network.set_unreachable(CN3, true).await;

        let summary = h.machine.run_once().await;
        assert!(summary.success);
        assert_eq!(summary.reconfigurations, 1);
        assert_eq!(summary.unhealthy_peers, vec![CN3.to_string()]);

        let set = h.registry.get_replica_set(USER).await.unwrap().unwrap().replica_set;
        assert_eq!(set.primary, CN1);
        assert_eq!(set.secondary1, CN2);
        assert!(set.secondary2 == CN4 || set.secondary2 == CN5);

        // Exactly one Manual sync to the new secondary
        let stats = h.queues.stats();
        assert_eq!(stats.manual_waiting, 1);
        assert_eq!(stats.recurring_waiting, 0);
        let again = h.queues.enqueue(SyncType::Manual, USER, &set.secondary2).await.unwrap();
        assert!(!again.is_new());
    }

    #[tokio::test]
    async fn test_two_unhealthy_replicas_defer() {
        let h = harness(config(1), health()).await;
        h.registry
            .register(USER, 1, &ReplicaSet::new(CN1, CN2, CN3))
            .await
            .unwrap();
        h.network.set_unreachable(CN2, true).await;
        h.network.set_unreachable(CN3, true).await;

        let summary = h.machine.run_once().await;
        assert_eq!(summary.reconfigurations, 0);
        assert_eq!(summary.reconfigurations_deferred, 1);

        let set = h.registry.get_replica_set(USER).await.unwrap().unwrap().replica_set;
        assert_eq!(set, ReplicaSet::new(CN1, CN2, CN3));
        assert_eq!(h.queues.stats().manual_waiting, 0);
    }

    #[tokio::test]
    async fn test_unhealthy_primary_defers() {
        let h = harness(
            config(1),
            HealthConfig {
                consider_node_unhealthy: true,
                ..health()
            },
        )
        .await;
        h.registry
            .register(USER, 1, &ReplicaSet::new(CN1, CN2, CN3))
            .await
            .unwrap();
        h.network.set_unreachable(CN3, true).await;

        let summary = h.machine.run_once().await;
        assert_eq!(summary.reconfigurations_deferred, 1);
        assert_eq!(h.queues.stats().manual_waiting, 0);
    }

    #[tokio::test]
    async fn test_reconfiguration_can_be_disabled() {
        let h = harness(
            StateMachineConfig {
                reconfig_enabled: false,
                ..config(1)
            },
            health(),
        )
        .await;
        h.registry
            .register(USER, 1, &ReplicaSet::new(CN1, CN2, CN3))
            .await
            .unwrap();
        h.network.set_unreachable(CN3, true).await;

        let summary = h.machine.run_once().await;
        assert!(summary.success);
        assert_eq!(summary.reconfigurations, 0);
        assert_eq!(summary.reconfigurations_deferred, 0);
    }

    #[tokio::test]
    async fn test_stale_secondary_gets_recurring_sync_and_ahead_secondary_is_merged() {
        let h = harness(config(1), health()).await;
        h.registry
            .register("0xstale", 1, &ReplicaSet::new(CN1, CN2, CN3))
            .await
            .unwrap();
        h.registry
            .register("0xahead", 2, &ReplicaSet::new(CN1, CN2, CN3))
            .await
            .unwrap();

        // 0xstale: cn3 is current, cn2 has nothing
        append(&h.nodes[CN1], "0xstale", 5).await;
        let export = h.nodes[CN1].ledger.export_range("0xstale", 0).await.unwrap().unwrap();
        h.nodes[CN3]
            .ledger
            .import_page("0xstale", export.created_at, &export.records)
            .await
            .unwrap();

        // 0xahead: cn2 holds writes the primary never saw
        append(&h.nodes[CN2], "0xahead", 3).await;

        let summary = h.machine.run_once().await;
        assert!(summary.success);
        assert_eq!(summary.syncs_enqueued, 1);
        assert_eq!(summary.merges, 1);
        assert!(summary.findings.contains(&Finding::SyncNeeded {
            user: "0xstale".into(),
            secondary: CN2.into(),
            secondary_clock: 0,
        }));
        assert_eq!(h.queues.stats().recurring_waiting, 1);
        assert_eq!(h.nodes[CN1].ledger.clock("0xahead").await.unwrap(), 3);

        // Second pass deduplicates the still-queued job; cn3 now trails the merged history
        let summary = h.machine.run_once().await;
        assert_eq!(summary.syncs_deduplicated, 1);
        assert_eq!(summary.syncs_enqueued, 1);
        assert!(summary.findings.contains(&Finding::SyncNeeded {
            user: "0xahead".into(),
            secondary: CN3.into(),
            secondary_clock: 0,
        }));
    }

    #[tokio::test]
    async fn test_slices_advance_and_cap_users() {
        let h = harness(
            StateMachineConfig {
                users_per_job: 1,
                ..config(4)
            },
            health(),
        )
        .await;
        for id in 0..8u64 {
            h.registry
                .register(&format!("0xuser{}", id), id, &ReplicaSet::new(CN1, CN2, CN3))
                .await
                .unwrap();
        }

        let slice = h.machine.current_slice().await;
        let summary = h.machine.run_once().await;
        assert_eq!(summary.slice, slice);
        assert_eq!(summary.users_in_slice, 1);
        assert_eq!(h.machine.current_slice().await, (slice + 1) % 4);
        assert_eq!(h.machine.state().await, MachineState::Idle);
        assert!(h.machine.last_run().await.is_some());
    }

    #[tokio::test]
    async fn test_oversized_slice_is_covered_across_runs() {
        let h = harness(
            StateMachineConfig {
                users_per_job: 1,
                ..config(1)
            },
            health(),
        )
        .await;
        for id in 0..3u64 {
            let user = format!("0xuser{}", id);
            h.registry
                .register(&user, id, &ReplicaSet::new(CN1, CN2, CN3))
                .await
                .unwrap();
            // Each user trails on cn2, so its evaluation shows up as a finding
            append(&h.nodes[CN1], &user, 1).await;
            let export = h.nodes[CN1].ledger.export_range(&user, 0).await.unwrap().unwrap();
            h.nodes[CN3]
                .ledger
                .import_page(&user, export.created_at, &export.records)
                .await
                .unwrap();
        }

        let mut evaluated = BTreeSet::new();
        let mut offsets = Vec::new();
        for _ in 0..4 {
            let summary = h.machine.run_once().await;
            assert!(summary.success);
            assert_eq!(summary.users_in_slice, 1);
            offsets.push(summary.slice_offset);
            for finding in summary.findings {
                if let Finding::SyncNeeded { user, .. } = finding {
                    evaluated.insert(user);
                }
            }
        }

        assert_eq!(offsets, vec![0, 1, 2, 0]);
        let expected: BTreeSet<String> = (0..3).map(|id| format!("0xuser{}", id)).collect();
        assert_eq!(evaluated, expected);
    }

    #[tokio::test]
    async fn test_secondary_only_users_are_skipped() {
        let h = harness(config(1), health()).await;
        h.registry
            .register(USER, 1, &ReplicaSet::new(CN2, CN1, CN3))
            .await
            .unwrap();
        h.network.set_unreachable(CN3, true).await;

        let summary = h.machine.run_once().await;
        assert_eq!(summary.users_in_slice, 1);
        assert_eq!(summary.users_as_primary, 0);
        assert_eq!(summary.users_skipped, 1);
        assert!(summary.findings.is_empty());
    }

    #[test]
    fn test_slice_users_filters_by_modulo() {
        let users: Vec<UserAssignment> = (0..10u64)
            .map(|id| UserAssignment {
                user_key: format!("u{}", id),
                user_id: id,
                replica_set: ReplicaSet::new(CN1, CN2, CN3),
            })
            .collect();

        let (sliced, next) = slice_users(users, 3, 1, 0, 100);
        let ids: Vec<u64> = sliced.iter().map(|u| u.user_id).collect();
        assert_eq!(ids, vec![1, 4, 7]);
        assert_eq!(next, 0);
    }

    #[test]
    fn test_slice_users_resumes_from_offset() {
        let users: Vec<UserAssignment> = [2u64, 0, 1]
            .into_iter()
            .map(|id| UserAssignment {
                user_key: format!("u{}", id),
                user_id: id,
                replica_set: ReplicaSet::new(CN1, CN2, CN3),
            })
            .collect();

        let mut offset = 0;
        let mut visits = Vec::new();
        for _ in 0..3 {
            let (sliced, next) = slice_users(users.clone(), 1, 0, offset, 2);
            visits.push(sliced.iter().map(|u| u.user_id).collect::<Vec<_>>());
            offset = next;
        }
        assert_eq!(visits, vec![vec![0, 1], vec![2], vec![0, 1]]);

        // A stale offset past the end starts over
        let (sliced, next) = slice_users(users, 1, 0, 7, 2);
        assert_eq!(sliced.len(), 2);
        assert_eq!(next, 2);
    }
}
