//! Replica Node
//!
//! Wires storage, the registry, the peer client and the background
//! services of one node together. The HTTP API and the daemon both work
//! against a [`Node`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::config::ReplicaConfig;
use crate::content::{ContentStore, FsContentStore};
use crate::error::{Error, Result};
use crate::ledger::{Clock, ClockLedger, NewRecord};
use crate::network::{HttpPeerClient, PeerClient};
use crate::orchestrator::{MachineContext, StateMachine, SyncJobWorker, SyncMonitor, SyncQueues};
use crate::registry::{LocalRegistry, ReplicaSetRegistry};
use crate::replication::{ReplicationEngine, SyncType};
use crate::state::{PeerHealthEvaluator, SyncHistoryAggregator};

const FAILURE_RESET_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// One replica node and its services
pub struct Node {
    config: ReplicaConfig,
    pub ledger: Arc<ClockLedger>,
    pub content: Arc<dyn ContentStore>,
    pub registry: Arc<dyn ReplicaSetRegistry>,
    pub client: Arc<dyn PeerClient>,
    pub history: Arc<SyncHistoryAggregator>,
    pub health: Arc<PeerHealthEvaluator>,
    pub replication: Arc<ReplicationEngine>,
    pub queues: Arc<SyncQueues>,
    pub machine: Arc<StateMachine>,
    started_at: Instant,
}

impl Node {
    /// Open on-disk state under `node.data_dir` and talk to peers over HTTP
    pub fn open(config: ReplicaConfig) -> Result<Self> {
        config.validate()?;

        let ledger = Arc::new(ClockLedger::open(
            config.data_dir(),
            config.sync.max_export_clock_value_range,
        )?);
        let content = Arc::new(FsContentStore::new(config.content_dir())?);
        let registry = Arc::new(LocalRegistry::open(config.data_dir())?);
        let client = Arc::new(HttpPeerClient::new(
            config.sync.request_timeout(),
            config.health.request_timeout(),
            config.sync.max_batch_clock_status_size,
        )?);

        tracing::info!(
            endpoint = config.endpoint(),
            data_dir = %config.data_dir().display(),
            "Opened replica node state"
        );
        Ok(Self::assemble(config, ledger, content, registry, client))
    }

    /// Build a node from already opened parts
    pub fn assemble(
        config: ReplicaConfig,
        ledger: Arc<ClockLedger>,
        content: Arc<dyn ContentStore>,
        registry: Arc<dyn ReplicaSetRegistry>,
        client: Arc<dyn PeerClient>,
    ) -> Self {
        let endpoint = config.endpoint().to_string();
        let history = Arc::new(SyncHistoryAggregator::default());
        let health = Arc::new(PeerHealthEvaluator::new(
            config.health.clone(),
            client.clone(),
            history.clone(),
        ));
        let replication = Arc::new(ReplicationEngine::new(
            endpoint.clone(),
            config.sync.clone(),
            ledger.clone(),
            content.clone(),
            client.clone(),
            registry.clone(),
            history.clone(),
        ));
        let queues = Arc::new(SyncQueues::new(
            config.state_machine.max_manual_sync_concurrency,
            config.state_machine.max_recurring_sync_concurrency,
        ));
        let machine = Arc::new(StateMachine::new(
            endpoint,
            config.state_machine.clone(),
            config.cluster.peers.clone(),
            MachineContext {
                registry: registry.clone(),
                ledger: ledger.clone(),
                client: client.clone(),
                health: health.clone(),
                history: history.clone(),
                replication: replication.clone(),
                queues: queues.clone(),
            },
        ));

        Self {
            config,
            ledger,
            content,
            registry,
            client,
            history,
            health,
            replication,
            queues,
            machine,
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &str {
        self.config.endpoint()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Start the sync workers, the state machine and housekeeping tasks
    pub fn start_background(&self) -> Result<Vec<JoinHandle<()>>> {
        let sm = &self.config.state_machine;
        let worker = Arc::new(SyncJobWorker::new(
            self.endpoint().to_string(),
            self.ledger.clone(),
            self.client.clone(),
            self.history.clone(),
            self.queues.clone(),
            SyncMonitor::new(
                self.client.clone(),
                sm.monitoring_poll_interval(),
                self.config.sync.max_export_clock_value_range,
            ),
            Duration::from_millis(sm.max_manual_sync_monitoring_duration_ms),
            Duration::from_millis(sm.max_sync_monitoring_duration_ms),
        ));
        let mut handles = self.queues.start(worker)?;

        if sm.enabled {
            let machine = self.machine.clone();
            handles.push(tokio::spawn(async move { machine.start().await }));
        } else {
            tracing::info!("State machine disabled");
        }

        let replication = self.replication.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FAILURE_RESET_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                replication.failures().reset_all().await;
                tracing::info!("Reset per-user sync failure counts");
            }
        }));

        Ok(handles)
    }

    pub async fn shutdown(&self) {
        self.machine.shutdown().await;
    }

    /// Append a record for a user and notify secondaries if this node is the primary
    pub async fn write_record(&self, user_key: &str, record: NewRecord) -> Result<Clock> {
        if let Some(hash) = &record.content_hash {
            if !self.content.has(hash).await? {
                return Err(Error::ContentNotFound(hash.clone()));
            }
        }

        let clock = self.ledger.append(user_key, record).await?;

        if let Some(assignment) = self.registry.get_replica_set(user_key).await? {
            if assignment.replica_set.is_primary(self.endpoint()) {
                for secondary in assignment.replica_set.secondaries() {
                    if let Err(e) = self.queues.enqueue(SyncType::Manual, user_key, secondary).await {
                        tracing::warn!(user = user_key, secondary, error = %e, "Failed to enqueue manual sync");
                    }
                }
            }
        }

        Ok(clock)
    }
}
