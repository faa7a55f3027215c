//! Sync Job Worker
//!
//! Processes one queued job: asks the secondary to pull from this node,
//! watches its clock, and re-enqueues when one round was not enough.

use std::sync::Arc;
use std::time::Duration;

use super::monitor::{MonitorOutcome, SyncMonitor};
use super::queue::{SyncJobProcessor, SyncQueues};
use crate::error::{Error, Result};
use crate::ledger::ClockLedger;
use crate::network::PeerClient;
use crate::replication::{SyncRequest, SyncType};
use crate::state::{JobHandle, SyncHistoryAggregator, SyncOutcome};

pub struct SyncJobWorker {
    /// This node's endpoint, sent as the primary to pull from
    endpoint: String,
    ledger: Arc<ClockLedger>,
    client: Arc<dyn PeerClient>,
    history: Arc<SyncHistoryAggregator>,
    queues: Arc<SyncQueues>,
    monitor: SyncMonitor,
    manual_deadline: Duration,
    recurring_deadline: Duration,
}

impl SyncJobWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: String,
        ledger: Arc<ClockLedger>,
        client: Arc<dyn PeerClient>,
        history: Arc<SyncHistoryAggregator>,
        queues: Arc<SyncQueues>,
        monitor: SyncMonitor,
        manual_deadline: Duration,
        recurring_deadline: Duration,
    ) -> Self {
        Self {
            endpoint,
            ledger,
            client,
            history,
            queues,
            monitor,
            manual_deadline,
            recurring_deadline,
        }
    }

    fn deadline(&self, sync_type: SyncType) -> Duration {
        match sync_type {
            SyncType::Manual => self.manual_deadline,
            SyncType::Recurring => self.recurring_deadline,
        }
    }
}

#[async_trait::async_trait]
impl SyncJobProcessor for SyncJobWorker {
    async fn process(&self, job: JobHandle) -> Result<()> {
        let primary_clock = self.ledger.clock(&job.user_key).await?;
        tracing::info!(
            job = %job.id,
            user = %job.user_key,
            secondary = %job.secondary,
            sync_type = %job.sync_type,
            primary_clock,
            "Processing sync"
        );

        let request = SyncRequest {
            wallet: vec![job.user_key.clone()],
            creator_node_endpoint: self.endpoint.clone(),
            sync_type: job.sync_type,
            immediate: false,
            force_resync: false,
        };

        if let Err(e) = self.client.request_sync(&job.secondary, &request).await {
            if matches!(e, Error::PeerUnreachable { .. }) {
                self.history.record(&job.secondary, SyncOutcome::Failure).await;
            }
            return Err(e);
        }

        let outcome = self
            .monitor
            .watch(&job.secondary, &job.user_key, primary_clock, self.deadline(job.sync_type))
            .await;

        match outcome {
            MonitorOutcome::Satisfied { .. } => {
                self.history.record(&job.secondary, SyncOutcome::Success).await;
            }
            MonitorOutcome::NeedsAnotherRound { secondary_clock } => {
                tracing::info!(
                    user = %job.user_key,
                    secondary = %job.secondary,
                    secondary_clock,
                    primary_clock,
                    "Secondary needs another sync round, re-enqueuing"
                );
                self.queues.enqueue(job.sync_type, &job.user_key, &job.secondary).await?;
            }
            // Left for the next state machine pass
            MonitorOutcome::DeadlineReached { secondary_clock: None } => {
                self.history.record(&job.secondary, SyncOutcome::Failure).await;
            }
            MonitorOutcome::DeadlineReached { .. } => {}
        }

        Ok(())
    }
}
