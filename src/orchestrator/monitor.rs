//! Sync completion monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::ledger::Clock;
use crate::network::PeerClient;

/// How a monitored sync ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Secondary reached the target clock
    Satisfied { secondary_clock: Clock },
    /// Secondary trails by more than one export page; another sync is needed
    NeedsAnotherRound { secondary_clock: Clock },
    /// Deadline passed without either of the above
    DeadlineReached { secondary_clock: Option<Clock> },
}

/// Polls a secondary's clock after a sync request
pub struct SyncMonitor {
    client: Arc<dyn PeerClient>,
    poll_interval: Duration,
    page_size: u64,
}

impl SyncMonitor {
    pub fn new(client: Arc<dyn PeerClient>, poll_interval: Duration, page_size: u64) -> Self {
        Self {
            client,
            poll_interval,
            page_size,
        }
    }

    /// Poll until the secondary reaches `target_clock` or `max_duration` passes
    pub async fn watch(&self, secondary: &str, user_key: &str, target_clock: Clock, max_duration: Duration) -> MonitorOutcome {
        let started = Instant::now();
        let deadline = started + max_duration;
        let mut last_seen = None;

        while Instant::now() < deadline {
            match self.client.clock_status(secondary, user_key).await {
                Ok(clock) => {
                    tracing::debug!(user = user_key, secondary, clock, target = target_clock, "Polled secondary clock");
                    last_seen = Some(clock);

                    // One sync moves at most one export page
                    if clock.saturating_add(self.page_size) < target_clock {
                        return MonitorOutcome::NeedsAnotherRound { secondary_clock: clock };
                    }
                    if clock >= target_clock {
                        tracing::info!(
                            user = user_key,
                            secondary,
                            clock,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Sync completed"
                        );
                        return MonitorOutcome::Satisfied { secondary_clock: clock };
                    }
                }
                Err(e) => {
                    tracing::debug!(user = user_key, secondary, error = %e, "Clock status poll failed");
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }

        tracing::info!(
            user = user_key,
            secondary,
            target = target_clock,
            last_seen = ?last_seen,
            "Sync monitoring deadline reached"
        );
        MonitorOutcome::DeadlineReached { secondary_clock: last_seen }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeNetwork;

    const SECONDARY: &str = "http://cn2";

    async fn monitor(clocks: Vec<Clock>) -> SyncMonitor {
        let network = FakeNetwork::new();
        network.add_node(SECONDARY, 10).await;
        network.script_clocks(SECONDARY, clocks).await;
        SyncMonitor::new(network, Duration::from_millis(1), 10)
    }

    #[tokio::test]
    async fn test_satisfied_once_caught_up() {
        let monitor = monitor(vec![25, 28, 31]).await;
        let outcome = monitor.watch(SECONDARY, "0xabc", 30, Duration::from_secs(5)).await;
        assert_eq!(outcome, MonitorOutcome::Satisfied { secondary_clock: 31 });
    }

    #[tokio::test]
    async fn test_far_behind_needs_another_round() {
        let monitor = monitor(vec![5]).await;
        let outcome = monitor.watch(SECONDARY, "0xabc", 30, Duration::from_secs(5)).await;
        assert_eq!(outcome, MonitorOutcome::NeedsAnotherRound { secondary_clock: 5 });
    }

    #[tokio::test]
    async fn test_deadline_reached_when_stalled() {
        let monitor = monitor(vec![25]).await;
        let outcome = monitor.watch(SECONDARY, "0xabc", 30, Duration::from_millis(20)).await;
        assert_eq!(outcome, MonitorOutcome::DeadlineReached { secondary_clock: Some(25) });
    }
}
