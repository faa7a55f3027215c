//! Peer Health Evaluation
//!
//! Classifies peers as healthy or unhealthy from health-check probes and
//! sync success history. Peers without enough history get the benefit
//! of the doubt; a failed probe is tolerated while the last successful
//! one is recent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;

use super::history::{SyncCounts, SyncHistoryAggregator, SyncHistorySnapshot, SyncOutcome};
use crate::config::HealthConfig;
use crate::error::Error;
use crate::network::PeerClient;
use crate::replication::protocol::HealthCheckResponse;

/// Verdict for one endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerHealth {
    pub endpoint: String,
    pub healthy: bool,
    /// Why the peer is unhealthy, or why a failed probe was tolerated
    pub reason: Option<String>,
    pub latency_ms: Option<u64>,
}

impl PeerHealth {
    fn healthy(endpoint: &str, latency: Option<Duration>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            healthy: true,
            reason: None,
            latency_ms: latency.map(|l| l.as_millis() as u64),
        }
    }

    fn unhealthy(endpoint: &str, reason: String, latency: Option<Duration>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            healthy: false,
            reason: Some(reason),
            latency_ms: latency.map(|l| l.as_millis() as u64),
        }
    }
}

/// Available and total system memory in bytes
pub fn memory_snapshot() -> (u64, u64) {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    (system.available_memory(), system.total_memory())
}

/// Health classifier for peer endpoints
pub struct PeerHealthEvaluator {
    config: HealthConfig,
    client: Arc<dyn PeerClient>,
    history: Arc<SyncHistoryAggregator>,
    /// Last probe that passed, per endpoint
    last_success: RwLock<HashMap<String, Instant>>,
}

impl PeerHealthEvaluator {
    pub fn new(config: HealthConfig, client: Arc<dyn PeerClient>, history: Arc<SyncHistoryAggregator>) -> Self {
        Self {
            config,
            client,
            history,
            last_success: RwLock::new(HashMap::new()),
        }
    }

    /// Probe endpoints concurrently and classify each one
    pub async fn evaluate(&self, endpoints: &[String]) -> HashMap<String, PeerHealth> {
        let probes = endpoints.iter().map(|endpoint| async move {
            let started = Instant::now();
            let result = self.client.health_check(endpoint).await;
            (endpoint.clone(), result, started.elapsed())
        });
        let results = futures::future::join_all(probes).await;

        let mut verdicts = HashMap::with_capacity(results.len());
        for (endpoint, result, latency) in results {
            match &result {
                Ok(response) if self.capacity_verdict(response).is_ok() => {
                    self.last_success.write().await.insert(endpoint.clone(), Instant::now());
                }
                Err(Error::PeerUnreachable { .. }) => {
                    self.history.record(&endpoint, SyncOutcome::Failure).await;
                }
                _ => {}
            }

            let last_success = self.last_success.read().await.get(&endpoint).copied();
            let local = self.history.snapshot(&endpoint).await;
            let verdict = self.classify(&endpoint, result.as_ref(), latency, last_success, &local);

            if !verdict.healthy {
                tracing::warn!(
                    endpoint = %endpoint,
                    reason = verdict.reason.as_deref().unwrap_or_default(),
                    "Peer classified unhealthy"
                );
            }
            verdicts.insert(endpoint, verdict);
        }
        verdicts
    }

    /// Classify one endpoint from its probe result and history
    pub fn classify(
        &self,
        endpoint: &str,
        probe: std::result::Result<&HealthCheckResponse, &Error>,
        latency: Duration,
        last_success: Option<Instant>,
        local: &SyncHistorySnapshot,
    ) -> PeerHealth {
        let latency = Some(latency);
        let mut tolerated = None;

        let probe_verdict = match probe {
            Ok(response) => self.capacity_verdict(response),
            Err(e) => Err(format!("health check failed: {}", e)),
        };

        if let Err(reason) = probe_verdict {
            let in_grace = probe.is_err()
                && last_success.map_or(false, |t| t.elapsed() < self.config.max_health_check_age());
            if !in_grace {
                return PeerHealth::unhealthy(endpoint, reason, latency);
            }
            tolerated = Some(format!("{} (within grace period)", reason));
        }

        if let Ok(response) = probe {
            let daily = SyncCounts {
                triggered: response.daily_sync_success_count + response.daily_sync_fail_count,
                success: response.daily_sync_success_count,
                fail: response.daily_sync_fail_count,
            };
            let rolling = SyncCounts {
                triggered: response.rolling_sync_success_count + response.rolling_sync_fail_count,
                success: response.rolling_sync_success_count,
                fail: response.rolling_sync_fail_count,
            };
            if let Err(reason) = self.history_verdict("reported", &daily, &rolling) {
                return PeerHealth::unhealthy(endpoint, reason, latency);
            }
        }

        if let Err(reason) = self.history_verdict("observed", &local.daily, &local.rolling) {
            return PeerHealth::unhealthy(endpoint, reason, latency);
        }

        let mut health = PeerHealth::healthy(endpoint, latency);
        health.reason = tolerated;
        health
    }

    /// Health of this node as reported to peers and used for the "primary is healthy" check
    pub fn self_health(&self, endpoint: &str) -> PeerHealth {
        if self.config.consider_node_unhealthy {
            return PeerHealth::unhealthy(endpoint, "marked unhealthy by configuration".into(), None);
        }

        if self.config.minimum_memory_available > 0 {
            let (available, _) = memory_snapshot();
            if available < self.config.minimum_memory_available {
                return PeerHealth::unhealthy(
                    endpoint,
                    format!(
                        "available memory {} below minimum {}",
                        available, self.config.minimum_memory_available
                    ),
                    None,
                );
            }
        }

        PeerHealth::healthy(endpoint, None)
    }

    fn capacity_verdict(&self, response: &HealthCheckResponse) -> std::result::Result<(), String> {
        if !response.healthy {
            return Err("peer reports itself unhealthy".into());
        }

        if let Some(available) = response.available_memory {
            if self.config.minimum_memory_available > 0 && available < self.config.minimum_memory_available {
                return Err(format!(
                    "available memory {} below minimum {}",
                    available, self.config.minimum_memory_available
                ));
            }
        }

        Ok(())
    }

    fn history_verdict(&self, source: &str, daily: &SyncCounts, rolling: &SyncCounts) -> std::result::Result<(), String> {
        let windows = [
            ("daily", daily, self.config.minimum_daily_sync_count),
            ("rolling", rolling, self.config.minimum_rolling_sync_count),
        ];

        for (window, counts, minimum) in windows {
            if counts.total() < minimum.max(1) {
                continue;
            }
            if let Some(percentage) = counts.success_percentage() {
                if percentage < self.config.minimum_success_percentage {
                    return Err(format!(
                        "{} {} sync success rate {:.1}% below {}% over {} samples",
                        source,
                        window,
                        percentage,
                        self.config.minimum_success_percentage,
                        counts.total()
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeNetwork;

    fn config() -> HealthConfig {
        HealthConfig {
            minimum_memory_available: 1_000,
            minimum_daily_sync_count: 10,
            minimum_rolling_sync_count: 100,
            minimum_success_percentage: 50.0,
            max_health_check_age_secs: 60,
            ..Default::default()
        }
    }

    fn evaluator(config: HealthConfig) -> PeerHealthEvaluator {
        PeerHealthEvaluator::new(config, FakeNetwork::new(), Arc::new(SyncHistoryAggregator::default()))
    }

    fn ok_response() -> HealthCheckResponse {
        HealthCheckResponse {
            healthy: true,
            available_memory: Some(10_000),
            ..Default::default()
        }
    }

    #[test]
    fn test_healthy_probe_without_history() {
        let evaluator = evaluator(config());
        let response = ok_response();
        let verdict = evaluator.classify(
            "http://cn2",
            Ok(&response),
            Duration::from_millis(12),
            None,
            &SyncHistorySnapshot::default(),
        );
        assert!(verdict.healthy);
        assert_eq!(verdict.latency_ms, Some(12));
    }

    #[test]
    fn test_low_memory_is_unhealthy() {
        let evaluator = evaluator(config());
        let mut response = ok_response();
        response.available_memory = Some(10);
        let verdict = evaluator.classify("http://cn2", Ok(&response), Duration::ZERO, None, &Default::default());
        assert!(!verdict.healthy);
        assert!(verdict.reason.unwrap().contains("memory"));
    }

    #[test]
    fn test_failed_probe_grace_period() {
        let evaluator = evaluator(config());
        let err = Error::PeerUnreachable {
            endpoint: "http://cn2".into(),
            reason: "connection refused".into(),
        };

        let never_seen = evaluator.classify("http://cn2", Err(&err), Duration::ZERO, None, &Default::default());
        assert!(!never_seen.healthy);

        let recent = evaluator.classify(
            "http://cn2",
            Err(&err),
            Duration::ZERO,
            Some(Instant::now()),
            &Default::default(),
        );
        assert!(recent.healthy);
        assert!(recent.reason.unwrap().contains("grace period"));
    }

    #[test]
    fn test_history_needs_enough_samples() {
        let evaluator = evaluator(config());
        let response = ok_response();

        // 1 success out of 5: too few samples to judge
        let sparse = SyncHistorySnapshot {
            daily: SyncCounts { triggered: 5, success: 1, fail: 4 },
            rolling: SyncCounts { triggered: 5, success: 1, fail: 4 },
            ..Default::default()
        };
        assert!(evaluator.classify("http://cn2", Ok(&response), Duration::ZERO, None, &sparse).healthy);

        // 2 successes out of 20 today: judged and failing
        let failing = SyncHistorySnapshot {
            daily: SyncCounts { triggered: 20, success: 2, fail: 18 },
            rolling: SyncCounts { triggered: 20, success: 2, fail: 18 },
            ..Default::default()
        };
        let verdict = evaluator.classify("http://cn2", Ok(&response), Duration::ZERO, None, &failing);
        assert!(!verdict.healthy);
        assert!(verdict.reason.unwrap().contains("observed daily"));
    }

    #[test]
    fn test_reported_history() {
        let evaluator = evaluator(config());
        let mut response = ok_response();
        response.rolling_sync_success_count = 10;
        response.rolling_sync_fail_count = 190;
        let verdict = evaluator.classify("http://cn2", Ok(&response), Duration::ZERO, None, &Default::default());
        assert!(!verdict.healthy);
        assert!(verdict.reason.unwrap().contains("reported rolling"));
    }

    #[test]
    fn test_self_health_switch() {
        let mut cfg = config();
        cfg.minimum_memory_available = 0;
        assert!(evaluator(cfg.clone()).self_health("http://cn1").healthy);

        cfg.consider_node_unhealthy = true;
        assert!(!evaluator(cfg).self_health("http://cn1").healthy);
    }

    #[tokio::test]
    async fn test_evaluate_records_unreachable_peers() {
        let network = FakeNetwork::new();
        network.add_node("http://cn2", 10).await;
        network.add_node("http://cn3", 10).await;
        network.set_unreachable("http://cn3", true).await;

        let history = Arc::new(SyncHistoryAggregator::default());
        let mut cfg = config();
        cfg.minimum_memory_available = 0;
        let evaluator = PeerHealthEvaluator::new(cfg, network.clone(), history.clone());

        let verdicts = evaluator
            .evaluate(&["http://cn2".to_string(), "http://cn3".to_string()])
            .await;
        assert!(verdicts["http://cn2"].healthy);
        assert!(!verdicts["http://cn3"].healthy);
        assert_eq!(history.snapshot("http://cn3").await.daily.fail, 1);
    }

    #[tokio::test]
    async fn test_evaluate_peer_reporting_unhealthy() {
        let network = FakeNetwork::new();
        network.add_node("http://cn2", 10).await;
        network
            .set_health(
                "http://cn2",
                HealthCheckResponse {
                    healthy: false,
                    endpoint: "http://cn2".into(),
                    ..Default::default()
                },
            )
            .await;

        let history = Arc::new(SyncHistoryAggregator::default());
        let mut cfg = config();
        cfg.minimum_memory_available = 0;
        let evaluator = PeerHealthEvaluator::new(cfg, network.clone(), history.clone());

        let verdicts = evaluator.evaluate(&["http://cn2".to_string()]).await;
        let verdict = &verdicts["http://cn2"];
        assert!(!verdict.healthy);
        assert!(verdict.reason.as_deref().unwrap().contains("reports itself unhealthy"));
        // Reachable, so no transport failure is recorded
        assert_eq!(history.snapshot("http://cn2").await.daily.fail, 0);
    }
}
