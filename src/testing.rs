//! In-process fake peer network for tests.
//!
//! Each fake node is backed by a real ledger and content store in a
//! temporary directory, so protocol tests exercise real storage.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::Mutex;

use crate::config::ReplicaConfig;
use crate::content::{ContentStore, FsContentStore};
use crate::error::{Error, Result};
use crate::ledger::{Clock, ClockLedger, UserExport};
use crate::network::PeerClient;
use crate::replication::protocol::{HealthCheckResponse, SyncRequest, UserClockStatus};

pub(crate) struct FakeNode {
    pub ledger: Arc<ClockLedger>,
    pub content: Arc<FsContentStore>,
}

#[derive(Default)]
pub(crate) struct FakeNetwork {
    nodes: Mutex<HashMap<String, Arc<FakeNode>>>,
    unreachable: Mutex<HashSet<String>>,
    denied_content: Mutex<HashSet<String>>,
    scripted_clocks: Mutex<HashMap<String, VecDeque<Clock>>>,
    health: Mutex<HashMap<String, HealthCheckResponse>>,
    sync_requests: Mutex<Vec<(String, SyncRequest)>>,
    dirs: Mutex<Vec<TempDir>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node with its own ledger and content store
    pub async fn add_node(&self, endpoint: &str, max_export_range: u64) -> Arc<FakeNode> {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(FakeNode {
            ledger: Arc::new(ClockLedger::open(dir.path(), max_export_range).unwrap()),
            content: Arc::new(FsContentStore::new(dir.path().join("content")).unwrap()),
        });
        self.dirs.lock().await.push(dir);
        self.nodes.lock().await.insert(endpoint.to_string(), node.clone());
        node
    }

    pub async fn set_unreachable(&self, endpoint: &str, unreachable: bool) {
        let mut set = self.unreachable.lock().await;
        if unreachable {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    /// Make every node refuse to serve a content hash
    pub async fn deny_content(&self, hash: &str) {
        self.denied_content.lock().await.insert(hash.to_string());
    }

    pub async fn allow_content(&self, hash: &str) {
        self.denied_content.lock().await.remove(hash);
    }

    /// Clock values returned by successive `clock_status` calls; the last one repeats
    pub async fn script_clocks(&self, endpoint: &str, clocks: Vec<Clock>) {
        self.scripted_clocks
            .lock()
            .await
            .insert(endpoint.to_string(), clocks.into_iter().collect());
    }

    pub async fn set_health(&self, endpoint: &str, response: HealthCheckResponse) {
        self.health.lock().await.insert(endpoint.to_string(), response);
    }

    pub async fn sync_requests(&self) -> Vec<(String, SyncRequest)> {
        self.sync_requests.lock().await.clone()
    }

    async fn node(&self, endpoint: &str) -> Result<Arc<FakeNode>> {
        if self.unreachable.lock().await.contains(endpoint) {
            return Err(Error::PeerUnreachable {
                endpoint: endpoint.to_string(),
                reason: "connection refused".into(),
            });
        }
        self.nodes
            .lock()
            .await
            .get(endpoint)
            .cloned()
            .ok_or_else(|| Error::PeerUnreachable {
                endpoint: endpoint.to_string(),
                reason: "unknown host".into(),
            })
    }
}

#[async_trait::async_trait]
impl PeerClient for FakeNetwork {
    async fn export(&self, endpoint: &str, user_key: &str, clock_range_min: Clock) -> Result<Option<UserExport>> {
        self.node(endpoint).await?.ledger.export_range(user_key, clock_range_min).await
    }

    async fn fetch_content(&self, endpoint: &str, hash: &str) -> Result<Vec<u8>> {
        let node = self.node(endpoint).await?;
        if self.denied_content.lock().await.contains(hash) {
            return Err(Error::ContentNotFound(hash.to_string()));
        }
        node.content
            .get(hash)
            .await?
            .ok_or_else(|| Error::ContentNotFound(hash.to_string()))
    }

    async fn request_sync(&self, endpoint: &str, request: &SyncRequest) -> Result<()> {
        self.node(endpoint).await?;
        self.sync_requests
            .lock()
            .await
            .push((endpoint.to_string(), request.clone()));
        Ok(())
    }

    async fn batch_clock_status(&self, endpoint: &str, user_keys: &[String]) -> Result<Vec<UserClockStatus>> {
        let clocks = self.node(endpoint).await?.ledger.clocks(user_keys).await?;
        Ok(user_keys
            .iter()
            .map(|key| UserClockStatus {
                wallet_public_key: key.clone(),
                clock: clocks.get(key).copied().unwrap_or(0),
            })
            .collect())
    }

    async fn clock_status(&self, endpoint: &str, user_key: &str) -> Result<Clock> {
        let node = self.node(endpoint).await?;
        let mut scripted = self.scripted_clocks.lock().await;
        if let Some(clocks) = scripted.get_mut(endpoint) {
            if clocks.len() > 1 {
                return Ok(clocks.pop_front().unwrap_or(0));
            }
            if let Some(last) = clocks.front() {
                return Ok(*last);
            }
        }
        node.ledger.clock(user_key).await
    }

    async fn health_check(&self, endpoint: &str) -> Result<HealthCheckResponse> {
        self.node(endpoint).await?;
        Ok(self
            .health
            .lock()
            .await
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| HealthCheckResponse {
                healthy: true,
                endpoint: endpoint.to_string(),
                ..Default::default()
            }))
    }
}

/// Minimal node configuration rooted at `data_dir`
pub(crate) fn test_config(endpoint: &str, data_dir: &std::path::Path) -> ReplicaConfig {
    let mut config = ReplicaConfig::from_str(&format!(
        "[node]\nendpoint = \"{}\"\ndata_dir = \"{}\"\n",
        endpoint,
        data_dir.display()
    ))
    .unwrap();
    config.health.minimum_memory_available = 0;
    config
}
