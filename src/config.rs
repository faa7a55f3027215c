//! WolfReplica Configuration
//!
//! This module provides configuration structures for a replica node:
//! where it lives, how it syncs, how it judges peers, and how often
//! the self-healing state machine runs.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfReplica configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Sync protocol configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// State machine configuration
    #[serde(default)]
    pub state_machine: StateMachineConfig,

    /// Peer health configuration
    #[serde(default)]
    pub health: HealthConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Public endpoint other nodes use to reach this node, e.g. `http://cn1.example.com:4000`
    pub endpoint: String,

    /// Address to bind the HTTP server on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Data directory for ledger, registry and content
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Sync protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum number of clock values in one export page
    #[serde(default = "default_max_export_clock_value_range")]
    pub max_export_clock_value_range: u64,

    /// Attempts per content source before giving up on an artifact
    #[serde(default = "default_content_fetch_max_retries")]
    pub content_fetch_max_retries: u32,

    /// Delay between content fetch rounds in milliseconds
    #[serde(default = "default_content_fetch_retry_delay_ms")]
    pub content_fetch_retry_delay_ms: u64,

    /// Concurrent content fetches per page
    #[serde(default = "default_content_fetch_concurrency")]
    pub content_fetch_concurrency: usize,

    /// Consecutive failed merges for a user before content is skipped
    #[serde(default = "default_user_failure_threshold")]
    pub user_failure_threshold: u32,

    /// Allow `force_resync` requests to wipe local user state
    #[serde(default = "default_true")]
    pub force_wipe_enabled: bool,

    /// Maximum users per batch clock status request
    #[serde(default = "default_max_batch_clock_status_size")]
    pub max_batch_clock_status_size: usize,

    /// Peer request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// State machine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineConfig {
    /// Run the periodic state machine
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Number of user slices; the population cycles every `modulo_base` runs
    #[serde(default = "default_modulo_base")]
    pub modulo_base: u64,

    /// Maximum users processed in one run
    #[serde(default = "default_users_per_job")]
    pub users_per_job: usize,

    /// Interval between runs in milliseconds
    #[serde(default = "default_job_interval_ms")]
    pub job_interval_ms: u64,

    /// Allow automatic replica set reconfiguration
    #[serde(default = "default_true")]
    pub reconfig_enabled: bool,

    /// When non-empty, only these endpoints may be picked as new secondaries
    #[serde(default)]
    pub reconfig_node_whitelist: Vec<String>,

    /// Worker count for manual syncs
    #[serde(default = "default_max_manual_sync_concurrency")]
    pub max_manual_sync_concurrency: usize,

    /// Worker count for recurring syncs
    #[serde(default = "default_max_recurring_sync_concurrency")]
    pub max_recurring_sync_concurrency: usize,

    /// Delay between clock status polls in milliseconds
    #[serde(default = "default_monitoring_poll_interval_ms")]
    pub monitoring_poll_interval_ms: u64,

    /// Monitoring deadline for recurring syncs in milliseconds
    #[serde(default = "default_max_sync_monitoring_duration_ms")]
    pub max_sync_monitoring_duration_ms: u64,

    /// Monitoring deadline for manual syncs in milliseconds
    #[serde(default = "default_max_manual_sync_monitoring_duration_ms")]
    pub max_manual_sync_monitoring_duration_ms: u64,
}

/// Peer health configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Health check request timeout in milliseconds
    #[serde(default = "default_health_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Minimum available memory (bytes) a peer must report
    #[serde(default = "default_minimum_memory_available")]
    pub minimum_memory_available: u64,

    /// Daily samples required before trusting the daily success rate
    #[serde(default = "default_minimum_daily_sync_count")]
    pub minimum_daily_sync_count: u64,

    /// Rolling samples required before trusting the rolling success rate
    #[serde(default = "default_minimum_rolling_sync_count")]
    pub minimum_rolling_sync_count: u64,

    /// Success percentage below which a peer is unhealthy
    #[serde(default = "default_minimum_success_percentage")]
    pub minimum_success_percentage: f64,

    /// Grace period after the last successful health check, in seconds
    #[serde(default = "default_max_health_check_age_secs")]
    pub max_health_check_age_secs: u64,

    /// Report this node as unhealthy regardless of its state
    #[serde(default)]
    pub consider_node_unhealthy: bool,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterConfig {
    /// Peer endpoints eligible to join replica sets
    #[serde(default)]
    pub peers: Vec<String>,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiConfig {
    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:4000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfreplica")
}

fn default_max_export_clock_value_range() -> u64 {
    10_000
}

fn default_content_fetch_max_retries() -> u32 {
    3
}

fn default_content_fetch_retry_delay_ms() -> u64 {
    500
}

fn default_content_fetch_concurrency() -> usize {
    10
}

fn default_user_failure_threshold() -> u32 {
    3
}

fn default_max_batch_clock_status_size() -> usize {
    5000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_modulo_base() -> u64 {
    48
}

fn default_users_per_job() -> usize {
    2000
}

fn default_job_interval_ms() -> u64 {
    60 * 60 * 1000
}

fn default_max_manual_sync_concurrency() -> usize {
    15
}

fn default_max_recurring_sync_concurrency() -> usize {
    30
}

fn default_monitoring_poll_interval_ms() -> u64 {
    15_000
}

fn default_max_sync_monitoring_duration_ms() -> u64 {
    300_000
}

fn default_max_manual_sync_monitoring_duration_ms() -> u64 {
    45_000
}

fn default_health_request_timeout_ms() -> u64 {
    2000
}

fn default_minimum_memory_available() -> u64 {
    2_000_000_000
}

fn default_minimum_daily_sync_count() -> u64 {
    50
}

fn default_minimum_rolling_sync_count() -> u64 {
    5000
}

fn default_minimum_success_percentage() -> f64 {
    50.0
}

fn default_max_health_check_age_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_export_clock_value_range: default_max_export_clock_value_range(),
            content_fetch_max_retries: default_content_fetch_max_retries(),
            content_fetch_retry_delay_ms: default_content_fetch_retry_delay_ms(),
            content_fetch_concurrency: default_content_fetch_concurrency(),
            user_failure_threshold: default_user_failure_threshold(),
            force_wipe_enabled: true,
            max_batch_clock_status_size: default_max_batch_clock_status_size(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            modulo_base: default_modulo_base(),
            users_per_job: default_users_per_job(),
            job_interval_ms: default_job_interval_ms(),
            reconfig_enabled: true,
            reconfig_node_whitelist: Vec::new(),
            max_manual_sync_concurrency: default_max_manual_sync_concurrency(),
            max_recurring_sync_concurrency: default_max_recurring_sync_concurrency(),
            monitoring_poll_interval_ms: default_monitoring_poll_interval_ms(),
            max_sync_monitoring_duration_ms: default_max_sync_monitoring_duration_ms(),
            max_manual_sync_monitoring_duration_ms: default_max_manual_sync_monitoring_duration_ms(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_health_request_timeout_ms(),
            minimum_memory_available: default_minimum_memory_available(),
            minimum_daily_sync_count: default_minimum_daily_sync_count(),
            minimum_rolling_sync_count: default_minimum_rolling_sync_count(),
            minimum_success_percentage: default_minimum_success_percentage(),
            max_health_check_age_secs: default_max_health_check_age_secs(),
            consider_node_unhealthy: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl SyncConfig {
    pub fn content_fetch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.content_fetch_retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl StateMachineConfig {
    pub fn job_interval(&self) -> Duration {
        Duration::from_millis(self.job_interval_ms)
    }

    pub fn monitoring_poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_poll_interval_ms)
    }
}

impl HealthConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn max_health_check_age(&self) -> Duration {
        Duration::from_secs(self.max_health_check_age_secs)
    }
}

impl ReplicaConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ReplicaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.endpoint.is_empty() {
            return Err(crate::Error::Config("node.endpoint cannot be empty".into()));
        }

        if !self.node.endpoint.starts_with("http://") && !self.node.endpoint.starts_with("https://") {
            return Err(crate::Error::Config(format!(
                "node.endpoint must be an http(s) URL, got {}",
                self.node.endpoint
            )));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        // A page starts at the requester's own clock, so a range of 1 never returns anything new
        if self.sync.max_export_clock_value_range < 2 {
            return Err(crate::Error::Config(
                "sync.max_export_clock_value_range must be at least 2".into(),
            ));
        }

        if self.sync.content_fetch_max_retries == 0 || self.sync.content_fetch_concurrency == 0 {
            return Err(crate::Error::Config(
                "sync.content_fetch_max_retries and sync.content_fetch_concurrency must be at least 1".into(),
            ));
        }

        if self.sync.max_batch_clock_status_size == 0 {
            return Err(crate::Error::Config(
                "sync.max_batch_clock_status_size must be greater than 0".into(),
            ));
        }

        if self.state_machine.modulo_base == 0 {
            return Err(crate::Error::Config("state_machine.modulo_base must be greater than 0".into()));
        }

        if self.state_machine.users_per_job == 0 {
            return Err(crate::Error::Config("state_machine.users_per_job must be greater than 0".into()));
        }

        if self.state_machine.max_manual_sync_concurrency == 0
            || self.state_machine.max_recurring_sync_concurrency == 0
        {
            return Err(crate::Error::Config("sync queue concurrency must be at least 1".into()));
        }

        if !(0.0..=100.0).contains(&self.health.minimum_success_percentage) {
            return Err(crate::Error::Config(
                "health.minimum_success_percentage must be within 0..=100".into(),
            ));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(crate::Error::Config(format!("unknown logging.format {}", other)));
            }
        }

        Ok(())
    }

    /// This node's advertised endpoint
    pub fn endpoint(&self) -> &str {
        &self.node.endpoint
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the content directory path
    pub fn content_dir(&self) -> PathBuf {
        self.node.data_dir.join("content")
    }
}
