//! WolfReplica - Clock-Based User Data Replication
//!
//! Runs one content node: the peer HTTP API, the sync workers and the
//! replica set state machine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfreplica::api::HttpServer;
use wolfreplica::config::ReplicaConfig;
use wolfreplica::error::Result;
use wolfreplica::node::Node;

/// WolfReplica - Clock-Based User Data Replication
#[derive(Parser)]
#[command(name = "wolfreplica")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfreplica.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the replica node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfreplica.toml")]
        output: PathBuf,

        /// Public endpoint peers reach this node at
        #[arg(long, default_value = "http://localhost:4000")]
        endpoint: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(&cli.config)?;
            let level = cli.log_level.unwrap_or_else(|| config.logging.level.clone());
            init_logging(&level, &config.logging.format);
            run_start(config).await
        }
        Commands::Init { output, endpoint } => run_init(output, endpoint),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: &Path) -> Result<ReplicaConfig> {
    ReplicaConfig::from_file(path).map_err(|e| {
        eprintln!("Failed to load configuration from {:?}: {}", path, e);
        e
    })
}

/// Start the replica node
async fn run_start(config: ReplicaConfig) -> Result<()> {
    tracing::info!(
        endpoint = config.endpoint(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting WolfReplica node..."
    );

    std::fs::create_dir_all(config.data_dir()).map_err(|e| {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        e
    })?;

    let node = Arc::new(Node::open(config)?);
    let background = node.start_background()?;
    tracing::info!(tasks = background.len(), "Background services started");

    let http_server = HttpServer::new(Arc::clone(&node));

    tokio::select! {
        result = http_server.start() => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    // Cleanup
    node.shutdown().await;
    for handle in background {
        handle.abort();
    }

    tracing::info!("WolfReplica shutdown complete");
    Ok(())
}

/// Generate a configuration file
fn run_init(output: PathBuf, endpoint: String) -> Result<()> {
    let config_content = format!(r#"# WolfReplica Configuration
# Generated configuration file

[node]
endpoint = "{endpoint}"
bind_address = "0.0.0.0:4000"
data_dir = "/var/lib/wolfreplica"

[sync]
max_export_clock_value_range = 10000
content_fetch_max_retries = 3
content_fetch_retry_delay_ms = 500
content_fetch_concurrency = 10
user_failure_threshold = 3
force_wipe_enabled = true
max_batch_clock_status_size = 5000
request_timeout_ms = 30000

[state_machine]
enabled = true
modulo_base = 48
users_per_job = 2000
job_interval_ms = 3600000
reconfig_enabled = true
# reconfig_node_whitelist = ["https://cn4.example.com"]
max_manual_sync_concurrency = 15
max_recurring_sync_concurrency = 30
monitoring_poll_interval_ms = 15000
max_sync_monitoring_duration_ms = 300000
max_manual_sync_monitoring_duration_ms = 45000

[health]
request_timeout_ms = 2000
minimum_memory_available = 2000000000
minimum_daily_sync_count = 50
minimum_rolling_sync_count = 5000
minimum_success_percentage = 50.0
max_health_check_age_secs = 300
consider_node_unhealthy = false

[cluster]
peers = []
# peers = ["https://cn2.example.com", "https://cn3.example.com"]

[api]
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set this node's endpoint and its peers.");
    println!("Then start with: wolfreplica --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ReplicaConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Endpoint:       {}", config.endpoint());
            println!("  Bind Address:   {}", config.node.bind_address);
            println!("  Data Directory: {}", config.data_dir().display());
            println!("  Peers:          {}", config.cluster.peers.len());
            println!(
                "  State Machine:  {} (modulo base {}, every {} ms)",
                if config.state_machine.enabled { "enabled" } else { "disabled" },
                config.state_machine.modulo_base,
                config.state_machine.job_interval_ms
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
