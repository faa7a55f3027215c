//! WolfRepCtl - Command line tool for inspecting WolfReplica nodes
//!
//! Usage:
//!   wolfrepctl health                      - Show node health and sync history
//!   wolfrepctl clock <wallet>...           - Show user clocks on the node
//!   wolfrepctl export <wallet>             - Dump one export page
//!   wolfrepctl sync <wallet> --primary URL - Ask the node to pull from a primary
//!   wolfrepctl replica-set get|set         - Read or assign a replica set
//!   wolfrepctl state                       - Show the state machine status

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use wolfreplica::registry::UserAssignment;
use wolfreplica::replication::protocol::{
    BatchClockStatusRequest, BatchClockStatusResponse, ExportResponse, HealthCheckResponse, SyncReport,
};
use wolfreplica::replication::{SyncRequest, SyncType};

/// WolfReplica Node Control Tool
#[derive(Parser)]
#[command(name = "wolfrepctl")]
#[command(about = "Inspect and operate WolfReplica nodes", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/wolfreplica/config.toml")]
    config: PathBuf,

    /// Node URL to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node health and sync history
    Health,
    /// Show clock values for one or more users
    Clock {
        /// Wallet public keys
        #[arg(required = true)]
        wallets: Vec<String>,
    },
    /// Print one export page as JSON
    Export {
        wallet: String,
        /// First clock value to export
        #[arg(long, default_value_t = 0)]
        from: u64,
    },
    /// Ask the node to sync users from a primary
    Sync {
        #[arg(required = true)]
        wallets: Vec<String>,
        /// Primary endpoint to pull from
        #[arg(long)]
        primary: String,
        /// Run the sync inline and print the result
        #[arg(long)]
        immediate: bool,
        /// Wipe local state before pulling
        #[arg(long)]
        force_resync: bool,
    },
    /// Read or assign a user's replica set
    ReplicaSet {
        #[command(subcommand)]
        action: ReplicaSetAction,
    },
    /// Show the state machine status
    State,
}

#[derive(Subcommand)]
enum ReplicaSetAction {
    /// Show the current assignment
    Get { wallet: String },
    /// Register or replace the assignment
    Set {
        wallet: String,
        #[arg(long)]
        user_id: u64,
        #[arg(long)]
        primary: String,
        #[arg(long)]
        secondary1: String,
        #[arg(long)]
        secondary2: String,
    },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

#[derive(Debug, Deserialize)]
struct StateMachineStatus {
    state: String,
    current_slice: u64,
    modulo_base: u64,
    #[serde(default)]
    last_run: Option<serde_json::Value>,
    queues: QueueStats,
}

#[derive(Debug, Deserialize)]
struct QueueStats {
    manual_waiting: usize,
    manual_active: usize,
    recurring_waiting: usize,
    recurring_active: usize,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    node: NodeSection,
}

#[derive(Debug, Deserialize, Default)]
struct NodeSection {
    #[serde(default)]
    bind_address: Option<String>,
}

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:4000";

fn endpoint_from_config(path: &Path) -> String {
    let bind_address = std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .and_then(|config| config.node.bind_address);

    match bind_address {
        // Convert bind address to localhost if it's 0.0.0.0
        Some(addr) if addr.starts_with("0.0.0.0") => {
            format!("http://127.0.0.1:{}", addr.split(':').nth(1).unwrap_or("4000"))
        }
        Some(addr) => format!("http://{}", addr),
        None => DEFAULT_ENDPOINT.to_string(),
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| endpoint_from_config(&cli.config));
    let endpoint = endpoint.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();

    let result = match &cli.command {
        Commands::Health => show_health(&client, &endpoint).await,
        Commands::Clock { wallets } => show_clocks(&client, &endpoint, wallets).await,
        Commands::Export { wallet, from } => show_export(&client, &endpoint, wallet, *from).await,
        Commands::Sync {
            wallets,
            primary,
            immediate,
            force_resync,
        } => request_sync(&client, &endpoint, wallets, primary, *immediate, *force_resync).await,
        Commands::ReplicaSet { action } => match action {
            ReplicaSetAction::Get { wallet } => show_replica_set(&client, &endpoint, wallet).await,
            ReplicaSetAction::Set {
                wallet,
                user_id,
                primary,
                secondary1,
                secondary2,
            } => {
                let body = serde_json::json!({
                    "user_id": user_id,
                    "primary": primary,
                    "secondary1": secondary1,
                    "secondary2": secondary2,
                });
                set_replica_set(&client, &endpoint, wallet, body).await
            }
        },
        Commands::State => show_state(&client, &endpoint).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Turn a non-success response into an error carrying the API's error body
async fn check(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ErrorBody>().await {
        Ok(body) => bail!("API error {} ({}): {}", status, body.code, body.error),
        Err(_) => bail!("API error: {}", status),
    }
}

// ============ Commands ============

async fn show_health(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let response = client
        .get(format!("{}/health_check", endpoint))
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", endpoint))?;
    let health: HealthCheckResponse = check(response).await?.json().await?;

    let status = if health.healthy {
        "\x1b[32mHEALTHY\x1b[0m"
    } else {
        "\x1b[31mUNHEALTHY\x1b[0m"
    };

    println!();
    println!("Node Health (wolfrepctl v{})", env!("CARGO_PKG_VERSION"));
    println!("===========");
    println!();
    println!("Endpoint:     {}", health.endpoint);
    println!("Status:       {}", status);
    println!("Version:      {}", health.version);
    println!("Uptime:       {}", format_duration(health.uptime_secs));
    if let (Some(available), Some(total)) = (health.available_memory, health.total_memory) {
        println!("Memory:       {} / {} MB available", available / 1_048_576, total / 1_048_576);
    }
    println!();
    println!("{:<10} {:>10} {:>10}", "SYNCS", "SUCCESS", "FAIL");
    println!("{}", "-".repeat(32));
    println!(
        "{:<10} {:>10} {:>10}",
        "daily", health.daily_sync_success_count, health.daily_sync_fail_count
    );
    println!(
        "{:<10} {:>10} {:>10}",
        "rolling", health.rolling_sync_success_count, health.rolling_sync_fail_count
    );
    println!();
    if let Some(at) = health.latest_sync_success {
        println!("Last success: {}", at.to_rfc3339());
    }
    if let Some(at) = health.latest_sync_fail {
        println!("Last failure: {}", at.to_rfc3339());
    }

    Ok(())
}

async fn show_clocks(client: &reqwest::Client, endpoint: &str, wallets: &[String]) -> anyhow::Result<()> {
    let response = client
        .post(format!("{}/users/batch_clock_status", endpoint))
        .json(&BatchClockStatusRequest {
            wallet_public_keys: wallets.to_vec(),
        })
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", endpoint))?;
    let status: BatchClockStatusResponse = check(response).await?.json().await?;

    println!("{:<48} {:>10}", "WALLET", "CLOCK");
    println!("{}", "-".repeat(59));
    for user in status.users {
        println!("{:<48} {:>10}", user.wallet_public_key, user.clock);
    }

    Ok(())
}

async fn show_export(client: &reqwest::Client, endpoint: &str, wallet: &str, from: u64) -> anyhow::Result<()> {
    let response = client
        .get(format!("{}/export", endpoint))
        .query(&[("user", wallet.to_string()), ("clock_range_min", from.to_string())])
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", endpoint))?;
    let export: ExportResponse = check(response).await?.json().await?;

    if export.is_empty() {
        bail!("{} has no data on {}", wallet, endpoint);
    }
    println!("{}", serde_json::to_string_pretty(&export)?);

    Ok(())
}

async fn request_sync(
    client: &reqwest::Client,
    endpoint: &str,
    wallets: &[String],
    primary: &str,
    immediate: bool,
    force_resync: bool,
) -> anyhow::Result<()> {
    let request = SyncRequest {
        wallet: wallets.to_vec(),
        creator_node_endpoint: primary.to_string(),
        sync_type: SyncType::Manual,
        immediate,
        force_resync,
    };

    let response = client
        .post(format!("{}/sync", endpoint))
        .json(&request)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", endpoint))?;
    let response = check(response).await?;

    if !immediate {
        println!("Sync of {} user(s) from {} queued on {}", wallets.len(), primary, endpoint);
        return Ok(());
    }

    let reports: Vec<SyncReport> = response.json().await?;
    println!(
        "{:<44} {:>6} {:>8} {:>8} {:>9} {:>8}",
        "WALLET", "PAGES", "APPLIED", "SKIPPED", "RECOVERED", "CLOCK"
    );
    println!("{}", "-".repeat(88));
    for report in reports {
        println!(
            "{:<44} {:>6} {:>8} {:>8} {:>9} {:>8}",
            report.user, report.pages, report.applied, report.skipped, report.recovered, report.final_clock
        );
    }

    Ok(())
}

async fn show_replica_set(client: &reqwest::Client, endpoint: &str, wallet: &str) -> anyhow::Result<()> {
    let response = client
        .get(format!("{}/replica_sets/{}", endpoint, wallet))
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", endpoint))?;
    let assignment: UserAssignment = check(response).await?.json().await?;

    println!("Wallet:     {}", assignment.user_key);
    println!("User ID:    {}", assignment.user_id);
    println!("Primary:    {}", assignment.replica_set.primary);
    println!("Secondary1: {}", assignment.replica_set.secondary1);
    println!("Secondary2: {}", assignment.replica_set.secondary2);

    Ok(())
}

async fn set_replica_set(
    client: &reqwest::Client,
    endpoint: &str,
    wallet: &str,
    body: serde_json::Value,
) -> anyhow::Result<()> {
    let response = client
        .put(format!("{}/replica_sets/{}", endpoint, wallet))
        .json(&body)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", endpoint))?;
    check(response).await?;

    println!("✓ Replica set for {} updated", wallet);
    Ok(())
}

async fn show_state(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let response = client
        .get(format!("{}/state_machine", endpoint))
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", endpoint))?;
    let status: StateMachineStatus = check(response).await?.json().await?;

    println!();
    println!("State Machine");
    println!("=============");
    println!();
    println!("State:        {}", status.state);
    println!("Slice:        {} of {}", status.current_slice, status.modulo_base);
    println!(
        "Manual:       {} waiting, {} active",
        status.queues.manual_waiting, status.queues.manual_active
    );
    println!(
        "Recurring:    {} waiting, {} active",
        status.queues.recurring_waiting, status.queues.recurring_active
    );
    match status.last_run {
        Some(run) => {
            println!();
            println!("Last run:");
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        None => println!("Last run:     (none yet)"),
    }
    println!();

    Ok(())
}

fn format_duration(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let minutes = (secs % 3600) / 60;
    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, secs % 60)
    }
}
