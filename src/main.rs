//! ChatSync - Fault-Tolerant Chat Cluster
//!
//! Server binary: one process per configured member.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatsync::config::{ChatSyncConfig, LoggingConfig};
use chatsync::coordinator::{self, ClusterStatus};
use chatsync::error::{Error, Result};
use chatsync::network::ChatConnection;
use chatsync::state::Roster;

/// ChatSync - Fault-Tolerant Chat Cluster
#[derive(Parser)]
#[command(name = "chatsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "chatsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server for one member
    Start {
        /// Member ID from the configuration file
        #[arg(long)]
        id: String,
    },

    /// Validate configuration file
    Validate,

    /// Write a three-member localhost configuration
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "chatsync.toml")]
        output: PathBuf,
    },

    /// Show member information and its live status as JSON
    Info {
        /// Member ID from the configuration file
        #[arg(long)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it is readable
    let logging = ChatSyncConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging);

    match cli.command {
        Commands::Start { id } => run_start(cli.config, id).await,
        Commands::Validate => run_validate(cli.config),
        Commands::Init { output } => run_init(output),
        Commands::Info { id } => run_info(cli.config, id).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the server and run until interrupted
async fn run_start(config_path: PathBuf, id: String) -> Result<()> {
    let config = match ChatSyncConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };

    let handle = match coordinator::start(&config, &id).await {
        Ok(h) => h,
        Err(e) => {
            tracing::error!("Failed to start {}: {}", id, e);
            return Err(e);
        }
    };
    tracing::info!(
        "{} serving clients on {} (cluster port {})",
        id,
        handle.client_addr(),
        handle.cluster_addr()
    );

    let cancelled = handle.cancel_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
        _ = cancelled.cancelled() => {}
    }

    handle.shutdown().await;
    tracing::info!("ChatSync shutdown complete");
    Ok(())
}

/// Write a starter configuration
fn run_init(output: PathBuf) -> Result<()> {
    if output.exists() {
        return Err(Error::Config(format!(
            "{} already exists, refusing to overwrite",
            output.display()
        )));
    }

    let config = ChatSyncConfig::local_three_node();
    config.write_to(&output)?;

    println!("Configuration file created: {}", output.display());
    println!("\nMembers:");
    for member in &config.members {
        println!("  {}", member);
    }
    println!("\nStart each member with:");
    for member in &config.members {
        println!(
            "  chatsync --config {} start --id {}",
            output.display(),
            member.id
        );
    }
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ChatSyncConfig::from_file(&config_path) {
        Ok(config) => {
            let mut members = config.members.clone();
            members.sort_by(|a, b| b.ring_position.cmp(&a.ring_position));

            println!("✓ Configuration is valid");
            println!("  Members: {}", members.len());
            for member in &members {
                println!(
                    "    {:<12} ring {:<4} client {:<21} cluster {}",
                    member.id,
                    member.ring_position,
                    member.client_address(),
                    member.cluster_address()
                );
            }
            println!("  Heartbeat:         {} ms", config.cluster.heartbeat_interval_ms);
            println!("  Failure threshold: {} ms", config.cluster.failure_threshold_ms);
            println!("  Connect timeout:   {} ms", config.cluster.connect_timeout_ms);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show member information along with its live cluster view
async fn run_info(config_path: PathBuf, id: String) -> Result<()> {
    let config = ChatSyncConfig::from_file(&config_path)?;
    let roster = config.roster(&id)?;
    let limit = config.timings().connect_timeout;

    let status = async {
        let mut conn = ChatConnection::open(roster.self_member(), limit).await?;
        conn.status(limit).await
    }
    .await;
    if let Err(e) = &status {
        tracing::debug!("{} did not answer a status request: {}", id, e);
    }

    let info = info_document(&config, &roster, status);
    let rendered = serde_json::to_string_pretty(&info)
        .map_err(|e| Error::Internal(format!("cannot render info: {}", e)))?;
    println!("{}", rendered);
    Ok(())
}

/// Static member details plus the member's own status, or why it has none
fn info_document(
    config: &ChatSyncConfig,
    roster: &Roster,
    status: Result<ClusterStatus>,
) -> serde_json::Value {
    let me = roster.self_member();
    let mut info = serde_json::json!({
        "id": me.id,
        "ring_position": me.ring_position,
        "client_address": me.client_address(),
        "cluster_address": me.cluster_address(),
        "peers": roster.peers(),
        "highest_ring_position": roster.members().first().map(|m| m.id.clone()),
        "cluster": config.cluster,
        "status": serde_json::Value::Null,
    });
    match status {
        Ok(status) => info["status"] = serde_json::json!(status),
        Err(e) => info["status_error"] = serde_json::Value::String(e.to_string()),
    }
    info
}
