// ABOUTME: CLI entry point for replica-sync
// ABOUTME: Runs the sync scheduler, single cycles, status checks and setup

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use replica_sync::config::parse_table_list;
use replica_sync::postgres::{ConnectionPool, PgStore};
use replica_sync::{CycleReport, EngineConfig, PendingQueue, SyncEngine};

#[derive(Parser)]
#[command(name = "replica-sync")]
#[command(about = "Keep a local PostgreSQL replica usable while the master is unreachable", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, env = "REPLICA_SYNC_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Tables to synchronize (comma-separated); overrides config and SYNC_TABLES
    #[arg(long, global = true)]
    tables: Option<String>,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync scheduler until Ctrl+C
    Run {
        /// Seconds between sync cycles (defaults to the configured interval)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Run a single probe, pull and replay cycle
    SyncOnce,
    /// Show master connectivity and pending queue counts
    Status,
    /// Create the pending_sync control table in the local database
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(tables) = &cli.tables {
        config.sync.tables = parse_table_list(tables);
    }

    match cli.command {
        Commands::Run { interval } => run(config, interval).await,
        Commands::SyncOnce => sync_once(config).await,
        Commands::Status => status(config).await,
        Commands::Init => init(config).await,
    }
}

async fn run(config: EngineConfig, interval: Option<u64>) -> anyhow::Result<()> {
    let interval = match interval {
        Some(0) => anyhow::bail!("--interval must be at least 1 second"),
        Some(secs) => Duration::from_secs(secs),
        None => config.sync.interval(),
    };
    let engine = SyncEngine::connect(config).await?;

    println!();
    println!("========================================");
    println!("Starting replica sync");
    println!("========================================");
    println!("  Sync interval: {}s", interval.as_secs());
    println!("  Press Ctrl+C to stop");
    println!();

    let report = engine.start_sync(interval).await?;
    print_report(&report);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    // A closed channel means the signal listener failed; stop either way.
    let _ = shutdown_rx.recv().await;
    engine.shutdown().await;
    println!("Sync stopped.");
    Ok(())
}

async fn sync_once(config: EngineConfig) -> anyhow::Result<()> {
    let engine = SyncEngine::connect(config).await?;
    let report = engine.sync_once().await;
    print_report(&report);
    engine.shutdown().await;

    if !report.is_success() {
        anyhow::bail!("Sync cycle finished with {} error(s)", report.errors.len());
    }
    Ok(())
}

async fn status(config: EngineConfig) -> anyhow::Result<()> {
    let engine = SyncEngine::connect(config.clone()).await?;
    let online = engine.is_connected_to_master();
    let queue = engine
        .queue_status()
        .await
        .context("Failed to read pending queue status")?;

    println!("Master:  {} ({})", config.master.display_target(), if online { "online" } else { "offline" });
    println!("Local:   {}", config.local.display_target());
    println!("Tables:  {}", config.sync.tables.join(", "));
    println!("Pending: {} ({} with errors)", queue.pending, queue.failed);
    println!("Synced:  {}", queue.synced);

    engine.shutdown().await;
    Ok(())
}

async fn init(config: EngineConfig) -> anyhow::Result<()> {
    let pool = ConnectionPool::new("local", config.local.clone(), config.sync.connect_timeout())?;
    let local = PgStore::new(pool, config.sync.schema.clone());
    local.ensure_schema().await.with_context(|| {
        format!(
            "Failed to create pending_sync in {}",
            config.local.display_target()
        )
    })?;
    local.pool().close();

    println!("✓ pending_sync is ready in {}", config.local.display_target());
    Ok(())
}

fn print_report(report: &CycleReport) {
    println!("Sync cycle {} ({}ms)", report.cycle, report.duration_ms);
    println!("  Master: {}", if report.online { "online" } else { "offline" });
    for table in &report.tables {
        println!("  {}: {} row(s) pulled", table.table, table.rows_applied);
    }
    if let Some(replay) = report.replay {
        println!(
            "  Replayed: {} applied, {} failed",
            replay.applied, replay.failed
        );
    }
    for error in &report.errors {
        println!("  Error: {}", error);
    }
}
