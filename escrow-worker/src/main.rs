//! Ledger reconciliation worker
//!
//! Runs the event reconciler against the configured ledger node and store,
//! applies database migrations, or replays a fixed block range.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use escrow_settlement::ledger::{LedgerGateway, RpcLedgerGateway};
use escrow_settlement::node::{open_store, NodeConfig};
use escrow_settlement::reconciler::Reconciler;
use escrow_settlement::store::PgStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Escrow settlement reconciliation worker")]
struct Cli {
    /// TOML configuration file; ESCROW__* variables override it
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Debug logging for the escrow crates
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the escrow contract until interrupted
    Run,
    /// Apply pending database migrations and exit
    Migrate,
    /// Reconcile a fixed block range once
    Scan {
        #[arg(long)]
        from: u64,
        #[arg(long)]
        to: u64,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("escrow_settlement=debug,escrow_worker=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("escrow_settlement=info,escrow_worker=info,warn"))
    };

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = NodeConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Migrate => migrate(&config).await,
        Command::Run => run(config).await,
        Command::Scan { from, to } => scan(config, from, to).await,
    }
}

async fn migrate(config: &NodeConfig) -> Result<()> {
    let mut store_config = config.store.clone();
    store_config.run_migrations = false;

    let store = PgStore::connect(&store_config)
        .await
        .context("failed to connect to the database")?;
    store.migrate().await.context("migration failed")?;
    info!("Database migrations applied");
    Ok(())
}

async fn reconciler(config: NodeConfig) -> Result<Reconciler> {
    let ledger: Arc<dyn LedgerGateway> = Arc::new(
        RpcLedgerGateway::new(config.ledger).context("failed to create the ledger gateway")?,
    );
    let store = open_store(&config.store)
        .await
        .context("failed to open the escrow store")?;
    Ok(Reconciler::new(config.reconciler, store, ledger))
}

async fn run(config: NodeConfig) -> Result<()> {
    let reconciler = reconciler(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    reconciler.run(shutdown_rx).await;
    Ok(())
}

async fn scan(config: NodeConfig, from: u64, to: u64) -> Result<()> {
    let reconciler = reconciler(config).await?;
    let report = reconciler
        .scan(from, to)
        .await
        .with_context(|| format!("scan of blocks {from}..={to} failed"))?;

    info!(
        "Scanned blocks {}..={}: {} fetched, {} applied, {} linked, {} recorded, {} deferred, {} duplicates, {} skipped",
        report.from_block,
        report.to_block,
        report.fetched,
        report.applied,
        report.linked,
        report.recorded,
        report.deferred,
        report.duplicates,
        report.skipped
    );
    Ok(())
}
