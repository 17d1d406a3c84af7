use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use plbg_core::SyncStatus;
use plbg_storage::LocalStore;
use plbg_sync::{SyncConfig, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "plbg-cli")]
#[command(about = "Plumbing projects dashboard command-line interface")]
struct Cli {
    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true, env = "PLBG_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull the warehouse once and publish a new snapshot.
    Sync,
    /// Create or upgrade the local store schema.
    Migrate,
    /// Run the dashboard (and the refresh scheduler when enabled).
    Serve,
    /// Write the current snapshot as parquet plus a checksum manifest.
    Export {
        #[arg(long, default_value = "exports/latest")]
        dir: PathBuf,
    },
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let result = plbg_sync::run_sync_once_from_env().await?;
            println!(
                "sync {}: run_id={} projects={} purchase_orders={} orphaned={} issues={}",
                match result.status {
                    SyncStatus::Completed => "complete",
                    SyncStatus::Failed => "failed",
                },
                result.run_id,
                result.projects_loaded,
                result.pos_loaded,
                result.orphaned_pos,
                result.errors.len()
            );
            for issue in &result.errors {
                eprintln!("  [{:?}] {}", issue.kind, issue.message);
            }
            if !result.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = LocalStore::connect(&config.database_url).await?;
            store.migrate().await?;
            info!(database_url = %config.database_url, "migrations applied");
        }
        Commands::Serve => {
            tokio::select! {
                served = plbg_web::serve_from_env() => served?,
                _ = tokio::signal::ctrl_c() => warn!("interrupt received; shutting down"),
            }
        }
        Commands::Export { dir } => {
            let config = SyncConfig::from_env();
            let pipeline = SyncPipeline::from_config(&config).await?;
            let manifest = plbg_sync::export_snapshot_parquet(pipeline.store(), &dir).await?;
            println!("export written: {}", manifest.display());
        }
    }

    Ok(ExitCode::SUCCESS)
}
