//! Single launcher binary for the ledger ingestion pipeline's
//! operator-facing entry points: one subcommand per launcher entry, each
//! mapping its `Result` to an exit code.

mod commands;
mod config;
mod cursor_paths;

use clap::{Parser, Subcommand};
use commands::acs_snapshot::AcsSnapshotArgs;
use commands::backfill::BackfillArgs;
use commands::reconcile::ReconcileArgs;
use commands::recover_gaps::RecoverGapsArgs;
use commands::repair_partitions::RepairPartitionsArgs;
use config::PipelineConfig;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ledger-cli", about = "Ledger ingestion pipeline launcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive one shard's historical backfill window to completion.
    Backfill(BackfillArgs),
    /// Take a full active-contract-set snapshot.
    AcsSnapshot(AcsSnapshotArgs),
    /// Check, and optionally fix, cursor drift against the durable store.
    Reconcile(ReconcileArgs),
    /// Detect and refetch inter-file time gaps.
    RecoverGaps(RecoverGapsArgs),
    /// Re-partition misfiled files.
    RepairPartitions(RepairPartitionsArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e:#}");
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Backfill(args) => commands::backfill::run(args, config).await,
        Commands::AcsSnapshot(args) => commands::acs_snapshot::run(args, config).await,
        Commands::Reconcile(args) => commands::reconcile::run(args, config).await,
        Commands::RecoverGaps(args) => commands::recover_gaps::run(args, config).await,
        Commands::RepairPartitions(args) => commands::repair_partitions::run(args, config).await,
    };

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}
