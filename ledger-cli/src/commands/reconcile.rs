//! `reconcile` subcommand: runs the Reconciler (C9) against every on-disk
//! backfill cursor for a migration.

use crate::config::PipelineConfig;
use crate::cursor_paths::parse_cursor_filename;
use clap::Args;
use ledger_blobstore::BlobStore;
use ledger_cursor::AtomicCursorStore;
use ledger_maintenance::reconcile as reconcile_cursor;
use ledger_model::types::Source;
use tracing::{info, warn};

#[derive(Debug, Args)]
pub struct ReconcileArgs {
    #[arg(long)]
    pub migration: i64,
    /// Rewrite drifted cursors to the store-confirmed position. Without
    /// this flag, drift is only reported.
    #[arg(long)]
    pub fix: bool,
}

pub async fn run(args: ReconcileArgs, config: PipelineConfig) -> anyhow::Result<()> {
    let store = BlobStore::connect(&config.object_store_url()?)?;
    std::fs::create_dir_all(&config.cursor_dir)?;

    let mut any_drift = false;
    let mut checked = 0usize;

    for entry in std::fs::read_dir(&config.cursor_dir)? {
        let entry = entry?;
        let filename = entry.file_name();
        let Some(filename) = filename.to_str() else { continue };
        let Some(parsed) = parse_cursor_filename(filename) else { continue };
        if parsed.migration_id != args.migration {
            continue;
        }

        let mut cursor = AtomicCursorStore::load(entry.path())?;
        let report = reconcile_cursor(&store, &mut cursor, args.migration, Source::Backfill, args.fix).await?;
        checked += 1;
        if report.drifted {
            any_drift = true;
            warn!(
                "shard {} drifted: cursor={:?} store={:?} fixed={}",
                report.synchronizer_id, report.cursor_position, report.store_position, report.fixed
            );
        } else {
            info!("shard {} agrees with durable store state", report.synchronizer_id);
        }
    }

    info!("reconcile checked {checked} cursor(s) for migration {}", args.migration);
    if any_drift && !args.fix {
        anyhow::bail!("drift detected in migration {} and --fix was not given", args.migration);
    }
    Ok(())
}
