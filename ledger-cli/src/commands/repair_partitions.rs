//! `repair-partitions` subcommand: re-partitions misfiled files (C11) for
//! one source/migration.

use crate::config::PipelineConfig;
use clap::{Args, ValueEnum};
use ledger_blobstore::BlobStore;
use ledger_maintenance::{RepairAction, execute_repair, plan_repair, scan_partition_files, verify_repair};
use ledger_model::types::{PartitionKind, Source};
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StreamArg {
    Backfill,
    Updates,
}

impl From<StreamArg> for Source {
    fn from(s: StreamArg) -> Self {
        match s {
            StreamArg::Backfill => Source::Backfill,
            StreamArg::Updates => Source::Updates,
        }
    }
}

#[derive(Debug, Args)]
pub struct RepairPartitionsArgs {
    #[arg(long)]
    pub migration: i64,
    #[arg(long, value_enum, default_value = "backfill")]
    pub stream: StreamArg,
    /// Only print the repair plan; don't move or rewrite any files.
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn run(args: RepairPartitionsArgs, config: PipelineConfig) -> anyhow::Result<()> {
    let store = BlobStore::connect(&config.object_store_url()?)?;
    let source: Source = args.stream.into();
    let files = scan_partition_files(&store, source, PartitionKind::Updates, args.migration, "record_time").await?;

    let mut repaired = 0usize;
    let mut written_all = Vec::new();
    for file in &files {
        let (plan, rows) = plan_repair(&store, file, args.migration).await?;
        if plan.action == RepairAction::Skip {
            continue;
        }
        info!("{}: {:?}", plan.file, plan.action);
        if args.dry_run {
            continue;
        }
        let written = execute_repair(&store, &plan, &rows).await?;
        written_all.extend(written);
        repaired += 1;
    }

    if args.dry_run {
        info!("dry run: {} of {} file(s) under migration {} need repair", repaired, files.len(), args.migration);
        return Ok(());
    }

    if !written_all.is_empty() {
        let ok = verify_repair(&store, &written_all, args.migration).await?;
        if !ok {
            anyhow::bail!("repair verification failed for migration {}", args.migration);
        }
    }

    info!("repaired {repaired} file(s) for migration {} ({} stream)", args.migration, source.as_str());
    Ok(())
}
