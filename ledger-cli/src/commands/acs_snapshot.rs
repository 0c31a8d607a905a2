//! `acs-snapshot` subcommand: takes one full active-contract-set snapshot
//! (C8) and retires older complete snapshots of the same migration.

use crate::config::PipelineConfig;
use chrono::{DateTime, Datelike, Utc};
use clap::Args;
use ledger_acs::{AcsSnapshotConfig, AcsSnapshotWriter, DEFAULT_KEEP, retain_recent_snapshots};
use ledger_blobstore::BlobStore;
use ledger_fetch::{FetchOutcome, Fetcher, FetcherConfig};
use ledger_model::normalize::{NormalizeMode, normalize_acs_contract};
use tracing::info;

#[derive(Debug, Args)]
pub struct AcsSnapshotArgs {
    #[arg(long)]
    pub migration: i64,
    /// Keep each numbered local file after upload, for operator inspection.
    #[arg(long)]
    pub keep_raw: bool,
    /// Widen the query past the ACS endpoint's default recency window.
    #[arg(long)]
    pub fetch_all: bool,
    /// Skip the run if a complete snapshot already exists for today (UTC).
    #[arg(long)]
    pub skip_complete: bool,
}

pub async fn run(args: AcsSnapshotArgs, config: PipelineConfig) -> anyhow::Result<()> {
    let store = BlobStore::connect(&config.object_store_url()?)?;
    let snapshot_time = Utc::now();

    if args.skip_complete && day_already_complete(&store, args.migration, snapshot_time).await? {
        info!("migration {} already has a complete acs snapshot for today, skipping", args.migration);
        return Ok(());
    }

    let fetcher = Fetcher::new(FetcherConfig {
        base_url: config.scan_url.clone(),
        page_size: config.page_size,
        insecure_tls: config.insecure_tls,
        ..FetcherConfig::default()
    })?;

    let mut writer = AcsSnapshotWriter::new(
        store.clone(),
        AcsSnapshotConfig {
            migration_id: args.migration,
            snapshot_time,
            max_rows_per_file: config.max_rows_per_file,
            data_dir: config.data_dir.clone(),
            keep_raw: args.keep_raw,
        },
    );

    let mut cursor: Option<String> = None;
    loop {
        let outcome = fetcher.fetch_acs_page(args.migration, cursor.as_deref(), args.fetch_all).await;
        match outcome {
            FetchOutcome::Failure { err, retryable } => {
                anyhow::bail!("acs fetch failed (retryable={retryable}): {err}");
            }
            FetchOutcome::SuccessEmpty { .. } => break,
            FetchOutcome::SuccessData { rows, next_cursor } => {
                let contracts = rows
                    .iter()
                    .map(|row| normalize_acs_contract(row, args.migration, snapshot_time, NormalizeMode::Lenient))
                    .collect::<Result<Vec<_>, _>>()?;
                writer.write_rows(&contracts).await?;
                match next_cursor {
                    Some(c) => cursor = Some(c),
                    None => break,
                }
            }
        }
    }

    let stats = writer.finalize().await?;
    info!("acs snapshot {} complete: {} files, {} rows", stats.migration_id, stats.file_count, stats.row_count);

    let deleted = retain_recent_snapshots(&store, args.migration, DEFAULT_KEEP).await?;
    if !deleted.is_empty() {
        info!("retired {} older complete acs snapshot(s)", deleted.len());
    }

    Ok(())
}

/// Checks for an existing `_COMPLETE` marker under today's UTC day prefix,
/// regardless of which `snapshot_id` wrote it.
async fn day_already_complete(store: &BlobStore, migration_id: i64, now: DateTime<Utc>) -> anyhow::Result<bool> {
    let day_prefix = format!("acs/migration={migration_id}/year={}/month={}/day={}", now.year(), now.month(), now.day());
    let listed = store.list(&day_prefix).await?;
    Ok(listed.iter().any(|o| o.location.as_ref().ends_with("_COMPLETE")))
}
