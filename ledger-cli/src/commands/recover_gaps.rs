//! `recover-gaps` subcommand: detects and refetches inter-file gaps (C10)
//! in a migration's durable backfill record.

use crate::config::PipelineConfig;
use clap::Args;
use ledger_blobstore::BlobStore;
use ledger_fetch::{Fetcher, FetcherConfig};
use ledger_maintenance::{GapRecoveryConfig, detect_gaps, recover_gaps as recover_gaps_impl, scan_partition_files};
use ledger_model::normalize::NormalizeMode;
use ledger_model::types::{PartitionKind, Source};
use ledger_pipeline::{EncoderPool, UploadQueue, UploadQueueConfig};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Args)]
pub struct RecoverGapsArgs {
    #[arg(long)]
    pub migration: i64,
}

pub async fn run(args: RecoverGapsArgs, config: PipelineConfig) -> anyhow::Result<()> {
    let store = BlobStore::connect(&config.object_store_url()?)?;
    let files = scan_partition_files(&store, Source::Backfill, PartitionKind::Updates, args.migration, "record_time").await?;
    let gaps = detect_gaps(&files, Duration::from_millis(config.gap_threshold_ms));
    if gaps.is_empty() {
        info!("no gaps found for migration {}", args.migration);
        return Ok(());
    }
    info!("found {} gap(s) in migration {}", gaps.len(), args.migration);

    let fetcher = Fetcher::new(FetcherConfig {
        base_url: config.scan_url.clone(),
        page_size: config.page_size,
        insecure_tls: config.insecure_tls,
        ..FetcherConfig::default()
    })?;
    let encoder = EncoderPool::new(config.max_workers, config.max_workers.max(1) * 4);
    let uploads = UploadQueue::spawn(
        store,
        UploadQueueConfig {
            concurrency: config.gcs_upload_concurrency,
            high_count: config.gcs_queue_high_water,
            low_count: config.gcs_queue_low_water,
            high_bytes: config.gcs_byte_high_water,
            low_bytes: config.gcs_byte_low_water,
            max_retries: config.gcs_max_retries,
            retry_base_delay_ms: config.gcs_retry_base_delay_ms,
            ..UploadQueueConfig::default()
        },
    );

    let outcome = recover_gaps_impl(
        &fetcher,
        &encoder,
        &uploads,
        &gaps,
        &GapRecoveryConfig {
            migration_id: args.migration,
            normalize_mode: NormalizeMode::Lenient,
            zstd_level: config.zstd_level,
            data_dir: config.data_dir.clone(),
        },
    )
    .await;

    uploads.shutdown().await;
    encoder.shutdown();
    let report = outcome?;
    info!("gap recovery: {} gap(s), {} row(s) recovered", report.gaps_found, report.rows_recovered);
    Ok(())
}
