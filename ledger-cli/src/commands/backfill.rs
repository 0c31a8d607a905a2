//! `backfill` subcommand: drives one shard's historical window to
//! completion via the shard scheduler (C7).

use crate::config::PipelineConfig;
use crate::cursor_paths::backfill_cursor_path;
use chrono::{DateTime, Utc};
use clap::Args;
use ledger_blobstore::BlobStore;
use ledger_cursor::AtomicCursorStore;
use ledger_fetch::{Fetcher, FetcherConfig};
use ledger_model::normalize::NormalizeMode;
use ledger_pipeline::{EncoderPool, UploadQueue, UploadQueueConfig};
use ledger_shard::{ShardScheduler, ShardSchedulerConfig, shard_window};
use tracing::{error, info};

#[derive(Debug, Args)]
pub struct BackfillArgs {
    #[arg(long)]
    pub migration: i64,
    #[arg(long)]
    pub synchronizer_id: String,
    #[arg(long)]
    pub shard_index: u32,
    #[arg(long)]
    pub shard_total: u32,
    /// Required the first time this shard's cursor is created; ignored on resume.
    #[arg(long)]
    pub min_time: Option<DateTime<Utc>>,
    #[arg(long)]
    pub max_time: Option<DateTime<Utc>>,
    #[arg(long, default_value_t = 10)]
    pub commit_every: u32,
}

pub async fn run(args: BackfillArgs, config: PipelineConfig) -> anyhow::Result<()> {
    let store = BlobStore::connect(&config.object_store_url()?)?;
    let fetcher = Fetcher::new(FetcherConfig {
        base_url: config.scan_url.clone(),
        page_size: config.page_size,
        insecure_tls: config.insecure_tls,
        ..FetcherConfig::default()
    })?;

    std::fs::create_dir_all(&config.cursor_dir)?;
    let cursor_path = backfill_cursor_path(&config.cursor_dir, args.migration, &args.synchronizer_id, args.shard_index);

    let cursor = if cursor_path.exists() {
        AtomicCursorStore::load(&cursor_path)?
    } else {
        let min_time = args
            .min_time
            .ok_or_else(|| anyhow::anyhow!("--min-time is required to create cursor {}", cursor_path.display()))?;
        let max_time = args
            .max_time
            .ok_or_else(|| anyhow::anyhow!("--max-time is required to create cursor {}", cursor_path.display()))?;
        let (shard_min, shard_max) = shard_window(min_time, max_time, args.shard_index, args.shard_total);
        AtomicCursorStore::open_or_create(
            &cursor_path,
            args.migration,
            &args.synchronizer_id,
            args.shard_index,
            args.shard_total,
            shard_min,
            shard_max,
        )?
    };

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

    let mut scheduler = ShardScheduler::new(
        fetcher,
        cursor,
        encoder.clone(),
        uploads.clone(),
        ShardSchedulerConfig {
            migration_id: args.migration,
            synchronizer_id: args.synchronizer_id.clone(),
            shard_index: args.shard_index,
            shard_total: args.shard_total,
            normalize_mode: NormalizeMode::Lenient,
            zstd_level: config.zstd_level,
            commit_every: args.commit_every,
            data_dir: config.data_dir.clone(),
        },
    );

    let outcome = scheduler.run_backfill().await;
    uploads.shutdown().await;
    encoder.shutdown();
    outcome?;

    if uploads.has_dead_letters().await {
        let dead_letters = uploads.dead_letters().await;
        for dl in &dead_letters {
            error!("dead letter: {} -> {} ({})", dl.local_path.display(), dl.remote_path, dl.error);
        }
        anyhow::bail!("shard {} completed with {} dead-lettered upload(s)", args.shard_index, dead_letters.len());
    }

    info!("shard {} backfill finished", args.shard_index);
    Ok(())
}
