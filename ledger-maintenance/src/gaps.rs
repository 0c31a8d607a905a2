//! Gap Recovery (C10): a post-hoc sweep that finds inter-file time gaps in
//! the durable record and re-fetches just the missing ranges.
//!
//! Gap fetches legitimately overlap their neighbors (the same heuristic
//! that decides page boundaries elsewhere has no way to land exactly on an
//! existing file's edge), so every recovered row is deduplicated by
//! `update_id` before it's written.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ledger_fetch::{BackfillPager, FetchOutcome, Fetcher};
use ledger_model::normalize::{NormalizeMode, normalize_update};
use ledger_model::partition::{ledger_partition_path, utc_day_of};
use ledger_model::schema::updates_to_batch;
use ledger_model::types::{PartitionKind, RawUpdate, Source, Update};
use ledger_pipeline::{EncodeJob, EncoderPool, UploadJob, UploadQueue};
use tracing::{info, warn};

use crate::scan::PartitionFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Sorts `files` by `min_time` and flags any inter-file delta larger than
/// `threshold` as a candidate gap `(prev.max_time, next.min_time)`.
pub fn detect_gaps(files: &[PartitionFile], threshold: Duration) -> Vec<Gap> {
    let mut sorted: Vec<&PartitionFile> = files.iter().collect();
    sorted.sort_by_key(|f| f.min_time);

    let mut gaps = Vec::new();
    for pair in sorted.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if next.min_time.signed_duration_since(prev.max_time) > chrono::Duration::from_std(threshold).unwrap() {
            gaps.push(Gap {
                start: prev.max_time,
                end: next.min_time,
            });
        }
    }
    gaps
}

#[derive(Debug, Clone, Default)]
pub struct GapRecoveryReport {
    pub gaps_found: usize,
    pub rows_recovered: u64,
}

pub struct GapRecoveryConfig {
    pub migration_id: i64,
    pub normalize_mode: NormalizeMode,
    pub zstd_level: i32,
    pub data_dir: PathBuf,
}

/// Refetches every candidate gap bounded to `[gap.start, gap.end]`,
/// deduplicates by `update_id` and writes/uploads the recovered rows via the
/// same encode (C3) and upload (C4) path the shard scheduler uses. Returns
/// without touching any cursor -- a recovered gap is a patch to the durable
/// record, not a change in any shard's resume position.
pub async fn recover_gaps(
    fetcher: &Fetcher,
    encoder: &EncoderPool,
    uploads: &UploadQueue,
    gaps: &[Gap],
    config: &GapRecoveryConfig,
) -> anyhow::Result<GapRecoveryReport> {
    let mut report = GapRecoveryReport {
        gaps_found: gaps.len(),
        ..Default::default()
    };

    for gap in gaps {
        info!("recovering gap [{}, {}]", gap.start, gap.end);
        let rows = fetch_gap(fetcher, gap.end, gap.start).await?;
        if rows.is_empty() {
            warn!("gap [{}, {}] recovered no rows -- it may be a legitimate quiet period", gap.start, gap.end);
            continue;
        }
        report.rows_recovered += write_rows(encoder, uploads, &rows, config).await?;
    }

    Ok(report)
}

/// Pages a bounded window exactly like the normal backfill loop, but
/// without any cursor -- this is a one-off patch, not shard progress.
async fn fetch_gap(fetcher: &Fetcher, before: DateTime<Utc>, at_or_after: DateTime<Utc>) -> anyhow::Result<Vec<Update>> {
    let mut pager = BackfillPager::new(before, at_or_after);
    let mut seen = HashSet::new();
    let mut updates = Vec::new();

    while !pager.exhausted() {
        let outcome = fetcher.fetch_backfill_page(pager.before(), pager.at_or_after()).await;
        pager.observe(&outcome);
        match outcome {
            FetchOutcome::Failure { err, retryable } => {
                anyhow::bail!("gap recovery fetch failed (retryable={retryable}): {err}");
            }
            FetchOutcome::SuccessEmpty { .. } => {}
            FetchOutcome::SuccessData { rows, .. } => {
                for row in rows {
                    let raw = RawUpdate::from_value(row)?;
                    if !seen.insert(raw.update_id.clone()) {
                        continue;
                    }
                    updates.push(normalize_update(&raw, NormalizeMode::Lenient)?);
                }
            }
        }
    }
    Ok(updates)
}

async fn write_rows(
    encoder: &EncoderPool,
    uploads: &UploadQueue,
    rows: &[Update],
    config: &GapRecoveryConfig,
) -> anyhow::Result<u64> {
    let mut by_day: BTreeMap<DateTime<Utc>, Vec<Update>> = BTreeMap::new();
    for row in rows {
        by_day.entry(utc_day_of(row.effective_at)).or_default().push(row.clone());
    }

    let mut written = 0u64;
    for (day, day_rows) in by_day {
        let batch = updates_to_batch(&day_rows)?;
        let partition_path = ledger_partition_path(Source::Backfill, PartitionKind::Updates, config.migration_id, day);
        let local_dir = config.data_dir.join(&partition_path);
        tokio::fs::create_dir_all(&local_dir).await?;

        let rand_suffix: u32 = rand::random();
        let millis = Utc::now().timestamp_millis();
        let stem = format!("gap-repair-{millis}-{rand_suffix:08x}");
        let target = local_dir.join(&stem);

        let outcome = encoder
            .submit(EncodeJob {
                target_file_path: target,
                batch,
                zstd_level: config.zstd_level,
            })
            .await?;

        let remote_base = format!("raw/{partition_path}/{stem}");
        for job in [
            UploadJob {
                local_path: outcome.parquet_path,
                remote_path: format!("{remote_base}.parquet"),
                bytes: outcome.parquet_bytes,
                delete_on_failure: false,
            },
            UploadJob {
                local_path: outcome.chunked_path,
                remote_path: format!("{remote_base}.pb.zst"),
                bytes: outcome.chunked_bytes,
                delete_on_failure: false,
            },
        ] {
            uploads.enqueue(job)?;
        }
        written += day_rows.len() as u64;
    }
    uploads.drain().await;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn file(min_h: u32, max_h: u32) -> PartitionFile {
        PartitionFile {
            path: format!("f{min_h}"),
            min_time: Utc.with_ymd_and_hms(2025, 1, 1, min_h, 0, 0).unwrap(),
            max_time: Utc.with_ymd_and_hms(2025, 1, 1, max_h, 0, 0).unwrap(),
            row_count: 1,
        }
    }

    #[test]
    fn no_gap_when_files_are_contiguous() {
        let files = vec![file(0, 1), file(1, 2)];
        let gaps = detect_gaps(&files, Duration::from_secs(120));
        assert!(gaps.is_empty());
    }

    #[test]
    fn gap_detected_past_threshold() {
        let files = vec![file(0, 1), file(5, 6)];
        let gaps = detect_gaps(&files, Duration::from_secs(120));
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start, Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap());
        assert_eq!(gaps[0].end, Utc.with_ymd_and_hms(2025, 1, 1, 5, 0, 0).unwrap());
    }

    #[test]
    fn files_are_sorted_before_gap_detection() {
        let files = vec![file(5, 6), file(0, 1)];
        let gaps = detect_gaps(&files, Duration::from_secs(120));
        assert_eq!(gaps.len(), 1);
    }
}
