//! C7 Shard Scheduler: drives one cursor + one fetcher loop per shard,
//! sharing the encoder pool (C3) and upload queue (C4) with sibling
//! shards in the same process.
//!
//! Data flow per page: C6 fetch -> normalize (C2) -> group by UTC day (C1)
//! -> C3 submit -> C5 commit -> C4 enqueue. Every `commit_every` commits,
//! or once the shard's window is exhausted, the loop also drains C4 and
//! advances the cursor's remote-confirmed position.

use chrono::{DateTime, Utc};
use ledger_cursor::AtomicCursorStore;
use ledger_fetch::{BackfillPager, FetchOutcome, Fetcher};
use ledger_model::normalize::{NormalizeMode, normalize_event, normalize_update};
use ledger_model::partition::{ledger_partition_path, utc_day_of};
use ledger_model::schema::{events_to_batch, updates_to_batch};
use ledger_model::types::{Event, PartitionKind, RawUpdate, Source, Update};
use ledger_pipeline::{EncodeJob, EncoderPool, UploadJob, UploadQueue};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct ShardSchedulerConfig {
    pub migration_id: i64,
    pub synchronizer_id: String,
    pub shard_index: u32,
    pub shard_total: u32,
    pub normalize_mode: NormalizeMode,
    pub zstd_level: i32,
    /// Drain the upload queue and advance `confirm_gcs` every this many
    /// cursor commits, in addition to always doing so once at shard
    /// completion.
    pub commit_every: u32,
    /// Local scratch root; partition subdirectories are created under it.
    pub data_dir: PathBuf,
}

pub struct ShardScheduler {
    fetcher: Fetcher,
    cursor: AtomicCursorStore,
    encoder: EncoderPool,
    uploads: UploadQueue,
    config: ShardSchedulerConfig,
}

impl ShardScheduler {
    pub fn new(
        fetcher: Fetcher,
        cursor: AtomicCursorStore,
        encoder: EncoderPool,
        uploads: UploadQueue,
        config: ShardSchedulerConfig,
    ) -> Self {
        Self { fetcher, cursor, encoder, uploads, config }
    }

    pub fn cursor(&self) -> &AtomicCursorStore {
        &self.cursor
    }

    /// Runs the shard's backfill window to completion (`mark_complete`) or
    /// to the first unrecoverable failure (`set_error` then propagate).
    /// Always safe to call again after a crash: it resumes from
    /// `resume_position()`, the remote-confirmed position.
    pub async fn run_backfill(&mut self) -> anyhow::Result<()> {
        if self.cursor.is_complete() {
            info!("shard {} already complete, nothing to do", self.config.shard_index);
            return Ok(());
        }

        let min_time = self.cursor.cursor().min_time;
        let max_time = self.cursor.cursor().max_time;
        let before = self.cursor.resume_position().unwrap_or(max_time);
        let mut pager = BackfillPager::new(before, min_time);
        let mut commits_since_drain: u32 = 0;

        while !pager.exhausted() {
            while self.uploads.should_pause() {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }

            let outcome = self.fetcher.fetch_backfill_page(pager.before(), pager.at_or_after()).await;
            pager.observe(&outcome);

            match outcome {
                FetchOutcome::Failure { err, retryable } => {
                    error!(
                        "shard {} fetch failed (retryable={retryable}): {err}",
                        self.config.shard_index
                    );
                    self.cursor.set_error(err.clone())?;
                    anyhow::bail!("shard {} aborted: {err}", self.config.shard_index);
                }
                FetchOutcome::SuccessEmpty { .. } => {}
                FetchOutcome::SuccessData { rows, .. } => {
                    self.ingest_page(&rows).await?;
                    commits_since_drain += 1;
                    if commits_since_drain >= self.config.commit_every {
                        self.drain_and_confirm().await?;
                        commits_since_drain = 0;
                    }
                }
            }
        }

        self.drain_and_confirm().await?;
        self.cursor.mark_complete()?;
        info!("shard {} backfill complete", self.config.shard_index);
        Ok(())
    }

    async fn drain_and_confirm(&mut self) -> anyhow::Result<()> {
        self.uploads.drain().await;
        self.cursor.confirm_gcs(None, None, None)?;
        Ok(())
    }

    /// Normalizes one page, groups rows by UTC day, submits one encode job
    /// per (day, kind), and commits the cursor once for the whole page --
    /// matching the per-page `begin`/`commit` pairing in the scheduler
    /// algorithm, even though a page may straddle more than one partition
    /// day.
    async fn ingest_page(&mut self, rows: &[serde_json::Value]) -> anyhow::Result<()> {
        let mode = self.config.normalize_mode;
        let raw_updates: Vec<RawUpdate> = rows
            .iter()
            .map(|v| RawUpdate::from_value(v.clone()))
            .collect::<Result<_, _>>()?;

        let mut updates_by_day: BTreeMap<DateTime<Utc>, Vec<Update>> = BTreeMap::new();
        let mut events_by_day: BTreeMap<DateTime<Utc>, Vec<Event>> = BTreeMap::new();
        let mut earliest_record_time: Option<DateTime<Utc>> = None;
        let mut total_events = 0i64;

        for raw in &raw_updates {
            let update = normalize_update(raw, mode)?;
            earliest_record_time = Some(match earliest_record_time {
                Some(t) if t <= update.record_time => t,
                _ => update.record_time,
            });
            let day = utc_day_of(update.effective_at);
            let events = extract_events(raw, update.migration_id, &update.update_id, mode);
            total_events += events.len() as i64;
            events_by_day.entry(day).or_default().extend(events);
            updates_by_day.entry(day).or_default().push(update);
        }

        let Some(before_ts) = earliest_record_time else {
            return Ok(());
        };

        self.cursor.begin(raw_updates.len() as i64, total_events, before_ts)?;

        let mut submitted = Vec::new();
        let submit_result = self.submit_all(&updates_by_day, &events_by_day, &mut submitted).await;
        match submit_result {
            Ok(()) => {
                self.cursor.commit()?;
                for job in submitted {
                    if let Err(e) = self.uploads.enqueue(job) {
                        warn!("shard {} failed to enqueue upload: {e}", self.config.shard_index);
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.cursor.rollback()?;
                Err(e)
            }
        }
    }

    async fn submit_all(
        &self,
        updates_by_day: &BTreeMap<DateTime<Utc>, Vec<Update>>,
        events_by_day: &BTreeMap<DateTime<Utc>, Vec<Event>>,
        submitted: &mut Vec<UploadJob>,
    ) -> anyhow::Result<()> {
        for (day, updates) in updates_by_day {
            let batch = updates_to_batch(updates)?;
            let jobs = self
                .encode_and_stage(PartitionKind::Updates, *day, batch)
                .await?;
            submitted.extend(jobs);
        }
        for (day, events) in events_by_day {
            if events.is_empty() {
                continue;
            }
            let batch = events_to_batch(events)?;
            let jobs = self
                .encode_and_stage(PartitionKind::Events, *day, batch)
                .await?;
            submitted.extend(jobs);
        }
        Ok(())
    }

    async fn encode_and_stage(
        &self,
        kind: PartitionKind,
        day: DateTime<Utc>,
        batch: arrow::record_batch::RecordBatch,
    ) -> anyhow::Result<Vec<UploadJob>> {
        let partition_path = ledger_partition_path(Source::Backfill, kind, self.config.migration_id, day);
        let local_dir = self.config.data_dir.join(&partition_path);
        tokio::fs::create_dir_all(&local_dir).await?;

        let rand_suffix: u32 = rand::random();
        let millis = Utc::now().timestamp_millis();
        let stem = format!("{}-{millis}-{rand_suffix:08x}", kind.as_str());
        let target = local_dir.join(&stem);

        let outcome = self
            .encoder
            .submit(EncodeJob {
                target_file_path: target,
                batch,
                zstd_level: self.config.zstd_level,
            })
            .await?;

        let remote_base = format!("raw/{partition_path}/{stem}");
        Ok(vec![
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
        ])
    }
}

/// Walks the flat, preorder `events` array the wire payload carries
/// alongside each update (distinct from `root_event_ids`/`child_event_ids`,
/// which are reference-only ids used for downstream tree reconstruction,
/// not for driving this walk) and normalizes every node.
fn extract_events(raw: &RawUpdate, migration_id: i64, update_id: &str, mode: NormalizeMode) -> Vec<Event> {
    let Some(nodes) = raw.data.get("events").and_then(serde_json::Value::as_array) else {
        return Vec::new();
    };
    nodes
        .iter()
        .enumerate()
        .map(|(index, node)| normalize_event(node, update_id, migration_id, index, mode))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ledger_blobstore::BlobStore;
    use ledger_fetch::FetcherConfig;
    use ledger_pipeline::UploadQueueConfig;
    use object_store::memory::InMemory;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap(),
        )
    }

    fn one_row(record_time: &str) -> serde_json::Value {
        json!({
            "update_id": format!("u-{record_time}"),
            "migration_id": 1,
            "synchronizer_id": "sync-a",
            "record_time": record_time,
            "offset": 1,
            "transaction": {},
            "root_event_ids": ["e0"],
            "events": [{"created_event": {"event_id": "e0", "contract_id": "c1"}}],
        })
    }

    #[tokio::test]
    async fn backfill_shard_ingests_one_page_then_completes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/updates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rows": [one_row("2025-01-01T12:00:00Z")],
                "next_cursor": null,
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/updates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": [], "next_cursor": null})))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(FetcherConfig {
            base_url: server.uri(),
            max_retries: 1,
            retry_base_delay_ms: 1,
            retry_cap_ms: 5,
            ..Default::default()
        })
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let (min, max) = window();
        let cursor = AtomicCursorStore::open_or_create(
            dir.path().join("cursor.json"),
            1,
            "sync-a",
            0,
            1,
            min,
            max,
        )
        .unwrap();

        let encoder = EncoderPool::new(2, 8);
        let uploads = UploadQueue::spawn(
            BlobStore::new(Arc::new(InMemory::new()), object_store::path::Path::from("")),
            UploadQueueConfig::default(),
        );

        let mut scheduler = ShardScheduler::new(
            fetcher,
            cursor,
            encoder,
            uploads,
            ShardSchedulerConfig {
                migration_id: 1,
                synchronizer_id: "sync-a".to_string(),
                shard_index: 0,
                shard_total: 1,
                normalize_mode: NormalizeMode::Strict,
                zstd_level: 3,
                commit_every: 1,
                data_dir: dir.path().join("scratch"),
            },
        );

        scheduler.run_backfill().await.unwrap();
        assert!(scheduler.cursor().is_complete());
        assert_eq!(scheduler.cursor().cursor().total_updates, 1);
        assert_eq!(scheduler.cursor().cursor().total_events, 1);
    }

    #[tokio::test]
    async fn backfill_shard_with_no_data_completes_after_three_empty_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/updates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": [], "next_cursor": null})))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(FetcherConfig {
            base_url: server.uri(),
            max_retries: 1,
            retry_base_delay_ms: 1,
            retry_cap_ms: 5,
            ..Default::default()
        })
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let (min, max) = window();
        let cursor =
            AtomicCursorStore::open_or_create(dir.path().join("cursor.json"), 1, "sync-a", 0, 1, min, max).unwrap();
        let encoder = EncoderPool::new(1, 4);
        let uploads = UploadQueue::spawn(
            BlobStore::new(Arc::new(InMemory::new()), object_store::path::Path::from("")),
            UploadQueueConfig::default(),
        );

        let mut scheduler = ShardScheduler::new(
            fetcher,
            cursor,
            encoder,
            uploads,
            ShardSchedulerConfig {
                migration_id: 1,
                synchronizer_id: "sync-a".to_string(),
                shard_index: 0,
                shard_total: 1,
                normalize_mode: NormalizeMode::Strict,
                zstd_level: 3,
                commit_every: 1,
                data_dir: dir.path().join("scratch"),
            },
        );

        scheduler.run_backfill().await.unwrap();
        assert!(scheduler.cursor().is_complete());
        assert_eq!(scheduler.cursor().cursor().total_updates, 0);
    }
}
