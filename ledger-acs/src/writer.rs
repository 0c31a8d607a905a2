//! C8 Snapshot Writer.
//!
//! An ACS snapshot is conceptually one large immutable set; this writer
//! streams it to a partitioned directory as numbered Parquet files, then
//! finalizes with an atomic `_COMPLETE` marker. Readers must treat any
//! snapshot directory lacking that marker as not-yet-usable.

use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use ledger_blobstore::BlobStore;
use ledger_model::partition::acs_partition_path;
use ledger_model::schema::acs_to_batch;
use ledger_model::types::AcsContract;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::{WriterProperties, WriterVersion};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct AcsSnapshotConfig {
    pub migration_id: i64,
    /// The run time the snapshot was taken at -- determines its partition.
    /// Distinct runs must use distinct `snapshot_time`s (to the second);
    /// the system relies on external scheduling to guarantee this, the
    /// same way it relies on external scheduling to prevent two shards
    /// claiming the same cursor.
    pub snapshot_time: DateTime<Utc>,
    pub max_rows_per_file: usize,
    pub data_dir: PathBuf,
    /// Keep each numbered file's local copy after it's uploaded, for
    /// operator inspection, rather than deleting it immediately (the
    /// `--keep-raw` CLI flag's only effect).
    pub keep_raw: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub migration_id: i64,
    pub snapshot_time: DateTime<Utc>,
    pub file_count: u32,
    pub row_count: u64,
    pub finished_at: DateTime<Utc>,
}

/// One writer per snapshot run. Not `Clone`/shared -- a snapshot is a
/// bounded, single-owner batch operation, unlike the continuous C3/C4
/// pools it deliberately does not route through.
pub struct AcsSnapshotWriter {
    store: BlobStore,
    config: AcsSnapshotConfig,
    partition_path: String,
    next_file_index: u32,
    rows_written: u64,
}

impl AcsSnapshotWriter {
    pub fn new(store: BlobStore, config: AcsSnapshotConfig) -> Self {
        let partition_path = acs_partition_path(config.migration_id, config.snapshot_time);
        Self {
            store,
            config,
            partition_path,
            next_file_index: 0,
            rows_written: 0,
        }
    }

    pub fn partition_path(&self) -> &str {
        &self.partition_path
    }

    /// Writes `rows`, splitting into `max_rows_per_file`-sized numbered
    /// files and uploading each as it completes. May be called more than
    /// once per writer as more rows become available.
    pub async fn write_rows(&mut self, rows: &[AcsContract]) -> anyhow::Result<()> {
        for chunk in rows.chunks(self.config.max_rows_per_file.max(1)) {
            self.write_one_file(chunk).await?;
        }
        Ok(())
    }

    async fn write_one_file(&mut self, rows: &[AcsContract]) -> anyhow::Result<()> {
        let batch = acs_to_batch(rows)?;
        let rand_suffix: u32 = rand::random();
        let index = self.next_file_index;
        let filename = format!("contracts-{index:05}-{rand_suffix:08x}.parquet");

        let local_dir = self.config.data_dir.join(&self.partition_path);
        tokio::fs::create_dir_all(&local_dir).await?;
        let local_path = local_dir.join(&filename);

        let write_target = local_path.clone();
        match tokio::task::spawn_blocking(move || write_parquet_atomically(&write_target, &batch)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(join_err) => anyhow::bail!("acs writer panicked encoding {filename}: {join_err}"),
        }

        let bytes = tokio::fs::read(&local_path).await?;
        let remote_path = format!("raw/{}/{filename}", self.partition_path);
        self.store.put(&remote_path, bytes.into()).await?;
        if !self.config.keep_raw
            && let Err(e) = tokio::fs::remove_file(&local_path).await
        {
            warn!("acs writer failed to clean up local file {}: {e}", local_path.display());
        }

        self.next_file_index += 1;
        self.rows_written += rows.len() as u64;
        Ok(())
    }

    /// Finalizes the snapshot with an atomic `_COMPLETE` marker containing
    /// completion statistics. Consumes the writer: a finalized snapshot is
    /// done, and a new run gets a fresh writer with a new `snapshot_time`.
    pub async fn finalize(self) -> anyhow::Result<SnapshotStats> {
        let stats = SnapshotStats {
            migration_id: self.config.migration_id,
            snapshot_time: self.config.snapshot_time,
            file_count: self.next_file_index,
            row_count: self.rows_written,
            finished_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&stats)?;
        let remote_path = format!("raw/{}/_COMPLETE", self.partition_path);
        self.store.put(&remote_path, body.into()).await?;
        info!(
            "finalized acs snapshot {} ({} files, {} rows)",
            self.partition_path, stats.file_count, stats.row_count
        );
        Ok(stats)
    }
}

/// Same write-temp-then-rename discipline as the cursor store and the
/// encoder pool: a crash mid-write leaves no partial file under the real
/// name.
fn write_parquet_atomically(path: &Path, batch: &RecordBatch) -> anyhow::Result<()> {
    let tmp = tmp_sibling(path);
    let result = (|| -> anyhow::Result<()> {
        let file = std::fs::File::create(&tmp)?;
        let props = WriterProperties::builder()
            .set_writer_version(WriterVersion::PARQUET_2_0)
            .set_compression(Compression::LZ4_RAW)
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        writer.write(batch)?;
        writer.close()?;
        Ok(())
    })();
    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let rand_suffix: u32 = rand::random();
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{rand_suffix:08x}.tmp"));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_model::types::TemplateIdParts;
    use object_store::memory::InMemory;
    use std::sync::Arc;

    fn contract(id: &str) -> AcsContract {
        AcsContract {
            contract_id: id.to_string(),
            event_id: Some(format!("{id}-e")),
            template_id: TemplateIdParts::parse("pkg:Mod:Entity"),
            migration_id: 1,
            record_time: Utc::now(),
            snapshot_time: Utc::now(),
            payload: None,
            raw: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn splits_rows_across_numbered_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(Arc::new(InMemory::new()), object_store::path::Path::from(""));
        let mut writer = AcsSnapshotWriter::new(
            store.clone(),
            AcsSnapshotConfig {
                migration_id: 1,
                snapshot_time: Utc::now(),
                max_rows_per_file: 2,
                data_dir: dir.path().to_path_buf(),
                keep_raw: false,
            },
        );
        let rows: Vec<AcsContract> = (0..5).map(|i| contract(&format!("c{i}"))).collect();
        writer.write_rows(&rows).await.unwrap();
        assert_eq!(writer.next_file_index, 3);
        let stats = writer.finalize().await.unwrap();
        assert_eq!(stats.file_count, 3);
        assert_eq!(stats.row_count, 5);

        let listed = store.list(&format!("raw/{}", acs_partition_path(1, stats.snapshot_time))).await.unwrap();
        // 3 parquet files + 1 _COMPLETE marker
        assert_eq!(listed.len(), 4);
    }

    #[tokio::test]
    async fn finalize_writes_complete_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(Arc::new(InMemory::new()), object_store::path::Path::from(""));
        let snapshot_time = Utc::now();
        let writer = AcsSnapshotWriter::new(
            store.clone(),
            AcsSnapshotConfig {
                migration_id: 2,
                snapshot_time,
                max_rows_per_file: 1000,
                data_dir: dir.path().to_path_buf(),
                keep_raw: false,
            },
        );
        let partition_path = writer.partition_path().to_string();
        writer.finalize().await.unwrap();
        assert!(store.exists(&format!("raw/{partition_path}/_COMPLETE")).await.unwrap());
    }
}
