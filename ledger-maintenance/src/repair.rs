//! Partition Repair (C11): an offline reshard of files that ended up filed
//! under the wrong UTC-day partition.
//!
//! Scoped to `Updates`-kind files: `Events` rows carry no independent
//! timestamp of their own (they're partitioned alongside the update that
//! produced them, see [`ledger_shard::scheduler`]), so there is no
//! row-level time to recompute a correct partition from. Re-partitioning a
//! misfiled `Events` file would require first repairing its sibling
//! `Updates` file and rederiving membership from it, which this pass does
//! not attempt.

use std::collections::BTreeMap;

use arrow::array::{Array, Int32Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, TimeZone, Utc};
use ledger_blobstore::BlobStore;
use ledger_model::partition::{ledger_partition_path, utc_day_of};
use ledger_model::schema::updates_to_batch;
use ledger_model::types::{PartitionKind, Source, Update, UpdateKind};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::{WriterProperties, WriterVersion};
use tracing::{info, warn};

use crate::scan::PartitionFile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairAction {
    /// Current partition is already correct.
    Skip,
    /// All rows map to one correct partition, different from the current one.
    Move { to: String },
    /// Rows map to more than one correct partition.
    Split { to: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct RepairPlan {
    pub file: String,
    pub action: RepairAction,
}

/// Reads `file`'s rows, recomputes each row's correct partition from its
/// `effective_at`, and decides which [`RepairAction`] would reconcile it.
/// Never mutates anything -- callers run this for both the dry-run report
/// and the pre-execute plan.
pub async fn plan_repair(store: &BlobStore, file: &PartitionFile, migration_id: i64) -> anyhow::Result<(RepairPlan, Vec<Update>)> {
    let rows = read_updates(store, &file.path).await?;
    let current_dir = current_partition_dir(&file.path).map(strip_raw_prefix);

    let mut by_day: BTreeMap<DateTime<Utc>, Vec<Update>> = BTreeMap::new();
    for row in rows {
        by_day.entry(utc_day_of(row.effective_at)).or_default().push(row);
    }

    let targets: Vec<(DateTime<Utc>, String)> = by_day
        .keys()
        .map(|day| {
            (
                *day,
                ledger_partition_path(Source::Backfill, PartitionKind::Updates, migration_id, *day),
            )
        })
        .collect();

    let action = match targets.as_slice() {
        [] => RepairAction::Skip,
        [(_, only)] if current_dir.as_deref() == Some(only.as_str()) => RepairAction::Skip,
        [(_, only)] => RepairAction::Move { to: only.clone() },
        many => RepairAction::Split {
            to: many.iter().map(|(_, p)| p.clone()).collect(),
        },
    };

    let rows_flat: Vec<Update> = by_day.into_values().flatten().collect();
    Ok((
        RepairPlan {
            file: file.path.clone(),
            action,
        },
        rows_flat,
    ))
}

/// Executes a previously planned repair: writes rows to their correct
/// partition(s), then deletes the source file. No-op for `RepairAction::Skip`.
pub async fn execute_repair(store: &BlobStore, plan: &RepairPlan, rows: &[Update]) -> anyhow::Result<Vec<String>> {
    let mut written = Vec::new();
    match &plan.action {
        RepairAction::Skip => {}
        RepairAction::Move { to } => {
            written.push(write_partition_file(store, to, rows).await?);
            delete_source(store, &plan.file).await?;
        }
        RepairAction::Split { .. } => {
            let mut by_day: BTreeMap<DateTime<Utc>, Vec<Update>> = BTreeMap::new();
            for row in rows {
                by_day.entry(utc_day_of(row.effective_at)).or_default().push(row.clone());
            }
            for (day, day_rows) in by_day {
                let partition_path = ledger_partition_path(Source::Backfill, PartitionKind::Updates, day_rows[0].migration_id, day);
                written.push(write_partition_file(store, &partition_path, &day_rows).await?);
            }
            delete_source(store, &plan.file).await?;
        }
    }
    info!("repaired {}: {:?} -> {written:?}", plan.file, plan.action);
    Ok(written)
}

/// Re-reads every file written by [`execute_repair`] and checks its
/// contents now agree with its own path -- the spec's required verify pass
/// before a repair run is considered trustworthy.
pub async fn verify_repair(store: &BlobStore, written_paths: &[String], migration_id: i64) -> anyhow::Result<bool> {
    for path in written_paths {
        let rows = read_updates(store, path).await?;
        let current_dir = current_partition_dir(path).map(strip_raw_prefix);
        for row in &rows {
            let correct = ledger_partition_path(Source::Backfill, PartitionKind::Updates, migration_id, utc_day_of(row.effective_at));
            if current_dir.as_deref() != Some(correct.as_str()) {
                warn!("verify failed: {path} contains a row whose correct partition is {correct}");
                return Ok(false);
            }
        }
    }
    Ok(true)
}

async fn write_partition_file(store: &BlobStore, partition_path: &str, rows: &[Update]) -> anyhow::Result<String> {
    let batch = updates_to_batch(rows)?;
    let mut buf = Vec::new();
    {
        let props = WriterProperties::builder()
            .set_writer_version(WriterVersion::PARQUET_2_0)
            .set_compression(Compression::LZ4_RAW)
            .build();
        let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
    }
    let rand_suffix: u32 = rand::random();
    let millis = Utc::now().timestamp_millis();
    let remote_path = format!("raw/{partition_path}/repaired-{millis}-{rand_suffix:08x}.parquet");
    store.put(&remote_path, bytes::Bytes::from(buf)).await?;
    Ok(remote_path)
}

async fn delete_source(store: &BlobStore, absolute_path: &str) -> anyhow::Result<()> {
    let root = store.root();
    let relative = if root.as_ref().is_empty() {
        absolute_path.to_string()
    } else {
        absolute_path
            .strip_prefix(&format!("{root}/"))
            .map(str::to_string)
            .unwrap_or_else(|| absolute_path.to_string())
    };
    store.delete(&relative).await
}

/// Extracts `raw/backfill/updates/migration=.../year=.../month=.../day=...`
/// from an absolute object location, dropping the trailing filename.
fn current_partition_dir(absolute_path: &str) -> Option<String> {
    let idx = absolute_path.find("/day=")?;
    let rest = &absolute_path[idx + 1..];
    let end = rest.find('/').unwrap_or(rest.len());
    let day_segment_end = idx + 1 + end;
    Some(absolute_path[..day_segment_end].to_string())
}

/// `current_partition_dir` reads off the stored object location, which
/// carries the `raw/` root `ledger_partition_path` doesn't add -- strip it
/// so the two sides compare in the same prefix space.
fn strip_raw_prefix(dir: String) -> String {
    dir.strip_prefix("raw/").map(str::to_string).unwrap_or(dir)
}

async fn read_updates(store: &BlobStore, absolute_path: &str) -> anyhow::Result<Vec<Update>> {
    let root = store.root();
    let relative = if root.as_ref().is_empty() {
        absolute_path.to_string()
    } else {
        absolute_path
            .strip_prefix(&format!("{root}/"))
            .map(str::to_string)
            .unwrap_or_else(|| absolute_path.to_string())
    };
    let bytes = store.get(&relative).await?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
    let mut updates = Vec::new();
    for batch in reader {
        updates.extend(batch_to_updates(&batch?)?);
    }
    Ok(updates)
}

fn batch_to_updates(batch: &RecordBatch) -> anyhow::Result<Vec<Update>> {
    let col = |name: &str| -> anyhow::Result<usize> {
        batch.schema().index_of(name).map_err(|e| anyhow::anyhow!("missing column {name}: {e}"))
    };
    let update_id = batch.column(col("update_id")?).as_any().downcast_ref::<StringArray>().unwrap();
    let migration_id = batch.column(col("migration_id")?).as_any().downcast_ref::<Int64Array>().unwrap();
    let synchronizer_id = batch.column(col("synchronizer_id")?).as_any().downcast_ref::<StringArray>().unwrap();
    let record_time = batch
        .column(col("record_time")?)
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .unwrap();
    let effective_at = batch
        .column(col("effective_at")?)
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .unwrap();
    let offset = batch.column(col("offset")?).as_any().downcast_ref::<Int64Array>().unwrap();
    let kind = batch.column(col("kind")?).as_any().downcast_ref::<StringArray>().unwrap();
    let root_event_ids = batch.column(col("root_event_ids")?).as_any().downcast_ref::<StringArray>().unwrap();
    let event_count = batch.column(col("event_count")?).as_any().downcast_ref::<Int32Array>().unwrap();
    let update_data = batch.column(col("update_data")?).as_any().downcast_ref::<StringArray>().unwrap();

    let mut rows = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        rows.push(Update {
            update_id: update_id.value(i).to_string(),
            migration_id: migration_id.value(i),
            synchronizer_id: synchronizer_id.value(i).to_string(),
            record_time: micros_to_utc(record_time.value(i)),
            effective_at: micros_to_utc(effective_at.value(i)),
            offset: offset.value(i),
            kind: parse_kind(kind.value(i)),
            root_event_ids: split_nonempty(root_event_ids.value(i)),
            event_count: event_count.value(i),
            update_data: update_data.value(i).to_string(),
        });
    }
    Ok(rows)
}

fn parse_kind(s: &str) -> UpdateKind {
    match s {
        "transaction" => UpdateKind::Transaction,
        "reassignment" => UpdateKind::Reassignment,
        _ => UpdateKind::Unknown,
    }
}

fn split_nonempty(s: &str) -> Vec<String> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split(',').map(str::to_string).collect()
    }
}

fn micros_to_utc(micros: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(micros).single().expect("valid microsecond timestamp")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use object_store::memory::InMemory;
    use std::sync::Arc;

    fn update_at(t: DateTime<Utc>) -> Update {
        Update {
            update_id: "u1".to_string(),
            migration_id: 1,
            synchronizer_id: "sync-a".to_string(),
            record_time: t,
            effective_at: t,
            offset: 1,
            kind: UpdateKind::Transaction,
            root_event_ids: vec!["u1:0".to_string()],
            event_count: 1,
            update_data: "{}".to_string(),
        }
    }

    async fn store_with_file(path: &str, rows: &[Update]) -> BlobStore {
        let store = BlobStore::new(Arc::new(InMemory::new()), object_store::path::Path::from(""));
        let remote = write_partition_file(&store, current_partition_dir(&format!("{path}")).unwrap().trim_start_matches('/'), rows)
            .await
            .unwrap();
        let _ = remote;
        store
    }

    #[tokio::test]
    async fn misfiled_single_day_file_plans_a_move() {
        let wrong_day = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let actual_day = Utc.with_ymd_and_hms(2025, 1, 2, 12, 0, 0).unwrap();
        let store = BlobStore::new(Arc::new(InMemory::new()), object_store::path::Path::from(""));
        let rows = vec![update_at(actual_day)];
        let batch = updates_to_batch(&rows).unwrap();
        let mut buf = Vec::new();
        {
            let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None).unwrap();
            writer.write(&batch).unwrap();
            writer.close().unwrap();
        }
        let wrong_path = format!(
            "raw/{}/file-1.parquet",
            ledger_partition_path(Source::Backfill, PartitionKind::Updates, 1, wrong_day)
        );
        store.put(&wrong_path, bytes::Bytes::from(buf)).await.unwrap();

        let file = PartitionFile {
            path: wrong_path.clone(),
            min_time: actual_day,
            max_time: actual_day,
            row_count: 1,
        };
        let (plan, _rows) = plan_repair(&store, &file, 1).await.unwrap();
        match plan.action {
            RepairAction::Move { to } => {
                assert!(to.contains("day=2"));
            }
            other => panic!("expected Move, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn correctly_filed_file_plans_a_skip() {
        let day = Utc.with_ymd_and_hms(2025, 1, 1, 6, 0, 0).unwrap();
        let store = BlobStore::new(Arc::new(InMemory::new()), object_store::path::Path::from(""));
        let rows = vec![update_at(day)];
        let batch = updates_to_batch(&rows).unwrap();
        let mut buf = Vec::new();
        {
            let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None).unwrap();
            writer.write(&batch).unwrap();
            writer.close().unwrap();
        }
        let correct_path = format!(
            "raw/{}/file-1.parquet",
            ledger_partition_path(Source::Backfill, PartitionKind::Updates, 1, day)
        );
        store.put(&correct_path, bytes::Bytes::from(buf)).await.unwrap();

        let file = PartitionFile {
            path: correct_path,
            min_time: day,
            max_time: day,
            row_count: 1,
        };
        let (plan, _) = plan_repair(&store, &file, 1).await.unwrap();
        assert_eq!(plan.action, RepairAction::Skip);
    }
}
