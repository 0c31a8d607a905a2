//! Shared object-store scanning used by the Reconciler (C9), Gap Recovery
//! (C10) and Partition Repair (C11): list the durable files under a
//! migration's partition tree and read back the `record_time`/`effective_at`
//! range each one covers, without needing a query engine over the lake.

use arrow::array::{Array, TimestampMicrosecondArray};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use ledger_blobstore::BlobStore;
use ledger_model::types::{PartitionKind, Source};
use object_store::path::Path as ObjPath;
use object_store::ObjectStore;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

/// One durable Parquet file and the time range of rows it contains.
#[derive(Debug, Clone)]
pub struct PartitionFile {
    /// Absolute object-store location (root-inclusive), as returned by
    /// listing -- safe to hand back to [`object_store::ObjectStore`]
    /// directly (`store.inner()`), but NOT to `BlobStore::get`/`delete`,
    /// which would re-apply the root prefix.
    pub path: String,
    pub min_time: DateTime<Utc>,
    pub max_time: DateTime<Utc>,
    pub row_count: i64,
}

/// Lists every `.parquet` file under `source/kind/migration={id}` and reads
/// each one's `time_column` range. Ignores the secondary `.pb.zst` container
/// next to each file -- it carries the same rows, so scanning it too would
/// only double-count. Operates via [`BlobStore::inner`] so the absolute
/// locations listing returns can be read back without re-prefixing the
/// root.
pub async fn scan_partition_files(
    store: &BlobStore,
    source: Source,
    kind: PartitionKind,
    migration_id: i64,
    time_column: &str,
) -> anyhow::Result<Vec<PartitionFile>> {
    let inner = store.inner();
    let root = store.root();
    let relative = format!("raw/{}/{}/migration={migration_id}", source.as_str(), kind.as_str());
    let prefix = if root.as_ref().is_empty() {
        ObjPath::from(relative)
    } else {
        ObjPath::from(format!("{root}/{relative}"))
    };

    let objects: Vec<object_store::ObjectMeta> = inner.list(Some(&prefix)).try_collect().await?;
    let mut files = Vec::new();
    for obj in objects {
        let path = obj.location.to_string();
        if !path.ends_with(".parquet") {
            continue;
        }
        let bytes = inner.get(&obj.location).await?.bytes().await?;
        let (min_time, max_time, row_count) = time_range(bytes, time_column)?;
        files.push(PartitionFile {
            path,
            min_time,
            max_time,
            row_count,
        });
    }
    Ok(files)
}

fn time_range(bytes: bytes::Bytes, column: &str) -> anyhow::Result<(DateTime<Utc>, DateTime<Utc>, i64)> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
    let mut min_micros: Option<i64> = None;
    let mut max_micros: Option<i64> = None;
    let mut row_count = 0i64;
    for batch in reader {
        let batch: RecordBatch = batch?;
        row_count += batch.num_rows() as i64;
        let idx = batch
            .schema()
            .index_of(column)
            .map_err(|e| anyhow::anyhow!("column {column} missing from batch: {e}"))?;
        let array = batch
            .column(idx)
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .ok_or_else(|| anyhow::anyhow!("column {column} is not a timestamp array"))?;
        for i in 0..array.len() {
            if array.is_null(i) {
                continue;
            }
            let v = array.value(i);
            min_micros = Some(min_micros.map_or(v, |m: i64| m.min(v)));
            max_micros = Some(max_micros.map_or(v, |m: i64| m.max(v)));
        }
    }
    let min_time = micros_to_utc(min_micros.ok_or_else(|| anyhow::anyhow!("file has no rows"))?);
    let max_time = micros_to_utc(max_micros.unwrap());
    Ok((min_time, max_time, row_count))
}

fn micros_to_utc(micros: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(micros).single().expect("valid microsecond timestamp")
}
