//! Reconciler (C9): a startup safety check comparing a shard's cursor
//! against what the object store actually contains, so a process that
//! crashed mid-upload (or had files deleted out from under it) is caught
//! before it silently resumes from a position the store can't back up.

use chrono::{DateTime, Utc};
use ledger_blobstore::BlobStore;
use ledger_cursor::AtomicCursorStore;
use ledger_model::types::{PartitionKind, Source};
use tracing::{info, warn};

use crate::scan::scan_partition_files;

#[derive(Debug, Clone)]
pub struct ReconcilerReport {
    pub synchronizer_id: String,
    /// The position the store scan actually supports.
    pub store_position: Option<DateTime<Utc>>,
    /// The cursor's own claimed local position before this check.
    pub cursor_position: Option<DateTime<Utc>>,
    pub drifted: bool,
    pub fixed: bool,
}

/// Scans the store under the cursor's `(source, migration_id)` partition
/// tree and checks for drift. `source` determines which direction is
/// "ahead": backfill accumulates toward `min_time`, so the store-derived
/// position is the earliest `record_time` found; a live stream accumulates
/// toward `max_time`, so it's the latest.
///
/// In `fix` mode, drift rewrites the cursor via
/// [`AtomicCursorStore::reconcile_to_store`]; otherwise this only reports.
pub async fn reconcile(
    store: &BlobStore,
    cursor: &mut AtomicCursorStore,
    migration_id: i64,
    source: Source,
    fix: bool,
) -> anyhow::Result<ReconcilerReport> {
    let synchronizer_id = cursor.cursor().synchronizer_id.clone();
    let files = scan_partition_files(store, source, PartitionKind::Updates, migration_id, "record_time").await?;

    let store_position = match source {
        Source::Backfill => files.iter().map(|f| f.min_time).min(),
        Source::Updates => files.iter().map(|f| f.max_time).max(),
    };
    let cursor_position = cursor.debug_local_position();

    let drifted = match (store_position, cursor_position, source) {
        (Some(store_ts), Some(cursor_ts), Source::Backfill) => cursor_ts < store_ts,
        (Some(store_ts), Some(cursor_ts), Source::Updates) => cursor_ts > store_ts,
        // No files yet but the cursor claims progress: always drift.
        (None, Some(_), _) => true,
        _ => false,
    };

    let mut fixed = false;
    if drifted {
        warn!(
            "shard {synchronizer_id} drifted: cursor claims {cursor_position:?}, store supports {store_position:?}"
        );
        if fix {
            let rewrite_to = store_position.unwrap_or(cursor.cursor().max_time);
            cursor.reconcile_to_store(rewrite_to)?;
            fixed = true;
        }
    } else {
        info!("shard {synchronizer_id} cursor agrees with durable store state");
    }

    Ok(ReconcilerReport {
        synchronizer_id,
        store_position,
        cursor_position,
        drifted,
        fixed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ledger_model::schema::updates_to_batch;
    use ledger_model::types::{Update, UpdateKind};
    use object_store::memory::InMemory;
    use parquet::arrow::ArrowWriter;
    use std::sync::Arc;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap(),
        )
    }

    async fn put_file(store: &BlobStore, path: &str, t: DateTime<Utc>) {
        let update = Update {
            update_id: "u1".to_string(),
            migration_id: 1,
            synchronizer_id: "sync-a".to_string(),
            record_time: t,
            effective_at: t,
            offset: 1,
            kind: UpdateKind::Transaction,
            root_event_ids: vec![],
            event_count: 0,
            update_data: "{}".to_string(),
        };
        let batch = updates_to_batch(&[update]).unwrap();
        let mut buf = Vec::new();
        {
            let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None).unwrap();
            writer.write(&batch).unwrap();
            writer.close().unwrap();
        }
        store.put(path, bytes::Bytes::from(buf)).await.unwrap();
    }

    #[tokio::test]
    async fn no_drift_when_cursor_matches_store() {
        let dir = tempfile::tempdir().unwrap();
        let (min, max) = window();
        let t1 = min + chrono::Duration::hours(2);
        let mut cursor =
            AtomicCursorStore::open_or_create(dir.path().join("c0.json"), 1, "sync-a", 0, 1, min, max).unwrap();
        cursor.begin(1, 1, t1).unwrap();
        cursor.commit().unwrap();

        let store = BlobStore::new(Arc::new(InMemory::new()), object_store::path::Path::from(""));
        put_file(
            &store,
            "raw/backfill/updates/migration=1/year=2025/month=1/day=1/updates-1-aaaa.parquet",
            t1,
        )
        .await;

        let report = reconcile(&store, &mut cursor, 1, Source::Backfill, true).await.unwrap();
        assert!(!report.drifted);
        assert!(!report.fixed);
    }

    #[tokio::test]
    async fn drift_detected_and_fixed_when_store_lags_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let (min, max) = window();
        let t1 = min + chrono::Duration::hours(2);
        let t_missing = min + chrono::Duration::hours(1);
        let mut cursor =
            AtomicCursorStore::open_or_create(dir.path().join("c0.json"), 1, "sync-a", 0, 1, min, max).unwrap();
        // Cursor claims progress down to t_missing, but only the t1 file
        // ever made it durable (e.g. the t_missing file's upload failed
        // silently and was later deleted out from under the process).
        cursor.begin(1, 1, t1).unwrap();
        cursor.commit().unwrap();
        cursor.begin(1, 1, t_missing).unwrap();
        cursor.commit().unwrap();

        let store = BlobStore::new(Arc::new(InMemory::new()), object_store::path::Path::from(""));
        put_file(
            &store,
            "raw/backfill/updates/migration=1/year=2025/month=1/day=1/updates-1-aaaa.parquet",
            t1,
        )
        .await;

        let report = reconcile(&store, &mut cursor, 1, Source::Backfill, true).await.unwrap();
        assert!(report.drifted);
        assert!(report.fixed);
        assert_eq!(cursor.debug_local_position(), Some(t1));
    }
}
