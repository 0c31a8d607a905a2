//! Retention for ACS snapshots.
//!
//! After a new snapshot finalizes, delete older *complete* snapshots of
//! the same migration, keeping the `keep` most recent. This must run
//! strictly after the new snapshot's `_COMPLETE` marker is written, never
//! before -- deleting is keyed on the marker's presence, so an in-progress
//! directory (no marker yet) is structurally invisible to this pass and
//! can never be touched by it.

use futures::TryStreamExt;
use ledger_blobstore::BlobStore;
use object_store::path::Path as ObjPath;
use object_store::{ObjectMeta, ObjectStore};
use std::collections::BTreeMap;
use tracing::info;

pub const DEFAULT_KEEP: usize = 2;

/// Deletes all objects under complete ACS snapshot directories for
/// `migration_id`, keeping the `keep` most recent. Returns the directories
/// that were deleted. Operates entirely in the object store's absolute
/// path space (via [`BlobStore::inner`]) so a non-empty bucket root never
/// gets double-prefixed the way composing `BlobStore::list`/`delete` calls
/// on already-absolute listed paths would.
pub async fn retain_recent_snapshots(store: &BlobStore, migration_id: i64, keep: usize) -> anyhow::Result<Vec<String>> {
    let inner = store.inner();
    let root = store.root();
    let prefix = if root.as_ref().is_empty() {
        ObjPath::from(format!("acs/migration={migration_id}"))
    } else {
        ObjPath::from(format!("{root}/acs/migration={migration_id}"))
    };

    let objects: Vec<ObjectMeta> = inner.list(Some(&prefix)).try_collect().await?;

    let mut dirs: BTreeMap<String, bool> = BTreeMap::new();
    for obj in &objects {
        let path = obj.location.as_ref();
        let Some(dir) = snapshot_dir_of(path) else { continue };
        let is_complete = path.ends_with("/_COMPLETE");
        let entry = dirs.entry(dir).or_insert(false);
        *entry = *entry || is_complete;
    }

    let mut complete: Vec<(ParsedDir, String)> = dirs
        .into_iter()
        .filter(|(_, is_complete)| *is_complete)
        .filter_map(|(dir, _)| parse_dir(&dir).map(|p| (p, dir)))
        .collect();
    complete.sort();

    let to_delete = complete.len().saturating_sub(keep);
    let mut deleted = Vec::new();
    for (_, dir) in complete.into_iter().take(to_delete) {
        info!("retiring complete acs snapshot {dir}");
        let dir_path = ObjPath::from(dir.clone());
        let locations: Vec<ObjPath> = inner
            .list(Some(&dir_path))
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .map(|m| m.location)
            .collect();
        for location in locations {
            inner.delete(&location).await?;
        }
        deleted.push(dir);
    }
    Ok(deleted)
}

/// Strips the trailing filename, returning the `.../snapshot_id=...`
/// directory prefix.
fn snapshot_dir_of(path: &str) -> Option<String> {
    let idx = path.find("/snapshot_id=")?;
    let rest = &path[idx + 1..];
    let end = rest.find('/').unwrap_or(rest.len());
    Some(path[..idx + 1 + end].to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ParsedDir {
    year: i32,
    month: u32,
    day: u32,
    snapshot_id: String,
}

/// Parses `year=Y/month=Mo/day=D/snapshot_id=HHMMSS` segments out of a
/// directory path, wherever they fall, so sorting is numeric rather than
/// lexicographic (unpadded components would otherwise sort `9` after `10`).
fn parse_dir(dir: &str) -> Option<ParsedDir> {
    let mut year = None;
    let mut month = None;
    let mut day = None;
    let mut snapshot_id = None;
    for segment in dir.split('/') {
        if let Some(v) = segment.strip_prefix("year=") {
            year = v.parse().ok();
        } else if let Some(v) = segment.strip_prefix("month=") {
            month = v.parse().ok();
        } else if let Some(v) = segment.strip_prefix("day=") {
            day = v.parse().ok();
        } else if let Some(v) = segment.strip_prefix("snapshot_id=") {
            snapshot_id = Some(v.to_string());
        }
    }
    Some(ParsedDir {
        year: year?,
        month: month?,
        day: day?,
        snapshot_id: snapshot_id?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{AcsSnapshotConfig, AcsSnapshotWriter};
    use chrono::{TimeZone, Utc};
    use ledger_model::types::AcsContract;
    use object_store::memory::InMemory;
    use std::sync::Arc;

    fn contract(id: &str, snapshot_time: chrono::DateTime<Utc>) -> AcsContract {
        AcsContract {
            contract_id: id.to_string(),
            event_id: None,
            template_id: None,
            migration_id: 1,
            record_time: snapshot_time,
            snapshot_time,
            payload: None,
            raw: "{}".to_string(),
        }
    }

    async fn write_complete_snapshot(store: &BlobStore, dir: &tempfile::TempDir, snapshot_time: chrono::DateTime<Utc>) {
        let mut writer = AcsSnapshotWriter::new(
            store.clone(),
            AcsSnapshotConfig {
                migration_id: 1,
                snapshot_time,
                max_rows_per_file: 100,
                data_dir: dir.path().to_path_buf(),
                keep_raw: false,
            },
        );
        writer.write_rows(&[contract("c0", snapshot_time)]).await.unwrap();
        writer.finalize().await.unwrap();
    }

    #[tokio::test]
    async fn keeps_only_k_most_recent_complete_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(Arc::new(InMemory::new()), object_store::path::Path::from(""));
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        for h in 0..4 {
            write_complete_snapshot(&store, &dir, base + chrono::Duration::hours(h)).await;
        }

        let deleted = retain_recent_snapshots(&store, 1, 2).await.unwrap();
        assert_eq!(deleted.len(), 2);

        let remaining = store.list("acs/migration=1").await.unwrap();
        let remaining_markers = remaining.iter().filter(|o| o.location.as_ref().ends_with("_COMPLETE")).count();
        assert_eq!(remaining_markers, 2);
    }

    #[tokio::test]
    async fn never_deletes_incomplete_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(Arc::new(InMemory::new()), object_store::path::Path::from(""));
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        write_complete_snapshot(&store, &dir, base).await;

        // A second, in-progress snapshot with no _COMPLETE marker.
        let mut writer = AcsSnapshotWriter::new(
            store.clone(),
            AcsSnapshotConfig {
                migration_id: 1,
                snapshot_time: base + chrono::Duration::hours(1),
                max_rows_per_file: 100,
                data_dir: dir.path().to_path_buf(),
                keep_raw: false,
            },
        );
        writer.write_rows(&[contract("c1", base)]).await.unwrap();
        // Deliberately not finalized.

        let deleted = retain_recent_snapshots(&store, 1, 0).await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].contains("snapshot_id"));

        let remaining = store.list("acs/migration=1").await.unwrap();
        assert!(!remaining.is_empty(), "in-progress snapshot's files must survive retention");
    }
}
