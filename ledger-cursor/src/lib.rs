//! C5 Atomic Cursor Store.
//!
//! A cursor is the single point at which ingestion progress becomes
//! durable. It separates a *local-confirmed* commit (a file exists on this
//! machine's scratch disk) from a *remote-confirmed* commit (the same bytes
//! are durable in the object store), with [`AtomicCursorStore::confirm_gcs`]
//! as the barrier between the two. `resume_position` always returns the
//! remote-confirmed position, which is the only crash-safe place to resume
//! from: a process that crashes between the two commits must refetch the
//! gap rather than silently skip it.

use chrono::{DateTime, Utc};
use ledger_model::IngestError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Bump when the on-disk shape of [`Cursor`] changes in a way that requires
/// an explicit upgrade step. Mirrors the teacher's SQL-migration-version
/// idiom, generalized to a JSON file tag.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Durable per-shard progress record. One file per `(migration_id,
/// synchronizer_id, shard_index)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    pub schema_version: u32,
    pub migration_id: i64,
    pub synchronizer_id: String,
    pub shard_index: u32,
    pub shard_total: u32,

    /// Latest `record_time` for which a local file was written.
    pub last_before: Option<DateTime<Utc>>,
    /// Latest `record_time` whose file is confirmed durable in the object store.
    pub last_gcs_confirmed: Option<DateTime<Utc>>,

    pub total_updates: i64,
    pub total_events: i64,
    pub gcs_confirmed_updates: i64,
    pub gcs_confirmed_events: i64,

    pub min_time: DateTime<Utc>,
    pub max_time: DateTime<Utc>,

    /// Terminal flag: set only when both positions equal `max_time`.
    pub complete: bool,

    /// Mid-write diagnostics. Never a resume point.
    pub in_transaction: bool,
    pub pending_updates: i64,
    pub pending_events: i64,
    pub pending_before: Option<DateTime<Utc>>,

    /// Last fatal error observed by the owning shard, if any. Informational
    /// only; cleared on the next successful commit.
    pub error: Option<String>,
}

impl Cursor {
    pub fn new_empty(
        migration_id: i64,
        synchronizer_id: impl Into<String>,
        shard_index: u32,
        shard_total: u32,
        min_time: DateTime<Utc>,
        max_time: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            migration_id,
            synchronizer_id: synchronizer_id.into(),
            shard_index,
            shard_total,
            last_before: None,
            last_gcs_confirmed: None,
            total_updates: 0,
            total_events: 0,
            gcs_confirmed_updates: 0,
            gcs_confirmed_events: 0,
            min_time,
            max_time,
            complete: false,
            in_transaction: false,
            pending_updates: 0,
            pending_events: 0,
            pending_before: None,
            error: None,
        }
    }

    /// Checks invariants I1-I3. Called after every mutation; a violation is
    /// a programming error in this crate, not a data condition, so it
    /// panics rather than returning a `Result`.
    fn assert_invariants(&self) {
        if let (Some(gcs), Some(before)) = (self.last_gcs_confirmed, self.last_before) {
            assert!(gcs <= before, "I1 violated: last_gcs_confirmed > last_before");
        }
        assert!(
            self.gcs_confirmed_updates <= self.total_updates,
            "I2 violated: gcs_confirmed_updates > total_updates"
        );
        if self.complete {
            assert_eq!(self.last_before, Some(self.max_time), "I3 violated: last_before != max_time");
            assert_eq!(
                self.last_gcs_confirmed,
                Some(self.max_time),
                "I3 violated: last_gcs_confirmed != max_time"
            );
            assert_eq!(self.pending_updates, 0, "I3 violated: pending_updates != 0");
            assert_eq!(self.pending_events, 0, "I3 violated: pending_events != 0");
        }
    }
}

/// Owns the durable file for one cursor and enforces the transactional API
/// (I1-I4 at the boundary). Write protocol: serialize -> write `path.tmp`
/// -> rename to `path` (the rename is the commit point); the previous valid
/// content is preserved as `path.bak` before each overwrite.
pub struct AtomicCursorStore {
    path: PathBuf,
    cursor: Cursor,
}

impl AtomicCursorStore {
    /// Loads an existing cursor file, falling back to `.bak` if the primary
    /// fails to parse, or creates a fresh empty cursor if neither exists.
    pub fn open_or_create(
        path: impl Into<PathBuf>,
        migration_id: i64,
        synchronizer_id: &str,
        shard_index: u32,
        shard_total: u32,
        min_time: DateTime<Utc>,
        max_time: DateTime<Utc>,
    ) -> Result<Self, IngestError> {
        let path = path.into();
        if path.exists() {
            return Self::load(path);
        }
        let cursor = Cursor::new_empty(
            migration_id,
            synchronizer_id,
            shard_index,
            shard_total,
            min_time,
            max_time,
        );
        let mut store = Self { path, cursor };
        store.persist()?;
        Ok(store)
    }

    /// Loads a cursor file, promoting `.bak` on parse failure of the
    /// primary. Fails with [`IngestError::CursorCorruption`] if both are
    /// unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, IngestError> {
        let path = path.into();
        match Self::read_cursor(&path) {
            Ok(cursor) => Ok(Self { path, cursor }),
            Err(primary_err) => {
                warn!("cursor {} failed to parse ({primary_err}), trying .bak", path.display());
                let bak = bak_path(&path);
                match Self::read_cursor(&bak) {
                    Ok(cursor) => {
                        let mut store = Self { path, cursor };
                        store.persist()?;
                        Ok(store)
                    }
                    Err(bak_err) => Err(IngestError::CursorCorruption(format!(
                        "both {} and {} failed to parse: primary={primary_err}, backup={bak_err}",
                        path.display(),
                        bak.display()
                    ))),
                }
            }
        }
    }

    fn read_cursor(path: &Path) -> anyhow::Result<Cursor> {
        let bytes = fs::read(path)?;
        let mut cursor: Cursor = serde_json::from_slice(&bytes)?;
        if cursor.schema_version > CURRENT_SCHEMA_VERSION {
            anyhow::bail!(
                "cursor schema_version {} is newer than this binary supports ({CURRENT_SCHEMA_VERSION})",
                cursor.schema_version
            );
        }
        if cursor.schema_version < CURRENT_SCHEMA_VERSION {
            cursor.schema_version = CURRENT_SCHEMA_VERSION;
        }
        Ok(cursor)
    }

    /// Write-temp + rename + `.bak`. The rename is the commit point.
    fn persist(&mut self) -> Result<(), IngestError> {
        self.cursor.assert_invariants();
        let tmp = tmp_path(&self.path);
        let serialized = serde_json::to_vec_pretty(&self.cursor)
            .map_err(|e| IngestError::CursorCorruption(format!("serializing cursor: {e}")))?;
        fs::write(&tmp, &serialized)
            .map_err(|e| IngestError::CursorCorruption(format!("writing {}: {e}", tmp.display())))?;
        if self.path.exists() {
            fs::copy(&self.path, bak_path(&self.path))
                .map_err(|e| IngestError::CursorCorruption(format!("backing up cursor: {e}")))?;
        }
        fs::rename(&tmp, &self.path)
            .map_err(|e| IngestError::CursorCorruption(format!("renaming cursor into place: {e}")))?;
        Ok(())
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// The crash-safe resume point: the remote-confirmed position.
    pub fn resume_position(&self) -> Option<DateTime<Utc>> {
        self.cursor.last_gcs_confirmed
    }

    /// Debug-only accessor for the local (not yet remote-confirmed)
    /// position. Never use this to decide what to refetch.
    pub fn debug_local_position(&self) -> Option<DateTime<Utc>> {
        self.cursor.last_before
    }

    pub fn is_complete(&self) -> bool {
        self.cursor.complete
    }

    /// Declares pending data ahead of a local write. Fails if a transaction
    /// is already open.
    pub fn begin(&mut self, updates: i64, events: i64, before_ts: DateTime<Utc>) -> Result<(), IngestError> {
        if self.cursor.in_transaction {
            return Err(IngestError::CursorCorruption(
                "begin() called while a transaction is already open".into(),
            ));
        }
        self.cursor.in_transaction = true;
        self.cursor.pending_updates = updates;
        self.cursor.pending_events = events;
        self.cursor.pending_before = Some(before_ts);
        self.persist()
    }

    /// Accumulates more pending data within an open transaction (used when
    /// a single fetch page spans more than one commit-sized chunk).
    pub fn add_pending(&mut self, updates: i64, events: i64, before_ts: DateTime<Utc>) -> Result<(), IngestError> {
        if !self.cursor.in_transaction {
            return Err(IngestError::CursorCorruption(
                "add_pending() called with no open transaction".into(),
            ));
        }
        self.cursor.pending_updates += updates;
        self.cursor.pending_events += events;
        self.cursor.pending_before = Some(before_ts);
        self.persist()
    }

    /// Moves pending counters into `total_*` and advances `last_before`.
    /// Must only be called after the caller has confirmed the corresponding
    /// file exists locally (C3's encode step).
    pub fn commit(&mut self) -> Result<(), IngestError> {
        if !self.cursor.in_transaction {
            return Err(IngestError::CursorCorruption("commit() with no open transaction".into()));
        }
        self.cursor.total_updates += self.cursor.pending_updates;
        self.cursor.total_events += self.cursor.pending_events;
        self.cursor.last_before = self.cursor.pending_before.or(self.cursor.last_before);
        self.cursor.pending_updates = 0;
        self.cursor.pending_events = 0;
        self.cursor.pending_before = None;
        self.cursor.in_transaction = false;
        self.cursor.error = None;
        self.persist()?;
        debug!(
            "cursor {} commit: total_updates={} total_events={} last_before={:?}",
            self.path.display(),
            self.cursor.total_updates,
            self.cursor.total_events,
            self.cursor.last_before
        );
        Ok(())
    }

    /// Restores the pre-`begin` state: drops the pending fields without
    /// touching `total_*`.
    pub fn rollback(&mut self) -> Result<(), IngestError> {
        if !self.cursor.in_transaction {
            return Err(IngestError::CursorCorruption("rollback() with no open transaction".into()));
        }
        self.cursor.pending_updates = 0;
        self.cursor.pending_events = 0;
        self.cursor.pending_before = None;
        self.cursor.in_transaction = false;
        self.persist()
    }

    /// Advances `last_gcs_confirmed`/`gcs_confirmed_*` after C4's
    /// `drain()` returns. With no arguments, catches up to the current
    /// local totals (the usual case: drain() guarantees every locally
    /// committed file through `last_before` is now durable).
    pub fn confirm_gcs(
        &mut self,
        ts: Option<DateTime<Utc>>,
        updates: Option<i64>,
        events: Option<i64>,
    ) -> Result<(), IngestError> {
        let new_ts = ts.or(self.cursor.last_before);
        let new_updates = updates.unwrap_or(self.cursor.total_updates);
        let new_events = events.unwrap_or(self.cursor.total_events);

        if let (Some(ts), Some(before)) = (new_ts, self.cursor.last_before)
            && ts > before
        {
            return Err(IngestError::CursorCorruption(format!(
                "confirm_gcs({ts}) would exceed last_before ({before})"
            )));
        }
        if new_updates > self.cursor.total_updates || new_events > self.cursor.total_events {
            return Err(IngestError::CursorCorruption(
                "confirm_gcs counts would exceed total_* counters".into(),
            ));
        }

        self.cursor.last_gcs_confirmed = new_ts;
        self.cursor.gcs_confirmed_updates = new_updates;
        self.cursor.gcs_confirmed_events = new_events;
        self.persist()
    }

    /// Marks the shard's window exhausted. Refuses if a transaction is open
    /// or pending counters are non-zero. Sets both positions to `max_time`
    /// so I3 holds without requiring the caller to have seen a record
    /// exactly at the boundary (the common case for sparse historical
    /// windows, where the last page before completion is simply empty).
    pub fn mark_complete(&mut self) -> Result<(), IngestError> {
        if self.cursor.in_transaction || self.cursor.pending_updates != 0 || self.cursor.pending_events != 0 {
            return Err(IngestError::CursorCorruption(
                "mark_complete() called with pending data outstanding".into(),
            ));
        }
        self.cursor.last_before = Some(self.cursor.max_time);
        self.cursor.last_gcs_confirmed = Some(self.cursor.max_time);
        self.cursor.complete = true;
        self.persist()
    }

    /// Records a fatal error on the cursor without advancing any position,
    /// for operator visibility after a shard aborts.
    pub fn set_error(&mut self, message: impl Into<String>) -> Result<(), IngestError> {
        self.cursor.error = Some(message.into());
        self.persist()
    }

    /// Startup-safety rewrite used by the Reconciler (C9) when a scan of the
    /// object store finds `last_before` to be ahead of what's actually
    /// durable there. Rewinds both positions to `store_ts` (the position the
    /// store scan confirms) and discards any `total_*` counts beyond the
    /// last gcs-confirmed counts, since those were the only counts this
    /// cursor ever recorded as actually durable.
    pub fn reconcile_to_store(&mut self, store_ts: DateTime<Utc>) -> Result<(), IngestError> {
        if self.cursor.in_transaction {
            return Err(IngestError::CursorCorruption(
                "reconcile_to_store() called while a transaction is open".into(),
            ));
        }
        let store_ts = store_ts.min(self.cursor.max_time);
        self.cursor.last_before = Some(store_ts);
        self.cursor.last_gcs_confirmed = Some(store_ts);
        self.cursor.total_updates = self.cursor.gcs_confirmed_updates;
        self.cursor.total_events = self.cursor.gcs_confirmed_events;
        self.cursor.pending_updates = 0;
        self.cursor.pending_events = 0;
        self.cursor.pending_before = None;
        self.cursor.complete = store_ts >= self.cursor.max_time;
        self.cursor.error = None;
        self.persist()?;
        warn!(
            "cursor {} reconciled to store position {store_ts}: total_updates={} total_events={}",
            self.path.display(),
            self.cursor.total_updates,
            self.cursor.total_events
        );
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

fn bak_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".bak");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap(),
        )
    }

    #[test]
    fn fresh_cursor_has_no_resume_position() {
        let dir = tempfile::tempdir().unwrap();
        let (min, max) = window();
        let store = AtomicCursorStore::open_or_create(dir.path().join("c0.json"), 1, "sync-a", 0, 4, min, max).unwrap();
        assert_eq!(store.resume_position(), None);
        assert!(!store.is_complete());
    }

    #[test]
    fn commit_then_crash_before_confirm_gcs_keeps_resume_at_old_position() {
        let dir = tempfile::tempdir().unwrap();
        let (min, max) = window();
        let path = dir.path().join("c0.json");
        let t0 = min;
        let t1 = min + chrono::Duration::minutes(10);

        let mut store = AtomicCursorStore::open_or_create(path.clone(), 1, "sync-a", 0, 4, min, max).unwrap();
        store.begin(1000, 5000, t1).unwrap();
        store.commit().unwrap();
        assert_eq!(store.debug_local_position(), Some(t1));
        // Simulate the upload failing entirely: confirm_gcs is never called.
        assert_eq!(store.resume_position(), None);
        drop(store);

        // Restart: resume_position must still be the pre-commit position.
        let reopened = AtomicCursorStore::load(path).unwrap();
        assert_eq!(reopened.resume_position(), None);
        assert_eq!(reopened.debug_local_position(), Some(t1));
        let _ = t0;
    }

    #[test]
    fn confirm_gcs_catches_up_to_local_totals_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let (min, max) = window();
        let t1 = min + chrono::Duration::minutes(10);
        let mut store =
            AtomicCursorStore::open_or_create(dir.path().join("c0.json"), 1, "sync-a", 0, 4, min, max).unwrap();
        store.begin(10, 50, t1).unwrap();
        store.commit().unwrap();
        store.confirm_gcs(None, None, None).unwrap();
        assert_eq!(store.resume_position(), Some(t1));
        assert_eq!(store.cursor().gcs_confirmed_updates, 10);
    }

    #[test]
    fn rollback_discards_pending_without_touching_totals() {
        let dir = tempfile::tempdir().unwrap();
        let (min, max) = window();
        let t1 = min + chrono::Duration::minutes(5);
        let mut store =
            AtomicCursorStore::open_or_create(dir.path().join("c0.json"), 1, "sync-a", 0, 4, min, max).unwrap();
        store.begin(3, 9, t1).unwrap();
        store.rollback().unwrap();
        assert_eq!(store.cursor().total_updates, 0);
        assert_eq!(store.cursor().pending_updates, 0);
        assert!(!store.cursor().in_transaction);
    }

    #[test]
    fn mark_complete_refuses_with_pending_data() {
        let dir = tempfile::tempdir().unwrap();
        let (min, max) = window();
        let mut store =
            AtomicCursorStore::open_or_create(dir.path().join("c0.json"), 1, "sync-a", 0, 4, min, max).unwrap();
        store.begin(1, 1, min).unwrap();
        assert!(store.mark_complete().is_err());
    }

    #[test]
    fn mark_complete_sets_both_positions_to_max_time() {
        let dir = tempfile::tempdir().unwrap();
        let (min, max) = window();
        let mut store =
            AtomicCursorStore::open_or_create(dir.path().join("c0.json"), 1, "sync-a", 0, 4, min, max).unwrap();
        store.mark_complete().unwrap();
        assert!(store.is_complete());
        assert_eq!(store.cursor().last_before, Some(max));
        assert_eq!(store.cursor().last_gcs_confirmed, Some(max));
    }

    #[test]
    fn corrupt_primary_falls_back_to_bak() {
        let dir = tempfile::tempdir().unwrap();
        let (min, max) = window();
        let path = dir.path().join("c0.json");
        let t1 = min + chrono::Duration::minutes(1);
        let t2 = min + chrono::Duration::minutes(2);
        {
            let mut store = AtomicCursorStore::open_or_create(path.clone(), 1, "sync-a", 0, 4, min, max).unwrap();
            store.begin(1, 1, t1).unwrap();
            store.commit().unwrap();
            // After this second commit, `.bak` holds the state right after
            // the first commit (total_updates=1) and the primary holds the
            // state after the second (total_updates=2).
            store.begin(1, 1, t2).unwrap();
            store.commit().unwrap();
        }
        fs::write(&path, b"{not json").unwrap();
        let recovered = AtomicCursorStore::load(path).unwrap();
        assert_eq!(recovered.cursor().total_updates, 1);
    }

    #[test]
    fn reconcile_to_store_discards_unconfirmed_totals() {
        let dir = tempfile::tempdir().unwrap();
        let (min, max) = window();
        let t1 = min + chrono::Duration::minutes(10);
        let t2 = min + chrono::Duration::minutes(20);
        let mut store =
            AtomicCursorStore::open_or_create(dir.path().join("c0.json"), 1, "sync-a", 0, 4, min, max).unwrap();
        store.begin(10, 50, t1).unwrap();
        store.commit().unwrap();
        store.confirm_gcs(None, None, None).unwrap();
        // A further commit advances local state but is never confirmed durable.
        store.begin(5, 20, t2).unwrap();
        store.commit().unwrap();
        assert_eq!(store.cursor().total_updates, 15);

        store.reconcile_to_store(t1).unwrap();
        assert_eq!(store.cursor().last_before, Some(t1));
        assert_eq!(store.cursor().last_gcs_confirmed, Some(t1));
        assert_eq!(store.cursor().total_updates, 10);
        assert_eq!(store.cursor().total_events, 50);
        assert!(!store.is_complete());
    }

    #[test]
    fn reconcile_to_store_at_max_time_marks_complete() {
        let dir = tempfile::tempdir().unwrap();
        let (min, max) = window();
        let mut store =
            AtomicCursorStore::open_or_create(dir.path().join("c0.json"), 1, "sync-a", 0, 4, min, max).unwrap();
        store.reconcile_to_store(max).unwrap();
        assert!(store.is_complete());
    }

    #[test]
    fn confirm_gcs_rejects_exceeding_last_before() {
        let dir = tempfile::tempdir().unwrap();
        let (min, max) = window();
        let mut store =
            AtomicCursorStore::open_or_create(dir.path().join("c0.json"), 1, "sync-a", 0, 4, min, max).unwrap();
        let beyond = max + chrono::Duration::hours(1);
        assert!(store.confirm_gcs(Some(beyond), None, None).is_err());
    }
}
