//! C1 Partition Router.
//!
//! Pure functions computing the Hive-style partition path for a record.
//! Everything here operates in UTC; year/month/day are written as unpadded
//! decimal integers so downstream numeric partition inference works, while
//! `snapshot_id` is zero-padded because it is a string identifier, not a
//! number.

use crate::types::{PartitionKind, Source};
use chrono::{DateTime, Datelike, Timelike, Utc};

/// Computes `{source}/{kind}/migration={M}/year={Y}/month={Mo}/day={D}` for
/// ledger data. `timestamp` must be the record's *event time*
/// (`effective_at`/`record_time`), never wall-clock time.
pub fn ledger_partition_path(
    source: Source,
    kind: PartitionKind,
    migration_id: i64,
    timestamp: DateTime<Utc>,
) -> String {
    format!(
        "{}/{}/migration={migration_id}/year={}/month={}/day={}",
        source.as_str(),
        kind.as_str(),
        timestamp.year(),
        timestamp.month(),
        timestamp.day(),
    )
}

/// Computes `acs/migration={M}/year={Y}/month={Mo}/day={D}/snapshot_id={HHMMSS}`.
/// `snapshot_time` is the run time the snapshot was taken at, which also
/// determines its partition (ACS partitions are keyed by when the snapshot
/// ran, not by the ledger time of any one contract in it).
pub fn acs_partition_path(migration_id: i64, snapshot_time: DateTime<Utc>) -> String {
    format!(
        "acs/migration={migration_id}/year={}/month={}/day={}/snapshot_id={:02}{:02}{:02}",
        snapshot_time.year(),
        snapshot_time.month(),
        snapshot_time.day(),
        snapshot_time.hour(),
        snapshot_time.minute(),
        snapshot_time.second(),
    )
}

/// Returns the start-of-UTC-day for `timestamp`, the canonical value used to
/// test "same partition" equivalence (two timestamps on the same UTC day
/// always produce the same path).
pub fn utc_day_of(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc()
}
