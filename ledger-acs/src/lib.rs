//! Snapshot Writer (C8): streams a full active-contract-set snapshot to the
//! object store as numbered Parquet files under a `_COMPLETE`-marked
//! partition, then retires older complete snapshots of the same migration.

pub mod retention;
pub mod writer;

pub use retention::{DEFAULT_KEEP, retain_recent_snapshots};
pub use writer::{AcsSnapshotConfig, AcsSnapshotWriter, SnapshotStats};
