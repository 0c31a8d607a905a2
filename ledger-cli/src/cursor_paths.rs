//! Cursor file naming convention shared between `backfill`, which creates
//! one file per shard, and `reconcile`, which discovers them by scanning
//! `CURSOR_DIR`.

use std::path::{Path, PathBuf};

pub fn backfill_cursor_path(cursor_dir: &Path, migration_id: i64, synchronizer_id: &str, shard_index: u32) -> PathBuf {
    cursor_dir.join(format!("migration-{migration_id}-{synchronizer_id}-shard-{shard_index}.json"))
}

/// Fields recovered from a cursor filename matching
/// `migration-{M}-{synchronizer}-shard-{index}.json`.
pub struct ParsedCursorFilename {
    pub migration_id: i64,
    pub synchronizer_id: String,
    pub shard_index: u32,
}

/// Parses a cursor filename back into its components. Returns `None` for
/// any file that doesn't match the convention, so a cursor directory with
/// stray files is silently skipped rather than treated as an error.
pub fn parse_cursor_filename(filename: &str) -> Option<ParsedCursorFilename> {
    let stem = filename.strip_suffix(".json")?;
    let rest = stem.strip_prefix("migration-")?;
    let (migration_str, rest) = rest.split_once('-')?;
    let (synchronizer_id, shard_str) = rest.rsplit_once("-shard-")?;
    Some(ParsedCursorFilename {
        migration_id: migration_str.parse().ok()?,
        synchronizer_id: synchronizer_id.to_string(),
        shard_index: shard_str.parse().ok()?,
    })
}
