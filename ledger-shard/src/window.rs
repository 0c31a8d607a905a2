//! Pure integer-arithmetic sub-window computation for C7.
//!
//! Floating point would drift at the boundaries once `shard_total` doesn't
//! divide the window evenly; every bound here is computed from millisecond
//! counts with truncating (== flooring, since all operands are
//! non-negative) integer division instead.

use chrono::{DateTime, Utc};

/// Computes shard `shard_index`'s half-open sub-window `[shard_min,
/// shard_max)` of `[min, max]`. Shard 0 owns the latest (most recent) time
/// range; higher indices own progressively earlier ranges. Adjacent shards
/// share a boundary instant, which belongs to the earlier-index (later-time)
/// shard only -- callers enforce this by treating `shard_min` as an
/// inclusive lower bound (`at_or_after`) and `shard_max` as an exclusive
/// upper bound (`before`), exactly as the fetcher's pagination contract
/// already does.
pub fn shard_window(
    min: DateTime<Utc>,
    max: DateTime<Utc>,
    shard_index: u32,
    shard_total: u32,
) -> (DateTime<Utc>, DateTime<Utc>) {
    assert!(shard_total > 0, "shard_total must be positive");
    assert!(shard_index < shard_total, "shard_index must be < shard_total");
    assert!(min <= max, "min must not be after max");

    let total_ms = (max - min).num_milliseconds();
    let n = shard_total as i64;
    let i = shard_index as i64;

    let max_ms = max.timestamp_millis();
    let shard_max_ms = max_ms - (i * total_ms) / n;
    let shard_min_ms = max_ms - ((i + 1) * total_ms) / n;

    (
        DateTime::from_timestamp_millis(shard_min_ms).expect("in-range timestamp"),
        DateTime::from_timestamp_millis(shard_max_ms).expect("in-range timestamp"),
    )
}
