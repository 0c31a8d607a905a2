//! Shard Scheduler (C7): integer-arithmetic window splitting plus the
//! per-shard producer loop tying together the fetcher (`ledger-fetch`), the
//! cursor store (`ledger-cursor`) and the encode/upload pools
//! (`ledger-pipeline`).

pub mod scheduler;
pub mod window;

pub use scheduler::{ShardScheduler, ShardSchedulerConfig};
pub use window::shard_window;
