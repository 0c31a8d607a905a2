//! Offline maintenance routines: the Reconciler (C9), Gap Recovery (C10)
//! and Partition Repair (C11). All three share the object-store scanning
//! in [`scan`] rather than each re-deriving file ranges their own way.

pub mod gaps;
pub mod reconciler;
pub mod repair;
pub mod scan;

pub use gaps::{Gap, GapRecoveryConfig, GapRecoveryReport, detect_gaps, recover_gaps};
pub use reconciler::{ReconcilerReport, reconcile};
pub use repair::{RepairAction, RepairPlan, execute_repair, plan_repair, verify_repair};
pub use scan::{PartitionFile, scan_partition_files};
