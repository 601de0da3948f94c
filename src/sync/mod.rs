//! Sync Module - Shared catalog synchronization
//!
//! Keeps each instance's local catalog store consistent with the shared
//! remote copy:
//! - Lease: at most one instance reconciles and uploads at a time
//! - Versioning: schema compatibility check and local migrations
//! - Merge: per-record three-way merge with a conflict side log
//! - Backup/Recovery: snapshots before overwrites, restore or rebuild on failure
//!
//! Architecture:
//! - `Synchronizer` drives the cycle state machine
//! - `BackgroundScheduler` triggers it periodically
//! - Every cycle outcome lands in the history table

pub mod backup;
pub mod codec;
pub mod history;
pub mod lease;
pub mod manager;
pub mod merge;
pub mod models;
pub mod recovery;
pub mod scheduler;
pub mod version;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use models::{
    CatalogRecord, CatalogSnapshot, ConflictEntry, ConflictWinner, CycleReport, CycleResult,
    FailureKind, HealthStatus, LeaseRecord, LocalRecord, MergeStats, NewRecord, RecordKind,
    SyncPhase, SyncState, TieBreak, VersionTriple,
};

pub use backup::{BackupError, BackupKind, BackupManager, BackupSnapshot};
pub use codec::{decode_snapshot, encode_snapshot, CodecError};
pub use history::{CycleRecord, HistoryError, HistoryManager, HistoryStats};
pub use lease::{Lease, LeaseError, LockManager};
pub use manager::{SyncError, SyncOptions, Synchronizer};
pub use merge::{MergeClass, MergeOutput, MergeResolver, MergedRecord};
pub use recovery::{load_seed, RecoveryController, RecoveryOutcome, RetryPolicy};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
pub use version::{Migration, VersionError, VersionTracker, CURRENT_SCHEMA, MIGRATIONS};
