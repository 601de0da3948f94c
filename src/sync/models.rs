//! Sync Data Models - Shared Structures
//!
//! Defines all data structures exchanged between the sync components.
//!
//! Data Categories:
//! - VersionTriple: Schema version of a store (local or remote)
//! - CatalogRecord: A tool or function entry of the shared catalog
//! - LeaseRecord: The remote lease object body
//! - CatalogSnapshot: The decoded remote catalog
//! - SyncState / HealthStatus: Process-local cycle bookkeeping
//! - CycleResult: Outcome of one sync cycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::recovery::RecoveryOutcome;

// ============================================================================
// Schema Version
// ============================================================================

/// Schema version triple, ordered lexicographically (major, minor, patch)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionTriple {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl VersionTriple {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Two versions are compatible iff their major components match
    pub fn is_compatible_with(&self, other: &VersionTriple) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for VersionTriple {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(format!("Invalid version: {}", s));
        }

        let parse = |p: &str| p.parse::<u32>().map_err(|_| format!("Invalid version: {}", s));
        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

// ============================================================================
// Catalog Records
// ============================================================================

/// Catalog entry category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Tool,
    Function,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Tool => "tool",
            RecordKind::Function => "function",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "tool" => Ok(RecordKind::Tool),
            "function" => Ok(RecordKind::Function),
            _ => Err(format!("Invalid record kind: {}", s)),
        }
    }
}

/// A single catalog record (tool or reusable function)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    /// Unique identifier across the catalog
    pub id: String,

    pub kind: RecordKind,

    /// Record payload (tool definition, function body, ...)
    pub content: serde_json::Value,

    pub author: String,

    /// Monotonic per-record counter, incremented on every local mutation
    pub version: i64,

    pub updated_at: DateTime<Utc>,
}

impl CatalogRecord {
    /// Whether both records carry the same payload, ignoring version and timestamp
    pub fn same_payload(&self, other: &CatalogRecord) -> bool {
        self.kind == other.kind && self.author == other.author && self.content == other.content
    }
}

/// A record as held by the local store, with its sync bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    pub record: CatalogRecord,

    /// Version last agreed with the remote copy (the common ancestor)
    pub base_version: Option<i64>,

    /// Local mutation not yet pushed
    pub dirty: bool,
}

impl LocalRecord {
    /// A record as it looks right after a successful sync
    pub fn synced(record: CatalogRecord) -> Self {
        let base_version = Some(record.version);
        Self {
            record,
            base_version,
            dirty: false,
        }
    }

    /// A record mutated locally since the given ancestor version
    pub fn modified(record: CatalogRecord, base_version: Option<i64>) -> Self {
        Self {
            record,
            base_version,
            dirty: true,
        }
    }
}

/// Input for a local catalog mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRecord {
    pub id: String,
    pub kind: RecordKind,
    pub content: serde_json::Value,
    pub author: String,
}

// ============================================================================
// Remote Catalog
// ============================================================================

/// Decoded remote catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub schema_version: VersionTriple,

    /// Incremented on every successful upload
    pub generation: u64,

    /// Instance that uploaded this generation
    pub updated_by: String,

    pub updated_at: DateTime<Utc>,

    pub records: Vec<CatalogRecord>,
}

// ============================================================================
// Lease
// ============================================================================

/// Body of the remote lease object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

// ============================================================================
// Conflicts
// ============================================================================

/// Tie-break policy for true double writes
///
/// The conflict is recorded whichever side wins; this only decides the value
/// kept in the merged catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Keep the already-uploaded remote value
    #[default]
    RemoteWins,

    /// Keep the local value
    LocalWins,

    /// Keep whichever variant has the later `updated_at` (remote on ties)
    NewestTimestamp,
}

impl TieBreak {
    pub fn as_str(&self) -> &'static str {
        match self {
            TieBreak::RemoteWins => "remote_wins",
            TieBreak::LocalWins => "local_wins",
            TieBreak::NewestTimestamp => "newest_timestamp",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "remote_wins" => Ok(TieBreak::RemoteWins),
            "local_wins" => Ok(TieBreak::LocalWins),
            "newest_timestamp" => Ok(TieBreak::NewestTimestamp),
            _ => Err(format!("Invalid tie-break policy: {}", s)),
        }
    }
}

/// Which variant ended up in the merged catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictWinner {
    Local,
    Remote,
}

impl ConflictWinner {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictWinner::Local => "local",
            ConflictWinner::Remote => "remote",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "local" => Ok(ConflictWinner::Local),
            "remote" => Ok(ConflictWinner::Remote),
            _ => Err(format!("Invalid conflict winner: {}", s)),
        }
    }
}

/// A true double write detected during merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub record_id: String,
    pub base_version: Option<i64>,
    pub local: CatalogRecord,
    pub remote: CatalogRecord,
    pub winner: ConflictWinner,
    pub detected_at: DateTime<Utc>,
}

// ============================================================================
// Cycle State & Outcome
// ============================================================================

/// Failure taxonomy used by the synchronizer and the recovery controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    LockDenied,
    VersionIncompatible,
    NetworkFailure,
    IntegrityFailure,
    LeaseLost,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::LockDenied => "lock_denied",
            FailureKind::VersionIncompatible => "version_incompatible",
            FailureKind::NetworkFailure => "network_failure",
            FailureKind::IntegrityFailure => "integrity_failure",
            FailureKind::LeaseLost => "lease_lost",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }
}

/// Cycle state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    AcquiringLock,
    DownloadOnly,
    CheckVersions,
    Download,
    Merge,
    Backup,
    Upload,
    ReleaseLock,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::AcquiringLock => "acquiring_lock",
            SyncPhase::DownloadOnly => "download_only",
            SyncPhase::CheckVersions => "check_versions",
            SyncPhase::Download => "download",
            SyncPhase::Merge => "merge",
            SyncPhase::Backup => "backup",
            SyncPhase::Upload => "upload",
            SyncPhase::ReleaseLock => "release_lock",
            SyncPhase::Failed => "failed",
        }
    }
}

/// Per-class counts produced by a merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub unchanged: usize,
    pub remote_only: usize,
    pub local_only: usize,
    pub fast_forward_remote: usize,
    pub fast_forward_local: usize,
    pub conflicts: usize,
}

/// Summary of a completed (lease-holding) cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleReport {
    pub stats: MergeStats,
    pub conflicts: Vec<ConflictEntry>,
    pub records_published: usize,
    pub records_skipped: usize,
    pub uploaded: bool,
    pub remote_generation: u64,
    pub migrations_applied: usize,
}

/// Outcome of `Synchronizer::run_cycle`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleResult {
    /// Full cycle completed under the lease
    Success { report: CycleReport },

    /// Lease held elsewhere; remote fast-forwards were applied read-only
    SkippedBusy {
        holder: Option<String>,
        adopted: usize,
    },

    Failed {
        kind: FailureKind,
        reason: String,
        recovery: Option<RecoveryOutcome>,
    },

    /// Another cycle of this instance was in progress; trigger dropped
    AlreadyRunning,
}

impl CycleResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleResult::Success { .. } => "success",
            CycleResult::SkippedBusy { .. } => "skipped_busy",
            CycleResult::Failed { .. } => "failed",
            CycleResult::AlreadyRunning => "already_running",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CycleResult::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            CycleResult::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn conflict_count(&self) -> usize {
        match self {
            CycleResult::Success { report } => report.conflicts.len(),
            _ => 0,
        }
    }
}

/// Process-local sync state (reset at process start, never persisted)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub phase: SyncPhase,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    pub last_failure: Option<FailureKind>,
    pub pending_changes: usize,
    pub pending_conflicts: usize,
    pub offline: bool,
    pub consecutive_failures: u32,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            last_sync_at: None,
            last_outcome: None,
            last_failure: None,
            pending_changes: 0,
            pending_conflicts: 0,
            offline: false,
            consecutive_failures: 0,
        }
    }
}

/// Health/status view for observability tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub instance_id: String,
    pub phase: SyncPhase,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    pub pending_conflicts: usize,
    pub pending_changes: usize,
    pub offline: bool,
}

// ============================================================================
// Tests
// ============================================================================
