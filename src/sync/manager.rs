//! Synchronizer - Orchestrates one sync cycle
//!
//! Cycle state machine:
//!
//! ```text
//! Idle -> AcquiringLock -+- denied  -> DownloadOnly -> Idle
//!                        +- granted -> CheckVersions -> Download -> Merge
//!                                      -> Backup -> Upload -> ReleaseLock -> Idle
//! ```
//!
//! Any failure after the lease is granted releases it before the Recovery
//! Controller runs. Every outcome is reported as a `CycleResult`; nothing
//! raises past `run_cycle`.
//!
//! Cycles are serialized per instance with a `tokio::sync::Mutex` gate and
//! each runs in its own task that holds the gate until the lease is released.
//! Cancellation (token or dropped caller) is honoured up to the Upload phase;
//! from there on the cycle runs to completion.

use super::backup::{BackupError, BackupManager};
use super::codec::{decode_snapshot, encode_snapshot, CodecError};
use super::history::HistoryManager;
use super::lease::{Lease, LeaseError, LockManager};
use super::merge::{MergeClass, MergeResolver, MergedRecord};
use super::models::{
    CatalogSnapshot, ConflictEntry, CycleReport, CycleResult, FailureKind, HealthStatus,
    SyncPhase, SyncState, TieBreak,
};
use super::recovery::{RecoveryController, RecoveryOutcome, RetryPolicy};
use super::version::{VersionError, VersionTracker};
use crate::db::{Database, DbError, StoredConflict};
use crate::remote::{RemoteError, RemoteObject, RemoteStore};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

/// Per-instance synchronizer settings
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub instance_id: String,

    /// Remote key prefix; the catalog lives at `<prefix>/catalog.json.gz`
    pub remote_prefix: String,

    pub lease_ttl: Duration,
    pub network_timeout: Duration,
    pub tie_break: TieBreak,
    pub retry: RetryPolicy,
    pub seed_path: Option<PathBuf>,

    /// Cycle history rows kept
    pub history_retention: usize,
}

impl SyncOptions {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            remote_prefix: "catalog".to_string(),
            lease_ttl: Duration::from_secs(120),
            network_timeout: Duration::from_secs(30),
            tie_break: TieBreak::default(),
            retry: RetryPolicy::default(),
            seed_path: None,
            history_retention: 500,
        }
    }

    pub fn catalog_key(&self) -> String {
        format!("{}/catalog.json.gz", self.remote_prefix)
    }

    pub fn lease_key(&self) -> String {
        format!("{}/lease.json", self.remote_prefix)
    }
}

/// Remote catalog as seen at CheckVersions
struct RemoteState {
    /// Baseline for the merge (`None`: no usable remote catalog)
    snapshot: Option<CatalogSnapshot>,

    /// Etag of the catalog object, if one exists
    etag: Option<String>,

    /// Raw bytes of a decodable catalog, kept for the remote backup
    raw: Option<Vec<u8>>,

    /// The catalog object exists but could not be decoded
    corrupt: bool,
}

/// Everything the commit phase needs, computed under the lease
struct PreparedCycle {
    merged: Vec<MergedRecord>,
    conflicts: Vec<ConflictEntry>,
    upload: Option<CatalogSnapshot>,
    remote_etag: Option<String>,
    report: CycleReport,
}

/// Sync orchestrator for one instance
#[derive(Clone)]
pub struct Synchronizer {
    options: Arc<SyncOptions>,
    db: Arc<Database>,
    store: Arc<dyn RemoteStore>,
    lock: Arc<LockManager>,
    resolver: Arc<MergeResolver>,
    backups: Arc<BackupManager>,
    recovery: Arc<RecoveryController>,
    history: Arc<HistoryManager>,
    state: Arc<RwLock<SyncState>>,
    gate: Arc<Mutex<()>>,
    shutdown: CancellationToken,
    current_cycle: Arc<StdMutex<Option<CancellationToken>>>,
}

impl Synchronizer {
    pub fn new(
        db: Arc<Database>,
        store: Arc<dyn RemoteStore>,
        backups: Arc<BackupManager>,
        options: SyncOptions,
    ) -> Self {
        let lock = LockManager::new(
            store.clone(),
            options.lease_key(),
            options.instance_id.clone(),
            options.network_timeout,
        );
        let recovery = RecoveryController::new(
            db.clone(),
            backups.clone(),
            store.clone(),
            options.catalog_key(),
        )
        .with_seed(options.seed_path.clone())
        .with_retry(options.retry, options.network_timeout);

        Self {
            resolver: Arc::new(MergeResolver::new(options.tie_break)),
            history: Arc::new(HistoryManager::new(db.clone())),
            lock: Arc::new(lock),
            recovery: Arc::new(recovery),
            options: Arc::new(options),
            db,
            store,
            backups,
            state: Arc::new(RwLock::new(SyncState::default())),
            gate: Arc::new(Mutex::new(())),
            shutdown: CancellationToken::new(),
            current_cycle: Arc::new(StdMutex::new(None)),
        }
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Run one cycle; dropped with `AlreadyRunning` if one is in progress
    pub async fn run_cycle(&self) -> CycleResult {
        let Ok(gate) = self.gate.clone().try_lock_owned() else {
            log::info!("Sync cycle already running, trigger dropped");
            return CycleResult::AlreadyRunning;
        };

        self.spawn_cycle(gate).await
    }

    /// Run one cycle, waiting for any cycle in progress to finish first
    pub async fn run_cycle_queued(&self) -> CycleResult {
        let gate = self.gate.clone().lock_owned().await;
        self.spawn_cycle(gate).await
    }

    /// The cycle runs in its own task holding the gate, so a dropped caller
    /// never leaves the lease behind. Dropping the caller cancels the cycle
    /// like `cancel_cycle` does.
    async fn spawn_cycle(&self, gate: OwnedMutexGuard<()>) -> CycleResult {
        let token = self.shutdown.child_token();
        let cancel_on_drop = token.clone().drop_guard();

        let this = self.clone();
        let task = tokio::spawn(async move {
            let _gate = gate;
            this.execute_cycle(token).await
        });

        let result = match task.await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Sync cycle task failed: {}", e);
                CycleResult::Failed {
                    kind: FailureKind::Internal,
                    reason: format!("sync cycle task failed: {}", e),
                    recovery: None,
                }
            }
        };

        cancel_on_drop.disarm();
        result
    }

    /// Resolves once no cycle of this instance is in progress
    pub async fn wait_idle(&self) {
        let _guard = self.gate.lock().await;
    }

    /// Cancelling this token cancels the current and all future cycles
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel the cycle in progress, if it has not reached Upload yet
    pub fn cancel_cycle(&self) {
        let current = self
            .current_cycle
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(token) = current.as_ref() {
            token.cancel();
        }
    }

    async fn execute_cycle(&self, token: CancellationToken) -> CycleResult {
        let started_at = Utc::now();
        self.set_current_cycle(Some(token.clone()));

        log::info!("Sync cycle started ({})", self.options.instance_id);
        let result = self.cycle(&token).await;

        self.set_current_cycle(None);
        self.finish(started_at, &result).await;
        result
    }

    async fn cycle(&self, token: &CancellationToken) -> CycleResult {
        self.set_phase(SyncPhase::AcquiringLock).await;

        let lease = match self.lock.acquire(self.options.lease_ttl).await {
            Ok(lease) => lease,
            Err(e) if e.is_denied() => {
                log::info!("Lease denied: {}; running download-only", e);
                return match self.download_only(e.holder().map(String::from)).await {
                    Ok(result) => result,
                    Err(e) => self.fail(e).await,
                };
            }
            Err(e) => return self.fail(e.into()).await,
        };

        let outcome = match self.prepare(&lease, token).await {
            // No cancellation checkpoints from here on
            Ok(prepared) => self.commit(lease, prepared).await,
            Err(e) => {
                self.set_phase(SyncPhase::ReleaseLock).await;
                self.release_quietly(&lease).await;
                Err(e)
            }
        };

        match outcome {
            Ok(report) => {
                log::info!(
                    "Sync cycle succeeded: {} published, {} conflicts, uploaded: {}",
                    report.records_published,
                    report.conflicts.len(),
                    report.uploaded
                );
                CycleResult::Success { report }
            }
            Err(e) => self.fail(e).await,
        }
    }

    // ========================================================================
    // Lease-holding path
    // ========================================================================

    /// CheckVersions, Download, Merge and Backup
    async fn prepare(
        &self,
        lease: &Lease,
        token: &CancellationToken,
    ) -> Result<PreparedCycle, SyncError> {
        checkpoint(token)?;
        self.set_phase(SyncPhase::CheckVersions).await;

        let remote = self.fetch_remote(true).await?;
        checkpoint(token)?;

        let local_version = self.db.schema_version()?;
        let mut report = CycleReport::default();

        if let Some(snapshot) = &remote.snapshot {
            let steps = VersionTracker::plan_migration(&local_version, &snapshot.schema_version)?;
            if !steps.is_empty() {
                report.migrations_applied = self.db.apply_migrations(&steps)?;
                log::info!("Applied {} local migrations", report.migrations_applied);
            }
        }

        self.set_phase(SyncPhase::Download).await;
        let problems = self.db.integrity_check()?;
        if !problems.is_empty() {
            return Err(SyncError::Integrity(problems.join("; ")));
        }
        let local = self.db.load_local_state()?;
        checkpoint(token)?;

        self.set_phase(SyncPhase::Merge).await;
        let remote_records = remote
            .snapshot
            .as_ref()
            .map(|s| s.records.as_slice())
            .unwrap_or_default();
        let output = self.resolver.merge(remote_records, &local);

        if !output.conflicts.is_empty() {
            log::warn!(
                "{} conflicting double writes detected (tie-break: {})",
                output.conflicts.len(),
                self.resolver.tie_break().as_str()
            );
        }

        let local_version = self.db.schema_version()?;
        let upload_version = VersionTracker::upload_version(
            &local_version,
            remote.snapshot.as_ref().map(|s| &s.schema_version),
        );
        let needs_upload = match &remote.snapshot {
            None => true,
            Some(snapshot) => {
                remote.corrupt
                    || output.changes_remote()
                    || upload_version != snapshot.schema_version
            }
        };
        let changes_local = !output.conflicts.is_empty()
            || output.records.iter().any(|m| m.class != MergeClass::Unchanged);

        self.set_phase(SyncPhase::Backup).await;
        checkpoint(token)?;

        if needs_upload || changes_local {
            self.backups.create_local_backup()?;
        }
        if needs_upload {
            if let Some(raw) = &remote.raw {
                self.bounded(self.backups.backup_remote(
                    self.store.as_ref(),
                    &self.options.remote_prefix,
                    raw,
                ))
                .await?;
            }
        }
        checkpoint(token)?;

        if lease.record.is_expired() {
            return Err(LeaseError::Expired.into());
        }

        let upload = needs_upload.then(|| CatalogSnapshot {
            schema_version: upload_version,
            generation: remote.snapshot.as_ref().map_or(0, |s| s.generation) + 1,
            updated_by: self.options.instance_id.clone(),
            updated_at: Utc::now(),
            records: output.snapshot_records(),
        });

        report.stats = output.stats;
        report.conflicts = output.conflicts.clone();
        report.remote_generation = remote.snapshot.as_ref().map_or(0, |s| s.generation);

        Ok(PreparedCycle {
            merged: output.records,
            conflicts: output.conflicts,
            upload,
            remote_etag: remote.etag,
            report,
        })
    }

    /// Upload, publish locally, release. Not cancellable.
    async fn commit(&self, lease: Lease, prepared: PreparedCycle) -> Result<CycleReport, SyncError> {
        let mut held = lease;
        let result = self.upload_and_publish(&mut held, prepared).await;

        self.set_phase(SyncPhase::ReleaseLock).await;
        self.release_quietly(&held).await;
        result
    }

    async fn upload_and_publish(
        &self,
        lease: &mut Lease,
        prepared: PreparedCycle,
    ) -> Result<CycleReport, SyncError> {
        let mut report = prepared.report;

        if let Some(snapshot) = &prepared.upload {
            self.set_phase(SyncPhase::Upload).await;

            *lease = self.lock.renew(lease, self.options.lease_ttl).await?;

            let bytes = encode_snapshot(snapshot)?;
            let key = self.options.catalog_key();
            let written = match &prepared.remote_etag {
                Some(etag) => {
                    self.bounded(self.store.overwrite_if_match(&key, bytes, etag))
                        .await
                }
                None => self.bounded(self.store.create_if_absent(&key, bytes)).await,
            };

            match written {
                Ok(_) => {}
                Err(RemoteError::PreconditionFailed(_)) => return Err(SyncError::RemoteChanged),
                Err(e) => return Err(e.into()),
            }

            report.uploaded = true;
            report.remote_generation = snapshot.generation;
            log::info!(
                "Uploaded catalog generation {} ({} records)",
                snapshot.generation,
                snapshot.records.len()
            );
        }

        let stats = self.db.publish(&prepared.merged, &prepared.conflicts)?;
        if stats.skipped > 0 {
            log::info!(
                "{} records changed locally during the cycle, left for the next one",
                stats.skipped
            );
        }

        report.records_published = stats.written;
        report.records_skipped = stats.skipped;
        Ok(report)
    }

    // ========================================================================
    // Download-only path
    // ========================================================================

    /// Apply remote fast-forwards for records without local changes. Never
    /// uploads and never records conflicts.
    async fn download_only(&self, holder: Option<String>) -> Result<CycleResult, SyncError> {
        self.set_phase(SyncPhase::DownloadOnly).await;

        let remote = self.fetch_remote(false).await?;
        let Some(snapshot) = remote.snapshot else {
            return Ok(CycleResult::SkippedBusy { holder, adopted: 0 });
        };

        VersionTracker::check(&self.db.schema_version()?, &snapshot.schema_version)?;

        let local = self.db.load_local_state()?;
        let adopted = self.resolver.fast_forward(&snapshot.records, &local);
        let stats = self.db.publish(&adopted, &[])?;

        if stats.written > 0 {
            log::info!("Adopted {} remote updates read-only", stats.written);
        }

        Ok(CycleResult::SkippedBusy {
            holder,
            adopted: stats.written,
        })
    }

    // ========================================================================
    // Remote access
    // ========================================================================

    /// Read and decode the remote catalog. Under the lease, an undecodable
    /// catalog is replaced by the newest decodable remote backup as baseline.
    async fn fetch_remote(&self, locked: bool) -> Result<RemoteState, SyncError> {
        let key = self.options.catalog_key();

        let Some(RemoteObject { data, etag }) = self.bounded(self.store.get(&key)).await? else {
            return Ok(RemoteState {
                snapshot: None,
                etag: None,
                raw: None,
                corrupt: false,
            });
        };

        match decode_snapshot(&data) {
            Ok(snapshot) => Ok(RemoteState {
                snapshot: Some(snapshot),
                etag: Some(etag),
                raw: Some(data),
                corrupt: false,
            }),
            Err(e) if locked => {
                log::warn!("Remote catalog unreadable ({}), falling back to remote backups", e);
                Ok(RemoteState {
                    snapshot: self.fallback_baseline().await,
                    etag: Some(etag),
                    raw: None,
                    corrupt: true,
                })
            }
            Err(e) => {
                log::warn!("Remote catalog unreadable ({}), nothing to adopt", e);
                Ok(RemoteState {
                    snapshot: None,
                    etag: Some(etag),
                    raw: None,
                    corrupt: true,
                })
            }
        }
    }

    async fn fallback_baseline(&self) -> Option<CatalogSnapshot> {
        let candidates = match self
            .bounded(
                self.backups
                    .list_remote_backups(self.store.as_ref(), &self.options.remote_prefix),
            )
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                log::warn!("Cannot list remote backups: {}", e);
                return None;
            }
        };

        for info in candidates {
            let object = match self.bounded(self.store.get(&info.key)).await {
                Ok(Some(object)) => object,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Cannot read remote backup {}: {}", info.key, e);
                    continue;
                }
            };

            match decode_snapshot(&object.data) {
                Ok(snapshot) => {
                    log::info!("Using remote backup {} as merge baseline", info.key);
                    return Some(snapshot);
                }
                Err(e) => log::warn!("Remote backup {} unreadable: {}", info.key, e),
            }
        }

        log::warn!("No readable remote backup; merging against an empty catalog");
        None
    }

    /// Remote I/O never outlives the network timeout
    async fn bounded<T, E: From<RemoteError>>(
        &self,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, E> {
        tokio::time::timeout(self.options.network_timeout, fut)
            .await
            .map_err(|_| {
                E::from(RemoteError::Network(format!(
                    "timed out after {:?}",
                    self.options.network_timeout
                )))
            })?
    }

    async fn release_quietly(&self, lease: &Lease) {
        if let Err(e) = self.lock.release(lease).await {
            // The lease expires on its own
            log::warn!("Failed to release lease: {}", e);
        }
    }

    // ========================================================================
    // Outcome bookkeeping
    // ========================================================================

    async fn fail(&self, error: SyncError) -> CycleResult {
        let kind = error.kind();
        self.set_phase(SyncPhase::Failed).await;

        match kind {
            FailureKind::LockDenied | FailureKind::Cancelled => {
                log::info!("Sync cycle stopped: {}", error)
            }
            FailureKind::VersionIncompatible => log::error!("Sync cycle aborted: {}", error),
            _ => log::warn!("Sync cycle failed ({}): {}", kind.as_str(), error),
        }

        let recovery = self.recovery.handle(kind).await;

        CycleResult::Failed {
            kind,
            reason: error.to_string(),
            recovery: match recovery {
                RecoveryOutcome::NoActionNeeded => None,
                other => Some(other),
            },
        }
    }

    async fn finish(&self, started_at: DateTime<Utc>, result: &CycleResult) {
        let pending_changes = self.db.count_pending().ok();
        let pending_conflicts = self.db.count_open_conflicts().ok();

        {
            let mut state = self.state.write().await;
            state.last_outcome = Some(result.as_str().to_string());

            match result {
                CycleResult::Failed { kind, recovery, .. } => {
                    state.phase = SyncPhase::Failed;
                    state.last_failure = Some(*kind);
                    state.consecutive_failures += 1;
                    match recovery {
                        Some(RecoveryOutcome::DegradedOffline { .. }) => state.offline = true,
                        Some(RecoveryOutcome::Retried { .. }) => state.offline = false,
                        _ => {}
                    }
                }
                _ => {
                    state.phase = SyncPhase::Idle;
                    state.last_failure = None;
                    state.consecutive_failures = 0;
                    state.offline = false;
                    if result.is_success() {
                        state.last_sync_at = Some(Utc::now());
                    }
                }
            }

            if let Some(n) = pending_changes {
                state.pending_changes = n;
            }
            if let Some(n) = pending_conflicts {
                state.pending_conflicts = n;
            }
        }

        if let Err(e) = self
            .history
            .record_cycle(&self.options.instance_id, started_at, result)
        {
            log::warn!("Failed to record sync history: {}", e);
        }
        if let Err(e) = self.history.enforce_retention(self.options.history_retention) {
            log::warn!("Failed to prune sync history: {}", e);
        }
    }

    async fn set_phase(&self, phase: SyncPhase) {
        log::debug!("Sync phase: {}", phase.as_str());
        self.state.write().await.phase = phase;
    }

    fn set_current_cycle(&self, token: Option<CancellationToken>) {
        *self
            .current_cycle
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = token;
    }

    // ========================================================================
    // Status & review
    // ========================================================================

    pub async fn state(&self) -> SyncState {
        self.state.read().await.clone()
    }

    pub async fn health(&self) -> HealthStatus {
        let state = self.state().await;

        HealthStatus {
            instance_id: self.options.instance_id.clone(),
            phase: state.phase,
            last_sync_at: state.last_sync_at,
            last_outcome: state.last_outcome,
            pending_conflicts: self
                .db
                .count_open_conflicts()
                .unwrap_or(state.pending_conflicts),
            pending_changes: self.db.count_pending().unwrap_or(state.pending_changes),
            offline: state.offline,
        }
    }

    pub fn list_conflicts(&self, include_dismissed: bool) -> Result<Vec<StoredConflict>, SyncError> {
        Ok(self.db.list_conflicts(include_dismissed)?)
    }

    pub fn dismiss_conflict(&self, id: i64) -> Result<(), SyncError> {
        Ok(self.db.dismiss_conflict(id)?)
    }

    /// Current remote lease holder, if any
    pub async fn lease_holder(&self) -> Result<Option<String>, SyncError> {
        Ok(self.lock.inspect().await?.map(|l| l.owner))
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backups
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }
}

fn checkpoint(token: &CancellationToken) -> Result<(), SyncError> {
    if token.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Sync cycle cancelled")]
    Cancelled,

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    #[error("Remote catalog changed while the lease was held")]
    RemoteChanged,

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Snapshot error: {0}")]
    Codec(#[from] CodecError),

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("Local store unhealthy: {0}")]
    Integrity(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Position in the failure taxonomy
    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::Cancelled => FailureKind::Cancelled,
            SyncError::Version(_) => FailureKind::VersionIncompatible,
            SyncError::Remote(e) => remote_kind(e),
            SyncError::Lease(LeaseError::Remote(e)) if e.is_network() => FailureKind::NetworkFailure,
            SyncError::Lease(e) if e.is_denied() => FailureKind::LockDenied,
            SyncError::Lease(LeaseError::InvalidTtl(_)) => FailureKind::Internal,
            SyncError::Lease(_) | SyncError::RemoteChanged => FailureKind::LeaseLost,
            SyncError::Database(_) | SyncError::Integrity(_) => FailureKind::IntegrityFailure,
            SyncError::Backup(BackupError::Remote(e)) => remote_kind(e),
            SyncError::Backup(BackupError::Database(_)) => FailureKind::IntegrityFailure,
            SyncError::Backup(_) | SyncError::Codec(_) | SyncError::Internal(_) => {
                FailureKind::Internal
            }
        }
    }
}

fn remote_kind(e: &RemoteError) -> FailureKind {
    match e {
        RemoteError::Network(_) | RemoteError::Io(_) => FailureKind::NetworkFailure,
        _ => FailureKind::Internal,
    }
}

// ============================================================================
// Tests
// ============================================================================
