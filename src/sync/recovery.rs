//! Recovery Controller - Escalating failure handling
//!
//! Escalation:
//! 1. integrity failure: restore the newest local backup that verifies
//! 2. network failure: probe the remote with exponential backoff, otherwise
//!    enter degraded offline mode (local store keeps serving reads)
//! 3. restore impossible: rebuild the catalog from seed definitions (data loss)
//!
//! `handle` never returns an error; every path ends in a `RecoveryOutcome`.

use super::backup::BackupManager;
use super::models::{FailureKind, NewRecord};
use crate::db::Database;
use crate::remote::RemoteStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// What the controller did about a failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Remote reachable again after `attempts` probes
    Retried { attempts: u32 },

    /// Remote still unreachable; uploads are skipped until a cycle reaches it
    DegradedOffline { attempts: u32 },

    /// Local store restored from this backup
    Restored { backup: String },

    /// Local catalog recreated from seed definitions
    RebuiltFromSeed { records: usize },

    /// Nothing to repair for this failure kind
    NoActionNeeded,

    /// Every step failed; the instance should be treated as read-only
    Unrecoverable { reason: String },
}

impl RecoveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryOutcome::Retried { .. } => "retried",
            RecoveryOutcome::DegradedOffline { .. } => "degraded_offline",
            RecoveryOutcome::Restored { .. } => "restored",
            RecoveryOutcome::RebuiltFromSeed { .. } => "rebuilt_from_seed",
            RecoveryOutcome::NoActionNeeded => "no_action_needed",
            RecoveryOutcome::Unrecoverable { .. } => "unrecoverable",
        }
    }
}

/// Exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("Failed to read seed file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid seed file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Seed definitions: a JSON array of records
pub fn load_seed(path: &Path) -> Result<Vec<NewRecord>, SeedError> {
    let raw = std::fs::read(path).map_err(|source| SeedError::Read {
        path: path.display().to_string(),
        source,
    })?;

    serde_json::from_slice(&raw).map_err(|source| SeedError::Parse {
        path: path.display().to_string(),
        source,
    })
}

pub struct RecoveryController {
    db: Arc<Database>,
    backups: Arc<BackupManager>,
    store: Arc<dyn RemoteStore>,

    /// Object read to test remote reachability
    probe_key: String,

    seed_path: Option<PathBuf>,
    retry: RetryPolicy,
    network_timeout: Duration,
}

impl RecoveryController {
    pub fn new(
        db: Arc<Database>,
        backups: Arc<BackupManager>,
        store: Arc<dyn RemoteStore>,
        probe_key: impl Into<String>,
    ) -> Self {
        Self {
            db,
            backups,
            store,
            probe_key: probe_key.into(),
            seed_path: None,
            retry: RetryPolicy::default(),
            network_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_seed(mut self, seed_path: Option<PathBuf>) -> Self {
        self.seed_path = seed_path;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy, network_timeout: Duration) -> Self {
        self.retry = retry;
        self.network_timeout = network_timeout;
        self
    }

    pub async fn handle(&self, failure: FailureKind) -> RecoveryOutcome {
        let outcome = match failure {
            FailureKind::IntegrityFailure => self.recover_integrity(),
            FailureKind::NetworkFailure => self.probe_remote().await,
            FailureKind::Internal => match self.backups.check_integrity() {
                Ok(problems) if problems.is_empty() => RecoveryOutcome::NoActionNeeded,
                _ => self.recover_integrity(),
            },
            FailureKind::LockDenied
            | FailureKind::VersionIncompatible
            | FailureKind::LeaseLost
            | FailureKind::Cancelled => RecoveryOutcome::NoActionNeeded,
        };

        if outcome != RecoveryOutcome::NoActionNeeded {
            log::info!(
                "Recovery for {}: {}",
                failure.as_str(),
                outcome.as_str()
            );
        }
        outcome
    }

    /// Restore the newest good backup, falling back to a seed rebuild
    fn recover_integrity(&self) -> RecoveryOutcome {
        match self.backups.check_integrity() {
            Ok(problems) if problems.is_empty() => {
                log::info!("Integrity check passed, nothing to restore");
                return RecoveryOutcome::NoActionNeeded;
            }
            Ok(problems) => log::warn!("Local store unhealthy: {}", problems.join("; ")),
            Err(e) => log::warn!("Integrity check failed to run: {}", e),
        }

        match self.backups.restore_latest() {
            Ok(backup) => RecoveryOutcome::Restored {
                backup: backup.location,
            },
            Err(e) => {
                log::warn!("Restore from backup failed: {}", e);
                self.rebuild_from_seed()
            }
        }
    }

    fn rebuild_from_seed(&self) -> RecoveryOutcome {
        let seeds = match &self.seed_path {
            Some(path) => match load_seed(path) {
                Ok(seeds) => seeds,
                Err(e) => {
                    log::error!("Cannot rebuild local catalog: {}", e);
                    return RecoveryOutcome::Unrecoverable {
                        reason: e.to_string(),
                    };
                }
            },
            None => Vec::new(),
        };

        log::error!(
            "Rebuilding local catalog from {} seed records; unsynced local changes are lost",
            seeds.len()
        );

        match self.db.rebuild_from_seed(&seeds) {
            Ok(records) => RecoveryOutcome::RebuiltFromSeed { records },
            Err(e) => {
                log::error!("Seed rebuild failed: {}", e);
                RecoveryOutcome::Unrecoverable {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Probe the remote with backoff
    async fn probe_remote(&self) -> RecoveryOutcome {
        for attempt in 0..self.retry.max_attempts {
            tokio::time::sleep(self.retry.delay_for(attempt)).await;

            match tokio::time::timeout(self.network_timeout, self.store.get(&self.probe_key)).await {
                Ok(Ok(_)) => {
                    return RecoveryOutcome::Retried {
                        attempts: attempt + 1,
                    }
                }
                Ok(Err(e)) => log::warn!("Remote probe {} failed: {}", attempt + 1, e),
                Err(_) => log::warn!("Remote probe {} timed out", attempt + 1),
            }
        }

        log::warn!("Remote unreachable, entering degraded offline mode");
        RecoveryOutcome::DegradedOffline {
            attempts: self.retry.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryStore;
    use crate::sync::models::RecordKind;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    struct Fixture {
        db: Arc<Database>,
        backups: Arc<BackupManager>,
        store: MemoryStore,
        temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(temp.path().join("catalog.db")).unwrap());
        let backups = Arc::new(BackupManager::new(db.clone(), temp.path().join("backups"), 3).unwrap());
        Fixture {
            db,
            backups,
            store: MemoryStore::new(),
            temp,
        }
    }

    fn controller(f: &Fixture) -> RecoveryController {
        RecoveryController::new(
            f.db.clone(),
            f.backups.clone(),
            Arc::new(f.store.clone()),
            "catalog/catalog.json.gz",
        )
        .with_retry(fast_retry(3), Duration::from_secs(1))
    }

    fn tool(id: &str) -> NewRecord {
        NewRecord {
            id: id.to_string(),
            kind: RecordKind::Tool,
            content: serde_json::json!({ "id": id }),
            author: "dave".to_string(),
        }
    }

    /// Overwrite the b-tree pages behind the 100-byte file header
    fn corrupt_pages(db: &Database) {
        db.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);").unwrap();
        let path = db.path().unwrap();
        let len = std::fs::metadata(path).unwrap().len();

        let mut file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(100)).unwrap();
        file.write_all(&vec![0xA5; (len - 100).min(8192) as usize]).unwrap();
        file.sync_all().unwrap();
    }

    fn fill(db: &Database, count: usize) {
        for i in 0..count {
            db.upsert_record(&tool(&format!("t{}", i))).unwrap();
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_integrity_failure_restores_backup() {
        let f = fixture();
        f.db.upsert_record(&tool("t1")).unwrap();
        f.backups.create_local_backup().unwrap();
        f.db.execute_batch("DROP TABLE catalog_records;").unwrap();

        let outcome = controller(&f).handle(FailureKind::IntegrityFailure).await;

        assert!(matches!(outcome, RecoveryOutcome::Restored { .. }));
        assert!(f.db.get_record("t1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_no_backup_falls_back_to_seed() {
        let f = fixture();
        let seed_path = f.temp.path().join("seed.json");
        std::fs::write(&seed_path, serde_json::to_vec(&vec![tool("s1"), tool("s2")]).unwrap())
            .unwrap();
        f.db.execute_batch("DROP TABLE catalog_records;").unwrap();

        let outcome = controller(&f)
            .with_seed(Some(seed_path))
            .handle(FailureKind::IntegrityFailure)
            .await;

        assert_eq!(outcome, RecoveryOutcome::RebuiltFromSeed { records: 2 });
        assert_eq!(f.db.count_pending().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_file_restores_backup() {
        let f = fixture();
        fill(&f.db, 50);
        f.backups.create_local_backup().unwrap();
        corrupt_pages(&f.db);

        assert!(!matches!(f.db.integrity_check(), Ok(ref p) if p.is_empty()));

        let outcome = controller(&f).handle(FailureKind::IntegrityFailure).await;

        assert!(matches!(outcome, RecoveryOutcome::Restored { .. }));
        assert!(f.db.integrity_check().unwrap().is_empty());
        assert!(f.db.get_record("t49").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_file_without_backup_rebuilds_from_seed() {
        let f = fixture();
        let seed_path = f.temp.path().join("seed.json");
        std::fs::write(&seed_path, serde_json::to_vec(&vec![tool("s1"), tool("s2")]).unwrap())
            .unwrap();
        fill(&f.db, 50);
        corrupt_pages(&f.db);

        let outcome = controller(&f)
            .with_seed(Some(seed_path))
            .handle(FailureKind::IntegrityFailure)
            .await;

        assert_eq!(outcome, RecoveryOutcome::RebuiltFromSeed { records: 2 });
        assert!(f.db.integrity_check().unwrap().is_empty());
        assert_eq!(f.db.count_pending().unwrap(), 2);
        assert!(f.db.get_record("t0").unwrap().is_none());

        // No scratch files left next to the store
        let leftovers: Vec<_> = std::fs::read_dir(f.temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".rebuild-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_seed_is_unrecoverable() {
        let f = fixture();
        let seed_path = f.temp.path().join("seed.json");
        std::fs::write(&seed_path, b"{not json").unwrap();
        f.db.execute_batch("DROP TABLE catalog_records;").unwrap();

        let outcome = controller(&f)
            .with_seed(Some(seed_path))
            .handle(FailureKind::IntegrityFailure)
            .await;

        assert!(matches!(outcome, RecoveryOutcome::Unrecoverable { .. }));
    }

    #[tokio::test]
    async fn test_network_failure_retries_then_degrades() {
        let f = fixture();
        f.store.set_offline(true);

        let outcome = controller(&f).handle(FailureKind::NetworkFailure).await;
        assert_eq!(outcome, RecoveryOutcome::DegradedOffline { attempts: 3 });

        f.store.set_offline(false);
        let outcome = controller(&f).handle(FailureKind::NetworkFailure).await;
        assert_eq!(outcome, RecoveryOutcome::Retried { attempts: 1 });
    }

    #[tokio::test]
    async fn test_policy_failures_need_no_action() {
        let f = fixture();
        let c = controller(&f);

        assert_eq!(
            c.handle(FailureKind::VersionIncompatible).await,
            RecoveryOutcome::NoActionNeeded
        );
        assert_eq!(c.handle(FailureKind::LockDenied).await, RecoveryOutcome::NoActionNeeded);
        // Healthy store: internal errors need nothing either
        assert_eq!(c.handle(FailureKind::Internal).await, RecoveryOutcome::NoActionNeeded);
    }
}
