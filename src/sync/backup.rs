//! Backup Manager - Local and remote snapshots
//!
//! Local backups are consistent copies of the SQLite store written with
//! `VACUUM INTO`, each with a JSON sidecar carrying its SHA-256. They are
//! taken before every upload and used to restore after integrity failures.
//!
//! Remote backups are copies of the uploaded catalog envelope stored under
//! `<prefix>/backups/`. Both kinds keep the newest `retention` entries.

use super::codec::compute_sha256;
use crate::db::{Database, DbError};
use crate::remote::{ObjectInfo, RemoteError, RemoteStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const BACKUP_PREFIX: &str = "catalog-";
const BACKUP_EXTENSION: &str = ".db";
const SIDECAR_EXTENSION: &str = ".meta.json";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

// ============================================================================
// Types & Structures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Local,
    Remote,
}

/// A point-in-time copy of the local store or of the remote catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub timestamp: DateTime<Utc>,

    /// File path (local) or object key (remote)
    pub location: String,

    pub kind: BackupKind,
    pub size_bytes: u64,

    /// SHA-256 of the backup content (hex)
    pub checksum: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Backup {0} failed verification")]
    ChecksumMismatch(String),

    #[error("Backup metadata unreadable: {0}")]
    Metadata(String),

    #[error("No usable backup found")]
    NoUsableBackup,
}

// ============================================================================
// Backup Manager
// ============================================================================

pub struct BackupManager {
    db: Arc<Database>,
    dir: PathBuf,
    retention: usize,
}

impl BackupManager {
    pub fn new(db: Arc<Database>, dir: impl Into<PathBuf>, retention: usize) -> Result<Self, BackupError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            db,
            dir,
            retention: retention.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Structural problems of the live store (empty = healthy)
    pub fn check_integrity(&self) -> Result<Vec<String>, BackupError> {
        Ok(self.db.integrity_check()?)
    }

    /// Snapshot the local store, then prune old backups
    pub fn create_local_backup(&self) -> Result<BackupSnapshot, BackupError> {
        let timestamp = self.next_timestamp()?;
        let path = self.unused_path(&timestamp);

        self.db.backup_to(&path)?;

        let data = std::fs::read(&path)?;
        let snapshot = BackupSnapshot {
            timestamp,
            location: path.to_string_lossy().to_string(),
            kind: BackupKind::Local,
            size_bytes: data.len() as u64,
            checksum: compute_sha256(&data),
        };

        let sidecar = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| BackupError::Metadata(e.to_string()))?;
        std::fs::write(sidecar_path(&path), sidecar)?;

        log::info!(
            "Local backup written: {} ({} bytes)",
            snapshot.location,
            snapshot.size_bytes
        );

        let pruned = self.prune_local()?;
        if pruned > 0 {
            log::debug!("Pruned {} old local backups", pruned);
        }

        Ok(snapshot)
    }

    /// Local backups, newest first
    pub fn list_local_backups(&self) -> Result<Vec<BackupSnapshot>, BackupError> {
        let mut backups = Vec::new();

        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_sidecar = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(BACKUP_PREFIX) && n.ends_with(SIDECAR_EXTENSION));
            if !is_sidecar {
                continue;
            }

            let parsed = std::fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| {
                    serde_json::from_slice::<BackupSnapshot>(&raw).map_err(|e| e.to_string())
                });

            match parsed {
                Ok(snapshot) => backups.push(snapshot),
                Err(e) => log::warn!("Skipping unreadable backup metadata {:?}: {}", path, e),
            }
        }

        backups.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.location.cmp(&a.location))
        });
        Ok(backups)
    }

    /// Check a local backup file against its recorded checksum
    pub fn verify_backup(&self, backup: &BackupSnapshot) -> Result<(), BackupError> {
        let data = std::fs::read(&backup.location)?;

        if compute_sha256(&data) != backup.checksum {
            return Err(BackupError::ChecksumMismatch(backup.location.clone()));
        }
        Ok(())
    }

    /// Restore one specific backup and bring it to the current schema
    pub fn restore_backup(&self, backup: &BackupSnapshot) -> Result<(), BackupError> {
        self.verify_backup(backup)?;

        self.db.restore_from(Path::new(&backup.location))?;
        let migrated = self.db.migrate_to_current()?;
        if migrated > 0 {
            log::info!("Applied {} migrations to restored store", migrated);
        }

        let problems = self.db.integrity_check()?;
        if !problems.is_empty() {
            return Err(BackupError::Metadata(format!(
                "restored store still unhealthy: {}",
                problems.join("; ")
            )));
        }

        log::info!("Local store restored from {}", backup.location);
        Ok(())
    }

    /// Restore the newest backup that verifies, skipping damaged ones
    pub fn restore_latest(&self) -> Result<BackupSnapshot, BackupError> {
        for backup in self.list_local_backups()? {
            match self.restore_backup(&backup) {
                Ok(()) => return Ok(backup),
                Err(e) => log::warn!("Backup {} unusable: {}", backup.location, e),
            }
        }

        Err(BackupError::NoUsableBackup)
    }

    /// Delete local backups beyond the retention count
    pub fn prune_local(&self) -> Result<usize, BackupError> {
        let backups = self.list_local_backups()?;
        let mut removed = 0;

        for backup in backups.iter().skip(self.retention) {
            let path = PathBuf::from(&backup.location);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
            std::fs::remove_file(sidecar_path(&path)).ok();
            removed += 1;
        }

        Ok(removed)
    }

    // ========================================================================
    // Remote backups
    // ========================================================================

    /// Copy an encoded catalog envelope to `<prefix>/backups/`, then prune
    pub async fn backup_remote(
        &self,
        store: &dyn RemoteStore,
        prefix: &str,
        envelope: &[u8],
    ) -> Result<BackupSnapshot, BackupError> {
        let timestamp = Utc::now();
        let key = format!(
            "{}/backups/{}{}.json.gz",
            prefix,
            BACKUP_PREFIX,
            timestamp.format(TIMESTAMP_FORMAT)
        );

        store.put(&key, envelope.to_vec()).await?;

        let pruned = self.prune_remote(store, prefix).await?;
        if pruned > 0 {
            log::debug!("Pruned {} old remote backups", pruned);
        }

        Ok(BackupSnapshot {
            timestamp,
            location: key,
            kind: BackupKind::Remote,
            size_bytes: envelope.len() as u64,
            checksum: compute_sha256(envelope),
        })
    }

    /// Remote backup objects, newest first
    pub async fn list_remote_backups(
        &self,
        store: &dyn RemoteStore,
        prefix: &str,
    ) -> Result<Vec<ObjectInfo>, BackupError> {
        let mut objects = store
            .list(&format!("{}/backups/{}", prefix, BACKUP_PREFIX))
            .await?;

        // Fixed-width timestamps: key order is chronological
        objects.sort_by(|a, b| b.key.cmp(&a.key));
        Ok(objects)
    }

    pub async fn prune_remote(&self, store: &dyn RemoteStore, prefix: &str) -> Result<usize, BackupError> {
        let objects = self.list_remote_backups(store, prefix).await?;
        let mut removed = 0;

        for object in objects.iter().skip(self.retention) {
            store.delete(&object.key).await?;
            removed += 1;
        }

        Ok(removed)
    }

    /// Strictly after the newest existing backup, so listing order is creation order
    fn next_timestamp(&self) -> Result<DateTime<Utc>, BackupError> {
        let now = Utc::now();
        let newest = self.list_local_backups()?.into_iter().next();

        Ok(match newest {
            Some(b) if b.timestamp >= now => b.timestamp + chrono::Duration::milliseconds(1),
            _ => now,
        })
    }

    fn unused_path(&self, timestamp: &DateTime<Utc>) -> PathBuf {
        let stem = format!("{}{}", BACKUP_PREFIX, timestamp.format(TIMESTAMP_FORMAT));
        let mut path = self.dir.join(format!("{}{}", stem, BACKUP_EXTENSION));

        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{}-{}{}", stem, n, BACKUP_EXTENSION));
            n += 1;
        }
        path
    }
}

fn sidecar_path(backup: &Path) -> PathBuf {
    let mut name = backup.as_os_str().to_owned();
    name.push(SIDECAR_EXTENSION);
    PathBuf::from(name)
}

// ============================================================================
// Tests
// ============================================================================
