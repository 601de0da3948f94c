//! Version Tracker - Schema compatibility and migrations
//!
//! Local and remote stores each carry a `VersionTriple`. Differing majors are
//! fatal for a sync cycle; minor/patch differences are bridged by applying
//! the ordered, idempotent migrations below to the local store.

use super::models::VersionTriple;

/// Schema version the baseline `schema.sql` creates
pub const BASELINE_SCHEMA: VersionTriple = VersionTriple::new(1, 0, 0);

/// Newest schema this build knows how to produce
pub const CURRENT_SCHEMA: VersionTriple = VersionTriple::new(1, 2, 0);

/// One local schema step. Applied at most once, in ascending version order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub version: VersionTriple,
    pub description: &'static str,
    pub sql: &'static str,
}

pub static MIGRATIONS: &[Migration] = &[
    Migration {
        version: VersionTriple::new(1, 0, 1),
        description: "Index pending catalog mutations",
        sql: "CREATE INDEX IF NOT EXISTS idx_catalog_records_dirty ON catalog_records(dirty) WHERE dirty = 1;",
    },
    Migration {
        version: VersionTriple::new(1, 1, 0),
        description: "Track dismissal of reviewed conflicts",
        sql: "ALTER TABLE sync_conflicts ADD COLUMN dismissed_at TEXT;",
    },
    Migration {
        version: VersionTriple::new(1, 2, 0),
        description: "Index cycle history by start time",
        sql: "CREATE INDEX IF NOT EXISTS idx_sync_history_started ON sync_history(started_at DESC);",
    },
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("Incompatible schema versions: local {local}, remote {remote} (major differs)")]
    Incompatible {
        local: VersionTriple,
        remote: VersionTriple,
    },
}

/// Stateless compatibility checks and migration planning
pub struct VersionTracker;

impl VersionTracker {
    /// Fails if the majors differ
    pub fn check(local: &VersionTriple, remote: &VersionTriple) -> Result<(), VersionError> {
        if local.is_compatible_with(remote) {
            Ok(())
        } else {
            Err(VersionError::Incompatible {
                local: *local,
                remote: *remote,
            })
        }
    }

    /// Ordered migrations taking a store from `from` to `to`
    ///
    /// Steps newer than this build's registry are simply absent: minor and
    /// patch releases are additive, so an older build keeps working against a
    /// newer remote of the same major.
    pub fn plan_migration(
        from: &VersionTriple,
        to: &VersionTriple,
    ) -> Result<Vec<&'static Migration>, VersionError> {
        Self::check(from, to)?;

        Ok(MIGRATIONS
            .iter()
            .filter(|m| m.version > *from && m.version <= *to)
            .collect())
    }

    /// Version to stamp on an uploaded snapshot
    pub fn upload_version(local: &VersionTriple, remote: Option<&VersionTriple>) -> VersionTriple {
        match remote {
            Some(remote) => (*local).max(*remote),
            None => *local,
        }
    }
}
