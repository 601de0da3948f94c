//! Sync History Module - Cycle Log
//!
//! One row per sync cycle:
//! - outcome and failure kind
//! - merged record, conflict and upload counts
//! - recovery action taken, if any
//!
//! Retention keeps the newest N cycles.

use super::models::CycleResult;
use crate::db::Database;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Types & Structures
// ============================================================================

/// A single recorded cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub id: i64,
    pub instance_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: String,
    pub failure_kind: Option<String>,
    pub records_merged: i64,
    pub conflicts: i64,
    pub uploaded: bool,
    pub recovery: Option<String>,
    pub error_message: Option<String>,
}

/// History statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total_cycles: i64,
    pub successful_cycles: i64,
    pub failed_cycles: i64,
    pub total_conflicts: i64,
    pub last_success_at: Option<DateTime<Utc>>,
}

// ============================================================================
// History Manager
// ============================================================================

pub struct HistoryManager {
    db: Arc<Database>,
}

impl HistoryManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record a finished cycle
    pub fn record_cycle(
        &self,
        instance_id: &str,
        started_at: DateTime<Utc>,
        result: &CycleResult,
    ) -> Result<i64, HistoryError> {
        let conflicts = result.conflict_count() as i64;
        let (records_merged, uploaded) = match result {
            CycleResult::Success { report } => (report.records_published as i64, report.uploaded),
            CycleResult::SkippedBusy { adopted, .. } => (*adopted as i64, false),
            CycleResult::Failed { .. } | CycleResult::AlreadyRunning => (0, false),
        };

        let (failure_kind, recovery, error_message) = match result {
            CycleResult::Failed {
                kind,
                reason,
                recovery,
            } => (
                Some(kind.as_str()),
                recovery.as_ref().map(|r| r.as_str()),
                Some(reason.as_str()),
            ),
            _ => (None, None, None),
        };

        self.db
            .execute_insert(
                "INSERT INTO sync_history (
                    instance_id, started_at, finished_at, outcome, failure_kind,
                    records_merged, conflicts, uploaded, recovery, error_message
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    instance_id,
                    started_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                    result.as_str(),
                    failure_kind,
                    records_merged,
                    conflicts,
                    uploaded,
                    recovery,
                    error_message,
                ],
            )
            .map_err(|e| HistoryError::DatabaseError(e.to_string()))
    }

    /// Most recent cycles first
    pub fn get_history(&self, limit: i64) -> Result<Vec<CycleRecord>, HistoryError> {
        self.db
            .query(
                "SELECT id, instance_id, started_at, finished_at, outcome, failure_kind,
                        records_merged, conflicts, uploaded, recovery, error_message
                 FROM sync_history
                 ORDER BY id DESC
                 LIMIT ?1",
                rusqlite::params![limit],
                |row| {
                    Ok(CycleRecord {
                        id: row.get(0)?,
                        instance_id: row.get(1)?,
                        started_at: parse_timestamp(&row.get::<_, String>(2)?),
                        finished_at: parse_timestamp(&row.get::<_, String>(3)?),
                        outcome: row.get(4)?,
                        failure_kind: row.get(5)?,
                        records_merged: row.get(6)?,
                        conflicts: row.get(7)?,
                        uploaded: row.get(8)?,
                        recovery: row.get(9)?,
                        error_message: row.get(10)?,
                    })
                },
            )
            .map_err(|e| HistoryError::DatabaseError(e.to_string()))
    }

    /// Keep only the newest `keep` cycles
    pub fn enforce_retention(&self, keep: usize) -> Result<usize, HistoryError> {
        self.db
            .execute(
                "DELETE FROM sync_history
                 WHERE id NOT IN (SELECT id FROM sync_history ORDER BY id DESC LIMIT ?1)",
                rusqlite::params![keep as i64],
            )
            .map_err(|e| HistoryError::DatabaseError(e.to_string()))
    }

    pub fn get_stats(&self) -> Result<HistoryStats, HistoryError> {
        self.db
            .query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(outcome = 'success'), 0),
                    COALESCE(SUM(outcome = 'failed'), 0),
                    COALESCE(SUM(conflicts), 0),
                    MAX(CASE WHEN outcome = 'success' THEN finished_at END)
                 FROM sync_history",
                [],
                |row| {
                    Ok(HistoryStats {
                        total_cycles: row.get(0)?,
                        successful_cycles: row.get(1)?,
                        failed_cycles: row.get(2)?,
                        total_conflicts: row.get(3)?,
                        last_success_at: row
                            .get::<_, Option<String>>(4)?
                            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                            .map(|d| d.with_timezone(&Utc)),
                    })
                },
            )
            .map_err(|e| HistoryError::DatabaseError(e.to_string()))
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Rows are written by `record_cycle`; an unparseable timestamp falls back to the epoch
fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    DatabaseError(String),
}

// ============================================================================
// Tests
// ============================================================================
