//! Database module for Catalog Sync
//!
//! Provides the SQLite-backed local store: catalog records with their sync
//! bookkeeping, the conflict side log, settings, and cycle history.
//! Everything a sync cycle publishes goes through one transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::sync::merge::MergedRecord;
use crate::sync::models::{
    CatalogRecord, ConflictEntry, ConflictWinner, LocalRecord, NewRecord, RecordKind,
    VersionTriple,
};
use crate::sync::version::{Migration, VersionTracker, CURRENT_SCHEMA};

/// Tables a healthy store must contain
const REQUIRED_TABLES: &[&str] = &[
    "settings",
    "schema_version",
    "catalog_records",
    "sync_conflicts",
    "sync_history",
];

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Store damaged: {0}")]
    Corrupt(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Outcome of publishing a merged catalog
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishStats {
    pub written: usize,
    /// Records mutated locally while the cycle ran; left dirty for the next cycle
    pub skipped: usize,
    pub conflicts_logged: usize,
}

/// A conflict from the side log
#[derive(Debug, Clone, Serialize)]
pub struct StoredConflict {
    pub id: i64,
    pub record_id: String,
    pub base_version: Option<i64>,
    pub local: CatalogRecord,
    pub remote: CatalogRecord,
    pub winner: ConflictWinner,
    pub detected_at: DateTime<Utc>,
    pub dismissed_at: Option<DateTime<Utc>>,
}

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Create a new database connection pool
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(std::time::Duration::from_secs(10))
            .test_on_check_out(false)
            .build(manager)?;

        let mut conn = pool.get()?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        let tx = conn.transaction()?;
        Self::run_migrations(&tx)?;
        tx.commit()?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
            path: Some(db_path),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every SQLite `:memory:` connection is its own database, so the pool
    /// holds exactly one connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder().max_size(1).min_idle(Some(1)).build(manager)?;

        let mut conn = pool.get()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let tx = conn.transaction()?;
        Self::run_migrations(&tx)?;
        tx.commit()?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
            path: None,
        })
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// On-disk location (`None` for in-memory stores)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // =========================================================================
    // SCHEMA VERSION & MIGRATIONS
    // =========================================================================

    /// Baseline schema plus every pending registered migration.
    /// Callers wrap this in a transaction.
    fn run_migrations(conn: &Connection) -> DbResult<usize> {
        conn.execute_batch(include_str!("schema.sql"))?;

        let stored = Self::read_schema_version(conn)?;
        let steps = VersionTracker::plan_migration(&stored, &CURRENT_SCHEMA)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        Self::apply_steps(conn, &steps)
    }

    fn read_schema_version(conn: &Connection) -> DbResult<VersionTriple> {
        conn.query_row(
            "SELECT major, minor, patch FROM schema_version WHERE id = 1",
            [],
            |row| Ok(VersionTriple::new(row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(DbError::from)
    }

    fn apply_steps(conn: &Connection, steps: &[&Migration]) -> DbResult<usize> {
        let mut applied = 0;
        let mut stored = Self::read_schema_version(conn)?;

        for step in steps {
            if step.version <= stored {
                continue;
            }

            log::info!(
                "Running migration {}: {}",
                step.version,
                step.description
            );
            conn.execute_batch(step.sql)
                .map_err(|e| DbError::Migration(format!("{} failed: {}", step.version, e)))?;
            conn.execute(
                "UPDATE schema_version SET major = ?1, minor = ?2, patch = ?3, updated_at = datetime('now') WHERE id = 1",
                params![step.version.major, step.version.minor, step.version.patch],
            )?;

            stored = step.version;
            applied += 1;
        }

        Ok(applied)
    }

    /// Current local schema version
    pub fn schema_version(&self) -> DbResult<VersionTriple> {
        let conn = self.get_conn()?;
        Self::read_schema_version(&conn)
    }

    /// Apply planned migration steps atomically; already applied steps are skipped
    pub fn apply_migrations(&self, steps: &[&Migration]) -> DbResult<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let applied = Self::apply_steps(&tx, steps)?;
        tx.commit()?;
        Ok(applied)
    }

    /// Bring the store up to this build's schema (after a restore)
    pub fn migrate_to_current(&self) -> DbResult<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let applied = Self::run_migrations(&tx)?;
        tx.commit()?;
        Ok(applied)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    // =========================================================================
    // CATALOG RECORDS
    // =========================================================================

    /// Local mutation: create or update a record, bumping its version and
    /// marking it pending for the next sync
    pub fn upsert_record(&self, new: &NewRecord) -> DbResult<CatalogRecord> {
        let content = serde_json::to_string(&new.content)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT version FROM catalog_records WHERE id = ?1",
                [&new.id],
                |row| row.get(0),
            )
            .optional()?;

        let version = existing.map_or(1, |v| v + 1);
        let now = Utc::now();

        tx.execute(
            r#"
            INSERT INTO catalog_records (id, kind, content, author, version, base_version, dirty, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, NULL, 1, ?6)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                content = excluded.content,
                author = excluded.author,
                version = excluded.version,
                dirty = 1,
                updated_at = excluded.updated_at
            "#,
            params![
                new.id,
                new.kind.as_str(),
                content,
                new.author,
                version,
                now.to_rfc3339()
            ],
        )?;
        tx.commit()?;

        Ok(CatalogRecord {
            id: new.id.clone(),
            kind: new.kind,
            content: new.content.clone(),
            author: new.author.clone(),
            version,
            updated_at: now,
        })
    }

    /// Get a record by id
    pub fn get_record(&self, id: &str) -> DbResult<Option<CatalogRecord>> {
        Ok(self.get_local_record(id)?.map(|l| l.record))
    }

    /// Get a record with its sync bookkeeping
    pub fn get_local_record(&self, id: &str) -> DbResult<Option<LocalRecord>> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT id, kind, content, author, version, updated_at, base_version, dirty
             FROM catalog_records WHERE id = ?1",
            [id],
            local_record_from_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// All records, ordered by id
    pub fn list_records(&self) -> DbResult<Vec<CatalogRecord>> {
        Ok(self
            .load_local_state()?
            .into_iter()
            .map(|l| l.record)
            .collect())
    }

    /// Full local state as merge input
    pub fn load_local_state(&self) -> DbResult<Vec<LocalRecord>> {
        self.query(
            "SELECT id, kind, content, author, version, updated_at, base_version, dirty
             FROM catalog_records ORDER BY id",
            [],
            local_record_from_row,
        )
    }

    /// Records mutated locally since the last sync
    pub fn pending_changes(&self) -> DbResult<Vec<LocalRecord>> {
        self.query(
            "SELECT id, kind, content, author, version, updated_at, base_version, dirty
             FROM catalog_records WHERE dirty = 1 ORDER BY id",
            [],
            local_record_from_row,
        )
    }

    pub fn count_pending(&self) -> DbResult<usize> {
        let count: i64 = self.query_row(
            "SELECT COUNT(*) FROM catalog_records WHERE dirty = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Publish a merged catalog and its conflicts in one transaction.
    ///
    /// A record whose local version differs from the one the merge saw was
    /// mutated during the cycle; it is left untouched (and dirty).
    pub fn publish(
        &self,
        merged: &[MergedRecord],
        conflicts: &[ConflictEntry],
    ) -> DbResult<PublishStats> {
        let mut stats = PublishStats::default();
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        {
            let mut current_version =
                tx.prepare("SELECT version FROM catalog_records WHERE id = ?1")?;
            let mut upsert = tx.prepare(
                r#"
                INSERT INTO catalog_records (id, kind, content, author, version, base_version, dirty, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0, ?6)
                ON CONFLICT(id) DO UPDATE SET
                    kind = excluded.kind,
                    content = excluded.content,
                    author = excluded.author,
                    version = excluded.version,
                    base_version = excluded.base_version,
                    dirty = 0,
                    updated_at = excluded.updated_at
                "#,
            )?;

            for m in merged {
                let current: Option<i64> = current_version
                    .query_row([&m.record.id], |row| row.get(0))
                    .optional()?;

                if current != m.expected_local_version {
                    log::debug!(
                        "Record {} changed locally during sync ({:?} -> {:?}), leaving it pending",
                        m.record.id,
                        m.expected_local_version,
                        current
                    );
                    stats.skipped += 1;
                    continue;
                }

                let content = serde_json::to_string(&m.record.content)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                upsert.execute(params![
                    m.record.id,
                    m.record.kind.as_str(),
                    content,
                    m.record.author,
                    m.record.version,
                    m.record.updated_at.to_rfc3339()
                ])?;
                stats.written += 1;
            }

            let mut insert_conflict = tx.prepare(
                r#"
                INSERT INTO sync_conflicts (
                    record_id, base_version, local_version, remote_version,
                    local_record, remote_record, winner, detected_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )?;

            for c in conflicts {
                let local = serde_json::to_string(&c.local)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                let remote = serde_json::to_string(&c.remote)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;

                insert_conflict.execute(params![
                    c.record_id,
                    c.base_version,
                    c.local.version,
                    c.remote.version,
                    local,
                    remote,
                    c.winner.as_str(),
                    c.detected_at.to_rfc3339()
                ])?;
                stats.conflicts_logged += 1;
            }
        }

        tx.commit()?;
        Ok(stats)
    }

    // =========================================================================
    // CONFLICTS
    // =========================================================================

    /// Conflict side log, newest first
    pub fn list_conflicts(&self, include_dismissed: bool) -> DbResult<Vec<StoredConflict>> {
        let sql = if include_dismissed {
            "SELECT id, record_id, base_version, local_record, remote_record, winner, detected_at, dismissed_at
             FROM sync_conflicts ORDER BY id DESC"
        } else {
            "SELECT id, record_id, base_version, local_record, remote_record, winner, detected_at, dismissed_at
             FROM sync_conflicts WHERE dismissed_at IS NULL ORDER BY id DESC"
        };

        self.query(sql, [], |row| {
            let local: String = row.get(3)?;
            let remote: String = row.get(4)?;
            let winner: String = row.get(5)?;
            let detected_at: String = row.get(6)?;
            let dismissed_at: Option<String> = row.get(7)?;

            Ok(StoredConflict {
                id: row.get(0)?,
                record_id: row.get(1)?,
                base_version: row.get(2)?,
                local: serde_json::from_str(&local).map_err(|e| conversion_error(3, e))?,
                remote: serde_json::from_str(&remote).map_err(|e| conversion_error(4, e))?,
                winner: ConflictWinner::from_str(&winner).map_err(|e| conversion_error(5, e))?,
                detected_at: parse_timestamp(6, &detected_at)?,
                dismissed_at: dismissed_at
                    .map(|s| parse_timestamp(7, &s))
                    .transpose()?,
            })
        })
    }

    /// Mark a conflict as reviewed. Resolution itself requires a new write.
    pub fn dismiss_conflict(&self, id: i64) -> DbResult<()> {
        let affected = self.execute(
            "UPDATE sync_conflicts SET dismissed_at = ?1 WHERE id = ?2 AND dismissed_at IS NULL",
            params![Utc::now().to_rfc3339(), id],
        )?;

        if affected == 0 {
            return Err(DbError::NotFound(format!("open conflict {}", id)));
        }
        Ok(())
    }

    pub fn count_open_conflicts(&self) -> DbResult<usize> {
        let count: i64 = self.query_row(
            "SELECT COUNT(*) FROM sync_conflicts WHERE dismissed_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // =========================================================================
    // INTEGRITY, BACKUP & REBUILD
    // =========================================================================

    /// Structural health check; returns the list of problems (empty = healthy)
    pub fn integrity_check(&self) -> DbResult<Vec<String>> {
        match &self.path {
            // A fresh connection reads pages from disk, not from a pooled cache
            Some(path) => {
                let conn = Connection::open(path)?;
                conn.busy_timeout(std::time::Duration::from_secs(5))?;
                Self::check_structure(&conn)
            }
            None => {
                let conn = self.get_conn()?;
                Self::check_structure(&conn)
            }
        }
    }

    fn check_structure(conn: &Connection) -> DbResult<Vec<String>> {
        let mut problems = Vec::new();

        {
            let mut stmt = conn.prepare("PRAGMA integrity_check")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                let line = row?;
                if line != "ok" {
                    problems.push(line);
                }
            }
        }

        for table in REQUIRED_TABLES {
            let exists: bool = conn.query_row(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )?;
            if !exists {
                problems.push(format!("missing table {}", table));
            }
        }

        if problems.is_empty() {
            let version = Self::read_schema_version(conn)?;
            if !version.is_compatible_with(&CURRENT_SCHEMA) {
                problems.push(format!("schema version {} unsupported", version));
            }
        }

        Ok(problems)
    }

    /// Write a consistent copy of the store to `target` (must not exist)
    pub fn backup_to(&self, target: &Path) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "VACUUM INTO ?1",
            params![target.to_string_lossy().to_string()],
        )?;
        Ok(())
    }

    /// Replace the store's content with the database file at `source`
    pub fn restore_from(&self, source: &Path) -> DbResult<()> {
        let mut conn = self.get_conn()?;
        conn.restore(
            rusqlite::DatabaseName::Main,
            source,
            None::<fn(rusqlite::backup::Progress)>,
        )?;
        Ok(())
    }

    /// Last-resort rebuild: recreate the catalog tables and load seed records
    /// as pending local mutations. Existing catalog state is discarded.
    ///
    /// The tables are recreated in place first. When that fails or leaves the
    /// file damaged, a fresh store is built next to it and copied over the
    /// damaged one; settings and history are lost in that case.
    pub fn rebuild_from_seed(&self, seeds: &[NewRecord]) -> DbResult<usize> {
        let in_place = self.rebuild_in_place(seeds);
        if in_place.is_ok() && matches!(self.integrity_check(), Ok(ref p) if p.is_empty()) {
            return Ok(seeds.len());
        }

        let Some(path) = self.path.clone() else {
            in_place?;
            return Err(DbError::Corrupt("store still damaged after rebuild".to_string()));
        };

        match in_place {
            Ok(()) => log::warn!("Store still damaged after in-place rebuild, replacing the file"),
            Err(e) => log::warn!("In-place rebuild failed ({}), replacing the file", e),
        }

        let fresh = fresh_store_path(&path);
        let replaced = Self::build_seeded_file(&fresh, seeds).and_then(|_| self.restore_from(&fresh));
        if let Err(e) = std::fs::remove_file(&fresh) {
            log::debug!("Could not remove {:?}: {}", fresh, e);
        }
        replaced?;

        let problems = self.integrity_check()?;
        if !problems.is_empty() {
            return Err(DbError::Corrupt(problems.join("; ")));
        }
        Ok(seeds.len())
    }

    fn rebuild_in_place(&self, seeds: &[NewRecord]) -> DbResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute_batch(
            r#"
            DROP TABLE IF EXISTS catalog_records;
            DROP TABLE IF EXISTS sync_conflicts;
            DROP TABLE IF EXISTS schema_version;
        "#,
        )?;
        Self::run_migrations(&tx)?;
        Self::insert_seeds(&tx, seeds)?;

        tx.commit()?;
        Ok(())
    }

    /// Standalone store at `target` holding only the schema and `seeds`
    fn build_seeded_file(target: &Path, seeds: &[NewRecord]) -> DbResult<()> {
        let mut conn = Connection::open(target)?;
        let tx = conn.transaction()?;
        Self::run_migrations(&tx)?;
        Self::insert_seeds(&tx, seeds)?;
        tx.commit()?;
        Ok(())
    }

    fn insert_seeds(conn: &Connection, seeds: &[NewRecord]) -> DbResult<()> {
        let now = Utc::now().to_rfc3339();
        let mut insert = conn.prepare(
            "INSERT OR REPLACE INTO catalog_records (id, kind, content, author, version, base_version, dirty, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, NULL, 1, ?5)",
        )?;
        for seed in seeds {
            let content = serde_json::to_string(&seed.content)
                .map_err(|e| DbError::Serialization(e.to_string()))?;
            insert.execute(params![seed.id, seed.kind.as_str(), content, seed.author, now])?;
        }
        Ok(())
    }

    // =========================================================================
    // HELPER METHODS (for history module and other internal use)
    // =========================================================================

    /// Execute a SQL statement and return affected rows
    pub fn execute<P>(&self, sql: &str, params: P) -> DbResult<usize>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;
        Ok(conn.execute(sql, params)?)
    }

    /// Execute an INSERT statement and return the last inserted row ID
    pub fn execute_insert<P>(&self, sql: &str, params: P) -> DbResult<i64>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;
        conn.execute(sql, params)?;
        Ok(conn.last_insert_rowid())
    }

    /// Query database and map results
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }

    /// Query single row
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;
        conn.query_row(sql, params, f).map_err(DbError::from)
    }

    /// Execute multiple statements
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute_batch(sql)?;
        Ok(())
    }
}

/// `<store>.rebuild-<uuid>` next to the store file
fn fresh_store_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "catalog.db".to_string());
    path.with_file_name(format!("{}.rebuild-{}", name, uuid::Uuid::new_v4().simple()))
}

// =============================================================================
// ROW MAPPING
// =============================================================================

fn conversion_error(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

/// Columns: id, kind, content, author, version, updated_at, base_version, dirty
fn local_record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalRecord> {
    let kind: String = row.get(1)?;
    let content: String = row.get(2)?;
    let updated_at: String = row.get(5)?;

    Ok(LocalRecord {
        record: CatalogRecord {
            id: row.get(0)?,
            kind: RecordKind::from_str(&kind).map_err(|e| conversion_error(1, e))?,
            content: serde_json::from_str(&content).map_err(|e| conversion_error(2, e))?,
            author: row.get(3)?,
            version: row.get(4)?,
            updated_at: parse_timestamp(5, &updated_at)?,
        },
        base_version: row.get(6)?,
        dirty: row.get::<_, i64>(7)? != 0,
    })
}
