//! Integration Tests for Sync Module
//!
//! Multi-instance scenarios against a shared remote store:
//! - End-to-end cycles (upload, fast-forward, conflicts)
//! - Lease contention and download-only cycles
//! - Error scenarios and recovery (network, integrity, schema, corrupt remote)
//! - Cycle serialization and cancellation

#[cfg(test)]
mod integration_tests {
    use super::super::*;
    use crate::db::Database;
    use crate::remote::{FsStore, MemoryStore, ObjectInfo, RemoteError, RemoteObject, RemoteStore};
    use async_trait::async_trait;
    use std::io::{Seek, SeekFrom, Write};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::{Notify, Semaphore};

    const CATALOG_KEY: &str = "catalog/catalog.json.gz";
    const LEASE_KEY: &str = "catalog/lease.json";

    struct Instance {
        db: Arc<Database>,
        sync: Synchronizer,
        _temp: TempDir,
    }

    fn instance_with(
        store: Arc<dyn RemoteStore>,
        id: &str,
        tweak: impl FnOnce(&mut SyncOptions),
    ) -> Instance {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(temp.path().join("catalog.db")).unwrap());
        let backups =
            Arc::new(BackupManager::new(db.clone(), temp.path().join("backups"), 5).unwrap());

        let mut options = SyncOptions::new(id);
        options.lease_ttl = Duration::from_secs(30);
        options.network_timeout = Duration::from_secs(2);
        options.retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        tweak(&mut options);

        Instance {
            sync: Synchronizer::new(db.clone(), store, backups, options),
            db,
            _temp: temp,
        }
    }

    fn instance(store: &MemoryStore, id: &str) -> Instance {
        instance_with(Arc::new(store.clone()), id, |_| {})
    }

    fn write(db: &Database, id: &str, value: &str) -> CatalogRecord {
        db.upsert_record(&NewRecord {
            id: id.to_string(),
            kind: RecordKind::Tool,
            content: serde_json::json!({ "value": value }),
            author: "tester".to_string(),
        })
        .unwrap()
    }

    fn value_of(db: &Database, id: &str) -> Option<String> {
        db.get_record(id)
            .unwrap()
            .and_then(|r| r.content["value"].as_str().map(String::from))
    }

    async fn remote_snapshot(store: &dyn RemoteStore) -> Option<CatalogSnapshot> {
        let object = store.get(CATALOG_KEY).await.unwrap()?;
        Some(decode_snapshot(&object.data).unwrap())
    }

    /// Which catalog access `GatedStore` holds back
    #[derive(Clone, Copy, PartialEq)]
    enum Gate {
        Read,
        Upload,
        BackupWrite,
    }

    /// Shared store that parks one kind of catalog access until `open` is called
    #[derive(Clone)]
    struct GatedStore {
        inner: MemoryStore,
        gate: Gate,
        entered: Arc<Notify>,
        permits: Arc<Semaphore>,
    }

    impl GatedStore {
        fn new(inner: &MemoryStore, gate: Gate) -> Self {
            Self {
                inner: inner.clone(),
                gate,
                entered: Arc::new(Notify::new()),
                permits: Arc::new(Semaphore::new(0)),
            }
        }

        async fn pass(&self, key: &str, access: Gate) {
            let watched = match access {
                Gate::BackupWrite => key.contains("/backups/"),
                Gate::Read | Gate::Upload => key == CATALOG_KEY,
            };
            if watched && access == self.gate {
                self.entered.notify_one();
                let _permit = self.permits.acquire().await.unwrap();
            }
        }

        fn open(&self) {
            self.permits.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    #[async_trait]
    impl RemoteStore for GatedStore {
        async fn get(&self, key: &str) -> Result<Option<RemoteObject>, RemoteError> {
            self.pass(key, Gate::Read).await;
            self.inner.get(key).await
        }

        async fn create_if_absent(&self, key: &str, data: Vec<u8>) -> Result<String, RemoteError> {
            self.pass(key, Gate::Upload).await;
            self.inner.create_if_absent(key, data).await
        }

        async fn overwrite_if_match(
            &self,
            key: &str,
            data: Vec<u8>,
            etag: &str,
        ) -> Result<String, RemoteError> {
            self.pass(key, Gate::Upload).await;
            self.inner.overwrite_if_match(key, data, etag).await
        }

        async fn put(&self, key: &str, data: Vec<u8>) -> Result<String, RemoteError> {
            self.pass(key, Gate::BackupWrite).await;
            self.inner.put(key, data).await
        }

        async fn delete_if_match(&self, key: &str, etag: &str) -> Result<(), RemoteError> {
            self.inner.delete_if_match(key, etag).await
        }

        async fn delete(&self, key: &str) -> Result<(), RemoteError> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, RemoteError> {
            self.inner.list(prefix).await
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

    fn expect_success(result: CycleResult) -> CycleReport {
        match result {
            CycleResult::Success { report } => report,
            other => panic!("expected success, got {:?}", other),
        }
    }

    // ========================================================================
    // End-to-end flows
    // ========================================================================

    #[tokio::test]
    async fn test_first_cycle_uploads_local_records() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");
        write(&a.db, "t1", "one");
        write(&a.db, "t2", "two");

        let report = expect_success(a.sync.run_cycle().await);
        assert!(report.uploaded);
        assert_eq!(report.records_published, 2);
        assert_eq!(report.remote_generation, 1);

        let remote = remote_snapshot(&store).await.unwrap();
        assert_eq!(remote.records.len(), 2);
        assert_eq!(remote.updated_by, "a");
        assert_eq!(a.db.count_pending().unwrap(), 0);

        // Nothing changed: the next cycle does not upload again
        let report = expect_success(a.sync.run_cycle().await);
        assert!(!report.uploaded);
        assert_eq!(report.stats.unchanged, 2);
    }

    #[tokio::test]
    async fn test_stale_instance_fast_forwards_without_conflict() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");
        let b = instance(&store, "b");

        write(&a.db, "r1", "v1");
        expect_success(a.sync.run_cycle().await);
        expect_success(b.sync.run_cycle().await);
        assert_eq!(value_of(&b.db, "r1").as_deref(), Some("v1"));

        write(&a.db, "r1", "v2");
        expect_success(a.sync.run_cycle().await);

        let report = expect_success(b.sync.run_cycle().await);
        assert!(report.conflicts.is_empty());
        assert_eq!(report.stats.fast_forward_remote, 1);

        let r1 = b.db.get_record("r1").unwrap().unwrap();
        assert_eq!(r1.version, 2);
        assert_eq!(r1.content["value"], "v2");
    }

    #[tokio::test]
    async fn test_concurrent_edits_record_conflict_and_keep_remote() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");
        let b = instance(&store, "b");

        write(&a.db, "r1", "base");
        expect_success(a.sync.run_cycle().await);
        expect_success(b.sync.run_cycle().await);

        write(&a.db, "r1", "from-a");
        write(&b.db, "r1", "from-b");

        let first = expect_success(a.sync.run_cycle().await);
        assert!(first.conflicts.is_empty());

        let second = expect_success(b.sync.run_cycle().await);
        assert_eq!(second.conflicts.len(), 1);
        assert_eq!(second.conflicts[0].winner, ConflictWinner::Remote);

        // Remote value retained everywhere, local variant in the side log
        let remote = remote_snapshot(&store).await.unwrap();
        assert_eq!(remote.records[0].content["value"], "from-a");
        assert_eq!(value_of(&b.db, "r1").as_deref(), Some("from-a"));

        let logged = b.sync.list_conflicts(false).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].local.content["value"], "from-b");
        assert_eq!(b.sync.health().await.pending_conflicts, 1);

        // Resolution is terminal: dismissing clears the review queue
        b.sync.dismiss_conflict(logged[0].id).unwrap();
        assert_eq!(b.sync.health().await.pending_conflicts, 0);
    }

    #[tokio::test]
    async fn test_local_wins_policy_keeps_counter_monotonic() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");
        let b = instance_with(Arc::new(store.clone()), "b", |o| {
            o.tie_break = TieBreak::LocalWins
        });

        write(&a.db, "r1", "base");
        expect_success(a.sync.run_cycle().await);
        expect_success(b.sync.run_cycle().await);

        write(&a.db, "r1", "from-a");
        write(&b.db, "r1", "from-b");
        expect_success(a.sync.run_cycle().await);

        let report = expect_success(b.sync.run_cycle().await);
        assert_eq!(report.conflicts.len(), 1);
        assert!(report.uploaded);

        let remote = remote_snapshot(&store).await.unwrap();
        assert_eq!(remote.records[0].content["value"], "from-b");
        assert_eq!(remote.records[0].version, 3);

        // A adopts B's winning value cleanly
        let report = expect_success(a.sync.run_cycle().await);
        assert!(report.conflicts.is_empty());
        assert_eq!(value_of(&a.db, "r1").as_deref(), Some("from-b"));
    }

    #[tokio::test]
    async fn test_no_record_lost_across_interleaved_cycles() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");
        let b = instance(&store, "b");

        for round in 0..5 {
            write(&a.db, &format!("a{}", round), &format!("a-{}", round));
            write(&b.db, &format!("b{}", round), &format!("b-{}", round));

            if round % 2 == 0 {
                a.sync.run_cycle().await;
                b.sync.run_cycle().await;
            } else {
                b.sync.run_cycle().await;
                a.sync.run_cycle().await;
            }
        }

        // Settle: one more pass each
        expect_success(a.sync.run_cycle().await);
        expect_success(b.sync.run_cycle().await);
        expect_success(a.sync.run_cycle().await);

        let remote = remote_snapshot(&store).await.unwrap();
        assert_eq!(remote.records.len(), 10);

        for round in 0..5 {
            for prefix in ["a", "b"] {
                let id = format!("{}{}", prefix, round);
                let expected = format!("{}-{}", prefix, round);
                assert_eq!(value_of(&a.db, &id).as_deref(), Some(expected.as_str()));
                assert_eq!(value_of(&b.db, &id).as_deref(), Some(expected.as_str()));
                assert!(remote.records.iter().any(|r| r.id == id));
            }
        }
        assert_eq!(a.db.count_pending().unwrap(), 0);
        assert_eq!(b.db.count_pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fs_store_shared_directory() {
        let shared = TempDir::new().unwrap();
        let store: Arc<dyn RemoteStore> = Arc::new(FsStore::new(shared.path()).unwrap());
        let a = instance_with(store.clone(), "a", |_| {});
        let b = instance_with(store.clone(), "b", |_| {});

        write(&a.db, "tool", "from-a");
        expect_success(a.sync.run_cycle().await);

        let report = expect_success(b.sync.run_cycle().await);
        assert_eq!(report.stats.remote_only, 1);
        assert_eq!(value_of(&b.db, "tool").as_deref(), Some("from-a"));
    }

    // ========================================================================
    // Lease contention
    // ========================================================================

    #[tokio::test]
    async fn test_lease_held_elsewhere_runs_download_only() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");
        let b = instance(&store, "b");

        write(&b.db, "r1", "from-b");
        expect_success(b.sync.run_cycle().await);
        write(&a.db, "local-only", "pending");

        let other = LockManager::new(
            Arc::new(store.clone()),
            LEASE_KEY,
            "other",
            Duration::from_secs(2),
        );
        let held = other.acquire(Duration::from_secs(60)).await.unwrap();

        match a.sync.run_cycle().await {
            CycleResult::SkippedBusy { holder, adopted } => {
                assert_eq!(holder.as_deref(), Some("other"));
                assert_eq!(adopted, 1);
            }
            other => panic!("expected skipped_busy, got {:?}", other),
        }

        // Remote adopted read-only, nothing uploaded, local change still pending
        assert_eq!(value_of(&a.db, "r1").as_deref(), Some("from-b"));
        assert!(a.db.get_local_record("local-only").unwrap().unwrap().dirty);
        let remote = remote_snapshot(&store).await.unwrap();
        assert!(remote.records.iter().all(|r| r.id != "local-only"));

        other.release(&held).await.unwrap();
        expect_success(a.sync.run_cycle().await);
        let remote = remote_snapshot(&store).await.unwrap();
        assert!(remote.records.iter().any(|r| r.id == "local-only"));
    }

    // ========================================================================
    // Error scenarios and recovery
    // ========================================================================

    #[tokio::test]
    async fn test_remote_unreachable_keeps_local_and_degrades() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");

        write(&a.db, "t1", "synced");
        expect_success(a.sync.run_cycle().await);
        write(&a.db, "t2", "pending");

        store.set_offline(true);
        match a.sync.run_cycle().await {
            CycleResult::Failed { kind, recovery, .. } => {
                assert_eq!(kind, FailureKind::NetworkFailure);
                assert!(matches!(recovery, Some(RecoveryOutcome::DegradedOffline { .. })));
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let health = a.sync.health().await;
        assert!(health.offline);
        assert_eq!(health.pending_changes, 1);
        assert_eq!(value_of(&a.db, "t1").as_deref(), Some("synced"));
        assert_eq!(value_of(&a.db, "t2").as_deref(), Some("pending"));

        store.set_offline(false);
        expect_success(a.sync.run_cycle().await);
        assert!(!a.sync.health().await.offline);
        assert_eq!(remote_snapshot(&store).await.unwrap().records.len(), 2);
    }

    #[tokio::test]
    async fn test_integrity_failure_restores_backup_then_next_cycle_succeeds() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");

        write(&a.db, "t1", "keep");
        expect_success(a.sync.run_cycle().await);

        a.db.execute_batch("DROP TABLE catalog_records;").unwrap();

        match a.sync.run_cycle().await {
            CycleResult::Failed { kind, recovery, .. } => {
                assert_eq!(kind, FailureKind::IntegrityFailure);
                assert!(matches!(recovery, Some(RecoveryOutcome::Restored { .. })));
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let report = expect_success(a.sync.run_cycle().await);
        assert!(report.conflicts.is_empty());
        assert_eq!(value_of(&a.db, "t1").as_deref(), Some("keep"));
    }

    #[tokio::test]
    async fn test_corrupt_store_file_is_restored_then_next_cycle_succeeds() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");

        for i in 0..50 {
            write(&a.db, &format!("t{}", i), "keep");
        }
        expect_success(a.sync.run_cycle().await);
        corrupt_pages(&a.db);

        match a.sync.run_cycle().await {
            CycleResult::Failed { kind, recovery, .. } => {
                assert_eq!(kind, FailureKind::IntegrityFailure);
                assert!(matches!(recovery, Some(RecoveryOutcome::Restored { .. })));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(store.get(LEASE_KEY).await.unwrap().is_none());

        expect_success(a.sync.run_cycle().await);
        assert_eq!(value_of(&a.db, "t49").as_deref(), Some("keep"));
    }

    #[tokio::test]
    async fn test_major_version_mismatch_aborts_before_mutation() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");
        write(&a.db, "t1", "local");

        let foreign = CatalogSnapshot {
            schema_version: VersionTriple::new(2, 0, 0),
            generation: 7,
            updated_by: "future".to_string(),
            updated_at: chrono::Utc::now(),
            records: vec![],
        };
        let bytes = encode_snapshot(&foreign).unwrap();
        store.create_if_absent(CATALOG_KEY, bytes.clone()).await.unwrap();

        match a.sync.run_cycle().await {
            CycleResult::Failed { kind, recovery, .. } => {
                assert_eq!(kind, FailureKind::VersionIncompatible);
                assert!(recovery.is_none());
            }
            other => panic!("expected failure, got {:?}", other),
        }

        assert_eq!(a.db.schema_version().unwrap(), CURRENT_SCHEMA);
        assert!(a.db.get_local_record("t1").unwrap().unwrap().dirty);
        assert_eq!(store.get(CATALOG_KEY).await.unwrap().unwrap().data, bytes);

        // Lease was released on the way out
        let observer = LockManager::new(
            Arc::new(store.clone()),
            LEASE_KEY,
            "observer",
            Duration::from_secs(2),
        );
        assert!(observer.acquire(Duration::from_secs(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_newer_minor_remote_is_accepted_and_kept() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");
        write(&a.db, "t1", "local");

        let newer = CatalogSnapshot {
            schema_version: VersionTriple::new(1, 9, 0),
            generation: 3,
            updated_by: "newer-build".to_string(),
            updated_at: chrono::Utc::now(),
            records: vec![],
        };
        store
            .create_if_absent(CATALOG_KEY, encode_snapshot(&newer).unwrap())
            .await
            .unwrap();

        let report = expect_success(a.sync.run_cycle().await);
        assert_eq!(report.remote_generation, 4);

        let remote = remote_snapshot(&store).await.unwrap();
        assert_eq!(remote.schema_version, VersionTriple::new(1, 9, 0));
        assert_eq!(remote.records.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_remote_falls_back_to_remote_backup() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");

        write(&a.db, "t1", "one");
        expect_success(a.sync.run_cycle().await);
        write(&a.db, "t2", "two");
        expect_success(a.sync.run_cycle().await);

        store.put(CATALOG_KEY, b"not a catalog".to_vec()).await.unwrap();
        write(&a.db, "t3", "three");

        expect_success(a.sync.run_cycle().await);

        let remote = remote_snapshot(&store).await.unwrap();
        let ids: Vec<&str> = remote.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
    }

    // ========================================================================
    // Serialization & cancellation
    // ========================================================================

    #[tokio::test]
    async fn test_concurrent_trigger_is_dropped() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");
        write(&a.db, "t1", "x");

        let (first, second) = tokio::join!(a.sync.run_cycle(), a.sync.run_cycle());

        assert!(first.is_success());
        assert!(matches!(second, CycleResult::AlreadyRunning));
    }

    #[tokio::test]
    async fn test_queued_trigger_waits_its_turn() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");
        write(&a.db, "t1", "x");

        let (first, second) = tokio::join!(a.sync.run_cycle(), a.sync.run_cycle_queued());

        assert!(first.is_success());
        assert!(second.is_success());
        assert_eq!(a.sync.history().get_history(10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_after_cycle() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");
        write(&a.db, "t1", "x");

        let (result, ()) = tokio::join!(a.sync.run_cycle(), a.sync.wait_idle());

        assert!(result.is_success());
        assert!(remote_snapshot(&store).await.is_some());
    }

    #[tokio::test]
    async fn test_dropped_cycle_is_cancelled_and_releases_lease() {
        let store = MemoryStore::new();
        let gated = GatedStore::new(&store, Gate::Read);
        let a = instance_with(Arc::new(gated.clone()), "a", |_| {});
        let b = instance(&store, "b");
        write(&a.db, "t1", "x");

        {
            let cycle = a.sync.run_cycle();
            tokio::pin!(cycle);
            tokio::select! {
                _ = &mut cycle => panic!("cycle finished while the catalog read was held"),
                _ = gated.entered.notified() => {}
            }
            assert_eq!(a.sync.state().await.phase, SyncPhase::CheckVersions);
            assert!(store.get(LEASE_KEY).await.unwrap().is_some());
        }

        gated.open();
        a.sync.wait_idle().await;

        assert!(store.get(LEASE_KEY).await.unwrap().is_none());
        assert!(store.get(CATALOG_KEY).await.unwrap().is_none());
        assert!(a.db.get_local_record("t1").unwrap().unwrap().dirty);

        let last = a.sync.history().get_history(1).unwrap();
        assert_eq!(last[0].failure_kind.as_deref(), Some("cancelled"));

        expect_success(b.sync.run_cycle().await);
    }

    #[tokio::test]
    async fn test_dropped_cycle_past_upload_runs_to_completion() {
        let store = MemoryStore::new();
        let gated = GatedStore::new(&store, Gate::Upload);
        let a = instance_with(Arc::new(gated.clone()), "a", |_| {});
        write(&a.db, "t1", "x");

        {
            let cycle = a.sync.run_cycle();
            tokio::pin!(cycle);
            tokio::select! {
                _ = &mut cycle => panic!("cycle finished while the upload was held"),
                _ = gated.entered.notified() => {}
            }
            assert_eq!(a.sync.state().await.phase, SyncPhase::Upload);
        }

        gated.open();
        a.sync.wait_idle().await;

        assert!(store.get(LEASE_KEY).await.unwrap().is_none());
        assert_eq!(remote_snapshot(&store).await.unwrap().records.len(), 1);
        assert!(!a.db.get_local_record("t1").unwrap().unwrap().dirty);
        assert_eq!(a.sync.history().get_history(1).unwrap()[0].outcome, "success");
    }

    #[tokio::test]
    async fn test_scheduler_stop_mid_cycle_releases_lease() {
        let store = MemoryStore::new();
        let gated = GatedStore::new(&store, Gate::Read);
        let a = instance_with(Arc::new(gated.clone()), "a", |_| {});
        let b = instance(&store, "b");
        write(&a.db, "t1", "x");

        let scheduler = BackgroundScheduler::new(a.db.clone());
        scheduler.load_config(60).await.unwrap();
        scheduler.start(a.sync.clone()).await.unwrap();

        gated.entered.notified().await;
        assert!(store.get(LEASE_KEY).await.unwrap().is_some());

        scheduler.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        gated.open();
        a.sync.wait_idle().await;

        assert!(store.get(LEASE_KEY).await.unwrap().is_none());
        expect_success(b.sync.run_cycle().await);
    }

    #[tokio::test]
    async fn test_hung_remote_backup_is_bounded_by_network_timeout() {
        let store = MemoryStore::new();
        let first = instance(&store, "first");
        write(&first.db, "t1", "x");
        expect_success(first.sync.run_cycle().await);

        let gated = GatedStore::new(&store, Gate::BackupWrite);
        let a = instance_with(Arc::new(gated), "a", |o| {
            o.network_timeout = Duration::from_millis(200);
        });
        write(&a.db, "t2", "y");

        let started = std::time::Instant::now();
        match a.sync.run_cycle().await {
            CycleResult::Failed { kind, .. } => assert_eq!(kind, FailureKind::NetworkFailure),
            other => panic!("expected network failure, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(5));

        assert!(store.get(LEASE_KEY).await.unwrap().is_none());
        assert_eq!(remote_snapshot(&store).await.unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_leaves_remote_untouched() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");
        let b = instance(&store, "b");
        write(&a.db, "t1", "x");

        a.sync.shutdown_token().cancel();
        match a.sync.run_cycle().await {
            CycleResult::Failed { kind, .. } => assert_eq!(kind, FailureKind::Cancelled),
            other => panic!("expected cancellation, got {:?}", other),
        }

        assert!(store.get(CATALOG_KEY).await.unwrap().is_none());
        assert!(a.db.get_local_record("t1").unwrap().unwrap().dirty);

        // Lease was released: another instance proceeds immediately
        expect_success(b.sync.run_cycle().await);
    }

    #[tokio::test]
    async fn test_health_and_history_track_outcomes() {
        let store = MemoryStore::new();
        let a = instance(&store, "a");

        let initial = a.sync.health().await;
        assert_eq!(initial.phase, SyncPhase::Idle);
        assert!(initial.last_sync_at.is_none());

        write(&a.db, "t1", "x");
        expect_success(a.sync.run_cycle().await);

        let health = a.sync.health().await;
        assert_eq!(health.instance_id, "a");
        assert_eq!(health.last_outcome.as_deref(), Some("success"));
        assert!(health.last_sync_at.is_some());
        assert_eq!(health.pending_changes, 0);

        let history = a.sync.history().get_history(5).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].uploaded);
        assert_eq!(history[0].instance_id, "a");
    }
}
