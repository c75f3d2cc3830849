#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::block::BlockUcState;
    use crate::editlog::{EditLog, EditRecord, MemEditLog, TxRecord};
    use crate::fs_meta_service::{FsMetaConfig, FsMetaService};
    use crate::{FsMetaError, FsMetaResult};

    fn init_log() {
        let _ = simplelog::SimpleLogger::init(
            log::LevelFilter::Debug,
            simplelog::Config::default(),
        );
    }

    fn test_config(dir: &Path) -> FsMetaConfig {
        let mut config = FsMetaConfig::new(dir.join("checkpoints"));
        config.lease_sweep_interval = Duration::from_secs(1);
        config
    }

    async fn start_service(dir: &Path, editlog: Arc<dyn EditLog>) -> FsMetaService {
        FsMetaService::start(test_config(dir), editlog)
            .await
            .unwrap()
    }

    /// Edit log that can be told to refuse appends, for rollback tests.
    /// `fail` refuses everything; `fail_next` refuses that many appends and
    /// then recovers.
    struct FlakyEditLog {
        inner: MemEditLog,
        fail: AtomicBool,
        fail_next: AtomicU32,
    }

    impl FlakyEditLog {
        fn new() -> Self {
            Self {
                inner: MemEditLog::new(),
                fail: AtomicBool::new(false),
                fail_next: AtomicU32::new(0),
            }
        }

        fn take_fail_next(&self) -> bool {
            self.fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl EditLog for FlakyEditLog {
        async fn append(&self, record: EditRecord) -> FsMetaResult<u64> {
            if self.fail.load(Ordering::SeqCst) || self.take_fail_next() {
                return Err(FsMetaError::Internal("journal unavailable".to_string()));
            }
            self.inner.append(record).await
        }

        async fn replay_since(&self, txid: u64) -> FsMetaResult<Vec<TxRecord>> {
            self.inner.replay_since(txid).await
        }
    }

    // ==================== Namespace Tests ====================

    #[tokio::test]
    async fn test_namespace_basics() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(MemEditLog::new());
        let svc = start_service(tmp.path(), log).await;

        svc.mkdir_p("/a/b").await.unwrap();
        svc.create_file("/a/b/f", "c1").await.unwrap();
        assert!(svc.exists("/a/b/f"));
        assert!(svc.is_directory("/a/b").unwrap());
        assert!(!svc.is_directory("/a/b/f").unwrap());
        assert_eq!(svc.list_dir("/a/b").unwrap(), vec!["f"]);

        assert!(matches!(
            svc.create_file("/a/b/f", "c2").await,
            Err(FsMetaError::AlreadyExists(_))
        ));
        assert!(matches!(
            svc.create_file("/missing/f", "c1").await,
            Err(FsMetaError::NotFound(_))
        ));
        assert!(matches!(
            svc.mkdir_p("/a/b/f/sub").await,
            Err(FsMetaError::NotDirectory(_))
        ));
        assert!(matches!(
            svc.mkdir_p("/a//b").await,
            Err(FsMetaError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_moves_lease() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(MemEditLog::new());
        let svc = start_service(tmp.path(), log).await;

        svc.mkdir_p("/a").await.unwrap();
        svc.mkdir_p("/b").await.unwrap();
        svc.create_file("/a/open", "c1").await.unwrap();
        svc.rename_file("/a/open", "/b/open").await.unwrap();

        assert!(!svc.exists("/a/open"));
        assert!(svc.exists("/b/open"));
        assert_eq!(svc.lease_holder("/a/open").unwrap(), None);
        assert_eq!(svc.lease_holder("/b/open").unwrap(), Some("c1".to_string()));
        // the open file is still writable under its new path
        svc.add_block("/b/open", "c1").await.unwrap();
        svc.sync_length("/b/open", "c1", 3).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_releases_lease() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(MemEditLog::new());
        let svc = start_service(tmp.path(), log).await;

        svc.create_file("/f", "c1").await.unwrap();
        svc.delete_file("/f").await.unwrap();
        assert!(!svc.exists("/f"));
        assert_eq!(svc.lease_holder("/f").unwrap(), None);
        // path is reusable by another client right away
        svc.create_file("/f", "c2").await.unwrap();
        assert_eq!(svc.lease_holder("/f").unwrap(), Some("c2".to_string()));
    }

    // ==================== Write Path Tests ====================

    #[tokio::test]
    async fn test_write_close_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(MemEditLog::new());
        let svc = start_service(tmp.path(), log).await;

        svc.mkdir_p("/d").await.unwrap();
        svc.create_file("/d/f", "c1").await.unwrap();
        let blk = svc.add_block("/d/f", "c1").await.unwrap();
        assert_eq!(blk.state, BlockUcState::UnderConstruction);

        svc.sync_length("/d/f", "c1", 5).await.unwrap();
        let blocks = svc.blocks_of("/d/f").unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].state, BlockUcState::Committed);
        assert_eq!(blocks[0].len, 5);
        assert!(svc.stat("/d/f").unwrap().under_construction);

        svc.close_file("/d/f", "c1", 5).await.unwrap();
        let st = svc.stat("/d/f").unwrap();
        assert!(!st.under_construction);
        assert_eq!(st.len, 5);
        assert!(svc.blocks_of("/d/f").unwrap()[0].is_complete());
        assert_eq!(svc.lease_holder("/d/f").unwrap(), None);

        // closed file takes no more writes
        assert!(matches!(
            svc.sync_length("/d/f", "c1", 9).await,
            Err(FsMetaError::LeaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_multi_block_file() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(MemEditLog::new());
        let svc = start_service(tmp.path(), log).await;

        svc.create_file("/f", "c1").await.unwrap();
        let b1 = svc.add_block("/f", "c1").await.unwrap();
        svc.sync_length("/f", "c1", 4).await.unwrap();
        let b2 = svc.add_block("/f", "c1").await.unwrap();
        assert_ne!(b1.id, b2.id);

        // allocating the next block finalizes the previous one
        let blocks = svc.blocks_of("/f").unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].is_complete());
        assert_eq!(blocks[0].len, 4);
        assert_eq!(blocks[1].state, BlockUcState::UnderConstruction);

        svc.sync_length("/f", "c1", 2).await.unwrap();
        svc.close_file("/f", "c1", 2).await.unwrap();
        assert_eq!(svc.stat("/f").unwrap().len, 6);
        assert!(svc.blocks_of("/f").unwrap().iter().all(|b| b.is_complete()));
    }

    #[tokio::test]
    async fn test_reopen_append_bumps_gen_stamp() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(MemEditLog::new());
        let svc = start_service(tmp.path(), log).await;

        svc.create_file("/f", "c1").await.unwrap();
        svc.add_block("/f", "c1").await.unwrap();
        svc.sync_length("/f", "c1", 5).await.unwrap();
        svc.close_file("/f", "c1", 5).await.unwrap();
        let gs_before = svc.blocks_of("/f").unwrap()[0].gen_stamp;

        svc.reopen_append("/f", "c2").await.unwrap();
        let blocks = svc.blocks_of("/f").unwrap();
        assert_eq!(blocks[0].state, BlockUcState::UnderConstruction);
        assert!(blocks[0].gen_stamp > gs_before);
        assert!(svc.stat("/f").unwrap().under_construction);
        assert_eq!(svc.lease_holder("/f").unwrap(), Some("c2".to_string()));

        svc.sync_length("/f", "c2", 9).await.unwrap();
        svc.close_file("/f", "c2", 9).await.unwrap();
        assert_eq!(svc.stat("/f").unwrap().len, 9);
    }

    // ==================== Lease Tests ====================

    #[tokio::test]
    async fn test_lease_contention() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(MemEditLog::new());
        let svc = start_service(tmp.path(), log).await;

        svc.create_file("/f", "alice").await.unwrap();
        svc.add_block("/f", "alice").await.unwrap();

        assert!(matches!(
            svc.sync_length("/f", "bob", 3).await,
            Err(FsMetaError::AlreadyLeased(_))
        ));
        assert!(matches!(
            svc.add_block("/f", "bob").await,
            Err(FsMetaError::AlreadyLeased(_))
        ));
        assert!(matches!(
            svc.reopen_append("/f", "bob").await,
            Err(FsMetaError::AlreadyLeased(_))
        ));
        // the rightful holder is unaffected
        svc.sync_length("/f", "alice", 3).await.unwrap();
        svc.renew_lease("alice").unwrap();
    }

    #[tokio::test]
    async fn test_lease_hard_expiry_recovery() {
        init_log();
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(MemEditLog::new());
        let mut config = test_config(tmp.path());
        config.lease.soft_limit = Duration::ZERO;
        config.lease.hard_limit = Duration::ZERO;
        // keep the background sweep out of the way; recovery is called by hand
        config.lease_sweep_interval = Duration::from_secs(3600);
        let svc = FsMetaService::start(config, log).await.unwrap();

        svc.create_file("/f", "c1").await.unwrap();
        svc.add_block("/f", "c1").await.unwrap();
        svc.sync_length("/f", "c1", 3).await.unwrap();

        let recovered = svc.recover_expired_leases().await.unwrap();
        assert_eq!(recovered, vec!["/f"]);

        // closed at the last committed length, lease gone
        let st = svc.stat("/f").unwrap();
        assert!(!st.under_construction);
        assert_eq!(st.len, 3);
        assert!(svc.blocks_of("/f").unwrap()[0].is_complete());
        assert_eq!(svc.lease_holder("/f").unwrap(), None);

        // nothing left to recover
        assert!(svc.recover_expired_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expiry_discards_unsynced_tail() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(MemEditLog::new());
        let mut config = test_config(tmp.path());
        config.lease.soft_limit = Duration::ZERO;
        config.lease.hard_limit = Duration::ZERO;
        config.lease_sweep_interval = Duration::from_secs(3600);
        let svc = FsMetaService::start(config, log).await.unwrap();

        // block allocated but no length ever synced
        svc.create_file("/f", "c1").await.unwrap();
        svc.add_block("/f", "c1").await.unwrap();

        let recovered = svc.recover_expired_leases().await.unwrap();
        assert_eq!(recovered, vec!["/f"]);
        assert_eq!(svc.stat("/f").unwrap().len, 0);
        assert!(!svc.stat("/f").unwrap().under_construction);
    }

    #[tokio::test]
    async fn test_recovery_retries_right_after_journal_failure() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(FlakyEditLog::new());
        let mut config = test_config(tmp.path());
        config.lease.soft_limit = Duration::ZERO;
        config.lease.hard_limit = Duration::from_secs(1);
        config.lease_sweep_interval = Duration::from_secs(3600);
        let svc = FsMetaService::start(config, log.clone()).await.unwrap();

        svc.create_file("/f", "c1").await.unwrap();
        svc.add_block("/f", "c1").await.unwrap();
        svc.sync_length("/f", "c1", 3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1300)).await;

        // journal down: nothing recovered, file and lease rolled back
        log.fail.store(true, Ordering::SeqCst);
        assert!(svc.recover_expired_leases().await.unwrap().is_empty());
        assert!(svc.stat("/f").unwrap().under_construction);
        assert_eq!(svc.lease_holder("/f").unwrap(), Some("c1".to_string()));

        // journal back: the very next sweep must pick the lease up again,
        // not wait out another hard limit
        log.fail.store(false, Ordering::SeqCst);
        assert_eq!(svc.recover_expired_leases().await.unwrap(), vec!["/f"]);
        assert!(!svc.stat("/f").unwrap().under_construction);
        assert_eq!(svc.stat("/f").unwrap().len, 3);
    }

    #[tokio::test]
    async fn test_recovery_continues_past_failing_path() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(FlakyEditLog::new());
        let mut config = test_config(tmp.path());
        config.lease.soft_limit = Duration::ZERO;
        config.lease.hard_limit = Duration::from_secs(1);
        config.lease_sweep_interval = Duration::from_secs(3600);
        let svc = FsMetaService::start(config, log.clone()).await.unwrap();

        svc.create_file("/a", "c1").await.unwrap();
        svc.create_file("/b", "c2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1300)).await;

        // the first close (paths are swept in order) hits a journal error;
        // the sweep must still recover the second
        log.fail_next.store(1, Ordering::SeqCst);
        assert_eq!(svc.recover_expired_leases().await.unwrap(), vec!["/b"]);
        assert!(svc.stat("/a").unwrap().under_construction);
        assert!(!svc.stat("/b").unwrap().under_construction);

        assert_eq!(svc.recover_expired_leases().await.unwrap(), vec!["/a"]);
        assert!(!svc.stat("/a").unwrap().under_construction);
    }

    // ==================== Safe Mode Tests ====================

    #[tokio::test]
    async fn test_safe_mode_blocks_mutations() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(MemEditLog::new());
        let svc = start_service(tmp.path(), log).await;

        svc.mkdir_p("/a").await.unwrap();
        svc.enter_safe_mode().await.unwrap();
        svc.enter_safe_mode().await.unwrap(); // idempotent
        assert!(svc.is_in_safe_mode());

        assert!(matches!(
            svc.mkdir_p("/b").await,
            Err(FsMetaError::SafeModeViolation(_))
        ));
        assert!(matches!(
            svc.create_file("/a/f", "c1").await,
            Err(FsMetaError::SafeModeViolation(_))
        ));
        // reads still work
        assert!(svc.exists("/a"));
        assert_eq!(svc.list_dir("/").unwrap(), vec!["a"]);

        svc.leave_safe_mode().unwrap();
        svc.leave_safe_mode().unwrap(); // idempotent
        svc.mkdir_p("/b").await.unwrap();
    }

    #[tokio::test]
    async fn test_save_requires_safe_mode() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(MemEditLog::new());
        let svc = start_service(tmp.path(), log).await;

        assert!(matches!(
            svc.save_namespace().await,
            Err(FsMetaError::NotInSafeMode(_))
        ));
        svc.enter_safe_mode().await.unwrap();
        svc.save_namespace().await.unwrap();
        svc.leave_safe_mode().unwrap();
    }

    // ==================== Checkpoint / Restart Tests ====================

    #[tokio::test]
    async fn test_checkpoint_restart_under_construction() {
        init_log();
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(MemEditLog::new());

        let blocks_before;
        {
            let mut svc = start_service(tmp.path(), log.clone()).await;

            // empty, closed file f1
            svc.mkdir_p("/abc/def").await.unwrap();
            svc.create_file("/abc/def/f1", "client_1").await.unwrap();
            svc.close_file("/abc/def/f1", "client_1", 0).await.unwrap();

            // f2: five bytes written and length-synced, still open
            svc.create_file("/abc/def/f2", "client_2").await.unwrap();
            svc.add_block("/abc/def/f2", "client_2").await.unwrap();
            svc.sync_length("/abc/def/f2", "client_2", 5).await.unwrap();
            blocks_before = svc.blocks_of("/abc/def/f2").unwrap();

            svc.enter_safe_mode().await.unwrap();
            svc.save_namespace().await.unwrap();
            svc.leave_safe_mode().unwrap();
            svc.shutdown();
        }

        let svc = start_service(tmp.path(), log).await;

        assert!(svc.is_directory("/abc/def").unwrap());
        let f1 = svc.stat("/abc/def/f1").unwrap();
        assert_eq!(f1.len, 0);
        assert!(!f1.under_construction);

        let f2 = svc.stat("/abc/def/f2").unwrap();
        assert_eq!(f2.len, 5);
        assert!(f2.under_construction);
        assert_eq!(f2.block_count, 1);
        let blocks = svc.blocks_of("/abc/def/f2").unwrap();
        assert_eq!(blocks[0].state, BlockUcState::Committed);
        // id, generation stamp, length and state all survive verbatim
        assert_eq!(blocks, blocks_before);

        let lease = svc.lease_by_path("/abc/def/f2").unwrap().unwrap();
        assert_eq!(lease.holder, "client_2");
        // and the writer can carry on
        svc.sync_length("/abc/def/f2", "client_2", 8).await.unwrap();
        svc.close_file("/abc/def/f2", "client_2", 8).await.unwrap();
        assert_eq!(svc.stat("/abc/def/f2").unwrap().len, 8);
    }

    #[tokio::test]
    async fn test_restart_replays_edits_after_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(MemEditLog::new());
        {
            let mut svc = start_service(tmp.path(), log.clone()).await;
            svc.mkdir_p("/a").await.unwrap();
            svc.create_file("/a/f1", "c1").await.unwrap();
            svc.close_file("/a/f1", "c1", 0).await.unwrap();

            svc.enter_safe_mode().await.unwrap();
            svc.save_namespace().await.unwrap();
            svc.leave_safe_mode().unwrap();

            // mutations after the checkpoint live only in the edit log
            svc.mkdir_p("/b").await.unwrap();
            svc.create_file("/b/f2", "c2").await.unwrap();
            svc.shutdown();
        }

        let svc = start_service(tmp.path(), log).await;
        assert!(svc.exists("/a/f1"));
        assert!(svc.is_directory("/b").unwrap());
        let f2 = svc.stat("/b/f2").unwrap();
        assert!(f2.under_construction);
        assert_eq!(svc.lease_holder("/b/f2").unwrap(), Some("c2".to_string()));
    }

    #[tokio::test]
    async fn test_restart_round_trip_is_stable() {
        let tmp = TempDir::new().unwrap();
        {
            let mut svc = start_service(tmp.path(), Arc::new(MemEditLog::new())).await;
            svc.mkdir_p("/x/y").await.unwrap();
            svc.create_file("/x/y/closed", "c1").await.unwrap();
            svc.add_block("/x/y/closed", "c1").await.unwrap();
            svc.close_file("/x/y/closed", "c1", 7).await.unwrap();
            svc.create_file("/x/open", "c2").await.unwrap();
            svc.add_block("/x/open", "c2").await.unwrap();
            svc.sync_length("/x/open", "c2", 2).await.unwrap();

            svc.enter_safe_mode().await.unwrap();
            svc.save_namespace().await.unwrap();
            svc.leave_safe_mode().unwrap();
            svc.shutdown();
        }

        // a fresh, empty edit log: the image alone must reproduce the state
        let svc = start_service(tmp.path(), Arc::new(MemEditLog::new())).await;
        assert_eq!(svc.list_dir("/x").unwrap(), vec!["open", "y"]);
        assert_eq!(svc.stat("/x/y/closed").unwrap().len, 7);
        assert!(!svc.stat("/x/y/closed").unwrap().under_construction);
        assert_eq!(svc.stat("/x/open").unwrap().len, 2);
        assert!(svc.stat("/x/open").unwrap().under_construction);
        assert_eq!(svc.lease_holder("/x/open").unwrap(), Some("c2".to_string()));
        assert_eq!(svc.lease_holder("/x/y/closed").unwrap(), None);

        // saving again from the reloaded state keeps it identical
        svc.enter_safe_mode().await.unwrap();
        svc.save_namespace().await.unwrap();
        svc.leave_safe_mode().unwrap();
        drop(svc);

        let svc = start_service(tmp.path(), Arc::new(MemEditLog::new())).await;
        assert_eq!(svc.stat("/x/open").unwrap().len, 2);
        assert_eq!(svc.lease_holder("/x/open").unwrap(), Some("c2".to_string()));
    }

    #[tokio::test]
    async fn test_corrupt_newest_image_falls_back() {
        let tmp = TempDir::new().unwrap();
        {
            let mut svc = start_service(tmp.path(), Arc::new(MemEditLog::new())).await;
            svc.mkdir_p("/first").await.unwrap();
            svc.enter_safe_mode().await.unwrap();
            svc.save_namespace().await.unwrap();
            svc.leave_safe_mode().unwrap();

            svc.mkdir_p("/second").await.unwrap();
            svc.enter_safe_mode().await.unwrap();
            svc.save_namespace().await.unwrap();
            svc.leave_safe_mode().unwrap();
            svc.shutdown();
        }

        let ckpt_dir = tmp.path().join("checkpoints");
        std::fs::write(ckpt_dir.join("fsimage_0000000002.json"), b"garbage").unwrap();

        // empty edit log: what we see comes from the surviving image only
        let svc = start_service(tmp.path(), Arc::new(MemEditLog::new())).await;
        assert!(svc.exists("/first"));
        assert!(!svc.exists("/second"));
        drop(svc);

        std::fs::write(ckpt_dir.join("fsimage_0000000001.json"), b"garbage").unwrap();
        let err = FsMetaService::start(test_config(tmp.path()), Arc::new(MemEditLog::new())).await;
        assert!(matches!(err, Err(FsMetaError::CorruptCheckpoint(_))));
    }

    #[tokio::test]
    async fn test_first_start_is_empty() {
        let tmp = TempDir::new().unwrap();
        let svc = start_service(tmp.path(), Arc::new(MemEditLog::new())).await;
        assert!(svc.is_directory("/").unwrap());
        assert!(svc.list_dir("/").unwrap().is_empty());
        assert!(!svc.exists("/anything"));
    }

    // ==================== Edit Log Rollback Tests ====================

    #[tokio::test]
    async fn test_failed_append_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(FlakyEditLog::new());
        let svc = start_service(tmp.path(), log.clone()).await;

        svc.mkdir_p("/a").await.unwrap();
        log.fail.store(true, Ordering::SeqCst);

        assert!(svc.create_file("/a/f", "c1").await.is_err());
        assert!(!svc.exists("/a/f"));
        assert_eq!(svc.lease_holder("/a/f").unwrap(), None);

        assert!(svc.mkdir_p("/b/c").await.is_err());
        assert!(!svc.exists("/b"));

        log.fail.store(false, Ordering::SeqCst);
        svc.create_file("/a/f", "c1").await.unwrap();
        svc.add_block("/a/f", "c1").await.unwrap();

        log.fail.store(true, Ordering::SeqCst);
        let blocks = svc.blocks_of("/a/f").unwrap();
        assert!(svc.sync_length("/a/f", "c1", 5).await.is_err());
        assert_eq!(svc.blocks_of("/a/f").unwrap(), blocks);
        assert!(svc.close_file("/a/f", "c1", 5).await.is_err());
        assert!(svc.stat("/a/f").unwrap().under_construction);
        assert_eq!(svc.lease_holder("/a/f").unwrap(), Some("c1".to_string()));
    }
}
