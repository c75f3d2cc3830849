//! The metadata service: namespace tree + lease table + safe-mode gate +
//! checkpoint engine behind one context object.
//!
//! Every structural mutation passes the safe-mode gate, is applied to the
//! in-memory tree, and is then mirrored to the edit log; if the append fails
//! the in-memory change is rolled back. Startup loads the newest usable
//! checkpoint, replays the edit log past the checkpoint's transaction marker,
//! verifies the lease/under-construction invariant, and only then spawns the
//! background lease-expiry sweep.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::block::{BlockId, BlockIdAllocator, BlockInfo};
use crate::checkpoint::{CheckpointDocument, CheckpointEngine};
use crate::editlog::{EditLog, EditRecord};
use crate::lease::{Lease, LeaseConfig, LeaseManager};
use crate::namespace::{InodeBody, NamespaceTree};
use crate::safemode::SafeModeGate;
use crate::{FsMetaError, FsMetaResult};

#[derive(Debug, Clone)]
pub struct FsMetaConfig {
    pub checkpoint_dir: PathBuf,
    /// How many checkpoint images to retain (newest first).
    pub keep_checkpoints: usize,
    pub lease: LeaseConfig,
    pub lease_sweep_interval: Duration,
    pub safe_mode_drain_timeout: Duration,
    pub default_replication: u16,
}

impl FsMetaConfig {
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            keep_checkpoints: 2,
            lease: LeaseConfig::default(),
            lease_sweep_interval: Duration::from_secs(30),
            safe_mode_drain_timeout: Duration::from_secs(10),
            default_replication: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    pub len: u64,
    pub is_dir: bool,
    pub under_construction: bool,
    pub block_count: usize,
}

struct SharedState {
    tree: RwLock<NamespaceTree>,
    leases: Mutex<LeaseManager>,
    gate: SafeModeGate,
    alloc: Mutex<BlockIdAllocator>,
    editlog: Arc<dyn EditLog>,
    last_applied_txid: AtomicU64,
}

impl SharedState {
    fn tree_read(&self) -> FsMetaResult<RwLockReadGuard<'_, NamespaceTree>> {
        self.tree
            .read()
            .map_err(|e| FsMetaError::Internal(format!("tree lock poisoned: {}", e)))
    }

    fn tree_write(&self) -> FsMetaResult<RwLockWriteGuard<'_, NamespaceTree>> {
        self.tree
            .write()
            .map_err(|e| FsMetaError::Internal(format!("tree lock poisoned: {}", e)))
    }

    fn leases_lock(&self) -> FsMetaResult<MutexGuard<'_, LeaseManager>> {
        self.leases
            .lock()
            .map_err(|e| FsMetaError::Internal(format!("lease lock poisoned: {}", e)))
    }

    fn alloc_lock(&self) -> FsMetaResult<MutexGuard<'_, BlockIdAllocator>> {
        self.alloc
            .lock()
            .map_err(|e| FsMetaError::Internal(format!("allocator lock poisoned: {}", e)))
    }

    async fn journal(&self, record: EditRecord) -> FsMetaResult<u64> {
        let txid = self.editlog.append(record).await?;
        self.last_applied_txid.fetch_max(txid, Ordering::SeqCst);
        Ok(txid)
    }

    /// Apply one replayed record. The record was journaled by a previous
    /// incarnation, so it is applied directly, without gate or re-append.
    fn apply_record(&self, record: &EditRecord) -> FsMetaResult<()> {
        let now = unix_timestamp();
        match record {
            EditRecord::Mkdir { path } => {
                self.tree_write()?.mkdir_p(path)?;
            }
            EditRecord::CreateFile {
                path,
                holder,
                replication,
            } => {
                self.tree_write()?.create_file(path, *replication)?;
                self.leases_lock()?.acquire(path, holder, now)?;
            }
            EditRecord::AddBlock {
                path,
                block_id,
                gen_stamp,
            } => {
                self.alloc_lock()?.observe(*block_id, *gen_stamp);
                add_block_to_file(&mut *self.tree_write()?, path, *block_id, *gen_stamp)?;
            }
            EditRecord::SyncLength { path, len } => {
                sync_file_length(&mut *self.tree_write()?, path, *len)?;
            }
            EditRecord::CloseFile { path, len } => {
                close_file_blocks(&mut *self.tree_write()?, path, *len)?;
                if let Err(e) = self.leases_lock()?.release(path) {
                    debug!("replay: no lease to release on {}: {}", path, e);
                }
            }
            EditRecord::ReopenAppend {
                path,
                holder,
                gen_stamp,
            } => {
                self.alloc_lock()?.observe_gen_stamp(*gen_stamp);
                reopen_file(&mut *self.tree_write()?, path, *gen_stamp)?;
                self.leases_lock()?.acquire(path, holder, now)?;
            }
            EditRecord::RenameFile { from, to } => {
                self.tree_write()?.rename_file(from, to)?;
                self.leases_lock()?.rename_path(from, to);
            }
            EditRecord::DeleteFile { path } => {
                self.tree_write()?.delete_file(path)?;
                if let Err(e) = self.leases_lock()?.release(path) {
                    debug!("replay: no lease to release on {}: {}", path, e);
                }
            }
            EditRecord::Rmdir { path } => {
                self.tree_write()?.rmdir(path)?;
            }
        }
        Ok(())
    }

    /// Leased paths and under-construction files must name the same set.
    fn check_lease_invariant(&self) -> FsMetaResult<()> {
        let open_files = self.tree_read()?.under_construction_paths()?;
        let leased = self.leases_lock()?.leased_paths();
        if open_files != leased {
            return Err(FsMetaError::Internal(format!(
                "lease table and open files disagree: leases {:?}, open files {:?}",
                leased, open_files
            )));
        }
        Ok(())
    }

    /// Forcibly close every file whose lease passed the hard limit, at its
    /// last committed length. A path that fails is logged and left for the
    /// next sweep; the rest of the batch still runs. Returns the recovered
    /// paths.
    async fn recover_expired(&self) -> FsMetaResult<Vec<String>> {
        let _guard = self.gate.begin_mutation()?;
        let now = unix_timestamp();
        let expired = self.leases_lock()?.expired_paths(now);
        let mut recovered = Vec::new();
        for path in expired {
            match self.recover_one(&path).await {
                Ok(true) => recovered.push(path),
                Ok(false) => {}
                Err(e) => warn!("lease recovery of {} failed: {}", path, e),
            }
        }
        Ok(recovered)
    }

    async fn recover_one(&self, path: &str) -> FsMetaResult<bool> {
        let prev_blocks;
        let len;
        let holder;
        let last_renewed;
        {
            let mut tree = self.tree_write()?;
            let mut leases = self.leases_lock()?;
            let lease = match leases.lease_by_path(path) {
                Some(lease) => lease,
                None => {
                    // released between the expiry scan and here
                    debug!("lease recovery: {} no longer leased", path);
                    return Ok(false);
                }
            };
            holder = lease.holder.clone();
            last_renewed = lease.last_renewed;
            let file = match tree.file_mut(path) {
                Ok(file) => file,
                Err(e) => {
                    warn!("lease recovery: {} is gone from the tree: {}", path, e);
                    let _ = leases.release(path);
                    return Ok(false);
                }
            };
            prev_blocks = file.blocks.clone();
            // un-synced trailing bytes are discarded: the block closes at
            // the length recorded by the last commit
            len = file.blocks.last().map(|b| b.len).unwrap_or(0);
            close_file_blocks(&mut tree, path, len)?;
            let _ = leases.release(path);
        }
        match self
            .journal(EditRecord::CloseFile {
                path: path.to_string(),
                len,
            })
            .await
        {
            Ok(_) => {
                info!(
                    "lease recovery: closed {} at {} bytes (holder {})",
                    path, len, holder
                );
                Ok(true)
            }
            Err(e) => {
                // put the file and lease back, keeping the stale renewal time
                // so the next sweep retries right away
                if let Ok(mut tree) = self.tree_write() {
                    if let Ok(file) = tree.file_mut(path) {
                        file.blocks = prev_blocks;
                        file.under_construction = true;
                    }
                }
                if let Ok(mut leases) = self.leases_lock() {
                    leases.reinstate(path, &holder, last_renewed);
                }
                warn!("lease recovery: journaling close of {} failed: {}", path, e);
                Ok(false)
            }
        }
    }
}

pub struct FsMetaService {
    shared: Arc<SharedState>,
    engine: CheckpointEngine,
    config: FsMetaConfig,
    lease_sweep_handle: Option<JoinHandle<()>>,
}

impl FsMetaService {
    /// Bring the service up: load the newest usable checkpoint (or start
    /// empty), replay the edit log past the checkpoint marker, check the
    /// lease invariant, then start the lease-expiry sweep.
    pub async fn start(config: FsMetaConfig, editlog: Arc<dyn EditLog>) -> FsMetaResult<Self> {
        let engine = CheckpointEngine::new(&config.checkpoint_dir, config.keep_checkpoints);
        let (tree, lease_mgr, alloc, last_txid) = match engine.load().await? {
            Some(img) => (
                img.tree,
                LeaseManager::restore(config.lease, img.leases),
                img.allocator,
                img.last_txid,
            ),
            None => {
                info!("no checkpoint found, starting with an empty namespace");
                (
                    NamespaceTree::new(),
                    LeaseManager::new(config.lease),
                    BlockIdAllocator::new(),
                    0,
                )
            }
        };
        let shared = Arc::new(SharedState {
            tree: RwLock::new(tree),
            leases: Mutex::new(lease_mgr),
            gate: SafeModeGate::new(),
            alloc: Mutex::new(alloc),
            editlog: editlog.clone(),
            last_applied_txid: AtomicU64::new(last_txid),
        });

        let records = editlog.replay_since(last_txid).await?;
        if !records.is_empty() {
            info!(
                "replaying {} edit records after txid {}",
                records.len(),
                last_txid
            );
        }
        for tx in records {
            shared.apply_record(&tx.record)?;
            shared.last_applied_txid.fetch_max(tx.txid, Ordering::SeqCst);
        }
        shared.check_lease_invariant()?;

        let lease_sweep_handle =
            Self::start_lease_sweep_task(shared.clone(), config.lease_sweep_interval);
        Ok(Self {
            shared,
            engine,
            config,
            lease_sweep_handle: Some(lease_sweep_handle),
        })
    }

    fn start_lease_sweep_task(shared: Arc<SharedState>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // skip the immediate first tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match shared.recover_expired().await {
                    Ok(paths) if !paths.is_empty() => {
                        info!("lease sweep: recovered {} expired leases", paths.len());
                    }
                    Ok(_) => {}
                    Err(FsMetaError::SafeModeViolation(_)) => {
                        debug!("lease sweep skipped while in safe mode");
                    }
                    Err(e) => warn!("lease sweep failed: {}", e),
                }
            }
        })
    }

    /// Stop background activity. Also done on drop.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.lease_sweep_handle.take() {
            handle.abort();
        }
    }

    // ===== namespace operations =====

    pub async fn mkdir_p(&self, path: &str) -> FsMetaResult<()> {
        let _guard = self.shared.gate.begin_mutation()?;
        let created = {
            let mut tree = self.shared.tree_write()?;
            let (_, created) = tree.mkdir_p(path)?;
            created
        };
        if created.is_empty() {
            // every directory already existed
            return Ok(());
        }
        match self
            .shared
            .journal(EditRecord::Mkdir {
                path: path.to_string(),
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Ok(mut tree) = self.shared.tree_write() {
                    tree.drop_created(&created);
                }
                Err(e)
            }
        }
    }

    /// Create a new file open for write and grant `holder` its lease.
    pub async fn create_file(&self, path: &str, holder: &str) -> FsMetaResult<()> {
        let _guard = self.shared.gate.begin_mutation()?;
        let replication = self.config.default_replication;
        let now = unix_timestamp();
        {
            let mut tree = self.shared.tree_write()?;
            let id = tree.create_file(path, replication)?;
            if let Err(e) = self.shared.leases_lock()?.acquire(path, holder, now) {
                tree.drop_created(&[id]);
                return Err(e);
            }
        }
        match self
            .shared
            .journal(EditRecord::CreateFile {
                path: path.to_string(),
                holder: holder.to_string(),
                replication,
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Ok(mut tree) = self.shared.tree_write() {
                    let _ = tree.delete_file(path);
                }
                if let Ok(mut leases) = self.shared.leases_lock() {
                    let _ = leases.release(path);
                }
                Err(e)
            }
        }
    }

    pub async fn delete_file(&self, path: &str) -> FsMetaResult<()> {
        let _guard = self.shared.gate.begin_mutation()?;
        let (removed, holder) = {
            let mut tree = self.shared.tree_write()?;
            let removed = tree.delete_file(path)?;
            let holder = self.shared.leases_lock()?.release(path).ok();
            (removed, holder)
        };
        match self
            .shared
            .journal(EditRecord::DeleteFile {
                path: path.to_string(),
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Ok(mut tree) = self.shared.tree_write() {
                    let _ = tree.reinsert(removed);
                }
                if let Some(holder) = holder {
                    if let Ok(mut leases) = self.shared.leases_lock() {
                        let _ = leases.acquire(path, &holder, unix_timestamp());
                    }
                }
                Err(e)
            }
        }
    }

    pub async fn rmdir(&self, path: &str) -> FsMetaResult<()> {
        let _guard = self.shared.gate.begin_mutation()?;
        let removed = {
            let mut tree = self.shared.tree_write()?;
            tree.rmdir(path)?
        };
        match self
            .shared
            .journal(EditRecord::Rmdir {
                path: path.to_string(),
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Ok(mut tree) = self.shared.tree_write() {
                    let _ = tree.reinsert(removed);
                }
                Err(e)
            }
        }
    }

    pub async fn rename_file(&self, from: &str, to: &str) -> FsMetaResult<()> {
        let _guard = self.shared.gate.begin_mutation()?;
        {
            let mut tree = self.shared.tree_write()?;
            tree.rename_file(from, to)?;
            self.shared.leases_lock()?.rename_path(from, to);
        }
        match self
            .shared
            .journal(EditRecord::RenameFile {
                from: from.to_string(),
                to: to.to_string(),
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Ok(mut tree) = self.shared.tree_write() {
                    let _ = tree.rename_file(to, from);
                }
                if let Ok(mut leases) = self.shared.leases_lock() {
                    leases.rename_path(to, from);
                }
                Err(e)
            }
        }
    }

    // ===== write path =====

    fn check_holder(&self, path: &str, holder: &str) -> FsMetaResult<()> {
        let now = unix_timestamp();
        let mut leases = self.shared.leases_lock()?;
        match leases.holder_of(path) {
            Some(h) if h == holder => {
                let _ = leases.renew(holder, now);
                Ok(())
            }
            Some(h) => Err(FsMetaError::AlreadyLeased(format!(
                "{} is held by {}",
                path, h
            ))),
            None => Err(FsMetaError::LeaseNotFound(format!("no lease on {}", path))),
        }
    }

    /// Allocate the next block of an open file. Any previous trailing block
    /// is finalized at its recorded length first.
    pub async fn add_block(&self, path: &str, holder: &str) -> FsMetaResult<BlockInfo> {
        let _guard = self.shared.gate.begin_mutation()?;
        self.check_holder(path, holder)?;
        let (block_id, gen_stamp) = self.shared.alloc_lock()?.next_block();
        let prev = {
            let mut tree = self.shared.tree_write()?;
            let prev = tree.file(path)?.blocks.last().cloned();
            add_block_to_file(&mut tree, path, block_id, gen_stamp)?;
            prev
        };
        match self
            .shared
            .journal(EditRecord::AddBlock {
                path: path.to_string(),
                block_id,
                gen_stamp,
            })
            .await
        {
            Ok(_) => Ok(BlockInfo::new_under_construction(block_id, gen_stamp)),
            Err(e) => {
                if let Ok(mut tree) = self.shared.tree_write() {
                    if let Ok(file) = tree.file_mut(path) {
                        file.blocks.pop();
                        if let (Some(last), Some(prev)) = (file.blocks.last_mut(), prev) {
                            *last = prev;
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Length-sync: record write progress on the trailing block without
    /// closing the file. The block moves to COMMITTED at `len`.
    pub async fn sync_length(&self, path: &str, holder: &str, len: u64) -> FsMetaResult<()> {
        let _guard = self.shared.gate.begin_mutation()?;
        self.check_holder(path, holder)?;
        let prev = {
            let mut tree = self.shared.tree_write()?;
            let prev = tree.file(path)?.blocks.last().cloned();
            sync_file_length(&mut tree, path, len)?;
            prev
        };
        match self
            .shared
            .journal(EditRecord::SyncLength {
                path: path.to_string(),
                len,
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Ok(mut tree) = self.shared.tree_write() {
                    if let Ok(file) = tree.file_mut(path) {
                        if let (Some(last), Some(prev)) = (file.blocks.last_mut(), prev) {
                            *last = prev;
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Close an open file: the trailing block is committed at `len` and every
    /// block is finalized; the holder's lease on the path is released.
    pub async fn close_file(&self, path: &str, holder: &str, len: u64) -> FsMetaResult<()> {
        let _guard = self.shared.gate.begin_mutation()?;
        self.check_holder(path, holder)?;
        let prev_blocks = {
            let mut tree = self.shared.tree_write()?;
            let prev_blocks = tree.file(path)?.blocks.clone();
            close_file_blocks(&mut tree, path, len)?;
            self.shared.leases_lock()?.release(path)?;
            prev_blocks
        };
        match self
            .shared
            .journal(EditRecord::CloseFile {
                path: path.to_string(),
                len,
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Ok(mut tree) = self.shared.tree_write() {
                    if let Ok(file) = tree.file_mut(path) {
                        file.blocks = prev_blocks;
                        file.under_construction = true;
                    }
                }
                if let Ok(mut leases) = self.shared.leases_lock() {
                    let _ = leases.acquire(path, holder, unix_timestamp());
                }
                Err(e)
            }
        }
    }

    /// Re-open a closed file for append: grants `holder` the lease, marks the
    /// file under construction again and bumps the trailing block's
    /// generation stamp.
    pub async fn reopen_append(&self, path: &str, holder: &str) -> FsMetaResult<()> {
        let _guard = self.shared.gate.begin_mutation()?;
        let now = unix_timestamp();
        {
            let tree = self.shared.tree_read()?;
            let file = tree.file(path)?;
            if file.under_construction {
                let current = self
                    .shared
                    .leases_lock()?
                    .holder_of(path)
                    .map(str::to_string);
                return Err(match current {
                    Some(h) if h != holder => {
                        FsMetaError::AlreadyLeased(format!("{} is held by {}", path, h))
                    }
                    _ => FsMetaError::InvalidBlockState(format!(
                        "{} is already open for write",
                        path
                    )),
                });
            }
        }
        self.shared.leases_lock()?.acquire(path, holder, now)?;
        let gen_stamp = self.shared.alloc_lock()?.next_gen_stamp();
        let prev = {
            let mut tree = self.shared.tree_write()?;
            let prev = tree.file(path)?.blocks.last().cloned();
            if let Err(e) = reopen_file(&mut tree, path, gen_stamp) {
                drop(tree);
                let _ = self.shared.leases_lock()?.release(path);
                return Err(e);
            }
            prev
        };
        match self
            .shared
            .journal(EditRecord::ReopenAppend {
                path: path.to_string(),
                holder: holder.to_string(),
                gen_stamp,
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Ok(mut tree) = self.shared.tree_write() {
                    if let Ok(file) = tree.file_mut(path) {
                        file.under_construction = false;
                        if let (Some(last), Some(prev)) = (file.blocks.last_mut(), prev) {
                            *last = prev;
                        }
                    }
                }
                if let Ok(mut leases) = self.shared.leases_lock() {
                    let _ = leases.release(path);
                }
                Err(e)
            }
        }
    }

    // ===== leases =====

    pub fn renew_lease(&self, holder: &str) -> FsMetaResult<()> {
        self.shared.leases_lock()?.renew(holder, unix_timestamp())
    }

    pub fn lease_holder(&self, path: &str) -> FsMetaResult<Option<String>> {
        Ok(self
            .shared
            .leases_lock()?
            .holder_of(path)
            .map(str::to_string))
    }

    pub fn lease_by_path(&self, path: &str) -> FsMetaResult<Option<Lease>> {
        Ok(self.shared.leases_lock()?.lease_by_path(path).cloned())
    }

    /// On-demand expiry sweep; the background task runs the same recovery.
    pub async fn recover_expired_leases(&self) -> FsMetaResult<Vec<String>> {
        self.shared.recover_expired().await
    }

    // ===== safe mode & checkpointing =====

    pub async fn enter_safe_mode(&self) -> FsMetaResult<()> {
        self.shared
            .gate
            .enter(self.config.safe_mode_drain_timeout)
            .await
    }

    pub fn leave_safe_mode(&self) -> FsMetaResult<()> {
        self.shared.gate.leave()
    }

    pub fn is_in_safe_mode(&self) -> bool {
        self.shared.gate.is_entered()
    }

    /// Write a checkpoint of the current namespace. Only legal while the
    /// safe-mode gate is entered.
    pub async fn save_namespace(&self) -> FsMetaResult<u64> {
        if !self.shared.gate.is_entered() {
            return Err(FsMetaError::NotInSafeMode(
                "save_namespace requires safe mode".to_string(),
            ));
        }
        let doc = {
            let tree = self.shared.tree_read()?;
            let leases = self.shared.leases_lock()?.snapshot();
            let allocator = self.shared.alloc_lock()?.clone();
            let last_txid = self.shared.last_applied_txid.load(Ordering::SeqCst);
            CheckpointDocument::capture(&tree, leases, allocator, last_txid)
        };
        self.engine.save(doc).await
    }

    // ===== reads =====

    pub fn stat(&self, path: &str) -> FsMetaResult<FileStatus> {
        let tree = self.shared.tree_read()?;
        let id = tree.resolve(path)?;
        let node = tree
            .get(id)
            .ok_or_else(|| FsMetaError::Internal(format!("dangling inode {}", id)))?;
        Ok(match &node.body {
            InodeBody::Dir(_) => FileStatus {
                len: 0,
                is_dir: true,
                under_construction: false,
                block_count: 0,
            },
            InodeBody::File(f) => FileStatus {
                len: f.len(),
                is_dir: false,
                under_construction: f.under_construction,
                block_count: f.blocks.len(),
            },
        })
    }

    pub fn exists(&self, path: &str) -> bool {
        self.shared
            .tree_read()
            .map(|tree| tree.resolve(path).is_ok())
            .unwrap_or(false)
    }

    pub fn is_directory(&self, path: &str) -> FsMetaResult<bool> {
        Ok(self.stat(path)?.is_dir)
    }

    pub fn list_dir(&self, path: &str) -> FsMetaResult<Vec<String>> {
        self.shared.tree_read()?.list_children(path)
    }

    pub fn blocks_of(&self, path: &str) -> FsMetaResult<Vec<BlockInfo>> {
        Ok(self.shared.tree_read()?.file(path)?.blocks.clone())
    }
}

impl Drop for FsMetaService {
    fn drop(&mut self) {
        if let Some(handle) = self.lease_sweep_handle.take() {
            handle.abort();
        }
    }
}

// ===== tree-level block helpers, shared by live ops and replay =====

fn add_block_to_file(
    tree: &mut NamespaceTree,
    path: &str,
    block_id: BlockId,
    gen_stamp: u64,
) -> FsMetaResult<()> {
    let file = tree.file_mut(path)?;
    if !file.under_construction {
        return Err(FsMetaError::InvalidBlockState(format!(
            "{} is not open for write",
            path
        )));
    }
    if let Some(last) = file.blocks.last_mut() {
        if !last.is_complete() {
            let len = last.len;
            last.commit(len)?;
            last.complete()?;
        }
    }
    file.blocks
        .push(BlockInfo::new_under_construction(block_id, gen_stamp));
    Ok(())
}

fn sync_file_length(tree: &mut NamespaceTree, path: &str, len: u64) -> FsMetaResult<()> {
    let file = tree.file_mut(path)?;
    if !file.under_construction {
        return Err(FsMetaError::InvalidBlockState(format!(
            "{} is not open for write",
            path
        )));
    }
    let last = file.blocks.last_mut().ok_or_else(|| {
        FsMetaError::InvalidBlockState(format!("{} has no blocks to sync", path))
    })?;
    last.commit(len)
}

fn close_file_blocks(tree: &mut NamespaceTree, path: &str, len: u64) -> FsMetaResult<()> {
    let file = tree.file_mut(path)?;
    if !file.under_construction {
        return Err(FsMetaError::InvalidBlockState(format!(
            "{} is not open for write",
            path
        )));
    }
    let count = file.blocks.len();
    for (i, blk) in file.blocks.iter_mut().enumerate() {
        if blk.is_complete() {
            continue;
        }
        let final_len = if i + 1 == count { len } else { blk.len };
        blk.commit(final_len)?;
        blk.complete()?;
    }
    file.under_construction = false;
    Ok(())
}

fn reopen_file(tree: &mut NamespaceTree, path: &str, gen_stamp: u64) -> FsMetaResult<()> {
    let file = tree.file_mut(path)?;
    if file.under_construction {
        return Err(FsMetaError::InvalidBlockState(format!(
            "{} is already open for write",
            path
        )));
    }
    if let Some(last) = file.blocks.last_mut() {
        last.bump_gen_stamp(gen_stamp)?;
    }
    file.under_construction = true;
    Ok(())
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
