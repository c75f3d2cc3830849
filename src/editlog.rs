//! Edit-log collaborator seam.
//!
//! Every structural mutation is mirrored here, synchronously, before the
//! caller sees it as committed. On startup the service replays every record
//! past the checkpoint's transaction marker to reach the latest state.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::block::BlockId;
use crate::{FsMetaError, FsMetaResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditRecord {
    Mkdir {
        path: String,
    },
    CreateFile {
        path: String,
        holder: String,
        replication: u16,
    },
    AddBlock {
        path: String,
        block_id: BlockId,
        gen_stamp: u64,
    },
    SyncLength {
        path: String,
        len: u64,
    },
    CloseFile {
        path: String,
        len: u64,
    },
    ReopenAppend {
        path: String,
        holder: String,
        gen_stamp: u64,
    },
    RenameFile {
        from: String,
        to: String,
    },
    DeleteFile {
        path: String,
    },
    Rmdir {
        path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub txid: u64,
    pub record: EditRecord,
}

#[async_trait]
pub trait EditLog: Send + Sync {
    /// Durably append one record and return its assigned txid. The append is
    /// synchronous: when it fails, the caller must roll the in-memory
    /// mutation back.
    async fn append(&self, record: EditRecord) -> FsMetaResult<u64>;

    /// Records with txid strictly greater than `txid`, in order.
    async fn replay_since(&self, txid: u64) -> FsMetaResult<Vec<TxRecord>>;
}

/// In-memory edit log. Shared via `Arc`, it plays the role of the durable
/// log across a simulated restart.
pub struct MemEditLog {
    records: Mutex<Vec<TxRecord>>,
}

impl MemEditLog {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    fn lock_records(&self) -> FsMetaResult<std::sync::MutexGuard<'_, Vec<TxRecord>>> {
        self.records
            .lock()
            .map_err(|e| FsMetaError::Internal(format!("edit log lock poisoned: {}", e)))
    }

    pub fn last_txid(&self) -> u64 {
        self.records
            .lock()
            .map(|r| r.last().map(|t| t.txid).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl Default for MemEditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EditLog for MemEditLog {
    async fn append(&self, record: EditRecord) -> FsMetaResult<u64> {
        let mut records = self.lock_records()?;
        let txid = records.last().map(|t| t.txid).unwrap_or(0) + 1;
        records.push(TxRecord { txid, record });
        Ok(txid)
    }

    async fn replay_since(&self, txid: u64) -> FsMetaResult<Vec<TxRecord>> {
        let records = self.lock_records()?;
        Ok(records.iter().filter(|t| t.txid > txid).cloned().collect())
    }
}
