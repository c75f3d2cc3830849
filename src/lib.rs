//! fs_meta: in-memory namespace metadata service with durable checkpoints.
//!
//! The service keeps a hierarchical namespace of directories and files, hands
//! out exclusive write leases for files that are open for create/append, and
//! tracks the construction state of every file block. A checkpoint of the
//! whole namespace (tree + leases + block states) can be saved while the
//! safe-mode gate holds mutations off, and loaded back after a restart.

#[macro_use]
extern crate log;

pub mod block;
pub mod checkpoint;
pub mod editlog;
pub mod fs_meta_service;
pub mod lease;
pub mod namespace;
pub mod safemode;

#[cfg(test)]
mod fs_meta_service_tests;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsMetaError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotDirectory(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("directory not empty: {0}")]
    DirNotEmpty(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("already leased: {0}")]
    AlreadyLeased(String),
    #[error("lease not found: {0}")]
    LeaseNotFound(String),
    #[error("safe mode violation: {0}")]
    SafeModeViolation(String),
    #[error("safe mode drain timeout: {0}")]
    SafeModeDrainTimeout(String),
    #[error("not in safe mode: {0}")]
    NotInSafeMode(String),
    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),
    #[error("invalid block state: {0}")]
    InvalidBlockState(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type FsMetaResult<T> = std::result::Result<T, FsMetaError>;

impl From<std::io::Error> for FsMetaError {
    fn from(err: std::io::Error) -> Self {
        FsMetaError::IoError(err.to_string())
    }
}

pub use block::{BlockId, BlockIdAllocator, BlockInfo, BlockUcState};
pub use checkpoint::{CheckpointDocument, CheckpointEngine, LoadedImage};
pub use editlog::{EditLog, EditRecord, MemEditLog, TxRecord};
pub use fs_meta_service::{FileStatus, FsMetaConfig, FsMetaService};
pub use lease::{Lease, LeaseConfig, LeaseManager};
pub use namespace::{Inode, InodeBody, InodeId, NamespaceTree, ROOT_INODE_ID};
pub use safemode::SafeModeGate;
