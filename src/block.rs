//! Block construction states and the per-block transition rules.

use serde::{Deserialize, Serialize};

use crate::{FsMetaError, FsMetaResult};

pub type BlockId = u64;

/// Construction state of a single block. A block only moves forward
/// (UnderConstruction -> Committed -> Complete) except when the owning file is
/// re-opened for append, which bumps the generation stamp and puts the
/// trailing block back under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockUcState {
    UnderConstruction,
    Committed,
    Complete,
}

impl BlockUcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockUcState::UnderConstruction => "under_construction",
            BlockUcState::Committed => "committed",
            BlockUcState::Complete => "complete",
        }
    }
}

impl std::fmt::Display for BlockUcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub id: BlockId,
    pub gen_stamp: u64,
    pub len: u64,
    pub state: BlockUcState,
}

impl BlockInfo {
    pub fn new_under_construction(id: BlockId, gen_stamp: u64) -> Self {
        Self {
            id,
            gen_stamp,
            len: 0,
            state: BlockUcState::UnderConstruction,
        }
    }

    /// Record a client-reported length for this block. Legal from
    /// UnderConstruction, and again from Committed (a repeated length-sync
    /// simply advances the committed length).
    pub fn commit(&mut self, len: u64) -> FsMetaResult<()> {
        match self.state {
            BlockUcState::UnderConstruction | BlockUcState::Committed => {
                self.len = len;
                self.state = BlockUcState::Committed;
                Ok(())
            }
            BlockUcState::Complete => Err(FsMetaError::InvalidBlockState(format!(
                "block {} is complete, cannot commit",
                self.id
            ))),
        }
    }

    /// Finalize the block. The length recorded so far becomes immutable.
    pub fn complete(&mut self) -> FsMetaResult<()> {
        match self.state {
            BlockUcState::UnderConstruction | BlockUcState::Committed => {
                self.state = BlockUcState::Complete;
                Ok(())
            }
            BlockUcState::Complete => Err(FsMetaError::InvalidBlockState(format!(
                "block {} is already complete",
                self.id
            ))),
        }
    }

    /// Re-open for append: new generation stamp, back under construction.
    /// The stamp must strictly increase.
    pub fn bump_gen_stamp(&mut self, next: u64) -> FsMetaResult<()> {
        if next <= self.gen_stamp {
            return Err(FsMetaError::InvalidBlockState(format!(
                "block {}: generation stamp {} does not advance {}",
                self.id, next, self.gen_stamp
            )));
        }
        self.gen_stamp = next;
        self.state = BlockUcState::UnderConstruction;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.state == BlockUcState::Complete
    }

    pub fn is_committed(&self) -> bool {
        self.state == BlockUcState::Committed
    }
}

/// Monotonic source of block ids and generation stamps. Serialized into every
/// checkpoint so ids never repeat across a restart; `observe` keeps it ahead
/// of ids seen during edit-log replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockIdAllocator {
    next_block_id: u64,
    next_gen_stamp: u64,
}

impl BlockIdAllocator {
    pub fn new() -> Self {
        Self {
            next_block_id: 1,
            next_gen_stamp: 1,
        }
    }

    pub fn next_block(&mut self) -> (BlockId, u64) {
        let id = self.next_block_id;
        self.next_block_id += 1;
        let gs = self.next_gen_stamp;
        self.next_gen_stamp += 1;
        (id, gs)
    }

    pub fn next_gen_stamp(&mut self) -> u64 {
        let gs = self.next_gen_stamp;
        self.next_gen_stamp += 1;
        gs
    }

    pub fn observe(&mut self, block_id: BlockId, gen_stamp: u64) {
        if block_id >= self.next_block_id {
            self.next_block_id = block_id + 1;
        }
        self.observe_gen_stamp(gen_stamp);
    }

    pub fn observe_gen_stamp(&mut self, gen_stamp: u64) {
        if gen_stamp >= self.next_gen_stamp {
            self.next_gen_stamp = gen_stamp + 1;
        }
    }
}

impl Default for BlockIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
