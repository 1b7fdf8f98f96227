//! Block storage contract consumed by the segment allocator
//!
//! The allocator never pins, evicts or performs I/O on its own. It asks a
//! [`BlockManager`] for block ids, hands it the bytes to persist, and reads
//! them back when a buffer must become resident again.

mod file;
mod memory;

pub use file::FileBlockManager;
pub use memory::MemoryBlockManager;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one physical block
pub type BlockId = u64;

/// Location of persisted bytes: a block plus a byte offset inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPointer {
    pub block_id: BlockId,
    pub offset: u32,
}

impl BlockPointer {
    /// Pointer that references no block
    pub const INVALID: BlockPointer = BlockPointer {
        block_id: u64::MAX,
        offset: 0,
    };

    pub fn new(block_id: BlockId, offset: u32) -> Self {
        Self { block_id, offset }
    }

    pub fn is_valid(&self) -> bool {
        self.block_id != Self::INVALID.block_id
    }
}

impl Default for BlockPointer {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Block(id={}, offset={})", self.block_id, self.offset)
        } else {
            write!(f, "Block(invalid)")
        }
    }
}

/// Block allocation and persistence
///
/// Implementations are shared between allocators through `Arc<dyn BlockManager>`
/// and synchronize internally. Every call may block on I/O.
pub trait BlockManager: Send + Sync {
    /// Capacity of one block in bytes
    fn block_size(&self) -> usize;

    /// Reserve a fresh block id
    fn allocate_block(&self) -> Result<BlockId>;

    /// Persist `data` (at most `block_size` bytes) into a reserved block
    fn write_block(&self, block_id: BlockId, data: &[u8]) -> Result<()>;

    /// Load the persisted bytes of a block
    fn read_block(&self, block_id: BlockId) -> Result<Vec<u8>>;

    /// Return a block to the free pool
    fn release_block(&self, block_id: BlockId) -> Result<()>;

    /// Number of blocks currently reserved
    fn block_count(&self) -> usize;
}
