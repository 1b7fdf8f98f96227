//! In-memory block manager
//!
//! Keeps every block in a hash map. Used by tests and by indexes that never
//! checkpoint.

use super::{BlockId, BlockManager};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Default)]
struct MemoryBlocks {
    /// Reserved blocks; `None` until first written
    blocks: HashMap<BlockId, Option<Vec<u8>>>,
    /// Released ids, reused lowest first
    free_ids: BTreeSet<BlockId>,
    next_id: BlockId,
}

/// Block manager backed by process memory
pub struct MemoryBlockManager {
    block_size: usize,
    state: Mutex<MemoryBlocks>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryBlockManager {
    /// Create a block manager with the given block capacity
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            state: Mutex::new(MemoryBlocks::default()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of `read_block` calls served
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of `write_block` calls served
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Length of the bytes stored in a block
    pub fn stored_len(&self, block_id: BlockId) -> Option<usize> {
        let state = self.state.lock();
        state
            .blocks
            .get(&block_id)
            .and_then(|b| b.as_ref().map(|data| data.len()))
    }
}

impl BlockManager for MemoryBlockManager {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate_block(&self) -> Result<BlockId> {
        let mut state = self.state.lock();
        let block_id = match state.free_ids.pop_first() {
            Some(id) => id,
            None => {
                let id = state.next_id;
                state.next_id += 1;
                id
            }
        };
        state.blocks.insert(block_id, None);
        Ok(block_id)
    }

    fn write_block(&self, block_id: BlockId, data: &[u8]) -> Result<()> {
        if data.len() > self.block_size {
            return Err(Error::InvalidArgument(format!(
                "Write of {} bytes exceeds block size {}",
                data.len(),
                self.block_size
            )));
        }

        let mut state = self.state.lock();
        let slot = state
            .blocks
            .get_mut(&block_id)
            .ok_or_else(|| Error::NotFound(format!("block {}", block_id)))?;
        *slot = Some(data.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);

        debug!(block_id, len = data.len(), "Wrote memory block");
        Ok(())
    }

    fn read_block(&self, block_id: BlockId) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let data = state
            .blocks
            .get(&block_id)
            .ok_or_else(|| Error::NotFound(format!("block {}", block_id)))?
            .as_ref()
            .ok_or_else(|| Error::Storage(format!("Block {} was never written", block_id)))?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(data.clone())
    }

    fn release_block(&self, block_id: BlockId) -> Result<()> {
        let mut state = self.state.lock();
        if state.blocks.remove(&block_id).is_none() {
            return Err(Error::NotFound(format!("block {}", block_id)));
        }
        state.free_ids.insert(block_id);
        debug!(block_id, "Released memory block");
        Ok(())
    }

    fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }
}
