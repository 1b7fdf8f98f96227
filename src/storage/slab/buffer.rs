//! Segment buffers
//!
//! A segment buffer backs one storage block: a validity bitmask followed by
//! the segment array. It is either resident (owns its bytes) or only on disk
//! (knows the block holding its trimmed image). Loading is explicit through
//! [`SegmentBuffer::acquire_backing`]; the returned slice borrows the buffer,
//! so no pin can outlive the caller's borrow.

use super::bitmask::ValidityMask;
use super::geometry::BufferGeometry;
use crate::error::{Error, Result};
use crate::storage::block::{BlockId, BlockManager, BlockPointer};
use std::sync::Arc;
use tracing::debug;

/// One fixed-capacity block of segments
pub struct SegmentBuffer {
    block_manager: Arc<dyn BlockManager>,
    /// Occupied segments
    pub(super) segment_count: usize,
    /// Bytes persisted for this buffer at the last serialization
    pub(super) allocation_size: usize,
    /// Marked for evacuation by the current vacuum round
    pub(super) vacuum: bool,
    memory: Option<Box<[u8]>>,
    block_pointer: BlockPointer,
    dirty: bool,
}

impl SegmentBuffer {
    /// Create a resident buffer with every segment free
    pub fn new(block_manager: Arc<dyn BlockManager>, geometry: &BufferGeometry) -> Self {
        let mut memory = vec![0u8; geometry.block_size].into_boxed_slice();
        ValidityMask::new(&mut memory[..geometry.bitmask_offset])
            .set_all_free(geometry.segments_per_buffer);

        Self {
            block_manager,
            segment_count: 0,
            allocation_size: 0,
            vacuum: false,
            memory: Some(memory),
            block_pointer: BlockPointer::INVALID,
            dirty: true,
        }
    }

    /// Describe a persisted buffer without loading it
    pub fn from_disk(
        block_manager: Arc<dyn BlockManager>,
        segment_count: usize,
        allocation_size: usize,
        block_pointer: BlockPointer,
    ) -> Self {
        Self {
            block_manager,
            segment_count,
            allocation_size,
            vacuum: false,
            memory: None,
            block_pointer,
            dirty: false,
        }
    }

    /// Whether the buffer's bytes are resident
    pub fn in_memory(&self) -> bool {
        self.memory.is_some()
    }

    /// Whether the buffer has a persisted image
    pub fn on_disk(&self) -> bool {
        self.block_pointer.is_valid()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn allocation_size(&self) -> usize {
        self.allocation_size
    }

    pub fn block_pointer(&self) -> BlockPointer {
        self.block_pointer
    }

    /// Make the buffer resident, loading its persisted image if necessary
    ///
    /// The trimmed image is padded back to the full block size; the padding
    /// only ever covers free segments.
    pub fn acquire_backing(&mut self) -> Result<&mut [u8]> {
        if self.memory.is_none() {
            self.memory = Some(self.load()?);
        }
        match self.memory.as_deref_mut() {
            Some(memory) => Ok(memory),
            None => Err(Error::Internal("buffer memory vanished after load".to_string())),
        }
    }

    fn load(&self) -> Result<Box<[u8]>> {
        if !self.on_disk() {
            return Err(Error::Internal(
                "buffer is neither in memory nor on disk".to_string(),
            ));
        }

        let block_size = self.block_manager.block_size();
        let data = self.block_manager.read_block(self.block_pointer.block_id)?;
        let start = self.block_pointer.offset as usize;
        let end = start + self.allocation_size;
        if end > data.len() || self.allocation_size > block_size {
            return Err(Error::Corruption(format!(
                "{} holds {} bytes, expected {} at offset {}",
                self.block_pointer,
                data.len(),
                self.allocation_size,
                start
            )));
        }

        let mut memory = vec![0u8; block_size].into_boxed_slice();
        memory[..self.allocation_size].copy_from_slice(&data[start..end]);
        debug!(
            block = %self.block_pointer,
            allocation_size = self.allocation_size,
            "Loaded segment buffer"
        );
        Ok(memory)
    }

    /// Read access to bitmask and segments
    pub fn get(&mut self) -> Result<&[u8]> {
        self.acquire_backing().map(|memory| &*memory)
    }

    /// Write access to bitmask and segments; marks the buffer dirty
    pub fn get_mut(&mut self) -> Result<&mut [u8]> {
        self.dirty = true;
        self.acquire_backing()
    }

    /// Persist the first `allocation_size` bytes into a fresh block
    ///
    /// Must only be called when [`needs_write`](Self::needs_write) holds.
    /// The block holding the previous image is returned, not released: the
    /// last committed checkpoint may still reference it.
    pub fn serialize(&mut self, allocation_size: usize) -> Result<Option<BlockId>> {
        let memory = self.memory.as_deref().ok_or_else(|| {
            Error::Internal("dirty segment buffer is not resident".to_string())
        })?;
        if allocation_size > memory.len() {
            return Err(Error::Internal(format!(
                "allocation size {} exceeds buffer of {} bytes",
                allocation_size,
                memory.len()
            )));
        }

        let block_id = self.block_manager.allocate_block()?;
        if let Err(e) = self
            .block_manager
            .write_block(block_id, &memory[..allocation_size])
        {
            self.block_manager.release_block(block_id)?;
            return Err(e);
        }

        let superseded = self.on_disk().then_some(self.block_pointer.block_id);
        self.block_pointer = BlockPointer::new(block_id, 0);
        self.allocation_size = allocation_size;
        self.dirty = false;
        Ok(superseded)
    }

    /// Whether the next serialization has to write this buffer
    pub fn needs_write(&self) -> bool {
        self.dirty || !self.on_disk()
    }

    /// Drop the resident bytes of a clean, persisted buffer
    pub fn evict(&mut self) -> bool {
        if self.in_memory() && self.on_disk() && !self.dirty {
            self.memory = None;
            return true;
        }
        false
    }

    /// Drop the resident bytes and detach the persisted image
    ///
    /// Returns the block that held the image; releasing it is up to the
    /// owner once no checkpoint references it.
    pub fn destroy(&mut self) -> Option<BlockId> {
        self.memory = None;
        let block = self.on_disk().then_some(self.block_pointer.block_id);
        self.block_pointer = BlockPointer::INVALID;
        block
    }
}
