//! Metadata streams over chained blocks
//!
//! Structures such as the segment allocator persist their headers as a
//! sequence of fixed-width little-endian values. The stream spans as many
//! blocks as needed; each block starts with the id of its successor.
//!
//! # Architecture
//!
//! ```text
//! block 4: [next=9][segment_size][buffer_count][...]
//! block 9: [next=NONE][... buffer entries ...]
//! ```
//!
//! A value never straddles two blocks: when it does not fit into the rest of
//! the current block, writer and reader both move on to the next one.

use super::block::{BlockId, BlockManager, BlockPointer};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use std::sync::Arc;
use tracing::debug;

/// Marks the last block of a metadata chain
const NO_NEXT_BLOCK: u64 = u64::MAX;

/// Bytes reserved at the start of every metadata block for the successor id
const NEXT_POINTER_SIZE: usize = 8;

/// A fixed-width value that can travel through a metadata stream
pub trait MetadataValue: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    fn encode(&self, buf: &mut Vec<u8>);

    fn decode(buf: &mut &[u8]) -> Self;
}

impl MetadataValue for u32 {
    const SIZE: usize = 4;

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(*self);
    }

    fn decode(buf: &mut &[u8]) -> Self {
        buf.get_u32_le()
    }
}

impl MetadataValue for u64 {
    const SIZE: usize = 8;

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(*self);
    }

    fn decode(buf: &mut &[u8]) -> Self {
        buf.get_u64_le()
    }
}

impl MetadataValue for BlockPointer {
    const SIZE: usize = 12;

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.block_id);
        buf.put_u32_le(self.offset);
    }

    fn decode(buf: &mut &[u8]) -> Self {
        let block_id = buf.get_u64_le();
        let offset = buf.get_u32_le();
        BlockPointer { block_id, offset }
    }
}

/// Largest value the stream supports, used to size-check blocks
const MAX_VALUE_SIZE: usize = 12;

/// Sequential writer of typed metadata values
pub struct MetadataWriter {
    block_manager: Arc<dyn BlockManager>,
    block_size: usize,
    current_block: BlockId,
    current: Vec<u8>,
    blocks_written: usize,
}

impl MetadataWriter {
    /// Start a new metadata chain
    pub fn new(block_manager: Arc<dyn BlockManager>) -> Result<Self> {
        let block_size = block_manager.block_size();
        if block_size < NEXT_POINTER_SIZE + MAX_VALUE_SIZE {
            return Err(Error::InvalidArgument(format!(
                "Block size {} too small for metadata blocks",
                block_size
            )));
        }

        let current_block = block_manager.allocate_block()?;
        Ok(Self {
            block_manager,
            block_size,
            current_block,
            current: Self::fresh_block(),
            blocks_written: 0,
        })
    }

    fn fresh_block() -> Vec<u8> {
        let mut block = Vec::new();
        block.put_u64_le(NO_NEXT_BLOCK);
        block
    }

    /// Position the next value will be written at
    pub fn block_pointer(&self) -> BlockPointer {
        BlockPointer::new(self.current_block, self.current.len() as u32)
    }

    /// Append one value
    pub fn write<T: MetadataValue>(&mut self, value: &T) -> Result<()> {
        if self.current.len() + T::SIZE > self.block_size {
            self.next_block()?;
        }
        value.encode(&mut self.current);
        Ok(())
    }

    fn next_block(&mut self) -> Result<()> {
        let next = self.block_manager.allocate_block()?;
        self.current[..NEXT_POINTER_SIZE].copy_from_slice(&next.to_le_bytes());
        self.block_manager.write_block(self.current_block, &self.current)?;
        self.blocks_written += 1;

        self.current_block = next;
        self.current = Self::fresh_block();
        Ok(())
    }

    /// Release every block of the chain starting at `root`'s block
    ///
    /// `root` must point into the first block of a chain, i.e. be a position
    /// reported by [`block_pointer`](Self::block_pointer) before the writer
    /// moved on. Returns the number of released blocks.
    pub fn release_chain(block_manager: &dyn BlockManager, root: BlockPointer) -> Result<usize> {
        if !root.is_valid() {
            return Err(Error::InvalidArgument(
                "Cannot release metadata from an invalid block pointer".to_string(),
            ));
        }

        let mut block_id = root.block_id;
        let mut released = 0;
        loop {
            let data = block_manager.read_block(block_id)?;
            if data.len() < NEXT_POINTER_SIZE {
                return Err(Error::Corruption(format!(
                    "Metadata block {} has no successor pointer",
                    block_id
                )));
            }
            let next = (&data[..NEXT_POINTER_SIZE]).get_u64_le();
            block_manager.release_block(block_id)?;
            released += 1;

            if next == NO_NEXT_BLOCK {
                break;
            }
            block_id = next;
        }

        debug!(root = %root, released, "Released metadata chain");
        Ok(released)
    }

    /// Persist the block currently being filled
    ///
    /// May be called repeatedly; later writes continue in the same block.
    pub fn flush(&mut self) -> Result<()> {
        self.block_manager
            .write_block(self.current_block, &self.current)?;
        debug!(
            block_id = self.current_block,
            chained_blocks = self.blocks_written + 1,
            "Flushed metadata"
        );
        Ok(())
    }
}

/// Sequential reader of typed metadata values
pub struct MetadataReader {
    block_manager: Arc<dyn BlockManager>,
    block_size: usize,
    current_block: BlockId,
    data: Vec<u8>,
    offset: usize,
}

impl MetadataReader {
    /// Start reading at `pointer`
    pub fn new(block_manager: Arc<dyn BlockManager>, pointer: BlockPointer) -> Result<Self> {
        if !pointer.is_valid() {
            return Err(Error::InvalidArgument(
                "Cannot read metadata from an invalid block pointer".to_string(),
            ));
        }

        let block_size = block_manager.block_size();
        let data = block_manager.read_block(pointer.block_id)?;
        let offset = pointer.offset as usize;
        if offset < NEXT_POINTER_SIZE || offset > data.len() {
            return Err(Error::Corruption(format!(
                "Metadata pointer {} outside of block ({} bytes)",
                pointer,
                data.len()
            )));
        }

        Ok(Self {
            block_manager,
            block_size,
            current_block: pointer.block_id,
            data,
            offset,
        })
    }

    /// Read the next value
    pub fn read<T: MetadataValue>(&mut self) -> Result<T> {
        if self.offset + T::SIZE > self.block_size {
            self.next_block()?;
        }
        if self.offset + T::SIZE > self.data.len() {
            return Err(Error::Corruption(format!(
                "Metadata block {} truncated at offset {}",
                self.current_block, self.offset
            )));
        }

        let mut slice = &self.data[self.offset..self.offset + T::SIZE];
        let value = T::decode(&mut slice);
        self.offset += T::SIZE;
        Ok(value)
    }

    fn next_block(&mut self) -> Result<()> {
        if self.data.len() < NEXT_POINTER_SIZE {
            return Err(Error::Corruption(format!(
                "Metadata block {} has no successor pointer",
                self.current_block
            )));
        }
        let next = (&self.data[..NEXT_POINTER_SIZE]).get_u64_le();
        if next == NO_NEXT_BLOCK {
            return Err(Error::Corruption(format!(
                "Metadata chain ends at block {}",
                self.current_block
            )));
        }

        self.data = self.block_manager.read_block(next)?;
        self.current_block = next;
        self.offset = NEXT_POINTER_SIZE;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::block::MemoryBlockManager;

    #[test]
    fn test_metadata_single_block() -> Result<()> {
        let manager: Arc<dyn BlockManager> = Arc::new(MemoryBlockManager::new(256));
        let mut writer = MetadataWriter::new(manager.clone())?;
        let start = writer.block_pointer();

        writer.write(&42u64)?;
        writer.write(&7u32)?;
        writer.write(&BlockPointer::new(11, 96))?;
        writer.flush()?;

        let mut reader = MetadataReader::new(manager, start)?;
        assert_eq!(reader.read::<u64>()?, 42);
        assert_eq!(reader.read::<u32>()?, 7);
        assert_eq!(reader.read::<BlockPointer>()?, BlockPointer::new(11, 96));
        Ok(())
    }

    #[test]
    fn test_metadata_spans_blocks() -> Result<()> {
        // 32-byte blocks hold the next pointer plus three u64 values
        let manager: Arc<dyn BlockManager> = Arc::new(MemoryBlockManager::new(32));
        let mut writer = MetadataWriter::new(manager.clone())?;
        let start = writer.block_pointer();

        for i in 0..20u64 {
            writer.write(&(i * 3))?;
        }
        writer.flush()?;
        assert!(manager.block_count() >= 7);

        let mut reader = MetadataReader::new(manager, start)?;
        for i in 0..20u64 {
            assert_eq!(reader.read::<u64>()?, i * 3);
        }
        Ok(())
    }

    #[test]
    fn test_release_chain() -> Result<()> {
        let manager: Arc<dyn BlockManager> = Arc::new(MemoryBlockManager::new(32));
        let mut writer = MetadataWriter::new(manager.clone())?;
        let root = writer.block_pointer();
        for i in 0..10u64 {
            writer.write(&i)?;
        }
        writer.flush()?;
        let chained = manager.block_count();
        assert!(chained >= 4);

        assert_eq!(MetadataWriter::release_chain(manager.as_ref(), root)?, chained);
        assert_eq!(manager.block_count(), 0);
        assert!(MetadataReader::new(manager, root).is_err());
        Ok(())
    }

    #[test]
    fn test_metadata_shared_writer() -> Result<()> {
        let manager: Arc<dyn BlockManager> = Arc::new(MemoryBlockManager::new(40));
        let mut writer = MetadataWriter::new(manager.clone())?;

        writer.write(&1u64)?;
        writer.write(&2u64)?;
        let second = writer.block_pointer();
        writer.write(&BlockPointer::new(5, 0))?;
        writer.write(&3u64)?;
        writer.flush()?;

        let mut reader = MetadataReader::new(manager, second)?;
        assert_eq!(reader.read::<BlockPointer>()?, BlockPointer::new(5, 0));
        assert_eq!(reader.read::<u64>()?, 3);
        Ok(())
    }

    #[test]
    fn test_metadata_read_past_end() -> Result<()> {
        let manager: Arc<dyn BlockManager> = Arc::new(MemoryBlockManager::new(64));
        let mut writer = MetadataWriter::new(manager.clone())?;
        let start = writer.block_pointer();
        writer.write(&9u32)?;
        writer.flush()?;

        let mut reader = MetadataReader::new(manager, start)?;
        assert_eq!(reader.read::<u32>()?, 9);
        assert!(matches!(reader.read::<u64>(), Err(Error::Corruption(_))));
        Ok(())
    }

    #[test]
    fn test_metadata_rejects_tiny_blocks() {
        let manager: Arc<dyn BlockManager> = Arc::new(MemoryBlockManager::new(16));
        assert!(matches!(
            MetadataWriter::new(manager),
            Err(Error::InvalidArgument(_))
        ));
    }
}
