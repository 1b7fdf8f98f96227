//! Fixed-size segment allocator
//!
//! Carves storage blocks into equal-sized segments. Index structures store
//! their nodes in segments and link them through [`IndexPointer`]s, so a
//! segment never moves unless the owner relocates it during a vacuum.

use super::bitmask::ValidityMask;
use super::buffer::SegmentBuffer;
use super::geometry::BufferGeometry;
use super::pointer::IndexPointer;
use crate::config::SlabConfig;
use crate::error::{Error, Result};
use crate::storage::block::{BlockId, BlockManager};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Slab allocator handing out segments of one fixed size
///
/// Not synchronized: the owning index serializes access, typically with one
/// lock held across a batch of operations.
pub struct FixedSizeAllocator {
    pub(super) block_manager: Arc<dyn BlockManager>,
    pub(super) geometry: BufferGeometry,
    /// Percentage of reclaimable in-memory footprint that triggers a vacuum
    pub(super) vacuum_threshold: u8,
    /// Occupied segments across all buffers
    pub(super) total_segment_count: usize,
    pub(super) buffers: BTreeMap<u32, SegmentBuffer>,
    /// Buffers that can take another segment (never vacuum buffers)
    pub(super) buffers_with_free_space: BTreeSet<u32>,
    /// Buffers marked by the running vacuum round
    pub(super) vacuum_buffers: BTreeSet<u32>,
    /// Blocks superseded since the last committed checkpoint
    pub(super) pending_release: Vec<BlockId>,
}

impl FixedSizeAllocator {
    /// Create an allocator with default settings
    pub fn new(segment_size: usize, block_manager: Arc<dyn BlockManager>) -> Result<Self> {
        Self::with_config(segment_size, block_manager, &SlabConfig::default())
    }

    /// Create an allocator
    ///
    /// The block size always comes from `block_manager`; `config` supplies
    /// the vacuum threshold.
    pub fn with_config(
        segment_size: usize,
        block_manager: Arc<dyn BlockManager>,
        config: &SlabConfig,
    ) -> Result<Self> {
        config.validate()?;
        let geometry = BufferGeometry::new(segment_size, block_manager.block_size())?;
        debug!(
            segment_size,
            segments_per_buffer = geometry.segments_per_buffer,
            bitmask_count = geometry.bitmask_count,
            "Created fixed-size allocator"
        );

        Ok(Self {
            block_manager,
            geometry,
            vacuum_threshold: config.vacuum_threshold,
            total_segment_count: 0,
            buffers: BTreeMap::new(),
            buffers_with_free_space: BTreeSet::new(),
            vacuum_buffers: BTreeSet::new(),
            pending_release: Vec::new(),
        })
    }

    /// Allocate one segment
    ///
    /// Fills the lowest buffer with free space; creates a buffer when none
    /// has room left. The segment's previous contents are unspecified.
    pub fn allocate(&mut self) -> Result<IndexPointer> {
        if self.buffers_with_free_space.is_empty() {
            let buffer_id = self.available_buffer_id();
            let buffer = SegmentBuffer::new(self.block_manager.clone(), &self.geometry);
            self.buffers.insert(buffer_id, buffer);
            self.buffers_with_free_space.insert(buffer_id);

            metrics::counter!("photondb_slab_buffers_created_total").increment(1);
            info!(buffer_id, segment_size = self.geometry.segment_size, "Added segment buffer");
        }

        let buffer_id = match self.buffers_with_free_space.first() {
            Some(&id) => id,
            None => {
                return Err(Error::Internal(
                    "no buffer with free space after growing".to_string(),
                ))
            }
        };

        let geometry = self.geometry;
        let buffer = self
            .buffers
            .get_mut(&buffer_id)
            .ok_or_else(|| Error::Internal(format!("free-space buffer {} missing", buffer_id)))?;

        let hint = buffer.segment_count;
        let data = buffer.get_mut()?;
        let offset = ValidityMask::new(&mut data[..geometry.bitmask_offset])
            .find_free_bit(hint, geometry.segments_per_buffer)?;

        buffer.segment_count += 1;
        self.total_segment_count += 1;
        if buffer.segment_count == geometry.segments_per_buffer {
            self.buffers_with_free_space.remove(&buffer_id);
        }

        metrics::counter!("photondb_slab_segments_allocated_total").increment(1);
        let ptr = IndexPointer::new(buffer_id, offset);
        debug!(%ptr, "Allocated segment");
        Ok(ptr)
    }

    /// Free a segment
    ///
    /// Freeing a segment that is not occupied is a fatal consistency error.
    pub fn free(&mut self, ptr: IndexPointer) -> Result<()> {
        let geometry = self.geometry;
        self.check_offset(ptr)?;
        let buffer = self
            .buffers
            .get_mut(&ptr.buffer_id)
            .ok_or_else(|| Error::NotFound(format!("buffer {}", ptr.buffer_id)))?;

        if buffer.segment_count == 0 || self.total_segment_count == 0 {
            return Err(Error::Internal(format!(
                "segment counts out of sync while freeing {}",
                ptr
            )));
        }

        let data = buffer.get_mut()?;
        let mut mask = ValidityMask::new(&mut data[..geometry.bitmask_offset]);
        if mask.is_free(ptr.offset as usize) {
            return Err(Error::Internal(format!("double free of {}", ptr)));
        }
        mask.set_free(ptr.offset as usize);

        buffer.segment_count -= 1;
        self.total_segment_count -= 1;

        // re-adding is idempotent; vacuum buffers must not take new segments
        if !buffer.vacuum {
            self.buffers_with_free_space.insert(ptr.buffer_id);
        }

        metrics::counter!("photondb_slab_segments_freed_total").increment(1);
        debug!(%ptr, "Freed segment");
        Ok(())
    }

    /// Read the bytes of a segment, loading its buffer if necessary
    pub fn get(&mut self, ptr: IndexPointer) -> Result<&[u8]> {
        let geometry = self.geometry;
        self.check_offset(ptr)?;
        let buffer = self
            .buffers
            .get_mut(&ptr.buffer_id)
            .ok_or_else(|| Error::NotFound(format!("buffer {}", ptr.buffer_id)))?;

        let start = geometry.segment_start(ptr.offset);
        let data = buffer.get()?;
        Ok(&data[start..start + geometry.segment_size])
    }

    /// Mutable bytes of a segment, loading its buffer if necessary
    pub fn get_mut(&mut self, ptr: IndexPointer) -> Result<&mut [u8]> {
        let geometry = self.geometry;
        self.check_offset(ptr)?;
        let buffer = self
            .buffers
            .get_mut(&ptr.buffer_id)
            .ok_or_else(|| Error::NotFound(format!("buffer {}", ptr.buffer_id)))?;

        let start = geometry.segment_start(ptr.offset);
        let data = buffer.get_mut()?;
        Ok(&mut data[start..start + geometry.segment_size])
    }

    fn check_offset(&self, ptr: IndexPointer) -> Result<()> {
        if ptr.offset as usize >= self.geometry.segments_per_buffer {
            return Err(Error::InvalidArgument(format!(
                "{} out of range, buffers hold {} segments",
                ptr, self.geometry.segments_per_buffer
            )));
        }
        Ok(())
    }

    /// Destroy every buffer and forget all state
    ///
    /// Persisted blocks are queued for [`commit_checkpoint`](Self::commit_checkpoint).
    pub fn reset(&mut self) -> Result<()> {
        for buffer in self.buffers.values_mut() {
            self.pending_release.extend(buffer.destroy());
        }
        let destroyed = self.buffers.len();
        self.buffers.clear();
        self.buffers_with_free_space.clear();
        self.vacuum_buffers.clear();
        self.total_segment_count = 0;

        metrics::counter!("photondb_slab_buffers_destroyed_total").increment(destroyed as u64);
        debug!(destroyed, "Reset fixed-size allocator");
        Ok(())
    }

    /// Absorb all buffers of `other`, leaving it empty
    ///
    /// Incoming buffer ids are shifted past this allocator's highest id.
    /// Returns the shift; pointers issued by `other` resolve here after
    /// [`IndexPointer::rebased`] with it.
    pub fn merge(&mut self, other: &mut FixedSizeAllocator) -> u32 {
        assert_eq!(
            self.geometry, other.geometry,
            "merging fixed-size allocators with different layouts"
        );

        let upper_bound_id = self.upper_bound_buffer_id();
        for (buffer_id, buffer) in std::mem::take(&mut other.buffers) {
            self.buffers.insert(buffer_id + upper_bound_id, buffer);
        }
        for buffer_id in std::mem::take(&mut other.buffers_with_free_space) {
            self.buffers_with_free_space.insert(buffer_id + upper_bound_id);
        }
        for buffer_id in std::mem::take(&mut other.vacuum_buffers) {
            self.vacuum_buffers.insert(buffer_id + upper_bound_id);
        }

        self.total_segment_count += other.total_segment_count;
        other.total_segment_count = 0;
        self.pending_release.append(&mut other.pending_release);

        info!(
            buffer_id_offset = upper_bound_id,
            total_segments = self.total_segment_count,
            "Merged fixed-size allocator"
        );
        upper_bound_id
    }

    /// Drop the resident bytes of every clean, persisted buffer
    ///
    /// Buffers marked by a running vacuum round stay resident. Returns how
    /// many buffers were evicted.
    pub fn evict_clean_buffers(&mut self) -> usize {
        let evicted = self
            .buffers
            .values_mut()
            .filter(|buffer| !buffer.vacuum)
            .map(|buffer| buffer.evict())
            .filter(|&evicted| evicted)
            .count();
        debug!(evicted, "Evicted clean segment buffers");
        evicted
    }

    /// Release the blocks superseded since the last checkpoint
    ///
    /// Call once the checkpoint written by [`serialize`](Self::serialize)
    /// is durable; until then the previous checkpoint stays readable.
    /// Returns the number of released blocks.
    pub fn commit_checkpoint(&mut self) -> Result<usize> {
        let mut released = 0;
        while let Some(&block_id) = self.pending_release.last() {
            self.block_manager.release_block(block_id)?;
            self.pending_release.pop();
            released += 1;
        }
        debug!(released, "Committed checkpoint");
        Ok(released)
    }

    /// Blocks waiting for [`commit_checkpoint`](Self::commit_checkpoint)
    pub fn pending_release_count(&self) -> usize {
        self.pending_release.len()
    }

    /// Id for a new buffer
    ///
    /// Scans downwards from the buffer count; some id in `0..=len` is always free.
    pub(super) fn available_buffer_id(&self) -> u32 {
        let mut buffer_id = self.buffers.len() as u32;
        while self.buffers.contains_key(&buffer_id) {
            debug_assert!(buffer_id > 0);
            buffer_id -= 1;
        }
        buffer_id
    }

    /// One past the highest buffer id, 0 when there are no buffers
    pub fn upper_bound_buffer_id(&self) -> u32 {
        self.buffers
            .keys()
            .next_back()
            .map(|&id| id + 1)
            .unwrap_or(0)
    }

    /// Bytes of resident buffers
    pub fn memory_usage(&self) -> usize {
        self.buffers.values().filter(|b| b.in_memory()).count() * self.geometry.block_size
    }

    pub fn total_segment_count(&self) -> usize {
        self.total_segment_count
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn segment_size(&self) -> usize {
        self.geometry.segment_size
    }

    pub fn segments_per_buffer(&self) -> usize {
        self.geometry.segments_per_buffer
    }

    pub fn bitmask_count(&self) -> usize {
        self.geometry.bitmask_count
    }

    pub fn bitmask_offset(&self) -> usize {
        self.geometry.bitmask_offset
    }

    pub fn geometry(&self) -> &BufferGeometry {
        &self.geometry
    }

    /// Ids of buffers that can take another segment
    pub fn buffers_with_free_space(&self) -> impl Iterator<Item = u32> + '_ {
        self.buffers_with_free_space.iter().copied()
    }

    /// Summary of the allocator's state
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            segment_size: self.geometry.segment_size,
            segments_per_buffer: self.geometry.segments_per_buffer,
            buffer_count: self.buffers.len(),
            buffers_in_memory: self.buffers.values().filter(|b| b.in_memory()).count(),
            buffers_with_free_space: self.buffers_with_free_space.len(),
            total_segment_count: self.total_segment_count,
            memory_usage: self.memory_usage(),
        }
    }
}

/// Statistics for a fixed-size allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    pub segment_size: usize,
    pub segments_per_buffer: usize,
    pub buffer_count: usize,
    pub buffers_in_memory: usize,
    pub buffers_with_free_space: usize,
    pub total_segment_count: usize,
    pub memory_usage: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::block::MemoryBlockManager;
    use std::collections::HashSet;

    fn allocator(segment_size: usize) -> Result<FixedSizeAllocator> {
        FixedSizeAllocator::new(segment_size, Arc::new(MemoryBlockManager::new(256)))
    }

    #[test]
    fn test_allocator_basic() -> Result<()> {
        let mut alloc = allocator(16)?;
        let ptr = alloc.allocate()?;
        assert_eq!(ptr, IndexPointer::new(0, 0));

        alloc.get_mut(ptr)?.copy_from_slice(b"Hello, Segment!!");
        assert_eq!(alloc.get(ptr)?, b"Hello, Segment!!");
        assert_eq!(alloc.total_segment_count(), 1);

        alloc.free(ptr)?;
        assert_eq!(alloc.total_segment_count(), 0);
        Ok(())
    }

    #[test]
    fn test_allocator_sequential_fill() -> Result<()> {
        let mut alloc = allocator(16)?;
        for expected in 0..15u32 {
            assert_eq!(alloc.allocate()?, IndexPointer::new(0, expected));
        }
        assert_eq!(alloc.buffers_with_free_space().count(), 0);
        assert_eq!(alloc.allocate()?, IndexPointer::new(1, 0));
        assert_eq!(alloc.buffer_count(), 2);
        Ok(())
    }

    #[test]
    fn test_allocator_reuse() -> Result<()> {
        let mut alloc = allocator(16)?;
        let ptrs: Vec<_> = (0..15).map(|_| alloc.allocate()).collect::<Result<_>>()?;

        alloc.free(ptrs[4])?;
        assert_eq!(alloc.buffers_with_free_space().collect::<Vec<_>>(), vec![0]);
        assert_eq!(alloc.allocate()?, ptrs[4]);
        Ok(())
    }

    #[test]
    fn test_allocator_no_double_allocation() -> Result<()> {
        let mut alloc = allocator(8)?;
        let mut seen = HashSet::new();
        for _ in 0..500 {
            assert!(seen.insert(alloc.allocate()?));
        }
        assert_eq!(alloc.total_segment_count(), 500);
        Ok(())
    }

    #[test]
    fn test_allocator_double_free() -> Result<()> {
        let mut alloc = allocator(16)?;
        let ptr = alloc.allocate()?;
        alloc.free(ptr)?;
        assert!(matches!(alloc.free(ptr), Err(Error::Internal(_))));
        assert_eq!(alloc.total_segment_count(), 0);
        Ok(())
    }

    #[test]
    fn test_allocator_bounds_checks() -> Result<()> {
        let mut alloc = allocator(16)?;
        alloc.allocate()?;
        assert!(matches!(
            alloc.get(IndexPointer::new(0, 15)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            alloc.get(IndexPointer::new(3, 0)),
            Err(Error::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_allocator_rejects_oversize_segment() {
        assert!(matches!(allocator(249), Err(Error::Config(_))));
    }

    #[test]
    fn test_available_buffer_id_fills_gaps() -> Result<()> {
        let manager: Arc<dyn BlockManager> = Arc::new(MemoryBlockManager::new(256));
        let geometry = BufferGeometry::new(16, 256)?;
        let mut alloc = FixedSizeAllocator::new(16, manager.clone())?;
        for id in [0u32, 2, 3] {
            alloc.buffers.insert(id, SegmentBuffer::new(manager.clone(), &geometry));
        }
        assert_eq!(alloc.available_buffer_id(), 1);

        alloc.buffers.insert(1, SegmentBuffer::new(manager, &geometry));
        assert_eq!(alloc.available_buffer_id(), 4);
        assert_eq!(alloc.upper_bound_buffer_id(), 4);
        Ok(())
    }

    #[test]
    fn test_allocator_reset() -> Result<()> {
        let manager = Arc::new(MemoryBlockManager::new(256));
        let mut alloc = FixedSizeAllocator::new(16, manager)?;
        for _ in 0..40 {
            alloc.allocate()?;
        }
        assert_eq!(alloc.buffer_count(), 3);

        alloc.reset()?;
        assert_eq!(alloc.buffer_count(), 0);
        assert_eq!(alloc.total_segment_count(), 0);
        assert_eq!(alloc.memory_usage(), 0);
        assert_eq!(alloc.allocate()?, IndexPointer::new(0, 0));
        Ok(())
    }

    #[test]
    fn test_allocator_merge() -> Result<()> {
        let manager: Arc<dyn BlockManager> = Arc::new(MemoryBlockManager::new(256));
        let mut left = FixedSizeAllocator::new(16, manager.clone())?;
        let mut right = FixedSizeAllocator::new(16, manager)?;

        for _ in 0..20 {
            left.allocate()?;
        }
        let mut right_ptrs = Vec::new();
        for i in 0..5u8 {
            let ptr = right.allocate()?;
            right.get_mut(ptr)?.fill(i);
            right_ptrs.push(ptr);
        }

        let shift = left.merge(&mut right);
        assert_eq!(shift, 2);
        assert_eq!(left.total_segment_count(), 25);
        assert_eq!(right.total_segment_count(), 0);
        assert_eq!(right.buffer_count(), 0);

        for (i, ptr) in right_ptrs.into_iter().enumerate() {
            assert_eq!(left.get(ptr.rebased(shift))?, &[i as u8; 16]);
        }
        assert_eq!(left.buffers_with_free_space().collect::<Vec<_>>(), vec![1, 2]);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "different layouts")]
    fn test_merge_mismatched_segment_size() {
        let manager: Arc<dyn BlockManager> = Arc::new(MemoryBlockManager::new(256));
        let mut left = FixedSizeAllocator::new(16, manager.clone()).unwrap();
        let mut right = FixedSizeAllocator::new(32, manager).unwrap();
        left.merge(&mut right);
    }

    #[test]
    fn test_allocator_stats() -> Result<()> {
        let mut alloc = allocator(16)?;
        for _ in 0..16 {
            alloc.allocate()?;
        }
        let stats = alloc.stats();
        assert_eq!(stats.buffer_count, 2);
        assert_eq!(stats.buffers_in_memory, 2);
        assert_eq!(stats.buffers_with_free_space, 1);
        assert_eq!(stats.total_segment_count, 16);
        assert_eq!(stats.memory_usage, 512);

        let json = serde_json::to_value(stats)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        assert_eq!(json["segments_per_buffer"], 15);
        Ok(())
    }
}
