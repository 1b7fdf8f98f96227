//! Persistence of fixed-size allocators
//!
//! Buffers are written into blocks of their own, trimmed to the prefix that
//! ends with the last occupied segment. The allocator header then goes into
//! a metadata stream:
//!
//! ```text
//! segment_size          u64
//! buffer_count          u64
//! free_space_count      u64
//! buffer_count x { buffer_id u64, block_pointer (u64, u32),
//!                  segment_count u64, allocation_size u64 }
//! free_space_count x buffer_id u64
//! ```

use super::allocator::FixedSizeAllocator;
use super::bitmask::ValidityMask;
use super::buffer::SegmentBuffer;
use super::geometry::BufferGeometry;
use crate::config::SlabConfig;
use crate::error::{Error, Result};
use crate::storage::block::{BlockManager, BlockPointer};
use crate::storage::metadata::{MetadataReader, MetadataWriter};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;

fn buffer_id_from_disk(raw: u64) -> Result<u32> {
    u32::try_from(raw)
        .map_err(|_| Error::Corruption(format!("buffer id {} does not fit 32 bits", raw)))
}

fn usize_from_disk(raw: u64, what: &str) -> Result<usize> {
    usize::try_from(raw).map_err(|_| Error::Corruption(format!("{} {} too large", what, raw)))
}

impl FixedSizeAllocator {
    /// Write dirty buffers and the allocator header
    ///
    /// Returns where the header starts in `writer`'s stream. The writer is
    /// left open so several allocators can share it; flushing is up to the
    /// caller. Blocks of the previous checkpoint are only queued; release
    /// them with [`commit_checkpoint`](Self::commit_checkpoint) once the new
    /// header is durable.
    ///
    /// Every dirty buffer is sized before any is written, so a buffer that
    /// cannot be persisted fails the call without touching the block store.
    pub fn serialize(&mut self, writer: &mut MetadataWriter) -> Result<BlockPointer> {
        let geometry = self.geometry;

        let mut writes = Vec::new();
        for (&buffer_id, buffer) in self.buffers.iter_mut() {
            if !buffer.needs_write() {
                continue;
            }
            let data = buffer.get()?;
            let max_offset = ValidityMask::new(&data[..geometry.bitmask_offset])
                .highest_occupied_offset(geometry.segments_per_buffer)
                .map_err(|e| match e {
                    Error::Internal(msg) => {
                        Error::Internal(format!("buffer {}: {}", buffer_id, msg))
                    }
                    other => other,
                })?;
            writes.push((buffer_id, geometry.allocation_size(max_offset)));
        }

        let mut bytes_written = 0;
        for &(buffer_id, allocation_size) in &writes {
            let buffer = self.buffers.get_mut(&buffer_id).ok_or_else(|| {
                Error::Internal(format!("buffer {} vanished during serialize", buffer_id))
            })?;
            self.pending_release.extend(buffer.serialize(allocation_size)?);
            bytes_written += allocation_size;
        }
        let buffers_written = writes.len();

        let block_pointer = writer.block_pointer();
        writer.write(&(geometry.segment_size as u64))?;
        writer.write(&(self.buffers.len() as u64))?;
        writer.write(&(self.buffers_with_free_space.len() as u64))?;

        for (&buffer_id, buffer) in &self.buffers {
            writer.write(&u64::from(buffer_id))?;
            writer.write(&buffer.block_pointer())?;
            writer.write(&(buffer.segment_count as u64))?;
            writer.write(&(buffer.allocation_size as u64))?;
        }
        for &buffer_id in &self.buffers_with_free_space {
            writer.write(&u64::from(buffer_id))?;
        }

        metrics::counter!("photondb_slab_bytes_serialized_total").increment(bytes_written as u64);
        info!(
            buffers = self.buffers.len(),
            buffers_written,
            bytes_written,
            header = %block_pointer,
            "Serialized fixed-size allocator"
        );
        Ok(block_pointer)
    }

    /// Rebuild an allocator from a header written by [`serialize`](Self::serialize)
    ///
    /// Buffers stay on disk until first accessed.
    pub fn deserialize(
        block_manager: Arc<dyn BlockManager>,
        config: &SlabConfig,
        block_pointer: BlockPointer,
    ) -> Result<Self> {
        config.validate()?;
        let mut reader = MetadataReader::new(block_manager.clone(), block_pointer)?;

        let segment_size = usize_from_disk(reader.read::<u64>()?, "segment size")?;
        let geometry = BufferGeometry::new(segment_size, block_manager.block_size())
            .map_err(|e| Error::Corruption(format!("allocator header: {}", e)))?;
        let buffer_count = reader.read::<u64>()?;
        let free_space_count = reader.read::<u64>()?;

        let mut buffers = BTreeMap::new();
        let mut total_segment_count = 0;
        for _ in 0..buffer_count {
            let buffer_id = buffer_id_from_disk(reader.read::<u64>()?)?;
            let buffer_pointer = reader.read::<BlockPointer>()?;
            let segment_count = usize_from_disk(reader.read::<u64>()?, "segment count")?;
            let allocation_size = usize_from_disk(reader.read::<u64>()?, "allocation size")?;

            if segment_count > geometry.segments_per_buffer
                || allocation_size > geometry.block_size
                || !buffer_pointer.is_valid()
            {
                return Err(Error::Corruption(format!(
                    "buffer {} at {}: {} segments, {} bytes",
                    buffer_id, buffer_pointer, segment_count, allocation_size
                )));
            }

            let buffer = SegmentBuffer::from_disk(
                block_manager.clone(),
                segment_count,
                allocation_size,
                buffer_pointer,
            );
            if buffers.insert(buffer_id, buffer).is_some() {
                return Err(Error::Corruption(format!(
                    "buffer {} listed twice",
                    buffer_id
                )));
            }
            total_segment_count += segment_count;
        }

        let mut buffers_with_free_space = BTreeSet::new();
        for _ in 0..free_space_count {
            let buffer_id = buffer_id_from_disk(reader.read::<u64>()?)?;
            if !buffers.contains_key(&buffer_id) {
                return Err(Error::Corruption(format!(
                    "free-space list names unknown buffer {}",
                    buffer_id
                )));
            }
            buffers_with_free_space.insert(buffer_id);
        }

        info!(
            segment_size,
            buffers = buffers.len(),
            total_segment_count,
            "Deserialized fixed-size allocator"
        );
        Ok(Self {
            block_manager,
            geometry,
            vacuum_threshold: config.vacuum_threshold,
            total_segment_count,
            buffers,
            buffers_with_free_space,
            vacuum_buffers: BTreeSet::new(),
            pending_release: Vec::new(),
        })
    }
}
