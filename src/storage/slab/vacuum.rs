//! Incremental defragmentation of a fixed-size allocator
//!
//! A vacuum round runs in three steps driven by the index that owns the
//! allocator:
//!
//! ```text
//! initialize_vacuum()        pick the least full resident buffers
//!   └─→ vacuum_pointer(p)    for every live p with needs_vacuum(p)
//! finalize_vacuum()          destroy the evacuated buffers
//! ```
//!
//! The allocator cannot tell which segments are reachable, so relocating
//! segments and rewriting references to them is the owner's job.

use super::allocator::FixedSizeAllocator;
use super::pointer::IndexPointer;
use crate::error::{Error, Result};
use tracing::{debug, info};

impl FixedSizeAllocator {
    /// Decide whether a vacuum is worthwhile and mark the buffers to evacuate
    ///
    /// Only resident buffers are considered. Returns `false` when nothing is
    /// allocated (the allocator is reset), when no buffer is resident, or when
    /// the whole buffers that could be saved fall below the vacuum threshold.
    pub fn initialize_vacuum(&mut self) -> Result<bool> {
        if self.total_segment_count == 0 {
            self.reset()?;
            return Ok(false);
        }
        debug_assert!(self.vacuum_buffers.is_empty());

        let segments_per_buffer = self.geometry.segments_per_buffer;
        let mut candidates: Vec<(usize, u32)> = Vec::new();
        let mut available_segments_in_memory = 0;

        for (&buffer_id, buffer) in self.buffers.iter_mut() {
            buffer.vacuum = false;
            if buffer.in_memory() {
                let available = segments_per_buffer - buffer.segment_count;
                available_segments_in_memory += available;
                candidates.push((available, buffer_id));
            }
        }

        if candidates.is_empty() {
            return Ok(false);
        }

        let excess_buffer_count = available_segments_in_memory / segments_per_buffer;
        let memory_usage = candidates.len() * self.geometry.block_size;
        let excess_memory_usage = excess_buffer_count * self.geometry.block_size;
        let excess_percentage = excess_memory_usage as f64 / memory_usage as f64;
        // excess / usage < threshold / 100, compared exactly
        if excess_memory_usage * 100 < usize::from(self.vacuum_threshold) * memory_usage {
            debug!(
                excess_buffer_count,
                excess_percentage,
                threshold = self.vacuum_threshold,
                "Vacuum not worthwhile"
            );
            return Ok(false);
        }

        // most occupied first; the tail holds the least full buffers
        candidates.sort_unstable();
        let vacuum = candidates.split_off(candidates.len() - excess_buffer_count);

        for (_, buffer_id) in vacuum {
            let buffer = self.buffers.get_mut(&buffer_id).ok_or_else(|| {
                Error::Internal(format!("vacuum candidate {} missing", buffer_id))
            })?;
            buffer.vacuum = true;
            self.buffers_with_free_space.remove(&buffer_id);
            self.vacuum_buffers.insert(buffer_id);
        }

        metrics::counter!("photondb_slab_vacuum_rounds_total").increment(1);
        info!(
            vacuum_buffers = self.vacuum_buffers.len(),
            resident_buffers = candidates.len() + self.vacuum_buffers.len(),
            excess_percentage,
            "Initialized vacuum"
        );
        Ok(true)
    }

    /// Whether `ptr` lives in a buffer marked by the running vacuum round
    pub fn needs_vacuum(&self, ptr: IndexPointer) -> bool {
        self.vacuum_buffers.contains(&ptr.buffer_id)
    }

    /// Ids of the buffers marked by the running vacuum round
    pub fn vacuum_buffers(&self) -> impl Iterator<Item = u32> + '_ {
        self.vacuum_buffers.iter().copied()
    }

    /// Move a segment out of a vacuum buffer and return its new pointer
    ///
    /// The old slot keeps its bitmask bit; the whole buffer goes away in
    /// [`finalize_vacuum`](Self::finalize_vacuum).
    pub fn vacuum_pointer(&mut self, ptr: IndexPointer) -> Result<IndexPointer> {
        debug_assert!(self.needs_vacuum(ptr));
        let contents = self.get(ptr)?.to_vec();

        let new_ptr = self.allocate()?;
        // relocated, not newly created
        self.total_segment_count -= 1;

        self.get_mut(new_ptr)?.copy_from_slice(&contents);
        metrics::counter!("photondb_slab_segments_relocated_total").increment(1);
        debug!(from = %ptr, to = %new_ptr, "Relocated segment");
        Ok(new_ptr)
    }

    /// Destroy every buffer marked by the running vacuum round
    ///
    /// Call only after all live segments of those buffers were relocated.
    /// Every marked buffer is checked before any is removed; on error the
    /// round is left as it was. Persisted blocks of destroyed buffers are
    /// queued for [`commit_checkpoint`](Self::commit_checkpoint).
    pub fn finalize_vacuum(&mut self) -> Result<()> {
        for &buffer_id in &self.vacuum_buffers {
            match self.buffers.get(&buffer_id) {
                None => {
                    return Err(Error::Internal(format!(
                        "vacuum buffer {} missing",
                        buffer_id
                    )))
                }
                Some(buffer) if !buffer.in_memory() => {
                    return Err(Error::Internal(format!(
                        "vacuum buffer {} is not in memory",
                        buffer_id
                    )))
                }
                Some(_) => {}
            }
        }

        let vacuum_buffers = std::mem::take(&mut self.vacuum_buffers);
        let destroyed = vacuum_buffers.len();
        for buffer_id in vacuum_buffers {
            // relocated segments stayed counted under their old buffer
            if let Some(mut buffer) = self.buffers.remove(&buffer_id) {
                self.pending_release.extend(buffer.destroy());
            }
        }

        metrics::counter!("photondb_slab_buffers_destroyed_total").increment(destroyed as u64);
        info!(
            destroyed,
            remaining_buffers = self.buffers.len(),
            "Finalized vacuum"
        );
        Ok(())
    }
}
