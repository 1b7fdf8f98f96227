//! Buffer geometry of a fixed-size allocator
//!
//! Every buffer of an allocator shares the same layout:
//!
//! ```text
//! [bitmask words][segment 0][segment 1] ... [segment N-1][unused tail]
//!  ^ bitmask_offset bytes   ^ segments_per_buffer * segment_size bytes
//! ```

use super::bitmask::{BITS_PER_WORD, WORD_SIZE};
use crate::error::{Error, Result};
use serde::Serialize;

/// Layout constants derived once from the segment size and block size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferGeometry {
    /// Size of one segment (bytes)
    pub segment_size: usize,
    /// Capacity of one block (bytes)
    pub block_size: usize,
    /// Number of `u64` words in the bitmask
    pub bitmask_count: usize,
    /// Number of segments one buffer can hold
    pub segments_per_buffer: usize,
    /// Byte offset of segment 0
    pub bitmask_offset: usize,
}

impl BufferGeometry {
    /// Largest segment size a block of `block_size` bytes can hold
    pub fn max_segment_size(block_size: usize) -> usize {
        block_size.saturating_sub(WORD_SIZE)
    }

    /// Compute the layout for `segment_size` byte segments
    ///
    /// The bitmask grows one word at a time: whenever all bits of the current
    /// words are spoken for and the block still has room, another word is added
    /// and the remaining bytes are filled with up to a word's worth of segments.
    pub fn new(segment_size: usize, block_size: usize) -> Result<Self> {
        let max = Self::max_segment_size(block_size);
        if segment_size == 0 || segment_size > max {
            return Err(Error::Config(format!(
                "The maximum segment size of fixed-size allocators is {}, got {}",
                max, segment_size
            )));
        }

        let mut byte_count = 0;
        let mut bitmask_count = 0;
        let mut segments_per_buffer = 0;

        while byte_count < block_size {
            if bitmask_count == 0 || segments_per_buffer == bitmask_count * BITS_PER_WORD {
                if byte_count + WORD_SIZE > block_size {
                    break;
                }
                bitmask_count += 1;
                byte_count += WORD_SIZE;
            }

            let remaining_bytes = block_size - byte_count;
            let remaining_bits = bitmask_count * BITS_PER_WORD - segments_per_buffer;
            let remaining_segments = (remaining_bytes / segment_size).min(remaining_bits);
            if remaining_segments == 0 {
                break;
            }

            segments_per_buffer += remaining_segments;
            byte_count += remaining_segments * segment_size;
        }

        Ok(Self {
            segment_size,
            block_size,
            bitmask_count,
            segments_per_buffer,
            bitmask_offset: bitmask_count * WORD_SIZE,
        })
    }

    /// Byte offset of a segment within its buffer
    pub fn segment_start(&self, offset: u32) -> usize {
        self.bitmask_offset + offset as usize * self.segment_size
    }

    /// Bytes to persist for a buffer whose last live segment ends at `max_offset`
    pub fn allocation_size(&self, max_offset: u32) -> usize {
        self.segment_start(max_offset)
    }
}
