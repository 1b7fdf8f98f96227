//! Segment handles issued by the fixed-size allocator

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle to one segment: a buffer id plus the segment's slot offset
///
/// Only the allocator that issued a pointer can resolve it. A pointer stays
/// valid until its segment is freed or its buffer is vacuumed away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexPointer {
    /// Buffer holding the segment
    pub buffer_id: u32,
    /// Slot index of the segment within its buffer
    pub offset: u32,
}

impl IndexPointer {
    pub fn new(buffer_id: u32, offset: u32) -> Self {
        Self { buffer_id, offset }
    }

    /// Re-encode a pointer after its allocator was merged into another one
    pub fn rebased(self, buffer_id_offset: u32) -> Self {
        Self {
            buffer_id: self.buffer_id + buffer_id_offset,
            offset: self.offset,
        }
    }
}

impl fmt::Display for IndexPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Segment(buffer={}, offset={})", self.buffer_id, self.offset)
    }
}
