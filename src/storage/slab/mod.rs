//! Fixed-size segment allocator
//!
//! Hands out equal-sized segments carved from storage blocks. Index
//! structures (adaptive radix tree nodes and leaves) keep one allocator per
//! node type and link their nodes through [`IndexPointer`]s.
//!
//! # Architecture
//!
//! ```text
//! FixedSizeAllocator (segment_size = 16B, block = 256B)
//!   ├─→ buffers:                  { 0 → SegmentBuffer, 1 → SegmentBuffer }
//!   ├─→ buffers_with_free_space:  { 1 }
//!   └─→ vacuum_buffers:           { }
//!
//! SegmentBuffer (one block)
//!   [bitmask word][seg 0][seg 1] ... [seg 14]
//!    bit i = 1 → segment i free
//! ```
//!
//! Allocation always fills the lowest buffer with free space, so live
//! segments concentrate in low buffer ids and a vacuum can evacuate the
//! sparse ones.

pub mod allocator;
pub mod bitmask;
pub mod buffer;
pub mod geometry;
pub mod persist;
pub mod pointer;
pub mod vacuum;


pub use allocator::{AllocatorStats, FixedSizeAllocator};
pub use bitmask::ValidityMask;
pub use buffer::SegmentBuffer;
pub use geometry::BufferGeometry;
pub use pointer::IndexPointer;
