//! Storage layer
//!
//! # Architecture
//!
//! ```text
//! FixedSizeAllocator (segment_size = 16B)
//!   ├─→ buffer 0 → [bitmask | seg 0 | seg 1 | ... ]  (resident)
//!   ├─→ buffer 1 → BlockPointer(block=7, offset=0)  (on disk)
//!   └─→ buffer 3 → [bitmask | seg 0 | seg 1 | ... ]  (resident, vacuum)
//!
//! BlockManager (external contract)
//!   ├─→ MemoryBlockManager  (tests, scratch indexes)
//!   └─→ FileBlockManager    (single file, CRC-checked blocks)
//!
//! MetadataWriter / MetadataReader
//!   └─→ chained metadata blocks holding allocator headers
//! ```
//!
//! The allocator owns its buffers; physical blocks belong to the block
//! manager and are only referenced by id.

pub mod block;
pub mod metadata;
pub mod slab;

pub use block::{BlockId, BlockManager, BlockPointer, FileBlockManager, MemoryBlockManager};
pub use metadata::{MetadataReader, MetadataWriter};
pub use slab::{AllocatorStats, FixedSizeAllocator, IndexPointer};
