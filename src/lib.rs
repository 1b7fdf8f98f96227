// PhotonDB - Fixed-size segment allocator
// Slab storage for on-disk index structures (adaptive radix trees and friends)

#![warn(rust_2018_idioms)]

pub mod config;
pub mod logging;
pub mod storage;

// Re-exports for convenience
pub use config::SlabConfig;
pub use storage::block::{BlockId, BlockManager, BlockPointer, FileBlockManager, MemoryBlockManager};
pub use storage::metadata::{MetadataReader, MetadataWriter};
pub use storage::slab::{AllocatorStats, FixedSizeAllocator, IndexPointer};

/// PhotonDB segment allocator error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Storage error: {0}")]
        Storage(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Internal error: {0}")]
        Internal(String),

        #[error("Corruption detected: {0}")]
        Corruption(String),

        #[error("Not found: {0}")]
        NotFound(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
