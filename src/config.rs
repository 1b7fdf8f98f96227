//! Allocator configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file,
//! then `PHOTONDB_SLAB_*` environment variables.
//!
//! ```toml
//! block_size = 262144
//! vacuum_threshold = 10
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Default size of one storage block in bytes (256 KiB)
pub const DEFAULT_BLOCK_SIZE: usize = 262_144;

/// Default vacuum threshold, as a percentage of in-memory footprint
pub const DEFAULT_VACUUM_THRESHOLD: u8 = 10;

/// Bytes of one bitmask word
const WORD_SIZE: usize = std::mem::size_of::<u64>();

/// Configuration for fixed-size allocators and the block managers backing them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlabConfig {
    /// Capacity of one storage block (bytes)
    pub block_size: usize,
    /// Minimum reclaimable share of in-memory buffers (percent) before a vacuum runs
    pub vacuum_threshold: u8,
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            vacuum_threshold: DEFAULT_VACUUM_THRESHOLD,
        }
    }
}

impl SlabConfig {
    /// Load configuration from a TOML file, with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let defaults = Self::default();

        let settings = ::config::Config::builder()
            .set_default("block_size", defaults.block_size as i64)
            .and_then(|b| b.set_default("vacuum_threshold", defaults.vacuum_threshold as i64))
            .map_err(|e| Error::Config(format!("Failed to set defaults: {}", e)))?
            .add_source(::config::File::from(path.to_path_buf()))
            .add_source(::config::Environment::with_prefix("PHOTONDB_SLAB").try_parsing(true))
            .build()
            .map_err(|e| Error::Config(format!("Failed to load {:?}: {}", path, e)))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;

        debug!(path = ?path, ?config, "Loaded slab configuration");
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the settings describe a usable allocator
    pub fn validate(&self) -> Result<()> {
        if self.block_size <= WORD_SIZE {
            return Err(Error::Config(format!(
                "Block size {} cannot hold a bitmask word and a segment",
                self.block_size
            )));
        }
        if self.vacuum_threshold > 100 {
            return Err(Error::Config(format!(
                "Vacuum threshold {}% exceeds 100%",
                self.vacuum_threshold
            )));
        }
        Ok(())
    }
}
