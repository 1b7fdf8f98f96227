//! Single-file block manager
//!
//! # Layout
//!
//! ```text
//! [magic: 8B][block_size: u64]                       file header
//! [in_use: u32][len: u32][crc32: u32][payload ...]   block 0
//! [in_use: u32][len: u32][crc32: u32][payload ...]   block 1
//! ...
//! ```
//!
//! Every block slot occupies `BLOCK_HEADER_SIZE + block_size` bytes, so a
//! block id maps directly to a file offset. Released slots keep their space
//! and are handed out again lowest id first.

use super::{BlockId, BlockManager};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const FILE_MAGIC: &[u8; 8] = b"PDBSEGS1";
const FILE_HEADER_SIZE: u64 = 16;
const BLOCK_HEADER_SIZE: usize = 12;

const BLOCK_FREE: u32 = 0;
const BLOCK_IN_USE: u32 = 1;

struct FileState {
    file: File,
    block_count: u64,
    free_ids: BTreeSet<BlockId>,
}

/// Block manager persisting blocks into one file
pub struct FileBlockManager {
    path: PathBuf,
    block_size: usize,
    state: Mutex<FileState>,
}

impl FileBlockManager {
    /// Create or open a block file
    ///
    /// Opening an existing file with a different block size fails.
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create block directory: {}", e)))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::Storage(format!("Failed to open block file: {}", e)))?;

        let file_len = file.metadata()?.len();
        let slot_size = (BLOCK_HEADER_SIZE + block_size) as u64;

        let (block_count, free_ids) = if file_len == 0 {
            let mut header = Vec::with_capacity(FILE_HEADER_SIZE as usize);
            header.extend_from_slice(FILE_MAGIC);
            header.extend_from_slice(&(block_size as u64).to_le_bytes());
            file.write_all(&header)
                .map_err(|e| Error::Storage(format!("Failed to write file header: {}", e)))?;
            info!(path = ?path, block_size, "Created block file");
            (0, BTreeSet::new())
        } else {
            Self::check_file_header(&mut file, block_size)?;
            let block_count = (file_len.saturating_sub(FILE_HEADER_SIZE)) / slot_size;
            let mut free_ids = BTreeSet::new();
            for block_id in 0..block_count {
                let (in_use, _, _) = Self::read_block_header(&mut file, block_size, block_id)?;
                if in_use == BLOCK_FREE {
                    free_ids.insert(block_id);
                }
            }
            info!(
                path = ?path,
                blocks = block_count,
                free = free_ids.len(),
                "Opened block file"
            );
            (block_count, free_ids)
        };

        Ok(Self {
            path,
            block_size,
            state: Mutex::new(FileState {
                file,
                block_count,
                free_ids,
            }),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush the block file to disk
    pub fn flush(&self) -> Result<()> {
        let state = self.state.lock();
        state
            .file
            .sync_all()
            .map_err(|e| Error::Storage(format!("Flush failed: {}", e)))
    }

    fn check_file_header(file: &mut File, block_size: usize) -> Result<()> {
        let mut header = [0u8; FILE_HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)
            .map_err(|e| Error::Corruption(format!("Truncated block file header: {}", e)))?;

        if &header[..8] != FILE_MAGIC {
            return Err(Error::Corruption("Bad block file magic".to_string()));
        }
        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&header[8..16]);
        let stored = u64::from_le_bytes(size_bytes);
        if stored != block_size as u64 {
            return Err(Error::Config(format!(
                "Block file uses block size {}, requested {}",
                stored, block_size
            )));
        }
        Ok(())
    }

    fn slot_offset(block_size: usize, block_id: BlockId) -> u64 {
        FILE_HEADER_SIZE + block_id * (BLOCK_HEADER_SIZE + block_size) as u64
    }

    fn read_block_header(
        file: &mut File,
        block_size: usize,
        block_id: BlockId,
    ) -> Result<(u32, u32, u32)> {
        let mut header = [0u8; BLOCK_HEADER_SIZE];
        file.seek(SeekFrom::Start(Self::slot_offset(block_size, block_id)))?;
        file.read_exact(&mut header)
            .map_err(|e| Error::Storage(format!("Read failed: {}", e)))?;

        let field = |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
        Ok((field(0), field(4), field(8)))
    }

    fn write_slot(
        file: &mut File,
        block_size: usize,
        block_id: BlockId,
        in_use: u32,
        data: &[u8],
    ) -> Result<()> {
        let mut slot = Vec::with_capacity(BLOCK_HEADER_SIZE + block_size);
        slot.extend_from_slice(&in_use.to_le_bytes());
        slot.extend_from_slice(&(data.len() as u32).to_le_bytes());
        slot.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
        slot.extend_from_slice(data);
        slot.resize(BLOCK_HEADER_SIZE + block_size, 0);

        file.seek(SeekFrom::Start(Self::slot_offset(block_size, block_id)))
            .map_err(|e| Error::Storage(format!("Seek failed: {}", e)))?;
        file.write_all(&slot)
            .map_err(|e| Error::Storage(format!("Write failed: {}", e)))?;
        Ok(())
    }

    fn check_reserved(state: &FileState, block_id: BlockId) -> Result<()> {
        if block_id >= state.block_count || state.free_ids.contains(&block_id) {
            return Err(Error::NotFound(format!("block {}", block_id)));
        }
        Ok(())
    }
}

impl BlockManager for FileBlockManager {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate_block(&self) -> Result<BlockId> {
        let mut state = self.state.lock();
        let block_id = match state.free_ids.pop_first() {
            Some(id) => id,
            None => {
                let id = state.block_count;
                state.block_count += 1;
                id
            }
        };
        Self::write_slot(&mut state.file, self.block_size, block_id, BLOCK_IN_USE, &[])?;
        debug!(block_id, "Allocated file block");
        Ok(block_id)
    }

    fn write_block(&self, block_id: BlockId, data: &[u8]) -> Result<()> {
        if data.len() > self.block_size {
            return Err(Error::InvalidArgument(format!(
                "Write of {} bytes exceeds block size {}",
                data.len(),
                self.block_size
            )));
        }

        let mut state = self.state.lock();
        Self::check_reserved(&state, block_id)?;
        Self::write_slot(&mut state.file, self.block_size, block_id, BLOCK_IN_USE, data)?;

        debug!(block_id, len = data.len(), "Wrote file block");
        Ok(())
    }

    fn read_block(&self, block_id: BlockId) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        Self::check_reserved(&state, block_id)?;

        let (in_use, len, crc) = Self::read_block_header(&mut state.file, self.block_size, block_id)?;
        if in_use != BLOCK_IN_USE || len as usize > self.block_size {
            return Err(Error::Corruption(format!(
                "Invalid header for block {} (in_use={}, len={})",
                block_id, in_use, len
            )));
        }

        let mut data = vec![0u8; len as usize];
        state
            .file
            .read_exact(&mut data)
            .map_err(|e| Error::Storage(format!("Read failed: {}", e)))?;

        if crc32fast::hash(&data) != crc {
            warn!(block_id, "Checksum mismatch on block read");
            return Err(Error::Corruption(format!("Checksum mismatch in block {}", block_id)));
        }
        Ok(data)
    }

    fn release_block(&self, block_id: BlockId) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_reserved(&state, block_id)?;
        Self::write_slot(&mut state.file, self.block_size, block_id, BLOCK_FREE, &[])?;
        state.free_ids.insert(block_id);
        debug!(block_id, "Released file block");
        Ok(())
    }

    fn block_count(&self) -> usize {
        let state = self.state.lock();
        (state.block_count as usize) - state.free_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_blocks_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = FileBlockManager::open(dir.path().join("blocks.db"), 128)?;

        let id = manager.allocate_block()?;
        manager.write_block(id, b"segment bytes")?;
        assert_eq!(manager.read_block(id)?, b"segment bytes");
        assert_eq!(manager.block_count(), 1);
        Ok(())
    }

    #[test]
    fn test_file_blocks_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("blocks.db");

        let (kept, released) = {
            let manager = FileBlockManager::open(&path, 64)?;
            let kept = manager.allocate_block()?;
            let released = manager.allocate_block()?;
            manager.write_block(kept, &[7u8; 64])?;
            manager.release_block(released)?;
            manager.flush()?;
            (kept, released)
        };

        let manager = FileBlockManager::open(&path, 64)?;
        assert_eq!(manager.read_block(kept)?, vec![7u8; 64]);
        assert_eq!(manager.block_count(), 1);
        assert_eq!(manager.allocate_block()?, released);
        Ok(())
    }

    #[test]
    fn test_file_blocks_block_size_mismatch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("blocks.db");
        FileBlockManager::open(&path, 64)?;

        assert!(matches!(
            FileBlockManager::open(&path, 128),
            Err(Error::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn test_file_blocks_detect_corruption() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("blocks.db");
        let manager = FileBlockManager::open(&path, 32)?;
        let id = manager.allocate_block()?;
        manager.write_block(id, b"checksummed")?;
        manager.flush()?;

        // Flip one payload byte behind the manager's back
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
            file.seek(SeekFrom::Start(FILE_HEADER_SIZE + BLOCK_HEADER_SIZE as u64))?;
            file.write_all(b"X")?;
            file.sync_all()?;
        }

        assert!(matches!(manager.read_block(id), Err(Error::Corruption(_))));
        Ok(())
    }

    #[test]
    fn test_file_blocks_unknown_block() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = FileBlockManager::open(dir.path().join("blocks.db"), 32)?;
        assert!(matches!(manager.read_block(0), Err(Error::NotFound(_))));
        assert!(matches!(manager.release_block(4), Err(Error::NotFound(_))));
        Ok(())
    }
}
