//! Checkpoint and reload through a block file
//!
//! Drives the allocator against `FileBlockManager`, reopening the file the
//! way a database restart would.

use photondb_segments::error::{Error, Result};
use photondb_segments::{
    logging, BlockManager, BlockPointer, FileBlockManager, FixedSizeAllocator, IndexPointer,
    MetadataReader, MetadataWriter, SlabConfig,
};
use std::sync::Arc;
use tempfile::TempDir;

const BLOCK_SIZE: usize = 4096;

fn open(dir: &TempDir) -> Result<Arc<dyn BlockManager>> {
    let manager = FileBlockManager::open(dir.path().join("index.blocks"), BLOCK_SIZE)?;
    Ok(Arc::new(manager))
}

#[test]
fn test_restart_restores_segments() -> Result<()> {
    logging::init_for_tests();
    let dir = TempDir::new()?;
    let mut expected = Vec::new();

    let root = {
        let manager = open(&dir)?;
        let mut alloc = FixedSizeAllocator::new(48, manager.clone())?;
        for i in 0..300u32 {
            let ptr = alloc.allocate()?;
            let segment = alloc.get_mut(ptr)?;
            segment[..4].copy_from_slice(&i.to_le_bytes());
            segment[44..].copy_from_slice(&i.to_be_bytes());
            expected.push((ptr, i));
        }

        // free every third segment before the checkpoint
        for (ptr, i) in &expected {
            if i % 3 == 0 {
                alloc.free(*ptr)?;
            }
        }
        expected.retain(|(_, i)| i % 3 != 0);

        let mut writer = MetadataWriter::new(manager.clone())?;
        let root = writer.block_pointer();
        let header = alloc.serialize(&mut writer)?;
        writer.flush()?;
        assert_eq!(header, root);
        root
    };

    let manager = open(&dir)?;
    let mut alloc = FixedSizeAllocator::deserialize(manager, &SlabConfig::default(), root)?;
    assert_eq!(alloc.total_segment_count(), expected.len());
    assert_eq!(alloc.memory_usage(), 0);

    for (ptr, i) in &expected {
        let segment = alloc.get(*ptr)?;
        assert_eq!(&segment[..4], &i.to_le_bytes());
        assert_eq!(&segment[44..], &i.to_be_bytes());
    }
    Ok(())
}

#[test]
fn test_two_allocators_share_metadata_stream() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = open(&dir)?;

    let mut nodes = FixedSizeAllocator::new(64, manager.clone())?;
    let mut leaves = FixedSizeAllocator::new(24, manager.clone())?;
    let node = nodes.allocate()?;
    nodes.get_mut(node)?.fill(4);
    let leaf = leaves.allocate()?;
    leaves.get_mut(leaf)?.fill(9);

    let mut writer = MetadataWriter::new(manager.clone())?;
    let root = writer.block_pointer();
    let nodes_header = nodes.serialize(&mut writer)?;
    let leaves_header = leaves.serialize(&mut writer)?;
    // the root records where each allocator header begins
    writer.write(&nodes_header)?;
    writer.write(&leaves_header)?;
    writer.flush()?;
    drop(writer);

    assert_eq!(nodes_header, root);
    let mut reader = MetadataReader::new(manager.clone(), root)?;
    // node header: three counts, one buffer entry, one free-space id
    assert_eq!(reader.read::<u64>()?, 64);
    assert_eq!(reader.read::<u64>()?, 1);
    assert_eq!(reader.read::<u64>()?, 1);
    assert_eq!(reader.read::<u64>()?, 0);
    reader.read::<BlockPointer>()?;
    assert_eq!(reader.read::<u64>()?, 1);
    reader.read::<u64>()?;
    assert_eq!(reader.read::<u64>()?, 0);
    // the leaf header follows directly
    assert_eq!(reader.read::<u64>()?, 24);

    let config = SlabConfig::default();
    let mut nodes = FixedSizeAllocator::deserialize(manager.clone(), &config, nodes_header)?;
    let mut leaves = FixedSizeAllocator::deserialize(manager, &config, leaves_header)?;
    assert_eq!(nodes.segment_size(), 64);
    assert_eq!(leaves.segment_size(), 24);
    assert_eq!(nodes.get(node)?, &[4u8; 64][..]);
    assert_eq!(leaves.get(leaf)?, &[9u8; 24][..]);
    assert_eq!(leaf, IndexPointer::new(0, 0));
    Ok(())
}

/// Write a checkpoint and retire the one before it
fn checkpoint(
    manager: &Arc<dyn BlockManager>,
    alloc: &mut FixedSizeAllocator,
    previous: Option<BlockPointer>,
) -> Result<BlockPointer> {
    let mut writer = MetadataWriter::new(manager.clone())?;
    let root = alloc.serialize(&mut writer)?;
    writer.flush()?;
    alloc.commit_checkpoint()?;
    if let Some(previous) = previous {
        MetadataWriter::release_chain(manager.as_ref(), previous)?;
    }
    Ok(root)
}

#[test]
fn test_repeated_checkpoints_reuse_blocks() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = open(&dir)?;
    let mut alloc = FixedSizeAllocator::new(32, manager.clone())?;

    let ptrs: Vec<_> = (0..500).map(|_| alloc.allocate()).collect::<Result<_>>()?;
    let buffers = alloc.buffer_count();

    let first = checkpoint(&manager, &mut alloc, None)?;
    let after_first = manager.block_count();
    assert_eq!(after_first, buffers + 1);

    // dirty one buffer; only that buffer moves
    alloc.get_mut(ptrs[0])?.fill(1);
    let second = checkpoint(&manager, &mut alloc, Some(first))?;
    assert_eq!(manager.block_count(), after_first);

    let mut restored = FixedSizeAllocator::deserialize(manager, &SlabConfig::default(), second)?;
    assert_eq!(restored.get(ptrs[0])?, &[1u8; 32][..]);
    assert_eq!(restored.total_segment_count(), 500);
    Ok(())
}

#[test]
fn test_checkpoint_loop_keeps_block_count_stable() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = open(&dir)?;
    let mut alloc = FixedSizeAllocator::new(32, manager.clone())?;
    let ptr = alloc.allocate()?;

    let mut root = None;
    for round in 0..50u8 {
        alloc.get_mut(ptr)?.fill(round);
        root = Some(checkpoint(&manager, &mut alloc, root)?);
        // one buffer block and one metadata block
        assert_eq!(manager.block_count(), 2, "round {}", round);
    }

    let root = root.ok_or_else(|| Error::Internal("no checkpoint written".to_string()))?;
    drop(alloc);
    drop(manager);

    let manager = open(&dir)?;
    assert_eq!(manager.block_count(), 2);
    let mut restored = FixedSizeAllocator::deserialize(manager, &SlabConfig::default(), root)?;
    assert_eq!(restored.get(ptr)?, &[49u8; 32][..]);
    Ok(())
}
