//! Pointer I/O for index blocks and logical-to-physical translation.

use crate::layout::{BlockSlot, InodeRecord};
use serde::{Deserialize, Serialize};
use sfs_block::BufferCache;
use sfs_error::{Result, SfsError};
use sfs_types::{POINTERS_PER_SECTOR, SECTOR_SIZE, SectorId};

pub(crate) fn read_pointer(
    cache: &BufferCache,
    block: SectorId,
    slot: usize,
) -> Result<Option<SectorId>> {
    let mut raw = [0_u8; 4];
    cache.read(block, slot * 4, &mut raw)?;
    Ok(SectorId::from_pointer(u32::from_le_bytes(raw)))
}

pub(crate) fn write_pointer(
    cache: &BufferCache,
    block: SectorId,
    slot: usize,
    value: Option<SectorId>,
) -> Result<()> {
    cache.write(block, slot * 4, &SectorId::to_pointer(value).to_le_bytes())
}

/// Every pointer held by one index block.
pub(crate) fn read_index(cache: &BufferCache, block: SectorId) -> Result<Vec<Option<SectorId>>> {
    let mut raw = [0_u8; SECTOR_SIZE];
    cache.read(block, 0, &mut raw)?;
    Ok(raw
        .chunks_exact(4)
        .map(|p| SectorId::from_pointer(u32::from_le_bytes([p[0], p[1], p[2], p[3]])))
        .collect())
}

fn missing_index(inode: SectorId, tier: &str) -> SfsError {
    SfsError::Corruption {
        sector: inode.0,
        detail: format!("{tier} index block missing below file length"),
    }
}

/// Data sector backing logical sector `index`, or `None` for a hole.
pub(crate) fn lookup(
    cache: &BufferCache,
    inode: SectorId,
    record: &InodeRecord,
    index: usize,
) -> Result<Option<SectorId>> {
    match BlockSlot::locate(index) {
        None => Ok(None),
        Some(BlockSlot::Direct(i)) => Ok(record.direct[i]),
        Some(BlockSlot::Indirect(i)) => {
            let block = record
                .indirect
                .ok_or_else(|| missing_index(inode, "indirect"))?;
            read_pointer(cache, block, i)
        }
        Some(BlockSlot::DoublyIndirect { outer, inner }) => {
            let doubly = record
                .doubly_indirect
                .ok_or_else(|| missing_index(inode, "doubly-indirect"))?;
            let Some(block) = read_pointer(cache, doubly, outer)? else {
                return Err(missing_index(inode, "second-level"));
            };
            read_pointer(cache, block, inner)
        }
    }
}

/// Sectors reachable from one inode record, counted by walking every
/// non-zero pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockCensus {
    pub data_blocks: usize,
    pub index_blocks: usize,
}

pub(crate) fn census(cache: &BufferCache, record: &InodeRecord) -> Result<BlockCensus> {
    let mut out = BlockCensus {
        data_blocks: record.direct.iter().flatten().count(),
        index_blocks: 0,
    };
    if let Some(block) = record.indirect {
        out.index_blocks += 1;
        out.data_blocks += read_index(cache, block)?.iter().flatten().count();
    }
    if let Some(doubly) = record.doubly_indirect {
        out.index_blocks += 1;
        for block in read_index(cache, doubly)?.into_iter().flatten() {
            out.index_blocks += 1;
            out.data_blocks += read_index(cache, block)?.iter().flatten().count();
        }
    }
    debug_assert!(out.index_blocks <= 2 + POINTERS_PER_SECTOR);
    Ok(out)
}
