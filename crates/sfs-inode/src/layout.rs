//! On-disk inode record and the logical-index to tier mapping.
//!
//! Record layout (one 512-byte sector, little-endian):
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 48 | 12 direct pointers |
//! | 48 | 4 | singly-indirect pointer |
//! | 52 | 4 | doubly-indirect pointer |
//! | 56 | 4 | length in bytes |
//! | 60 | 4 | magic (`INODE_MAGIC`) |
//! | 64 | 4 | is-directory flag (0 or 1) |
//! | 68 | 444 | zero padding |

use sfs_types::{
    DIRECT_POINTERS, INODE_MAGIC, MAX_FILE_SECTORS, POINTERS_PER_SECTOR, ParseError, SECTOR_SIZE,
    SectorBuf, SectorId, read_le_u32,
};

const INDIRECT_OFFSET: usize = DIRECT_POINTERS * 4;
const DOUBLY_OFFSET: usize = INDIRECT_OFFSET + 4;
const LENGTH_OFFSET: usize = DOUBLY_OFFSET + 4;
const MAGIC_OFFSET: usize = LENGTH_OFFSET + 4;
const IS_DIR_OFFSET: usize = MAGIC_OFFSET + 4;

/// Decoded inode record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    pub direct: [Option<SectorId>; DIRECT_POINTERS],
    pub indirect: Option<SectorId>,
    pub doubly_indirect: Option<SectorId>,
    pub length: u32,
    pub is_dir: bool,
}

impl InodeRecord {
    /// An empty record: no blocks, zero length.
    #[must_use]
    pub fn new(is_dir: bool) -> Self {
        Self {
            direct: [None; DIRECT_POINTERS],
            indirect: None,
            doubly_indirect: None,
            length: 0,
            is_dir,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(bytes, MAGIC_OFFSET)?;
        if magic != INODE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: INODE_MAGIC,
                actual: magic,
            });
        }
        let mut direct = [None; DIRECT_POINTERS];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = SectorId::from_pointer(read_le_u32(bytes, i * 4)?);
        }
        let is_dir = match read_le_u32(bytes, IS_DIR_OFFSET)? {
            0 => false,
            1 => true,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "is_dir",
                    reason: "must be 0 or 1",
                });
            }
        };
        let length = read_le_u32(bytes, LENGTH_OFFSET)?;
        if u64::from(length) > sfs_types::MAX_FILE_LEN {
            return Err(ParseError::InvalidField {
                field: "length",
                reason: "exceeds pointer tier capacity",
            });
        }
        Ok(Self {
            direct,
            indirect: SectorId::from_pointer(read_le_u32(bytes, INDIRECT_OFFSET)?),
            doubly_indirect: SectorId::from_pointer(read_le_u32(bytes, DOUBLY_OFFSET)?),
            length,
            is_dir,
        })
    }

    /// Serialize into a full sector.
    #[must_use]
    pub fn encode(&self) -> SectorBuf {
        let mut buf = [0_u8; SECTOR_SIZE];
        let mut put = |offset: usize, value: u32| {
            buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        };
        for (i, slot) in self.direct.iter().enumerate() {
            put(i * 4, SectorId::to_pointer(*slot));
        }
        put(INDIRECT_OFFSET, SectorId::to_pointer(self.indirect));
        put(DOUBLY_OFFSET, SectorId::to_pointer(self.doubly_indirect));
        put(LENGTH_OFFSET, self.length);
        put(MAGIC_OFFSET, INODE_MAGIC);
        put(IS_DIR_OFFSET, u32::from(self.is_dir));
        buf
    }

    /// Data sectors implied by the current length.
    #[must_use]
    pub fn block_count(&self) -> usize {
        (self.length as usize).div_ceil(SECTOR_SIZE)
    }
}

/// Where the pointer for one logical sector index lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSlot {
    /// `direct[i]` in the record itself.
    Direct(usize),
    /// Slot `i` of the singly-indirect index block.
    Indirect(usize),
    /// Slot `inner` of the index block named by slot `outer` of the
    /// doubly-indirect block.
    DoublyIndirect { outer: usize, inner: usize },
}

impl BlockSlot {
    /// Map a logical sector index to its tier, or `None` past capacity.
    #[must_use]
    pub fn locate(index: usize) -> Option<Self> {
        if index < DIRECT_POINTERS {
            return Some(Self::Direct(index));
        }
        let index = index - DIRECT_POINTERS;
        if index < POINTERS_PER_SECTOR {
            return Some(Self::Indirect(index));
        }
        let index = index - POINTERS_PER_SECTOR;
        if index < POINTERS_PER_SECTOR * POINTERS_PER_SECTOR {
            return Some(Self::DoublyIndirect {
                outer: index / POINTERS_PER_SECTOR,
                inner: index % POINTERS_PER_SECTOR,
            });
        }
        None
    }
}

/// Doubly-indirect data blocks needed to reach `data_blocks` total.
fn doubly_data_blocks(data_blocks: usize) -> usize {
    data_blocks.saturating_sub(DIRECT_POINTERS + POINTERS_PER_SECTOR)
}

/// Second-level index blocks in use under the doubly-indirect block.
#[must_use]
pub fn outer_blocks_for(data_blocks: usize) -> usize {
    doubly_data_blocks(data_blocks).div_ceil(POINTERS_PER_SECTOR)
}

/// Index blocks (singly, doubly and second-level) a file of
/// `data_blocks` data sectors owns.
#[must_use]
pub fn index_blocks_for(data_blocks: usize) -> usize {
    let indirect = usize::from(data_blocks > DIRECT_POINTERS);
    let doubly = usize::from(data_blocks > DIRECT_POINTERS + POINTERS_PER_SECTOR);
    indirect + doubly + outer_blocks_for(data_blocks)
}

/// Whether `data_blocks` fits in the three tiers.
#[must_use]
pub fn fits(data_blocks: usize) -> bool {
    data_blocks <= MAX_FILE_SECTORS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips() {
        let mut record = InodeRecord::new(true);
        record.direct[0] = Some(SectorId(40));
        record.direct[11] = Some(SectorId(51));
        record.indirect = Some(SectorId(60));
        record.length = 7_000;
        let bytes = record.encode();
        assert_eq!(InodeRecord::parse(&bytes).expect("parse"), record);
        assert_eq!(read_le_u32(&bytes, 60).expect("magic"), INODE_MAGIC);
        assert!(bytes[68..].iter().all(|b| *b == 0));
    }

    #[test]
    fn parse_rejects_bad_magic_and_flags() {
        let zeroed = [0_u8; SECTOR_SIZE];
        assert!(matches!(
            InodeRecord::parse(&zeroed),
            Err(ParseError::InvalidMagic { actual: 0, .. })
        ));

        let mut bytes = InodeRecord::new(false).encode();
        bytes[IS_DIR_OFFSET] = 7;
        assert!(matches!(
            InodeRecord::parse(&bytes),
            Err(ParseError::InvalidField { field: "is_dir", .. })
        ));
    }

    #[test]
    fn locate_tier_boundaries() {
        assert_eq!(BlockSlot::locate(0), Some(BlockSlot::Direct(0)));
        assert_eq!(BlockSlot::locate(11), Some(BlockSlot::Direct(11)));
        assert_eq!(BlockSlot::locate(12), Some(BlockSlot::Indirect(0)));
        assert_eq!(BlockSlot::locate(139), Some(BlockSlot::Indirect(127)));
        assert_eq!(
            BlockSlot::locate(140),
            Some(BlockSlot::DoublyIndirect { outer: 0, inner: 0 })
        );
        assert_eq!(
            BlockSlot::locate(140 + 128 * 3 + 5),
            Some(BlockSlot::DoublyIndirect { outer: 3, inner: 5 })
        );
        assert_eq!(
            BlockSlot::locate(MAX_FILE_SECTORS - 1),
            Some(BlockSlot::DoublyIndirect {
                outer: 127,
                inner: 127
            })
        );
        assert_eq!(BlockSlot::locate(MAX_FILE_SECTORS), None);
    }

    #[test]
    fn index_block_formula() {
        assert_eq!(index_blocks_for(0), 0);
        assert_eq!(index_blocks_for(12), 0);
        assert_eq!(index_blocks_for(13), 1);
        assert_eq!(index_blocks_for(137), 1);
        assert_eq!(index_blocks_for(140), 1);
        assert_eq!(index_blocks_for(141), 3);
        assert_eq!(index_blocks_for(140 + 128), 3);
        assert_eq!(index_blocks_for(140 + 129), 4);
        assert_eq!(index_blocks_for(MAX_FILE_SECTORS), 2 + 128);
    }
}
