//! Sector 0: filesystem geometry.
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | magic (`SUPERBLOCK_MAGIC`) |
//! | 4 | 4 | version |
//! | 8 | 4 | total sector count |
//! | 12 | 4 | free-map start sector |
//! | 16 | 4 | free-map sector count |
//! | 20 | 4 | root directory sector |

use serde::{Deserialize, Serialize};
use sfs_alloc::FreeMapLayout;
use sfs_error::SfsError;
use sfs_types::{
    FREE_MAP_START, ParseError, ROOT_DIR_SECTOR, SECTOR_SIZE, SUPERBLOCK_MAGIC, SectorBuf,
    SectorId, bitmap_sectors_for, read_le_u32,
};

pub const SUPERBLOCK_VERSION: u32 = 1;

/// Sectors past the reserved area a device needs to be worth formatting.
pub const MIN_DATA_SECTORS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub version: u32,
    pub sector_count: u32,
    pub free_map_start: SectorId,
    pub free_map_sectors: u32,
    pub root_dir: SectorId,
}

impl Superblock {
    /// Geometry for a fresh device of `sector_count` sectors.
    #[must_use]
    pub fn for_device(sector_count: u32) -> Self {
        Self {
            version: SUPERBLOCK_VERSION,
            sector_count,
            free_map_start: FREE_MAP_START,
            free_map_sectors: bitmap_sectors_for(sector_count),
            root_dir: ROOT_DIR_SECTOR,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(bytes, 0)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SUPERBLOCK_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            version: read_le_u32(bytes, 4)?,
            sector_count: read_le_u32(bytes, 8)?,
            free_map_start: SectorId(read_le_u32(bytes, 12)?),
            free_map_sectors: read_le_u32(bytes, 16)?,
            root_dir: SectorId(read_le_u32(bytes, 20)?),
        })
    }

    #[must_use]
    pub fn encode(&self) -> SectorBuf {
        let mut buf = [0_u8; SECTOR_SIZE];
        for (offset, value) in [
            (0, SUPERBLOCK_MAGIC),
            (4, self.version),
            (8, self.sector_count),
            (12, self.free_map_start.0),
            (16, self.free_map_sectors),
            (20, self.root_dir.0),
        ] {
            buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
        buf
    }

    /// Check the geometry against itself and against the device it was
    /// read from.
    pub fn validate(&self, device_sectors: u32) -> Result<(), SfsError> {
        if self.version != SUPERBLOCK_VERSION {
            return Err(SfsError::Format(format!(
                "unsupported superblock version {}",
                self.version
            )));
        }
        if self.sector_count != device_sectors {
            return Err(SfsError::Format(format!(
                "superblock sector count {} does not match device ({device_sectors})",
                self.sector_count
            )));
        }
        if self.root_dir != ROOT_DIR_SECTOR || self.free_map_start != FREE_MAP_START {
            return Err(SfsError::Format(
                "unexpected root or free-map location".to_owned(),
            ));
        }
        if self.free_map_sectors < bitmap_sectors_for(self.sector_count) {
            return Err(SfsError::Format(format!(
                "free map of {} sectors cannot cover {} sectors",
                self.free_map_sectors, self.sector_count
            )));
        }
        if self.reserved_sectors() >= self.sector_count {
            return Err(SfsError::Format(
                "reserved area covers the whole device".to_owned(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn free_map_layout(&self) -> FreeMapLayout {
        FreeMapLayout {
            start: self.free_map_start,
            sectors: self.free_map_sectors,
        }
    }

    /// Superblock, root inode and bitmap: everything below the first
    /// allocatable sector.
    #[must_use]
    pub fn reserved_sectors(&self) -> u32 {
        self.free_map_start.0.saturating_add(self.free_map_sectors)
    }
}
