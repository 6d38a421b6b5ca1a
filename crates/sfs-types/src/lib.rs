#![forbid(unsafe_code)]
//! Shared on-disk constants and identifiers for SectorFS.
//!
//! Every other crate in the workspace speaks in [`SectorId`]s and the
//! geometry constants defined here, so the on-disk layout has exactly one
//! source of truth.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Bytes per device sector. Every inode record occupies exactly one sector.
pub const SECTOR_SIZE: usize = 512;

/// A whole-sector payload.
pub type SectorBuf = [u8; SECTOR_SIZE];

/// Direct block pointers stored inline in an inode record.
pub const DIRECT_POINTERS: usize = 12;

/// Sector pointers that fit in one index block.
pub const POINTERS_PER_SECTOR: usize = SECTOR_SIZE / 4;

/// Largest number of data sectors a single inode can map.
pub const MAX_FILE_SECTORS: usize =
    DIRECT_POINTERS + POINTERS_PER_SECTOR + POINTERS_PER_SECTOR * POINTERS_PER_SECTOR;

/// Largest representable file length in bytes.
pub const MAX_FILE_LEN: u64 = (MAX_FILE_SECTORS * SECTOR_SIZE) as u64;

/// Magic tag stamped into every inode record ("INOD").
pub const INODE_MAGIC: u32 = 0x494E_4F44;

/// Magic tag stamped into the superblock ("SFS1").
pub const SUPERBLOCK_MAGIC: u32 = 0x5346_5331;

/// Longest directory entry name, in bytes.
pub const NAME_MAX: usize = 14;

/// Sector holding the superblock.
pub const SUPERBLOCK_SECTOR: SectorId = SectorId(0);

/// Sector holding the root directory inode.
pub const ROOT_DIR_SECTOR: SectorId = SectorId(1);

/// First sector of the persisted free-space bitmap.
pub const FREE_MAP_START: SectorId = SectorId(2);

/// Bits tracked by one bitmap sector.
pub const BITS_PER_SECTOR: u32 = (SECTOR_SIZE * 8) as u32;

/// Device sector number.
///
/// On disk a pointer value of 0 means "unallocated"; use
/// [`SectorId::from_pointer`] / [`SectorId::to_pointer`] at that boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorId(pub u32);

impl SectorId {
    /// Decode an on-disk pointer; zero is the unallocated marker.
    #[must_use]
    pub fn from_pointer(raw: u32) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    /// Encode an optional sector as an on-disk pointer.
    #[must_use]
    pub fn to_pointer(sector: Option<Self>) -> u32 {
        sector.map_or(0, |s| s.0)
    }

    /// Byte offset of this sector on a flat device.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) * SECTOR_SIZE as u64
    }

    /// The sector `count` places after this one, if it fits in `u32`.
    #[must_use]
    pub fn checked_add(self, count: u32) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of sectors needed to hold `len` bytes.
#[must_use]
pub fn bytes_to_sectors(len: u64) -> u64 {
    len.div_ceil(SECTOR_SIZE as u64)
}

/// Sectors needed for a free-space bitmap covering `sector_count` sectors.
#[must_use]
pub fn bitmap_sectors_for(sector_count: u32) -> u32 {
    sector_count.div_ceil(BITS_PER_SECTOR)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    let actual = data.len().saturating_sub(offset);
    let dst = data
        .get_mut(offset..offset + 4)
        .ok_or(ParseError::InsufficientData {
            needed: 4,
            offset,
            actual,
        })?;
    dst.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
