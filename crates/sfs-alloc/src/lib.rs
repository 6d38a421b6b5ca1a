#![forbid(unsafe_code)]
//! Sector allocation.
//!
//! The inode engine only needs "give me N free sectors" and "take these
//! back", expressed as the [`SectorAllocator`] trait. [`FreeMap`] is the
//! bitmap-backed implementation: one bit per device sector, persisted in
//! a run of sectors right after the root directory inode and moved in and
//! out of memory through the buffer cache.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sfs_block::BufferCache;
use sfs_error::{Result, SfsError};
use sfs_types::{SECTOR_SIZE, SectorId, bitmap_sectors_for};
use tracing::{debug, trace};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    if let Some(byte) = bitmap.get_mut(byte_idx) {
        *byte |= 1 << (idx % 8);
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    if let Some(byte) = bitmap.get_mut(byte_idx) {
        *byte &= !(1 << (idx % 8));
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let mut free = 0_u32;
    for idx in 0..count {
        if !bitmap_get(bitmap, idx) {
            free += 1;
        }
    }
    free
}

/// Find `n` contiguous free bits in the first `count` bits of `bitmap`.
///
/// Returns the index of the first bit of the lowest such run.
#[must_use]
pub fn bitmap_find_contiguous(bitmap: &[u8], count: u32, n: u32) -> Option<u32> {
    if n == 0 {
        return Some(0);
    }
    let mut run_start = 0_u32;
    let mut run_len = 0_u32;
    let mut idx = 0_u32;

    while idx < count {
        // Skip whole bytes of used sectors between runs.
        if run_len == 0 && idx % 8 == 0 && bitmap.get((idx / 8) as usize) == Some(&0xFF) {
            idx += 8;
            run_start = idx;
            continue;
        }
        if bitmap_get(bitmap, idx) {
            run_start = idx + 1;
            run_len = 0;
        } else {
            run_len += 1;
            if run_len >= n {
                return Some(run_start);
            }
        }
        idx += 1;
    }
    None
}

// ── Allocator trait ─────────────────────────────────────────────────────────

/// Source of free sectors for inode records, data blocks and index blocks.
pub trait SectorAllocator: Send + Sync {
    /// Reserve `count` contiguous free sectors and return the first.
    ///
    /// Fails with [`SfsError::NoSpace`] when no such run exists; nothing is
    /// reserved in that case.
    fn allocate(&self, count: u32) -> Result<SectorId>;

    /// Return `count` sectors starting at `start` to the free pool.
    fn release(&self, start: SectorId, count: u32) -> Result<()>;

    /// Sectors currently free.
    fn free_count(&self) -> u32;
}

// ── Free map ────────────────────────────────────────────────────────────────

/// Where the persisted bitmap lives on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeMapLayout {
    pub start: SectorId,
    pub sectors: u32,
}

impl FreeMapLayout {
    /// Layout for a device of `sector_count` sectors with the bitmap at
    /// `start`.
    #[must_use]
    pub fn for_device(start: SectorId, sector_count: u32) -> Self {
        Self {
            start,
            sectors: bitmap_sectors_for(sector_count),
        }
    }

    /// One past the last bitmap sector.
    #[must_use]
    pub fn end(&self) -> u32 {
        self.start.0.saturating_add(self.sectors)
    }
}

fn bitmap_sector(layout: FreeMapLayout, index: usize) -> Result<SectorId> {
    u32::try_from(index)
        .ok()
        .and_then(|index| layout.start.checked_add(index))
        .ok_or_else(|| SfsError::Format("free map runs past u32 sectors".to_owned()))
}

#[derive(Debug)]
struct FreeMapState {
    bits: Vec<u8>,
    free: u32,
}

/// In-memory free-space bitmap covering every sector of one device.
///
/// A set bit means "in use". Allocation is first-fit over the whole map.
#[derive(Debug)]
pub struct FreeMap {
    sector_count: u32,
    state: Mutex<FreeMapState>,
}

impl FreeMap {
    /// A map with every sector free.
    #[must_use]
    pub fn new(sector_count: u32) -> Self {
        let bytes = (sector_count as usize).div_ceil(8);
        Self {
            sector_count,
            state: Mutex::new(FreeMapState {
                bits: vec![0; bytes],
                free: sector_count,
            }),
        }
    }

    #[must_use]
    pub fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn check_run(&self, start: SectorId, count: u32) -> Result<u32> {
        match start.0.checked_add(count) {
            Some(end) if end <= self.sector_count => Ok(end),
            _ => Err(SfsError::Corruption {
                sector: start.0,
                detail: format!(
                    "sector run out of range: count={count} sector_count={}",
                    self.sector_count
                ),
            }),
        }
    }

    /// Mark a fixed run (superblock, root inode, the bitmap itself) as used.
    pub fn reserve(&self, start: SectorId, count: u32) -> Result<()> {
        let end = self.check_run(start, count)?;
        let mut state = self.state.lock();
        for idx in start.0..end {
            if !bitmap_get(&state.bits, idx) {
                bitmap_set(&mut state.bits, idx);
                state.free -= 1;
            }
        }
        drop(state);
        debug!(start = start.0, count, "reserved sectors");
        Ok(())
    }

    /// Whether `sector` is currently marked in use.
    #[must_use]
    pub fn is_allocated(&self, sector: SectorId) -> bool {
        bitmap_get(&self.state.lock().bits, sector.0)
    }

    /// Read the persisted bitmap through `cache`.
    pub fn load(cache: &BufferCache, layout: FreeMapLayout, sector_count: u32) -> Result<Self> {
        if layout.sectors < bitmap_sectors_for(sector_count) {
            return Err(SfsError::Format(format!(
                "free map too small: sectors={} needed={}",
                layout.sectors,
                bitmap_sectors_for(sector_count)
            )));
        }
        let map = Self::new(sector_count);
        let mut state = map.state.lock();
        let len = state.bits.len();
        for (i, chunk) in state.bits.chunks_mut(SECTOR_SIZE).enumerate() {
            let sector = bitmap_sector(layout, i)?;
            cache.read(sector, 0, chunk)?;
        }
        state.free = bitmap_count_free(&state.bits, sector_count);
        let free = state.free;
        drop(state);
        debug!(bytes = len, free, "free map loaded");
        Ok(map)
    }

    /// Write the bitmap back through `cache`.
    ///
    /// Only dirties cache slots; the caller decides when to flush.
    pub fn store(&self, cache: &BufferCache, layout: FreeMapLayout) -> Result<()> {
        let state = self.state.lock();
        for (i, chunk) in state.bits.chunks(SECTOR_SIZE).enumerate() {
            let sector = bitmap_sector(layout, i)?;
            let mut padded = [0_u8; SECTOR_SIZE];
            padded[..chunk.len()].copy_from_slice(chunk);
            cache.write(sector, 0, &padded)?;
        }
        let free = state.free;
        drop(state);
        debug!(free, "free map stored");
        Ok(())
    }
}

impl SectorAllocator for FreeMap {
    fn allocate(&self, count: u32) -> Result<SectorId> {
        if count == 0 {
            return Err(SfsError::InvalidArgument(
                "cannot allocate zero sectors".to_owned(),
            ));
        }
        let mut state = self.state.lock();
        let Some(start) = bitmap_find_contiguous(&state.bits, self.sector_count, count) else {
            let free = state.free;
            drop(state);
            debug!(count, free, "allocation failed: no contiguous run");
            return Err(SfsError::NoSpace);
        };
        for idx in start..start + count {
            bitmap_set(&mut state.bits, idx);
        }
        state.free -= count;
        drop(state);
        trace!(start, count, "allocated sectors");
        Ok(SectorId(start))
    }

    fn release(&self, start: SectorId, count: u32) -> Result<()> {
        let end = self.check_run(start, count)?;
        let mut state = self.state.lock();
        if let Some(idx) = (start.0..end).find(|&idx| !bitmap_get(&state.bits, idx)) {
            drop(state);
            return Err(SfsError::Corruption {
                sector: idx,
                detail: "releasing a sector that is already free".to_owned(),
            });
        }
        for idx in start.0..end {
            bitmap_clear(&mut state.bits, idx);
        }
        state.free += count;
        drop(state);
        trace!(start = start.0, count, "released sectors");
        Ok(())
    }

    fn free_count(&self) -> u32 {
        self.state.lock().free
    }
}
