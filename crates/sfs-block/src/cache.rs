//! Fixed-capacity sector cache with clock (second-chance) eviction.
//!
//! # Locking
//!
//! Two kinds of lock cooperate:
//!
//! - `table` (cache-wide) guards which slot holds which sector. It is held
//!   only while searching tags and claiming a victim, never across device
//!   I/O.
//! - each slot's `data` lock guards that slot's payload and flags, and is
//!   held for the whole device transfer when a slot is (re)loaded.
//!
//! A victim is claimed with `try_lock` while `table` is held, so the only
//! blocking acquisition order is slot -> table. A caller that locks a slot
//! and finds it now holds a different sector simply retries the lookup.

use crate::BlockDevice;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use sfs_error::{Result, SfsError};
use sfs_types::{SECTOR_SIZE, SectorBuf, SectorId};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Slot count used when the caller does not choose one.
pub const DEFAULT_CACHE_SLOTS: usize = 64;

#[derive(Debug)]
struct SlotData {
    sector: SectorId,
    valid: bool,
    dirty: bool,
    payload: Box<SectorBuf>,
}

#[derive(Debug)]
struct Slot {
    recently_used: AtomicBool,
    data: Mutex<SlotData>,
}

#[derive(Debug)]
struct SlotTable {
    /// Sector each slot holds or is loading; `None` for never-used slots.
    tags: Vec<Option<SectorId>>,
    hand: usize,
    /// Dirty sectors an evicting thread is still writing to the device.
    writing_back: HashSet<SectorId>,
}

impl SlotTable {
    fn find(&self, sector: SectorId) -> Option<usize> {
        self.tags.iter().position(|tag| *tag == Some(sector))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fill {
    /// Load the sector's current contents from the device.
    Device,
    /// Freshly allocated sector: start from zeros, skip the device read.
    Zeroed,
}

/// Counters describing cache effectiveness since creation or the last
/// [`BufferCache::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub capacity: usize,
    pub resident: usize,
    pub hits: u64,
    pub misses: u64,
    pub writebacks: u64,
    pub device_reads: u64,
}

impl CacheStats {
    /// Fraction of lookups served without a device read.
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Write-back buffer cache in front of a [`BlockDevice`].
///
/// Holds a fixed array of sector-sized slots. Reads and writes copy bytes
/// in and out of a slot's payload; callers never see an alias into the
/// cache. Dirty payloads reach the device only when their slot is evicted
/// or on [`BufferCache::flush_all`].
///
/// Invariant: a sector is tagged in at most one slot at any time.
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    slots: Box<[Slot]>,
    table: Mutex<SlotTable>,
    hits: AtomicU64,
    misses: AtomicU64,
    writebacks: AtomicU64,
    device_reads: AtomicU64,
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("capacity", &self.slots.len())
            .field("sector_count", &self.device.sector_count())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn check_span(offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= SECTOR_SIZE => Ok(()),
        _ => Err(SfsError::InvalidArgument(format!(
            "cache access outside sector: offset={offset} len={len}"
        ))),
    }
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SfsError::InvalidArgument(
                "buffer cache capacity must be > 0".to_owned(),
            ));
        }
        let slots = (0..capacity)
            .map(|_| Slot {
                recently_used: AtomicBool::new(false),
                data: Mutex::new(SlotData {
                    sector: SectorId(0),
                    valid: false,
                    dirty: false,
                    payload: Box::new([0_u8; SECTOR_SIZE]),
                }),
            })
            .collect();
        debug!(capacity, "buffer cache initialized");
        Ok(Self {
            device,
            slots,
            table: Mutex::new(SlotTable {
                tags: vec![None; capacity],
                // The first clock advance lands on slot 0, the oldest fill.
                hand: capacity - 1,
                writing_back: HashSet::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writebacks: AtomicU64::new(0),
            device_reads: AtomicU64::new(0),
        })
    }

    /// The device behind this cache.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Make `sector` resident and return the index of the slot holding it.
    ///
    /// On a miss this evicts a victim chosen by the clock (writing it back
    /// first if dirty) and loads `sector` from the device. The returned
    /// index is only a hint: a concurrent eviction may reassign the slot
    /// before the caller locks it.
    pub fn fetch(&self, sector: SectorId) -> Result<usize> {
        self.fetch_with(sector, Fill::Device)
    }

    /// Copy `buf.len()` bytes at `offset` within `sector` into `buf`.
    pub fn read(&self, sector: SectorId, offset: usize, buf: &mut [u8]) -> Result<()> {
        check_span(offset, buf.len())?;
        let slot = self.acquire(sector, Fill::Device)?;
        buf.copy_from_slice(&slot.payload[offset..offset + buf.len()]);
        drop(slot);
        Ok(())
    }

    /// Copy `data` into `sector` at `offset` and mark the slot dirty.
    pub fn write(&self, sector: SectorId, offset: usize, data: &[u8]) -> Result<()> {
        check_span(offset, data.len())?;
        let mut slot = self.acquire(sector, Fill::Device)?;
        slot.payload[offset..offset + data.len()].copy_from_slice(data);
        slot.dirty = true;
        drop(slot);
        Ok(())
    }

    /// Overwrite `sector` with zeros without reading it from the device.
    pub fn zero(&self, sector: SectorId) -> Result<()> {
        let mut slot = self.acquire(sector, Fill::Zeroed)?;
        slot.payload.fill(0);
        slot.dirty = true;
        drop(slot);
        Ok(())
    }

    /// Persist every valid, dirty slot and sync the device.
    ///
    /// Returns the number of sectors written.
    pub fn flush_all(&self) -> Result<usize> {
        let mut flushed = 0_usize;
        for slot in &*self.slots {
            let mut data = slot.data.lock();
            if data.valid && data.dirty {
                self.device.write_sector(data.sector, &data.payload)?;
                data.dirty = false;
                flushed += 1;
            }
        }
        self.device.sync()?;
        debug!(flushed, "buffer cache flushed");
        Ok(flushed)
    }

    /// Write back dirty slots, drop every cached sector and zero the
    /// statistics.
    pub fn reset(&self) -> Result<()> {
        for (index, slot) in self.slots.iter().enumerate() {
            let mut data = slot.data.lock();
            if data.valid && data.dirty {
                self.device.write_sector(data.sector, &data.payload)?;
                data.dirty = false;
            }
            data.valid = false;
            slot.recently_used.store(false, Ordering::Relaxed);
            let sector = data.sector;
            let mut table = self.table.lock();
            if table.tags[index] == Some(sector) {
                table.tags[index] = None;
            }
            drop(table);
            drop(data);
        }
        for counter in [
            &self.hits,
            &self.misses,
            &self.writebacks,
            &self.device_reads,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        debug!("buffer cache reset");
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity: self.slots.len(),
            resident: self.table.lock().tags.iter().flatten().count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
            device_reads: self.device_reads.load(Ordering::Relaxed),
        }
    }

    /// Sectors currently tagged in the slot table, in slot order.
    #[must_use]
    pub fn resident_sectors(&self) -> Vec<SectorId> {
        self.table.lock().tags.iter().flatten().copied().collect()
    }

    /// Whether `sector` is currently tagged in some slot.
    #[must_use]
    pub fn contains(&self, sector: SectorId) -> bool {
        self.table.lock().find(sector).is_some()
    }

    fn acquire(&self, sector: SectorId, fill: Fill) -> Result<MutexGuard<'_, SlotData>> {
        loop {
            let index = self.fetch_with(sector, fill)?;
            let slot = &self.slots[index];
            let data = slot.data.lock();
            if data.valid && data.sector == sector {
                slot.recently_used.store(true, Ordering::Relaxed);
                return Ok(data);
            }
            drop(data);
            trace!(sector = %sector, slot = index, "slot reassigned before lock, retrying");
        }
    }

    fn fetch_with(&self, sector: SectorId, fill: Fill) -> Result<usize> {
        loop {
            let mut table = self.table.lock();
            if let Some(index) = table.find(sector) {
                drop(table);
                self.slots[index]
                    .recently_used
                    .store(true, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(index);
            }
            if table.writing_back.contains(&sector) {
                drop(table);
                std::thread::yield_now();
                continue;
            }
            let Some((index, mut data)) = self.claim_victim(&mut table) else {
                drop(table);
                trace!(sector = %sector, "every slot busy, yielding");
                std::thread::yield_now();
                continue;
            };

            let evicted = (data.valid && data.dirty).then_some(data.sector);
            if let Some(old) = evicted {
                table.writing_back.insert(old);
            }
            table.tags[index] = Some(sector);
            drop(table);
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.slots[index]
                .recently_used
                .store(true, Ordering::Relaxed);

            if let Some(old) = evicted {
                let written = self.device.write_sector(old, &data.payload);
                let mut table = self.table.lock();
                table.writing_back.remove(&old);
                if let Err(err) = written {
                    // Keep the unsaved payload resident under its own sector.
                    table.tags[index] = Some(old);
                    drop(table);
                    warn!(sector = %old, error = %err, "write-back during eviction failed");
                    return Err(err);
                }
                drop(table);
                self.writebacks.fetch_add(1, Ordering::Relaxed);
                debug!(evicted = %old, loaded = %sector, slot = index, "wrote back dirty victim");
            }

            data.sector = sector;
            data.dirty = false;
            match fill {
                Fill::Device => {
                    if let Err(err) = self.device.read_sector(sector, &mut data.payload) {
                        data.valid = false;
                        let mut table = self.table.lock();
                        if table.tags[index] == Some(sector) {
                            table.tags[index] = None;
                        }
                        drop(table);
                        return Err(err);
                    }
                    self.device_reads.fetch_add(1, Ordering::Relaxed);
                }
                Fill::Zeroed => {
                    data.payload.fill(0);
                    data.dirty = true;
                }
            }
            data.valid = true;
            drop(data);
            trace!(sector = %sector, slot = index, "cache miss filled");
            return Ok(index);
        }
    }

    /// Pick a slot to (re)use while the table lock is held.
    ///
    /// Never-used slots win outright. Otherwise the hand sweeps at most two
    /// full turns: a recently-used slot loses its flag and is skipped once,
    /// a slot someone else has locked is skipped.
    fn claim_victim(&self, table: &mut SlotTable) -> Option<(usize, MutexGuard<'_, SlotData>)> {
        for (index, tag) in table.tags.iter().enumerate() {
            if tag.is_none() {
                if let Some(data) = self.slots[index].data.try_lock() {
                    return Some((index, data));
                }
            }
        }

        let len = self.slots.len();
        for _ in 0..2 * len {
            table.hand = (table.hand + 1) % len;
            let slot = &self.slots[table.hand];
            if slot.recently_used.swap(false, Ordering::AcqRel) {
                continue;
            }
            if let Some(data) = slot.data.try_lock() {
                return Some((table.hand, data));
            }
        }
        None
    }
}
