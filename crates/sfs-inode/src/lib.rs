#![forbid(unsafe_code)]
//! Inode engine.
//!
//! An inode is one sector-sized record mapping up to
//! `12 + 128 + 128²` data sectors through direct, singly-indirect and
//! doubly-indirect pointers. [`InodeTable`] deduplicates open inodes so every
//! opener of a sector shares one in-memory inode and one reference count.
//!
//! ## Locking
//!
//! - The table lock guards the sector -> inode map and every open-count
//!   change, so check-then-insert and the last close are atomic.
//! - Each inode's record lock serializes `read_at`, `write_at` and
//!   `resize` on that inode. Different inodes never contend.
//! - Each inode also carries a namespace lock that the directory layer
//!   takes around lookup-then-modify sequences.
//!
//! Lock order: table -> inode state, record -> inode state. The record lock
//! is never taken while the table lock is held.

mod layout;
mod resize;
mod tier;

pub use layout::{BlockSlot, InodeRecord, index_blocks_for};
pub use tier::BlockCensus;

use parking_lot::{Mutex, MutexGuard};
use resize::Resizer;
use sfs_alloc::SectorAllocator;
use sfs_block::BufferCache;
use sfs_error::{Result, SfsError};
use sfs_types::{SECTOR_SIZE, SectorId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
struct OpenState {
    open_count: usize,
    removed: bool,
    deny_write: usize,
}

/// In-memory state of one open inode, shared by every handle to its sector.
#[derive(Debug)]
struct Inode {
    sector: SectorId,
    state: Mutex<OpenState>,
    record: Mutex<InodeRecord>,
    namespace: Mutex<()>,
}

/// Shared context: the cache, the allocator and the open-inode map.
pub struct InodeTable {
    cache: Arc<BufferCache>,
    allocator: Arc<dyn SectorAllocator>,
    open: Mutex<HashMap<SectorId, Arc<Inode>>>,
}

impl std::fmt::Debug for InodeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeTable")
            .field("open_inodes", &self.open.lock().len())
            .field("free_sectors", &self.allocator.free_count())
            .finish_non_exhaustive()
    }
}

fn corrupt(sector: SectorId, err: &sfs_types::ParseError) -> SfsError {
    SfsError::Corruption {
        sector: sector.0,
        detail: err.to_string(),
    }
}

impl InodeTable {
    #[must_use]
    pub fn new(cache: Arc<BufferCache>, allocator: Arc<dyn SectorAllocator>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            allocator,
            open: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    #[must_use]
    pub fn allocator(&self) -> &Arc<dyn SectorAllocator> {
        &self.allocator
    }

    /// Number of distinct inodes currently open.
    #[must_use]
    pub fn open_inodes(&self) -> usize {
        self.open.lock().len()
    }

    /// Write a fresh record at `sector` with `length` bytes of zeroed,
    /// eagerly allocated data.
    ///
    /// `sector` must already be reserved by the caller. On `NoSpace` every
    /// sector taken for data is released again and nothing is written.
    pub fn create(&self, sector: SectorId, length: u64, is_dir: bool) -> Result<()> {
        let mut record = InodeRecord::new(is_dir);
        Resizer {
            cache: &self.cache,
            allocator: self.allocator.as_ref(),
            inode: sector,
        }
        .resize(&mut record, length)?;
        self.cache.write(sector, 0, &record.encode())?;
        debug!(sector = %sector, length, is_dir, "created inode");
        Ok(())
    }

    /// Open the inode at `sector`, sharing state with any existing opener.
    pub fn open(self: &Arc<Self>, sector: SectorId) -> Result<InodeHandle> {
        let mut open = self.open.lock();
        if let Some(inode) = open.get(&sector) {
            let inode = Arc::clone(inode);
            inode.state.lock().open_count += 1;
            drop(open);
            trace!(sector = %sector, "reopened cached inode");
            return Ok(InodeHandle::new(Arc::clone(self), inode));
        }

        let mut raw = [0_u8; SECTOR_SIZE];
        self.cache.read(sector, 0, &mut raw)?;
        let record = InodeRecord::parse(&raw).map_err(|err| corrupt(sector, &err))?;
        let inode = Arc::new(Inode {
            sector,
            state: Mutex::new(OpenState {
                open_count: 1,
                ..OpenState::default()
            }),
            record: Mutex::new(record),
            namespace: Mutex::new(()),
        });
        open.insert(sector, Arc::clone(&inode));
        drop(open);
        trace!(sector = %sector, "opened inode");
        Ok(InodeHandle::new(Arc::clone(self), inode))
    }

    /// Drop one reference; the last close of a removed inode reclaims it.
    fn release(&self, inode: &Arc<Inode>) -> Result<()> {
        let mut open = self.open.lock();
        let mut state = inode.state.lock();
        state.open_count = state.open_count.saturating_sub(1);
        if state.open_count > 0 {
            return Ok(());
        }
        let removed = state.removed;
        drop(state);
        open.remove(&inode.sector);
        drop(open);

        if removed {
            self.reclaim(inode)?;
        }
        Ok(())
    }

    /// Release every data and index block, then the inode sector itself.
    fn reclaim(&self, inode: &Inode) -> Result<()> {
        let mut record = inode.record.lock();
        let blocks = record.block_count();
        let resized = Resizer {
            cache: &self.cache,
            allocator: self.allocator.as_ref(),
            inode: inode.sector,
        }
        .resize(&mut record, 0);
        drop(record);
        if let Err(err) = &resized {
            warn!(sector = %inode.sector, error = %err, "failed to reclaim data blocks");
        }
        self.allocator.release(inode.sector, 1)?;
        debug!(sector = %inode.sector, data_blocks = blocks, "reclaimed removed inode");
        resized
    }
}

/// One reference to an open inode.
///
/// Dropping the handle closes it; call [`InodeHandle::close`] to observe
/// reclamation errors.
#[derive(Debug)]
pub struct InodeHandle {
    table: Arc<InodeTable>,
    inode: Arc<Inode>,
    denied: bool,
    closed: bool,
}

impl InodeHandle {
    fn new(table: Arc<InodeTable>, inode: Arc<Inode>) -> Self {
        Self {
            table,
            inode,
            denied: false,
            closed: false,
        }
    }

    /// A second handle to the same inode.
    pub fn reopen(&self) -> Result<Self> {
        self.table.open(self.inode.sector)
    }

    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.allow_write();
        self.table.release(&self.inode)
    }

    #[must_use]
    pub fn table(&self) -> &Arc<InodeTable> {
        &self.table
    }

    /// Inode number: the sector holding the record.
    #[must_use]
    pub fn sector(&self) -> SectorId {
        self.inode.sector
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        u64::from(self.inode.record.lock().length)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.inode.record.lock().is_dir
    }

    /// Mark for deletion; blocks are reclaimed at the last close.
    pub fn remove(&self) {
        self.inode.state.lock().removed = true;
        debug!(sector = %self.inode.sector, "inode marked removed");
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.inode.state.lock().removed
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inode.state.lock().open_count
    }

    #[must_use]
    pub fn deny_write_count(&self) -> usize {
        self.inode.state.lock().deny_write
    }

    /// Block writers through every handle until this one allows them again
    /// or closes. Idempotent per handle.
    pub fn deny_write(&mut self) {
        if self.denied {
            return;
        }
        let mut state = self.inode.state.lock();
        state.deny_write += 1;
        debug_assert!(state.deny_write <= state.open_count);
        drop(state);
        self.denied = true;
    }

    pub fn allow_write(&mut self) {
        if !self.denied {
            return;
        }
        let mut state = self.inode.state.lock();
        state.deny_write = state.deny_write.saturating_sub(1);
        drop(state);
        self.denied = false;
    }

    /// Serialize a directory's lookup-then-modify sequence.
    pub fn lock_namespace(&self) -> MutexGuard<'_, ()> {
        self.inode.namespace.lock()
    }

    fn resizer(&self) -> Resizer<'_> {
        Resizer {
            cache: &self.table.cache,
            allocator: self.table.allocator.as_ref(),
            inode: self.inode.sector,
        }
    }

    /// Read up to `buf.len()` bytes at `offset`, stopping at end of file.
    #[expect(clippy::cast_possible_truncation)]
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let record = self.inode.record.lock();
        let length = u64::from(record.length);
        let mut done = 0_usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            if pos >= length {
                break;
            }
            let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
            let left_in_file = usize::try_from(length - pos).unwrap_or(usize::MAX);
            let chunk = (buf.len() - done)
                .min(SECTOR_SIZE - sector_ofs)
                .min(left_in_file);
            let index = usize::try_from(pos / SECTOR_SIZE as u64).unwrap_or(usize::MAX);
            let sector = self.data_sector(&record, index)?;
            self.table
                .cache
                .read(sector, sector_ofs, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        drop(record);
        Ok(done)
    }

    /// Write `data` at `offset`, growing the file first when needed.
    ///
    /// Returns `Ok(0)` while writes are denied. Growth failures leave the
    /// file unchanged and are returned as errors.
    #[expect(clippy::cast_possible_truncation)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut record = self.inode.record.lock();
        if self.inode.state.lock().deny_write > 0 {
            trace!(sector = %self.inode.sector, "write denied");
            return Ok(0);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(SfsError::FileTooLarge)?;
        if end > u64::from(record.length) {
            self.resizer().resize(&mut record, end)?;
            self.table
                .cache
                .write(self.inode.sector, 0, &record.encode())?;
        }

        let mut done = 0_usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (data.len() - done).min(SECTOR_SIZE - sector_ofs);
            let index = usize::try_from(pos / SECTOR_SIZE as u64).unwrap_or(usize::MAX);
            let sector = self.data_sector(&record, index)?;
            self.table
                .cache
                .write(sector, sector_ofs, &data[done..done + chunk])?;
            done += chunk;
        }
        drop(record);
        Ok(done)
    }

    /// Grow or shrink to exactly `length` bytes.
    ///
    /// Fails with `Busy` while writes are denied, leaving the file as is.
    pub fn resize(&self, length: u64) -> Result<()> {
        let mut record = self.inode.record.lock();
        if self.inode.state.lock().deny_write > 0 {
            debug!(sector = %self.inode.sector, length, "resize denied");
            return Err(SfsError::Busy);
        }
        self.resizer().resize(&mut record, length)?;
        self.table
            .cache
            .write(self.inode.sector, 0, &record.encode())?;
        drop(record);
        Ok(())
    }

    /// Walk the pointer tree and count every reachable block.
    pub fn census(&self) -> Result<BlockCensus> {
        let record = self.inode.record.lock();
        tier::census(&self.table.cache, &record)
    }

    /// Distinct data blocks reachable from the record.
    pub fn data_block_count(&self) -> Result<usize> {
        Ok(self.census()?.data_blocks)
    }

    fn data_sector(&self, record: &InodeRecord, index: usize) -> Result<SectorId> {
        tier::lookup(&self.table.cache, self.inode.sector, record, index)?.ok_or_else(|| {
            SfsError::Corruption {
                sector: self.inode.sector.0,
                detail: format!("no data block for index {index} below file length"),
            }
        })
    }
}

impl Drop for InodeHandle {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(sector = %self.inode.sector, error = %err, "error closing inode on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sfs_alloc::FreeMap;
    use sfs_block::{BlockDevice, MemBlockDevice};
    use sfs_types::{MAX_FILE_LEN, MAX_FILE_SECTORS, SectorBuf};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixture {
        dev: Arc<MemBlockDevice>,
        map: Arc<FreeMap>,
        table: Arc<InodeTable>,
    }

    fn fixture(sectors: u32) -> Fixture {
        let dev = Arc::new(MemBlockDevice::new(sectors));
        let cache = Arc::new(BufferCache::new(dev.clone(), 16).expect("cache"));
        let map = Arc::new(FreeMap::new(sectors));
        map.reserve(SectorId(0), 1).expect("reserve sector 0");
        let table = InodeTable::new(cache, map.clone());
        Fixture { dev, map, table }
    }

    fn new_inode(fx: &Fixture, length: u64) -> InodeHandle {
        let sector = fx.map.allocate(1).expect("inode sector");
        fx.table.create(sector, length, false).expect("create");
        fx.table.open(sector).expect("open")
    }

    /// Device whose writes can be made to fail on demand.
    #[derive(Debug)]
    struct FlakyDevice {
        inner: MemBlockDevice,
        fail_writes: AtomicBool,
    }

    impl BlockDevice for FlakyDevice {
        fn read_sector(&self, sector: SectorId, buf: &mut SectorBuf) -> Result<()> {
            self.inner.read_sector(sector, buf)
        }

        fn write_sector(&self, sector: SectorId, buf: &SectorBuf) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(SfsError::Io(std::io::Error::other("injected write failure")));
            }
            self.inner.write_sector(sector, buf)
        }

        fn sector_count(&self) -> u32 {
            self.inner.sector_count()
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    fn flaky_fixture(sectors: u32, slots: usize) -> (Arc<FlakyDevice>, Arc<FreeMap>, Arc<InodeTable>) {
        let dev = Arc::new(FlakyDevice {
            inner: MemBlockDevice::new(sectors),
            fail_writes: AtomicBool::new(false),
        });
        let cache = Arc::new(BufferCache::new(dev.clone(), slots).expect("cache"));
        let map = Arc::new(FreeMap::new(sectors));
        map.reserve(SectorId(0), 1).expect("reserve sector 0");
        let table = InodeTable::new(cache, map.clone());
        (dev, map, table)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    // ── Create / open ───────────────────────────────────────────────────

    #[test]
    fn create_allocates_eagerly() {
        let fx = fixture(256);
        let before = fx.map.free_count();
        let inode = new_inode(&fx, 7 * 512 + 1);
        assert_eq!(inode.length(), 7 * 512 + 1);
        assert_eq!(inode.data_block_count().expect("count"), 8);
        // inode sector + 8 data sectors, no index block yet
        assert_eq!(before - fx.map.free_count(), 9);

        let mut buf = vec![0xFF_u8; 600];
        assert_eq!(inode.read_at(0, &mut buf).expect("read"), 600);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn create_out_of_space_releases_everything() {
        let fx = fixture(64);
        let sector = fx.map.allocate(1).expect("inode sector");
        let before = fx.map.free_count();
        let err = fx.table.create(sector, 100 * 512, false).unwrap_err();
        assert!(matches!(err, SfsError::NoSpace));
        assert_eq!(fx.map.free_count(), before);
    }

    #[test]
    fn open_rejects_non_inode_sector() {
        let fx = fixture(32);
        let err = fx.table.open(SectorId(5)).unwrap_err();
        assert!(matches!(err, SfsError::Corruption { sector: 5, .. }));
        assert_eq!(fx.table.open_inodes(), 0);
    }

    #[test]
    fn opens_share_one_inode() {
        let fx = fixture(64);
        let a = new_inode(&fx, 0);
        let b = fx.table.open(a.sector()).expect("second open");
        assert_eq!(a.open_count(), 2);
        assert_eq!(fx.table.open_inodes(), 1);

        b.write_at(0, b"shared").expect("write via b");
        let mut buf = [0_u8; 6];
        a.read_at(0, &mut buf).expect("read via a");
        assert_eq!(&buf, b"shared");

        b.close().expect("close b");
        assert_eq!(a.open_count(), 1);
        a.close().expect("close a");
        assert_eq!(fx.table.open_inodes(), 0);
    }

    // ── Removal ─────────────────────────────────────────────────────────

    #[test]
    fn last_close_of_removed_inode_reclaims_all_blocks() {
        let fx = fixture(2048);
        let baseline = fx.map.free_count();
        let a = new_inode(&fx, 0);
        a.write_at(0, &pattern(200 * 512, 3)).expect("write");
        let census = a.census().expect("census");
        assert_eq!(census.data_blocks, 200);
        assert_eq!(census.index_blocks, 3);

        let b = a.reopen().expect("reopen");
        a.remove();
        a.close().expect("close a");
        assert!(b.is_removed());
        assert!(fx.map.free_count() < baseline, "still open");

        b.close().expect("close b");
        assert_eq!(fx.map.free_count(), baseline);
    }

    #[test]
    fn dropping_handle_closes_it() {
        let fx = fixture(64);
        let baseline = fx.map.free_count();
        let inode = new_inode(&fx, 1024);
        inode.remove();
        drop(inode);
        assert_eq!(fx.table.open_inodes(), 0);
        assert_eq!(fx.map.free_count(), baseline);
    }

    // ── Read / write ────────────────────────────────────────────────────

    #[test]
    fn read_stops_at_end_of_file() {
        let fx = fixture(64);
        let inode = new_inode(&fx, 0);
        inode.write_at(0, b"hello world").expect("write");
        let mut buf = [0_u8; 64];
        assert_eq!(inode.read_at(6, &mut buf).expect("read"), 5);
        assert_eq!(&buf[..5], b"world");
        assert_eq!(inode.read_at(11, &mut buf).expect("read at eof"), 0);
        assert_eq!(inode.read_at(5000, &mut buf).expect("read past eof"), 0);
    }

    #[test]
    fn write_past_end_zero_fills_gap() {
        let fx = fixture(64);
        let inode = new_inode(&fx, 0);
        inode.write_at(1500, b"tail").expect("write");
        assert_eq!(inode.length(), 1504);
        let mut buf = vec![0xAA_u8; 1504];
        assert_eq!(inode.read_at(0, &mut buf).expect("read"), 1504);
        assert!(buf[..1500].iter().all(|b| *b == 0));
        assert_eq!(&buf[1500..], b"tail");
    }

    #[test]
    fn denied_writes_report_zero_bytes() {
        let fx = fixture(64);
        let mut writer = new_inode(&fx, 0);
        let other = writer.reopen().expect("reopen");
        writer.deny_write();
        writer.deny_write();
        assert_eq!(writer.deny_write_count(), 1);
        assert_eq!(other.write_at(0, b"blocked").expect("write"), 0);
        assert_eq!(other.length(), 0);

        writer.allow_write();
        assert_eq!(other.write_at(0, b"ok").expect("write"), 2);

        writer.deny_write();
        writer.close().expect("close");
        assert_eq!(other.deny_write_count(), 0);
    }

    #[test]
    fn denied_inode_cannot_be_resized() {
        let fx = fixture(64);
        let mut image = new_inode(&fx, 1000);
        let other = image.reopen().expect("reopen");
        image.deny_write();
        let free = fx.map.free_count();

        assert!(matches!(other.resize(0), Err(SfsError::Busy)));
        assert!(matches!(other.resize(4000), Err(SfsError::Busy)));
        assert_eq!(image.length(), 1000);
        assert_eq!(fx.map.free_count(), free);

        image.allow_write();
        other.resize(0).expect("resize once allowed");
        assert_eq!(image.length(), 0);
    }

    #[test]
    fn failed_growth_keeps_file_intact() {
        let fx = fixture(40);
        let inode = new_inode(&fx, 0);
        inode.write_at(0, b"keep me").expect("write");
        let free = fx.map.free_count();

        let err = inode.write_at(0, &vec![1_u8; 64 * 512]).unwrap_err();
        assert!(matches!(err, SfsError::NoSpace));
        assert_eq!(fx.map.free_count(), free);
        assert_eq!(inode.length(), 7);
        let mut buf = [0_u8; 7];
        inode.read_at(0, &mut buf).expect("read");
        assert_eq!(&buf, b"keep me");
    }

    #[test]
    fn device_failure_mid_growth_rolls_back() {
        let (dev, map, table) = flaky_fixture(128, 4);
        let sector = map.allocate(1).expect("inode sector");
        table.create(sector, 0, false).expect("create");
        let inode = table.open(sector).expect("open");
        // 13 blocks: the singly-indirect block already exists.
        let data = pattern(13 * 512, 3);
        inode.write_at(0, &data).expect("write");
        table.cache().flush_all().expect("flush");
        let free = map.free_count();
        let census = inode.census().expect("census");
        assert_eq!(census.index_blocks, 1);

        // Eight more zeroed blocks cannot all stay dirty in four slots.
        dev.fail_writes.store(true, Ordering::SeqCst);
        let err = inode.write_at(13 * 512, &[7_u8; 8 * 512]).unwrap_err();
        assert!(matches!(err, SfsError::Io(_)), "got {err:?}");
        dev.fail_writes.store(false, Ordering::SeqCst);

        assert_eq!(inode.length(), 13 * 512);
        assert_eq!(map.free_count(), free);
        assert_eq!(inode.census().expect("census after"), census);
        let mut back = vec![0_u8; data.len()];
        inode.read_at(0, &mut back).expect("read");
        assert_eq!(back, data);

        assert_eq!(inode.write_at(13 * 512, &[7_u8; 512]).expect("retry"), 512);
        assert_eq!(inode.data_block_count().expect("count"), 14);
        assert_eq!(map.free_count(), free - 1);
    }

    #[test]
    fn failed_tail_clear_leaves_record_unchanged() {
        let (dev, map, table) = flaky_fixture(128, 4);
        let sector = map.allocate(1).expect("inode sector");
        table.create(sector, 0, false).expect("create");
        let inode = table.open(sector).expect("open");
        inode.write_at(0, b"keep me").expect("write");
        table.cache().reset().expect("reset");
        // Fill every slot with dirty scratch sectors so the next miss
        // needs a write-back.
        for scratch in 120..124 {
            table.cache().write(SectorId(scratch), 0, &[1]).expect("dirty scratch");
        }
        let free = map.free_count();

        dev.fail_writes.store(true, Ordering::SeqCst);
        let err = inode.write_at(0, &[9_u8; 600]).unwrap_err();
        assert!(matches!(err, SfsError::Io(_)), "got {err:?}");
        dev.fail_writes.store(false, Ordering::SeqCst);

        assert_eq!(inode.length(), 7);
        assert_eq!(map.free_count(), free);
        assert_eq!(inode.data_block_count().expect("count"), 1);
        let mut buf = [0_u8; 7];
        inode.read_at(0, &mut buf).expect("read");
        assert_eq!(&buf, b"keep me");
    }

    #[test]
    fn resize_past_capacity_is_too_large() {
        let fx = fixture(32);
        let inode = new_inode(&fx, 0);
        assert!(matches!(
            inode.resize(MAX_FILE_LEN + 1),
            Err(SfsError::FileTooLarge)
        ));
        assert!(matches!(
            inode.write_at(MAX_FILE_LEN, b"x"),
            Err(SfsError::FileTooLarge)
        ));
    }

    #[test]
    fn shrink_releases_trailing_tiers() {
        let fx = fixture(4096);
        let inode = new_inode(&fx, 0);
        let after_create = fx.map.free_count();
        inode.resize(400 * 512).expect("grow");
        assert_eq!(
            after_create - fx.map.free_count(),
            400 + index_blocks_for(400) as u32
        );

        inode.resize(100 * 512).expect("shrink into indirect tier");
        let census = inode.census().expect("census");
        assert_eq!(census.data_blocks, 100);
        assert_eq!(census.index_blocks, 1);

        inode.resize(0).expect("shrink to empty");
        assert_eq!(inode.census().expect("census"), BlockCensus::default());
        assert_eq!(fx.map.free_count(), after_create);
    }

    #[test]
    fn shrink_then_grow_reads_zeros() {
        let fx = fixture(128);
        let inode = new_inode(&fx, 0);
        inode.write_at(0, &[0x77; 1000]).expect("write");
        inode.resize(600).expect("shrink");
        inode.resize(1000).expect("grow");
        let mut buf = [0xFF_u8; 1000];
        inode.read_at(0, &mut buf).expect("read");
        assert!(buf[..600].iter().all(|b| *b == 0x77));
        assert!(buf[600..].iter().all(|b| *b == 0));
    }

    #[test]
    fn record_persists_through_cache() {
        let fx = fixture(128);
        let inode = new_inode(&fx, 0);
        inode.write_at(0, &pattern(5000, 9)).expect("write");
        let sector = inode.sector();
        inode.close().expect("close");
        fx.table.cache().flush_all().expect("flush");

        let raw = fx.dev.raw_sector(sector);
        let record = InodeRecord::parse(&raw).expect("parse");
        assert_eq!(record.length, 5000);
        assert_eq!(record.direct.iter().flatten().count(), 10);
    }

    #[test]
    fn largest_file_maps_every_tier() {
        let fx = fixture(MAX_FILE_SECTORS as u32 + 200);
        let inode = new_inode(&fx, 0);
        inode.resize(MAX_FILE_LEN).expect("grow to max");
        let census = inode.census().expect("census");
        assert_eq!(census.data_blocks, MAX_FILE_SECTORS);
        assert_eq!(census.index_blocks, 2 + 128);

        inode.write_at(MAX_FILE_LEN - 4, b"last").expect("write last");
        let mut buf = [0_u8; 4];
        inode.read_at(MAX_FILE_LEN - 4, &mut buf).expect("read last");
        assert_eq!(&buf, b"last");
    }

    // ── Properties ──────────────────────────────────────────────────────

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn write_then_read_round_trips(
            writes in proptest::collection::vec((0_u64..90_000, 1_usize..3_000, any::<u8>()), 1..8),
        ) {
            let fx = fixture(1024);
            let inode = new_inode(&fx, 0);
            let mut model: Vec<u8> = Vec::new();
            for (offset, len, seed) in writes {
                let data = pattern(len, seed);
                prop_assert_eq!(inode.write_at(offset, &data).expect("write"), len);
                let end = offset as usize + len;
                if model.len() < end {
                    model.resize(end, 0);
                }
                model[offset as usize..end].copy_from_slice(&data);

                let mut back = vec![0_u8; len];
                prop_assert_eq!(inode.read_at(offset, &mut back).expect("read"), len);
                prop_assert_eq!(&back, &data);
            }
            let mut whole = vec![0_u8; model.len()];
            prop_assert_eq!(inode.read_at(0, &mut whole).expect("read all"), model.len());
            prop_assert_eq!(whole, model);
        }

        #[test]
        fn block_count_tracks_length(lengths in proptest::collection::vec(0_u64..200_000, 1..10)) {
            let fx = fixture(2048);
            let baseline = fx.map.free_count();
            let inode = new_inode(&fx, 0);
            for length in lengths {
                inode.resize(length).expect("resize");
                let blocks = length.div_ceil(SECTOR_SIZE as u64) as usize;
                let census = inode.census().expect("census");
                prop_assert_eq!(census.data_blocks, blocks);
                prop_assert_eq!(census.index_blocks, index_blocks_for(blocks));
                let used = (baseline - fx.map.free_count()) as usize;
                prop_assert_eq!(used, 1 + blocks + index_blocks_for(blocks));
            }
        }

        #[test]
        fn resize_is_idempotent(first in 0_u64..120_000, second in 0_u64..120_000) {
            let fx = fixture(1024);
            let inode = new_inode(&fx, 0);
            inode.resize(first).expect("first");
            inode.resize(second).expect("second");
            fx.table.cache().flush_all().expect("flush");
            let free = fx.map.free_count();
            let record = fx.dev.raw_sector(inode.sector());

            inode.resize(second).expect("again");
            fx.table.cache().flush_all().expect("flush again");
            prop_assert_eq!(fx.map.free_count(), free);
            prop_assert_eq!(fx.dev.raw_sector(inode.sector()), record);
        }
    }
}
