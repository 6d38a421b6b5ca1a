#![forbid(unsafe_code)]

use parking_lot::Mutex;
use sfs_block::{BlockDevice, BufferCache, MemBlockDevice};
use sfs_error::{Result, SfsError};
use sfs_types::{SECTOR_SIZE, SectorBuf, SectorId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Wraps a device, records every sector written and can be told to fail
/// writes.
#[derive(Debug)]
struct RecordingDevice {
    inner: MemBlockDevice,
    writes: Mutex<Vec<SectorId>>,
    fail_writes: AtomicBool,
}

impl RecordingDevice {
    fn new(sectors: u32) -> Self {
        Self {
            inner: MemBlockDevice::new(sectors),
            writes: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    fn written(&self) -> Vec<SectorId> {
        self.writes.lock().clone()
    }
}

impl BlockDevice for RecordingDevice {
    fn read_sector(&self, sector: SectorId, buf: &mut SectorBuf) -> Result<()> {
        self.inner.read_sector(sector, buf)
    }

    fn write_sector(&self, sector: SectorId, buf: &SectorBuf) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SfsError::Io(std::io::Error::other("injected write failure")));
        }
        self.writes.lock().push(sector);
        self.inner.write_sector(sector, buf)
    }

    fn sector_count(&self) -> u32 {
        self.inner.sector_count()
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

fn setup(capacity: usize) -> (Arc<RecordingDevice>, BufferCache) {
    let dev = Arc::new(RecordingDevice::new(64));
    let cache = BufferCache::new(dev.clone(), capacity).expect("cache");
    (dev, cache)
}

fn read_byte(cache: &BufferCache, sector: u32) -> u8 {
    let mut byte = [0_u8; 1];
    cache.read(SectorId(sector), 0, &mut byte).expect("read");
    byte[0]
}

// ── Clock eviction ──────────────────────────────────────────────────────

#[test]
fn oldest_slot_is_evicted_first() {
    let (_dev, cache) = setup(4);
    for sector in 10..14 {
        cache.fetch(SectorId(sector)).expect("fill");
    }
    cache.fetch(SectorId(14)).expect("overflow");

    let resident = cache.resident_sectors();
    assert!(!resident.contains(&SectorId(10)), "resident: {resident:?}");
    for sector in 11..15 {
        assert!(cache.contains(SectorId(sector)), "missing {sector}");
    }
}

#[test]
fn recently_touched_slot_gets_second_chance() {
    let (_dev, cache) = setup(4);
    for sector in 10..14 {
        cache.fetch(SectorId(sector)).expect("fill");
    }
    // The sweep for 14 clears every reference bit and evicts 10.
    cache.fetch(SectorId(14)).expect("evict 10");
    // Touch 12 so it survives the next two evictions.
    read_byte(&cache, 12);
    cache.fetch(SectorId(15)).expect("evict 11");
    cache.fetch(SectorId(16)).expect("evict 13");

    assert!(cache.contains(SectorId(12)));
    assert!(!cache.contains(SectorId(11)));
    assert!(!cache.contains(SectorId(13)));
    assert_eq!(cache.resident_sectors().len(), 4);
}

#[test]
fn fetch_hit_alone_grants_second_chance() {
    let (_dev, cache) = setup(4);
    for sector in 10..14 {
        cache.fetch(SectorId(sector)).expect("fill");
    }
    cache.fetch(SectorId(14)).expect("evict 10");
    // A bare fetch hit must count as a use, same as a read.
    let index = cache.fetch(SectorId(12)).expect("hit 12");
    assert_eq!(cache.stats().hits, 1);
    cache.fetch(SectorId(15)).expect("evict 11");
    cache.fetch(SectorId(16)).expect("evict 13");

    assert!(cache.contains(SectorId(12)));
    assert_eq!(cache.fetch(SectorId(12)).expect("still resident"), index);
    assert!(!cache.contains(SectorId(11)));
    assert!(!cache.contains(SectorId(13)));
}

#[test]
fn dirty_victim_is_written_before_reuse() {
    let (dev, cache) = setup(2);
    cache.write(SectorId(3), 0, &[0xAA; 16]).expect("write 3");
    cache.write(SectorId(4), 0, &[0xBB; 16]).expect("write 4");
    assert!(dev.written().is_empty());

    cache.fetch(SectorId(5)).expect("evict");
    assert_eq!(dev.written(), vec![SectorId(3)]);
    assert_eq!(cache.stats().writebacks, 1);

    // Reading 3 back goes to the device and sees the written-back bytes.
    assert_eq!(read_byte(&cache, 3), 0xAA);
}

#[test]
fn clean_victim_is_not_written() {
    let (dev, cache) = setup(2);
    read_byte(&cache, 1);
    read_byte(&cache, 2);
    read_byte(&cache, 3);
    assert!(dev.written().is_empty());
    assert_eq!(cache.stats().writebacks, 0);
}

#[test]
fn failed_writeback_keeps_dirty_sector_resident() {
    let (dev, cache) = setup(1);
    cache.write(SectorId(7), 0, &[0x5A; 8]).expect("write");
    dev.fail_writes.store(true, Ordering::SeqCst);

    let err = cache.fetch(SectorId(8)).unwrap_err();
    assert!(matches!(err, SfsError::Io(_)));
    assert_eq!(cache.resident_sectors(), vec![SectorId(7)]);

    dev.fail_writes.store(false, Ordering::SeqCst);
    assert_eq!(read_byte(&cache, 7), 0x5A);
    assert_eq!(cache.flush_all().expect("flush"), 1);
    assert_eq!(dev.inner.raw_sector(SectorId(7))[..8], [0x5A; 8]);
}

#[test]
fn failed_fill_leaves_no_tag() {
    let dev = Arc::new(MemBlockDevice::new(4));
    let cache = BufferCache::new(dev, 2).expect("cache");
    let mut buf = [0_u8; 4];
    assert!(cache.read(SectorId(9), 0, &mut buf).is_err());
    assert!(!cache.contains(SectorId(9)));
    assert!(cache.resident_sectors().is_empty());
}

// ── Flush ───────────────────────────────────────────────────────────────

#[test]
fn flush_all_persists_every_dirty_slot_once() {
    let (dev, cache) = setup(8);
    for sector in 0..5_u8 {
        cache
            .write(SectorId(u32::from(sector)), 100, &[sector + 1; 4])
            .expect("write");
    }
    assert_eq!(cache.flush_all().expect("flush"), 5);
    let mut written = dev.written();
    written.sort();
    assert_eq!(written, (0..5).map(SectorId).collect::<Vec<_>>());
    for sector in 0..5_u8 {
        let raw = dev.inner.raw_sector(SectorId(u32::from(sector)));
        assert_eq!(raw[100..104], [sector + 1; 4]);
    }
}

// ── Concurrency ─────────────────────────────────────────────────────────

#[test]
fn concurrent_writers_on_small_cache_never_lose_data() {
    let dev = Arc::new(MemBlockDevice::new(64));
    let cache = Arc::new(BufferCache::new(dev.clone(), 4).expect("cache"));

    let handles: Vec<_> = (0..8_u8)
        .map(|worker| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for round in 0..50_u32 {
                    let sector = SectorId(u32::from(worker) * 8 + round % 8);
                    let offset = usize::from(worker) * 16;
                    cache.write(sector, offset, &[worker; 16]).expect("write");
                    let mut back = [0_u8; 16];
                    cache.read(sector, offset, &mut back).expect("read");
                    assert_eq!(back, [worker; 16]);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    cache.flush_all().expect("flush");
    for worker in 0..8_u8 {
        for slot in 0..8_u32 {
            let raw = dev.raw_sector(SectorId(u32::from(worker) * 8 + slot));
            let offset = usize::from(worker) * 16;
            assert_eq!(raw[offset..offset + 16], [worker; 16]);
        }
    }
}

#[test]
fn concurrent_readers_of_one_sector_share_a_slot() {
    let dev = Arc::new(MemBlockDevice::new(8));
    dev.write_sector(SectorId(3), &[0x33; SECTOR_SIZE])
        .expect("seed");
    let cache = Arc::new(BufferCache::new(dev, 4).expect("cache"));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for _ in 0..100 {
                    let mut buf = [0_u8; SECTOR_SIZE];
                    cache.read(SectorId(3), 0, &mut buf).expect("read");
                    assert_eq!(buf, [0x33; SECTOR_SIZE]);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("reader panicked");
    }

    let resident = cache.resident_sectors();
    assert_eq!(resident, vec![SectorId(3)]);
}
