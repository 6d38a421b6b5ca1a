#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use sfs_block::{BufferCache, MemBlockDevice};
use sfs_types::SectorId;
use std::sync::Arc;

fn make_cache(sectors: u32, capacity: usize) -> BufferCache {
    BufferCache::new(Arc::new(MemBlockDevice::new(sectors)), capacity).expect("cache")
}

fn bench_hot_reads(c: &mut Criterion) {
    let cache = make_cache(1024, 64);
    for sector in 0..64 {
        cache.fetch(SectorId(sector)).expect("warm");
    }
    let mut buf = [0_u8; 64];
    c.bench_function("cache_hot_read_64B", |b| {
        let mut sector = 0_u32;
        b.iter(|| {
            cache
                .read(SectorId(sector % 64), 0, &mut buf)
                .expect("read");
            sector = sector.wrapping_add(1);
            black_box(&buf);
        });
    });
}

fn bench_sequential_scan(c: &mut Criterion) {
    let cache = make_cache(4096, 64);
    let mut buf = [0_u8; 512];
    c.bench_function("cache_scan_4096_sectors", |b| {
        b.iter(|| {
            for sector in 0..4096 {
                cache.read(SectorId(sector), 0, &mut buf).expect("read");
            }
            black_box(&buf);
        });
    });
}

fn bench_dirty_eviction(c: &mut Criterion) {
    let cache = make_cache(4096, 64);
    let payload = [0x5A_u8; 512];
    c.bench_function("cache_write_evict_4096_sectors", |b| {
        b.iter(|| {
            for sector in 0..4096 {
                cache.write(SectorId(sector), 0, &payload).expect("write");
            }
        });
    });
}

criterion_group!(
    benches,
    bench_hot_reads,
    bench_sequential_scan,
    bench_dirty_eviction
);
criterion_main!(benches);
