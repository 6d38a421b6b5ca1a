#![forbid(unsafe_code)]
//! Sector I/O layer with a fixed-capacity write-back buffer cache.
//!
//! Provides the `BlockDevice` trait (the raw sector device collaborator),
//! file-backed and in-memory devices, and [`BufferCache`], through which
//! every sector access in the filesystem passes.

mod cache;

pub use cache::{BufferCache, CacheStats, DEFAULT_CACHE_SLOTS};

use parking_lot::Mutex;
use sfs_error::{Result, SfsError};
use sfs_types::{SECTOR_SIZE, SectorBuf, SectorId};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing image, falling back to read-only access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) an image of exactly `len` zero bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }

    fn check_range(&self, offset: u64, len: usize, op: &str) -> Result<()> {
        let end = offset
            .checked_add(
                u64::try_from(len)
                    .map_err(|_| SfsError::Format(format!("{op} length overflows u64")))?,
            )
            .ok_or_else(|| SfsError::Format(format!("{op} range overflows u64")))?;
        if end > self.len {
            return Err(SfsError::Format(format!(
                "{op} out of bounds: offset={offset} len={len} file_len={}",
                self.len
            )));
        }
        Ok(())
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len(), "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SfsError::InvalidArgument(
                "image was opened read-only".to_owned(),
            ));
        }
        self.check_range(offset, buf.len(), "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Sector-addressed device: the raw block device collaborator.
pub trait BlockDevice: Send + Sync {
    /// Read one whole sector.
    fn read_sector(&self, sector: SectorId, buf: &mut SectorBuf) -> Result<()>;

    /// Write one whole sector.
    fn write_sector(&self, sector: SectorId, buf: &SectorBuf) -> Result<()>;

    /// Total number of sectors.
    fn sector_count(&self) -> u32;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_sector(sector: SectorId, sector_count: u32) -> Result<()> {
    if sector.0 >= sector_count {
        return Err(SfsError::InvalidArgument(format!(
            "sector out of range: sector={sector} sector_count={sector_count}"
        )));
    }
    Ok(())
}

/// Adapts a [`ByteDevice`] into 512-byte sectors.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    sector_count: u32,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D) -> Result<Self> {
        let len = inner.len_bytes();
        let sector_size = SECTOR_SIZE as u64;
        let remainder = len % sector_size;
        if remainder != 0 {
            return Err(SfsError::Format(format!(
                "image length is not sector-aligned: len_bytes={len} remainder={remainder}"
            )));
        }
        let sector_count = u32::try_from(len / sector_size).map_err(|_| {
            SfsError::Format(format!("image too large: len_bytes={len}"))
        })?;
        Ok(Self {
            inner,
            sector_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_sector(&self, sector: SectorId, buf: &mut SectorBuf) -> Result<()> {
        check_sector(sector, self.sector_count)?;
        self.inner.read_exact_at(sector.byte_offset(), buf)
    }

    fn write_sector(&self, sector: SectorId, buf: &SectorBuf) -> Result<()> {
        check_sector(sector, self.sector_count)?;
        self.inner.write_all_at(sector.byte_offset(), buf)
    }

    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// In-memory sector device with I/O counters.
///
/// Used by tests and benchmarks across the workspace.
#[derive(Debug)]
pub struct MemBlockDevice {
    sectors: Mutex<Vec<SectorBuf>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(sector_count: u32) -> Self {
        Self {
            sectors: Mutex::new(vec![[0_u8; SECTOR_SIZE]; sector_count as usize]),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Device reads performed so far.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Device writes performed so far.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Copy of a sector's persisted bytes, bypassing the counters.
    #[must_use]
    pub fn raw_sector(&self, sector: SectorId) -> SectorBuf {
        self.sectors.lock()[sector.0 as usize]
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_sector(&self, sector: SectorId, buf: &mut SectorBuf) -> Result<()> {
        let sectors = self.sectors.lock();
        check_sector(sector, u32::try_from(sectors.len()).unwrap_or(u32::MAX))?;
        buf.copy_from_slice(&sectors[sector.0 as usize]);
        drop(sectors);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_sector(&self, sector: SectorId, buf: &SectorBuf) -> Result<()> {
        let mut sectors = self.sectors.lock();
        check_sector(sector, u32::try_from(sectors.len()).unwrap_or(u32::MAX))?;
        sectors[sector.0 as usize].copy_from_slice(buf);
        drop(sectors);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sector_count(&self) -> u32 {
        u32::try_from(self.sectors.lock().len()).unwrap_or(u32::MAX)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_block_device_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.img");
        let file = FileByteDevice::create(&path, 512 * 8).expect("create");
        let dev = ByteBlockDevice::new(file).expect("device");
        assert_eq!(dev.sector_count(), 8);

        dev.write_sector(SectorId(2), &[7_u8; SECTOR_SIZE])
            .expect("write");
        let mut read = [0_u8; SECTOR_SIZE];
        dev.read_sector(SectorId(2), &mut read).expect("read");
        assert_eq!(read, [7_u8; SECTOR_SIZE]);

        let reopened = ByteBlockDevice::new(FileByteDevice::open(&path).expect("open"))
            .expect("device");
        let mut again = [0_u8; SECTOR_SIZE];
        reopened
            .read_sector(SectorId(2), &mut again)
            .expect("read after reopen");
        assert_eq!(again, [7_u8; SECTOR_SIZE]);
    }

    #[test]
    fn byte_block_device_rejects_unaligned_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = FileByteDevice::create(dir.path().join("odd.img"), 1000).expect("create");
        let err = ByteBlockDevice::new(file).unwrap_err();
        assert!(matches!(err, SfsError::Format(_)));
    }

    #[test]
    fn out_of_range_sector_is_rejected() {
        let dev = MemBlockDevice::new(4);
        let mut buf = [0_u8; SECTOR_SIZE];
        let err = dev.read_sector(SectorId(4), &mut buf).unwrap_err();
        assert!(matches!(err, SfsError::InvalidArgument(_)));
        assert_eq!(dev.reads(), 0);
    }

    #[test]
    fn mem_device_counts_io() {
        let dev = MemBlockDevice::new(4);
        dev.write_sector(SectorId(1), &[1_u8; SECTOR_SIZE])
            .expect("write");
        let mut buf = [0_u8; SECTOR_SIZE];
        dev.read_sector(SectorId(1), &mut buf).expect("read");
        assert_eq!((dev.reads(), dev.writes()), (1, 1));
        assert_eq!(dev.raw_sector(SectorId(1)), [1_u8; SECTOR_SIZE]);
    }
}
