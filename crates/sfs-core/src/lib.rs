#![forbid(unsafe_code)]
//! Mounted SectorFS instances.
//!
//! [`FileSystem`] owns the context every operation runs in: the buffer
//! cache, the free map and the open-inode table. It is created by
//! [`FileSystem::format`] or [`FileSystem::mount`] and torn down by
//! [`FileSystem::unmount`], which flushes dirty sectors and persists the
//! free map. Namespace operations go through a [`Session`], one per caller.
//!
//! # Usage
//!
//! ```no_run
//! use sfs_core::{FileSystem, FormatOptions, MountOptions};
//!
//! let fs = FileSystem::create_image("disk.img", &FormatOptions::default(), &MountOptions::default())?;
//! let mut session = fs.session()?;
//! session.mkdir("/docs")?;
//! session.create("/docs/readme", 0)?;
//! let mut file = session.open("/docs/readme")?.into_file()?;
//! file.write(b"hello")?;
//! file.close()?;
//! drop(session);
//! fs.unmount()?;
//! # Ok::<(), sfs_core::SfsError>(())
//! ```

mod file;
mod session;
mod superblock;

pub use file::File;
pub use session::{Node, Session};
pub use superblock::{MIN_DATA_SECTORS, SUPERBLOCK_VERSION, Superblock};

pub use sfs_alloc::{FreeMap, FreeMapLayout, SectorAllocator};
pub use sfs_block::{
    BlockDevice, BufferCache, ByteBlockDevice, CacheStats, DEFAULT_CACHE_SLOTS, FileByteDevice,
    MemBlockDevice,
};
pub use sfs_dir::{DEFAULT_ROOT_ENTRIES, DirEntry, Directory};
pub use sfs_error::{Result, SfsError};
pub use sfs_inode::{BlockCensus, InodeHandle, InodeTable};
pub use sfs_types::{MAX_FILE_LEN, NAME_MAX, ROOT_DIR_SECTOR, SECTOR_SIZE, SectorId};

use serde::{Deserialize, Serialize};
use sfs_types::SUPERBLOCK_SECTOR;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Options for mounting (or formatting, which mounts afterwards).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    /// Buffer cache slots. Must be > 0.
    pub cache_slots: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            cache_slots: DEFAULT_CACHE_SLOTS,
        }
    }
}

/// Options for laying out a new filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    /// Image size, in sectors, when [`FileSystem::create_image`] creates
    /// the backing file. Formatting an existing device uses its size.
    pub sector_count: u32,
    /// Entry slots the root directory starts with.
    pub root_entries: usize,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            // 4 MiB
            sector_count: 8192,
            root_entries: DEFAULT_ROOT_ENTRIES,
        }
    }
}

/// Snapshot of filesystem state for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsInfo {
    pub superblock: Superblock,
    pub free_sectors: u32,
    pub open_inodes: usize,
    pub cache: CacheStats,
}

/// A mounted filesystem.
#[derive(Debug)]
pub struct FileSystem {
    superblock: Superblock,
    cache: Arc<BufferCache>,
    free_map: Arc<FreeMap>,
    inodes: Arc<InodeTable>,
}

impl FileSystem {
    /// Write a fresh, empty filesystem onto `device` and mount it.
    pub fn format(
        device: Arc<dyn BlockDevice>,
        format: &FormatOptions,
        mount: &MountOptions,
    ) -> Result<Self> {
        let sector_count = device.sector_count();
        let superblock = Superblock::for_device(sector_count);
        if superblock.reserved_sectors().saturating_add(MIN_DATA_SECTORS) > sector_count {
            return Err(SfsError::InvalidArgument(format!(
                "device of {sector_count} sectors is too small to format"
            )));
        }

        let cache = Arc::new(BufferCache::new(device, mount.cache_slots)?);
        let free_map = Arc::new(FreeMap::new(sector_count));
        free_map.reserve(SUPERBLOCK_SECTOR, superblock.reserved_sectors())?;
        let inodes = InodeTable::new(Arc::clone(&cache), free_map.clone());

        Directory::create(
            &inodes,
            superblock.root_dir,
            superblock.root_dir,
            format.root_entries,
        )?;
        cache.write(SUPERBLOCK_SECTOR, 0, &superblock.encode())?;

        let fs = Self {
            superblock,
            cache,
            free_map,
            inodes,
        };
        fs.sync()?;
        info!(
            sector_count,
            free_map_sectors = superblock.free_map_sectors,
            root_entries = format.root_entries,
            "formatted filesystem"
        );
        Ok(fs)
    }

    /// Mount an existing filesystem.
    pub fn mount(device: Arc<dyn BlockDevice>, options: &MountOptions) -> Result<Self> {
        let device_sectors = device.sector_count();
        let cache = Arc::new(BufferCache::new(device, options.cache_slots)?);

        let mut raw = [0_u8; SECTOR_SIZE];
        cache.read(SUPERBLOCK_SECTOR, 0, &mut raw)?;
        let superblock = Superblock::parse(&raw)
            .map_err(|err| SfsError::Format(format!("superblock: {err}")))?;
        superblock.validate(device_sectors)?;

        let free_map = Arc::new(FreeMap::load(
            &cache,
            superblock.free_map_layout(),
            superblock.sector_count,
        )?);
        let inodes = InodeTable::new(Arc::clone(&cache), free_map.clone());
        Directory::open_root(&inodes)?.close()?;

        info!(
            sector_count = superblock.sector_count,
            free_sectors = free_map.free_count(),
            cache_slots = options.cache_slots,
            "mounted filesystem"
        );
        Ok(Self {
            superblock,
            cache,
            free_map,
            inodes,
        })
    }

    /// Create an image file at `path` and format it.
    pub fn create_image(
        path: impl AsRef<Path>,
        format: &FormatOptions,
        mount: &MountOptions,
    ) -> Result<Self> {
        let len = u64::from(format.sector_count) * SECTOR_SIZE as u64;
        let device = ByteBlockDevice::new(FileByteDevice::create(path, len)?)?;
        Self::format(Arc::new(device), format, mount)
    }

    /// Mount the image file at `path`.
    pub fn open_image(path: impl AsRef<Path>, options: &MountOptions) -> Result<Self> {
        let device = ByteBlockDevice::new(FileByteDevice::open(path)?)?;
        Self::mount(Arc::new(device), options)
    }

    /// A new caller context rooted at "/".
    pub fn session(&self) -> Result<Session> {
        Session::new(Arc::clone(&self.inodes))
    }

    /// Persist the free map and every dirty cache slot.
    pub fn sync(&self) -> Result<()> {
        self.free_map
            .store(&self.cache, self.superblock.free_map_layout())?;
        let flushed = self.cache.flush_all()?;
        debug!(flushed, "filesystem synced");
        Ok(())
    }

    /// Flush everything and release the mount.
    pub fn unmount(self) -> Result<()> {
        let open = self.inodes.open_inodes();
        self.sync()?;
        info!(
            open_inodes = open,
            free_sectors = self.free_map.free_count(),
            "unmounted filesystem"
        );
        Ok(())
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    #[must_use]
    pub fn inodes(&self) -> &Arc<InodeTable> {
        &self.inodes
    }

    #[must_use]
    pub fn free_sectors(&self) -> u32 {
        self.free_map.free_count()
    }

    #[must_use]
    pub fn info(&self) -> FsInfo {
        FsInfo {
            superblock: self.superblock,
            free_sectors: self.free_map.free_count(),
            open_inodes: self.inodes.open_inodes(),
            cache: self.cache.stats(),
        }
    }
}
