#![forbid(unsafe_code)]
//! Directory operations.
//!
//! A directory is an inode flagged `is_dir` whose content is a packed array
//! of fixed-size entries. Every directory holds "." and ".." entries from
//! creation on. Free slots left by removal are reused before the directory
//! grows.
//!
//! Entry layout (20 bytes, little-endian):
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | inode sector |
//! | 4 | 15 | name, NUL-padded (at most 14 bytes) |
//! | 19 | 1 | in-use flag |

mod path;

pub use path::{Resolved, components, resolve};

use serde::{Deserialize, Serialize};
use sfs_error::{Result, SfsError};
use sfs_inode::{InodeHandle, InodeTable};
use sfs_types::{NAME_MAX, ROOT_DIR_SECTOR, SectorId, trim_nul_padded};
use std::sync::Arc;
use tracing::{debug, warn};

/// On-disk size of one directory entry.
pub const ENTRY_SIZE: usize = 20;

const NAME_FIELD: usize = NAME_MAX + 1;
const IN_USE_OFFSET: usize = 4 + NAME_FIELD;

/// Entries a freshly formatted root directory has room for.
pub const DEFAULT_ROOT_ENTRIES: usize = 16;

/// One decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub sector: SectorId,
    pub name: String,
    pub in_use: bool,
}

impl DirEntry {
    #[must_use]
    pub fn parse(bytes: &[u8; ENTRY_SIZE]) -> Self {
        Self {
            sector: SectorId(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            name: trim_nul_padded(&bytes[4..4 + NAME_FIELD]),
            in_use: bytes[IN_USE_OFFSET] != 0,
        }
    }

    /// Serialize; the name must already have passed [`validate_name`].
    #[must_use]
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0_u8; ENTRY_SIZE];
        out[..4].copy_from_slice(&self.sector.0.to_le_bytes());
        let name = self.name.as_bytes();
        let len = name.len().min(NAME_MAX);
        out[4..4 + len].copy_from_slice(&name[..len]);
        out[IN_USE_OFFSET] = u8::from(self.in_use);
        out
    }

    fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Reject names that cannot be stored in an entry.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SfsError::InvalidArgument(
            "directory entry name cannot be empty".to_owned(),
        ));
    }
    if name.len() > NAME_MAX {
        return Err(SfsError::NameTooLong);
    }
    if name.bytes().any(|b| b == b'/' || b == 0) {
        return Err(SfsError::InvalidArgument(format!(
            "directory entry name contains '/' or NUL: {name:?}"
        )));
    }
    Ok(())
}

/// An open directory plus a `readdir` cursor.
#[derive(Debug)]
pub struct Directory {
    inode: InodeHandle,
    pos: u64,
}

impl Directory {
    /// Create a directory inode at `sector` with room for `entries`
    /// entries, "." pointing at itself and ".." at `parent`.
    ///
    /// `sector` must already be reserved by the caller and stays reserved
    /// on failure; the entry blocks are released again.
    pub fn create(
        table: &Arc<InodeTable>,
        sector: SectorId,
        parent: SectorId,
        entries: usize,
    ) -> Result<()> {
        let length = (entries.max(2) * ENTRY_SIZE) as u64;
        table.create(sector, length, true)?;
        let dir = Self::open(table.open(sector)?)?;
        if let Err(err) = dir.add(".", sector).and_then(|()| dir.add("..", parent)) {
            if let Err(shrink) = dir.inode.resize(0) {
                warn!(sector = %sector, error = %shrink, "could not release entry blocks");
            }
            return Err(err);
        }
        dir.close()
    }

    /// Wrap an inode handle, which must be a directory.
    pub fn open(inode: InodeHandle) -> Result<Self> {
        if !inode.is_dir() {
            return Err(SfsError::NotDirectory);
        }
        Ok(Self { inode, pos: 0 })
    }

    pub fn open_root(table: &Arc<InodeTable>) -> Result<Self> {
        Self::open(table.open(ROOT_DIR_SECTOR)?)
    }

    /// Another handle to the same directory, with its own cursor.
    pub fn reopen(&self) -> Result<Self> {
        Self::open(self.inode.reopen()?)
    }

    pub fn close(self) -> Result<()> {
        self.inode.close()
    }

    #[must_use]
    pub fn inode(&self) -> &InodeHandle {
        &self.inode
    }

    #[must_use]
    pub fn sector(&self) -> SectorId {
        self.inode.sector()
    }

    fn slot_count(&self) -> u64 {
        self.inode.length() / ENTRY_SIZE as u64
    }

    fn entry_at(&self, slot: u64) -> Result<Option<DirEntry>> {
        let mut raw = [0_u8; ENTRY_SIZE];
        let read = self.inode.read_at(slot * ENTRY_SIZE as u64, &mut raw)?;
        Ok((read == ENTRY_SIZE).then(|| DirEntry::parse(&raw)))
    }

    fn write_entry(&self, slot: u64, entry: &DirEntry) -> Result<()> {
        let written = self
            .inode
            .write_at(slot * ENTRY_SIZE as u64, &entry.encode())?;
        if written != ENTRY_SIZE {
            // Only a deny-write holder can cause a short write here.
            return Err(SfsError::Busy);
        }
        Ok(())
    }

    /// Slot and entry of the in-use entry called `name`.
    fn find(&self, name: &str) -> Result<Option<(u64, DirEntry)>> {
        for slot in 0..self.slot_count() {
            if let Some(entry) = self.entry_at(slot)? {
                if entry.in_use && entry.name == name {
                    return Ok(Some((slot, entry)));
                }
            }
        }
        Ok(None)
    }

    /// Inode sector `name` maps to, if present.
    pub fn lookup(&self, name: &str) -> Result<Option<SectorId>> {
        Ok(self.find(name)?.map(|(_, entry)| entry.sector))
    }

    /// Open the inode `name` maps to, if present.
    ///
    /// The lookup and the open happen under this directory's namespace
    /// lock, which [`Directory::remove`] holds until it has closed the
    /// target, so the returned handle never refers to a reclaimed inode.
    pub fn open_entry(&self, name: &str) -> Result<Option<InodeHandle>> {
        let guard = self.inode.lock_namespace();
        let handle = match self.find(name)? {
            Some((_, entry)) => Some(self.inode.table().open(entry.sector)?),
            None => None,
        };
        drop(guard);
        Ok(handle)
    }

    /// Link `name` to `sector`, reusing a free slot or extending the
    /// directory.
    pub fn add(&self, name: &str, sector: SectorId) -> Result<()> {
        validate_name(name)?;
        let _guard = self.inode.lock_namespace();
        if self.inode.is_removed() {
            return Err(SfsError::NotFound(format!(
                "directory {} has been removed",
                self.sector()
            )));
        }

        let mut free_slot = None;
        let slots = self.slot_count();
        for slot in 0..slots {
            let Some(entry) = self.entry_at(slot)? else {
                break;
            };
            if entry.in_use && entry.name == name {
                return Err(SfsError::Exists);
            }
            if !entry.in_use && free_slot.is_none() {
                free_slot = Some(slot);
            }
        }

        let slot = free_slot.unwrap_or(slots);
        self.write_entry(slot, &DirEntry {
            sector,
            name: name.to_owned(),
            in_use: true,
        })?;
        debug!(dir = %self.sector(), name, target = %sector, slot, "added directory entry");
        Ok(())
    }

    /// Unlink `name` and mark its inode removed.
    ///
    /// A directory target must hold nothing but "." and "..". The target's
    /// blocks are reclaimed once its last opener closes it.
    pub fn remove(&self, name: &str) -> Result<()> {
        if name == "." || name == ".." {
            return Err(SfsError::InvalidArgument(format!(
                "cannot remove {name:?}"
            )));
        }
        let _guard = self.inode.lock_namespace();
        let Some((slot, mut entry)) = self.find(name)? else {
            return Err(SfsError::NotFound(name.to_owned()));
        };

        let target = self.inode.table().open(entry.sector)?;
        if target.is_dir() {
            let child = Self::open(target)?;
            let child_guard = child.inode.lock_namespace();
            if !child.is_empty()? {
                return Err(SfsError::NotEmpty);
            }
            entry.in_use = false;
            self.write_entry(slot, &entry)?;
            child.inode.remove();
            drop(child_guard);
            child.close()?;
        } else {
            entry.in_use = false;
            self.write_entry(slot, &entry)?;
            target.remove();
            target.close()?;
        }
        debug!(dir = %self.sector(), name, target = %entry.sector, "removed directory entry");
        Ok(())
    }

    /// True when no in-use entry besides "." and ".." remains.
    pub fn is_empty(&self) -> Result<bool> {
        for slot in 0..self.slot_count() {
            if let Some(entry) = self.entry_at(slot)? {
                if entry.in_use && !entry.is_dot() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Every in-use entry, "." and ".." included, in slot order.
    pub fn entries(&self) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        for slot in 0..self.slot_count() {
            if let Some(entry) = self.entry_at(slot)? {
                if entry.in_use {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    /// Next name after the cursor, skipping "." and "..".
    pub fn readdir(&mut self) -> Result<Option<String>> {
        while let Some(entry) = self.entry_at(self.pos / ENTRY_SIZE as u64)? {
            self.pos += ENTRY_SIZE as u64;
            if entry.in_use && !entry.is_dot() {
                return Ok(Some(entry.name));
            }
        }
        Ok(None)
    }

    /// Restart `readdir` from the first entry.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }
}
