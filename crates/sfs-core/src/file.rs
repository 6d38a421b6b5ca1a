//! Open regular files with a cursor.

use sfs_error::Result;
use sfs_inode::InodeHandle;
use sfs_types::SectorId;

/// A regular file opened through a [`crate::Session`].
#[derive(Debug)]
pub struct File {
    inode: InodeHandle,
    pos: u64,
}

impl File {
    pub(crate) fn new(inode: InodeHandle) -> Self {
        Self { inode, pos: 0 }
    }

    /// Read from the cursor, advancing it by the bytes read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let read = self.inode.read_at(self.pos, buf)?;
        self.pos += read as u64;
        Ok(read)
    }

    /// Write at the cursor, advancing it by the bytes written.
    ///
    /// Returns `Ok(0)` while any opener denies writes.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let written = self.inode.write_at(self.pos, data)?;
        self.pos += written as u64;
        Ok(written)
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inode.read_at(offset, buf)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.inode.write_at(offset, data)
    }

    /// Move the cursor. Positions past the end are allowed; the next write
    /// there zero-fills the gap.
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    #[must_use]
    pub fn tell(&self) -> u64 {
        self.pos
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.inode.length()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Truncate or extend to `len` bytes. Fails with `Busy` while any
    /// handle denies writes.
    pub fn set_len(&self, len: u64) -> Result<()> {
        self.inode.resize(len)
    }

    /// Protect the file from writers (for example while it backs a running
    /// program). Lifted by [`File::allow_write`] or on close.
    pub fn deny_write(&mut self) {
        self.inode.deny_write();
    }

    pub fn allow_write(&mut self) {
        self.inode.allow_write();
    }

    #[must_use]
    pub fn inumber(&self) -> SectorId {
        self.inode.sector()
    }

    #[must_use]
    pub fn inode(&self) -> &InodeHandle {
        &self.inode
    }

    /// Independent handle to the same file with its cursor at 0.
    pub fn reopen(&self) -> Result<Self> {
        Ok(Self::new(self.inode.reopen()?))
    }

    pub fn close(self) -> Result<()> {
        self.inode.close()
    }
}
