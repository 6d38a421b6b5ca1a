//! Per-caller view of the namespace: working directory and open
//! directories.

use crate::File;
use sfs_dir::{Directory, Resolved, resolve};
use sfs_error::{Result, SfsError};
use sfs_inode::InodeTable;
use sfs_types::SectorId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Entry slots a new subdirectory starts with ("." and ".." only).
const SUBDIR_ENTRIES: usize = 2;

/// Something [`Session::open`] returned.
#[derive(Debug)]
pub enum Node {
    File(File),
    Dir(Directory),
}

impl Node {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Dir(_))
    }

    /// Inode number (the sector of the inode record).
    #[must_use]
    pub fn inumber(&self) -> SectorId {
        match self {
            Self::File(file) => file.inumber(),
            Self::Dir(dir) => dir.sector(),
        }
    }

    pub fn into_file(self) -> Result<File> {
        match self {
            Self::File(file) => Ok(file),
            Self::Dir(_) => Err(SfsError::IsDirectory),
        }
    }
}

/// One caller's handle on a mounted filesystem.
///
/// Relative paths resolve against the working directory. Directories this
/// session holds open (and its working directory) cannot be removed.
#[derive(Debug)]
pub struct Session {
    inodes: Arc<InodeTable>,
    cwd: Directory,
    open_dirs: HashMap<SectorId, usize>,
}

impl Session {
    pub(crate) fn new(inodes: Arc<InodeTable>) -> Result<Self> {
        let cwd = Directory::open_root(&inodes)?;
        Ok(Self {
            inodes,
            cwd,
            open_dirs: HashMap::new(),
        })
    }

    /// Inode number of the working directory.
    #[must_use]
    pub fn cwd(&self) -> SectorId {
        self.cwd.sector()
    }

    fn resolve(&self, path: &str) -> Result<Resolved> {
        resolve(&self.inodes, &self.cwd, path)
    }

    fn resolve_new(&self, path: &str) -> Result<Resolved> {
        let resolved = self.resolve(path)?;
        if resolved.target.is_some() {
            return Err(SfsError::Exists);
        }
        Ok(resolved)
    }

    /// Undo a half-finished create: drop the inode and everything it owns.
    fn discard(&self, sector: SectorId) {
        match self.inodes.open(sector) {
            Ok(inode) => {
                inode.remove();
                if let Err(err) = inode.close() {
                    warn!(sector = %sector, error = %err, "failed to discard new inode");
                }
            }
            Err(err) => warn!(sector = %sector, error = %err, "failed to reopen new inode"),
        }
    }

    fn release_unused(&self, sector: SectorId) {
        if let Err(err) = self.inodes.allocator().release(sector, 1) {
            warn!(sector = %sector, error = %err, "failed to release unused inode sector");
        }
    }

    /// Create a regular file of `initial_size` zero bytes.
    pub fn create(&mut self, path: &str, initial_size: u64) -> Result<()> {
        let resolved = self.resolve_new(path)?;
        let sector = self.inodes.allocator().allocate(1)?;
        if let Err(err) = self.inodes.create(sector, initial_size, false) {
            self.release_unused(sector);
            return Err(err);
        }
        if let Err(err) = resolved.parent.add(&resolved.name, sector) {
            self.discard(sector);
            return Err(err);
        }
        debug!(path, sector = %sector, initial_size, "created file");
        resolved.parent.close()
    }

    /// Create an empty directory.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let resolved = self.resolve_new(path)?;
        let sector = self.inodes.allocator().allocate(1)?;
        if let Err(err) =
            Directory::create(&self.inodes, sector, resolved.parent.sector(), SUBDIR_ENTRIES)
        {
            self.release_unused(sector);
            return Err(err);
        }
        if let Err(err) = resolved.parent.add(&resolved.name, sector) {
            self.discard(sector);
            return Err(err);
        }
        debug!(path, sector = %sector, "created directory");
        resolved.parent.close()
    }

    /// Open a file or directory.
    pub fn open(&mut self, path: &str) -> Result<Node> {
        let resolved = self.resolve(path)?;
        let Some(inode) = resolved.open_target()? else {
            return Err(SfsError::NotFound(path.to_owned()));
        };
        resolved.parent.close()?;
        let sector = inode.sector();
        if inode.is_dir() {
            let dir = Directory::open(inode)?;
            *self.open_dirs.entry(sector).or_insert(0) += 1;
            Ok(Node::Dir(dir))
        } else {
            Ok(Node::File(File::new(inode)))
        }
    }

    pub fn close(&mut self, node: Node) -> Result<()> {
        match node {
            Node::File(file) => file.close(),
            Node::Dir(dir) => {
                let sector = dir.sector();
                if let Some(count) = self.open_dirs.get_mut(&sector) {
                    *count -= 1;
                    if *count == 0 {
                        self.open_dirs.remove(&sector);
                    }
                }
                dir.close()
            }
        }
    }

    /// Unlink a file or empty directory.
    ///
    /// Fails with `Busy` for this session's working directory or a
    /// directory it has open.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        if resolved.name == "." || resolved.name == ".." {
            return Err(SfsError::InvalidArgument(format!(
                "cannot remove {path:?}"
            )));
        }
        let Some(sector) = resolved.target else {
            return Err(SfsError::NotFound(path.to_owned()));
        };
        if sector == self.cwd.sector() || self.open_dirs.contains_key(&sector) {
            return Err(SfsError::Busy);
        }
        resolved.parent.remove(&resolved.name)?;
        debug!(path, sector = %sector, "removed");
        resolved.parent.close()
    }

    /// Change the working directory.
    pub fn chdir(&mut self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        let Some(inode) = resolved.open_target()? else {
            return Err(SfsError::NotFound(path.to_owned()));
        };
        let next = Directory::open(inode)?;
        resolved.parent.close()?;
        let prev = std::mem::replace(&mut self.cwd, next);
        prev.close()
    }

    /// Next entry name of an open directory, skipping "." and "..".
    pub fn readdir(&self, node: &mut Node) -> Result<Option<String>> {
        match node {
            Node::Dir(dir) => dir.readdir(),
            Node::File(_) => Err(SfsError::NotDirectory),
        }
    }

    /// Names in the directory at `path`, "." and ".." excluded.
    pub fn list(&mut self, path: &str) -> Result<Vec<String>> {
        let mut node = self.open(path)?;
        let mut names = Vec::new();
        let listed = loop {
            match self.readdir(&mut node) {
                Ok(Some(name)) => names.push(name),
                Ok(None) => break Ok(names),
                Err(err) => break Err(err),
            }
        };
        self.close(node)?;
        listed
    }
}
