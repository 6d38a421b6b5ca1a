//! Path splitting and resolution.

use crate::{Directory, validate_name};
use sfs_error::{Result, SfsError};
use sfs_inode::{InodeHandle, InodeTable};
use sfs_types::SectorId;
use std::sync::Arc;
use tracing::trace;

/// Split `path` on '/', dropping empty and "." components.
///
/// Every remaining component is checked with [`validate_name`], except
/// "..", which is an ordinary entry lookup.
pub fn components(path: &str) -> Result<Vec<&str>> {
    let mut out = Vec::new();
    for part in path.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if part != ".." {
            validate_name(part)?;
        }
        out.push(part);
    }
    Ok(out)
}

/// Outcome of walking a path up to its last component.
#[derive(Debug)]
pub struct Resolved {
    /// Directory that holds (or would hold) the last component, still open.
    pub parent: Directory,
    /// Last component as written; "." when the path names its start point.
    pub name: String,
    /// Inode the last component maps to now, if any. Open it through
    /// [`Resolved::open_target`], not by sector.
    pub target: Option<SectorId>,
}

impl Resolved {
    /// Open whatever the last component names, re-checked under the
    /// parent's namespace lock.
    pub fn open_target(&self) -> Result<Option<InodeHandle>> {
        self.parent.open_entry(&self.name)
    }
}

/// Walk `path` from the root (absolute) or from `cwd` (relative).
///
/// Fails with `NotFound` for a missing intermediate component or a removed
/// directory along the way, and `NotDirectory` when an intermediate
/// component is a regular file.
pub fn resolve(table: &Arc<InodeTable>, cwd: &Directory, path: &str) -> Result<Resolved> {
    if path.is_empty() {
        return Err(SfsError::InvalidArgument("empty path".to_owned()));
    }
    let parts = components(path)?;
    let mut dir = if path.starts_with('/') {
        Directory::open_root(table)?
    } else {
        cwd.reopen()?
    };

    let Some((last, walk)) = parts.split_last() else {
        ensure_live(&dir, path)?;
        let sector = dir.sector();
        return Ok(Resolved {
            parent: dir,
            name: ".".to_owned(),
            target: Some(sector),
        });
    };

    for part in walk {
        ensure_live(&dir, path)?;
        let Some(inode) = dir.open_entry(part)? else {
            return Err(SfsError::NotFound(path.to_owned()));
        };
        let next = Directory::open(inode)?;
        trace!(component = part, sector = %next.sector(), "descended");
        dir.close()?;
        dir = next;
    }

    ensure_live(&dir, path)?;
    let target = dir.lookup(last)?;
    Ok(Resolved {
        parent: dir,
        name: (*last).to_owned(),
        target,
    })
}

fn ensure_live(dir: &Directory, path: &str) -> Result<()> {
    if dir.inode().is_removed() {
        return Err(SfsError::NotFound(path.to_owned()));
    }
    Ok(())
}
