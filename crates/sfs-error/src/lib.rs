#![forbid(unsafe_code)]
//! Error types for SectorFS.
//!
//! # Error Taxonomy
//!
//! SectorFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `sfs-types` | Byte-level decoding failures of on-disk records |
//! | Runtime | `SfsError` | `sfs-error` (this crate) | Everything returned by cache, inode, directory and session APIs |
//!
//! `sfs-error` does not depend on `sfs-types`; crates that see both convert
//! a `ParseError` into `SfsError::Parse` (or `Corruption` when the sector is
//! known) at their own boundary.
//!
//! ## Failure classes
//!
//! | Condition | Variant |
//! |-----------|---------|
//! | Allocator exhausted during create/resize/write/add | `NoSpace` |
//! | Growth past the doubly-indirect tier | `FileTooLarge` |
//! | Name already present in a directory | `Exists` |
//! | Name or path component missing | `NotFound` |
//! | Path traverses a regular file | `NotDirectory` |
//! | Directory still holds entries other than `.`/`..` | `NotEmpty` |
//! | Directory is a working directory or open by the caller | `Busy` |
//! | Bad inode or superblock magic | `Corruption` / `Format` |
//!
//! Writes to a deny-write inode are not an error: they report zero bytes
//! written.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`SfsError::to_errno`].
//! The match is exhaustive so a new variant cannot be added without
//! assigning one.

use thiserror::Error;

/// Unified error type for all SectorFS operations.
#[derive(Debug, Error)]
pub enum SfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known sector.
    #[error("corrupt metadata at sector {sector}: {detail}")]
    Corruption { sector: u32, detail: String },

    /// Invalid on-disk format (wrong magic, geometry mismatch).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the caller.
    #[error("parse error: {0}")]
    Parse(String),

    /// A caller-supplied argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No free sectors available.
    #[error("no space left on device")]
    NoSpace,

    /// Requested length exceeds what the pointer tiers can map.
    #[error("file too large")]
    FileTooLarge,

    /// File, directory, or path component not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// Removal of a directory that still has entries.
    #[error("directory not empty")]
    NotEmpty,

    /// Name exceeds the directory entry name limit.
    #[error("name too long")]
    NameTooLong,

    /// Target already exists.
    #[error("file exists")]
    Exists,

    /// Directory is in use as a working directory or open handle.
    #[error("resource busy")]
    Busy,
}

impl SfsError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::FileTooLarge => libc::EFBIG,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
            Self::Busy => libc::EBUSY,
        }
    }
}

/// Result alias using `SfsError`.
pub type Result<T> = std::result::Result<T, SfsError>;
