#![forbid(unsafe_code)]
//! SectorFS public API facade.
//!
//! Re-exports `sfs-core` through a stable external interface. This is the
//! crate downstream consumers (the CLI included) depend on.

pub use sfs_core::*;
