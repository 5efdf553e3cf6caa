//! fshandle core - filesystem handle lifecycle for parallel checking
//!
//! This crate owns the in-memory handle of an ext2-style volume and the three
//! operations that let a checker fan work out across threads:
//!
//! - [`HandleArena::duplicate`] makes a fully independent copy of a handle,
//!   sharing only the I/O channel and inode attribute cache.
//! - [`HandleArena::clone_handle`] makes a lightweight child that shares
//!   everything except the substructures named in its [`CloneFlags`].
//! - [`HandleArena::release`] frees a handle; a clone is first merged back
//!   into its origin.
//!
//! Handles live in a [`HandleArena`] and are addressed by [`HandleId`].

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod badblocks;
pub mod bitmap;
pub mod blockdev;
pub mod config;
pub mod dblist;
pub mod error;
pub mod handle;
pub mod icache;
pub mod io_channel;
pub mod mem;
pub mod mmp;
pub mod superblock;

mod arena;
mod clone;
mod dup;
mod merge;

pub use arena::HandleArena;
pub use badblocks::BadBlocksList;
pub use bitmap::{Bitmap, BitmapKind};
pub use config::LifecycleConfig;
pub use dblist::{DirBlock, DirBlockList};
pub use error::{Error, Result};
pub use handle::{CloneFlags, FsFlags, FsHandle, HandleId, OpenParams, Slot, SlotKind, FS_HANDLE_MAGIC};
pub use icache::{CachedInode, InodeCache};
pub use io_channel::IoChannel;
pub use mem::{MemAccount, MemTag};
pub use mmp::Mmp;
pub use superblock::{Geometry, Superblock};

/// Re-export common types and traits
pub mod prelude {
    pub use crate::error::Result;
    pub use crate::{CloneFlags, HandleArena, HandleId, IoChannel, OpenParams};
}
