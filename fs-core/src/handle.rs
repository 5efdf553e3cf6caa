//! Filesystem handle
//!
//! An [`FsHandle`] is one open view of a volume. Root handles come from
//! [`HandleArena::open`](crate::HandleArena::open); duplicates and clones are
//! made from existing handles by the arena.
//!
//! Four substructures can be privately owned by a clone: the inode bitmap,
//! the block bitmap, the bad-block list and the directory-block list. Each
//! lives in a [`Slot`], which records whether the handle owns a value, owns
//! an empty slot waiting to be filled, or defers to its origin.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::badblocks::BadBlocksList;
use crate::bitmap::{Bitmap, BitmapKind};
use crate::dblist::DirBlockList;
use crate::error::{Error, Result};
use crate::icache::InodeCache;
use crate::io_channel::IoChannel;
use crate::mem::{Buffer, MemAccount, MemTag};
use crate::mmp::Mmp;
use crate::superblock::Superblock;

/// Identity marker of a live filesystem handle
pub const FS_HANDLE_MAGIC: u32 = 0x7f2b_ca01;

/// Stable identifier of a handle within its arena; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(u64);

impl HandleId {
    /// Wrap a raw identifier
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw identifier
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Substructures a clone owns privately
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CloneFlags: u32 {
        /// Private copy of the block bitmap
        const BLOCK_BITMAP = 0x01;
        /// Private copy of the inode bitmap
        const INODE_BITMAP = 0x02;
        /// Private directory-block list
        const DIR_BLOCKS = 0x04;
        /// Private bad-block list
        const BAD_BLOCKS = 0x08;
    }
}

impl CloneFlags {
    /// Flag bit covering `kind`
    pub fn for_kind(kind: SlotKind) -> CloneFlags {
        match kind {
            SlotKind::InodeBitmap => CloneFlags::INODE_BITMAP,
            SlotKind::BlockBitmap => CloneFlags::BLOCK_BITMAP,
            SlotKind::BadBlocks => CloneFlags::BAD_BLOCKS,
            SlotKind::DirBlocks => CloneFlags::DIR_BLOCKS,
        }
    }

    /// Whether the flag set covers `kind`
    pub fn covers(self, kind: SlotKind) -> bool {
        self.contains(CloneFlags::for_kind(kind))
    }
}

bitflags! {
    /// Accumulated state of a handle
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FsFlags: u32 {
        /// Opened read-write
        const RW = 0x01;
        /// Something was changed and needs writing back
        const DIRTY = 0x04;
        /// Filesystem is known to be consistent
        const VALID = 0x08;
        /// Bitmaps are loaded
        const BITMAPS_LOADED = 0x10;
        /// Inode bitmap changed
        const IB_DIRTY = 0x20;
        /// Block bitmap changed
        const BB_DIRTY = 0x40;
        /// Errors were found that are not yet resolved
        const HAS_ERRORS = 0x80;
    }
}

/// The independently ownable substructures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Inode usage bitmap
    InodeBitmap,
    /// Block usage bitmap
    BlockBitmap,
    /// Bad-block list
    BadBlocks,
    /// Directory-block list
    DirBlocks,
}

impl SlotKind {
    /// All kinds, in merge order
    pub const ALL: [SlotKind; 4] = [
        SlotKind::InodeBitmap,
        SlotKind::BlockBitmap,
        SlotKind::DirBlocks,
        SlotKind::BadBlocks,
    ];
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotKind::InodeBitmap => "inode bitmap",
            SlotKind::BlockBitmap => "block bitmap",
            SlotKind::BadBlocks => "bad-block list",
            SlotKind::DirBlocks => "directory-block list",
        };
        f.write_str(name)
    }
}

/// Ownership state of one substructure
#[derive(Debug)]
pub enum Slot<T> {
    /// Owned by this handle
    Owned(T),
    /// Owned by this handle but not populated yet
    Empty,
    /// Not owned; callers use the origin's copy
    Deferred,
}

impl<T> Slot<T> {
    /// The owned value, if any
    pub fn as_ref(&self) -> Option<&T> {
        match self {
            Slot::Owned(v) => Some(v),
            _ => None,
        }
    }

    /// The owned value, mutably
    pub fn as_mut(&mut self) -> Option<&mut T> {
        match self {
            Slot::Owned(v) => Some(v),
            _ => None,
        }
    }

    /// Whether a value is held
    pub fn is_owned(&self) -> bool {
        matches!(self, Slot::Owned(_))
    }

    /// Whether the slot defers to the origin
    pub fn is_deferred(&self) -> bool {
        matches!(self, Slot::Deferred)
    }

    /// Take the owned value, leaving an empty (still owned) slot
    pub fn take(&mut self) -> Option<T> {
        match std::mem::replace(self, Slot::Empty) {
            Slot::Owned(v) => Some(v),
            Slot::Deferred => {
                *self = Slot::Deferred;
                None
            }
            Slot::Empty => None,
        }
    }
}

/// Device name, accounted
#[derive(Debug)]
pub(crate) struct DeviceName {
    name: String,
    _charge: crate::mem::Charge,
}

impl DeviceName {
    pub(crate) fn new(account: &MemAccount, name: &str) -> Result<Self> {
        let charge = account.charge(MemTag::DeviceName, name.len() + 1)?;
        let mut owned = String::new();
        owned
            .try_reserve_exact(name.len())
            .map_err(|_| Error::OutOfMemory {
                tag: MemTag::DeviceName,
                bytes: name.len() + 1,
            })?;
        owned.push_str(name);
        Ok(Self {
            name: owned,
            _charge: charge,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.name
    }
}

/// Parameters for opening a root handle
pub struct OpenParams<'a> {
    /// Device name (usually the path)
    pub device_name: &'a str,
    /// Raw superblock bytes
    pub superblock: &'a [u8],
    /// Keep a pristine copy of the superblock alongside the working one
    pub keep_original_superblock: bool,
    /// Group descriptor table, or None if not loaded yet
    pub group_desc: Option<&'a [u8]>,
    /// Allocate empty inode and block bitmaps
    pub allocate_bitmaps: bool,
    /// Multi-mount protection state
    pub mmp: Option<Mmp>,
    /// Initial state flags
    pub flags: FsFlags,
}

impl<'a> OpenParams<'a> {
    /// Defaults for a read-write open of `superblock` on `device_name`
    pub fn new(device_name: &'a str, superblock: &'a [u8]) -> Self {
        Self {
            device_name,
            superblock,
            keep_original_superblock: false,
            group_desc: None,
            allocate_bitmaps: true,
            mmp: None,
            flags: FsFlags::RW | FsFlags::VALID,
        }
    }
}

/// One open view of a filesystem volume
pub struct FsHandle {
    pub(crate) magic: u32,
    pub(crate) id: HandleId,
    pub(crate) device_name: Arc<DeviceName>,
    pub(crate) superblock: Arc<RwLock<Superblock>>,
    pub(crate) orig_super: Option<Arc<Superblock>>,
    pub(crate) block_size: u32,
    pub(crate) desc_blocks: u32,
    pub(crate) group_desc: Option<Arc<RwLock<Buffer>>>,
    pub(crate) inode_map: Slot<Bitmap>,
    pub(crate) block_map: Slot<Bitmap>,
    pub(crate) badblocks: Slot<BadBlocksList>,
    pub(crate) dblist: Slot<DirBlockList>,
    pub(crate) mmp: Option<Arc<RwLock<Mmp>>>,
    pub(crate) io: IoChannel,
    pub(crate) icache: Option<Arc<InodeCache>>,
    pub(crate) clone_flags: CloneFlags,
    pub(crate) origin: Option<HandleId>,
    pub(crate) flags: FsFlags,
    pub(crate) account: MemAccount,
    pub(crate) icache_capacity: usize,
}

impl FsHandle {
    /// Build a root handle; used by the arena's open path
    pub(crate) fn open(
        id: HandleId,
        account: &MemAccount,
        io: IoChannel,
        params: OpenParams<'_>,
        icache_capacity: usize,
    ) -> Result<Self> {
        let device_name = Arc::new(DeviceName::new(account, params.device_name)?);
        let superblock = Superblock::from_bytes(account, params.superblock)?;
        let orig_super = if params.keep_original_superblock {
            Some(Arc::new(superblock.try_copy_as(MemTag::OriginalSuperblock)?))
        } else {
            None
        };

        let block_size = superblock.block_size();
        let desc_blocks = superblock.desc_blocks();
        let group_desc = match params.group_desc {
            Some(gd) => {
                let mut table = account.alloc_zeroed(
                    MemTag::GroupDescriptors,
                    desc_blocks as usize * block_size as usize,
                )?;
                let n = gd.len().min(table.len());
                table[..n].copy_from_slice(&gd[..n]);
                Some(Arc::new(RwLock::new(table)))
            }
            None => None,
        };

        let mut handle = Self {
            magic: FS_HANDLE_MAGIC,
            id,
            device_name,
            superblock: Arc::new(RwLock::new(superblock)),
            orig_super,
            block_size,
            desc_blocks,
            group_desc,
            inode_map: Slot::Empty,
            block_map: Slot::Empty,
            badblocks: Slot::Empty,
            dblist: Slot::Empty,
            mmp: params.mmp.map(|m| Arc::new(RwLock::new(m))),
            io,
            icache: None,
            clone_flags: CloneFlags::empty(),
            origin: None,
            flags: params.flags,
            account: account.clone(),
            icache_capacity,
        };

        if params.allocate_bitmaps {
            handle.ensure_inode_map()?;
            handle.ensure_block_map()?;
        }

        Ok(handle)
    }

    pub(crate) fn check_magic(&self) -> Result<()> {
        if self.magic != FS_HANDLE_MAGIC {
            return Err(Error::MagicMismatch { found: self.magic });
        }
        Ok(())
    }

    /// Identifier of this handle
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Handle this one was cloned from; None for roots and duplicates
    pub fn origin(&self) -> Option<HandleId> {
        self.origin
    }

    /// Whether this handle is a clone
    pub fn is_clone(&self) -> bool {
        self.origin.is_some()
    }

    /// Substructures this handle owns privately as a clone
    pub fn clone_flags(&self) -> CloneFlags {
        self.clone_flags
    }

    /// Device name
    pub fn device_name(&self) -> &str {
        self.device_name.as_str()
    }

    /// Filesystem block size
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Blocks in the group descriptor table
    pub fn desc_blocks(&self) -> u32 {
        self.desc_blocks
    }

    /// Working superblock (shared with clones)
    pub fn superblock(&self) -> &Arc<RwLock<Superblock>> {
        &self.superblock
    }

    /// Pristine superblock copy, if kept
    pub fn original_superblock(&self) -> Option<&Superblock> {
        self.orig_super.as_deref()
    }

    /// Group descriptor table (shared with clones)
    pub fn group_desc(&self) -> Option<&Arc<RwLock<Buffer>>> {
        self.group_desc.as_ref()
    }

    /// Multi-mount protection state (shared with clones)
    pub fn mmp(&self) -> Option<&Arc<RwLock<Mmp>>> {
        self.mmp.as_ref()
    }

    /// I/O channel
    pub fn io(&self) -> &IoChannel {
        &self.io
    }

    /// Accumulated state flags
    pub fn flags(&self) -> FsFlags {
        self.flags
    }

    /// Set state flags
    pub fn set_flags(&mut self, flags: FsFlags) {
        self.flags |= flags;
    }

    /// Mark the filesystem as known consistent
    pub fn mark_valid(&mut self) {
        self.flags |= FsFlags::VALID;
    }

    /// Mark the filesystem as not known consistent
    pub fn unmark_valid(&mut self) {
        self.flags.remove(FsFlags::VALID);
    }

    /// Whether the filesystem is known consistent
    pub fn is_valid(&self) -> bool {
        self.flags.contains(FsFlags::VALID)
    }

    /// Inode bitmap slot
    pub fn inode_map(&self) -> &Slot<Bitmap> {
        &self.inode_map
    }

    /// Inode bitmap slot, mutably
    pub fn inode_map_mut(&mut self) -> &mut Slot<Bitmap> {
        &mut self.inode_map
    }

    /// Block bitmap slot
    pub fn block_map(&self) -> &Slot<Bitmap> {
        &self.block_map
    }

    /// Block bitmap slot, mutably
    pub fn block_map_mut(&mut self) -> &mut Slot<Bitmap> {
        &mut self.block_map
    }

    /// Bad-block list slot
    pub fn badblocks(&self) -> &Slot<BadBlocksList> {
        &self.badblocks
    }

    /// Bad-block list slot, mutably
    pub fn badblocks_mut(&mut self) -> &mut Slot<BadBlocksList> {
        &mut self.badblocks
    }

    /// Directory-block list slot
    pub fn dblist(&self) -> &Slot<DirBlockList> {
        &self.dblist
    }

    /// Directory-block list slot, mutably
    pub fn dblist_mut(&mut self) -> &mut Slot<DirBlockList> {
        &mut self.dblist
    }

    /// Inode attribute cache, if one has been built
    pub fn icache(&self) -> Option<&Arc<InodeCache>> {
        self.icache.as_ref()
    }

    /// Build the inode attribute cache if this handle has none
    pub fn ensure_inode_cache(&mut self) -> &Arc<InodeCache> {
        let capacity = self.icache_capacity;
        self.icache
            .get_or_insert_with(|| Arc::new(InodeCache::new(capacity)))
    }

    fn new_bitmap(&self, kind: BitmapKind) -> Result<Bitmap> {
        let sb = self.superblock.read();
        let (start, end) = match kind {
            BitmapKind::Inode => (1, sb.inodes_count() as u64),
            BitmapKind::Block => (sb.first_data_block() as u64, sb.blocks_count() as u64 - 1),
        };
        Bitmap::new(&self.account, kind, start, end, self.id)
    }

    /// Populate an empty inode bitmap slot and return the bitmap
    pub fn ensure_inode_map(&mut self) -> Result<&mut Bitmap> {
        match self.inode_map {
            Slot::Deferred => return Err(Error::SlotDeferred(SlotKind::InodeBitmap)),
            Slot::Empty => self.inode_map = Slot::Owned(self.new_bitmap(BitmapKind::Inode)?),
            Slot::Owned(_) => {}
        }
        self.inode_map
            .as_mut()
            .ok_or(Error::SlotDeferred(SlotKind::InodeBitmap))
    }

    /// Populate an empty block bitmap slot and return the bitmap
    pub fn ensure_block_map(&mut self) -> Result<&mut Bitmap> {
        match self.block_map {
            Slot::Deferred => return Err(Error::SlotDeferred(SlotKind::BlockBitmap)),
            Slot::Empty => self.block_map = Slot::Owned(self.new_bitmap(BitmapKind::Block)?),
            Slot::Owned(_) => {}
        }
        self.block_map
            .as_mut()
            .ok_or(Error::SlotDeferred(SlotKind::BlockBitmap))
    }

    /// Populate an empty bad-block list slot and return the list
    pub fn ensure_badblocks(&mut self) -> Result<&mut BadBlocksList> {
        match self.badblocks {
            Slot::Deferred => return Err(Error::SlotDeferred(SlotKind::BadBlocks)),
            Slot::Empty => self.badblocks = Slot::Owned(BadBlocksList::new(&self.account)?),
            Slot::Owned(_) => {}
        }
        self.badblocks
            .as_mut()
            .ok_or(Error::SlotDeferred(SlotKind::BadBlocks))
    }

    /// Populate an empty directory-block list slot and return the list
    pub fn ensure_dblist(&mut self) -> Result<&mut DirBlockList> {
        match self.dblist {
            Slot::Deferred => return Err(Error::SlotDeferred(SlotKind::DirBlocks)),
            Slot::Empty => self.dblist = Slot::Owned(DirBlockList::new(&self.account, self.id)?),
            Slot::Owned(_) => {}
        }
        self.dblist
            .as_mut()
            .ok_or(Error::SlotDeferred(SlotKind::DirBlocks))
    }

    /// Whether the slot for `kind` defers to the origin
    pub fn defers(&self, kind: SlotKind) -> bool {
        match kind {
            SlotKind::InodeBitmap => self.inode_map.is_deferred(),
            SlotKind::BlockBitmap => self.block_map.is_deferred(),
            SlotKind::BadBlocks => self.badblocks.is_deferred(),
            SlotKind::DirBlocks => self.dblist.is_deferred(),
        }
    }
}

impl fmt::Debug for FsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsHandle")
            .field("id", &self.id)
            .field("device", &self.device_name.as_str())
            .field("origin", &self.origin)
            .field("clone_flags", &self.clone_flags)
            .field("flags", &self.flags)
            .field("inode_map", &self.inode_map)
            .field("block_map", &self.block_map)
            .field("badblocks", &self.badblocks)
            .field("dblist", &self.dblist)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_take_keeps_deferred() {
        let mut owned: Slot<u32> = Slot::Owned(3);
        assert_eq!(owned.take(), Some(3));
        assert!(matches!(owned, Slot::Empty));

        let mut deferred: Slot<u32> = Slot::Deferred;
        assert_eq!(deferred.take(), None);
        assert!(deferred.is_deferred());
    }

    #[test]
    fn test_clone_flags_cover_kinds() {
        let flags = CloneFlags::INODE_BITMAP | CloneFlags::DIR_BLOCKS;
        assert!(flags.covers(SlotKind::InodeBitmap));
        assert!(flags.covers(SlotKind::DirBlocks));
        assert!(!flags.covers(SlotKind::BlockBitmap));
        assert!(!flags.covers(SlotKind::BadBlocks));
    }

    #[test]
    fn test_device_name_is_accounted() {
        let account = MemAccount::new();
        let name = DeviceName::new(&account, "/dev/sdb1").unwrap();
        assert_eq!(name.as_str(), "/dev/sdb1");
        assert_eq!(account.live_bytes(), 10);
        drop(name);
        assert_eq!(account.live_bytes(), 0);
    }
}
