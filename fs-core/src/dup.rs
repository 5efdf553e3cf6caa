//! Handle duplication
//!
//! A duplicate is a fully independent root handle. Only the I/O channel and
//! the inode attribute cache are shared with the source; everything else is
//! copied into fresh allocations. If any step fails the partially built
//! duplicate is dropped, which returns every allocation it already made.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::arena::HandleArena;
use crate::bitmap::Bitmap;
use crate::dblist::DirBlockList;
use crate::error::{Error, Result};
use crate::handle::{CloneFlags, DeviceName, FsHandle, HandleId, Slot, FS_HANDLE_MAGIC};
use crate::mem::MemTag;

impl HandleArena {
    /// Make an independent copy of handle `src`
    pub fn duplicate(&self, src: HandleId) -> Result<HandleId> {
        let entry = self.entry(src)?;
        let guard = entry.handle.lock();
        let source = guard.as_ref().ok_or(Error::UnknownHandle(src))?;
        source.check_magic()?;

        let id = self.allocate_id();
        let dup = duplicate_handle(source, id)?;
        drop(guard);

        log::debug!(
            "DUP: {} duplicated as {} (io refs now {})",
            src,
            id,
            dup.io().ref_count()
        );
        Ok(self.insert(dup))
    }
}

/// Copy an owned substructure; anything not owned by the source starts empty
fn copy_owned<T>(slot: &Slot<T>, copy: impl FnOnce(&T) -> Result<T>) -> Result<Slot<T>> {
    match slot {
        Slot::Owned(value) => Ok(Slot::Owned(copy(value)?)),
        Slot::Empty | Slot::Deferred => Ok(Slot::Empty),
    }
}

fn copy_bitmap(bitmap: &Bitmap, owner: HandleId) -> Result<Bitmap> {
    let mut copy = bitmap.try_copy()?;
    copy.set_owner(owner);
    Ok(copy)
}

fn copy_dblist(list: &DirBlockList, owner: HandleId) -> Result<DirBlockList> {
    let mut copy = list.try_copy()?;
    copy.set_owner(owner);
    Ok(copy)
}

pub(crate) fn duplicate_handle(src: &FsHandle, id: HandleId) -> Result<FsHandle> {
    let account = &src.account;

    // The two legitimately shared resources
    let io = src.io.clone();
    let icache = src.icache.clone();

    let device_name = Arc::new(DeviceName::new(account, src.device_name())?);
    let superblock = src.superblock.read().try_copy_as(MemTag::Superblock)?;
    let orig_super = match &src.orig_super {
        Some(sb) => Some(Arc::new(sb.try_copy_as(MemTag::OriginalSuperblock)?)),
        None => None,
    };

    // A source without a loaded table still gets a zeroed one
    let table_len = src.desc_blocks as usize * src.block_size as usize;
    let mut group_desc = account.alloc_zeroed(MemTag::GroupDescriptors, table_len)?;
    if let Some(table) = &src.group_desc {
        let table = table.read();
        let n = table.len().min(group_desc.len());
        group_desc[..n].copy_from_slice(&table[..n]);
    }

    let inode_map = copy_owned(&src.inode_map, |b| copy_bitmap(b, id))?;
    let block_map = copy_owned(&src.block_map, |b| copy_bitmap(b, id))?;
    let badblocks = copy_owned(&src.badblocks, |l| l.try_copy())?;
    let dblist = copy_owned(&src.dblist, |l| copy_dblist(l, id))?;

    let mmp = match &src.mmp {
        Some(mmp) => Some(Arc::new(RwLock::new(mmp.read().try_duplicate(account)?))),
        None => None,
    };

    Ok(FsHandle {
        magic: FS_HANDLE_MAGIC,
        id,
        device_name,
        superblock: Arc::new(RwLock::new(superblock)),
        orig_super,
        block_size: src.block_size,
        desc_blocks: src.desc_blocks,
        group_desc: Some(Arc::new(RwLock::new(group_desc))),
        inode_map,
        block_map,
        badblocks,
        dblist,
        mmp,
        io,
        icache,
        clone_flags: CloneFlags::empty(),
        origin: None,
        flags: src.flags,
        account: account.clone(),
        icache_capacity: src.icache_capacity,
    })
}
