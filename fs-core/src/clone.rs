//! Handle cloning
//!
//! A clone is a lightweight child of an existing handle. It shares the
//! device name, superblock, group descriptors, MMP state and I/O channel
//! with its origin, and privately owns only the substructures named by its
//! [`CloneFlags`]. Everything else defers to the origin until the clone is
//! released and merged back.

use std::sync::Arc;

use crate::arena::HandleArena;
use crate::error::{Error, Result};
use crate::handle::{CloneFlags, FsHandle, HandleId, Slot, SlotKind, FS_HANDLE_MAGIC};

impl HandleArena {
    /// Clone `src`, privately owning the substructures named in `flags`
    ///
    /// The origin's outstanding-child count is raised before any copying and
    /// stays raised until the clone is released. If the clone cannot be
    /// built the count is restored.
    pub fn clone_handle(&self, src: HandleId, flags: CloneFlags) -> Result<HandleId> {
        let pending = self.entry_with_child(src)?;
        let guard = pending.entry.handle.lock();
        let source = guard.as_ref().ok_or(Error::UnknownHandle(src))?;
        source.check_magic()?;

        let id = self.allocate_id();
        let child = clone_from(source, id, flags)?;
        drop(guard);

        log::debug!(
            "CLONE: {} cloned as {} with {:?} (io refs now {})",
            src,
            id,
            flags,
            child.io().ref_count()
        );
        self.insert(child);
        pending.commit();
        Ok(id)
    }

    /// Clone `src` with the arena's default clone flags
    pub fn clone_default(&self, src: HandleId) -> Result<HandleId> {
        self.clone_handle(src, self.config().default_clone_flags)
    }
}

fn clone_slot<T>(
    flags: CloneFlags,
    kind: SlotKind,
    slot: &Slot<T>,
    copy: impl FnOnce(&T) -> Result<T>,
) -> Result<Slot<T>> {
    if !flags.covers(kind) {
        return Ok(Slot::Deferred);
    }
    match slot {
        Slot::Owned(value) => Ok(Slot::Owned(copy(value)?)),
        Slot::Empty | Slot::Deferred => Ok(Slot::Empty),
    }
}

fn clone_from(src: &FsHandle, id: HandleId, flags: CloneFlags) -> Result<FsHandle> {
    let dblist = clone_slot(flags, SlotKind::DirBlocks, &src.dblist, |list| {
        let mut copy = list.try_copy()?;
        copy.set_owner(id);
        Ok(copy)
    })?;
    let block_map = clone_slot(flags, SlotKind::BlockBitmap, &src.block_map, |bitmap| {
        let mut copy = bitmap.try_copy()?;
        copy.set_owner(id);
        Ok(copy)
    })?;
    let inode_map = clone_slot(flags, SlotKind::InodeBitmap, &src.inode_map, |bitmap| {
        let mut copy = bitmap.try_copy()?;
        copy.set_owner(id);
        Ok(copy)
    })?;
    let badblocks = clone_slot(flags, SlotKind::BadBlocks, &src.badblocks, |list| list.try_copy())?;

    Ok(FsHandle {
        magic: FS_HANDLE_MAGIC,
        id,
        device_name: Arc::clone(&src.device_name),
        superblock: Arc::clone(&src.superblock),
        orig_super: src.orig_super.clone(),
        block_size: src.block_size,
        desc_blocks: src.desc_blocks,
        group_desc: src.group_desc.clone(),
        inode_map,
        block_map,
        badblocks,
        dblist,
        mmp: src.mmp.clone(),
        io: src.io.clone(),
        icache: None,
        clone_flags: flags,
        origin: Some(src.id),
        flags: src.flags,
        account: src.account.clone(),
        icache_capacity: src.icache_capacity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;
    use crate::handle::OpenParams;
    use crate::io_channel::IoChannel;
    use crate::mem::MemTag;
    use crate::superblock::Geometry;

    fn arena_with_root() -> (HandleArena, HandleId, IoChannel) {
        let arena = HandleArena::default();
        let io = IoChannel::new("mem", Arc::new(MemoryBlockDevice::new(64, 1024)));
        let raw = Geometry::small(4000, 512).to_bytes();
        let root = arena.open(io.clone(), OpenParams::new("mem", &raw)).unwrap();
        arena
            .with_handle_mut(root, |h| {
                h.ensure_inode_map().unwrap().mark(12).unwrap();
                h.ensure_block_map().unwrap().mark(500).unwrap();
            })
            .unwrap();
        (arena, root, io)
    }

    #[test]
    fn test_clone_shares_and_copies() {
        let (arena, root, io) = arena_with_root();
        let refs = io.ref_count();

        let child = arena.clone_handle(root, CloneFlags::BLOCK_BITMAP).unwrap();
        assert_eq!(io.ref_count(), refs + 1);
        assert_eq!(arena.outstanding_children(root).unwrap(), 1);
        assert_eq!(arena.origin_of(child).unwrap(), Some(root));

        let root_sb = arena.with_handle(root, |h| Arc::clone(h.superblock())).unwrap();
        arena
            .with_handle(child, |h| {
                assert!(Arc::ptr_eq(h.superblock(), &root_sb));
                assert!(h.icache().is_none());

                let map = h.block_map().as_ref().unwrap();
                assert!(map.test(500));
                assert_eq!(map.owner(), child);

                assert!(h.inode_map().is_deferred());
                assert!(h.badblocks().is_deferred());
                assert!(h.dblist().is_deferred());
            })
            .unwrap();
    }

    #[test]
    fn test_flagged_but_absent_slot_starts_empty() {
        let (arena, root, _io) = arena_with_root();
        let child = arena.clone_handle(root, CloneFlags::BAD_BLOCKS).unwrap();
        arena
            .with_handle_mut(child, |h| {
                assert!(matches!(h.badblocks(), Slot::Empty));
                h.ensure_badblocks().unwrap().add(9).unwrap();
                assert!(matches!(
                    h.ensure_dblist(),
                    Err(Error::SlotDeferred(SlotKind::DirBlocks))
                ));
            })
            .unwrap();
    }

    #[test]
    fn test_clone_failure_restores_counter() {
        let (arena, root, io) = arena_with_root();
        let bytes = arena.memory().live_bytes();
        let refs = io.ref_count();

        arena.memory().fail_next(MemTag::InodeBitmap);
        let err = arena.clone_handle(root, CloneFlags::all()).unwrap_err();
        assert!(err.is_out_of_memory());

        assert_eq!(arena.outstanding_children(root).unwrap(), 0);
        assert_eq!(arena.memory().live_bytes(), bytes);
        assert_eq!(io.ref_count(), refs);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_clone_default_uses_config() {
        let (arena, root, _io) = arena_with_root();
        let child = arena.clone_default(root).unwrap();
        assert_eq!(arena.clone_flags_of(child).unwrap(), CloneFlags::all());
    }
}
