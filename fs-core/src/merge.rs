//! Releasing handles and folding clones back into their origin
//!
//! Releasing a clone merges each substructure it privately owns into the
//! origin, then tears the clone down. Bitmaps and directory-block lists are
//! transferred outright when the origin's slot is empty and unioned
//! otherwise. The bad-block list is always copied or unioned from the
//! clone's list, which is freed with the clone.
//!
//! If the origin itself defers a substructure, the merge continues up the
//! origin chain to the nearest handle that does not.
//!
//! A bitmap or directory-block failure stops the merge before the state
//! flags are folded. A bad-block failure comes last and still lets the
//! flags fold in. The clone is torn down regardless and the origin's child
//! count always drops.

use std::sync::Arc;

use crate::arena::{Entry, HandleArena};
use crate::badblocks::BadBlocksList;
use crate::bitmap::Bitmap;
use crate::dblist::DirBlockList;
use crate::error::{Error, Result};
use crate::handle::{FsHandle, HandleId, Slot, SlotKind};

impl HandleArena {
    /// Release handle `id`
    ///
    /// A handle that still has outstanding clones is left in place and this
    /// returns `Ok(())`. A clone is merged into its origin before it is
    /// freed; the first merge error is returned after teardown.
    pub fn release(&self, id: HandleId) -> Result<()> {
        let entry = match self.remove_childless(id)? {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let mut handle = entry.handle.lock().take().ok_or(Error::UnknownHandle(id))?;

        let origin = match handle.origin {
            Some(origin) => origin,
            None => {
                log::debug!("RELEASE: freeing {} ({})", id, handle.device_name());
                return Ok(());
            }
        };

        let result = self.merge_into(&mut handle, origin);

        drop(handle);
        if let Ok(origin_entry) = self.entry(origin) {
            let mut children = origin_entry.children.lock();
            *children = children.saturating_sub(1);
        }
        log::debug!("RELEASE: clone {} freed, origin {}", id, origin);
        result
    }

    fn merge_into(&self, child: &mut FsHandle, origin: HandleId) -> Result<()> {
        let mut badblocks_err = None;
        for kind in SlotKind::ALL {
            if !child.clone_flags.covers(kind) {
                continue;
            }
            match self.merge_slot(child, origin, kind) {
                Ok(()) => {}
                // A bad-block failure is still reported but the flags fold in
                Err(err) if kind == SlotKind::BadBlocks => badblocks_err = Some(err),
                Err(err) => return Err(err),
            }
        }

        let entry = self.entry(origin)?;
        let mut guard = entry.handle.lock();
        let dest = guard.as_mut().ok_or(Error::UnknownHandle(origin))?;
        dest.flags |= child.flags;
        if !dest.is_valid() {
            dest.unmark_valid();
        }
        drop(guard);

        if let Some(cache) = child.icache.take() {
            log::trace!("MERGE: dropping inode cache of {} ({} entries)", child.id, cache.len());
        }
        match badblocks_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Nearest handle at or above `start` that does not defer `kind`
    fn merge_target(&self, start: HandleId, kind: SlotKind) -> Result<(HandleId, Arc<Entry>)> {
        let mut id = start;
        loop {
            let entry = self.entry(id)?;
            let next = {
                let guard = entry.handle.lock();
                let handle = guard.as_ref().ok_or(Error::UnknownHandle(id))?;
                if handle.defers(kind) {
                    handle.origin
                } else {
                    None
                }
            };
            match next {
                Some(up) => id = up,
                None => return Ok((id, entry)),
            }
        }
    }

    fn merge_slot(&self, child: &mut FsHandle, origin: HandleId, kind: SlotKind) -> Result<()> {
        let held = match kind {
            SlotKind::InodeBitmap => child.inode_map.is_owned(),
            SlotKind::BlockBitmap => child.block_map.is_owned(),
            SlotKind::BadBlocks => child.badblocks.is_owned(),
            SlotKind::DirBlocks => child.dblist.is_owned(),
        };
        if !held {
            return Ok(());
        }

        let (target, entry) = self.merge_target(origin, kind)?;
        let mut guard = entry.handle.lock();
        let dest = guard.as_mut().ok_or(Error::UnknownHandle(target))?;

        match kind {
            SlotKind::InodeBitmap => {
                if let Some(src) = child.inode_map.take() {
                    merge_bitmap(&mut dest.inode_map, src, target)?;
                }
            }
            SlotKind::BlockBitmap => {
                if let Some(src) = child.block_map.take() {
                    merge_bitmap(&mut dest.block_map, src, target)?;
                }
            }
            SlotKind::DirBlocks => {
                if let Some(src) = child.dblist.take() {
                    merge_dblist(&mut dest.dblist, src, target)?;
                }
            }
            SlotKind::BadBlocks => {
                if let Some(src) = child.badblocks.as_ref() {
                    merge_badblocks(&mut dest.badblocks, src)?;
                }
            }
        }

        log::debug!("MERGE: {} of {} folded into {}", kind, child.id, target);
        Ok(())
    }
}

fn merge_bitmap(dest: &mut Slot<Bitmap>, mut src: Bitmap, owner: HandleId) -> Result<()> {
    match dest {
        Slot::Owned(existing) => {
            existing.merge_from(src)?;
            existing.set_owner(owner);
        }
        Slot::Empty | Slot::Deferred => {
            src.set_owner(owner);
            *dest = Slot::Owned(src);
        }
    }
    Ok(())
}

fn merge_dblist(dest: &mut Slot<DirBlockList>, mut src: DirBlockList, owner: HandleId) -> Result<()> {
    match dest {
        Slot::Owned(existing) => {
            existing.merge_from(src)?;
            existing.set_owner(owner);
        }
        Slot::Empty | Slot::Deferred => {
            src.set_owner(owner);
            *dest = Slot::Owned(src);
        }
    }
    Ok(())
}

/// The clone keeps its own list; the origin gets a copy or a union
fn merge_badblocks(dest: &mut Slot<BadBlocksList>, src: &BadBlocksList) -> Result<()> {
    match dest {
        Slot::Owned(existing) => existing.merge_from(src),
        Slot::Empty | Slot::Deferred => {
            *dest = Slot::Owned(src.try_copy()?);
            Ok(())
        }
    }
}
