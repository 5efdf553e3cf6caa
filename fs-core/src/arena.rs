//! Handle arena
//!
//! All live handles are owned by a [`HandleArena`] and addressed by
//! [`HandleId`]. Origin references and substructure back-references are ids,
//! so handles never point at each other directly.
//!
//! Each entry pairs the handle with a dedicated child counter. The counter is
//! the only cross-thread state the lifecycle itself mutates; the handle body
//! lock is only contended if two threads touch the same handle, which the
//! one-clone-per-worker model avoids.
//!
//! The closures passed to [`HandleArena::with_handle`] and
//! [`HandleArena::with_handle_mut`] run with that handle locked, so they must
//! not call back into the arena for the same handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::LifecycleConfig;
use crate::error::{Error, Result};
use crate::handle::{CloneFlags, FsHandle, HandleId, OpenParams};
use crate::io_channel::IoChannel;
use crate::mem::MemAccount;

pub(crate) struct Entry {
    pub(crate) handle: Mutex<Option<FsHandle>>,
    pub(crate) children: Mutex<u32>,
}

impl Entry {
    fn new(handle: FsHandle) -> Self {
        Self {
            handle: Mutex::new(Some(handle)),
            children: Mutex::new(0),
        }
    }
}

/// Owner of every live filesystem handle
pub struct HandleArena {
    entries: RwLock<HashMap<HandleId, Arc<Entry>>>,
    next_id: AtomicU64,
    account: MemAccount,
    config: LifecycleConfig,
}

impl HandleArena {
    /// Create an empty arena
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            account: MemAccount::new(),
            config,
        }
    }

    /// Memory account every handle in this arena draws from
    pub fn memory(&self) -> &MemAccount {
        &self.account
    }

    /// Arena configuration
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub(crate) fn allocate_id(&self) -> HandleId {
        HandleId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn entry(&self, id: HandleId) -> Result<Arc<Entry>> {
        self.entries
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownHandle(id))
    }

    /// Look up `id` and register one more outstanding child on it
    ///
    /// Done under the map lock so a concurrent release either sees the new
    /// child or has already removed the handle.
    pub(crate) fn entry_with_child(&self, id: HandleId) -> Result<PendingChild> {
        let entries = self.entries.read();
        let entry = entries.get(&id).cloned().ok_or(Error::UnknownHandle(id))?;
        *entry.children.lock() += 1;
        Ok(PendingChild {
            entry,
            committed: false,
        })
    }

    /// Remove `id` if it has no outstanding children
    ///
    /// Returns None, leaving the handle in place, if it still has children.
    pub(crate) fn remove_childless(&self, id: HandleId) -> Result<Option<Arc<Entry>>> {
        let mut entries = self.entries.write();
        let entry = entries.get(&id).ok_or(Error::UnknownHandle(id))?;
        let outstanding = *entry.children.lock();
        if outstanding > 0 {
            log::debug!(
                "RELEASE: {} still has {} outstanding clone(s), leaving it in place",
                id,
                outstanding
            );
            return Ok(None);
        }
        Ok(entries.remove(&id))
    }

    pub(crate) fn insert(&self, handle: FsHandle) -> HandleId {
        let id = handle.id();
        self.entries.write().insert(id, Arc::new(Entry::new(handle)));
        id
    }

    /// Open a root handle on `io`
    pub fn open(&self, io: IoChannel, params: OpenParams<'_>) -> Result<HandleId> {
        let id = self.allocate_id();
        let handle = FsHandle::open(id, &self.account, io, params, self.config.inode_cache_capacity)?;
        log::info!(
            "OPEN: {} on {} ({} byte blocks, {} descriptor block(s))",
            id,
            handle.device_name(),
            handle.block_size(),
            handle.desc_blocks()
        );
        Ok(self.insert(handle))
    }

    /// Run `f` with shared access to handle `id`
    pub fn with_handle<R>(&self, id: HandleId, f: impl FnOnce(&FsHandle) -> R) -> Result<R> {
        let entry = self.entry(id)?;
        let guard = entry.handle.lock();
        let handle = guard.as_ref().ok_or(Error::UnknownHandle(id))?;
        Ok(f(handle))
    }

    /// Run `f` with exclusive access to handle `id`
    pub fn with_handle_mut<R>(&self, id: HandleId, f: impl FnOnce(&mut FsHandle) -> R) -> Result<R> {
        let entry = self.entry(id)?;
        let mut guard = entry.handle.lock();
        let handle = guard.as_mut().ok_or(Error::UnknownHandle(id))?;
        Ok(f(handle))
    }

    /// Number of live clones whose origin is `id`
    pub fn outstanding_children(&self, id: HandleId) -> Result<u32> {
        Ok(*self.entry(id)?.children.lock())
    }

    /// Origin of handle `id`
    pub fn origin_of(&self, id: HandleId) -> Result<Option<HandleId>> {
        self.with_handle(id, |h| h.origin())
    }

    /// Clone flags of handle `id`
    pub fn clone_flags_of(&self, id: HandleId) -> Result<CloneFlags> {
        self.with_handle(id, |h| h.clone_flags())
    }

    /// Whether `id` is live
    pub fn contains(&self, id: HandleId) -> bool {
        self.entries.read().contains_key(&id)
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no handles are live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identifiers of all live handles, ascending
    pub fn ids(&self) -> Vec<HandleId> {
        let mut ids: Vec<HandleId> = self.entries.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[cfg(test)]
    pub(crate) fn corrupt_magic(&self, id: HandleId, magic: u32) {
        if let Ok(entry) = self.entry(id) {
            if let Some(handle) = entry.handle.lock().as_mut() {
                handle.magic = magic;
            }
        }
    }
}

impl Default for HandleArena {
    fn default() -> Self {
        Self::new(LifecycleConfig::default())
    }
}

impl std::fmt::Debug for HandleArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleArena")
            .field("handles", &self.len())
            .field("memory", &self.account)
            .finish()
    }
}

/// A child registered on its origin's counter; unregistered on drop unless committed
pub(crate) struct PendingChild {
    pub(crate) entry: Arc<Entry>,
    committed: bool,
}

impl PendingChild {
    pub(crate) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingChild {
    fn drop(&mut self) {
        if !self.committed {
            let mut children = self.entry.children.lock();
            *children = children.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;
    use crate::handle::FS_HANDLE_MAGIC;
    use crate::superblock::Geometry;

    fn arena_with_root() -> (HandleArena, HandleId) {
        let arena = HandleArena::default();
        let io = IoChannel::new("mem", Arc::new(MemoryBlockDevice::new(64, 1024)));
        let raw = Geometry::small(1000, 128).to_bytes();
        let root = arena.open(io, OpenParams::new("mem", &raw)).unwrap();
        (arena, root)
    }

    #[test]
    fn test_open_registers_root() {
        let (arena, root) = arena_with_root();
        assert!(arena.contains(root));
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.origin_of(root).unwrap(), None);
        assert_eq!(arena.clone_flags_of(root).unwrap(), CloneFlags::empty());
        assert_eq!(arena.outstanding_children(root).unwrap(), 0);
        assert!(arena.with_handle(root, |h| h.inode_map().is_owned()).unwrap());
    }

    #[test]
    fn test_unknown_handle() {
        let arena = HandleArena::default();
        let missing = HandleId::from_raw(42);
        assert!(matches!(arena.with_handle(missing, |_| ()), Err(Error::UnknownHandle(id)) if id == missing));
        assert!(arena.release(missing).is_err());
    }

    #[test]
    fn test_pending_child_rolls_back() {
        let (arena, root) = arena_with_root();
        {
            let _pending = arena.entry_with_child(root).unwrap();
            assert_eq!(arena.outstanding_children(root).unwrap(), 1);
        }
        assert_eq!(arena.outstanding_children(root).unwrap(), 0);

        arena.entry_with_child(root).unwrap().commit();
        assert_eq!(arena.outstanding_children(root).unwrap(), 1);
    }

    #[test]
    fn test_magic_mismatch_touches_nothing() {
        let (arena, root) = arena_with_root();
        let io_refs = arena.with_handle(root, |h| h.io().ref_count()).unwrap();
        let bytes = arena.memory().live_bytes();
        arena.corrupt_magic(root, 0xdead_beef);

        assert!(matches!(
            arena.duplicate(root),
            Err(Error::MagicMismatch { found: 0xdead_beef })
        ));
        assert!(matches!(
            arena.clone_handle(root, CloneFlags::all()),
            Err(Error::MagicMismatch { .. })
        ));

        assert_eq!(arena.len(), 1);
        assert_eq!(arena.memory().live_bytes(), bytes);
        assert_eq!(arena.outstanding_children(root).unwrap(), 0);
        assert_eq!(arena.with_handle(root, |h| h.io().ref_count()).unwrap(), io_refs);

        arena.corrupt_magic(root, FS_HANDLE_MAGIC);
        assert!(arena.duplicate(root).is_ok());
    }
}
