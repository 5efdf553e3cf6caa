//! Accounted memory for handle substructures
//!
//! Every buffer or list owned by a filesystem handle is charged against the
//! [`MemAccount`] of the arena it lives in. Charges are returned when the
//! owning value is dropped, so a handle that is torn down (or a half-built
//! duplicate that is discarded on error) leaves the account where it was.
//!
//! Tests can ask the account to refuse the next allocation of a given kind
//! with [`MemAccount::fail_next`].

use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// What an allocation is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemTag {
    /// Device name string
    DeviceName,
    /// Superblock copy
    Superblock,
    /// Pristine copy of the superblock
    OriginalSuperblock,
    /// Group descriptor table
    GroupDescriptors,
    /// Inode usage bitmap
    InodeBitmap,
    /// Block usage bitmap
    BlockBitmap,
    /// Bad-block list
    BadBlocks,
    /// Deferred directory-block list
    DirBlocks,
    /// Multi-mount protection data buffer
    MmpBuffer,
    /// Multi-mount protection comparison buffer
    MmpCompare,
}

impl fmt::Display for MemTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemTag::DeviceName => "device name",
            MemTag::Superblock => "superblock",
            MemTag::OriginalSuperblock => "original superblock",
            MemTag::GroupDescriptors => "group descriptors",
            MemTag::InodeBitmap => "inode bitmap",
            MemTag::BlockBitmap => "block bitmap",
            MemTag::BadBlocks => "bad-block list",
            MemTag::DirBlocks => "directory-block list",
            MemTag::MmpBuffer => "MMP buffer",
            MemTag::MmpCompare => "MMP compare buffer",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
struct AccountInner {
    live_bytes: AtomicUsize,
    live_allocations: AtomicUsize,
    peak_bytes: AtomicUsize,
    /// One-shot injected failures, consumed in order of matching tag
    pending_failures: Mutex<Vec<MemTag>>,
}

/// Shared allocation account
#[derive(Clone, Default)]
pub struct MemAccount {
    inner: Arc<AccountInner>,
}

impl MemAccount {
    /// Create an empty account
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently charged
    pub fn live_bytes(&self) -> usize {
        self.inner.live_bytes.load(Ordering::Acquire)
    }

    /// Number of outstanding charges
    pub fn live_allocations(&self) -> usize {
        self.inner.live_allocations.load(Ordering::Acquire)
    }

    /// Highest value `live_bytes` has reached
    pub fn peak_bytes(&self) -> usize {
        self.inner.peak_bytes.load(Ordering::Acquire)
    }

    /// Make the next allocation tagged `tag` fail with `OutOfMemory`
    pub fn fail_next(&self, tag: MemTag) {
        self.inner.pending_failures.lock().push(tag);
    }

    /// Drop any injected failures that have not fired yet
    pub fn clear_failures(&self) {
        self.inner.pending_failures.lock().clear();
    }

    fn take_failure(&self, tag: MemTag) -> bool {
        let mut pending = self.inner.pending_failures.lock();
        match pending.iter().position(|t| *t == tag) {
            Some(idx) => {
                pending.remove(idx);
                true
            }
            None => false,
        }
    }

    fn add_bytes(&self, bytes: usize) {
        let now = self.inner.live_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.inner.peak_bytes.fetch_max(now, Ordering::AcqRel);
    }

    /// Charge `bytes` against the account
    pub fn charge(&self, tag: MemTag, bytes: usize) -> Result<Charge> {
        if self.take_failure(tag) {
            log::trace!("MEM: injected failure for {} ({} bytes)", tag, bytes);
            return Err(Error::OutOfMemory { tag, bytes });
        }
        self.add_bytes(bytes);
        self.inner.live_allocations.fetch_add(1, Ordering::AcqRel);
        Ok(Charge {
            account: self.clone(),
            tag,
            bytes,
        })
    }

    /// Allocate a zero-filled buffer of `len` bytes
    pub fn alloc_zeroed(&self, tag: MemTag, len: usize) -> Result<Buffer> {
        let charge = self.charge(tag, len)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| Error::OutOfMemory { tag, bytes: len })?;
        data.resize(len, 0);
        Ok(Buffer { data, charge })
    }

    /// Allocate a buffer holding a copy of `src`
    pub fn alloc_copy(&self, tag: MemTag, src: &[u8]) -> Result<Buffer> {
        let mut buf = self.alloc_zeroed(tag, src.len())?;
        buf.copy_from_slice(src);
        Ok(buf)
    }

    /// Allocate a zero-filled buffer whose start is aligned to `align`
    pub fn alloc_aligned(&self, tag: MemTag, len: usize, align: usize) -> Result<AlignedBuffer> {
        let layout = Layout::from_size_align(len.max(1), align)
            .map_err(|_| Error::OutOfMemory { tag, bytes: len })?;
        let charge = self.charge(tag, len)?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(Error::OutOfMemory { tag, bytes: len })?;
        Ok(AlignedBuffer {
            ptr,
            len,
            layout,
            _charge: charge,
        })
    }
}

impl fmt::Debug for MemAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemAccount")
            .field("live_bytes", &self.live_bytes())
            .field("live_allocations", &self.live_allocations())
            .field("peak_bytes", &self.peak_bytes())
            .finish()
    }
}

/// A live charge against a [`MemAccount`], returned on drop
pub struct Charge {
    account: MemAccount,
    tag: MemTag,
    bytes: usize,
}

impl Charge {
    /// Bytes covered by this charge
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Allocation tag
    pub fn tag(&self) -> MemTag {
        self.tag
    }

    /// The account this charge is drawn from
    pub fn account(&self) -> &MemAccount {
        &self.account
    }

    /// Adjust the charge to cover `bytes`; growth may fail
    pub fn resize(&mut self, bytes: usize) -> Result<()> {
        if bytes > self.bytes {
            if self.account.take_failure(self.tag) {
                return Err(Error::OutOfMemory {
                    tag: self.tag,
                    bytes,
                });
            }
            self.account.add_bytes(bytes - self.bytes);
        } else {
            self.account
                .inner
                .live_bytes
                .fetch_sub(self.bytes - bytes, Ordering::AcqRel);
        }
        self.bytes = bytes;
        Ok(())
    }
}

impl Drop for Charge {
    fn drop(&mut self) {
        let inner = &self.account.inner;
        inner.live_bytes.fetch_sub(self.bytes, Ordering::AcqRel);
        inner.live_allocations.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Charge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Charge")
            .field("tag", &self.tag)
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// Grow `vec` by `additional` elements of headroom, keeping `charge` in step
pub(crate) fn reserve_charged<T>(vec: &mut Vec<T>, charge: &mut Charge, additional: usize) -> Result<()> {
    if vec.capacity() - vec.len() >= additional {
        return Ok(());
    }
    let tag = charge.tag();
    let wanted = (vec.len() + additional).max(vec.capacity() * 2);
    charge.resize(wanted * std::mem::size_of::<T>())?;
    vec.try_reserve_exact(wanted - vec.len())
        .map_err(|_| Error::OutOfMemory {
            tag,
            bytes: wanted * std::mem::size_of::<T>(),
        })
}

/// Accounted byte buffer
pub struct Buffer {
    data: Vec<u8>,
    charge: Charge,
}

impl Buffer {
    /// Allocation tag
    pub fn tag(&self) -> MemTag {
        self.charge.tag()
    }

    /// Copy into a new buffer drawn from the same account
    pub fn try_copy(&self) -> Result<Buffer> {
        self.charge.account().alloc_copy(self.tag(), &self.data)
    }

    /// Copy into a new buffer with a different tag
    pub fn try_copy_as(&self, tag: MemTag) -> Result<Buffer> {
        self.charge.account().alloc_copy(tag, &self.data)
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("tag", &self.tag())
            .field("len", &self.data.len())
            .finish()
    }
}

/// Accounted buffer with a guaranteed start alignment (for direct I/O)
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
    _charge: Charge,
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Alignment of the start of the buffer
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() >= len bytes and zero-initialised.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in alloc_aligned with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("align", &self.layout.align())
            .finish()
    }
}
