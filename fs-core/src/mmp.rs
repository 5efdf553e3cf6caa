//! Multi-mount protection state
//!
//! A handle that has MMP enabled keeps a copy of the MMP block, a descriptor
//! opened for direct I/O on the device, and a comparison buffer aligned for
//! direct I/O on that descriptor.

use std::io;

#[cfg(unix)]
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use crate::error::{Error, Result};
use crate::mem::{AlignedBuffer, Buffer, MemAccount, MemTag};

/// Alignment used when neither the device nor the OS reports one
pub const DEFAULT_DIO_ALIGNMENT: usize = 4096;

/// Multi-mount protection buffers and descriptor
#[derive(Debug)]
pub struct Mmp {
    buf: Option<Buffer>,
    #[cfg(unix)]
    fd: Option<OwnedFd>,
    cmp: Option<AlignedBuffer>,
}

impl Mmp {
    /// Build MMP state from an optional MMP block and descriptor
    #[cfg(unix)]
    pub fn new(
        account: &MemAccount,
        block: Option<&[u8]>,
        fd: Option<OwnedFd>,
        compare_len: Option<usize>,
    ) -> Result<Self> {
        let buf = block
            .map(|b| account.alloc_copy(MemTag::MmpBuffer, b))
            .transpose()?;
        let cmp = match compare_len {
            Some(len) => {
                let align = dio_alignment(fd.as_ref().map(|f| f.as_fd()));
                Some(account.alloc_aligned(MemTag::MmpCompare, len, align)?)
            }
            None => None,
        };
        Ok(Self { buf, fd, cmp })
    }

    /// MMP block copy
    pub fn buffer(&self) -> Option<&[u8]> {
        self.buf.as_deref()
    }

    /// Direct-I/O comparison buffer
    pub fn compare_buffer(&self) -> Option<&AlignedBuffer> {
        self.cmp.as_ref()
    }

    /// Mutable direct-I/O comparison buffer
    pub fn compare_buffer_mut(&mut self) -> Option<&mut AlignedBuffer> {
        self.cmp.as_mut()
    }

    /// Direct-I/O descriptor
    #[cfg(unix)]
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|f| f.as_fd())
    }

    /// Fully independent copy: buffers are copied and the descriptor is duplicated
    pub(crate) fn try_duplicate(&self, account: &MemAccount) -> Result<Mmp> {
        let buf = match &self.buf {
            Some(src) => Some(account.alloc_copy(MemTag::MmpBuffer, src)?),
            None => None,
        };

        #[cfg(unix)]
        let fd = match &self.fd {
            Some(src) => Some(dup_fd(src.as_fd()).map_err(Error::MmpOpenDirect)?),
            None => None,
        };

        let cmp = match &self.cmp {
            Some(src) => {
                #[cfg(unix)]
                let align = dio_alignment(self.fd());
                #[cfg(not(unix))]
                let align = dio_alignment();
                let mut copy = account.alloc_aligned(MemTag::MmpCompare, src.len(), align)?;
                copy.copy_from_slice(src);
                Some(copy)
            }
            None => None,
        };

        Ok(Mmp {
            buf,
            #[cfg(unix)]
            fd,
            cmp,
        })
    }
}

#[cfg(unix)]
fn dup_fd(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    // SAFETY: dup has no memory-safety preconditions; the result is checked.
    let raw = unsafe { libc::dup(fd.as_raw_fd()) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: raw is a freshly duplicated descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

#[cfg(target_os = "linux")]
fn logical_sector_size(fd: BorrowedFd<'_>) -> Option<usize> {
    const BLKSSZGET: libc::c_ulong = 0x1268;
    let mut size: libc::c_int = 0;
    // SAFETY: BLKSSZGET writes one c_int through the pointer.
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), BLKSSZGET as _, &mut size as *mut libc::c_int) };
    (rc == 0 && size > 0).then_some(size as usize)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn logical_sector_size(_fd: BorrowedFd<'_>) -> Option<usize> {
    None
}

/// Buffer alignment required for direct I/O on `fd`
///
/// Uses the device's logical sector size when `fd` is a block device,
/// otherwise the page size.
#[cfg(unix)]
pub fn dio_alignment(fd: Option<BorrowedFd<'_>>) -> usize {
    if let Some(size) = fd.and_then(logical_sector_size) {
        return size;
    }
    // SAFETY: sysconf has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        page as usize
    } else {
        DEFAULT_DIO_ALIGNMENT
    }
}

/// Buffer alignment required for direct I/O
#[cfg(not(unix))]
pub fn dio_alignment() -> usize {
    DEFAULT_DIO_ALIGNMENT
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_is_power_of_two() {
        let align = dio_alignment(None);
        assert!(align.is_power_of_two());
        assert!(align >= 512);

        let file = tempfile::tempfile().unwrap();
        let align = dio_alignment(Some(file.as_fd()));
        assert!(align.is_power_of_two());
    }

    #[test]
    fn test_duplicate_copies_buffers_and_descriptor() {
        let account = MemAccount::new();
        let file = tempfile::tempfile().unwrap();
        let fd: OwnedFd = file.into();

        let mut mmp = Mmp::new(&account, Some(&[7u8; 1024]), Some(fd), Some(1024)).unwrap();
        mmp.compare_buffer_mut().unwrap()[0] = 9;

        let dup = mmp.try_duplicate(&account).unwrap();
        assert_eq!(dup.buffer(), mmp.buffer());
        assert_eq!(dup.compare_buffer().unwrap()[0], 9);
        assert_ne!(
            dup.fd().unwrap().as_raw_fd(),
            mmp.fd().unwrap().as_raw_fd()
        );
        assert_eq!(account.live_allocations(), 4);

        drop(dup);
        drop(mmp);
        assert_eq!(account.live_bytes(), 0);
    }

    #[test]
    fn test_duplicate_failure_releases_partial_copy() {
        let account = MemAccount::new();
        let mmp = Mmp::new(&account, Some(&[1u8; 512]), None, Some(512)).unwrap();
        let before = account.live_bytes();

        account.fail_next(MemTag::MmpCompare);
        assert!(mmp.try_duplicate(&account).unwrap_err().is_out_of_memory());
        assert_eq!(account.live_bytes(), before);
    }
}
