//! Block devices behind an I/O channel

mod blockdev_trait;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

pub use self::blockdev_trait::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};
use self::blockdev_trait::check_request;

/// A block device held entirely in memory
#[derive(Debug)]
pub struct MemoryBlockDevice {
    data: RwLock<Vec<u8>>,
    block_size: usize,
    block_count: u64,
    read_only: bool,
    closed: AtomicBool,
}

impl MemoryBlockDevice {
    /// Create a zero-filled device of `block_count` blocks
    pub fn new(block_count: u64, block_size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; block_count as usize * block_size]),
            block_size,
            block_count,
            read_only: false,
            closed: AtomicBool::new(false),
        }
    }

    /// Wrap an existing image; trailing bytes that do not fill a block are ignored
    pub fn from_image(image: Vec<u8>, block_size: usize, read_only: bool) -> Self {
        let block_count = (image.len() / block_size) as u64;
        Self {
            data: RwLock::new(image),
            block_size,
            block_count,
            read_only,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BlockDeviceError::DeviceClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl BlockDevice for MemoryBlockDevice {
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        check_request(block_num, buf.len(), self.block_count, self.block_size)?;
        let offset = block_num as usize * self.block_size;
        buf.copy_from_slice(&self.data.read()[offset..offset + self.block_size]);
        Ok(())
    }

    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_request(block_num, data.len(), self.block_count, self.block_size)?;
        let offset = block_num as usize * self.block_size;
        self.data.write()[offset..offset + self.block_size].copy_from_slice(data);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    async fn sync(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(BlockDeviceError::DeviceClosed);
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// A block device that is backed by a file on the filesystem
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<Option<File>>,
    path: PathBuf,
    size: u64,
    block_size: usize,
    block_count: u64,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create (or truncate) an image file of `size` bytes
    pub async fn create(path: impl AsRef<Path>, size: u64, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        file.set_len(size).await?;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size,
            block_size,
            block_count: size / block_size as u64,
            read_only: false,
        })
    }

    /// Open an existing image file or block device
    pub async fn open(path: impl AsRef<Path>, block_size: usize, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .await?;

        let size = Self::device_size(&path)?;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size,
            block_size,
            block_count: size / block_size as u64,
            read_only,
        })
    }

    /// Size in bytes of a regular file or block device
    #[cfg(unix)]
    fn device_size(path: &Path) -> Result<u64> {
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::io::AsRawFd;

        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_block_device() {
            return Ok(metadata.len());
        }

        let file = std::fs::File::open(path)?;

        // BLKGETSIZE64 = 0x80081272 on Linux
        const BLKGETSIZE64: libc::c_ulong = 0x80081272;

        let mut size: u64 = 0;
        let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size as *mut u64) };
        if result == -1 {
            return Err(BlockDeviceError::Io(std::io::Error::last_os_error()));
        }

        Ok(size)
    }

    #[cfg(not(unix))]
    fn device_size(path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the total size of the device in bytes
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[async_trait]
impl BlockDevice for FileBackedBlockDevice {
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        check_request(block_num, buf.len(), self.block_count, self.block_size)?;

        let offset = block_num * self.block_size as u64;
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(buf).await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_request(block_num, data.len(), self.block_count, self.block_size)?;

        let offset = block_num * self.block_size as u64;
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            file.flush().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    async fn sync(&self) -> Result<()> {
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.sync_all().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn close(&self) -> Result<()> {
        let mut file_guard = self.file.lock().await;

        if file_guard.take().is_some() {
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_device_read_write() {
        let device = MemoryBlockDevice::new(8, 1024);

        let data = [0x5Au8; 1024];
        device.write_block(3, &data).await.unwrap();

        let mut buf = [0u8; 1024];
        device.read_block(3, &mut buf).await.unwrap();
        assert_eq!(buf, data);

        device.read_block(2, &mut buf).await.unwrap();
        assert!(buf.iter().all(|b| *b == 0));

        assert!(matches!(
            device.read_block(8, &mut buf).await,
            Err(BlockDeviceError::InvalidBlockNumber(8))
        ));
        assert!(matches!(
            device.write_block(0, &[0u8; 512]).await,
            Err(BlockDeviceError::InvalidBlockSize { got: 512, expected: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_memory_device_close() {
        let device = MemoryBlockDevice::new(1, 1024);
        device.close().await.unwrap();
        let mut buf = [0u8; 1024];
        assert!(matches!(
            device.read_block(0, &mut buf).await,
            Err(BlockDeviceError::DeviceClosed)
        ));
        assert!(device.close().await.is_err());
    }

    #[tokio::test]
    async fn test_file_device_operations() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_device.img");

        let device = FileBackedBlockDevice::create(&file_path, 4096 * 8, 4096)
            .await
            .unwrap();
        assert_eq!(device.block_count(), 8);

        for i in 0..8 {
            let data = [i as u8; 4096];
            device.write_block(i, &data).await.unwrap();

            let mut read_data = [0u8; 4096];
            device.read_block(i, &mut read_data).await.unwrap();
            assert_eq!(data, read_data);
        }
    }

    #[tokio::test]
    async fn test_file_device_read_only() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_read_only.img");

        let device = FileBackedBlockDevice::create(&file_path, 1024 * 4, 1024)
            .await
            .unwrap();
        device.write_block(1, &[0x55u8; 1024]).await.unwrap();
        device.close().await.unwrap();

        let read_only_device = FileBackedBlockDevice::open(&file_path, 1024, true).await.unwrap();

        let mut read_buf = [0u8; 1024];
        read_only_device.read_block(1, &mut read_buf).await.unwrap();
        assert_eq!(read_buf, [0x55u8; 1024]);

        let write_result = read_only_device.write_block(0, &[0u8; 1024]).await;
        assert!(matches!(write_result, Err(BlockDeviceError::ReadOnly)));
    }
}
