//! Shared I/O channel
//!
//! Every handle opened on a volume, and every duplicate or clone made from it,
//! holds one reference to the same channel. The channel is torn down when the
//! last reference goes away.

use std::fmt;
use std::sync::Arc;

use crate::blockdev::{BlockDevice, BlockDeviceError};
use crate::error::Result;

struct ChannelInner {
    name: String,
    device: Arc<dyn BlockDevice>,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        log::debug!("IO_CHANNEL: last reference to {} dropped, closing", self.name);
    }
}

/// Reference-counted I/O channel over a block device
#[derive(Clone)]
pub struct IoChannel {
    inner: Arc<ChannelInner>,
}

impl IoChannel {
    /// Open a channel named `name` over `device`
    pub fn new(name: impl Into<String>, device: Arc<dyn BlockDevice>) -> Self {
        let name = name.into();
        log::debug!(
            "IO_CHANNEL: opened {} ({} blocks of {} bytes)",
            name,
            device.block_count(),
            device.block_size()
        );
        Self {
            inner: Arc::new(ChannelInner { name, device }),
        }
    }

    /// Channel name (usually the device path)
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of live references to this channel
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether two channel references point at the same channel
    pub fn same_channel(&self, other: &IoChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The underlying device
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.inner.device
    }

    /// Device block size
    pub fn block_size(&self) -> usize {
        self.inner.device.block_size()
    }

    /// Read one device block
    pub async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        Ok(self.inner.device.read_block(block_num, buf).await?)
    }

    /// Write one device block
    pub async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        Ok(self.inner.device.write_block(block_num, data).await?)
    }

    /// Read `len` bytes starting at byte `offset`, spanning device blocks as needed
    pub async fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let block_size = self.block_size();
        let mut out = Vec::with_capacity(len);
        let mut block = vec![0u8; block_size];
        let mut pos = offset;
        while out.len() < len {
            let block_num = pos / block_size as u64;
            let within = (pos % block_size as u64) as usize;
            self.read_block(block_num, &mut block).await?;
            let take = (block_size - within).min(len - out.len());
            out.extend_from_slice(&block[within..within + take]);
            pos += take as u64;
        }
        Ok(out)
    }

    /// Write `data` starting at byte `offset` with read-modify-write of partial blocks
    pub async fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let block_size = self.block_size();
        let mut block = vec![0u8; block_size];
        let mut written = 0;
        let mut pos = offset;
        while written < data.len() {
            let block_num = pos / block_size as u64;
            let within = (pos % block_size as u64) as usize;
            let take = (block_size - within).min(data.len() - written);
            if take < block_size {
                self.read_block(block_num, &mut block).await?;
            }
            block[within..within + take].copy_from_slice(&data[written..written + take]);
            self.write_block(block_num, &block).await?;
            written += take;
            pos += take as u64;
        }
        Ok(())
    }

    /// Flush the device
    pub async fn sync(&self) -> std::result::Result<(), BlockDeviceError> {
        self.inner.device.sync().await
    }
}

impl fmt::Debug for IoChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoChannel")
            .field("name", &self.inner.name)
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;

    #[test]
    fn test_reference_counting() {
        let channel = IoChannel::new("mem0", Arc::new(MemoryBlockDevice::new(4, 1024)));
        assert_eq!(channel.ref_count(), 1);

        let second = channel.clone();
        assert_eq!(channel.ref_count(), 2);
        assert!(second.same_channel(&channel));

        drop(second);
        assert_eq!(channel.ref_count(), 1);
    }

    #[tokio::test]
    async fn test_byte_range_io_spans_blocks() {
        let channel = IoChannel::new("mem1", Arc::new(MemoryBlockDevice::new(4, 512)));
        let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();

        channel.write_bytes(300, &payload).await.unwrap();
        let back = channel.read_bytes(300, payload.len()).await.unwrap();
        assert_eq!(back, payload);

        // Bytes before the written range are untouched
        let head = channel.read_bytes(0, 300).await.unwrap();
        assert!(head.iter().all(|b| *b == 0));
    }
}
