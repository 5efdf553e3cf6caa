//! Superblock blob and the few fields the handle reads from it
//!
//! Full parsing and validation belong to the open path; this module only
//! reads the geometry needed to size the group descriptor table and bitmaps.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::io_channel::IoChannel;
use crate::mem::{Buffer, MemAccount, MemTag};

/// Size of the on-disk superblock
pub const SUPERBLOCK_SIZE: usize = 1024;
/// Byte offset of the primary superblock
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// ext2 superblock magic
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;
/// Size of one group descriptor
pub const GROUP_DESC_SIZE: u32 = 32;

/// Largest supported `log_block_size` (64KiB blocks)
const MAX_LOG_BLOCK_SIZE: u32 = 6;

// Field offsets
const S_INODES_COUNT: usize = 0;
const S_BLOCKS_COUNT: usize = 4;
const S_FREE_BLOCKS_COUNT: usize = 12;
const S_FREE_INODES_COUNT: usize = 16;
const S_FIRST_DATA_BLOCK: usize = 20;
const S_LOG_BLOCK_SIZE: usize = 24;
const S_BLOCKS_PER_GROUP: usize = 32;
const S_INODES_PER_GROUP: usize = 40;
const S_MAGIC: usize = 56;
const S_STATE: usize = 58;

/// Superblock copy held by a handle
#[derive(Debug)]
pub struct Superblock {
    raw: Buffer,
}

impl Superblock {
    /// Copy and sanity-check a raw superblock
    pub fn from_bytes(account: &MemAccount, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SUPERBLOCK_SIZE {
            return Err(Error::InvalidSuperblock(format!(
                "expected {} bytes, got {}",
                SUPERBLOCK_SIZE,
                bytes.len()
            )));
        }
        let magic = LittleEndian::read_u16(&bytes[S_MAGIC..]);
        if magic != EXT2_SUPER_MAGIC {
            return Err(Error::InvalidSuperblock(format!("bad magic {:#06x}", magic)));
        }
        let sb = Self {
            raw: account.alloc_copy(MemTag::Superblock, bytes)?,
        };
        sb.check_geometry()?;
        Ok(sb)
    }

    fn check_geometry(&self) -> Result<()> {
        if self.log_block_size() > MAX_LOG_BLOCK_SIZE {
            return Err(Error::InvalidSuperblock(format!(
                "log_block_size {} too large",
                self.log_block_size()
            )));
        }
        if self.blocks_per_group() == 0 || self.inodes_per_group() == 0 {
            return Err(Error::InvalidSuperblock("zero blocks or inodes per group".into()));
        }
        if self.blocks_count() <= self.first_data_block() {
            return Err(Error::InvalidSuperblock(format!(
                "blocks_count {} does not exceed first_data_block {}",
                self.blocks_count(),
                self.first_data_block()
            )));
        }
        Ok(())
    }

    /// Independent copy tagged as `tag`
    pub fn try_copy_as(&self, tag: MemTag) -> Result<Superblock> {
        Ok(Self {
            raw: self.raw.try_copy_as(tag)?,
        })
    }

    fn u32_at(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(&self.raw[offset..])
    }

    /// Total inodes
    pub fn inodes_count(&self) -> u32 {
        self.u32_at(S_INODES_COUNT)
    }

    /// Total blocks
    pub fn blocks_count(&self) -> u32 {
        self.u32_at(S_BLOCKS_COUNT)
    }

    /// Free blocks
    pub fn free_blocks_count(&self) -> u32 {
        self.u32_at(S_FREE_BLOCKS_COUNT)
    }

    /// Free inodes
    pub fn free_inodes_count(&self) -> u32 {
        self.u32_at(S_FREE_INODES_COUNT)
    }

    /// Update the free block count
    pub fn set_free_blocks_count(&mut self, count: u32) {
        LittleEndian::write_u32(&mut self.raw[S_FREE_BLOCKS_COUNT..], count);
    }

    /// Update the free inode count
    pub fn set_free_inodes_count(&mut self, count: u32) {
        LittleEndian::write_u32(&mut self.raw[S_FREE_INODES_COUNT..], count);
    }

    /// First data block (1 for 1KiB blocks, 0 otherwise)
    pub fn first_data_block(&self) -> u32 {
        self.u32_at(S_FIRST_DATA_BLOCK)
    }

    /// Block size as a shift of 1024
    pub fn log_block_size(&self) -> u32 {
        self.u32_at(S_LOG_BLOCK_SIZE)
    }

    /// Block size in bytes
    pub fn block_size(&self) -> u32 {
        1024 << self.log_block_size()
    }

    /// Blocks per group
    pub fn blocks_per_group(&self) -> u32 {
        self.u32_at(S_BLOCKS_PER_GROUP)
    }

    /// Inodes per group
    pub fn inodes_per_group(&self) -> u32 {
        self.u32_at(S_INODES_PER_GROUP)
    }

    /// Mount state
    pub fn state(&self) -> u16 {
        LittleEndian::read_u16(&self.raw[S_STATE..])
    }

    /// Number of block groups
    pub fn group_count(&self) -> u32 {
        let data_blocks = self.blocks_count() - self.first_data_block();
        data_blocks.div_ceil(self.blocks_per_group())
    }

    /// Blocks occupied by the group descriptor table
    pub fn desc_blocks(&self) -> u32 {
        let per_block = self.block_size() / GROUP_DESC_SIZE;
        self.group_count().div_ceil(per_block)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

/// Geometry used to synthesise a superblock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Total blocks
    pub blocks_count: u32,
    /// Total inodes
    pub inodes_count: u32,
    /// Block size as a shift of 1024
    pub log_block_size: u32,
    /// Blocks per group
    pub blocks_per_group: u32,
    /// Inodes per group
    pub inodes_per_group: u32,
}

impl Geometry {
    /// Geometry of a small volume with 1KiB blocks
    pub fn small(blocks_count: u32, inodes_count: u32) -> Self {
        Self {
            blocks_count,
            inodes_count,
            log_block_size: 0,
            blocks_per_group: 8192,
            inodes_per_group: inodes_count.min(2048).max(1),
        }
    }

    /// First data block implied by the block size
    pub fn first_data_block(&self) -> u32 {
        if self.log_block_size == 0 {
            1
        } else {
            0
        }
    }

    /// Encode a clean, empty superblock with this geometry
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = vec![0u8; SUPERBLOCK_SIZE];
        LittleEndian::write_u32(&mut raw[S_INODES_COUNT..], self.inodes_count);
        LittleEndian::write_u32(&mut raw[S_BLOCKS_COUNT..], self.blocks_count);
        LittleEndian::write_u32(&mut raw[S_FREE_BLOCKS_COUNT..], self.blocks_count);
        LittleEndian::write_u32(&mut raw[S_FREE_INODES_COUNT..], self.inodes_count);
        LittleEndian::write_u32(&mut raw[S_FIRST_DATA_BLOCK..], self.first_data_block());
        LittleEndian::write_u32(&mut raw[S_LOG_BLOCK_SIZE..], self.log_block_size);
        LittleEndian::write_u32(&mut raw[S_BLOCKS_PER_GROUP..], self.blocks_per_group);
        LittleEndian::write_u32(&mut raw[S_INODES_PER_GROUP..], self.inodes_per_group);
        LittleEndian::write_u16(&mut raw[S_MAGIC..], EXT2_SUPER_MAGIC);
        LittleEndian::write_u16(&mut raw[S_STATE..], 1);
        raw
    }
}

/// Read the primary superblock through `io`
pub async fn read_superblock(io: &IoChannel) -> Result<Vec<u8>> {
    io.read_bytes(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE).await
}

/// Write a raw superblock to the primary location through `io`
pub async fn write_superblock(io: &IoChannel, raw: &[u8]) -> Result<()> {
    io.write_bytes(SUPERBLOCK_OFFSET, raw).await
}
