//! Inode and block usage bitmaps
//!
//! A bitmap covers the inclusive range `[start, end]` of inode or block
//! numbers and carries a back-reference to the handle that currently owns it.
//! Copying and merging are the two operations the handle lifecycle relies on:
//! a clone gets a private copy, and on release the copy is unioned back into
//! the origin's bitmap.

use std::fmt;

use crate::error::{Error, Result};
use crate::handle::HandleId;
use crate::mem::{Buffer, MemAccount, MemTag};

/// What a bitmap tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitmapKind {
    /// Inode usage
    Inode,
    /// Block usage
    Block,
}

impl BitmapKind {
    fn tag(self) -> MemTag {
        match self {
            BitmapKind::Inode => MemTag::InodeBitmap,
            BitmapKind::Block => MemTag::BlockBitmap,
        }
    }

    fn name(self) -> &'static str {
        match self {
            BitmapKind::Inode => "inode",
            BitmapKind::Block => "block",
        }
    }
}

/// Usage bitmap over an inclusive range of numbers
pub struct Bitmap {
    kind: BitmapKind,
    start: u64,
    end: u64,
    bits: Buffer,
    set_count: u64,
    owner: HandleId,
}

impl Bitmap {
    /// Create an all-clear bitmap covering `start..=end`
    pub fn new(
        account: &MemAccount,
        kind: BitmapKind,
        start: u64,
        end: u64,
        owner: HandleId,
    ) -> Result<Self> {
        let end = end.max(start);
        let nbits = end - start + 1;
        let bits = account.alloc_zeroed(kind.tag(), ((nbits + 7) / 8) as usize)?;
        Ok(Self {
            kind,
            start,
            end,
            bits,
            set_count: 0,
            owner,
        })
    }

    fn locate(&self, bit: u64) -> Result<(usize, u8)> {
        if bit < self.start || bit > self.end {
            return Err(Error::BitOutOfRange {
                kind: self.kind.name(),
                bit,
                start: self.start,
                end: self.end,
            });
        }
        let rel = bit - self.start;
        Ok(((rel / 8) as usize, (rel % 8) as u8))
    }

    /// Set `bit`; returns whether it was already set
    pub fn mark(&mut self, bit: u64) -> Result<bool> {
        let (byte_idx, shift) = self.locate(bit)?;
        let was_set = self.bits[byte_idx] & (1 << shift) != 0;
        if !was_set {
            self.bits[byte_idx] |= 1 << shift;
            self.set_count += 1;
        }
        Ok(was_set)
    }

    /// Clear `bit`; returns whether it was set
    pub fn unmark(&mut self, bit: u64) -> Result<bool> {
        let (byte_idx, shift) = self.locate(bit)?;
        let was_set = self.bits[byte_idx] & (1 << shift) != 0;
        if was_set {
            self.bits[byte_idx] &= !(1 << shift);
            self.set_count -= 1;
        }
        Ok(was_set)
    }

    /// Whether `bit` is set; bits outside the range read as clear
    pub fn test(&self, bit: u64) -> bool {
        match self.locate(bit) {
            Ok((byte_idx, shift)) => self.bits[byte_idx] & (1 << shift) != 0,
            Err(_) => false,
        }
    }

    /// Number of set bits
    pub fn count_set(&self) -> u64 {
        self.set_count
    }

    /// Iterate over set bits in ascending order
    pub fn iter_set(&self) -> impl Iterator<Item = u64> + '_ {
        let start = self.start;
        self.bits.iter().enumerate().flat_map(move |(byte_idx, &byte)| {
            (0..8u64)
                .filter(move |shift| byte & (1 << shift) != 0)
                .map(move |shift| start + byte_idx as u64 * 8 + shift)
        })
    }

    /// Clear every bit
    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.set_count = 0;
    }

    /// Independent copy drawn from the same account, owned by the same handle
    pub fn try_copy(&self) -> Result<Bitmap> {
        Ok(Bitmap {
            kind: self.kind,
            start: self.start,
            end: self.end,
            bits: self.bits.try_copy()?,
            set_count: self.set_count,
            owner: self.owner,
        })
    }

    /// Union `src` into this bitmap, consuming it
    pub fn merge_from(&mut self, src: Bitmap) -> Result<()> {
        if src.kind != self.kind || src.start != self.start || src.end != self.end {
            return Err(Error::BitmapMismatch {
                kind: self.kind.name(),
                src_start: src.start,
                src_end: src.end,
                dest_start: self.start,
                dest_end: self.end,
            });
        }
        for (dest, s) in self.bits.iter_mut().zip(src.bits.iter()) {
            *dest |= *s;
        }
        self.set_count = self.bits.iter().map(|b| b.count_ones() as u64).sum();
        Ok(())
    }

    /// Handle this bitmap currently belongs to
    pub fn owner(&self) -> HandleId {
        self.owner
    }

    /// Re-stamp the owning handle
    pub fn set_owner(&mut self, owner: HandleId) {
        self.owner = owner;
    }

    /// What the bitmap tracks
    pub fn kind(&self) -> BitmapKind {
        self.kind
    }

    /// First tracked number
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Last tracked number
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Raw bitmap bytes, bit 0 of byte 0 is `start`
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// CRC32 of the raw bitmap bytes, for cheap equality checks in logs
    pub fn crc32(&self) -> u32 {
        crc32fast::hash(&self.bits)
    }
}

impl PartialEq for Bitmap {
    /// Equal when they track the same range with the same bits set; owners are ignored
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.start == other.start
            && self.end == other.end
            && self.bits[..] == other.bits[..]
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("kind", &self.kind)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("set", &self.set_count)
            .field("owner", &self.owner)
            .finish()
    }
}
