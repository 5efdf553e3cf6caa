//! Bad-block list

use std::fmt;

use crate::error::Result;
use crate::mem::{reserve_charged, Charge, MemAccount, MemTag};

/// Sorted, de-duplicated list of bad block numbers
pub struct BadBlocksList {
    blocks: Vec<u64>,
    charge: Charge,
}

impl BadBlocksList {
    /// Create an empty list
    pub fn new(account: &MemAccount) -> Result<Self> {
        Ok(Self {
            blocks: Vec::new(),
            charge: account.charge(MemTag::BadBlocks, 0)?,
        })
    }

    /// Build a list from arbitrary block numbers
    pub fn from_blocks(account: &MemAccount, blocks: impl IntoIterator<Item = u64>) -> Result<Self> {
        let mut list = Self::new(account)?;
        for block in blocks {
            list.add(block)?;
        }
        Ok(list)
    }

    /// Add `block`; returns false if it was already listed
    pub fn add(&mut self, block: u64) -> Result<bool> {
        match self.blocks.binary_search(&block) {
            Ok(_) => Ok(false),
            Err(pos) => {
                reserve_charged(&mut self.blocks, &mut self.charge, 1)?;
                self.blocks.insert(pos, block);
                Ok(true)
            }
        }
    }

    /// Remove `block`; returns whether it was listed
    pub fn remove(&mut self, block: u64) -> bool {
        match self.blocks.binary_search(&block) {
            Ok(pos) => {
                self.blocks.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Whether `block` is listed
    pub fn contains(&self, block: u64) -> bool {
        self.blocks.binary_search(&block).is_ok()
    }

    /// Number of listed blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Listed blocks in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.blocks.iter().copied()
    }

    /// Independent copy drawn from the same account
    pub fn try_copy(&self) -> Result<BadBlocksList> {
        let mut charge = self.charge.account().charge(MemTag::BadBlocks, 0)?;
        let mut blocks = Vec::new();
        reserve_charged(&mut blocks, &mut charge, self.blocks.len())?;
        blocks.extend_from_slice(&self.blocks);
        Ok(BadBlocksList { blocks, charge })
    }

    /// Union `src` into this list
    pub fn merge_from(&mut self, src: &BadBlocksList) -> Result<()> {
        let mut merged = Vec::new();
        let mut charge = self.charge.account().charge(MemTag::BadBlocks, 0)?;
        reserve_charged(&mut merged, &mut charge, self.blocks.len() + src.blocks.len())?;

        let (mut a, mut b) = (self.blocks.iter().peekable(), src.blocks.iter().peekable());
        loop {
            let next = match (a.peek(), b.peek()) {
                (Some(&&x), Some(&&y)) if x < y => a.next(),
                (Some(&&x), Some(&&y)) if x > y => b.next(),
                (Some(_), Some(_)) => {
                    b.next();
                    a.next()
                }
                (Some(_), None) => a.next(),
                (None, Some(_)) => b.next(),
                (None, None) => break,
            };
            if let Some(&block) = next {
                merged.push(block);
            }
        }

        self.blocks = merged;
        self.charge = charge;
        Ok(())
    }
}

impl fmt::Debug for BadBlocksList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BadBlocksList")
            .field("len", &self.blocks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_and_deduplicated() {
        let account = MemAccount::new();
        let mut list = BadBlocksList::from_blocks(&account, [30, 10, 20, 10]).unwrap();
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![10, 20, 30]);
        assert!(!list.add(20).unwrap());
        assert!(list.remove(20));
        assert!(!list.contains(20));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_merge_union() {
        let account = MemAccount::new();
        let mut dest = BadBlocksList::from_blocks(&account, [1, 3, 5]).unwrap();
        let src = BadBlocksList::from_blocks(&account, [2, 3, 6, 9]).unwrap();
        dest.merge_from(&src).unwrap();
        assert_eq!(dest.iter().collect::<Vec<_>>(), vec![1, 2, 3, 5, 6, 9]);
        // Source is left intact
        assert_eq!(src.len(), 4);
    }

    #[test]
    fn test_copy_failure_leaves_no_charge() {
        let account = MemAccount::new();
        let list = BadBlocksList::from_blocks(&account, [4, 8]).unwrap();
        let before = account.live_bytes();

        account.fail_next(MemTag::BadBlocks);
        assert!(list.try_copy().unwrap_err().is_out_of_memory());
        assert_eq!(account.live_bytes(), before);

        let copy = list.try_copy().unwrap();
        assert_eq!(copy.iter().collect::<Vec<_>>(), vec![4, 8]);
    }
}
