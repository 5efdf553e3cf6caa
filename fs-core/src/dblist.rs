//! Deferred directory-block list
//!
//! Directory blocks found during the inode scan are queued here and processed
//! in block order by a later pass. Workers each collect their own list; the
//! lists are concatenated when a clone is released.

use std::fmt;

use crate::error::Result;
use crate::handle::HandleId;
use crate::mem::{reserve_charged, Charge, MemAccount, MemTag};

/// One directory block awaiting processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirBlock {
    /// Directory inode
    pub ino: u32,
    /// Physical block number
    pub block: u64,
    /// Logical block index within the directory
    pub blockcnt: i64,
}

/// List of directory blocks with a back-reference to the owning handle
pub struct DirBlockList {
    entries: Vec<DirBlock>,
    sorted: bool,
    charge: Charge,
    owner: HandleId,
}

impl DirBlockList {
    /// Create an empty list owned by `owner`
    pub fn new(account: &MemAccount, owner: HandleId) -> Result<Self> {
        Ok(Self {
            entries: Vec::new(),
            sorted: true,
            charge: account.charge(MemTag::DirBlocks, 0)?,
            owner,
        })
    }

    /// Queue a directory block
    pub fn add(&mut self, ino: u32, block: u64, blockcnt: i64) -> Result<()> {
        reserve_charged(&mut self.entries, &mut self.charge, 1)?;
        if let Some(last) = self.entries.last() {
            if last.block > block {
                self.sorted = false;
            }
        }
        self.entries.push(DirBlock { ino, block, blockcnt });
        Ok(())
    }

    /// Number of queued blocks
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued entries in their current order
    pub fn iter(&self) -> impl Iterator<Item = &DirBlock> + '_ {
        self.entries.iter()
    }

    /// Sort by physical block, then directory inode, then logical index
    pub fn sort(&mut self) {
        if !self.sorted {
            self.entries
                .sort_unstable_by_key(|e| (e.block, e.ino, e.blockcnt));
            self.sorted = true;
        }
    }

    /// Whether the list is known to be in block order
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Independent copy drawn from the same account, owned by the same handle
    pub fn try_copy(&self) -> Result<DirBlockList> {
        let mut charge = self.charge.account().charge(MemTag::DirBlocks, 0)?;
        let mut entries = Vec::new();
        reserve_charged(&mut entries, &mut charge, self.entries.len())?;
        entries.extend_from_slice(&self.entries);
        Ok(DirBlockList {
            entries,
            sorted: self.sorted,
            charge,
            owner: self.owner,
        })
    }

    /// Append every entry of `src` to this list, consuming it
    pub fn merge_from(&mut self, src: DirBlockList) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        reserve_charged(&mut self.entries, &mut self.charge, src.entries.len())?;
        self.entries.extend_from_slice(&src.entries);
        self.sorted = false;
        Ok(())
    }

    /// Handle this list currently belongs to
    pub fn owner(&self) -> HandleId {
        self.owner
    }

    /// Re-stamp the owning handle
    pub fn set_owner(&mut self, owner: HandleId) {
        self.owner = owner;
    }
}

impl fmt::Debug for DirBlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirBlockList")
            .field("len", &self.entries.len())
            .field("sorted", &self.sorted)
            .field("owner", &self.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_sort() {
        let account = MemAccount::new();
        let mut list = DirBlockList::new(&account, HandleId::from_raw(1)).unwrap();
        list.add(12, 500, 0).unwrap();
        assert!(list.is_sorted());
        list.add(12, 200, 1).unwrap();
        assert!(!list.is_sorted());

        list.sort();
        let blocks: Vec<u64> = list.iter().map(|e| e.block).collect();
        assert_eq!(blocks, vec![200, 500]);
    }

    #[test]
    fn test_merge_appends_all_entries() {
        let account = MemAccount::new();
        let mut dest = DirBlockList::new(&account, HandleId::from_raw(1)).unwrap();
        let mut src = DirBlockList::new(&account, HandleId::from_raw(2)).unwrap();
        dest.add(2, 10, 0).unwrap();
        src.add(3, 11, 0).unwrap();
        src.add(3, 12, 1).unwrap();

        dest.merge_from(src).unwrap();
        assert_eq!(dest.len(), 3);
        assert_eq!(dest.owner(), HandleId::from_raw(1));
    }

    #[test]
    fn test_copy_keeps_owner_until_restamped() {
        let account = MemAccount::new();
        let mut list = DirBlockList::new(&account, HandleId::from_raw(1)).unwrap();
        list.add(2, 10, 0).unwrap();

        let mut copy = list.try_copy().unwrap();
        assert_eq!(copy.owner(), HandleId::from_raw(1));
        copy.set_owner(HandleId::from_raw(7));
        copy.add(2, 11, 1).unwrap();

        assert_eq!(list.len(), 1);
        assert_eq!(copy.owner(), HandleId::from_raw(7));
    }
}
