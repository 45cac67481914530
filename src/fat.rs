//! FAT (File Allocation Table) chain management
//!
//! The FAT maps each sector number to the next sector in its chain, enabling
//! variable-length streams to be stored in the compound file. The MiniFAT uses
//! the same table layout at mini-sector granularity, so the table itself
//! ([`AllocationTable`]) and the chain algorithms ([`ChainAllocator`]) are shared;
//! only slot creation and release differ between the two allocators.
//!
//! # Implementation Notes
//!
//! - Regular sectors use positive chain values
//! - FAT sectors are marked with FATSECT (0xFFFFFFFD)
//! - DIFAT sectors are marked with DIFSECT (0xFFFFFFFC)
//! - End of chain is marked with ENDOFCHAIN (0xFFFFFFFE)
//! - Free sectors are marked with FREESECT (0xFFFFFFFF)
//!
//! Chain resolution never trusts the table: every hop is bounds-checked against
//! the slot count and a visited set, so a cyclic chain is reported as a
//! corrupted file after at most `slot_count` hops.

use crate::binary::write_u32_sectors;
use crate::consts::*;
use crate::error::{Error, Result};
use crate::sector::SectorStore;
use fixedbitset::FixedBitSet;
use std::collections::BTreeSet;

/// An allocation table: one `u32` slot per sector (or mini sector).
#[derive(Debug, Clone, Default)]
pub(crate) struct AllocationTable {
    entries: Vec<u32>,
    /// Free slots below the allocated slot count, lowest first
    free: BTreeSet<u32>,
    recycle: bool,
}

impl AllocationTable {
    pub fn new(recycle: bool) -> Self {
        Self {
            entries: Vec::new(),
            free: BTreeSet::new(),
            recycle,
        }
    }

    /// Build a table from loaded entries
    ///
    /// Only slots below `slot_count` are real; free slots among them become
    /// candidates for recycling.
    pub fn from_entries(mut entries: Vec<u32>, slot_count: usize, recycle: bool) -> Self {
        if entries.len() < slot_count {
            entries.resize(slot_count, FREESECT);
        }
        let free = entries[..slot_count]
            .iter()
            .enumerate()
            .filter(|&(_, &value)| value == FREESECT)
            .map(|(id, _)| id as u32)
            .collect();
        Self {
            entries,
            free,
            recycle,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, id: u32) -> u32 {
        self.entries.get(id as usize).copied().unwrap_or(FREESECT)
    }

    /// Set a slot, growing the table with free slots if necessary
    pub fn set(&mut self, id: u32, value: u32) {
        let idx = id as usize;
        if idx >= self.entries.len() {
            self.entries.resize(idx + 1, FREESECT);
        }
        self.entries[idx] = value;
        if value == FREESECT {
            self.free.insert(id);
        } else {
            self.free.remove(&id);
        }
    }

    /// Drop all slots from `len` onwards
    pub fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
        let _ = self.free.split_off(&(len as u32));
    }

    /// Take the lowest free slot when recycling is enabled
    pub fn take_free(&mut self) -> Option<u32> {
        if !self.recycle {
            return None;
        }
        self.free.pop_first()
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Follow a chain from `start`, validating every hop
    ///
    /// `slot_count` is the number of slots that physically exist; any hop at or
    /// beyond it, any revisited slot and any special marker in the middle of a
    /// chain is reported as corruption.
    pub fn resolve_chain(&self, start: u32, slot_count: u32) -> Result<Vec<u32>> {
        let mut chain = Vec::new();
        if start == ENDOFCHAIN {
            return Ok(chain);
        }

        let limit = slot_count.min(self.entries.len() as u32);
        let mut visited = FixedBitSet::with_capacity(limit as usize);
        let mut current = start;

        loop {
            if current >= limit {
                return Err(Error::corrupted(format!(
                    "chain starting at {start} references slot {current} at position {} \
                     beyond the {limit} allocated slots",
                    chain.len()
                )));
            }
            if visited.put(current as usize) {
                return Err(Error::corrupted(format!(
                    "cyclic chain starting at {start}: slot {current} revisited at position {}",
                    chain.len()
                )));
            }
            chain.push(current);

            match self.get(current) {
                ENDOFCHAIN => break,
                next @ (FREESECT | FATSECT | DIFSECT) => {
                    return Err(Error::corrupted(format!(
                        "chain starting at {start} hits marker 0x{next:08X} at slot {current}"
                    )));
                }
                next if next > MAXREGSECT => {
                    return Err(Error::corrupted(format!(
                        "chain starting at {start} has invalid link 0x{next:08X} at slot {current}"
                    )));
                }
                next => current = next,
            }
        }

        Ok(chain)
    }

    /// Serialize the table into `sector_count` sectors, padding with FREESECT
    pub fn to_sectors(&self, sector_size: usize, sector_count: usize) -> Vec<Vec<u8>> {
        write_u32_sectors(&self.entries, sector_size, sector_count)
    }
}

/// Chain operations over an allocation table.
///
/// Implementors decide how new slots come into existence and what happens
/// to released ones; growing, truncating and resolving chains is shared.
pub(crate) trait ChainAllocator {
    fn table(&self) -> &AllocationTable;

    fn table_mut(&mut self) -> &mut AllocationTable;

    /// Number of slots that physically exist
    fn slot_count(&self) -> u32;

    /// Produce a slot marked ENDOFCHAIN
    fn allocate_slot(&mut self) -> Result<u32>;

    /// Mark a slot free
    fn release_slot(&mut self, id: u32) -> Result<()>;

    fn resolve_chain(&self, start: u32) -> Result<Vec<u32>> {
        self.table().resolve_chain(start, self.slot_count())
    }

    /// Allocate a fresh chain of `count` slots, returning its head
    fn allocate_chain(&mut self, count: usize) -> Result<u32> {
        self.grow_chain(ENDOFCHAIN, count)
    }

    /// Append `additional` slots to the chain at `start`, returning the head
    fn grow_chain(&mut self, start: u32, additional: usize) -> Result<u32> {
        let chain = self.resolve_chain(start)?;
        let mut head = start;
        let mut tail = chain.last().copied();

        for _ in 0..additional {
            let id = self.allocate_slot()?;
            match tail {
                Some(prev) => self.table_mut().set(prev, id),
                None => head = id,
            }
            tail = Some(id);
        }

        if additional > 0 {
            tracing::trace!(start, head, additional, "grew chain");
        }
        Ok(head)
    }

    /// Keep the first `keep` slots of the chain at `start` and free the rest
    fn truncate_chain(&mut self, start: u32, keep: usize) -> Result<u32> {
        let chain = self.resolve_chain(start)?;
        if keep >= chain.len() {
            return Ok(start);
        }

        for &id in &chain[keep..] {
            self.release_slot(id)?;
        }
        tracing::trace!(start, keep, freed = chain.len() - keep, "truncated chain");

        if keep == 0 {
            return Ok(ENDOFCHAIN);
        }
        self.table_mut().set(chain[keep - 1], ENDOFCHAIN);
        Ok(start)
    }

    /// Grow or truncate the chain at `start` to exactly `count` slots
    fn resize_chain(&mut self, start: u32, count: usize) -> Result<u32> {
        let current = self.resolve_chain(start)?.len();
        if count > current {
            self.grow_chain(start, count - current)
        } else {
            self.truncate_chain(start, count)
        }
    }

    fn free_chain(&mut self, start: u32) -> Result<()> {
        self.truncate_chain(start, 0).map(|_| ())
    }
}

/// Regular-sector allocator: FAT slots backed by whole sectors.
pub(crate) struct SectorAllocator<'a> {
    pub fat: &'a mut AllocationTable,
    pub sectors: &'a mut SectorStore,
    pub erase: bool,
}

impl SectorAllocator<'_> {
    /// Allocate a sector reserved for FAT/DIFAT bookkeeping
    pub fn allocate_special(&mut self, marker: u32) -> Result<u32> {
        let id = self.allocate_slot()?;
        self.fat.set(id, marker);
        Ok(id)
    }
}

impl ChainAllocator for SectorAllocator<'_> {
    fn table(&self) -> &AllocationTable {
        self.fat
    }

    fn table_mut(&mut self) -> &mut AllocationTable {
        self.fat
    }

    fn slot_count(&self) -> u32 {
        self.sectors.len()
    }

    fn allocate_slot(&mut self) -> Result<u32> {
        let id = match self.fat.take_free() {
            Some(id) => id,
            None => self.sectors.push(),
        };
        self.fat.set(id, ENDOFCHAIN);
        Ok(id)
    }

    fn release_slot(&mut self, id: u32) -> Result<()> {
        self.fat.set(id, FREESECT);
        if self.erase {
            self.sectors.zero(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator_parts(recycle: bool) -> (AllocationTable, SectorStore) {
        (AllocationTable::new(recycle), SectorStore::in_memory(512))
    }

    #[test]
    fn test_allocate_chain() {
        let (mut fat, mut sectors) = allocator_parts(false);
        let mut alloc = SectorAllocator {
            fat: &mut fat,
            sectors: &mut sectors,
            erase: false,
        };

        let start = alloc.allocate_chain(2).unwrap();
        assert_eq!(start, 0);
        assert_eq!(alloc.slot_count(), 2);
        assert_eq!(alloc.resolve_chain(start).unwrap(), vec![0, 1]);

        // Check FAT entries
        assert_eq!(fat.get(0), 1); // First sector points to second
        assert_eq!(fat.get(1), ENDOFCHAIN); // Second sector is end
    }

    #[test]
    fn test_empty_chain() {
        let (mut fat, mut sectors) = allocator_parts(false);
        let mut alloc = SectorAllocator {
            fat: &mut fat,
            sectors: &mut sectors,
            erase: false,
        };
        assert_eq!(alloc.allocate_chain(0).unwrap(), ENDOFCHAIN);
        assert_eq!(alloc.slot_count(), 0);
    }

    #[test]
    fn test_grow_and_truncate() {
        let (mut fat, mut sectors) = allocator_parts(false);
        let mut alloc = SectorAllocator {
            fat: &mut fat,
            sectors: &mut sectors,
            erase: false,
        };

        let a = alloc.allocate_chain(2).unwrap();
        let b = alloc.allocate_chain(1).unwrap();
        let a = alloc.grow_chain(a, 2).unwrap();
        assert_eq!(alloc.resolve_chain(a).unwrap(), vec![0, 1, 3, 4]);
        assert_eq!(alloc.resolve_chain(b).unwrap(), vec![2]);

        let a = alloc.truncate_chain(a, 1).unwrap();
        assert_eq!(alloc.resolve_chain(a).unwrap(), vec![0]);
        assert_eq!(alloc.table().get(1), FREESECT);
        assert_eq!(alloc.table().get(4), FREESECT);

        assert_eq!(alloc.truncate_chain(a, 0).unwrap(), ENDOFCHAIN);
        assert_eq!(alloc.table().free_count(), 4);
    }

    #[test]
    fn test_recycle_reuses_lowest_free_sector() {
        let (mut fat, mut sectors) = allocator_parts(true);
        let mut alloc = SectorAllocator {
            fat: &mut fat,
            sectors: &mut sectors,
            erase: false,
        };
        let a = alloc.allocate_chain(3).unwrap();
        alloc.free_chain(a).unwrap();
        let b = alloc.allocate_chain(2).unwrap();
        assert_eq!(alloc.resolve_chain(b).unwrap(), vec![0, 1]);
        assert_eq!(alloc.slot_count(), 3);
    }

    #[test]
    fn test_without_recycle_file_grows() {
        let (mut fat, mut sectors) = allocator_parts(false);
        let mut alloc = SectorAllocator {
            fat: &mut fat,
            sectors: &mut sectors,
            erase: false,
        };
        let a = alloc.allocate_chain(3).unwrap();
        alloc.free_chain(a).unwrap();
        let b = alloc.allocate_chain(2).unwrap();
        assert_eq!(alloc.resolve_chain(b).unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_erase_zeroes_released_sectors() {
        let (mut fat, mut sectors) = allocator_parts(false);
        let mut alloc = SectorAllocator {
            fat: &mut fat,
            sectors: &mut sectors,
            erase: true,
        };
        let a = alloc.allocate_chain(1).unwrap();
        alloc.sectors.write_at(a, 0, &[0xAB; 512]).unwrap();
        alloc.free_chain(a).unwrap();
        assert!(sectors.read(a).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_cycle_detection() {
        let mut fat = AllocationTable::from_entries(vec![1, 2, 0], 3, false);
        let err = fat.resolve_chain(0, 3).unwrap_err();
        assert!(err.is_corrupted());
        assert!(err.to_string().contains("cyclic"));

        fat.set(2, 7);
        let err = fat.resolve_chain(0, 3).unwrap_err();
        assert!(err.to_string().contains("beyond"));

        fat.set(2, FREESECT);
        assert!(fat.resolve_chain(0, 3).is_err());

        fat.set(2, ENDOFCHAIN);
        assert_eq!(fat.resolve_chain(0, 3).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_special_sectors() {
        let (mut fat, mut sectors) = allocator_parts(false);
        let mut alloc = SectorAllocator {
            fat: &mut fat,
            sectors: &mut sectors,
            erase: false,
        };
        let id = alloc.allocate_special(FATSECT).unwrap();
        assert_eq!(fat.get(id), FATSECT);
        let sectors = fat.to_sectors(512, 1);
        assert_eq!(&sectors[0][0..4], &FATSECT.to_le_bytes());
        assert_eq!(&sectors[0][4..8], &FREESECT.to_le_bytes());
    }
}
