//! MiniFAT and mini stream
//!
//! Streams smaller than the cutoff (4096 bytes) live in 64-byte mini sectors.
//! The mini sectors are packed into the mini stream, an ordinary FAT chain that
//! starts at the root entry; the MiniFAT links mini sectors into chains the same
//! way the FAT links sectors.
//!
//! # Implementation Notes
//!
//! - Mini sector `m` lives at byte `m * 64` of the mini stream
//! - Because 64 divides every sector size, a mini sector never straddles two sectors
//! - The root entry size is always `mini sector count * 64`

use crate::consts::*;
use crate::error::{Error, Result};
use crate::fat::{AllocationTable, ChainAllocator, SectorAllocator};
use crate::sector::SectorStore;

/// MiniFAT plus the resolved FAT chain of the mini stream.
#[derive(Debug, Clone, Default)]
pub(crate) struct MiniStream {
    pub table: AllocationTable,
    /// First sector of the mini stream, ENDOFCHAIN when empty
    pub start: u32,
    /// Sectors of the mini stream, in order
    pub chain: Vec<u32>,
}

impl MiniStream {
    pub fn new(recycle: bool) -> Self {
        Self {
            table: AllocationTable::new(recycle),
            start: ENDOFCHAIN,
            chain: Vec::new(),
        }
    }

    /// Rebuild the mini stream from the loaded MiniFAT and the root entry
    ///
    /// The MiniFAT is cut or padded to the number of mini sectors the root
    /// entry size actually covers.
    pub fn load(
        entries: Vec<u32>,
        start: u32,
        root_size: u64,
        chain: Vec<u32>,
        sector_size: usize,
        recycle: bool,
    ) -> Result<Self> {
        let capacity = root_size.div_ceil(MINI_SECTOR_SIZE as u64) as usize;
        let available = chain.len() * (sector_size / MINI_SECTOR_SIZE);
        if capacity > available {
            return Err(Error::corrupted(format!(
                "mini stream declares {root_size} bytes but its chain holds only {} sectors",
                chain.len()
            )));
        }

        let mut table = AllocationTable::from_entries(entries, capacity, recycle);
        table.truncate(capacity);
        Ok(Self {
            table,
            start: if chain.is_empty() { ENDOFCHAIN } else { start },
            chain,
        })
    }

    /// Number of mini sectors in the mini stream
    pub fn capacity(&self) -> usize {
        self.table.len()
    }

    /// Size of the mini stream as recorded in the root entry
    pub fn byte_size(&self) -> u64 {
        self.capacity() as u64 * MINI_SECTOR_SIZE as u64
    }

    /// Map a byte position inside the mini stream to (sector, offset)
    fn locate(&self, mini_id: u32, offset: usize, sector_size: usize) -> Result<(u32, usize)> {
        let position = mini_id as usize * MINI_SECTOR_SIZE + offset;
        let sector = self.chain.get(position / sector_size).copied().ok_or_else(|| {
            Error::corrupted(format!(
                "mini sector {mini_id} lies beyond the {} sectors of the mini stream",
                self.chain.len()
            ))
        })?;
        Ok((sector, position % sector_size))
    }

    pub fn read_at(
        &self,
        sectors: &mut SectorStore,
        mini_id: u32,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        let (sector, within) = self.locate(mini_id, offset, sectors.sector_size())?;
        sectors.read_at(sector, within, buf)
    }

    pub fn write_at(
        &self,
        sectors: &mut SectorStore,
        mini_id: u32,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        let (sector, within) = self.locate(mini_id, offset, sectors.sector_size())?;
        sectors.write_at(sector, within, data)
    }
}

/// Mini-sector allocator: MiniFAT slots backed by the mini stream, which
/// itself grows through the regular FAT.
pub(crate) struct MiniAllocator<'a> {
    pub mini: &'a mut MiniStream,
    pub fat: &'a mut AllocationTable,
    pub sectors: &'a mut SectorStore,
    pub erase: bool,
}

impl MiniAllocator<'_> {
    /// Extend the mini stream by one sector
    fn extend_stream(&mut self) -> Result<()> {
        let mut alloc = SectorAllocator {
            fat: &mut *self.fat,
            sectors: &mut *self.sectors,
            erase: self.erase,
        };
        let id = alloc.allocate_slot()?;
        match self.mini.chain.last() {
            Some(&last) => self.fat.set(last, id),
            None => self.mini.start = id,
        }
        self.mini.chain.push(id);
        tracing::trace!(sector = id, total = self.mini.chain.len(), "extended mini stream");
        Ok(())
    }
}

impl ChainAllocator for MiniAllocator<'_> {
    fn table(&self) -> &AllocationTable {
        &self.mini.table
    }

    fn table_mut(&mut self) -> &mut AllocationTable {
        &mut self.mini.table
    }

    fn slot_count(&self) -> u32 {
        self.mini.capacity() as u32
    }

    fn allocate_slot(&mut self) -> Result<u32> {
        let id = match self.mini.table.take_free() {
            Some(id) => id,
            None => {
                let id = self.mini.capacity() as u32;
                let needed = (id as usize + 1) * MINI_SECTOR_SIZE;
                while self.mini.chain.len() * self.sectors.sector_size() < needed {
                    self.extend_stream()?;
                }
                id
            }
        };
        self.mini.table.set(id, ENDOFCHAIN);
        Ok(id)
    }

    fn release_slot(&mut self, id: u32) -> Result<()> {
        self.mini.table.set(id, FREESECT);
        if self.erase {
            self.mini
                .write_at(self.sectors, id, 0, &[0u8; MINI_SECTOR_SIZE])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mini_stream_grows_by_whole_sectors() {
        let mut mini = MiniStream::new(false);
        let mut fat = AllocationTable::new(false);
        let mut sectors = SectorStore::in_memory(512);
        let mut alloc = MiniAllocator {
            mini: &mut mini,
            fat: &mut fat,
            sectors: &mut sectors,
            erase: false,
        };

        // 8 mini sectors fit in one 512-byte sector, the ninth needs another
        let a = alloc.allocate_chain(8).unwrap();
        assert_eq!(alloc.mini.chain.len(), 1);
        let b = alloc.allocate_chain(1).unwrap();
        assert_eq!(alloc.mini.chain.len(), 2);
        assert_eq!(alloc.resolve_chain(a).unwrap(), (0..8).collect::<Vec<_>>());
        assert_eq!(alloc.resolve_chain(b).unwrap(), vec![8]);

        assert_eq!(mini.start, 0);
        assert_eq!(mini.byte_size(), 9 * 64);
        assert_eq!(fat.resolve_chain(mini.start, 2).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_mini_read_write() {
        let mut mini = MiniStream::new(false);
        let mut fat = AllocationTable::new(false);
        let mut sectors = SectorStore::in_memory(512);
        let mut alloc = MiniAllocator {
            mini: &mut mini,
            fat: &mut fat,
            sectors: &mut sectors,
            erase: false,
        };
        alloc.allocate_chain(10).unwrap();

        mini.write_at(&mut sectors, 9, 10, b"hello").unwrap();
        let mut buf = [0u8; 5];
        mini.read_at(&mut sectors, 9, 10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        // Mini sector 9 is byte 576 of the mini stream: second sector, offset 64
        let mut raw = [0u8; 5];
        sectors.read_at(mini.chain[1], 74, &mut raw).unwrap();
        assert_eq!(&raw, b"hello");
    }

    #[test]
    fn test_erase_released_mini_sectors() {
        let mut mini = MiniStream::new(false);
        let mut fat = AllocationTable::new(false);
        let mut sectors = SectorStore::in_memory(512);
        let mut alloc = MiniAllocator {
            mini: &mut mini,
            fat: &mut fat,
            sectors: &mut sectors,
            erase: true,
        };
        let start = alloc.allocate_chain(2).unwrap();
        alloc
            .mini
            .write_at(alloc.sectors, 1, 0, &[0xCD; 64])
            .unwrap();
        alloc.free_chain(start).unwrap();

        let mut buf = [0xFFu8; 64];
        mini.read_at(&mut sectors, 1, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(mini.table.free_count(), 2);
    }

    #[test]
    fn test_load_trims_table_to_root_size() {
        let mut entries = vec![ENDOFCHAIN, ENDOFCHAIN];
        entries.resize(128, FREESECT);
        let mini = MiniStream::load(entries, 3, 128, vec![3], 512, false).unwrap();
        assert_eq!(mini.capacity(), 2);

        let err = MiniStream::load(vec![ENDOFCHAIN; 16], 3, 1024, vec![3], 512, false).unwrap_err();
        assert!(err.is_corrupted());
    }
}
