//! Sector store
//!
//! Raw addressing of fixed-size sectors over the underlying byte store.
//! Sector `n` lives at byte offset `(n + 1) * sector_size`; the first sector-sized
//! block of the file is the header.
//!
//! Sectors are loaded lazily and cached. Every write goes to the cache and marks
//! the sector dirty; [`SectorStore::commit`] writes only dirty sectors back in
//! place, while [`SectorStore::write_image`] streams the complete file image to
//! another writer.

use crate::error::{Error, Result};
use fixedbitset::FixedBitSet;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// Seekable byte store backing a compound file.
pub trait ByteStore: Read + Write + Seek {
    /// Truncate or extend the store to exactly `len` bytes
    fn set_len(&mut self, len: u64) -> io::Result<()>;
}

impl ByteStore for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

impl ByteStore for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length overflows usize"))?;
        self.get_mut().resize(len, 0);
        Ok(())
    }
}

/// Fixed-size sector cache over an optional byte store.
pub(crate) struct SectorStore {
    store: Option<Box<dyn ByteStore>>,
    sector_size: usize,
    /// Bytes available in the store after the header block
    stored_bytes: u64,
    cache: Vec<Option<Box<[u8]>>>,
    dirty: FixedBitSet,
}

impl SectorStore {
    /// Empty store with no backing bytes
    pub fn in_memory(sector_size: usize) -> Self {
        Self {
            store: None,
            sector_size,
            stored_bytes: 0,
            cache: Vec::new(),
            dirty: FixedBitSet::new(),
        }
    }

    /// Sector view of an existing store of `file_len` bytes
    ///
    /// A trailing partial sector counts as a sector; its missing tail reads as zeros.
    pub fn open(store: Box<dyn ByteStore>, sector_size: usize, file_len: u64) -> Self {
        let stored_bytes = file_len.saturating_sub(sector_size as u64);
        let count = stored_bytes.div_ceil(sector_size as u64) as usize;
        let mut cache = Vec::with_capacity(count);
        cache.resize_with(count, || None);
        Self {
            store: Some(store),
            sector_size,
            stored_bytes,
            cache,
            dirty: FixedBitSet::with_capacity(count),
        }
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Number of sectors, including ones appended since load
    pub fn len(&self) -> u32 {
        self.cache.len() as u32
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    pub fn take_store(&mut self) -> Option<Box<dyn ByteStore>> {
        self.store.take()
    }

    fn offset(&self, id: u32) -> u64 {
        (id as u64 + 1) * self.sector_size as u64
    }

    fn check(&self, id: u32) -> Result<usize> {
        let idx = id as usize;
        if idx >= self.cache.len() {
            return Err(Error::corrupted(format!(
                "sector {id} out of range ({} sectors)",
                self.cache.len()
            )));
        }
        Ok(idx)
    }

    /// Read a sector from the byte store, bypassing the cache
    fn load(&mut self, id: u32) -> Result<Box<[u8]>> {
        let mut buffer = vec![0u8; self.sector_size].into_boxed_slice();
        let start = id as u64 * self.sector_size as u64;
        if start >= self.stored_bytes {
            return Ok(buffer);
        }
        let available = (self.stored_bytes - start).min(self.sector_size as u64) as usize;
        let position = self.offset(id);
        let store = self
            .store
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation(format!("sector {id} has no backing store")))?;
        store.seek(SeekFrom::Start(position))?;
        store.read_exact(&mut buffer[..available])?;
        Ok(buffer)
    }

    fn ensure_loaded(&mut self, idx: usize) -> Result<()> {
        if self.cache[idx].is_none() {
            let data = self.load(idx as u32)?;
            self.cache[idx] = Some(data);
        }
        Ok(())
    }

    /// Read a whole sector
    pub fn read(&mut self, id: u32) -> Result<&[u8]> {
        let idx = self.check(id)?;
        self.ensure_loaded(idx)?;
        Ok(self.cache[idx].as_deref().unwrap_or_default())
    }

    /// Copy `buf.len()` bytes starting at `offset` inside a sector
    pub fn read_at(&mut self, id: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        let sector_size = self.sector_size;
        let data = self.read(id)?;
        let end = offset + buf.len();
        if end > sector_size {
            return Err(Error::InvalidOperation(format!(
                "read of {} bytes at {offset} crosses sector {id}",
                buf.len()
            )));
        }
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    /// Write `data` at `offset` inside a sector and mark it dirty
    pub fn write_at(&mut self, id: u32, offset: usize, data: &[u8]) -> Result<()> {
        let idx = self.check(id)?;
        let end = offset + data.len();
        if end > self.sector_size {
            return Err(Error::InvalidOperation(format!(
                "write of {} bytes at {offset} crosses sector {id}",
                data.len()
            )));
        }
        self.ensure_loaded(idx)?;
        if let Some(sector) = self.cache[idx].as_mut() {
            sector[offset..end].copy_from_slice(data);
        }
        self.dirty.grow(idx + 1);
        self.dirty.insert(idx);
        Ok(())
    }

    /// Replace a whole sector, marking it dirty only when its content changes
    pub fn write_if_changed(&mut self, id: u32, data: &[u8]) -> Result<bool> {
        debug_assert_eq!(data.len(), self.sector_size);
        if self.read(id)? == data {
            return Ok(false);
        }
        self.write_at(id, 0, data)?;
        Ok(true)
    }

    /// Overwrite a sector with zeros
    pub fn zero(&mut self, id: u32) -> Result<()> {
        let zeros = vec![0u8; self.sector_size];
        self.write_at(id, 0, &zeros)
    }

    /// Append a zeroed sector at the end of the file and return its index
    pub fn push(&mut self) -> u32 {
        let id = self.cache.len();
        self.cache.push(Some(vec![0u8; self.sector_size].into_boxed_slice()));
        self.dirty.grow(id + 1);
        self.dirty.insert(id);
        id as u32
    }

    /// Number of sectors modified since load or the last commit
    #[cfg(test)]
    pub fn dirty_count(&self) -> usize {
        self.dirty.count_ones(..)
    }

    /// Load every sector that still lives only in the byte store
    pub fn load_all(&mut self) -> Result<()> {
        for idx in 0..self.cache.len() {
            self.ensure_loaded(idx)?;
        }
        Ok(())
    }

    /// Write dirty sectors and the header block back to the byte store in place
    ///
    /// Returns the number of sectors written.
    pub fn commit(&mut self, header_block: &[u8]) -> Result<usize> {
        let sector_size = self.sector_size;
        let dirty: Vec<usize> = self.dirty.ones().collect();
        let total = self.cache.len() as u64;
        let Some(store) = self.store.as_mut() else {
            return Err(Error::InvalidOperation(
                "commit requires a backing store; use save instead".to_string(),
            ));
        };

        for &idx in &dirty {
            if let Some(data) = self.cache[idx].as_deref() {
                store.seek(SeekFrom::Start((idx as u64 + 1) * sector_size as u64))?;
                store.write_all(data)?;
            }
        }

        store.seek(SeekFrom::Start(0))?;
        store.write_all(header_block)?;
        let file_len = (total + 1) * sector_size as u64;
        store.set_len(file_len)?;
        store.flush()?;

        self.stored_bytes = total * sector_size as u64;
        self.dirty.clear();
        Ok(dirty.len())
    }

    /// Write the header block followed by every sector to `out`
    pub fn write_image<W: Write + ?Sized>(&mut self, header_block: &[u8], out: &mut W) -> Result<()> {
        out.write_all(header_block)?;
        for idx in 0..self.cache.len() {
            if let Some(data) = self.cache[idx].as_deref() {
                out.write_all(data)?;
            } else {
                // Stream uncached sectors through without growing the cache
                let data = self.load(idx as u32)?;
                out.write_all(&data)?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_sectors(sector_size: usize, count: usize) -> SectorStore {
        let mut bytes = vec![0xEEu8; sector_size];
        for i in 0..count {
            bytes.extend(std::iter::repeat_n(i as u8, sector_size));
        }
        let len = bytes.len() as u64;
        SectorStore::open(Box::new(Cursor::new(bytes)), sector_size, len)
    }

    #[test]
    fn test_lazy_read() {
        let mut store = store_with_sectors(512, 3);
        assert_eq!(store.len(), 3);
        assert!(store.read(1).unwrap().iter().all(|&b| b == 1));
        assert!(store.read(3).unwrap_err().is_corrupted());
    }

    #[test]
    fn test_partial_trailing_sector() {
        let mut bytes = vec![0u8; 512];
        bytes.extend(std::iter::repeat_n(7u8, 100));
        let mut store = SectorStore::open(Box::new(Cursor::new(bytes)), 512, 612);
        assert_eq!(store.len(), 1);
        let data = store.read(0).unwrap();
        assert!(data[..100].iter().all(|&b| b == 7));
        assert!(data[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_dirty_tracking() {
        let mut store = store_with_sectors(512, 2);
        assert_eq!(store.dirty_count(), 0);
        assert!(!store.write_if_changed(0, &vec![0u8; 512]).unwrap());
        assert!(store.write_if_changed(1, &vec![9u8; 512]).unwrap());
        let id = store.push();
        assert_eq!(id, 2);
        assert_eq!(store.dirty_count(), 2);

        let written = store.commit(&vec![0xEEu8; 512]).unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.dirty_count(), 0);
    }

    #[test]
    fn test_write_at_bounds() {
        let mut store = SectorStore::in_memory(512);
        let id = store.push();
        store.write_at(id, 500, &[1u8; 12]).unwrap();
        assert!(store.write_at(id, 510, &[1u8; 4]).is_err());
        let mut buf = [0u8; 2];
        store.read_at(id, 510, &mut buf).unwrap();
        assert_eq!(buf, [1, 1]);
    }

    #[test]
    fn test_commit_without_store() {
        let mut store = SectorStore::in_memory(512);
        store.push();
        assert!(matches!(
            store.commit(&vec![0u8; 512]),
            Err(Error::InvalidOperation(_))
        ));
    }
}
