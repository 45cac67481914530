//! Compound file façade
//!
//! [`CompoundFile`] owns the complete in-memory model of one container: the
//! header, the sector cache over the byte store, the FAT, the mini stream with
//! its MiniFAT, and the directory. Storage and stream handles are views into
//! that model.
//!
//! # Writers
//!
//! Both writers run from the same model. [`CompoundFile::commit`] writes only
//! the sectors that changed since open (or the previous commit) back into the
//! backing store in place. [`CompoundFile::save`] / [`CompoundFile::save_to`]
//! stream the complete image to a new destination. Before either runs, the
//! metadata (directory, MiniFAT, FAT and DIFAT) is serialized into sectors;
//! metadata sectors whose content did not change stay clean.
//!
//! # Example
//!
//! ```rust,no_run
//! use mcdf::{CompoundFile, Configuration, UpdateMode};
//!
//! let cf = CompoundFile::new();
//! let stream = cf.root_storage().add_stream("Data")?;
//! stream.set_data(b"Hello, World!")?;
//! cf.save("output.cfs")?;
//!
//! let cf = CompoundFile::open("output.cfs", UpdateMode::Update, Configuration::default())?;
//! cf.root_storage().get_stream("Data")?.append(b" Again")?;
//! cf.commit()?;
//! # Ok::<(), mcdf::Error>(())
//! ```

use crate::binary::read_u32_slots;
use crate::config::{Configuration, UpdateMode, Version};
use crate::consts::*;
use crate::difat::{self, DifatLayout};
use crate::directory::{Clsid, DirEntry, Directory, EntryKind, ROOT_SID, validate_name};
use crate::error::{Error, Result};
use crate::fat::{AllocationTable, ChainAllocator, SectorAllocator};
use crate::header::Header;
use crate::item::{Entry, Handle, Storage};
use crate::minifat::{MiniAllocator, MiniStream};
use crate::sector::{ByteStore, SectorStore};
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

fn is_mini(size: u64) -> bool {
    size < MINI_STREAM_CUTOFF as u64
}

/// Largest stream length the directory entry of `version` can record
fn max_stream_size(version: Version) -> u64 {
    match version {
        Version::V3 => u32::MAX as u64,
        Version::V4 => MAXREGSECT as u64 * version.sector_size() as u64,
    }
}

/// The in-memory model shared by a [`CompoundFile`] and its handles.
pub(crate) struct FileInner {
    header: Header,
    sectors: SectorStore,
    fat: AllocationTable,
    mini: MiniStream,
    pub(crate) directory: Directory,
    layout: DifatLayout,
    mode: UpdateMode,
    config: Configuration,
    /// Path the backing store was opened from
    path: Option<PathBuf>,
}

impl FileInner {
    fn new(version: Version, config: Configuration) -> Self {
        Self {
            header: Header::new(version),
            sectors: SectorStore::in_memory(version.sector_size()),
            fat: AllocationTable::new(config.recycle()),
            mini: MiniStream::new(config.recycle()),
            directory: Directory::new(),
            layout: DifatLayout::default(),
            mode: UpdateMode::Update,
            config,
            path: None,
        }
    }

    /// Read and validate every structure of an existing container
    fn load(
        mut store: Box<dyn ByteStore>,
        mode: UpdateMode,
        config: Configuration,
    ) -> Result<Self> {
        let file_len = store.seek(SeekFrom::End(0))?;
        store.seek(SeekFrom::Start(0))?;
        let mut block = vec![0u8; (HEADER_SIZE as u64).min(file_len) as usize];
        store.read_exact(&mut block)?;
        let header = Header::parse(&block)?;
        let sector_size = header.sector_size();

        let mut sectors = SectorStore::open(store, sector_size, file_len);
        let sector_count = sectors.len();
        let layout = difat::load(&header, &mut sectors)?;

        let mut entries = Vec::with_capacity(layout.fat_sectors.len() * sector_size / 4);
        for &id in &layout.fat_sectors {
            entries.extend(read_u32_slots(sectors.read(id)?));
        }
        let mut fat = AllocationTable::from_entries(entries, sector_count as usize, config.recycle());
        fat.truncate(sector_count as usize);

        let dir_chain = fat.resolve_chain(header.first_dir_sector, sector_count)?;
        if dir_chain.is_empty() {
            return Err(Error::corrupted("directory chain is empty"));
        }
        let mut dir_bytes = Vec::with_capacity(dir_chain.len() * sector_size);
        for &id in &dir_chain {
            dir_bytes.extend_from_slice(sectors.read(id)?);
        }
        let directory = Directory::load(&dir_bytes, header.version)?;

        let minifat_chain = fat.resolve_chain(header.first_minifat_sector, sector_count)?;
        let mut minifat_entries = Vec::with_capacity(minifat_chain.len() * sector_size / 4);
        for &id in &minifat_chain {
            minifat_entries.extend(read_u32_slots(sectors.read(id)?));
        }
        let (mini_start, mini_size) = directory
            .root()
            .stream_location()
            .unwrap_or((ENDOFCHAIN, 0));
        let mini_chain = fat.resolve_chain(mini_start, sector_count)?;
        let mini = MiniStream::load(
            minifat_entries,
            mini_start,
            mini_size,
            mini_chain,
            sector_size,
            config.recycle(),
        )?;

        let inner = Self {
            header,
            sectors,
            fat,
            mini,
            directory,
            layout,
            mode,
            config,
            path: None,
        };
        inner.validate_streams()?;

        tracing::debug!(
            version = ?inner.header.version,
            sectors = sector_count,
            fat_sectors = inner.layout.fat_sectors.len(),
            difat_sectors = inner.layout.difat_sectors.len(),
            entries = inner.directory.len(),
            "opened compound file"
        );
        Ok(inner)
    }

    /// Check that every stream's chain is intact and long enough for its size
    fn validate_streams(&self) -> Result<()> {
        for sid in 1..self.directory.len() as u32 {
            let Some(entry) = self.directory.get(sid) else {
                continue;
            };
            let EntryKind::Stream { start, size } = entry.kind else {
                continue;
            };
            let chain = self.stream_chain(start, size).map_err(|err| match err {
                Error::CorruptedFile(msg) => {
                    Error::corrupted(format!("stream '{}' (entry {sid}): {msg}", entry.name))
                }
                other => other,
            })?;
            let unit = self.unit_size(size) as u64;
            if (chain.len() as u64) < size.div_ceil(unit) {
                return Err(Error::corrupted(format!(
                    "stream '{}' (entry {sid}) declares {size} bytes but its chain has {} units",
                    entry.name,
                    chain.len()
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn version(&self) -> Version {
        self.header.version
    }

    pub(crate) fn check_writable(&self, operation: &str) -> Result<()> {
        match self.mode {
            UpdateMode::Update => Ok(()),
            UpdateMode::ReadOnly => Err(Error::ReadOnly(format!(
                "cannot {operation}: compound file was opened read-only"
            ))),
        }
    }

    pub(crate) fn entry(&self, sid: u32) -> Result<&DirEntry> {
        self.directory
            .get(sid)
            .filter(|entry| !entry.is_unused())
            .ok_or_else(|| Error::ItemNotFound(format!("no directory entry {sid}")))
    }

    pub(crate) fn entry_mut(&mut self, sid: u32) -> Result<&mut DirEntry> {
        self.directory
            .get_mut(sid)
            .filter(|entry| !entry.is_unused())
            .ok_or_else(|| Error::ItemNotFound(format!("no directory entry {sid}")))
    }

    // ----- directory operations -----

    /// Look up a child of `owner` by name
    pub(crate) fn find_child(&self, owner: u32, name: &str) -> Result<u32> {
        self.directory.find(owner, name)?.ok_or_else(|| {
            Error::ItemNotFound(format!(
                "'{name}' not found in '{}'",
                self.directory.get(owner).map_or("", |e| e.name.as_str())
            ))
        })
    }

    /// Create a child entry under `owner`
    ///
    /// The name is validated and checked for collisions before anything changes.
    pub(crate) fn add_child(&mut self, owner: u32, entry: DirEntry) -> Result<u32> {
        self.check_writable("add an entry")?;
        validate_name(&entry.name)?;
        if let Some(existing) = self.directory.find(owner, &entry.name)? {
            return Err(Error::NameCollision(format!(
                "'{}' already exists as '{}'",
                entry.name,
                self.directory.get(existing).map_or("", |e| e.name.as_str())
            )));
        }
        let sid = self.directory.allocate(entry);
        if let Err(err) = self.directory.insert(owner, sid) {
            self.directory.release(sid);
            return Err(err);
        }
        Ok(sid)
    }

    /// Delete a child of `owner`; storages take their whole subtree with them
    pub(crate) fn delete_child(&mut self, owner: u32, name: &str) -> Result<()> {
        self.check_writable("delete an entry")?;
        let sid = self.find_child(owner, name)?;

        let mut doomed = vec![sid];
        if self.entry(sid)?.is_storage() {
            doomed.extend(self.directory.descendants(sid)?);
        }
        for &victim in &doomed {
            let kind = self.directory.get(victim).map(|e| e.kind);
            if let Some(EntryKind::Stream { start, size }) = kind {
                self.with_allocator(is_mini(size), |alloc| alloc.free_chain(start))?;
            }
        }

        self.directory.remove(owner, sid)?;
        for &victim in &doomed {
            self.directory.release(victim);
        }
        tracing::trace!(name, removed = doomed.len(), "deleted entry");
        Ok(())
    }

    /// Every entry in the file, depth first in sibling order
    pub(crate) fn all_entries(&self) -> Result<Vec<u32>> {
        self.directory.descendants(ROOT_SID)
    }

    // ----- stream payloads -----

    fn unit_size(&self, size: u64) -> usize {
        if is_mini(size) {
            MINI_SECTOR_SIZE
        } else {
            self.sectors.sector_size()
        }
    }

    fn stream_chain(&self, start: u32, size: u64) -> Result<Vec<u32>> {
        if is_mini(size) {
            self.mini.table.resolve_chain(start, self.mini.capacity() as u32)
        } else {
            self.fat.resolve_chain(start, self.sectors.len())
        }
    }

    fn stream_location(&self, sid: u32) -> Result<(u32, u64)> {
        match self.entry(sid)?.kind {
            EntryKind::Stream { start, size } => Ok((start, size)),
            _ => Err(Error::InvalidOperation(format!("entry {sid} is not a stream"))),
        }
    }

    pub(crate) fn stream_size(&self, sid: u32) -> Result<u64> {
        self.stream_location(sid).map(|(_, size)| size)
    }

    /// Run `f` against the regular or the mini allocator
    fn with_allocator<T>(
        &mut self,
        mini: bool,
        f: impl FnOnce(&mut dyn ChainAllocator) -> Result<T>,
    ) -> Result<T> {
        let erase = self.config.erase();
        if mini {
            f(&mut MiniAllocator {
                mini: &mut self.mini,
                fat: &mut self.fat,
                sectors: &mut self.sectors,
                erase,
            })
        } else {
            f(&mut SectorAllocator {
                fat: &mut self.fat,
                sectors: &mut self.sectors,
                erase,
            })
        }
    }

    fn read_chain(&mut self, mini: bool, chain: &[u32], offset: u64, buf: &mut [u8]) -> Result<()> {
        let unit = if mini { MINI_SECTOR_SIZE } else { self.sectors.sector_size() };
        let mut done = 0;
        while done < buf.len() {
            let position = offset + done as u64;
            let index = (position / unit as u64) as usize;
            let within = (position % unit as u64) as usize;
            let id = *chain.get(index).ok_or_else(|| {
                Error::corrupted(format!("read at {position} runs past a {}-unit chain", chain.len()))
            })?;
            let n = (unit - within).min(buf.len() - done);
            let target = &mut buf[done..done + n];
            if mini {
                self.mini.read_at(&mut self.sectors, id, within, target)?;
            } else {
                self.sectors.read_at(id, within, target)?;
            }
            done += n;
        }
        Ok(())
    }

    fn write_chain(&mut self, mini: bool, chain: &[u32], offset: u64, data: &[u8]) -> Result<()> {
        let unit = if mini { MINI_SECTOR_SIZE } else { self.sectors.sector_size() };
        let mut done = 0;
        while done < data.len() {
            let position = offset + done as u64;
            let index = (position / unit as u64) as usize;
            let within = (position % unit as u64) as usize;
            let id = *chain.get(index).ok_or_else(|| {
                Error::corrupted(format!("write at {position} runs past a {}-unit chain", chain.len()))
            })?;
            let n = (unit - within).min(data.len() - done);
            let source = &data[done..done + n];
            if mini {
                self.mini.write_at(&mut self.sectors, id, within, source)?;
            } else {
                self.sectors.write_at(id, within, source)?;
            }
            done += n;
        }
        Ok(())
    }

    /// Random-access read; returns the number of bytes copied
    pub(crate) fn read_stream(&mut self, sid: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let (start, size) = self.stream_location(sid)?;
        if offset >= size {
            return Ok(0);
        }
        let n = ((size - offset) as usize).min(buf.len());
        let chain = self.stream_chain(start, size)?;
        self.read_chain(is_mini(size), &chain, offset, &mut buf[..n])?;
        Ok(n)
    }

    pub(crate) fn stream_data(&mut self, sid: u32) -> Result<Vec<u8>> {
        let size = self.stream_size(sid)?;
        let mut data = vec![0u8; size as usize];
        self.read_stream(sid, 0, &mut data)?;
        Ok(data)
    }

    /// Change a stream's length, moving it between the FAT and the MiniFAT
    /// when the new length falls on the other side of the cutoff
    ///
    /// With `fill`, bytes past the old end read as zeros.
    pub(crate) fn resize_stream(&mut self, sid: u32, new_size: u64, fill: bool) -> Result<()> {
        self.check_writable("resize a stream")?;
        let (start, old_size) = self.stream_location(sid)?;
        if new_size == old_size {
            return Ok(());
        }
        let limit = max_stream_size(self.version());
        if new_size > limit {
            return Err(Error::InvalidOperation(format!(
                "stream length {new_size} exceeds the {limit}-byte limit of a {:?} file",
                self.version()
            )));
        }
        let (old_mini, new_mini) = (is_mini(old_size), is_mini(new_size));
        let new_unit = self.unit_size(new_size) as u64;
        let new_count = new_size.div_ceil(new_unit) as usize;

        let new_start = if old_mini == new_mini {
            self.with_allocator(new_mini, |alloc| alloc.resize_chain(start, new_count))?
        } else {
            let keep = old_size.min(new_size) as usize;
            let mut data = vec![0u8; keep];
            let old_chain = self.stream_chain(start, old_size)?;
            self.read_chain(old_mini, &old_chain, 0, &mut data)?;
            self.with_allocator(old_mini, |alloc| alloc.free_chain(start))?;

            let new_start =
                self.with_allocator(new_mini, |alloc| alloc.allocate_chain(new_count))?;
            let new_chain = self.stream_chain(new_start, new_size)?;
            self.write_chain(new_mini, &new_chain, 0, &data)?;
            tracing::trace!(
                sid,
                old_size,
                new_size,
                to_mini = new_mini,
                "migrated stream between allocators"
            );
            new_start
        };
        self.entry_mut(sid)?.set_stream_location(new_start, new_size);

        if fill && new_size > old_size {
            let chain = self.stream_chain(new_start, new_size)?;
            let zeros = vec![0u8; (new_size - old_size).min(1 << 16) as usize];
            let mut position = old_size;
            while position < new_size {
                let n = ((new_size - position) as usize).min(zeros.len());
                self.write_chain(new_mini, &chain, position, &zeros[..n])?;
                position += n as u64;
            }
        }
        Ok(())
    }

    /// Write at `offset`, extending the stream as needed
    pub(crate) fn write_stream(&mut self, sid: u32, offset: u64, data: &[u8]) -> Result<()> {
        self.check_writable("write a stream")?;
        let size = self.stream_size(sid)?;
        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            Error::InvalidOperation(format!(
                "write of {} bytes at offset {offset} overflows the stream length",
                data.len()
            ))
        })?;
        if end > size {
            self.resize_stream(sid, end, offset > size)?;
        }
        if data.is_empty() {
            return Ok(());
        }
        let (start, size) = self.stream_location(sid)?;
        let chain = self.stream_chain(start, size)?;
        self.write_chain(is_mini(size), &chain, offset, data)
    }

    /// Replace the whole payload of a stream
    pub(crate) fn set_stream_data(&mut self, sid: u32, data: &[u8]) -> Result<()> {
        self.check_writable("write a stream")?;
        self.resize_stream(sid, data.len() as u64, false)?;
        self.write_stream(sid, 0, data)
    }

    // ----- writers -----

    /// Serialize directory, MiniFAT, FAT and DIFAT into sectors and update the header
    fn flush_metadata(&mut self) -> Result<()> {
        let sector_size = self.sectors.sector_size();
        let erase = self.config.erase();

        let (mini_start, mini_size) = if self.mini.capacity() == 0 {
            (ENDOFCHAIN, 0)
        } else {
            (self.mini.start, self.mini.byte_size())
        };
        self.directory
            .root_mut()
            .set_stream_location(mini_start, mini_size);
        let dir_bytes = self.directory.to_bytes(sector_size);
        let dir_count = dir_bytes.len() / sector_size;
        let minifat_count = (self.mini.capacity() * 4).div_ceil(sector_size);

        let mut alloc = SectorAllocator {
            fat: &mut self.fat,
            sectors: &mut self.sectors,
            erase,
        };
        self.header.first_dir_sector = alloc.resize_chain(self.header.first_dir_sector, dir_count)?;
        self.header.first_minifat_sector =
            alloc.resize_chain(self.header.first_minifat_sector, minifat_count)?;

        // Every FAT or DIFAT sector added can itself push the table over a boundary
        let per_fat_sector = sector_size / 4;
        loop {
            let fat_needed = (alloc.slot_count() as usize).div_ceil(per_fat_sector);
            let difat_needed = difat::difat_sector_count(fat_needed, sector_size);
            if self.layout.fat_sectors.len() >= fat_needed
                && self.layout.difat_sectors.len() >= difat_needed
            {
                break;
            }
            while self.layout.fat_sectors.len() < fat_needed {
                self.layout.fat_sectors.push(alloc.allocate_special(FATSECT)?);
            }
            while self.layout.difat_sectors.len() < difat_needed {
                self.layout.difat_sectors.push(alloc.allocate_special(DIFSECT)?);
            }
        }

        let dir_chain = alloc.resolve_chain(self.header.first_dir_sector)?;
        let minifat_chain = alloc.resolve_chain(self.header.first_minifat_sector)?;

        let mut written = 0usize;
        let fat_data = self.fat.to_sectors(sector_size, self.layout.fat_sectors.len());
        for (&id, data) in self.layout.fat_sectors.iter().zip(&fat_data) {
            written += usize::from(self.sectors.write_if_changed(id, data)?);
        }
        let difat_data = self.layout.generate_difat_sectors(sector_size);
        for (&id, data) in self.layout.difat_sectors.iter().zip(&difat_data) {
            written += usize::from(self.sectors.write_if_changed(id, data)?);
        }
        for (&id, data) in dir_chain.iter().zip(dir_bytes.chunks_exact(sector_size)) {
            written += usize::from(self.sectors.write_if_changed(id, data)?);
        }
        let minifat_data = self.mini.table.to_sectors(sector_size, minifat_count);
        for (&id, data) in minifat_chain.iter().zip(&minifat_data) {
            written += usize::from(self.sectors.write_if_changed(id, data)?);
        }

        self.layout.write_header(&mut self.header);
        self.header.num_dir_sectors = dir_count as u32;
        self.header.num_minifat_sectors = minifat_count as u32;

        tracing::trace!(
            sectors = self.sectors.len(),
            fat_sectors = self.layout.fat_sectors.len(),
            difat_sectors = self.layout.difat_sectors.len(),
            directory_sectors = dir_count,
            minifat_sectors = minifat_count,
            metadata_sectors_changed = written,
            "flushed metadata"
        );
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.check_writable("commit")?;
        if !self.sectors.has_store() {
            return Err(Error::InvalidOperation(
                "commit requires a backing store; use save for a new compound file".to_string(),
            ));
        }
        self.flush_metadata()?;
        let written = self.sectors.commit(&self.header.to_block())?;
        tracing::debug!(sectors_written = written, total = self.sectors.len(), "committed");
        Ok(())
    }

    fn save_to<W: Write + ?Sized>(&mut self, out: &mut W) -> Result<()> {
        self.flush_metadata()?;
        let block = self.header.to_block();
        self.sectors.write_image(&block, out)?;
        tracing::debug!(sectors = self.sectors.len(), "saved full image");
        Ok(())
    }

    fn save(&mut self, path: &Path) -> Result<()> {
        let same_file = match (&self.path, path.canonicalize()) {
            (Some(source), Ok(target)) => *source == target,
            _ => false,
        };
        if same_file {
            // The target is about to be truncated; pull everything into memory first
            self.sectors.load_all()?;
        }
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.save_to(&mut writer)
    }
}

/// A compound file (OLE2 structured storage) container.
///
/// Handles obtained from a `CompoundFile` ([`Storage`], [`crate::Stream`])
/// stay valid until the file is closed or dropped, after which every call on
/// them fails with [`Error::Disposed`].
pub struct CompoundFile {
    inner: Rc<RefCell<FileInner>>,
}

impl CompoundFile {
    /// Create an empty version 3 container in memory
    pub fn new() -> Self {
        Self::with_version(Version::V3, Configuration::default())
    }

    /// Create an empty container of the given version in memory
    pub fn with_version(version: Version, config: Configuration) -> Self {
        Self {
            inner: Rc::new(RefCell::new(FileInner::new(version, config))),
        }
    }

    /// Open an existing container from a path
    ///
    /// In [`UpdateMode::Update`] the file is opened for writing and changes are
    /// persisted by [`commit`](Self::commit).
    pub fn open<P: AsRef<Path>>(path: P, mode: UpdateMode, config: Configuration) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(mode == UpdateMode::Update)
            .open(path)?;
        let mut inner = FileInner::load(Box::new(file), mode, config)?;
        inner.path = path.canonicalize().ok();
        Ok(Self {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Open an existing container from any seekable byte store
    pub fn open_store<S: ByteStore + 'static>(
        store: S,
        mode: UpdateMode,
        config: Configuration,
    ) -> Result<Self> {
        let inner = FileInner::load(Box::new(store), mode, config)?;
        Ok(Self {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    fn borrow(&self) -> Result<std::cell::Ref<'_, FileInner>> {
        self.inner
            .try_borrow()
            .map_err(|_| Error::InvalidOperation("compound file is busy".to_string()))
    }

    fn borrow_mut(&self) -> Result<std::cell::RefMut<'_, FileInner>> {
        self.inner
            .try_borrow_mut()
            .map_err(|_| Error::InvalidOperation("compound file is busy".to_string()))
    }

    fn handle(&self, sid: u32) -> Result<Handle> {
        let generation = self.borrow()?.entry(sid)?.generation;
        Ok(Handle::new(Rc::downgrade(&self.inner), sid, generation))
    }

    /// The root storage
    pub fn root_storage(&self) -> Storage {
        let generation = self
            .inner
            .try_borrow()
            .map(|inner| inner.directory.root().generation)
            .unwrap_or_default();
        Storage::from_handle(Handle::new(Rc::downgrade(&self.inner), ROOT_SID, generation))
    }

    pub fn version(&self) -> Version {
        self.inner
            .try_borrow()
            .map(|inner| inner.version())
            .unwrap_or_default()
    }

    pub fn mode(&self) -> UpdateMode {
        self.inner
            .try_borrow()
            .map(|inner| inner.mode)
            .unwrap_or_default()
    }

    /// Write changed sectors back to the backing store in place
    ///
    /// Fails with [`Error::ReadOnly`] for read-only instances and with
    /// [`Error::InvalidOperation`] when there is no backing store (a container
    /// created in memory has to be saved first).
    pub fn commit(&self) -> Result<()> {
        self.borrow_mut()?.commit()
    }

    /// Write the complete container to a file at `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.borrow_mut()?.save(path.as_ref())
    }

    /// Write the complete container to `writer`
    pub fn save_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        self.borrow_mut()?.save_to(writer)
    }

    /// Release the backing store
    ///
    /// With [`Configuration::LEAVE_OPEN`] the store is handed back to the
    /// caller; otherwise it is dropped and `None` is returned. Uncommitted
    /// changes are discarded.
    pub fn close(self) -> Option<Box<dyn ByteStore>> {
        let mut inner = self.inner.try_borrow_mut().ok()?;
        let store = inner.sectors.take_store();
        if inner.config.contains(Configuration::LEAVE_OPEN) {
            store
        } else {
            None
        }
    }

    /// Write a compacted copy of this container to `writer`
    ///
    /// The copy holds the same tree and payloads with no free sectors and a
    /// densely packed mini stream.
    pub fn compact_into<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        let (version, root) = {
            let inner = self.borrow()?;
            (inner.version(), inner.directory.root().clone())
        };
        let target = CompoundFile::with_version(version, Configuration::default());
        {
            let mut inner = target.borrow_mut()?;
            let target_root = inner.directory.root_mut();
            target_root.clsid = root.clsid;
            target_root.state_bits = root.state_bits;
            target_root.created = root.created;
            target_root.modified = root.modified;
        }
        self.root_storage().copy_to(&target.root_storage())?;
        target.save_to(writer)
    }

    /// Compact the container at `path` in place
    ///
    /// The compacted image is written to a temporary file next to `path` and
    /// then moved over the original, so a failure part way leaves the
    /// original untouched.
    pub fn shrink<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        let before = std::fs::metadata(path)?.len();
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut temp = tempfile::NamedTempFile::new_in(directory)?;
        {
            let source = CompoundFile::open(path, UpdateMode::ReadOnly, Configuration::default())?;
            let mut writer = BufWriter::new(temp.as_file_mut());
            source.compact_into(&mut writer)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|err| Error::Io(err.error))?;

        let after = std::fs::metadata(path)?.len();
        tracing::debug!(path = %path.display(), before, after, "shrunk compound file");
        Ok(())
    }

    /// Every entry in the file whose name equals `name`, the root storage
    /// first and then the rest in traversal order
    pub fn get_all_named_entries(&self, name: &str) -> Result<Vec<Entry>> {
        let matches: Vec<u32> = {
            let inner = self.borrow()?;
            std::iter::once(ROOT_SID)
                .chain(inner.all_entries()?)
                .filter(|&sid| inner.directory.get(sid).is_some_and(|e| e.name == name))
                .collect()
        };
        matches
            .into_iter()
            .map(|sid| {
                let is_storage = self.borrow()?.entry(sid)?.is_storage();
                Ok(Entry::from_handle(self.handle(sid)?, is_storage))
            })
            .collect()
    }

    /// Number of directory entry slots, including unused ones
    pub fn entry_count(&self) -> Result<usize> {
        Ok(self.borrow()?.directory.len())
    }

    /// Name of the entry at directory slot `sid`
    pub fn name_by_sid(&self, sid: u32) -> Result<String> {
        Ok(self.borrow()?.entry(sid)?.name.clone())
    }

    /// CLSID of the entry at directory slot `sid`
    pub fn clsid_by_sid(&self, sid: u32) -> Result<Clsid> {
        Ok(self.borrow()?.entry(sid)?.clsid)
    }

    /// CLSID of the storage that contains the stream at slot `sid`
    pub fn clsid_for_stream(&self, sid: u32) -> Result<Clsid> {
        let inner = self.borrow()?;
        if !inner.entry(sid)?.is_stream() {
            return Err(Error::InvalidOperation(format!("entry {sid} is not a stream")));
        }
        let owner = inner
            .directory
            .owner_of(sid)
            .ok_or_else(|| Error::ItemNotFound(format!("no storage contains entry {sid}")))?;
        Ok(inner.entry(owner)?.clsid)
    }
}

impl Default for CompoundFile {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompoundFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = f.debug_struct("CompoundFile");
        if let Ok(inner) = self.inner.try_borrow() {
            out.field("version", &inner.header.version)
                .field("mode", &inner.mode)
                .field("sectors", &inner.sectors.len())
                .field("entries", &inner.directory.len());
        }
        out.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn image(cf: &CompoundFile) -> Vec<u8> {
        let mut out = Vec::new();
        cf.save_to(&mut out).unwrap();
        out
    }

    #[test]
    fn test_empty_file_layout() {
        let bytes = image(&CompoundFile::new());
        // Header, one FAT sector, one directory sector
        assert_eq!(bytes.len(), 3 * 512);
        let header = Header::parse(&bytes).unwrap();
        assert_eq!(header.num_fat_sectors, 1);
        assert_eq!(header.first_minifat_sector, ENDOFCHAIN);
        assert_eq!(header.first_difat_sector, ENDOFCHAIN);

        let cf = CompoundFile::open_store(Cursor::new(bytes), UpdateMode::ReadOnly, Configuration::default())
            .unwrap();
        assert_eq!(cf.entry_count().unwrap(), 4);
        assert_eq!(cf.name_by_sid(0).unwrap(), ROOT_ENTRY_NAME);
    }

    #[test]
    fn test_v4_header_block() {
        let bytes = image(&CompoundFile::with_version(Version::V4, Configuration::default()));
        assert_eq!(bytes.len(), 3 * 4096);
        let header = Header::parse(&bytes).unwrap();
        assert_eq!(header.version, Version::V4);
        assert_eq!(header.num_dir_sectors, 1);
    }

    #[test]
    fn test_commit_without_store() {
        let cf = CompoundFile::new();
        assert!(matches!(cf.commit(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_commit_writes_only_changes() {
        let cf = CompoundFile::new();
        let root = cf.root_storage();
        root.add_stream("One").unwrap().set_data(&[1u8; 8000]).unwrap();
        root.add_stream("Two").unwrap().set_data(&[2u8; 100]).unwrap();
        let bytes = image(&cf);

        let cf = CompoundFile::open_store(Cursor::new(bytes), UpdateMode::Update, Configuration::default())
            .unwrap();
        cf.commit().unwrap();
        {
            let mut inner = cf.inner.borrow_mut();
            // Nothing changed: metadata serializes to identical sectors
            inner.flush_metadata().unwrap();
            assert_eq!(inner.sectors.dirty_count(), 0);
        }

        cf.root_storage().get_stream("Two").unwrap().write(0, &[9u8; 10]).unwrap();
        let mut inner = cf.inner.borrow_mut();
        inner.flush_metadata().unwrap();
        // One mini stream sector only
        assert_eq!(inner.sectors.dirty_count(), 1);
    }

    #[test]
    fn test_close_leave_open() {
        let bytes = image(&CompoundFile::new());
        let cf = CompoundFile::open_store(
            Cursor::new(bytes.clone()),
            UpdateMode::ReadOnly,
            Configuration::LEAVE_OPEN,
        )
        .unwrap();
        assert!(cf.close().is_some());

        let cf = CompoundFile::open_store(Cursor::new(bytes), UpdateMode::ReadOnly, Configuration::default())
            .unwrap();
        assert!(cf.close().is_none());
    }

    #[test]
    fn test_truncated_file_is_corrupted() {
        let bytes = image(&CompoundFile::new());
        let result = CompoundFile::open_store(
            Cursor::new(bytes[..600].to_vec()),
            UpdateMode::ReadOnly,
            Configuration::default(),
        );
        assert!(result.unwrap_err().is_corrupted());
    }
}
