//! Storage and stream handles
//!
//! A handle names a directory entry (SID plus the generation of the slot's
//! occupant) inside a [`CompoundFile`](crate::CompoundFile). It holds only a
//! weak reference to the file, so closing the file invalidates every handle;
//! deleting an entry invalidates handles to it and to its descendants.

use crate::directory::{Clsid, DirEntry, ROOT_SID, datetime_to_filetime, filetime_to_datetime};
use crate::error::{Error, Result};
use crate::file::FileInner;
use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Reference to one directory entry of an open compound file.
#[derive(Debug, Clone)]
pub struct Handle {
    file: Weak<RefCell<FileInner>>,
    sid: u32,
    generation: u32,
}

impl Handle {
    pub(crate) fn new(file: Weak<RefCell<FileInner>>, sid: u32, generation: u32) -> Self {
        Self {
            file,
            sid,
            generation,
        }
    }

    fn upgrade(&self) -> Result<Rc<RefCell<FileInner>>> {
        self.file.upgrade().ok_or_else(|| {
            Error::Disposed(format!("entry {}: compound file has been closed", self.sid))
        })
    }

    /// Run `f` against the file after checking the entry still exists
    fn with<T>(&self, f: impl FnOnce(&mut FileInner, u32) -> Result<T>) -> Result<T> {
        let file = self.upgrade()?;
        let mut inner = file
            .try_borrow_mut()
            .map_err(|_| Error::InvalidOperation("compound file is busy".to_string()))?;
        match inner.directory.get(self.sid) {
            Some(entry) if !entry.is_unused() && entry.generation == self.generation => {}
            _ => {
                return Err(Error::Disposed(format!(
                    "entry {} has been deleted",
                    self.sid
                )));
            }
        }
        f(&mut inner, self.sid)
    }

    /// Handle to another entry of the same file
    fn sibling(&self, inner: &FileInner, sid: u32) -> Result<Handle> {
        Ok(Handle::new(self.file.clone(), sid, inner.entry(sid)?.generation))
    }

    fn same_file(&self, other: &Handle) -> bool {
        self.file.ptr_eq(&other.file)
    }
}

mod sealed {
    pub trait Sealed {
        fn handle(&self) -> &super::Handle;
    }
}

use sealed::Sealed;

/// Capabilities shared by storages and streams: name, type, CLSID and timestamps.
pub trait CfItem: Sealed {
    /// Directory slot of this entry
    fn sid(&self) -> u32 {
        self.handle().sid
    }

    fn name(&self) -> Result<String> {
        self.handle().with(|inner, sid| Ok(inner.entry(sid)?.name.clone()))
    }

    fn is_storage(&self) -> Result<bool> {
        self.handle().with(|inner, sid| Ok(inner.entry(sid)?.is_storage()))
    }

    fn is_stream(&self) -> Result<bool> {
        self.handle().with(|inner, sid| Ok(inner.entry(sid)?.is_stream()))
    }

    fn clsid(&self) -> Result<Clsid> {
        self.handle().with(|inner, sid| Ok(inner.entry(sid)?.clsid))
    }

    fn set_clsid(&self, clsid: Clsid) -> Result<()> {
        self.handle().with(|inner, sid| {
            inner.check_writable("set a CLSID")?;
            inner.entry_mut(sid)?.clsid = clsid;
            Ok(())
        })
    }

    /// Creation time, `None` when unset
    fn created(&self) -> Result<Option<DateTime<Utc>>> {
        self.handle()
            .with(|inner, sid| Ok(filetime_to_datetime(inner.entry(sid)?.created)))
    }

    /// Modification time, `None` when unset
    fn modified(&self) -> Result<Option<DateTime<Utc>>> {
        self.handle()
            .with(|inner, sid| Ok(filetime_to_datetime(inner.entry(sid)?.modified)))
    }

    fn set_created(&self, time: DateTime<Utc>) -> Result<()> {
        self.handle().with(|inner, sid| {
            inner.check_writable("set a timestamp")?;
            inner.entry_mut(sid)?.created = datetime_to_filetime(time);
            Ok(())
        })
    }

    fn set_modified(&self, time: DateTime<Utc>) -> Result<()> {
        self.handle().with(|inner, sid| {
            inner.check_writable("set a timestamp")?;
            inner.entry_mut(sid)?.modified = datetime_to_filetime(time);
            Ok(())
        })
    }
}

/// A storage (folder) entry.
#[derive(Debug, Clone)]
pub struct Storage {
    handle: Handle,
}

/// A stream (payload) entry.
#[derive(Debug, Clone)]
pub struct Stream {
    handle: Handle,
}

/// Either kind of entry, as produced by traversal and search.
#[derive(Debug, Clone)]
pub enum Entry {
    Storage(Storage),
    Stream(Stream),
}

impl Sealed for Storage {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Sealed for Stream {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Sealed for Entry {
    fn handle(&self) -> &Handle {
        match self {
            Entry::Storage(storage) => &storage.handle,
            Entry::Stream(stream) => &stream.handle,
        }
    }
}

impl CfItem for Storage {}
impl CfItem for Stream {}
impl CfItem for Entry {}

impl Entry {
    pub(crate) fn from_handle(handle: Handle, is_storage: bool) -> Self {
        if is_storage {
            Entry::Storage(Storage { handle })
        } else {
            Entry::Stream(Stream { handle })
        }
    }

    pub fn as_storage(&self) -> Option<&Storage> {
        match self {
            Entry::Storage(storage) => Some(storage),
            Entry::Stream(_) => None,
        }
    }

    pub fn as_stream(&self) -> Option<&Stream> {
        match self {
            Entry::Stream(stream) => Some(stream),
            Entry::Storage(_) => None,
        }
    }
}

impl Storage {
    pub(crate) fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    fn add(&self, entry: DirEntry) -> Result<Handle> {
        self.handle.with(|inner, sid| {
            let child = inner.add_child(sid, entry)?;
            self.handle.sibling(inner, child)
        })
    }

    /// Create a child storage
    ///
    /// # Errors
    ///
    /// [`Error::InvalidName`] for an empty, overlong or malformed name,
    /// [`Error::NameCollision`] when a sibling has the same name ignoring case.
    pub fn add_storage(&self, name: &str) -> Result<Storage> {
        self.add(DirEntry::storage(name)).map(Storage::from_handle)
    }

    /// Create an empty child stream
    pub fn add_stream(&self, name: &str) -> Result<Stream> {
        self.add(DirEntry::stream(name)).map(|handle| Stream { handle })
    }

    fn child(&self, name: &str) -> Result<(Handle, bool)> {
        self.handle.with(|inner, sid| {
            let child = inner.find_child(sid, name)?;
            let is_storage = inner.entry(child)?.is_storage();
            Ok((self.handle.sibling(inner, child)?, is_storage))
        })
    }

    /// Child storage by name (case-insensitive)
    pub fn get_storage(&self, name: &str) -> Result<Storage> {
        match self.child(name)? {
            (handle, true) => Ok(Storage { handle }),
            (_, false) => Err(Error::ItemNotFound(format!("'{name}' is not a storage"))),
        }
    }

    /// Child stream by name (case-insensitive)
    pub fn get_stream(&self, name: &str) -> Result<Stream> {
        match self.child(name)? {
            (handle, false) => Ok(Stream { handle }),
            (_, true) => Err(Error::ItemNotFound(format!("'{name}' is not a stream"))),
        }
    }

    /// Child entry of either kind by name (case-insensitive)
    pub fn get_entry(&self, name: &str) -> Result<Entry> {
        self.child(name)
            .map(|(handle, is_storage)| Entry::from_handle(handle, is_storage))
    }

    /// Delete a child; a storage is deleted with everything below it
    pub fn delete(&self, name: &str) -> Result<()> {
        self.handle.with(|inner, sid| inner.delete_child(sid, name))
    }

    /// Children in sibling order, plus, with `recursive`, everything below
    /// each child storage right after it
    pub fn entries(&self, recursive: bool) -> Result<Vec<Entry>> {
        self.handle.with(|inner, sid| {
            let sids = if recursive {
                inner.directory.descendants(sid)?
            } else {
                inner.directory.children(sid)?
            };
            sids.into_iter()
                .map(|child| {
                    let is_storage = inner.entry(child)?.is_storage();
                    Ok(Entry::from_handle(self.handle.sibling(inner, child)?, is_storage))
                })
                .collect()
        })
    }

    /// Call `visitor` for every child, recursing into child storages when
    /// `recursive` is set
    ///
    /// Siblings are visited in name order. The walk is depth first: a child
    /// storage is followed immediately by its own contents, before the next
    /// sibling.
    ///
    /// The visitor may use the entries it receives, including mutating calls;
    /// the traversal order is fixed before the first call.
    pub fn visit_entries<F>(&self, mut visitor: F, recursive: bool) -> Result<()>
    where
        F: FnMut(&Entry),
    {
        for entry in self.entries(recursive)? {
            visitor(&entry);
        }
        Ok(())
    }

    /// Deep-copy every child of this storage into `dest`
    ///
    /// `dest` may belong to another compound file. Copied entries keep their
    /// CLSID, state bits and timestamps; streams keep their payload.
    pub fn copy_to(&self, dest: &Storage) -> Result<()> {
        if self.handle.same_file(&dest.handle) {
            let target = dest.handle.sid;
            let inside = self.handle.with(|inner, sid| {
                Ok(sid == target || inner.directory.descendants(sid)?.contains(&target))
            })?;
            if inside {
                return Err(Error::InvalidOperation(format!(
                    "cannot copy storage {} into itself or one of its descendants",
                    self.handle.sid
                )));
            }
        }

        for entry in self.entries(false)? {
            let source = entry.handle().with(|inner, sid| Ok(inner.entry(sid)?.clone()))?;
            let target = match &entry {
                Entry::Storage(storage) => {
                    let target = dest.add_storage(&source.name)?;
                    storage.copy_to(&target)?;
                    target.handle
                }
                Entry::Stream(stream) => {
                    let target = dest.add_stream(&source.name)?;
                    target.set_data(&stream.get_data()?)?;
                    target.handle
                }
            };
            target.with(|inner, sid| {
                let copied = inner.entry_mut(sid)?;
                copied.clsid = source.clsid;
                copied.state_bits = source.state_bits;
                copied.created = source.created;
                copied.modified = source.modified;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Whether this is the root storage
    pub fn is_root(&self) -> bool {
        self.handle.sid == ROOT_SID
    }
}

impl Stream {
    /// Payload length in bytes
    pub fn size(&self) -> Result<u64> {
        self.handle.with(|inner, sid| inner.stream_size(sid))
    }

    /// The whole payload
    pub fn get_data(&self) -> Result<Vec<u8>> {
        self.handle.with(|inner, sid| inner.stream_data(sid))
    }

    /// Copy bytes starting at `offset` into `buf`; returns the count copied,
    /// which is short at the end of the stream
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.handle.with(|inner, sid| inner.read_stream(sid, offset, buf))
    }

    /// Replace the whole payload
    pub fn set_data(&self, data: &[u8]) -> Result<()> {
        self.handle.with(|inner, sid| inner.set_stream_data(sid, data))
    }

    /// Add bytes at the end of the payload
    pub fn append(&self, data: &[u8]) -> Result<()> {
        self.handle.with(|inner, sid| {
            let size = inner.stream_size(sid)?;
            inner.write_stream(sid, size, data)
        })
    }

    /// Overwrite bytes at `offset`, growing the stream when the write runs past
    /// its end (a gap before `offset` reads as zeros)
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.handle.with(|inner, sid| inner.write_stream(sid, offset, data))
    }

    /// Truncate or zero-extend the payload to `len` bytes
    pub fn resize(&self, len: u64) -> Result<()> {
        self.handle.with(|inner, sid| inner.resize_stream(sid, len, true))
    }
}
