//! Directory stream
//!
//! The directory is a flat array of 128-byte entries addressed by SID (the
//! entry index). Entry 0 is the root storage. Every storage owns a sibling set
//! organised as a red-black tree through the left/right links of its members;
//! the storage's child link points at the tree root.
//!
//! Parent links are not stored on disk. They are rebuilt at load time by a
//! bounded traversal from the root, which also rejects entries reachable more
//! than once (a cycle or shared subtree in the sibling links).

mod entry;
mod tree;

pub use entry::Clsid;
pub(crate) use entry::{
    DirEntry, EntryKind, compare_names, datetime_to_filetime, filetime_to_datetime,
    validate_name,
};

use crate::config::Version;
use crate::consts::*;
use crate::error::{Error, Result};
use fixedbitset::FixedBitSet;
use std::collections::BTreeSet;

/// Root storage SID
pub(crate) const ROOT_SID: u32 = 0;

/// In-memory directory: entry arena plus free-slot bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct Directory {
    entries: Vec<DirEntry>,
    /// Unused slots available for new entries, lowest first
    unused: BTreeSet<u32>,
    next_generation: u32,
}

impl Directory {
    /// Directory holding only the root storage
    pub fn new() -> Self {
        let mut root = DirEntry::root();
        root.generation = 1;
        Self {
            entries: vec![root],
            unused: BTreeSet::new(),
            next_generation: 2,
        }
    }

    /// Decode the directory stream and rebuild the sibling trees
    pub fn load(data: &[u8], version: Version) -> Result<Self> {
        let mut entries = Vec::with_capacity(data.len() / DIRENTRY_SIZE);
        for (sid, chunk) in data.chunks_exact(DIRENTRY_SIZE).enumerate() {
            let mut entry = DirEntry::decode(chunk, sid as u32, version)?;
            entry.generation = sid as u32 + 1;
            entries.push(entry);
        }

        match entries.first() {
            Some(root) if matches!(root.kind, EntryKind::Root { .. }) => {}
            Some(_) => return Err(Error::corrupted("directory entry 0 is not the root storage")),
            None => return Err(Error::corrupted("directory stream is empty")),
        }

        let next_generation = entries.len() as u32 + 1;
        let mut directory = Self {
            entries,
            unused: BTreeSet::new(),
            next_generation,
        };
        directory.link_parents()?;
        Ok(directory)
    }

    /// Walk every sibling tree from the root, setting parent links and
    /// releasing entries that nothing reaches
    fn link_parents(&mut self) -> Result<()> {
        let count = self.entries.len();
        let mut visited = FixedBitSet::with_capacity(count);
        visited.insert(ROOT_SID as usize);
        self.entries[ROOT_SID as usize].parent = NOSTREAM;

        let mut pending = vec![(self.entries[ROOT_SID as usize].child(), NOSTREAM, ROOT_SID)];
        while let Some((sid, parent, owner)) = pending.pop() {
            if sid == NOSTREAM {
                continue;
            }
            if sid as usize >= count {
                return Err(Error::corrupted(format!(
                    "entry {owner} links to entry {sid} beyond the {count} directory entries"
                )));
            }
            if visited.put(sid as usize) {
                return Err(Error::corrupted(format!(
                    "directory entry {sid} is linked more than once (under storage {owner})"
                )));
            }

            let entry = &mut self.entries[sid as usize];
            match entry.kind {
                EntryKind::Storage { .. } | EntryKind::Stream { .. } => {}
                _ => {
                    return Err(Error::corrupted(format!(
                        "directory entry {sid} under storage {owner} is not a storage or stream"
                    )));
                }
            }
            if entry.name.is_empty() {
                return Err(Error::corrupted(format!("directory entry {sid} has an empty name")));
            }
            entry.parent = parent;
            pending.push((entry.left, sid, owner));
            pending.push((entry.right, sid, owner));
            if entry.is_storage() {
                pending.push((entry.child(), NOSTREAM, sid));
            }
        }

        for sid in 1..count {
            if visited.contains(sid) {
                continue;
            }
            if !self.entries[sid].is_unused() {
                tracing::warn!(sid, name = %self.entries[sid].name, "orphaned directory entry");
                self.entries[sid] = DirEntry::unused();
            }
            self.unused.insert(sid as u32);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, sid: u32) -> Option<&DirEntry> {
        self.entries.get(sid as usize)
    }

    pub fn get_mut(&mut self, sid: u32) -> Option<&mut DirEntry> {
        self.entries.get_mut(sid as usize)
    }

    pub fn root(&self) -> &DirEntry {
        &self.entries[ROOT_SID as usize]
    }

    pub fn root_mut(&mut self) -> &mut DirEntry {
        &mut self.entries[ROOT_SID as usize]
    }

    /// Place a new entry in the lowest unused slot, or at the end
    pub fn allocate(&mut self, mut entry: DirEntry) -> u32 {
        entry.generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        entry.left = NOSTREAM;
        entry.right = NOSTREAM;
        entry.parent = NOSTREAM;

        match self.unused.pop_first() {
            Some(sid) => {
                self.entries[sid as usize] = entry;
                sid
            }
            None => {
                self.entries.push(entry);
                (self.entries.len() - 1) as u32
            }
        }
    }

    /// Turn an entry back into an unused slot
    pub fn release(&mut self, sid: u32) {
        if sid == ROOT_SID || sid as usize >= self.entries.len() {
            return;
        }
        self.entries[sid as usize] = DirEntry::unused();
        self.unused.insert(sid);
    }

    /// All entries of one sibling set plus, depth first, every storage below it
    pub fn descendants(&self, owner: u32) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        let mut pending = self.children(owner)?;
        pending.reverse();
        while let Some(sid) = pending.pop() {
            out.push(sid);
            if self.entries[sid as usize].is_storage() {
                let mut children = self.children(sid)?;
                children.reverse();
                pending.extend(children);
            }
        }
        Ok(out)
    }

    /// Storage whose sibling set contains `sid`
    pub fn owner_of(&self, sid: u32) -> Option<u32> {
        let mut top = sid;
        for _ in 0..self.entries.len() {
            let parent = self.get(top)?.parent;
            if parent == NOSTREAM {
                break;
            }
            top = parent;
        }
        (0..self.entries.len() as u32).find(|&owner| {
            let entry = &self.entries[owner as usize];
            owner != sid && entry.is_storage() && entry.child() == top
        })
    }

    /// Serialize the directory stream, padded with unused entries to whole sectors
    pub fn to_bytes(&mut self, sector_size: usize) -> Vec<u8> {
        // Drop trailing unused slots so deleted entries do not keep the stream long
        while self.entries.len() > 1 && self.entries.last().is_some_and(DirEntry::is_unused) {
            let sid = (self.entries.len() - 1) as u32;
            self.entries.pop();
            self.unused.remove(&sid);
        }

        let per_sector = sector_size / DIRENTRY_SIZE;
        let slots = self.entries.len().div_ceil(per_sector) * per_sector;
        let mut out = Vec::with_capacity(slots * DIRENTRY_SIZE);
        for entry in &self.entries {
            out.extend_from_slice(&entry.encode());
        }
        let padding = DirEntry::unused().encode();
        for _ in self.entries.len()..slots {
            out.extend_from_slice(&padding);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Directory, u32, u32, u32) {
        let mut dir = Directory::new();
        let storage = dir.allocate(DirEntry::storage("Folder"));
        dir.insert(ROOT_SID, storage).unwrap();
        let a = dir.allocate(DirEntry::stream("A"));
        dir.insert(ROOT_SID, a).unwrap();
        let inner = dir.allocate(DirEntry::stream("Inner"));
        dir.insert(storage, inner).unwrap();
        (dir, storage, a, inner)
    }

    #[test]
    fn test_serialize_and_load() {
        let (mut dir, storage, a, inner) = sample();
        let bytes = dir.to_bytes(512);
        assert_eq!(bytes.len(), 512);

        let loaded = Directory::load(&bytes, Version::V3).unwrap();
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded.find(ROOT_SID, "a").unwrap(), Some(a));
        assert_eq!(loaded.find(ROOT_SID, "folder").unwrap(), Some(storage));
        assert_eq!(loaded.find(storage, "INNER").unwrap(), Some(inner));
        assert_eq!(loaded.descendants(ROOT_SID).unwrap(), vec![a, storage, inner]);
    }

    #[test]
    fn test_release_and_reuse_slot() {
        let (mut dir, _, a, _) = sample();
        let generation = dir.get(a).unwrap().generation;
        dir.remove(ROOT_SID, a).unwrap();
        dir.release(a);
        let b = dir.allocate(DirEntry::stream("B"));
        assert_eq!(b, a);
        assert_ne!(dir.get(b).unwrap().generation, generation);
    }

    #[test]
    fn test_trailing_unused_entries_trimmed() {
        let (mut dir, storage, _, inner) = sample();
        dir.remove(storage, inner).unwrap();
        dir.release(inner);
        dir.to_bytes(512);
        assert_eq!(dir.len(), 3);
    }

    #[test]
    fn test_load_rejects_shared_subtree() {
        let (mut dir, storage, a, _) = sample();
        // Make the storage's child point at a root-level sibling
        dir.get_mut(storage).unwrap().set_child(a);
        let bytes = dir.to_bytes(512);
        let err = Directory::load(&bytes, Version::V3).unwrap_err();
        assert!(err.is_corrupted());
    }

    #[test]
    fn test_load_rejects_out_of_range_link() {
        let (mut dir, _, a, _) = sample();
        dir.get_mut(a).unwrap().left = 40;
        let bytes = dir.to_bytes(512);
        assert!(Directory::load(&bytes, Version::V3).unwrap_err().is_corrupted());
    }

    #[test]
    fn test_orphans_become_unused() {
        let (mut dir, storage, _, inner) = sample();
        // Detach "Inner" without releasing it
        dir.get_mut(storage).unwrap().set_child(NOSTREAM);
        let bytes = dir.to_bytes(512);
        let loaded = Directory::load(&bytes, Version::V3).unwrap();
        assert!(loaded.get(inner).unwrap().is_unused());
    }
}
