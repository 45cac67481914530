//! Directory entry record
//!
//! Each entry is a fixed 128-byte record in the directory stream. The record
//! layout is reproduced bit-exactly by [`RawDirectoryEntry`]; [`DirEntry`] is
//! the decoded, in-memory form with the type-specific fields split into
//! [`EntryKind`].

use crate::config::Version;
use crate::consts::*;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt;
use zerocopy::{FromBytes, IntoBytes, LE, U16, U32, U64};
use zerocopy_derive::{
    FromBytes as DeriveFromBytes, Immutable as DeriveImmutable, IntoBytes as DeriveIntoBytes,
    KnownLayout as DeriveKnownLayout,
};

/// Raw directory entry structure (128 bytes)
#[derive(Debug, Clone, DeriveFromBytes, DeriveIntoBytes, DeriveImmutable, DeriveKnownLayout)]
#[repr(C)]
struct RawDirectoryEntry {
    /// Entry name in UTF-16LE (64 bytes, null-padded)
    name: [u8; 64],
    /// Length of name in bytes (including null terminator)
    name_len: U16<LE>,
    /// Entry type (0 = empty, 1 = storage, 2 = stream, 5 = root)
    entry_type: u8,
    /// Node color (0 = red, 1 = black)
    node_color: u8,
    /// Left sibling SID
    sid_left: U32<LE>,
    /// Right sibling SID
    sid_right: U32<LE>,
    /// Child SID
    sid_child: U32<LE>,
    /// CLSID (16 bytes)
    clsid: [u8; 16],
    /// State bits
    state_bits: U32<LE>,
    /// Creation time (FILETIME)
    creation_time: U64<LE>,
    /// Modified time (FILETIME)
    modified_time: U64<LE>,
    /// Starting sector
    start_sector: U32<LE>,
    /// Stream size
    stream_size: U64<LE>,
}

/// Class identifier attached to a storage or stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Clsid(pub [u8; 16]);

impl Clsid {
    pub const NIL: Clsid = Clsid([0; 16]);

    pub fn is_nil(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for Clsid {
    /// Format as `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX`, the first three
    /// groups read little-endian
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            u16::from_le_bytes([b[4], b[5]]),
            u16::from_le_bytes([b[6], b[7]]),
            b[8],
            b[9],
            b[10],
            b[11],
            b[12],
            b[13],
            b[14],
            b[15]
        )
    }
}

/// Type-specific part of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    Unused,
    /// The root storage; its start/size describe the mini stream
    Root { child: u32, start: u32, size: u64 },
    Storage { child: u32 },
    Stream { start: u32, size: u64 },
}

/// Decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub color: u8,
    pub left: u32,
    pub right: u32,
    /// Parent inside the sibling tree, NOSTREAM for the tree root (not stored on disk)
    pub parent: u32,
    pub clsid: Clsid,
    pub state_bits: u32,
    pub created: u64,
    pub modified: u64,
    /// Identity of this occupant of the slot; changes when the slot is reused
    pub generation: u32,
}

impl DirEntry {
    fn with_kind(name: &str, kind: EntryKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            color: COLOR_BLACK,
            left: NOSTREAM,
            right: NOSTREAM,
            parent: NOSTREAM,
            clsid: Clsid::NIL,
            state_bits: 0,
            created: 0,
            modified: 0,
            generation: 0,
        }
    }

    pub fn unused() -> Self {
        Self::with_kind("", EntryKind::Unused)
    }

    pub fn root() -> Self {
        Self::with_kind(
            ROOT_ENTRY_NAME,
            EntryKind::Root {
                child: NOSTREAM,
                start: ENDOFCHAIN,
                size: 0,
            },
        )
    }

    /// New storage, stamped with the current time
    pub fn storage(name: &str) -> Self {
        let now = datetime_to_filetime(Utc::now());
        let mut entry = Self::with_kind(name, EntryKind::Storage { child: NOSTREAM });
        entry.created = now;
        entry.modified = now;
        entry
    }

    pub fn stream(name: &str) -> Self {
        Self::with_kind(
            name,
            EntryKind::Stream {
                start: ENDOFCHAIN,
                size: 0,
            },
        )
    }

    pub fn is_unused(&self) -> bool {
        matches!(self.kind, EntryKind::Unused)
    }

    pub fn is_storage(&self) -> bool {
        matches!(self.kind, EntryKind::Root { .. } | EntryKind::Storage { .. })
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.kind, EntryKind::Stream { .. })
    }

    /// Root of the owned sibling tree, NOSTREAM for streams
    pub fn child(&self) -> u32 {
        match self.kind {
            EntryKind::Root { child, .. } | EntryKind::Storage { child } => child,
            _ => NOSTREAM,
        }
    }

    pub fn set_child(&mut self, sid: u32) {
        match &mut self.kind {
            EntryKind::Root { child, .. } | EntryKind::Storage { child } => *child = sid,
            _ => {}
        }
    }

    /// Stream chain head and size, or the mini stream's for the root
    pub fn stream_location(&self) -> Option<(u32, u64)> {
        match self.kind {
            EntryKind::Root { start, size, .. } | EntryKind::Stream { start, size } => {
                Some((start, size))
            }
            _ => None,
        }
    }

    /// Set the chain head and size; an empty stream always starts at ENDOFCHAIN
    pub fn set_stream_location(&mut self, new_start: u32, new_size: u64) {
        match &mut self.kind {
            EntryKind::Root { start, size, .. } => {
                *start = new_start;
                *size = new_size;
            }
            EntryKind::Stream { start, size } => {
                *start = if new_size == 0 { ENDOFCHAIN } else { new_start };
                *size = new_size;
            }
            _ => {}
        }
    }

    /// Decode one 128-byte record
    pub fn decode(data: &[u8], sid: u32, version: Version) -> Result<Self> {
        let raw = RawDirectoryEntry::read_from_bytes(data).map_err(|_| {
            Error::corrupted(format!("failed to parse directory entry {sid}"))
        })?;

        let child = raw.sid_child.get();
        let start = raw.start_sector.get();
        let mut size = raw.stream_size.get();
        // 512-byte sector files only use the low 32 bits of the size
        if version == Version::V3 && size > u32::MAX as u64 {
            tracing::warn!(sid, size, "stream size exceeds 32 bits in a version 3 file");
            size &= 0xFFFF_FFFF;
        }

        let kind = match raw.entry_type {
            STGTY_EMPTY => return Ok(Self::unused()),
            STGTY_ROOT => EntryKind::Root { child, start, size },
            STGTY_STORAGE => EntryKind::Storage { child },
            STGTY_STREAM => EntryKind::Stream {
                start: if size == 0 { ENDOFCHAIN } else { start },
                size,
            },
            other => {
                return Err(Error::corrupted(format!(
                    "directory entry {sid} has invalid type {other}"
                )));
            }
        };

        let name_len = raw.name_len.get() as usize;
        if name_len > 64 || name_len % 2 != 0 {
            return Err(Error::corrupted(format!(
                "directory entry {sid} has invalid name length {name_len}"
            )));
        }
        let name = decode_utf16le(&raw.name[..name_len.saturating_sub(2)]);

        Ok(Self {
            name,
            kind,
            color: if raw.node_color == COLOR_RED {
                COLOR_RED
            } else {
                COLOR_BLACK
            },
            left: raw.sid_left.get(),
            right: raw.sid_right.get(),
            parent: NOSTREAM,
            clsid: Clsid(raw.clsid),
            state_bits: raw.state_bits.get(),
            created: raw.creation_time.get(),
            modified: raw.modified_time.get(),
            generation: 0,
        })
    }

    /// Encode to a 128-byte record
    pub fn encode(&self) -> [u8; DIRENTRY_SIZE] {
        let mut out = [0u8; DIRENTRY_SIZE];
        if self.is_unused() {
            // Empty entries are all zeros apart from the three NOSTREAM links
            out[68..80].fill(0xFF);
            return out;
        }

        let mut name = [0u8; 64];
        let mut units = 0usize;
        for (i, unit) in self.name.encode_utf16().take(MAX_NAME_LEN).enumerate() {
            name[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
            units += 1;
        }

        let (entry_type, start, size) = match self.kind {
            EntryKind::Root { start, size, .. } => (STGTY_ROOT, start, size),
            EntryKind::Storage { .. } => (STGTY_STORAGE, 0, 0),
            EntryKind::Stream { start, size } => (STGTY_STREAM, start, size),
            EntryKind::Unused => (STGTY_EMPTY, 0, 0),
        };

        let raw = RawDirectoryEntry {
            name,
            name_len: U16::new(((units + 1) * 2) as u16),
            entry_type,
            node_color: self.color,
            sid_left: U32::new(self.left),
            sid_right: U32::new(self.right),
            sid_child: U32::new(self.child()),
            clsid: self.clsid.0,
            state_bits: U32::new(self.state_bits),
            creation_time: U64::new(self.created),
            modified_time: U64::new(self.modified),
            start_sector: U32::new(start),
            stream_size: U64::new(size),
        };
        out.copy_from_slice(raw.as_bytes());
        out
    }
}

/// Check a name for use as a new entry
///
/// Names must be 1..=31 UTF-16 code units and free of `/ \ : !`.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName("name is empty".to_string()));
    }
    let units = name.encode_utf16().count();
    if units > MAX_NAME_LEN {
        return Err(Error::InvalidName(format!(
            "'{name}' is {units} characters long, the maximum is {MAX_NAME_LEN}"
        )));
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_NAME_CHARS.contains(c)) {
        return Err(Error::InvalidName(format!(
            "'{name}' contains forbidden character '{c}'"
        )));
    }
    Ok(())
}

/// Sibling order: shorter names first, then case-insensitive code unit order
pub(crate) fn compare_names(a: &str, b: &str) -> Ordering {
    let len_a = a.encode_utf16().count();
    let len_b = b.encode_utf16().count();
    len_a.cmp(&len_b).then_with(|| {
        a.encode_utf16()
            .map(upper_unit)
            .cmp(b.encode_utf16().map(upper_unit))
    })
}

/// Uppercase a single UTF-16 code unit where the mapping stays a single unit
fn upper_unit(unit: u16) -> u16 {
    let Some(c) = char::from_u32(unit as u32) else {
        return unit;
    };
    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(u), None) if (u as u32) <= 0xFFFF => u as u16,
        _ => unit,
    }
}

/// Decode UTF-16LE string from bytes
fn decode_utf16le(bytes: &[u8]) -> String {
    let utf16_chars: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|chunk| {
            U16::<LE>::read_from_bytes(chunk)
                .map(|v| v.get())
                .unwrap_or(0)
        })
        .collect();

    // Decode UTF-16 to String, replacing invalid sequences
    String::from_utf16_lossy(&utf16_chars)
        .trim_end_matches('\0')
        .to_string()
}

/// Convert a FILETIME (100ns ticks since 1601) to UTC; zero means unset
pub(crate) fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    if filetime == 0 {
        return None;
    }
    let secs = (filetime / 10_000_000) as i64 - FILETIME_UNIX_OFFSET_SECS;
    let nanos = ((filetime % 10_000_000) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Convert UTC to a FILETIME, clamping instants before 1601 to zero
pub(crate) fn datetime_to_filetime(time: DateTime<Utc>) -> u64 {
    let secs = time.timestamp() + FILETIME_UNIX_OFFSET_SECS;
    if secs < 0 {
        return 0;
    }
    secs as u64 * 10_000_000 + (time.timestamp_subsec_nanos() / 100) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_entry_layout() {
        let mut entry = DirEntry::stream("Data");
        entry.set_stream_location(3, 100);
        entry.color = COLOR_RED;
        entry.left = 7;
        let bytes = entry.encode();

        assert_eq!(bytes.len(), DIRENTRY_SIZE);
        assert_eq!(&bytes[0..8], &[b'D', 0, b'a', 0, b't', 0, b'a', 0]);
        assert_eq!(&bytes[64..66], &10u16.to_le_bytes());
        assert_eq!(bytes[66], STGTY_STREAM);
        assert_eq!(bytes[67], COLOR_RED);
        assert_eq!(&bytes[68..72], &7u32.to_le_bytes());
        assert_eq!(&bytes[76..80], &NOSTREAM.to_le_bytes());
        assert_eq!(&bytes[116..120], &3u32.to_le_bytes());
        assert_eq!(&bytes[120..128], &100u64.to_le_bytes());

        let decoded = DirEntry::decode(&bytes, 1, Version::V3).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_unused_entry_encoding() {
        let bytes = DirEntry::unused().encode();
        assert!(bytes[..68].iter().all(|&b| b == 0));
        assert!(bytes[68..80].iter().all(|&b| b == 0xFF));
        assert!(DirEntry::decode(&bytes, 4, Version::V3).unwrap().is_unused());
    }

    #[test]
    fn test_decode_rejects_bad_records() {
        let mut bytes = DirEntry::stream("x").encode();
        bytes[66] = 9;
        assert!(DirEntry::decode(&bytes, 2, Version::V3).unwrap_err().is_corrupted());

        let mut bytes = DirEntry::stream("x").encode();
        bytes[64..66].copy_from_slice(&66u16.to_le_bytes());
        assert!(DirEntry::decode(&bytes, 2, Version::V3).unwrap_err().is_corrupted());
    }

    #[test]
    fn test_v3_size_masks_high_bits() {
        let mut entry = DirEntry::stream("big");
        entry.set_stream_location(5, 0x1_0000_0010);
        let bytes = entry.encode();
        let v3 = DirEntry::decode(&bytes, 1, Version::V3).unwrap();
        assert_eq!(v3.stream_location(), Some((5, 0x10)));
        let v4 = DirEntry::decode(&bytes, 1, Version::V4).unwrap();
        assert_eq!(v4.stream_location(), Some((5, 0x1_0000_0010)));
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name(&"a".repeat(31)).is_ok());
        assert!(matches!(validate_name(&"a".repeat(32)), Err(Error::InvalidName(_))));
        assert!(matches!(validate_name(""), Err(Error::InvalidName(_))));
        assert!(matches!(validate_name("a/b"), Err(Error::InvalidName(_))));
        assert!(matches!(validate_name("a!"), Err(Error::InvalidName(_))));
    }

    #[test]
    fn test_name_ordering() {
        assert_eq!(compare_names("abc", "ABC"), Ordering::Equal);
        assert_eq!(compare_names("ab", "abc"), Ordering::Less);
        assert_eq!(compare_names("zz", "aaa"), Ordering::Less);
        assert_eq!(compare_names("abd", "ABC"), Ordering::Greater);
        assert_eq!(compare_names("\u{e9}t\u{e9}", "\u{c9}T\u{c9}"), Ordering::Equal);
    }

    #[test]
    fn test_clsid_display() {
        let clsid = Clsid([
            0x06, 0x09, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0xC0, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x46,
        ]);
        assert_eq!(clsid.to_string(), "00020906-0000-0000-C000-000000000046");
        assert!(Clsid::NIL.is_nil());
    }

    #[test]
    fn test_filetime_conversion() {
        assert_eq!(filetime_to_datetime(0), None);
        let time = Utc.with_ymd_and_hms(2020, 5, 17, 12, 30, 0).unwrap();
        let filetime = datetime_to_filetime(time);
        assert_eq!(filetime_to_datetime(filetime), Some(time));
        // 1970-01-01 is 11644473600 seconds after 1601-01-01
        let epoch = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(datetime_to_filetime(epoch), 116_444_736_000_000_000);
    }
}
