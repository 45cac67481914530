//! Constants of the Compound File Binary format.

/// Magic bytes that should be at the beginning of every compound file
pub const MAGIC: &[u8; 8] = b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1";

/// Size of the on-disk header structure (the rest of the first sector is zero)
pub const HEADER_SIZE: usize = 512;

/// Size of a directory entry in bytes
pub const DIRENTRY_SIZE: usize = 128;

/// Sector size for version 3 (512 bytes)
pub const SECTOR_SIZE_V3: usize = 512;

/// Sector size for version 4 (4096 bytes)
pub const SECTOR_SIZE_V4: usize = 4096;

/// Mini sector size, identical for both versions
pub const MINI_SECTOR_SIZE: usize = 64;

/// Streams strictly smaller than this are stored in the mini stream
pub const MINI_STREAM_CUTOFF: u32 = 4096;

/// Number of DIFAT slots stored inline in the header
pub const HEADER_DIFAT_SLOTS: usize = 109;

/// Maximum entry name length in UTF-16 code units, not counting the terminator
pub const MAX_NAME_LEN: usize = 31;

/// Minor version written to new files
pub const MINOR_VERSION: u16 = 0x003E;

/// Byte order mark for little-endian files
pub const BYTE_ORDER_LE: u16 = 0xFFFE;

// Sector IDs (from AAF specifications)
/// Maximum regular sector ID
pub const MAXREGSECT: u32 = 0xFFFFFFFA; // -6
/// Denotes a DIFAT sector in a FAT
pub const DIFSECT: u32 = 0xFFFFFFFC; // -4
/// Denotes a FAT sector in a FAT
pub const FATSECT: u32 = 0xFFFFFFFD; // -3
/// End of a virtual stream chain
pub const ENDOFCHAIN: u32 = 0xFFFFFFFE; // -2
/// Unallocated sector
pub const FREESECT: u32 = 0xFFFFFFFF; // -1

// Directory Entry IDs (from AAF specifications)
/// Maximum directory entry ID
pub const MAXREGSID: u32 = 0xFFFFFFFA; // -6
/// Unallocated directory entry
pub const NOSTREAM: u32 = 0xFFFFFFFF; // -1

// Object types in storage (from AAF specifications)
/// Empty directory entry
pub const STGTY_EMPTY: u8 = 0;
/// Element is a storage object
pub const STGTY_STORAGE: u8 = 1;
/// Element is a stream object
pub const STGTY_STREAM: u8 = 2;
/// Element is a root storage
pub const STGTY_ROOT: u8 = 5;

/// Red node color in a directory entry
pub const COLOR_RED: u8 = 0;
/// Black node color in a directory entry
pub const COLOR_BLACK: u8 = 1;

/// Name of the root storage entry
pub const ROOT_ENTRY_NAME: &str = "Root Entry";

/// Characters that may not appear in an entry name
pub const FORBIDDEN_NAME_CHARS: [char; 4] = ['/', '\\', ':', '!'];

/// Seconds between 1601-01-01 (FILETIME epoch) and 1970-01-01 (Unix epoch)
pub const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;
