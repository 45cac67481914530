//! Compound file header
//!
//! Parses and produces the 512-byte header that opens every compound file:
//! signature, version/geometry, FAT/MiniFAT/DIFAT/directory locations and the
//! first 109 DIFAT slots. For version 4 files the header occupies the whole
//! first 4096-byte sector; the bytes after the 512-byte structure are zero.

use crate::config::Version;
use crate::consts::*;
use crate::error::{Error, Result};
use zerocopy::{FromBytes, IntoBytes, LE, U16, U32};
use zerocopy_derive::{
    FromBytes as DeriveFromBytes, Immutable as DeriveImmutable, IntoBytes as DeriveIntoBytes,
    KnownLayout as DeriveKnownLayout,
};

/// Raw header structure (512 bytes), in on-disk field order.
#[derive(Debug, Clone, DeriveFromBytes, DeriveIntoBytes, DeriveImmutable, DeriveKnownLayout)]
#[repr(C)]
struct RawHeader {
    signature: [u8; 8],
    clsid: [u8; 16],
    minor_version: U16<LE>,
    major_version: U16<LE>,
    byte_order: U16<LE>,
    sector_shift: U16<LE>,
    mini_sector_shift: U16<LE>,
    reserved: [u8; 6],
    /// csectDir, always 0 for version 3
    num_dir_sectors: U32<LE>,
    num_fat_sectors: U32<LE>,
    first_dir_sector: U32<LE>,
    transaction_signature: U32<LE>,
    mini_stream_cutoff: U32<LE>,
    first_minifat_sector: U32<LE>,
    num_minifat_sectors: U32<LE>,
    first_difat_sector: U32<LE>,
    num_difat_sectors: U32<LE>,
    difat: [U32<LE>; HEADER_DIFAT_SLOTS],
}

/// Decoded header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub version: Version,
    pub minor_version: u16,
    pub transaction_signature: u32,
    pub num_dir_sectors: u32,
    pub num_fat_sectors: u32,
    pub first_dir_sector: u32,
    pub mini_stream_cutoff: u32,
    pub first_minifat_sector: u32,
    pub num_minifat_sectors: u32,
    pub first_difat_sector: u32,
    pub num_difat_sectors: u32,
    /// Inline DIFAT slots; unused slots hold FREESECT
    pub difat: [u32; HEADER_DIFAT_SLOTS],
}

impl Header {
    /// Header of an empty file of the given generation
    pub fn new(version: Version) -> Self {
        Self {
            version,
            minor_version: MINOR_VERSION,
            transaction_signature: 0,
            num_dir_sectors: 0,
            num_fat_sectors: 0,
            first_dir_sector: ENDOFCHAIN,
            mini_stream_cutoff: MINI_STREAM_CUTOFF,
            first_minifat_sector: ENDOFCHAIN,
            num_minifat_sectors: 0,
            first_difat_sector: ENDOFCHAIN,
            num_difat_sectors: 0,
            difat: [FREESECT; HEADER_DIFAT_SLOTS],
        }
    }

    pub fn sector_size(&self) -> usize {
        self.version.sector_size()
    }

    /// Parse and validate the header from the first bytes of a file
    pub fn parse(data: &[u8]) -> Result<Self> {
        let bytes = data.get(..HEADER_SIZE).ok_or_else(|| {
            Error::corrupted(format!(
                "file too short for a header: {} bytes, need {}",
                data.len(),
                HEADER_SIZE
            ))
        })?;
        let raw = RawHeader::read_from_bytes(bytes)
            .map_err(|_| Error::corrupted("failed to decode header"))?;

        if &raw.signature != MAGIC {
            return Err(Error::corrupted("invalid signature, not a compound file"));
        }
        if raw.byte_order.get() != BYTE_ORDER_LE {
            return Err(Error::corrupted(format!(
                "invalid byte order mark 0x{:04X}",
                raw.byte_order.get()
            )));
        }

        let major = raw.major_version.get();
        let version = Version::from_major(major)
            .ok_or_else(|| Error::corrupted(format!("unsupported major version {major}")))?;

        // Validate sector size matches version
        let sector_shift = raw.sector_shift.get();
        if sector_shift != version.sector_shift() {
            return Err(Error::corrupted(format!(
                "sector shift {sector_shift} does not match major version {major}"
            )));
        }
        let mini_shift = raw.mini_sector_shift.get();
        if 1usize.checked_shl(mini_shift as u32) != Some(MINI_SECTOR_SIZE) {
            return Err(Error::corrupted(format!("invalid mini sector shift {mini_shift}")));
        }
        let cutoff = raw.mini_stream_cutoff.get();
        if cutoff != MINI_STREAM_CUTOFF {
            return Err(Error::corrupted(format!("invalid mini stream cutoff {cutoff}")));
        }

        let mut difat = [FREESECT; HEADER_DIFAT_SLOTS];
        for (slot, value) in difat.iter_mut().zip(raw.difat.iter()) {
            *slot = value.get();
        }

        Ok(Self {
            version,
            minor_version: raw.minor_version.get(),
            transaction_signature: raw.transaction_signature.get(),
            num_dir_sectors: raw.num_dir_sectors.get(),
            num_fat_sectors: raw.num_fat_sectors.get(),
            first_dir_sector: raw.first_dir_sector.get(),
            mini_stream_cutoff: cutoff,
            first_minifat_sector: raw.first_minifat_sector.get(),
            num_minifat_sectors: raw.num_minifat_sectors.get(),
            first_difat_sector: raw.first_difat_sector.get(),
            num_difat_sectors: raw.num_difat_sectors.get(),
            difat,
        })
    }

    /// Generate the header block: one full sector with the 512-byte header
    /// populated and the rest zero-filled
    pub fn to_block(&self) -> Vec<u8> {
        let mut difat = [U32::<LE>::new(FREESECT); HEADER_DIFAT_SLOTS];
        for (slot, &value) in difat.iter_mut().zip(self.difat.iter()) {
            *slot = U32::new(value);
        }

        let raw = RawHeader {
            signature: *MAGIC,
            clsid: [0; 16],
            minor_version: U16::new(self.minor_version),
            major_version: U16::new(self.version.major()),
            byte_order: U16::new(BYTE_ORDER_LE),
            sector_shift: U16::new(self.version.sector_shift()),
            mini_sector_shift: U16::new(6),
            reserved: [0; 6],
            // For 512-byte sectors, this must be 0
            num_dir_sectors: U32::new(match self.version {
                Version::V3 => 0,
                Version::V4 => self.num_dir_sectors,
            }),
            num_fat_sectors: U32::new(self.num_fat_sectors),
            first_dir_sector: U32::new(self.first_dir_sector),
            transaction_signature: U32::new(self.transaction_signature),
            mini_stream_cutoff: U32::new(self.mini_stream_cutoff),
            first_minifat_sector: U32::new(self.first_minifat_sector),
            num_minifat_sectors: U32::new(self.num_minifat_sectors),
            first_difat_sector: U32::new(self.first_difat_sector),
            num_difat_sectors: U32::new(self.num_difat_sectors),
            difat,
        };

        let mut block = vec![0u8; self.sector_size()];
        block[..HEADER_SIZE].copy_from_slice(raw.as_bytes());
        block
    }
}
