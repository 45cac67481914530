//! Open/create options: format generation, update mode and behaviour flags.

use crate::consts::{SECTOR_SIZE_V3, SECTOR_SIZE_V4};
use bitflags::bitflags;

/// Format generation of a compound file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    /// Major version 3, 512-byte sectors
    #[default]
    V3,
    /// Major version 4, 4096-byte sectors
    V4,
}

impl Version {
    /// Sector size in bytes
    pub fn sector_size(self) -> usize {
        match self {
            Version::V3 => SECTOR_SIZE_V3,
            Version::V4 => SECTOR_SIZE_V4,
        }
    }

    /// Sector shift as stored in the header
    pub fn sector_shift(self) -> u16 {
        match self {
            Version::V3 => 9,
            Version::V4 => 12,
        }
    }

    /// Major version number as stored in the header
    pub fn major(self) -> u16 {
        match self {
            Version::V3 => 3,
            Version::V4 => 4,
        }
    }

    pub(crate) fn from_major(major: u16) -> Option<Self> {
        match major {
            3 => Some(Version::V3),
            4 => Some(Version::V4),
            _ => None,
        }
    }
}

/// Access mode for an opened compound file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateMode {
    /// Reads only; every mutating call fails with a read-only violation
    #[default]
    ReadOnly,
    /// Mutations allowed and written back in place by `commit`
    Update,
}

bitflags! {
    /// Behaviour flags applied when opening or creating a compound file
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Configuration: u32 {
        /// Reuse freed sectors and mini sectors before extending the file
        const SECTOR_RECYCLE = 0x0001;
        /// Overwrite the content of freed sectors and mini sectors with zeros
        const ERASE_FREE_SECTORS = 0x0002;
        /// `close` returns the byte store to the caller instead of dropping it
        const LEAVE_OPEN = 0x0004;
    }
}

impl Configuration {
    pub(crate) fn recycle(self) -> bool {
        self.contains(Configuration::SECTOR_RECYCLE)
    }

    pub(crate) fn erase(self) -> bool {
        self.contains(Configuration::ERASE_FREE_SECTORS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_geometry() {
        assert_eq!(Version::V3.sector_size(), 512);
        assert_eq!(1usize << Version::V3.sector_shift(), 512);
        assert_eq!(Version::V4.sector_size(), 4096);
        assert_eq!(1usize << Version::V4.sector_shift(), 4096);
        assert_eq!(Version::from_major(4), Some(Version::V4));
        assert_eq!(Version::from_major(5), None);
    }

    #[test]
    fn test_default_configuration() {
        let config = Configuration::default();
        assert!(!config.recycle());
        assert!(!config.erase());
        let config = Configuration::SECTOR_RECYCLE | Configuration::ERASE_FREE_SECTORS;
        assert!(config.recycle() && config.erase());
    }
}
