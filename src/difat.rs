//! DIFAT (Double Indirect FAT) handling
//!
//! The DIFAT lists the sectors that hold the FAT. The header stores the first
//! 109 FAT sector IDs; once the FAT needs more sectors than that, the remaining
//! IDs live in a chain of DIFAT sectors.
//!
//! # Implementation Notes
//!
//! - Each DIFAT sector contains FAT sector IDs and a pointer to the next DIFAT sector
//! - For 512-byte sectors: 127 FAT sector IDs + 1 next pointer (128 * 4 = 512)
//! - For 4096-byte sectors: 1023 FAT sector IDs + 1 next pointer (1024 * 4 = 4096)
//! - The DIFAT chain is linked through the last slot of each DIFAT sector, not
//!   through the FAT; DIFAT sectors are only marked DIFSECT in the FAT

use crate::binary::read_u32_slots;
use crate::consts::*;
use crate::error::{Error, Result};
use crate::header::Header;
use crate::sector::SectorStore;
use fixedbitset::FixedBitSet;

/// FAT sector IDs held by one DIFAT sector
pub(crate) fn ids_per_difat_sector(sector_size: usize) -> usize {
    sector_size / 4 - 1
}

/// Number of DIFAT sectors needed to register `fat_sector_count` FAT sectors
pub(crate) fn difat_sector_count(fat_sector_count: usize, sector_size: usize) -> usize {
    fat_sector_count
        .saturating_sub(HEADER_DIFAT_SLOTS)
        .div_ceil(ids_per_difat_sector(sector_size))
}

/// Location of the FAT as recorded by the header and the DIFAT chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DifatLayout {
    /// Sector IDs of the FAT, in table order
    pub fat_sectors: Vec<u32>,
    /// Sector IDs of the DIFAT chain, in chain order
    pub difat_sectors: Vec<u32>,
}

/// Resolve the FAT sector list from the header's inline DIFAT and the DIFAT chain
///
/// The walk is capped by the sector count and a visited set, so a cyclic DIFAT
/// chain is reported as corruption rather than looping.
pub(crate) fn load(header: &Header, sectors: &mut SectorStore) -> Result<DifatLayout> {
    let sector_count = sectors.len();
    let declared = header.num_fat_sectors as usize;
    let mut layout = DifatLayout::default();

    for &sector in header.difat.iter().take(declared.min(HEADER_DIFAT_SLOTS)) {
        if sector == FREESECT || sector == ENDOFCHAIN {
            break;
        }
        layout.fat_sectors.push(sector);
    }

    let per_sector = ids_per_difat_sector(sectors.sector_size());
    let mut visited = FixedBitSet::with_capacity(sector_count as usize);
    let mut current = header.first_difat_sector;

    while current != ENDOFCHAIN && current != FREESECT && layout.fat_sectors.len() < declared {
        if current >= sector_count {
            return Err(Error::corrupted(format!(
                "DIFAT sector {current} at chain position {} is beyond the {sector_count} sectors",
                layout.difat_sectors.len()
            )));
        }
        if visited.put(current as usize) {
            return Err(Error::corrupted(format!(
                "cyclic DIFAT chain: sector {current} revisited at position {}",
                layout.difat_sectors.len()
            )));
        }
        layout.difat_sectors.push(current);

        let slots = read_u32_slots(sectors.read(current)?);
        for &sector in &slots[..per_sector] {
            if sector == FREESECT || sector == ENDOFCHAIN || layout.fat_sectors.len() >= declared {
                break;
            }
            layout.fat_sectors.push(sector);
        }
        current = slots[per_sector];
    }

    if layout.fat_sectors.len() != declared {
        return Err(Error::corrupted(format!(
            "header declares {declared} FAT sectors, DIFAT lists {}",
            layout.fat_sectors.len()
        )));
    }
    if header.num_difat_sectors as usize != layout.difat_sectors.len() {
        tracing::warn!(
            declared = header.num_difat_sectors,
            found = layout.difat_sectors.len(),
            "DIFAT sector count in header does not match the chain"
        );
    }
    if let Some(&bad) = layout.fat_sectors.iter().find(|&&s| s >= sector_count) {
        return Err(Error::corrupted(format!(
            "FAT sector {bad} is beyond the {sector_count} sectors"
        )));
    }

    Ok(layout)
}

impl DifatLayout {
    /// Fill the header's inline DIFAT slots and DIFAT bookkeeping fields
    pub fn write_header(&self, header: &mut Header) {
        header.difat = [FREESECT; HEADER_DIFAT_SLOTS];
        for (slot, &sector) in header.difat.iter_mut().zip(self.fat_sectors.iter()) {
            *slot = sector;
        }
        header.num_fat_sectors = self.fat_sectors.len() as u32;
        header.num_difat_sectors = self.difat_sectors.len() as u32;
        header.first_difat_sector = self.difat_sectors.first().copied().unwrap_or(ENDOFCHAIN);
    }

    /// Generate DIFAT sectors as bytes, one per entry of `difat_sectors`
    ///
    /// Each DIFAT sector contains:
    /// - FAT sector IDs (as many as will fit)
    /// - Next DIFAT sector ID (or ENDOFCHAIN for last)
    /// - Padding with FREESECT
    pub fn generate_difat_sectors(&self, sector_size: usize) -> Vec<Vec<u8>> {
        let per_sector = ids_per_difat_sector(sector_size);
        let overflow = self.fat_sectors.get(HEADER_DIFAT_SLOTS..).unwrap_or_default();

        self.difat_sectors
            .iter()
            .enumerate()
            .map(|(idx, _)| {
                let mut sector_data = vec![0xFFu8; sector_size]; // Initialize with FREESECT
                let start = (idx * per_sector).min(overflow.len());
                let end = (start + per_sector).min(overflow.len());

                for (i, &fat_sector_id) in overflow[start..end].iter().enumerate() {
                    let offset = i * 4;
                    sector_data[offset..offset + 4].copy_from_slice(&fat_sector_id.to_le_bytes());
                }

                // Write next DIFAT sector pointer (last u32 in sector)
                let next = self
                    .difat_sectors
                    .get(idx + 1)
                    .copied()
                    .unwrap_or(ENDOFCHAIN);
                sector_data[sector_size - 4..].copy_from_slice(&next.to_le_bytes());
                sector_data
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Version;

    #[test]
    fn test_difat_calculation() {
        assert_eq!(difat_sector_count(0, 512), 0);
        assert_eq!(difat_sector_count(109, 512), 0);
        // 150 FAT sectors: 109 in header, 41 need one DIFAT sector
        assert_eq!(difat_sector_count(150, 512), 1);
        // 250 FAT sectors: 141 overflow IDs need 2 DIFAT sectors (127 + 14)
        assert_eq!(difat_sector_count(250, 512), 2);
        // For 4096-byte sectors: 1023 IDs per DIFAT sector
        assert_eq!(difat_sector_count(1200, 4096), 2);
    }

    #[test]
    fn test_difat_multiple_sectors() {
        let layout = DifatLayout {
            fat_sectors: (0..250).collect(),
            difat_sectors: vec![300, 420],
        };
        let sectors = layout.generate_difat_sectors(512);
        assert_eq!(sectors.len(), 2);

        // First DIFAT sector holds overflow ID 109 and points to the second
        let first = read_u32_slots(&sectors[0]);
        assert_eq!(first[0], 109);
        assert_eq!(first[127], 420);
        // Second DIFAT sector has 14 IDs then FREESECT padding and ENDOFCHAIN
        let second = read_u32_slots(&sectors[1]);
        assert_eq!(second[13], 249);
        assert_eq!(second[14], FREESECT);
        assert_eq!(second[127], ENDOFCHAIN);
    }

    #[test]
    fn test_load_round_trip() {
        let mut sectors = SectorStore::in_memory(512);
        for _ in 0..200 {
            sectors.push();
        }
        let layout = DifatLayout {
            fat_sectors: (0..150).collect(),
            difat_sectors: vec![180],
        };
        for (id, data) in layout
            .difat_sectors
            .iter()
            .zip(layout.generate_difat_sectors(512))
        {
            sectors.write_at(*id, 0, &data).unwrap();
        }
        let mut header = Header::new(Version::V3);
        layout.write_header(&mut header);

        assert_eq!(load(&header, &mut sectors).unwrap(), layout);
    }

    #[test]
    fn test_cyclic_difat_chain() {
        let mut sectors = SectorStore::in_memory(512);
        for _ in 0..300 {
            sectors.push();
        }
        // DIFAT sector 250 holds IDs and points back to itself
        let mut data = vec![0u8; 512];
        for i in 0..127 {
            data[i * 4..i * 4 + 4].copy_from_slice(&(i as u32).to_le_bytes());
        }
        data[508..].copy_from_slice(&250u32.to_le_bytes());
        sectors.write_at(250, 0, &data).unwrap();

        let mut header = Header::new(Version::V3);
        header.num_fat_sectors = 109 + 127 * 2;
        header.difat = [0; HEADER_DIFAT_SLOTS];
        header.first_difat_sector = 250;
        header.num_difat_sectors = 2;

        let err = load(&header, &mut sectors).unwrap_err();
        assert!(err.to_string().contains("cyclic DIFAT"));
    }
}
