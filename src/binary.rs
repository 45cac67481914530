//! Little-endian helpers for sector-sized tables.
//!
//! FAT, MiniFAT and DIFAT sectors are plain arrays of little-endian `u32`
//! slots; these helpers convert between those byte images and `u32` slices.

use zerocopy::{FromBytes, LE, U32};

/// Decode a byte slice into little-endian u32 slots, ignoring a trailing
/// partial slot.
pub fn read_u32_slots(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|chunk| {
            U32::<LE>::read_from_bytes(chunk)
                .map(|v| v.get())
                .unwrap_or(u32::MAX)
        })
        .collect()
}

/// Encode u32 slots into `sector_count` sectors of `sector_size` bytes each.
///
/// Slots past the end of `values` are filled with `0xFFFFFFFF` (free).
pub fn write_u32_sectors(values: &[u32], sector_size: usize, sector_count: usize) -> Vec<Vec<u8>> {
    let per_sector = sector_size / 4;
    let mut sectors = Vec::with_capacity(sector_count);

    for sector_idx in 0..sector_count {
        // Initialize with FREESECT (0xFFFFFFFF)
        let mut sector_data = vec![0xFFu8; sector_size];
        let start = (sector_idx * per_sector).min(values.len());
        let end = (start + per_sector).min(values.len());

        for (i, value) in values[start..end].iter().enumerate() {
            let offset = i * 4;
            sector_data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }

        sectors.push(sector_data);
    }

    sectors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_padding() {
        let sectors = write_u32_sectors(&[1, 2, 3], 512, 2);
        assert_eq!(sectors.len(), 2);
        let slots = read_u32_slots(&sectors[0]);
        assert_eq!(&slots[..4], &[1, 2, 3, 0xFFFFFFFF]);
        assert!(read_u32_slots(&sectors[1]).iter().all(|&v| v == 0xFFFFFFFF));
    }

    #[test]
    fn test_read_slots_ignores_partial_slot() {
        let data = [0x78, 0x56, 0x34, 0x12, 0xFF, 0xFF];
        assert_eq!(read_u32_slots(&data), vec![0x12345678]);
    }
}
