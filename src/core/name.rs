use crate::core::geometry::{CHAPTER_ADDRESS_BITS, Geometry};

pub const RECORD_NAME_SIZE: usize = 16;
pub const RECORD_DATA_SIZE: usize = 16;

const CHAPTER_INDEX_BYTES_OFFSET: usize = 8;
const SAMPLE_BYTES_OFFSET: usize = 14;

/// Fingerprint of one data block. Uniformly distributed, so fixed byte
/// ranges of it serve as independent hash fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordName(pub [u8; RECORD_NAME_SIZE]);

/// Opaque location payload stored alongside a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordData(pub [u8; RECORD_DATA_SIZE]);

impl RecordName {
    /// The 48-bit field feeding chapter-index placement, big-endian so the
    /// on-disk format is host-independent.
    fn chapter_index_bytes(&self) -> u64 {
        let b = &self.0[CHAPTER_INDEX_BYTES_OFFSET..CHAPTER_INDEX_BYTES_OFFSET + 6];
        let high = u64::from(u16::from_be_bytes([b[0], b[1]]));
        let low = u64::from(u32::from_be_bytes([b[2], b[3], b[4], b[5]]));
        (high << 32) | low
    }

    /// Delta list this name belongs to within a chapter index.
    pub fn chapter_delta_list(&self, geometry: &Geometry) -> u32 {
        let shifted = self.chapter_index_bytes() >> CHAPTER_ADDRESS_BITS;
        (shifted as u32) & ((1 << geometry.chapter_delta_list_bits) - 1)
    }

    /// Address within the delta list's key space.
    pub fn chapter_delta_address(&self, _geometry: &Geometry) -> u32 {
        (self.chapter_index_bytes() as u32) & ((1 << CHAPTER_ADDRESS_BITS) - 1)
    }

    /// Bytes used for hook sampling decisions, kept disjoint from the
    /// chapter-index field.
    pub fn sample_bytes(&self) -> u16 {
        u16::from_be_bytes([self.0[SAMPLE_BYTES_OFFSET], self.0[SAMPLE_BYTES_OFFSET + 1]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_with_index_bytes(bytes: u64) -> RecordName {
        let mut name = RecordName([0; RECORD_NAME_SIZE]);
        let high = ((bytes >> 32) as u16).to_be_bytes();
        let low = (bytes as u32).to_be_bytes();
        name.0[8..10].copy_from_slice(&high);
        name.0[10..14].copy_from_slice(&low);
        name
    }

    #[test]
    fn delta_list_and_address_split() {
        let geometry = Geometry::default_geometry();
        let address = 0x2A_BCDE;
        let list = 0x0ABC;
        let name = name_with_index_bytes((u64::from(list) << 22) | u64::from(address));
        assert_eq!(name.chapter_delta_address(&geometry), address);
        assert_eq!(name.chapter_delta_list(&geometry), list);
    }

    #[test]
    fn list_masked_to_geometry_width() {
        let geometry = Geometry::new(4096, 4, 64, 0).unwrap();
        let name = name_with_index_bytes(u64::MAX >> 16);
        assert!(name.chapter_delta_list(&geometry) < geometry.delta_lists_per_chapter);
    }

    #[test]
    fn sample_bytes_come_from_tail() {
        let mut name = RecordName([0; RECORD_NAME_SIZE]);
        name.0[14] = 0x12;
        name.0[15] = 0x34;
        assert_eq!(name.sample_bytes(), 0x1234);
    }
}
