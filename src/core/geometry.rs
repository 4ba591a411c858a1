use crate::core::error::{Error, Result};
use crate::index::delta_page;

/// Bytes in one stored record: a 16-byte name plus 16 bytes of location data.
pub const BYTES_PER_RECORD: u32 = 32;

/// The volume header occupies the first physical page.
pub const HEADER_PAGES_PER_VOLUME: u32 = 1;

pub const DEFAULT_BYTES_PER_PAGE: u32 = 32768;
pub const DEFAULT_RECORD_PAGES_PER_CHAPTER: u32 = 256;
pub const SMALL_RECORD_PAGES_PER_CHAPTER: u32 = 64;
pub const DEFAULT_CHAPTERS_PER_VOLUME: u32 = 1024;

/// Width of the per-list address space a name hashes into.
pub const CHAPTER_ADDRESS_BITS: u32 = 22;

/// Mean gap between successive addresses in one delta list.
pub const CHAPTER_MEAN_DELTA: u32 = 1 << 16;

/// Delta lists are sized for a mean of 64 records each.
const MEAN_RECORDS_PER_LIST: u32 = 64;

/// Smallest number of bits holding values `0..=value`.
pub fn bits_per(value: u32) -> u32 {
    if value == 0 { 1 } else { 32 - value.leading_zeros() }
}

/// Fixed shape of one volume: chapter, page, and delta-list arithmetic.
///
/// Everything here is derived once from four inputs and never changes for
/// the life of the volume; both ends of the wire must agree on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub bytes_per_page: u32,
    pub record_pages_per_chapter: u32,
    pub chapters_per_volume: u32,
    pub sparse_chapters_per_volume: u32,

    pub records_per_page: u32,
    pub records_per_chapter: u32,
    pub chapter_delta_list_bits: u32,
    pub delta_lists_per_chapter: u32,
    pub chapter_payload_bits: u32,
    pub index_pages_per_chapter: u32,
    pub pages_per_chapter: u32,
    pub pages_per_volume: u32,
}

impl Geometry {
    pub fn new(
        bytes_per_page: u32,
        record_pages_per_chapter: u32,
        chapters_per_volume: u32,
        sparse_chapters_per_volume: u32,
    ) -> Result<Geometry> {
        if bytes_per_page < BYTES_PER_RECORD {
            return Err(Error::invalid_argument(format!(
                "page size {} smaller than one record",
                bytes_per_page
            )));
        }
        if sparse_chapters_per_volume >= chapters_per_volume {
            return Err(Error::invalid_argument(
                "sparse chapters must leave at least one dense chapter",
            ));
        }

        let records_per_page = bytes_per_page / BYTES_PER_RECORD;
        let records_per_chapter = records_per_page * record_pages_per_chapter;
        let chapter_delta_list_bits =
            bits_per((records_per_chapter - 1) / MEAN_RECORDS_PER_LIST);
        let delta_lists_per_chapter = 1 << chapter_delta_list_bits;
        let chapter_payload_bits = bits_per(record_pages_per_chapter - 1);
        let index_pages_per_chapter = delta_page::index_page_count(
            records_per_chapter,
            delta_lists_per_chapter,
            CHAPTER_MEAN_DELTA,
            chapter_payload_bits,
            bytes_per_page,
        );
        let pages_per_chapter = index_pages_per_chapter + record_pages_per_chapter;
        let pages_per_volume = pages_per_chapter * chapters_per_volume;

        Ok(Geometry {
            bytes_per_page,
            record_pages_per_chapter,
            chapters_per_volume,
            sparse_chapters_per_volume,
            records_per_page,
            records_per_chapter,
            chapter_delta_list_bits,
            delta_lists_per_chapter,
            chapter_payload_bits,
            index_pages_per_chapter,
            pages_per_chapter,
            pages_per_volume,
        })
    }

    pub fn default_geometry() -> Geometry {
        // The inputs are compile-time sane; new() cannot fail on them.
        Geometry::new(
            DEFAULT_BYTES_PER_PAGE,
            DEFAULT_RECORD_PAGES_PER_CHAPTER,
            DEFAULT_CHAPTERS_PER_VOLUME,
            0,
        )
        .unwrap_or_else(|_| unreachable!())
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse_chapters_per_volume > 0
    }

    pub fn dense_chapters(&self) -> u32 {
        self.chapters_per_volume - self.sparse_chapters_per_volume
    }

    /// Physical chapter slot a virtual chapter currently occupies.
    pub fn map_to_physical_chapter(&self, virtual_chapter: u64) -> u32 {
        (virtual_chapter % u64::from(self.chapters_per_volume)) as u32
    }

    /// Physical page number of page `page` within physical chapter `chapter`.
    pub fn physical_page(&self, chapter: u32, page: u32) -> u32 {
        HEADER_PAGES_PER_VOLUME + (self.pages_per_chapter * chapter) + page
    }

    /// Inverse of `physical_page`: (chapter, page-in-chapter).
    pub fn page_location(&self, physical_page: u32) -> (u32, u32) {
        let index = physical_page - HEADER_PAGES_PER_VOLUME;
        (index / self.pages_per_chapter, index % self.pages_per_chapter)
    }

    pub fn is_index_page(&self, page_in_chapter: u32) -> bool {
        page_in_chapter < self.index_pages_per_chapter
    }

    /// Total addressable physical pages, header included.
    pub fn physical_page_count(&self) -> u32 {
        HEADER_PAGES_PER_VOLUME + self.pages_per_volume
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry_shape() {
        let geometry = Geometry::default_geometry();
        assert_eq!(geometry.records_per_page, 1024);
        assert_eq!(geometry.records_per_chapter, 256 * 1024);
        assert_eq!(geometry.chapter_delta_list_bits, 12);
        assert_eq!(geometry.delta_lists_per_chapter, 4096);
        assert_eq!(geometry.chapter_payload_bits, 8);
        assert_eq!(geometry.index_pages_per_chapter, 26);
        assert_eq!(geometry.pages_per_chapter, 26 + 256);
    }

    #[test]
    fn small_geometry_shape() {
        let geometry = Geometry::new(
            DEFAULT_BYTES_PER_PAGE,
            SMALL_RECORD_PAGES_PER_CHAPTER,
            DEFAULT_CHAPTERS_PER_VOLUME,
            0,
        )
        .unwrap();
        assert_eq!(geometry.records_per_chapter, 64 * 1024);
        assert_eq!(geometry.chapter_delta_list_bits, 10);
        assert_eq!(geometry.chapter_payload_bits, 6);
        assert_eq!(geometry.index_pages_per_chapter, 6);
    }

    #[test]
    fn physical_addressing() {
        let geometry = Geometry::default_geometry();
        assert_eq!(geometry.physical_page(0, 0), 1);
        let page = geometry.physical_page(3, 17);
        assert_eq!(geometry.page_location(page), (3, 17));
        assert_eq!(geometry.map_to_physical_chapter(1024 + 5), 5);
    }

    #[test]
    fn sparse_split() {
        let geometry = Geometry::new(4096, 4, 64, 48).unwrap();
        assert!(geometry.is_sparse());
        assert_eq!(geometry.dense_chapters(), 16);
        assert!(Geometry::new(4096, 4, 64, 64).is_err());
    }
}
