use crate::core::geometry::Geometry;
use crate::core::name::RecordName;

/// Routes a name to the index page holding its delta list.
///
/// Conceptually a two-dimensional array indexed by physical chapter and
/// index page, each entry the largest delta list number on that page. The
/// last page of each chapter is not recorded; its bound follows from the
/// geometry.
pub struct IndexPageMap {
    entries: Vec<u16>,
    entries_per_chapter: u32,
    delta_lists_per_chapter: u32,
    last_update: u64,
}

impl IndexPageMap {
    pub fn new(geometry: &Geometry) -> IndexPageMap {
        let entries_per_chapter = geometry.index_pages_per_chapter - 1;
        IndexPageMap {
            entries: vec![0; (geometry.chapters_per_volume * entries_per_chapter) as usize],
            entries_per_chapter,
            delta_lists_per_chapter: geometry.delta_lists_per_chapter,
            last_update: 0,
        }
    }

    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    pub fn update(
        &mut self,
        virtual_chapter: u64,
        chapter: u32,
        index_page: u32,
        last_list: u32,
    ) {
        self.last_update = virtual_chapter;
        if index_page == self.entries_per_chapter {
            return;
        }
        let slot = (chapter * self.entries_per_chapter + index_page) as usize;
        self.entries[slot] = last_list as u16;
    }

    /// The index page within `chapter` whose list range covers `name`.
    pub fn find_index_page(&self, chapter: u32, name: &RecordName, geometry: &Geometry) -> u32 {
        let list = name.chapter_delta_list(geometry);
        let slot = (chapter * self.entries_per_chapter) as usize;
        let mut page = 0;
        while page < self.entries_per_chapter {
            if list <= u32::from(self.entries[slot + page as usize]) {
                break;
            }
            page += 1;
        }
        page
    }

    /// Inclusive delta-list bounds of one index page.
    pub fn list_bounds(&self, chapter: u32, index_page: u32) -> (u32, u32) {
        let slot = (chapter * self.entries_per_chapter) as usize;
        let lowest = if index_page == 0 {
            0
        } else {
            u32::from(self.entries[slot + index_page as usize - 1]) + 1
        };
        let highest = if index_page < self.entries_per_chapter {
            u32::from(self.entries[slot + index_page as usize])
        } else {
            self.delta_lists_per_chapter - 1
        };
        (lowest, highest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_for_list(list: u32, geometry: &Geometry) -> RecordName {
        let bytes = u64::from(list) << crate::core::geometry::CHAPTER_ADDRESS_BITS;
        let mut name = RecordName([0; 16]);
        name.0[8..10].copy_from_slice(&(((bytes >> 32) as u16).to_be_bytes()));
        name.0[10..14].copy_from_slice(&((bytes as u32).to_be_bytes()));
        assert_eq!(name.chapter_delta_list(geometry), list);
        name
    }

    // Geometry with 8 delta lists and a handful of index pages.
    fn map_with_bounds(bounds: &[u32]) -> (Geometry, IndexPageMap) {
        let mut geometry = Geometry::new(4096, 4, 4, 0).unwrap();
        geometry.index_pages_per_chapter = bounds.len() as u32 + 1;
        let mut map = IndexPageMap::new(&geometry);
        for (page, &last_list) in bounds.iter().enumerate() {
            map.update(9, 2, page as u32, last_list);
        }
        (geometry, map)
    }

    #[test]
    fn routing_follows_recorded_bounds() {
        let (geometry, map) = map_with_bounds(&[1, 4]);
        assert_eq!(map.find_index_page(2, &name_for_list(0, &geometry), &geometry), 0);
        assert_eq!(map.find_index_page(2, &name_for_list(1, &geometry), &geometry), 0);
        assert_eq!(map.find_index_page(2, &name_for_list(2, &geometry), &geometry), 1);
        assert_eq!(map.find_index_page(2, &name_for_list(4, &geometry), &geometry), 1);
        assert_eq!(map.find_index_page(2, &name_for_list(5, &geometry), &geometry), 2);
        assert_eq!(map.last_update(), 9);
    }

    #[test]
    fn bounds_cover_all_lists() {
        let (_, map) = map_with_bounds(&[1, 4]);
        assert_eq!(map.list_bounds(2, 0), (0, 1));
        assert_eq!(map.list_bounds(2, 1), (2, 4));
        assert_eq!(map.list_bounds(2, 2), (5, 7));
    }

    #[test]
    fn other_chapters_unaffected() {
        let (geometry, map) = map_with_bounds(&[1, 4]);
        // Chapter 0 was never updated, so its recorded bounds are all zero
        // and any nonzero list falls through to the last page.
        assert_eq!(map.find_index_page(0, &name_for_list(7, &geometry), &geometry), 2);
        assert_eq!(map.list_bounds(0, 0), (0, 0));
    }
}
