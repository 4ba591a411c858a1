use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, RwLock};

use crate::core::error::{Error, Result};
use crate::core::geometry::Geometry;
use crate::core::name::RecordName;
use crate::index::delta_page::DeltaIndexPage;
use crate::index::page_map::IndexPageMap;

/// Consecutive search misses on one cached chapter before searches of it are
/// skipped. Scaled down by the zone count since only zone zero keeps score.
const SKIP_SEARCH_THRESHOLD: u64 = 20_000;

/// Sentinel for a slot holding no chapter.
const EMPTY_CHAPTER: u64 = u64::MAX;

const ZONE_ZERO: usize = 0;

/// The full index of one sparse chapter, held in memory.
struct CachedChapter {
    virtual_chapter: u64,
    index_pages: Vec<DeltaIndexPage>,
}

/// One cache slot. The chapter data is only rewritten inside the update
/// critical section, while every zone thread is parked at a barrier; the
/// RwLock makes the read paths sound without contention.
struct Slot {
    chapter: RwLock<CachedChapter>,
    /// Read by every zone on each search, written only by zone zero.
    skip_search: AtomicBool,
    search_hits: AtomicU64,
    search_misses: AtomicU64,
    consecutive_misses: AtomicU64,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            chapter: RwLock::new(CachedChapter {
                virtual_chapter: EMPTY_CHAPTER,
                index_pages: Vec::new(),
            }),
            skip_search: AtomicBool::new(false),
            search_hits: AtomicU64::new(0),
            search_misses: AtomicU64::new(0),
            consecutive_misses: AtomicU64::new(0),
        }
    }

    /// Check before setting to reduce cache line contention.
    fn set_skip_search(&self, skip: bool) {
        if self.skip_search.load(Ordering::Relaxed) != skip {
            self.skip_search.store(skip, Ordering::Relaxed);
        }
    }
}

/// Per-zone recency ordering over the cache slots. Entries before
/// `first_dead_entry` reference chapters worth searching, most recently used
/// first; the rest are dead (empty or fallen off the volume) and are reused
/// before any live chapter is evicted.
#[derive(Clone)]
struct SearchList {
    entries: Vec<u8>,
    first_dead_entry: usize,
}

impl SearchList {
    fn new(capacity: usize) -> SearchList {
        SearchList {
            entries: (0..capacity as u8).collect(),
            first_dead_entry: 0,
        }
    }

    /// Move the entry at the end of the prefix to the front, shifting the
    /// rest down. Rotating a dead entry into the live prefix revives it.
    fn rotate(&mut self, prefix_length: usize) -> u8 {
        let most_recent = self.entries[prefix_length - 1];
        if prefix_length > 1 {
            self.entries.copy_within(0..prefix_length - 1, 1);
            self.entries[0] = most_recent;
        }
        if self.first_dead_entry < prefix_length {
            self.first_dead_entry += 1;
        }
        most_recent
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SparseCacheStats {
    pub chapter_hits: u64,
    pub chapter_misses: u64,
    pub search_hits: u64,
    pub search_misses: u64,
    /// Evictions of chapters that had already fallen off the volume.
    pub invalidations: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    chapter_hits: AtomicU64,
    chapter_misses: AtomicU64,
    search_hits: AtomicU64,
    search_misses: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
}

/// Cache of fully-loaded sparse chapter indexes, shared by all zone threads.
///
/// Reads never take a cache-wide lock: each zone owns a private search list,
/// so between updates a zone thread only touches its own list and the slot
/// RwLocks (never write-contended outside an update). A chapter is added by
/// every zone thread calling `update` with the same chapter number; the two
/// barriers fence off a critical section in which the zone zero thread is
/// captain and may restructure the cache while the other zones stand still.
pub struct SparseCache {
    capacity: usize,
    /// Zone zero only counts its own misses, so the threshold shrinks with
    /// the zone count to trigger at the same overall miss rate.
    skip_search_threshold: u64,
    slots: Vec<CachePadded<Slot>>,
    search_lists: Vec<Mutex<SearchList>>,
    begin_update: Barrier,
    end_update: Barrier,
    counters: Counters,
}

impl SparseCache {
    pub fn new(capacity: usize, zone_count: usize) -> Result<SparseCache> {
        if capacity == 0 || capacity > usize::from(u8::MAX) {
            return Err(Error::invalid_argument(format!(
                "sparse cache capacity {} out of range",
                capacity
            )));
        }
        if zone_count == 0 {
            return Err(Error::invalid_argument("sparse cache needs a zone"));
        }

        Ok(SparseCache {
            capacity,
            skip_search_threshold: SKIP_SEARCH_THRESHOLD / zone_count as u64,
            slots: (0..capacity).map(|_| CachePadded::new(Slot::new())).collect(),
            search_lists: (0..zone_count)
                .map(|_| Mutex::new(SearchList::new(capacity)))
                .collect(),
            begin_update: Barrier::new(zone_count),
            end_update: Barrier::new(zone_count),
            counters: Counters::default(),
        })
    }

    pub fn stats(&self) -> SparseCacheStats {
        SparseCacheStats {
            chapter_hits: self.counters.chapter_hits.load(Ordering::Relaxed),
            chapter_misses: self.counters.chapter_misses.load(Ordering::Relaxed),
            search_hits: self.counters.search_hits.load(Ordering::Relaxed),
            search_misses: self.counters.search_misses.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn score_search_hit(&self, slot: &Slot) {
        Self::bump(&self.counters.search_hits);
        Self::bump(&slot.search_hits);
        slot.consecutive_misses.store(0, Ordering::Relaxed);
        slot.set_skip_search(false);
    }

    fn score_search_miss(&self, slot: &Slot) {
        Self::bump(&self.counters.search_misses);
        Self::bump(&slot.search_misses);
        let misses = slot.consecutive_misses.fetch_add(1, Ordering::Relaxed) + 1;
        if misses > self.skip_search_threshold {
            slot.set_skip_search(true);
        }
    }

    fn score_eviction(&self, slot: &Slot, oldest_virtual_chapter: u64) {
        let chapter = slot.chapter.read();
        if chapter.virtual_chapter == EMPTY_CHAPTER {
            return;
        }
        if chapter.virtual_chapter < oldest_virtual_chapter {
            Self::bump(&self.counters.invalidations);
        } else {
            Self::bump(&self.counters.evictions);
        }
    }

    /// Whether `virtual_chapter` is cached, refreshing its recency in this
    /// zone's search list.
    ///
    /// Between updates the answer for a given chapter must be identical
    /// across zones, even if the chapter has fallen off the volume or its
    /// searches are disabled: the update barriers rely on every zone thread
    /// agreeing on whether to enter them.
    pub fn contains(&self, virtual_chapter: u64, zone: usize) -> bool {
        let mut list = self.search_lists[zone].lock();
        for position in 0..list.first_dead_entry {
            let slot = &self.slots[usize::from(list.entries[position])];
            if slot.chapter.read().virtual_chapter == virtual_chapter {
                if zone == ZONE_ZERO {
                    Self::bump(&self.counters.chapter_hits);
                    slot.set_skip_search(false);
                }
                list.rotate(position + 1);
                return true;
            }
        }

        if zone == ZONE_ZERO {
            Self::bump(&self.counters.chapter_misses);
        }
        false
    }

    /// Resort a search list into live, skipped, and dead sets, keeping the
    /// recency order within each. Only called inside the update critical
    /// section.
    fn purge_list(&self, list: &mut SearchList, oldest_virtual_chapter: u64) {
        if list.first_dead_entry == 0 {
            return;
        }

        let mut alive = Vec::with_capacity(self.capacity);
        let mut skipped = Vec::with_capacity(self.capacity);
        let mut dead = Vec::with_capacity(self.capacity);
        for &entry in &list.entries[..list.first_dead_entry] {
            let slot = &self.slots[usize::from(entry)];
            let virtual_chapter = slot.chapter.read().virtual_chapter;
            if virtual_chapter == EMPTY_CHAPTER || virtual_chapter < oldest_virtual_chapter {
                dead.push(entry);
            } else if slot.skip_search.load(Ordering::Relaxed) {
                skipped.push(entry);
            } else {
                alive.push(entry);
            }
        }

        list.first_dead_entry = alive.len() + skipped.len();
        let mut next = 0;
        for entry in alive.into_iter().chain(skipped).chain(dead) {
            list.entries[next] = entry;
            next += 1;
        }
    }

    fn load_chapter<F>(&self, victim: usize, virtual_chapter: u64, load: F) -> Result<()>
    where
        F: FnOnce(u64) -> Result<Vec<DeltaIndexPage>>,
    {
        let slot = &self.slots[victim];
        let mut chapter = slot.chapter.write();

        // Mark the slot unused first so a failed read leaves it dead.
        chapter.virtual_chapter = EMPTY_CHAPTER;
        chapter.index_pages = load(virtual_chapter)?;

        slot.search_hits.store(0, Ordering::Relaxed);
        slot.search_misses.store(0, Ordering::Relaxed);
        slot.consecutive_misses.store(0, Ordering::Relaxed);
        slot.set_skip_search(false);
        chapter.virtual_chapter = virtual_chapter;
        Ok(())
    }

    /// Make `virtual_chapter` resident, reading its index pages with `load`.
    ///
    /// Every zone thread must call this with the same chapter number to
    /// enter the barriers together. Zone zero evicts and loads between the
    /// barriers and then replaces every other zone's search list with its
    /// own; the other zones do nothing but wait. Only zone zero sees a read
    /// failure.
    pub fn update<F>(
        &self,
        zone: usize,
        virtual_chapter: u64,
        oldest_virtual_chapter: u64,
        load: F,
    ) -> Result<()>
    where
        F: FnOnce(u64) -> Result<Vec<DeltaIndexPage>>,
    {
        if self.contains(virtual_chapter, zone) {
            return Ok(());
        }

        self.begin_update.wait();

        let mut result = Ok(());
        if zone == ZONE_ZERO {
            let mut zone_zero_list = self.search_lists[ZONE_ZERO].lock();
            self.purge_list(&mut zone_zero_list, oldest_virtual_chapter);

            if virtual_chapter >= oldest_virtual_chapter {
                // Rotating the full list pulls the last entry to the front,
                // so a dead slot is reused before any live chapter goes.
                let victim = usize::from(zone_zero_list.rotate(self.capacity));
                self.score_eviction(&self.slots[victim], oldest_virtual_chapter);
                result = self.load_chapter(victim, virtual_chapter, load);
            }

            for zone_list in &self.search_lists[1..] {
                *zone_list.lock() = zone_zero_list.clone();
            }
        }

        self.end_update.wait();
        result
    }

    /// Search every searchable cached chapter for `name`, most recent first,
    /// or only `requested_chapter` when one is given. A hit reports the
    /// chapter and record page and refreshes recency; zone zero also keeps
    /// the scores that drive skip-search.
    pub fn search(
        &self,
        zone: usize,
        name: &RecordName,
        requested_chapter: Option<u64>,
        oldest_virtual_chapter: u64,
        geometry: &Geometry,
        page_map: &IndexPageMap,
    ) -> Result<Option<(u64, u16)>> {
        let mut list = self.search_lists[zone].lock();
        for position in 0..list.first_dead_entry {
            let slot = &self.slots[usize::from(list.entries[position])];
            let chapter = slot.chapter.read();

            if chapter.virtual_chapter == EMPTY_CHAPTER
                || chapter.virtual_chapter < oldest_virtual_chapter
            {
                continue;
            }
            match requested_chapter {
                Some(requested) => {
                    if requested != chapter.virtual_chapter {
                        continue;
                    }
                }
                None => {
                    if slot.skip_search.load(Ordering::Relaxed) {
                        continue;
                    }
                }
            }

            let physical_chapter = geometry.map_to_physical_chapter(chapter.virtual_chapter);
            let page_number = page_map.find_index_page(physical_chapter, name, geometry);
            let record_page = chapter.index_pages[page_number as usize].search(name, geometry)?;

            if let Some(record_page) = record_page {
                if zone == ZONE_ZERO {
                    self.score_search_hit(slot);
                }
                let virtual_chapter = chapter.virtual_chapter;
                drop(chapter);
                list.rotate(position + 1);
                // This might be a false match while a true match exists in
                // another chapter, but that is too rare to search past.
                return Ok(Some((virtual_chapter, record_page)));
            }

            if zone == ZONE_ZERO {
                self.score_search_miss(slot);
            }
            if requested_chapter.is_some() {
                break;
            }
        }

        Ok(None)
    }

    /// Drop every cached chapter. The caller must guarantee no zone thread
    /// is searching.
    pub fn invalidate(&self) {
        for slot in &self.slots {
            let mut chapter = slot.chapter.write();
            chapter.virtual_chapter = EMPTY_CHAPTER;
            chapter.index_pages = Vec::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::index::page_builder::ChapterIndexBuilder;

    const NONCE: u64 = 0x0102_0304_0506_0708;

    fn test_geometry() -> Geometry {
        Geometry::new(4096, 4, 64, 48).unwrap()
    }

    fn name_for(chapter: u64, record: u32) -> RecordName {
        let mut name = [0u8; 16];
        name[0..8].copy_from_slice(&chapter.to_be_bytes());
        name[8..12].copy_from_slice(&record.to_be_bytes());
        name[12..16].copy_from_slice(&record.wrapping_mul(2654435761).to_be_bytes());
        RecordName(name)
    }

    // Build a real chapter index so searches exercise the page decoder.
    fn build_chapter(
        geometry: &Geometry,
        page_map: &mut IndexPageMap,
        virtual_chapter: u64,
        records: u32,
    ) -> Vec<DeltaIndexPage> {
        let mut builder = ChapterIndexBuilder::new(geometry, virtual_chapter, NONCE);
        for record in 0..records {
            let page = record % geometry.record_pages_per_chapter;
            builder.put(&name_for(virtual_chapter, record), page, geometry).unwrap();
        }

        let physical_chapter = geometry.map_to_physical_chapter(virtual_chapter);
        let mut pages = Vec::new();
        for (index_page, (memory, last_list)) in
            builder.pack_all(geometry).unwrap().into_iter().enumerate()
        {
            page_map.update(virtual_chapter, physical_chapter, index_page as u32, last_list);
            pages.push(DeltaIndexPage::parse(memory, NONCE, geometry).unwrap());
        }
        pages
    }

    fn install(
        cache: &SparseCache,
        geometry: &Geometry,
        page_map: &mut IndexPageMap,
        virtual_chapter: u64,
        oldest: u64,
    ) {
        let pages = build_chapter(geometry, page_map, virtual_chapter, 100);
        cache
            .update(0, virtual_chapter, oldest, move |_| Ok(pages))
            .unwrap();
    }

    #[test]
    fn dead_slots_are_reused_before_live_chapters() {
        let geometry = test_geometry();
        let mut page_map = IndexPageMap::new(&geometry);
        let cache = SparseCache::new(3, 1).unwrap();

        for chapter in 10..13 {
            install(&cache, &geometry, &mut page_map, chapter, 10);
        }
        assert!(cache.contains(10, 0));
        assert!(cache.contains(11, 0));
        assert!(cache.contains(12, 0));

        // Chapter 10 falls off the volume; its slot must be the one reused
        // even though other chapters are less recently used.
        install(&cache, &geometry, &mut page_map, 13, 11);
        assert!(!cache.contains(10, 0));
        assert!(cache.contains(11, 0));
        assert!(cache.contains(12, 0));
        assert!(cache.contains(13, 0));

        let stats = cache.stats();
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.evictions, 0);

        // No dead slot this time, so the least recently used chapter goes.
        // The contains() calls above made chapter 11 the LRU entry.
        install(&cache, &geometry, &mut page_map, 14, 11);
        assert!(!cache.contains(11, 0));
        assert!(cache.contains(12, 0));
        assert!(cache.contains(13, 0));
        assert!(cache.contains(14, 0));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn update_returns_early_when_already_cached() {
        let geometry = test_geometry();
        let mut page_map = IndexPageMap::new(&geometry);
        let cache = SparseCache::new(2, 1).unwrap();

        install(&cache, &geometry, &mut page_map, 5, 0);
        // A second update of the same chapter must not load or evict.
        cache
            .update(0, 5, 0, |_| panic!("reload of a cached chapter"))
            .unwrap();
        assert_eq!(cache.stats().evictions + cache.stats().invalidations, 0);
    }

    #[test]
    fn failed_load_leaves_slot_dead() {
        let cache = SparseCache::new(2, 1).unwrap();

        let result = cache.update(0, 7, 0, |_| {
            Err(Error::corrupt("chapter index page failed verification"))
        });
        assert!(result.is_err());
        assert!(!cache.contains(7, 0));
    }

    #[test]
    fn zones_agree_on_membership_and_search_results() {
        let geometry = Arc::new(test_geometry());
        let mut page_map = IndexPageMap::new(&geometry);
        let pages = build_chapter(&geometry, &mut page_map, 20, 200);
        let expected: Vec<u16> = (0..200)
            .map(|record| (record % geometry.record_pages_per_chapter) as u16)
            .collect();
        let page_map = Arc::new(page_map);
        let cache = Arc::new(SparseCache::new(2, 2).unwrap());

        let pages = Mutex::new(Some(pages));
        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for zone in 0..2usize {
                let cache = Arc::clone(&cache);
                let geometry = Arc::clone(&geometry);
                let page_map = Arc::clone(&page_map);
                let pages = &pages;
                let expected = &expected;
                handles.push(scope.spawn(move || {
                    // Both zones must request the update to pass the
                    // barriers; only zone zero's loader runs.
                    cache
                        .update(zone, 20, 0, |_| Ok(pages.lock().take().unwrap()))
                        .unwrap();
                    assert!(cache.contains(20, zone));
                    assert!(!cache.contains(21, zone));

                    for record in 0..200u32 {
                        let found = cache
                            .search(zone, &name_for(20, record), None, 0, &geometry, &page_map)
                            .unwrap();
                        assert_eq!(found, Some((20, expected[record as usize])));
                    }
                    // Record 448 hashes to delta list 7, which records
                    // 0..200 never touch, so this is a guaranteed miss.
                    let absent = cache
                        .search(zone, &name_for(20, 448), None, 0, &geometry, &page_map)
                        .unwrap();
                    assert_eq!(absent, None);
                }));
            }
            for handle in handles {
                handle.join().unwrap();
            }
        });

        // Only zone zero kept score.
        let stats = cache.stats();
        assert_eq!(stats.chapter_hits, 1);
        assert_eq!(stats.chapter_misses, 2);
        assert_eq!(stats.search_hits, 200);
        assert_eq!(stats.search_misses, 1);
    }

    #[test]
    fn skip_search_engages_and_recovers_on_a_hit() {
        let geometry = test_geometry();
        let mut page_map = IndexPageMap::new(&geometry);
        let cache = SparseCache::new(1, 1).unwrap();
        install(&cache, &geometry, &mut page_map, 30, 0);

        let present = name_for(30, 1);
        assert!(
            cache
                .search(0, &present, None, 0, &geometry, &page_map)
                .unwrap()
                .is_some()
        );

        // Miss until the chapter is marked not worth searching. Record 448
        // hashes to delta list 7, untouched by records 0..100.
        let absent = name_for(30, 448);
        for _ in 0..=cache.skip_search_threshold {
            let found = cache
                .search(0, &absent, None, 0, &geometry, &page_map)
                .unwrap();
            assert_eq!(found, None);
        }

        // The chapter is now skipped even for a name it holds.
        assert_eq!(
            cache
                .search(0, &present, None, 0, &geometry, &page_map)
                .unwrap(),
            None
        );

        // An exact chapter request ignores skip-search, and the hit turns
        // searching back on.
        assert!(
            cache
                .search(0, &present, Some(30), 0, &geometry, &page_map)
                .unwrap()
                .is_some()
        );
        assert!(
            cache
                .search(0, &present, None, 0, &geometry, &page_map)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn invalidate_empties_the_cache() {
        let geometry = test_geometry();
        let mut page_map = IndexPageMap::new(&geometry);
        let cache = SparseCache::new(2, 1).unwrap();
        install(&cache, &geometry, &mut page_map, 40, 0);

        cache.invalidate();
        assert!(!cache.contains(40, 0));
        assert_eq!(
            cache
                .search(0, &name_for(40, 0), None, 0, &geometry, &page_map)
                .unwrap(),
            None
        );
    }
}
