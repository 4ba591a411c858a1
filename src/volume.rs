use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use bytes::Bytes;
use parking_lot::{MutexGuard, RwLock};

use crate::cache::page_cache::{CacheState, CachedPage, PageCache, PageRef};
use crate::cache::sparse_cache::{SparseCache, SparseCacheStats};
use crate::cache::{CacheResult, Request, RequestLocation, RequestRestarter};
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::geometry::Geometry;
use crate::core::name::RecordName;
use crate::index::delta_page::DeltaIndexPage;
use crate::index::page_map::IndexPageMap;
use crate::index::record_page::search_record_page;
use crate::storage::store::VolumeStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStats {
    pub hits: u64,
    pub misses: u64,
    pub queued: u64,
    pub chapters_forgotten: u64,
}

#[derive(Default)]
struct VolumeCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    queued: AtomicU64,
    chapters_forgotten: AtomicU64,
}

/// Everything the zone threads and reader threads share. `Volume` owns the
/// reader-thread handles on top of this, so dropping the `Volume` can join
/// them while they still hold their own reference here.
pub struct VolumeShared {
    pub geometry: Geometry,
    nonce: u64,
    store: Arc<dyn VolumeStore>,
    page_map: RwLock<IndexPageMap>,
    page_cache: PageCache,
    sparse_cache: Option<SparseCache>,
    restarter: Arc<dyn RequestRestarter>,
    counters: VolumeCounters,
}

/// Read path of one volume: routes lookups through the page cache, services
/// misses with a pool of reader threads, and feeds the sparse chapter cache.
pub struct Volume {
    shared: Arc<VolumeShared>,
    readers: Vec<JoinHandle<()>>,
}

impl Deref for Volume {
    type Target = VolumeShared;

    fn deref(&self) -> &VolumeShared {
        &self.shared
    }
}

impl Volume {
    pub fn new(
        config: &Config,
        geometry: Geometry,
        nonce: u64,
        store: Arc<dyn VolumeStore>,
        restarter: Arc<dyn RequestRestarter>,
    ) -> Result<Volume> {
        config.validate()?;

        let cache_slots = config.cache_chapters as u32 * geometry.record_pages_per_chapter;
        let cache_slots = u16::try_from(cache_slots)
            .map_err(|_| Error::invalid_argument(format!("page cache of {} slots", cache_slots)))?;
        // Each reader thread can hold one slot in the read-pending state, so
        // the cache must keep at least one slot free for eviction.
        if config.read_threads >= usize::from(cache_slots) {
            return Err(Error::invalid_argument(format!(
                "{} reader threads need a page cache larger than {} slots",
                config.read_threads, cache_slots
            )));
        }
        let page_cache =
            PageCache::new(geometry.physical_page_count(), cache_slots, config.zone_count)?;
        let sparse_cache = if geometry.is_sparse() {
            Some(SparseCache::new(config.sparse_capacity, config.zone_count)?)
        } else {
            None
        };

        let shared = Arc::new(VolumeShared {
            page_map: RwLock::new(IndexPageMap::new(&geometry)),
            geometry,
            nonce,
            store,
            page_cache,
            sparse_cache,
            restarter,
            counters: VolumeCounters::default(),
        });

        let mut readers = Vec::with_capacity(config.read_threads);
        for id in 0..config.read_threads {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("volume-reader-{}", id))
                .spawn(move || shared.run_reader())?;
            readers.push(handle);
        }

        Ok(Volume { shared, readers })
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        self.shared.page_cache.begin_shutdown();
        for handle in self.readers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl VolumeShared {
    pub fn stats(&self) -> (VolumeStats, Option<SparseCacheStats>) {
        let stats = VolumeStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
            chapters_forgotten: self.counters.chapters_forgotten.load(Ordering::Relaxed),
        };
        (stats, self.sparse_cache.as_ref().map(SparseCache::stats))
    }

    /// Record where one index page of a freshly written chapter ends, so
    /// lookups and decode validation route against the new layout.
    pub fn update_page_map(
        &self,
        virtual_chapter: u64,
        physical_chapter: u32,
        index_page: u32,
        last_list: u32,
    ) {
        self.page_map
            .write()
            .update(virtual_chapter, physical_chapter, index_page, last_list);
    }

    // --- page decoding ------------------------------------------------------

    /// Decode an index page and hold it against the page map: the chapter and
    /// list range on the page must be exactly what the map routed here.
    fn decode_index_page(&self, physical_page: u32, data: Bytes) -> Result<DeltaIndexPage> {
        let (chapter, index_page_number) = self.geometry.page_location(physical_page);
        let page = DeltaIndexPage::parse(data, self.nonce, &self.geometry)?;

        let page_map = self.page_map.read();
        let (lowest, highest) = page_map.list_bounds(chapter, index_page_number);
        let page_chapter = self.geometry.map_to_physical_chapter(page.virtual_chapter);
        if chapter == page_chapter && lowest == page.lowest_list && highest == page.highest_list {
            return Ok(page);
        }

        tracing::warn!(
            chapter,
            index_page_number,
            expected_lowest = lowest,
            expected_highest = highest,
            page_virtual_chapter = page.virtual_chapter,
            page_lowest = page.lowest_list,
            page_highest = page.highest_list,
            page_map_updated_to = page_map.last_update(),
            "index page disagrees with the page map"
        );
        Err(Error::corrupt("index page map mismatch with chapter index"))
    }

    fn decode_page(&self, physical_page: u32, data: Bytes) -> Result<CachedPage> {
        let (_, page_number) = self.geometry.page_location(physical_page);
        let index_page = if self.geometry.is_index_page(page_number) {
            Some(self.decode_index_page(physical_page, data.clone())?)
        } else {
            None
        };
        Ok(CachedPage { physical_page, buffer: Some(data), index_page })
    }

    // --- reader threads -----------------------------------------------------

    fn run_reader(&self) {
        tracing::debug!("reader starting");
        let mut state = self.page_cache.state.lock();
        while let Some(entry) = self.page_cache.wait_to_reserve_read(&mut state) {
            let outcome = self.process_read(&mut state, entry);
            let waiters = self.page_cache.release_queued_reads(&mut state, entry);

            let mut deliveries = Vec::with_capacity(waiters.len());
            for mut request in waiters {
                let status = match &outcome {
                    // The page landed in the cache; search it immediately so
                    // requeued requests resume with the answer in hand.
                    Ok(Some(physical_page)) => self.search_page(&mut request, *physical_page),
                    // Invalidated read: requeue untouched, the index retries.
                    Ok(None) => Ok(()),
                    Err(error) => Err(error.clone()),
                };
                deliveries.push((request, status));
            }

            MutexGuard::unlocked(&mut state, || {
                for (request, status) in deliveries {
                    self.restarter.restart(request, status);
                }
            });
        }
        tracing::debug!("reader done");
    }

    /// Service one reserved queue entry: read, decode, install. Returns the
    /// installed physical page, or `None` when the entry was invalidated.
    fn process_read(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
        entry: u16,
    ) -> Result<Option<u32>> {
        if self.page_cache.queued_read_is_invalid(state, entry) {
            tracing::debug!("requeuing requests for an invalid page");
            return Ok(None);
        }

        let physical_page = self.page_cache.queued_page(state, entry);
        let slot = self.page_cache.select_victim(state)?;

        let read = MutexGuard::unlocked(state, || self.store.read_page(physical_page));
        let data = match read {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(physical_page, %error, "error reading physical page");
                self.page_cache.cancel_page(state, slot, physical_page);
                return Err(error);
            }
        };

        if self.page_cache.queued_read_is_invalid(state, entry) {
            tracing::warn!(physical_page, "page invalidated after read");
            self.page_cache.cancel_page(state, slot, physical_page);
            return Ok(None);
        }

        let page = match self.decode_page(physical_page, data) {
            Ok(page) => page,
            Err(error) => {
                tracing::warn!(physical_page, %error, "error initializing chapter index page");
                self.page_cache.cancel_page(state, slot, physical_page);
                return Err(error);
            }
        };

        self.page_cache.put_page(state, slot, physical_page, page)?;
        Ok(Some(physical_page))
    }

    /// Search a just-installed page on behalf of a parked request, recording
    /// where the lookup got to so the index resumes without repeating work.
    /// Caller holds the cache mutex.
    fn search_page(&self, request: &mut Request, physical_page: u32) -> Result<()> {
        let (_, page_number) = self.geometry.page_location(physical_page);
        let page = self
            .page_cache
            .get(physical_page)
            .ok_or_else(|| Error::internal("installed page missing from the cache"))?;

        if self.geometry.is_index_page(page_number) {
            let index_page = page
                .index_page
                .as_ref()
                .ok_or_else(|| Error::internal("index page cached without metadata"))?;
            match index_page.search(&request.name, &self.geometry)? {
                Some(record_page) => {
                    request.location = RequestLocation::IndexPageLookup;
                    request.record_page = Some(record_page);
                }
                None => request.location = RequestLocation::Unavailable,
            }
        } else {
            let buffer = page
                .buffer
                .as_ref()
                .ok_or_else(|| Error::internal("cached page has no data"))?;
            match search_record_page(buffer, &request.name, &self.geometry) {
                Some(data) => {
                    request.location = RequestLocation::RecordPageLookup;
                    request.data = Some(data);
                    request.found = true;
                }
                None => request.location = RequestLocation::Unavailable,
            }
        }
        Ok(())
    }

    // --- protected lookups (zone threads) -----------------------------------

    /// Search one chapter-index page for the record page holding `name`.
    /// Queues a read and parks the request when the page is not cached.
    pub fn search_cached_index_page(
        &self,
        request: Request,
        chapter: u32,
        index_page_number: u32,
    ) -> Result<CacheResult<(Request, Option<u16>)>> {
        let physical_page = self.geometry.physical_page(chapter, index_page_number);

        // Raising the search-pending counter before reading the mapping keeps
        // an eviction from clearing the page between the lookup and the
        // search.
        let guard = self.page_cache.search_guard(request.zone, physical_page);
        if let Some(page) = guard.lookup(physical_page) {
            if request.zone == 0 {
                // Only one zone is allowed to update the LRU.
                self.page_cache.make_most_recent(&page);
            }
            let found = self.search_index_page(&page, &request.name)?;
            return Ok(CacheResult::Ready((request, found)));
        }
        drop(guard);

        // Look again under the mutex: a reader thread may have installed the
        // page since the lock-free miss, and enqueuing it again would put two
        // cache entries on one page.
        let mut state = self.page_cache.state.lock();
        if let Some(page) = self.page_cache.get(physical_page) {
            // The guard must be up before the mutex drops so nothing can
            // evict the page before the search reads it.
            let guard = self.page_cache.search_guard(request.zone, physical_page);
            drop(state);
            let found = self.search_index_page(&page, &request.name)?;
            drop(guard);
            return Ok(CacheResult::Ready((request, found)));
        }

        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        self.page_cache.enqueue_page_read(&mut state, request, physical_page);
        Ok(CacheResult::Queued)
    }

    fn search_index_page(&self, page: &PageRef<'_>, name: &RecordName) -> Result<Option<u16>> {
        page.index_page
            .as_ref()
            .ok_or_else(|| Error::internal("index page cached without metadata"))?
            .search(name, &self.geometry)
    }

    /// Search one record page for `name`, filling in the request's data on a
    /// hit. Queues a read and parks the request when the page is not cached.
    pub fn search_cached_record_page(
        &self,
        mut request: Request,
        chapter: u32,
        record_page_number: u16,
    ) -> Result<CacheResult<Request>> {
        if record_page_number >= self.geometry.record_pages_per_chapter as u16 {
            return Err(Error::invalid_argument(format!(
                "record page {} out of the chapter's {}",
                record_page_number, self.geometry.record_pages_per_chapter
            )));
        }
        let page_number = self.geometry.index_pages_per_chapter + u32::from(record_page_number);
        let physical_page = self.geometry.physical_page(chapter, page_number);

        let guard = self.page_cache.search_guard(request.zone, physical_page);
        if let Some(page) = guard.lookup(physical_page) {
            if request.zone == 0 {
                self.page_cache.make_most_recent(&page);
            }
            self.search_record_data(&page, &mut request)?;
            return Ok(CacheResult::Ready(request));
        }
        drop(guard);

        let mut state = self.page_cache.state.lock();
        if let Some(page) = self.page_cache.get(physical_page) {
            let guard = self.page_cache.search_guard(request.zone, physical_page);
            drop(state);
            self.search_record_data(&page, &mut request)?;
            drop(guard);
            return Ok(CacheResult::Ready(request));
        }

        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        self.page_cache.enqueue_page_read(&mut state, request, physical_page);
        Ok(CacheResult::Queued)
    }

    fn search_record_data(&self, page: &PageRef<'_>, request: &mut Request) -> Result<()> {
        let buffer = page
            .buffer
            .as_ref()
            .ok_or_else(|| Error::internal("cached page has no data"))?;
        if let Some(data) = search_record_page(buffer, &request.name, &self.geometry) {
            request.data = Some(data);
            request.found = true;
        }
        Ok(())
    }

    /// Full cached lookup of a request in its target chapter: route through
    /// the page map, search the index page, then the record page it names. A
    /// request requeued after an index-page read resumes at the record page.
    pub fn search(&self, request: Request) -> Result<CacheResult<Request>> {
        let mut request = request;
        request.found = false;
        let chapter = self.geometry.map_to_physical_chapter(request.virtual_chapter);

        let record_page = if request.location == RequestLocation::IndexPageLookup {
            request.record_page
        } else {
            let index_page_number =
                self.page_map
                    .read()
                    .find_index_page(chapter, &request.name, &self.geometry);
            match self.search_cached_index_page(request, chapter, index_page_number)? {
                CacheResult::Ready((resumed, found)) => {
                    request = resumed;
                    found
                }
                CacheResult::Queued => return Ok(CacheResult::Queued),
            }
        };

        let Some(record_page) = record_page else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(CacheResult::Ready(request));
        };
        request.record_page = Some(record_page);

        match self.search_cached_record_page(request, chapter, record_page)? {
            CacheResult::Ready(request) => {
                let counter = if request.found { &self.counters.hits } else { &self.counters.misses };
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(CacheResult::Ready(request))
            }
            CacheResult::Queued => Ok(CacheResult::Queued),
        }
    }

    // --- direct reads (cache mutex held, no request involved) ---------------

    fn get_page_locked(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
        physical_page: u32,
    ) -> Result<PageRef<'_>> {
        if let Some(page) = self.page_cache.get(physical_page) {
            self.page_cache.make_most_recent(&page);
            return Ok(page);
        }

        let slot = self.page_cache.select_victim(state)?;
        let data = match self.store.read_page(physical_page) {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(physical_page, %error, "error reading physical page");
                self.page_cache.cancel_page(state, slot, physical_page);
                return Err(error);
            }
        };
        let page = match self.decode_page(physical_page, data) {
            Ok(page) => page,
            Err(error) => {
                self.page_cache.cancel_page(state, slot, physical_page);
                return Err(error);
            }
        };
        self.page_cache.put_page(state, slot, physical_page, page)?;
        self.page_cache
            .get(physical_page)
            .ok_or_else(|| Error::internal("installed page missing from the cache"))
    }

    /// Synchronous lookup that reads through the cache without parking,
    /// for scan and rebuild callers that have no request to requeue.
    pub fn search_for_rebuild(&self, name: &RecordName, virtual_chapter: u64) -> Result<bool> {
        let chapter = self.geometry.map_to_physical_chapter(virtual_chapter);
        let index_page_number =
            self.page_map.read().find_index_page(chapter, name, &self.geometry);

        let mut state = self.page_cache.state.lock();
        let page = self.get_page_locked(&mut state, self.geometry.physical_page(chapter, index_page_number))?;
        let Some(record_page_number) = self.search_index_page(&page, name)? else {
            return Ok(false);
        };

        let page_number = self.geometry.index_pages_per_chapter + u32::from(record_page_number);
        let page = self.get_page_locked(&mut state, self.geometry.physical_page(chapter, page_number))?;
        let buffer = page
            .buffer
            .as_ref()
            .ok_or_else(|| Error::internal("cached page has no data"))?;
        Ok(search_record_page(buffer, name, &self.geometry).is_some())
    }

    /// Owned copy of one record page, read through the cache.
    pub fn read_record_page(&self, chapter: u32, record_page_number: u32) -> Result<Bytes> {
        let page_number = self.geometry.index_pages_per_chapter + record_page_number;
        let mut state = self.page_cache.state.lock();
        let page = self.get_page_locked(&mut state, self.geometry.physical_page(chapter, page_number))?;
        page.buffer
            .clone()
            .ok_or_else(|| Error::internal("cached page has no data"))
    }

    /// Owned copy of one decoded index page, read through the cache.
    pub fn read_index_page(&self, chapter: u32, index_page_number: u32) -> Result<DeltaIndexPage> {
        let mut state = self.page_cache.state.lock();
        let page = self.get_page_locked(&mut state, self.geometry.physical_page(chapter, index_page_number))?;
        page.index_page
            .clone()
            .ok_or_else(|| Error::internal("index page cached without metadata"))
    }

    // --- invalidation and prefetch ------------------------------------------

    /// Drop every cached page of a chapter before its physical slot is
    /// rewritten, poisoning any read still queued for one of them.
    pub fn forget_chapter(&self, virtual_chapter: u64) {
        tracing::debug!(virtual_chapter, "forgetting chapter");
        let chapter = self.geometry.map_to_physical_chapter(virtual_chapter);
        let first_page = self.geometry.physical_page(chapter, 0);

        let mut state = self.page_cache.state.lock();
        for page in 0..self.geometry.pages_per_chapter {
            self.page_cache.invalidate_page(&mut state, first_page + page);
        }
        drop(state);
        self.counters.chapters_forgotten.fetch_add(1, Ordering::Relaxed);
    }

    pub fn prefetch_chapter(&self, virtual_chapter: u64) {
        let chapter = self.geometry.map_to_physical_chapter(virtual_chapter);
        self.store
            .prefetch(self.geometry.physical_page(chapter, 0), self.geometry.pages_per_chapter);
    }

    // --- sparse chapter cache -----------------------------------------------

    /// Read and decode every index page of a chapter, bypassing the page
    /// cache, for a sparse cache load.
    pub fn read_chapter_index(&self, virtual_chapter: u64) -> Result<Vec<DeltaIndexPage>> {
        let chapter = self.geometry.map_to_physical_chapter(virtual_chapter);
        let first_page = self.geometry.physical_page(chapter, 0);
        self.store.prefetch(first_page, self.geometry.index_pages_per_chapter);

        let mut pages = Vec::with_capacity(self.geometry.index_pages_per_chapter as usize);
        for index_page in 0..self.geometry.index_pages_per_chapter {
            let data = self.store.read_page(first_page + index_page).map_err(|error| {
                tracing::warn!(physical_page = first_page + index_page, %error, "error reading physical page");
                error
            })?;
            pages.push(self.decode_index_page(first_page + index_page, data)?);
        }
        Ok(pages)
    }

    fn sparse(&self) -> Result<&SparseCache> {
        self.sparse_cache
            .as_ref()
            .ok_or_else(|| Error::invalid_state("volume has no sparse chapters"))
    }

    pub fn sparse_cache_contains(&self, virtual_chapter: u64, zone: usize) -> Result<bool> {
        Ok(self.sparse()?.contains(virtual_chapter, zone))
    }

    /// Make a sparse chapter resident. Every zone thread must call this with
    /// the same chapter number; see `SparseCache::update`.
    pub fn update_sparse_cache(
        &self,
        zone: usize,
        virtual_chapter: u64,
        oldest_virtual_chapter: u64,
    ) -> Result<()> {
        self.sparse()?.update(zone, virtual_chapter, oldest_virtual_chapter, |chapter| {
            self.read_chapter_index(chapter)
        })
    }

    pub fn search_sparse_cache(
        &self,
        zone: usize,
        name: &RecordName,
        requested_chapter: Option<u64>,
        oldest_virtual_chapter: u64,
    ) -> Result<Option<(u64, u16)>> {
        let page_map = self.page_map.read();
        self.sparse()?.search(
            zone,
            name,
            requested_chapter,
            oldest_virtual_chapter,
            &self.geometry,
            &page_map,
        )
    }
}
