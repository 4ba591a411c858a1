use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU64, Ordering, fence};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cache::Request;
use crate::core::error::{Error, Result};
use crate::index::delta_page::DeltaIndexPage;
use bytes::Bytes;

/// High bit of a page-index entry: the value names a read-queue slot, not a
/// cache slot.
pub const CACHE_QUEUED_FLAG: u16 = 1 << 15;

pub const MAX_CACHE_SLOTS: u16 = u16::MAX >> 1;
pub const MAX_QUEUED_READS: u16 = 4096;

/// One decoded volume page occupying a cache slot.
#[derive(Debug, Default)]
pub struct CachedPage {
    /// Physical page number, or the cache's `indexable_pages` when empty.
    pub physical_page: u32,
    pub buffer: Option<Bytes>,
    /// Decoded metadata when the buffer is a chapter index page.
    pub index_page: Option<DeltaIndexPage>,
}

struct Slot {
    page: UnsafeCell<CachedPage>,
    last_used: AtomicI64,
    read_pending: AtomicBool,
}

/// Entry in the bounded circular read queue. Lookups for the same page
/// coalesce onto one entry's waiter list.
struct QueuedRead {
    physical_page: u32,
    invalid: bool,
    reserved: bool,
    waiters: Vec<Request>,
}

/// The mutable cache state guarded by the cache mutex: the read queue
/// positions and, by convention, all writes to the slot arena.
pub struct CacheState {
    queue: Vec<QueuedRead>,
    first: u16,
    next_read: u16,
    last: u16,
    pub exiting: bool,
}

/// LRU cache of decoded volume pages.
///
/// The page index is read lock-free by zone threads; all other state changes
/// happen under `state`. Slot contents are only written by a thread holding
/// the mutex, and only for a slot whose previous mapping has been retracted
/// and whose pending searches have drained, so the unguarded reads performed
/// by zone threads inside a search-pending window never observe a torn page.
pub struct PageCache {
    index: Vec<AtomicU16>,
    slots: Vec<Slot>,
    cache_slots: u16,
    indexable_pages: u32,
    clock: AtomicI64,
    search_pending_counters: Vec<CachePadded<AtomicU64>>,
    pub state: Mutex<CacheState>,
    /// Signalled when the queue gains an entry or the cache shuts down.
    pub read_cond: Condvar,
    /// Signalled when a reader thread recycles a queue entry.
    pub read_done_cond: Condvar,
}

unsafe impl Sync for PageCache {}

#[inline]
fn counter_pending(value: u64) -> bool {
    (value >> 32) & 1 != 0
}

#[inline]
fn counter_page(value: u64) -> u32 {
    value as u32
}

fn next_queue_position(position: u16) -> u16 {
    (position + 1) % MAX_QUEUED_READS
}

impl PageCache {
    pub fn new(indexable_pages: u32, cache_slots: u16, zone_count: usize) -> Result<PageCache> {
        if cache_slots == 0 || cache_slots > MAX_CACHE_SLOTS {
            return Err(Error::invalid_argument(format!(
                "cache of {} slots not in 1..={}",
                cache_slots, MAX_CACHE_SLOTS
            )));
        }

        let slots = (0..cache_slots)
            .map(|_| Slot {
                page: UnsafeCell::new(CachedPage {
                    physical_page: indexable_pages,
                    buffer: None,
                    index_page: None,
                }),
                last_used: AtomicI64::new(0),
                read_pending: AtomicBool::new(false),
            })
            .collect();

        let mut queue = Vec::with_capacity(MAX_QUEUED_READS as usize);
        queue.resize_with(MAX_QUEUED_READS as usize, || QueuedRead {
            physical_page: 0,
            invalid: false,
            reserved: false,
            waiters: Vec::new(),
        });

        Ok(PageCache {
            index: (0..indexable_pages).map(|_| AtomicU16::new(cache_slots)).collect(),
            slots,
            cache_slots,
            indexable_pages,
            clock: AtomicI64::new(1),
            search_pending_counters: (0..zone_count)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            state: Mutex::new(CacheState {
                queue,
                first: 0,
                next_read: 0,
                last: 0,
                exiting: false,
            }),
            read_cond: Condvar::new(),
            read_done_cond: Condvar::new(),
        })
    }

    pub fn slot_count(&self) -> u16 {
        self.cache_slots
    }

    // --- search-pending counters ------------------------------------------

    /// Mark the zone as searching `physical_page`. The fence pairs with the
    /// one in `wait_for_pending_searches`.
    fn begin_pending_search(&self, zone: usize, physical_page: u32) {
        let counter = &self.search_pending_counters[zone];
        let value = counter.load(Ordering::Relaxed);
        let sequence = (value >> 32).wrapping_add(1);
        counter.store((sequence << 32) | u64::from(physical_page), Ordering::Relaxed);
        debug_assert!(counter_pending(counter.load(Ordering::Relaxed)));
        fence(Ordering::SeqCst);
    }

    fn end_pending_search(&self, zone: usize) {
        // All reads of the page must complete before the counter moves on.
        fence(Ordering::SeqCst);
        let counter = &self.search_pending_counters[zone];
        let value = counter.load(Ordering::Relaxed);
        debug_assert!(counter_pending(value));
        counter.store(value.wrapping_add(1 << 32), Ordering::Relaxed);
    }

    /// Spin until no zone's snapshot counter still shows a search pending on
    /// `physical_page`. Caller holds the cache mutex, so no new search can
    /// find the page; its index entry has already been retracted.
    fn wait_for_pending_searches(&self, physical_page: u32) {
        fence(Ordering::SeqCst);
        let initial: Vec<u64> = self
            .search_pending_counters
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        for (zone, &snapshot) in initial.iter().enumerate() {
            if !counter_pending(snapshot) || counter_page(snapshot) != physical_page {
                continue;
            }
            let mut spins = 0u64;
            while self.search_pending_counters[zone].load(Ordering::Relaxed) == snapshot {
                std::thread::yield_now();
                spins += 1;
                if spins == 1 << 22 {
                    tracing::warn!(zone, physical_page, "still waiting on pending search");
                }
            }
        }
    }

    /// RAII bracket around a zone's lock-free cache reads.
    pub fn search_guard(&self, zone: usize, physical_page: u32) -> SearchGuard<'_> {
        self.begin_pending_search(zone, physical_page);
        SearchGuard { cache: self, zone }
    }

    // --- lock-free lookup --------------------------------------------------

    fn decode_index(&self, physical_page: u32) -> (Option<u16>, Option<u16>) {
        let value = self.index[physical_page as usize].load(Ordering::Acquire);
        let queued = value & CACHE_QUEUED_FLAG != 0;
        let index = value & !CACHE_QUEUED_FLAG;
        if queued {
            (None, Some(index))
        } else if index < self.cache_slots {
            (Some(index), None)
        } else {
            (None, None)
        }
    }

    fn page_ref(&self, slot: u16) -> PageRef<'_> {
        PageRef { slot: &self.slots[slot as usize] }
    }

    /// Look up a page. Caller must hold either a search guard covering
    /// `physical_page` or the cache mutex.
    pub fn get(&self, physical_page: u32) -> Option<PageRef<'_>> {
        let (slot, _) = self.decode_index(physical_page);
        slot.map(|s| self.page_ref(s))
    }

    /// Advance the recency clock for a page.
    pub fn make_most_recent(&self, page: &PageRef<'_>) {
        let clock = self.clock.load(Ordering::Relaxed);
        if page.slot.last_used.load(Ordering::Relaxed) != clock {
            let next = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
            page.slot.last_used.store(next, Ordering::Relaxed);
        }
    }

    // --- slot management (cache mutex held) --------------------------------

    fn clear_slot(&self, slot: u16) {
        // read_pending stays as-is; the read queue relies on it.
        let page = unsafe { &mut *self.slots[slot as usize].page.get() };
        page.buffer = None;
        page.index_page = None;
        page.physical_page = self.indexable_pages;
        self.slots[slot as usize].last_used.store(0, Ordering::Relaxed);
    }

    /// Pick the least recently used slot without a pending read, retract its
    /// index entry, and wait out searches before clearing it. The slot comes
    /// back with `read_pending` set, reserving it for the caller. Fails when
    /// every slot already has a read pending; evicting one would hand the
    /// same slot to two readers.
    pub fn select_victim(&self, _state: &mut CacheState) -> Result<u16> {
        let mut oldest_slot = None;
        let mut oldest_time = i64::MAX;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.read_pending.load(Ordering::Relaxed) {
                continue;
            }
            let last_used = slot.last_used.load(Ordering::Relaxed);
            if last_used <= oldest_time {
                oldest_time = last_used;
                oldest_slot = Some(i as u16);
            }
        }
        let Some(oldest_slot) = oldest_slot else {
            return Err(Error::invalid_state("every cache slot has a read pending"));
        };

        let slot = &self.slots[oldest_slot as usize];
        let physical_page = unsafe { (*slot.page.get()).physical_page };
        if physical_page != self.indexable_pages {
            self.index[physical_page as usize].store(self.cache_slots, Ordering::Release);
            self.wait_for_pending_searches(physical_page);
        }

        slot.read_pending.store(true, Ordering::Relaxed);
        self.clear_slot(oldest_slot);
        Ok(oldest_slot)
    }

    /// Install a filled page and publish its index entry last, so lock-free
    /// readers see either the old state or the complete new page.
    pub fn put_page(
        &self,
        _state: &mut CacheState,
        slot: u16,
        physical_page: u32,
        page: CachedPage,
    ) -> Result<()> {
        let entry = &self.slots[slot as usize];
        if !entry.read_pending.load(Ordering::Relaxed) {
            return Err(Error::invalid_state("page to install has no pending read"));
        }

        unsafe {
            *entry.page.get() = CachedPage { physical_page, ..page };
        }
        let next = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        entry.last_used.store(next, Ordering::Relaxed);
        entry.read_pending.store(false, Ordering::Relaxed);

        // This store also clears the queued flag.
        self.index[physical_page as usize].store(slot, Ordering::Release);
        Ok(())
    }

    /// Abandon a reserved slot after a failed or invalidated read.
    pub fn cancel_page(&self, _state: &mut CacheState, slot: u16, physical_page: u32) {
        let entry = &self.slots[slot as usize];
        if !entry.read_pending.load(Ordering::Relaxed) {
            return;
        }
        self.clear_slot(slot);
        entry.read_pending.store(false, Ordering::Relaxed);

        // Clear the mapping and the queued flag for the new page.
        self.index[physical_page as usize].store(self.cache_slots, Ordering::Release);
    }

    /// Drop a page from the cache, or poison its queued read so the reader
    /// thread discards the data.
    pub fn invalidate_page(&self, state: &mut CacheState, physical_page: u32) {
        let (slot, queue_index) = self.decode_index(physical_page);
        if let Some(slot) = slot {
            self.index[physical_page as usize].store(self.cache_slots, Ordering::Release);
            self.wait_for_pending_searches(physical_page);
            self.clear_slot(slot);
        } else if let Some(queue_index) = queue_index {
            tracing::debug!(physical_page, "setting pending read to invalid");
            state.queue[queue_index as usize].invalid = true;
        }
    }

    // --- read queue ---------------------------------------------------------

    fn queue_is_full(&self, state: &CacheState) -> bool {
        state.first == next_queue_position(state.last)
    }

    /// Coalesce a request onto the read queue. Hands the request back when a
    /// new entry is needed but the queue is full.
    fn enqueue_read(
        &self,
        state: &mut CacheState,
        request: Request,
        physical_page: u32,
    ) -> Option<Request> {
        let value = self.index[physical_page as usize].load(Ordering::Relaxed);
        let queue_index = if value & CACHE_QUEUED_FLAG == 0 {
            if self.queue_is_full(state) {
                return Some(request);
            }
            let last = state.last;
            let entry = &mut state.queue[last as usize];
            entry.physical_page = physical_page;
            entry.invalid = false;
            entry.waiters.clear();
            self.index[physical_page as usize]
                .store(last | CACHE_QUEUED_FLAG, Ordering::Release);
            state.last = next_queue_position(last);
            last
        } else {
            value & !CACHE_QUEUED_FLAG
        };

        state.queue[queue_index as usize].waiters.push(request);
        None
    }

    /// Queue a read, waiting for space if every entry is in use, and wake a
    /// reader thread.
    pub fn enqueue_page_read(
        &self,
        guard: &mut MutexGuard<'_, CacheState>,
        request: Request,
        physical_page: u32,
    ) {
        let mut request = request;
        while let Some(rejected) = self.enqueue_read(guard, request, physical_page) {
            tracing::debug!("read queue full, waiting for reads to finish");
            request = rejected;
            self.read_done_cond.wait(guard);
        }
        self.read_cond.notify_one();
    }

    /// Reserve the next queue entry for processing without removing it.
    /// Must be balanced by `release_queued_reads`.
    fn reserve_read(&self, state: &mut CacheState) -> Option<u16> {
        if state.next_read == state.last {
            return None;
        }

        let index = state.next_read;
        let physical_page = state.queue[index as usize].physical_page;
        let value = self.index[physical_page as usize].load(Ordering::Relaxed);
        let queued = value & CACHE_QUEUED_FLAG != 0;

        if state.queue[index as usize].invalid && queued {
            self.index[physical_page as usize].store(self.cache_slots, Ordering::Release);
        }

        // A synchronous read claimed this page; the waiters are simply
        // requeued without installing anything.
        if !queued {
            state.queue[index as usize].invalid = true;
        }

        state.queue[index as usize].reserved = true;
        state.next_read = next_queue_position(state.next_read);
        Some(index)
    }

    /// Block until a queue entry is available or the cache is shutting down.
    pub fn wait_to_reserve_read(&self, guard: &mut MutexGuard<'_, CacheState>) -> Option<u16> {
        while !guard.exiting {
            if let Some(entry) = self.reserve_read(guard) {
                return Some(entry);
            }
            self.read_cond.wait(guard);
        }
        None
    }

    pub fn queued_page(&self, state: &CacheState, entry: u16) -> u32 {
        state.queue[entry as usize].physical_page
    }

    pub fn queued_read_is_invalid(&self, state: &CacheState, entry: u16) -> bool {
        state.queue[entry as usize].invalid
    }

    /// Recycle a reserved entry, returning its waiters for re-delivery, and
    /// free queue space for blocked enqueuers.
    pub fn release_queued_reads(&self, state: &mut CacheState, entry: u16) -> Vec<Request> {
        let waiters = std::mem::take(&mut state.queue[entry as usize].waiters);
        state.queue[entry as usize].reserved = false;

        while state.first != state.next_read && !state.queue[state.first as usize].reserved {
            state.first = next_queue_position(state.first);
        }
        self.read_done_cond.notify_all();
        waiters
    }

    /// Wake every reader thread for shutdown.
    pub fn begin_shutdown(&self) {
        let mut state = self.state.lock();
        state.exiting = true;
        self.read_cond.notify_all();
    }
}

/// Holds a zone's search-pending counter raised for one physical page.
/// Pages looked up through the guard stay valid until the guard drops.
pub struct SearchGuard<'a> {
    cache: &'a PageCache,
    zone: usize,
}

impl<'a> SearchGuard<'a> {
    pub fn lookup(&self, physical_page: u32) -> Option<PageRef<'_>> {
        self.cache.get(physical_page)
    }
}

impl Drop for SearchGuard<'_> {
    fn drop(&mut self) {
        self.cache.end_pending_search(self.zone);
    }
}

/// Shared view of a cache slot's page.
pub struct PageRef<'a> {
    slot: &'a Slot,
}

impl Deref for PageRef<'_> {
    type Target = CachedPage;

    fn deref(&self) -> &CachedPage {
        unsafe { &*self.slot.page.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::name::RecordName;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    fn request(zone: usize) -> Request {
        Request::new(RecordName([0; 16]), 0, zone)
    }

    fn install(cache: &PageCache, physical_page: u32) -> u16 {
        let mut state = cache.state.lock();
        let slot = cache.select_victim(&mut state).unwrap();
        cache
            .put_page(
                &mut state,
                slot,
                physical_page,
                CachedPage {
                    physical_page,
                    buffer: Some(Bytes::from_static(b"page")),
                    index_page: None,
                },
            )
            .unwrap();
        slot
    }

    #[test]
    fn lru_victim_selection() {
        let cache = PageCache::new(64, 4, 1).unwrap();
        for page in 0..4 {
            install(&cache, page);
        }

        // Oldest page wins, and the eviction retracts its mapping.
        let mut state = cache.state.lock();
        let slot = cache.select_victim(&mut state).unwrap();
        cache.put_page(&mut state, slot, 4, CachedPage::default()).unwrap();
        drop(state);
        assert!(cache.get(0).is_none());
        assert!(cache.get(4).is_some());

        // Touching page 1 leaves page 2 as the next victim.
        let touched = cache.get(1).unwrap();
        cache.make_most_recent(&touched);
        drop(touched);
        let mut state = cache.state.lock();
        let slot = cache.select_victim(&mut state).unwrap();
        cache.put_page(&mut state, slot, 5, CachedPage::default()).unwrap();
        drop(state);
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn read_pending_slot_is_never_victim() {
        let cache = PageCache::new(64, 2, 1).unwrap();
        let mut state = cache.state.lock();
        let first = cache.select_victim(&mut state).unwrap();
        let second = cache.select_victim(&mut state).unwrap();
        assert_ne!(second, first);

        // Both slots now have reads pending, so there is no legal victim;
        // handing out either slot would let two reads clobber one page.
        assert!(cache.select_victim(&mut state).is_err());
        assert!(cache.select_victim(&mut state).is_err());

        // Finishing a read frees its slot for eviction again.
        cache.cancel_page(&mut state, first, 0);
        assert_eq!(cache.select_victim(&mut state).unwrap(), first);
    }

    #[test]
    fn concurrent_requests_coalesce() {
        let cache = PageCache::new(64, 4, 2).unwrap();
        let mut state = cache.state.lock();
        assert!(cache.enqueue_read(&mut state, request(0), 9).is_none());
        assert!(cache.enqueue_read(&mut state, request(1), 9).is_none());
        assert!(cache.enqueue_read(&mut state, request(0), 11).is_none());

        // Two entries, one holding both waiters for page 9.
        let first = cache.reserve_read(&mut state).unwrap();
        assert_eq!(cache.queued_page(&state, first), 9);
        assert_eq!(cache.release_queued_reads(&mut state, first).len(), 2);
        let second = cache.reserve_read(&mut state).unwrap();
        assert_eq!(cache.queued_page(&state, second), 11);
        assert_eq!(cache.release_queued_reads(&mut state, second).len(), 1);
        assert!(cache.reserve_read(&mut state).is_none());
    }

    #[test]
    fn invalidate_marks_queued_read() {
        let cache = PageCache::new(64, 4, 1).unwrap();
        let mut state = cache.state.lock();
        assert!(cache.enqueue_read(&mut state, request(0), 5).is_none());
        cache.invalidate_page(&mut state, 5);

        let entry = cache.reserve_read(&mut state).unwrap();
        assert!(cache.queued_read_is_invalid(&state, entry));
        // Retracting the queued mapping happened during reservation.
        drop(state);
        assert!(cache.get(5).is_none());
    }

    #[test]
    fn invalidate_clears_cached_page() {
        let cache = PageCache::new(64, 4, 1).unwrap();
        install(&cache, 7);
        let mut state = cache.state.lock();
        cache.invalidate_page(&mut state, 7);
        drop(state);
        assert!(cache.get(7).is_none());
    }

    #[test]
    fn pending_search_blocks_eviction() {
        let cache = Arc::new(PageCache::new(64, 1, 2).unwrap());
        install(&cache, 3);

        let guard = cache.search_guard(1, 3);
        let page = guard.lookup(3).unwrap();
        assert_eq!(page.physical_page, 3);

        // An evictor in another thread must stall until the guard drops.
        let evicted = Arc::new(AtomicU32::new(0));
        let handle = {
            let cache = Arc::clone(&cache);
            let evicted = Arc::clone(&evicted);
            std::thread::spawn(move || {
                let mut state = cache.state.lock();
                let slot = cache.select_victim(&mut state).unwrap();
                evicted.store(1, Ordering::SeqCst);
                cache.cancel_page(&mut state, slot, 3);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(evicted.load(Ordering::SeqCst), 0);
        assert_eq!(page.physical_page, 3);
        drop(page);
        drop(guard);
        handle.join().unwrap();
        assert_eq!(evicted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queue_wraps_and_reuses_entries() {
        let cache = PageCache::new(16384, 4, 1).unwrap();
        for round in 0..3u32 {
            let base = round * 5000;
            let mut state = cache.state.lock();
            for i in 0..u32::from(MAX_QUEUED_READS) - 1 {
                assert!(
                    cache.enqueue_read(&mut state, request(0), base + i).is_none(),
                    "round {}",
                    round
                );
            }
            assert!(cache.enqueue_read(&mut state, request(0), 16000 + round).is_some());
            while let Some(entry) = cache.reserve_read(&mut state) {
                cache.release_queued_reads(&mut state, entry);
            }
        }
    }
}
