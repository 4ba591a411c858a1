pub mod cache;
pub mod core;
pub mod index;
pub mod storage;
pub mod volume;

/*
┌─────────────────────────────────────────────────────────────────────────────────────┐
│                           VOLCACHE STRUCT ARCHITECTURE                              │
└─────────────────────────────────────────────────────────────────────────────────────┘

┌────────────────────────────────────── VOLUME LAYER ─────────────────────────────────┐
│                                                                                     │
│  ┌───────────────────────────────────────────────────────────────────────────┐     │
│  │                            struct Volume                                   │     │
│  │  ┌─────────────────────────────────────────────────────────────────────┐  │     │
│  │  │ shared: Arc<VolumeShared>         // state shared with readers      │  │     │
│  │  │ readers: Vec<JoinHandle<()>>      // background reader threads      │  │     │
│  │  └─────────────────────────────────────────────────────────────────────┘  │     │
│  └───────────────────────────────────────────────────────────────────────────┘     │
│                                                                                     │
│  ┌───────────────────────────────────────────────────────────────────────────┐     │
│  │                          struct VolumeShared                               │     │
│  │  ┌─────────────────────────────────────────────────────────────────────┐  │     │
│  │  │ geometry: Geometry                // fixed volume shape             │  │     │
│  │  │ nonce: u64                        // page verification seed         │  │     │
│  │  │ store: Arc<dyn VolumeStore>       // physical page reads            │  │     │
│  │  │ page_map: RwLock<IndexPageMap>    // name → index page routing      │  │     │
│  │  │ page_cache: PageCache             // hot page LRU + read queue      │  │     │
│  │  │ sparse_cache: Option<SparseCache> // whole-chapter index cache      │  │     │
│  │  │ restarter: Arc<dyn RequestRestarter> // requeued-request delivery   │  │     │
│  │  └─────────────────────────────────────────────────────────────────────┘  │     │
│  └───────────────────────────────────────────────────────────────────────────┘     │
└─────────────────────────────────────────────────────────────────────────────────────┘

┌────────────────────────────────────── CACHE LAYER ──────────────────────────────────┐
│                                                                                     │
│  ┌───────────────────────────────────────────────────────────────────────────┐     │
│  │                           struct PageCache                                 │     │
│  │  ┌─────────────────────────────────────────────────────────────────────┐  │     │
│  │  │ index: Vec<AtomicU16>             // page → slot, read lock-free    │  │     │
│  │  │ slots: Vec<Slot>                  // UnsafeCell<CachedPage> arena   │  │     │
│  │  │ search_pending_counters: Vec<CachePadded<AtomicU64>> // per zone    │  │     │
│  │  │ state: Mutex<CacheState>          // read queue + slot authority    │  │     │
│  │  │ read_cond / read_done_cond: Condvar                                 │  │     │
│  │  └─────────────────────────────────────────────────────────────────────┘  │     │
│  └───────────────────────────────────────────────────────────────────────────┘     │
│                                                                                     │
│  ┌──────────────────────────┐   ┌──────────────────────────────────────────┐       │
│  │ struct CachedPage        │   │ struct CacheState                        │       │
│  │ • physical_page: u32     │   │ • queue: Vec<QueuedRead>  (4096, ring)   │       │
│  │ • buffer: Option<Bytes>  │   │ • first / next_read / last: u16          │       │
│  │ • index_page:            │   │ • exiting: bool                          │       │
│  │   Option<DeltaIndexPage> │   └──────────────────────────────────────────┘       │
│  └──────────────────────────┘                                                      │
│                                                                                     │
│  ┌───────────────────────────────────────────────────────────────────────────┐     │
│  │                           struct SparseCache                               │     │
│  │  ┌─────────────────────────────────────────────────────────────────────┐  │     │
│  │  │ slots: Vec<CachePadded<Slot>>     // RwLock<CachedChapter> each     │  │     │
│  │  │ search_lists: Vec<Mutex<SearchList>> // per-zone LRU orderings      │  │     │
│  │  │ begin_update / end_update: Barrier // zone 0 is update captain      │  │     │
│  │  │ skip_search_threshold: u64        // 20_000 / zone_count            │  │     │
│  │  └─────────────────────────────────────────────────────────────────────┘  │     │
│  └───────────────────────────────────────────────────────────────────────────┘     │
└─────────────────────────────────────────────────────────────────────────────────────┘

┌────────────────────────────────────── INDEX LAYER ──────────────────────────────────┐
│                                                                                     │
│  ┌──────────────────────────┐   ┌──────────────────────────────────────────┐       │
│  │ struct DeltaIndexPage    │   │ struct ChapterIndexBuilder               │       │
│  │ • memory: Bytes          │   │ • lists: Vec<Vec<ListEntry>>             │       │
│  │ • virtual_chapter: u64   │   │ • virtual_chapter / nonce                │       │
│  │ • lowest/highest_list    │   │ • coding: CodingConstants                │       │
│  │ • coding: CodingConstants│   └──────────────────────────────────────────┘       │
│  └──────────────────────────┘                                                      │
│                                                                                     │
│  ┌──────────────────────────┐   ┌──────────────────────────────────────────┐       │
│  │ struct IndexPageMap      │   │ record_page.rs                           │       │
│  │ • entries: Vec<u16>      │   │ • search_record_page (heap-order tree)   │       │
│  │ • last_update: u64       │   │ • encode_record_page                     │       │
│  └──────────────────────────┘   └──────────────────────────────────────────┘       │
└─────────────────────────────────────────────────────────────────────────────────────┘

┌─────────────────────────────────── CORE / STORAGE ──────────────────────────────────┐
│                                                                                     │
│  ┌──────────────────────────┐   ┌──────────────────────────────────────────┐       │
│  │ struct Geometry          │   │ trait VolumeStore                        │       │
│  │ • bytes_per_page         │   │ • read_page(physical_page) -> Bytes      │       │
│  │ • pages_per_chapter      │   │ • prefetch(first, count)                 │       │
│  │ • delta_lists_per_chapter│   │   impls: MmapStore (memmap2 + madvise)   │       │
│  │ • index_pages_per_chapter│   │          MemStore  (tests, writable)     │       │
│  └──────────────────────────┘   └──────────────────────────────────────────┘       │
│                                                                                     │
│  ┌──────────────────────────┐   ┌──────────────────────────────────────────┐       │
│  │ struct RecordName([u8;16])│  │ struct Error { kind, context }           │       │
│  │ • chapter_delta_list()   │   │ enum ErrorKind: Io | CorruptData |       │       │
│  │ • chapter_delta_address()│   │   InvalidArgument | Overflow |           │       │
│  │ • sample_bytes()         │   │   InvalidState | Internal                │       │
│  └──────────────────────────┘   └──────────────────────────────────────────┘       │
└─────────────────────────────────────────────────────────────────────────────────────┘

REQUEST FLOW (zone thread, lock-free fast path):

  Volume::search(request)
      │
      ├─ page_map.find_index_page(name) ──────────────┐
      │                                               ▼
      ├─ search_cached_index_page ──── hit ──► DeltaIndexPage::search ─► record page №
      │        │ miss                                                        │
      │        └─ enqueue read, park request (CacheResult::Queued)           ▼
      ├─ search_cached_record_page ─── hit ──► search_record_page ─► RecordData
      │        │ miss
      │        └─ enqueue read, park request
      ▼
  reader thread: reserve ─ read store ─ decode ─ install ─ search for waiters
                 ─ RequestRestarter::restart(request, status)
*/
