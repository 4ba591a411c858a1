use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::time::Duration;

use volcache::cache::{CacheResult, Request, RequestRestarter};
use volcache::core::config::Config;
use volcache::core::error::Result;
use volcache::core::geometry::Geometry;
use volcache::core::name::{RecordData, RecordName};
use volcache::index::delta_page::DeltaIndexPage;
use volcache::index::page_builder::ChapterIndexBuilder;
use volcache::index::page_map::IndexPageMap;
use volcache::index::record_page::encode_record_page;
use volcache::storage::store::{MemStore, VolumeStore};
use volcache::volume::Volume;

const NONCE: u64 = 0xB1E55ED_C0FFEE;

fn name_for(virtual_chapter: u64, record: u32) -> RecordName {
    let mut name = [0u8; 16];
    name[0..8].copy_from_slice(&virtual_chapter.to_be_bytes());
    name[8..12].copy_from_slice(&record.to_be_bytes());
    name[12..16].copy_from_slice(&record.wrapping_mul(2654435761).to_be_bytes());
    RecordName(name)
}

fn write_chapter(store: &MemStore, volume: &Volume, virtual_chapter: u64) {
    let geometry = &volume.geometry;
    let chapter = geometry.map_to_physical_chapter(virtual_chapter);
    let mut builder = ChapterIndexBuilder::new(geometry, virtual_chapter, NONCE);
    let mut record_pages = vec![Vec::new(); geometry.record_pages_per_chapter as usize];
    for record in 0..geometry.records_per_chapter {
        let name = name_for(virtual_chapter, record);
        let page = record / geometry.records_per_page;
        builder.put(&name, page, geometry).unwrap();
        record_pages[page as usize].push((name, RecordData([0x5A; 16])));
    }

    for (index_page, (memory, last_list)) in
        builder.pack_all(geometry).unwrap().into_iter().enumerate()
    {
        store
            .write_page(geometry.physical_page(chapter, index_page as u32), memory)
            .unwrap();
        volume.update_page_map(virtual_chapter, chapter, index_page as u32, last_list);
    }
    for (page, records) in record_pages.iter().enumerate() {
        let memory = encode_record_page(records, geometry).unwrap();
        let page_number = geometry.index_pages_per_chapter + page as u32;
        store
            .write_page(geometry.physical_page(chapter, page_number), memory)
            .unwrap();
    }
}

struct DropRestarter;

impl RequestRestarter for DropRestarter {
    fn restart(&self, _request: Request, _status: Result<()>) {}
}

fn warm_volume(chapters: u64) -> (Volume, Arc<MemStore>) {
    let geometry = Geometry::new(4096, 4, 16, 0).unwrap();
    let store = Arc::new(MemStore::new(&geometry));
    let config = Config { cache_chapters: 16, zone_count: 1, read_threads: 1, sparse_capacity: 4 };
    let volume = Volume::new(
        &config,
        geometry,
        NONCE,
        Arc::clone(&store) as Arc<dyn VolumeStore>,
        Arc::new(DropRestarter),
    )
    .unwrap();

    for chapter in 0..chapters {
        write_chapter(&store, &volume, chapter);
        // Pull every page into the cache so lookups hit the fast path.
        for record in 0..volume.geometry.records_per_chapter {
            volume.search_for_rebuild(&name_for(chapter, record), chapter).unwrap();
        }
    }
    (volume, store)
}

/// Cached lookup throughput on the lock-free fast path.
fn bench_cached_lookup(c: &mut Criterion) {
    let (volume, _store) = warm_volume(4);
    let records = volume.geometry.records_per_chapter;

    c.bench_function("cached_record_lookup", |b| {
        let mut next = 0u32;
        b.iter(|| {
            let record = next % records;
            let chapter = u64::from(next / records % 4);
            next = next.wrapping_add(1);
            let request = Request::new(name_for(chapter, record), chapter, 0);
            match volume.search(black_box(request)).unwrap() {
                CacheResult::Ready(done) => assert!(done.found),
                CacheResult::Queued => panic!("cache was warmed"),
            }
        });
    });
}

/// Delta-list search cost inside a single decoded index page.
fn bench_index_page_search(c: &mut Criterion) {
    let geometry = Geometry::new(32768, 64, 16, 0).unwrap();
    let mut builder = ChapterIndexBuilder::new(&geometry, 9, NONCE);
    for record in 0..geometry.records_per_chapter {
        builder
            .put(&name_for(9, record), record / geometry.records_per_page, &geometry)
            .unwrap();
    }
    let pages: Vec<DeltaIndexPage> = builder
        .pack_all(&geometry)
        .unwrap()
        .into_iter()
        .map(|(memory, _)| DeltaIndexPage::parse(memory, NONCE, &geometry).unwrap())
        .collect();
    let mut page_map = IndexPageMap::new(&geometry);
    for (index_page, (_, last_list)) in
        builder.pack_all(&geometry).unwrap().into_iter().enumerate()
    {
        page_map.update(9, 9, index_page as u32, last_list);
    }

    let mut group = c.benchmark_group("index_page_search");
    for probe in [0u32, 1000, 50_000] {
        group.bench_with_input(BenchmarkId::from_parameter(probe), &probe, |b, &probe| {
            let name = name_for(9, probe);
            let page = page_map.find_index_page(9, &name, &geometry);
            b.iter(|| {
                let found = pages[page as usize].search(black_box(&name), &geometry).unwrap();
                assert!(found.is_some());
            });
        });
    }
    group.finish();
}

fn benches_config() -> Criterion {
    Criterion::default().measurement_time(Duration::from_secs(5))
}

criterion_group! {
    name = benches;
    config = benches_config();
    targets = bench_cached_lookup, bench_index_page_search
}
criterion_main!(benches);
