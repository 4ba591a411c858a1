pub mod page_cache;
pub mod sparse_cache;

use crate::core::error::Result;
use crate::core::name::{RecordData, RecordName};

/// Where a request's lookup last made progress, so a requeued request can
/// resume without repeating work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestLocation {
    Unknown,
    Unavailable,
    IndexPageLookup,
    RecordPageLookup,
}

/// One in-flight fingerprint lookup, tagged with its zone and target chapter.
#[derive(Debug, Clone)]
pub struct Request {
    pub name: RecordName,
    pub virtual_chapter: u64,
    pub zone: usize,
    pub location: RequestLocation,
    /// Record page found by an index-page lookup, carried across a requeue.
    pub record_page: Option<u16>,
    pub data: Option<RecordData>,
    pub found: bool,
}

impl Request {
    pub fn new(name: RecordName, virtual_chapter: u64, zone: usize) -> Request {
        Request {
            name,
            virtual_chapter,
            zone,
            location: RequestLocation::Unknown,
            record_page: None,
            data: None,
            found: false,
        }
    }
}

/// Outcome of a cache entry point: the answer, or a promise that the request
/// was parked on a background read and will be re-delivered.
#[derive(Debug)]
pub enum CacheResult<T> {
    Ready(T),
    Queued,
}

/// Re-delivers requests parked on a background read once it completes.
pub trait RequestRestarter: Send + Sync {
    fn restart(&self, request: Request, status: Result<()>);
}
