use crate::core::error::{Error, Result};

/// Runtime tuning for the volume caches.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_chapters: usize,     // chapters worth of pages kept in the page cache
    pub zone_count: usize,         // lookup threads, each owning a name partition
    pub read_threads: usize,       // background reader threads for the page cache
    pub sparse_capacity: usize,    // whole chapter indexes held by the sparse cache
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_chapters: 7,
            zone_count: num_cpus::get().min(super::MAX_ZONES),
            read_threads: 2,
            sparse_capacity: 10,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.zone_count == 0 || self.zone_count > super::MAX_ZONES {
            return Err(Error::invalid_argument(format!(
                "zone count {} not in 1..={}",
                self.zone_count,
                super::MAX_ZONES
            )));
        }
        if self.cache_chapters == 0 {
            return Err(Error::invalid_argument("page cache needs at least one chapter"));
        }
        if self.read_threads == 0 {
            return Err(Error::invalid_argument("need at least one reader thread"));
        }
        Ok(())
    }
}
