use std::fs::File;
use std::path::Path;

use bytes::Bytes;
use memmap2::{Mmap, MmapOptions};
use parking_lot::RwLock;

use crate::core::error::{Error, Result};
use crate::core::geometry::Geometry;

/// Read access to the volume's physical pages. Implementations must be safe
/// to call from zone threads and reader threads concurrently.
pub trait VolumeStore: Send + Sync {
    fn read_page(&self, physical_page: u32) -> Result<Bytes>;

    fn page_count(&self) -> u32;

    /// Hint that a contiguous page range is about to be read.
    fn prefetch(&self, _first_page: u32, _count: u32) {}
}

/// Memory-mapped volume file for zero-copy reads.
pub struct MmapStore {
    mmap: Mmap,
    bytes_per_page: usize,
    page_count: u32,
}

impl MmapStore {
    pub fn open<P: AsRef<Path>>(path: P, geometry: &Geometry) -> Result<MmapStore> {
        let file = File::open(&path)?;
        let len = file.metadata()?.len() as usize;
        let bytes_per_page = geometry.bytes_per_page as usize;
        if len < bytes_per_page {
            return Err(Error::corrupt(format!(
                "volume file of {} bytes holds no complete page",
                len
            )));
        }

        let mmap = unsafe { MmapOptions::new().len(len).map(&file)? };
        Ok(MmapStore {
            mmap,
            bytes_per_page,
            page_count: (len / bytes_per_page) as u32,
        })
    }
}

impl VolumeStore for MmapStore {
    fn read_page(&self, physical_page: u32) -> Result<Bytes> {
        if physical_page >= self.page_count {
            return Err(Error::invalid_argument(format!(
                "page {} past end of volume ({} pages)",
                physical_page, self.page_count
            )));
        }
        let offset = physical_page as usize * self.bytes_per_page;
        Ok(Bytes::copy_from_slice(&self.mmap[offset..offset + self.bytes_per_page]))
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn prefetch(&self, first_page: u32, count: u32) {
        if first_page >= self.page_count || count == 0 {
            return;
        }
        let count = count.min(self.page_count - first_page);
        let offset = first_page as usize * self.bytes_per_page;
        let length = count as usize * self.bytes_per_page;
        let addr = self.mmap[offset..].as_ptr() as *mut libc::c_void;
        unsafe {
            libc::posix_madvise(addr, length, libc::POSIX_MADV_WILLNEED);
        }
    }
}

/// In-memory volume, writable, for tests and demos.
pub struct MemStore {
    pages: RwLock<Vec<Option<Bytes>>>,
    bytes_per_page: usize,
}

impl MemStore {
    pub fn new(geometry: &Geometry) -> MemStore {
        MemStore {
            pages: RwLock::new(vec![None; geometry.physical_page_count() as usize]),
            bytes_per_page: geometry.bytes_per_page as usize,
        }
    }

    pub fn write_page(&self, physical_page: u32, data: Bytes) -> Result<()> {
        if data.len() != self.bytes_per_page {
            return Err(Error::invalid_argument(format!(
                "page write of {} bytes, want {}",
                data.len(),
                self.bytes_per_page
            )));
        }
        let mut pages = self.pages.write();
        let slot = pages
            .get_mut(physical_page as usize)
            .ok_or_else(|| Error::invalid_argument(format!("page {} past end", physical_page)))?;
        *slot = Some(data);
        Ok(())
    }
}

impl VolumeStore for MemStore {
    fn read_page(&self, physical_page: u32) -> Result<Bytes> {
        let pages = self.pages.read();
        pages
            .get(physical_page as usize)
            .and_then(|p| p.clone())
            .ok_or_else(|| {
                Error::new(
                    crate::core::error::ErrorKind::Io,
                    format!("page {} has never been written", physical_page),
                )
            })
    }

    fn page_count(&self) -> u32 {
        self.pages.read().len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mem_store_round_trip() {
        let geometry = Geometry::new(4096, 4, 4, 0).unwrap();
        let store = MemStore::new(&geometry);
        let page = Bytes::from(vec![7u8; 4096]);
        store.write_page(3, page.clone()).unwrap();
        assert_eq!(store.read_page(3).unwrap(), page);
        assert_eq!(store.read_page(4).unwrap_err().kind, crate::core::error::ErrorKind::Io);
        assert!(store.write_page(0, Bytes::from_static(b"short")).is_err());
    }

    #[test]
    fn mmap_store_reads_pages() {
        let geometry = Geometry::new(4096, 4, 4, 0).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut expected = Vec::new();
        for page in 0..3u8 {
            let data = vec![page + 1; 4096];
            file.write_all(&data).unwrap();
            expected.push(Bytes::from(data));
        }
        file.flush().unwrap();

        let store = MmapStore::open(file.path(), &geometry).unwrap();
        assert_eq!(store.page_count(), 3);
        for (page, data) in expected.iter().enumerate() {
            assert_eq!(&store.read_page(page as u32).unwrap(), data);
        }
        store.prefetch(0, 3);
        assert!(store.read_page(3).is_err());
    }
}
