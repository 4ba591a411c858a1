use bytes::Bytes;

use crate::core::error::{Error, Result};
use crate::core::geometry::Geometry;
use crate::core::name::{RECORD_NAME_SIZE, RecordName};
use crate::index::delta_page::{
    CodingConstants, GUARD_BYTES, IMMUTABLE_HEADER_BITS, compute_coding_constants,
    immutable_header_offset,
};

const COLLISION_BITS: u32 = RECORD_NAME_SIZE as u32 * 8;

/// Write a bit field of up to 25 bits at an arbitrary bit boundary.
fn set_field(value: u32, memory: &mut [u8], offset: u64, size: u32) {
    let byte = (offset / 8) as usize;
    let shift = (offset % 8) as u32;
    let end = memory.len().min(byte + 4);
    let mut buf = [0u8; 4];
    buf[..end - byte].copy_from_slice(&memory[byte..end]);
    let mut data = u32::from_le_bytes(buf);
    data &= !(((1u32 << size) - 1) << shift);
    data |= value << shift;
    memory[byte..end].copy_from_slice(&data.to_le_bytes()[..end - byte]);
}

fn set_zero(memory: &mut [u8], offset: u64, mut size: u32) {
    if size == 0 {
        return;
    }
    let mut byte = (offset / 8) as usize;
    let shift = (offset % 8) as u32;
    let count = if size + shift > 8 { 8 - shift } else { size };
    memory[byte] &= !((((1u16 << count) - 1) << shift) as u8);
    byte += 1;
    size -= count;
    while size > 8 {
        memory[byte] = 0;
        byte += 1;
        size -= 8;
    }
    if size > 0 {
        memory[byte] &= !(((1u16 << size) - 1) as u8);
    }
}

fn set_collision_name(name: &[u8; RECORD_NAME_SIZE], memory: &mut [u8], offset: u64) {
    let mut byte = (offset / 8) as usize;
    let shift = (offset % 8) as u32;
    let mask = !(0x00FFu16 << shift);
    for &b in name.iter() {
        let data =
            (u16::from_le_bytes([memory[byte], memory[byte + 1]]) & mask) | (u16::from(b) << shift);
        memory[byte..byte + 2].copy_from_slice(&data.to_le_bytes());
        byte += 1;
    }
}

#[derive(Debug, Clone)]
struct ListEntry {
    address: u32,
    value: u32,
    name: [u8; RECORD_NAME_SIZE],
}

/// Accumulates one chapter's worth of (name, record page) entries and packs
/// them into immutable index pages.
pub struct ChapterIndexBuilder {
    lists: Vec<Vec<ListEntry>>,
    virtual_chapter: u64,
    nonce: u64,
    value_bits: u32,
    coding: CodingConstants,
}

impl ChapterIndexBuilder {
    pub fn new(geometry: &Geometry, virtual_chapter: u64, nonce: u64) -> ChapterIndexBuilder {
        ChapterIndexBuilder {
            lists: vec![Vec::new(); geometry.delta_lists_per_chapter as usize],
            virtual_chapter,
            nonce,
            value_bits: geometry.chapter_payload_bits,
            coding: compute_coding_constants(crate::core::geometry::CHAPTER_MEAN_DELTA),
        }
    }

    /// Record that `name` lives on `record_page`. Duplicate addresses become
    /// collision entries carrying the full name.
    pub fn put(&mut self, name: &RecordName, record_page: u32, geometry: &Geometry) -> Result<()> {
        if record_page >= (1 << self.value_bits) {
            return Err(Error::overflow(format!(
                "record page {} does not fit in {} bits",
                record_page, self.value_bits
            )));
        }

        let list = name.chapter_delta_list(geometry) as usize;
        let address = name.chapter_delta_address(geometry);
        let entry = ListEntry { address, value: record_page, name: name.0 };

        // Insert after any equal addresses so collisions trail their base.
        let slot = self.lists[list].partition_point(|e| e.address <= address);
        self.lists[list].insert(slot, entry);
        Ok(())
    }

    /// Encoded bit size of one list.
    fn list_bits(&self, list: &[ListEntry]) -> u32 {
        let mut bits = 0;
        let mut prev = 0;
        for (i, entry) in list.iter().enumerate() {
            let collision = i > 0 && entry.address == prev;
            let delta = if collision { 0 } else { entry.address - prev };
            bits += self.entry_bits(delta, collision);
            prev = entry.address;
        }
        bits
    }

    fn entry_bits(&self, delta: u32, collision: bool) -> u32 {
        let key_bits = self.coding.min_bits
            + (self.coding.incr_keys - self.coding.min_keys + delta) / self.coding.incr_keys;
        self.value_bits + key_bits + if collision { COLLISION_BITS } else { 0 }
    }

    fn encode_delta(&self, delta: u32, memory: &mut [u8], offset: u64) {
        if delta < self.coding.min_keys {
            set_field(delta, memory, offset, self.coding.min_bits);
            return;
        }
        let temp = delta - self.coding.min_keys;
        let quotient = temp / self.coding.incr_keys;
        let remainder = (temp % self.coding.incr_keys) + self.coding.min_keys;
        set_field(remainder, memory, offset, self.coding.min_bits);
        set_zero(memory, offset + u64::from(self.coding.min_bits), quotient);
        set_field(
            1,
            memory,
            offset + u64::from(self.coding.min_bits) + u64::from(quotient),
            1,
        );
    }

    /// Pack as many lists as fit, starting at `first_list`. Returns the page
    /// and the number of lists packed.
    pub fn pack_page(&self, first_list: u32, bytes_per_page: u32) -> Result<(Bytes, u32)> {
        let total_lists = self.lists.len() as u32;
        let max_lists = total_lists - first_list;

        let mut free_bits = i64::from(bytes_per_page * 8);
        free_bits -= immutable_header_offset(1) as i64;
        free_bits -= i64::from(GUARD_BYTES * 8);
        if free_bits < i64::from(IMMUTABLE_HEADER_BITS) {
            return Err(Error::overflow(format!(
                "chapter index page of {} bytes is too small",
                bytes_per_page
            )));
        }

        let mut n_lists = 0u32;
        while n_lists < max_lists {
            let list = &self.lists[(first_list + n_lists) as usize];
            let bits = i64::from(IMMUTABLE_HEADER_BITS + self.list_bits(list));
            if bits > free_bits {
                break;
            }
            n_lists += 1;
            free_bits -= bits;
        }

        let mut memory = vec![0u8; bytes_per_page as usize];
        memory[0..8].copy_from_slice(&self.nonce.to_le_bytes());
        memory[8..16].copy_from_slice(&self.virtual_chapter.to_le_bytes());
        memory[16..18].copy_from_slice(&(first_list as u16).to_le_bytes());
        memory[18..20].copy_from_slice(&(n_lists as u16).to_le_bytes());

        // Offset table, then the list bit streams.
        let mut offset = immutable_header_offset(n_lists + 1);
        set_field(
            offset as u32,
            &mut memory,
            immutable_header_offset(0),
            IMMUTABLE_HEADER_BITS,
        );
        for i in 0..n_lists {
            let list = &self.lists[(first_list + i) as usize];
            self.encode_list(list, &mut memory, offset);
            offset += u64::from(self.list_bits(list));
            set_field(
                offset as u32,
                &mut memory,
                immutable_header_offset(i + 1),
                IMMUTABLE_HEADER_BITS,
            );
        }

        let guard_start = memory.len() - GUARD_BYTES as usize;
        memory[guard_start..].fill(0xFF);
        Ok((Bytes::from(memory), n_lists))
    }

    fn encode_list(&self, list: &[ListEntry], memory: &mut [u8], start: u64) {
        let mut offset = start;
        let mut prev = 0;
        for (i, entry) in list.iter().enumerate() {
            let collision = i > 0 && entry.address == prev;
            let delta = if collision { 0 } else { entry.address - prev };
            let bits = self.entry_bits(delta, collision);
            set_field(entry.value, memory, offset, self.value_bits);
            self.encode_delta(delta, memory, offset + u64::from(self.value_bits));
            if collision {
                set_collision_name(
                    &entry.name,
                    memory,
                    offset + u64::from(bits) - u64::from(COLLISION_BITS),
                );
            }
            offset += u64::from(bits);
            prev = entry.address;
        }
    }

    /// Pack the whole chapter into exactly `index_pages_per_chapter` pages.
    /// Returns each page with the largest list number assigned so far, for
    /// the index page map.
    pub fn pack_all(&self, geometry: &Geometry) -> Result<Vec<(Bytes, u32)>> {
        let mut pages = Vec::with_capacity(geometry.index_pages_per_chapter as usize);
        let mut first_list = 0u32;
        for page in 0..geometry.index_pages_per_chapter {
            let (memory, n_lists) = self.pack_page(first_list, geometry.bytes_per_page)?;
            if n_lists == 0 && first_list < geometry.delta_lists_per_chapter {
                return Err(Error::overflow(format!(
                    "list {} does not fit on index page {}",
                    first_list, page
                )));
            }
            first_list += n_lists;
            pages.push((memory, first_list.wrapping_sub(1)));
        }
        if first_list < geometry.delta_lists_per_chapter {
            return Err(Error::overflow(format!(
                "chapter index needs more than {} pages",
                geometry.index_pages_per_chapter
            )));
        }
        Ok(pages)
    }
}
