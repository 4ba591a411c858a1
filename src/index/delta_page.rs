use bytes::Bytes;

use crate::core::error::{Error, Result};
use crate::core::geometry::{Geometry, bits_per};
use crate::core::name::{RECORD_NAME_SIZE, RecordName};

/// Fixed page header: nonce u64, virtual chapter u64, first list u16,
/// list count u16, all little-endian.
pub const HEADER_BYTES: u32 = 20;

/// Each list start is recorded as a 19-bit offset (64 KiB bit range).
pub const IMMUTABLE_HEADER_BITS: u32 = 19;

/// Trailing all-ones bytes that bound every bit-stream read.
pub const GUARD_BYTES: u32 = 7;

const COLLISION_BYTES: u32 = RECORD_NAME_SIZE as u32;
const COLLISION_BITS: u32 = COLLISION_BYTES * 8;

/// Parameters of the unary-quotient delta code for a given mean delta.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CodingConstants {
    pub min_bits: u32,
    pub min_keys: u32,
    pub incr_keys: u32,
}

/// Integer approximation of ln(2) * mean_delta, which splits deltas into a
/// fixed-width field and a unary tail of the right average cost.
pub(crate) fn compute_coding_constants(mean_delta: u32) -> CodingConstants {
    let incr_keys = ((836_158u64 * u64::from(mean_delta) + 603_160) / 1_206_321) as u32;
    let min_bits = bits_per(incr_keys + 1);
    let min_keys = (1u32 << min_bits) - incr_keys;
    CodingConstants { min_bits, min_keys, incr_keys }
}

/// Expected bit cost of a delta index holding `entry_count` entries.
pub fn compute_delta_index_bits(entry_count: u64, mean_delta: u32, payload_bits: u32) -> u64 {
    let coding = compute_coding_constants(mean_delta);
    // Each delta costs about min_bits + 1.5 bits on average.
    entry_count * u64::from(payload_bits + coding.min_bits + 1) + entry_count / 2
}

/// Pages needed to hold a chapter's delta index, leaving slack for one list
/// header and one list of internal fragmentation per page.
pub fn index_page_count(
    entry_count: u32,
    list_count: u32,
    mean_delta: u32,
    payload_bits: u32,
    bytes_per_page: u32,
) -> u32 {
    let mut bits_per_index =
        compute_delta_index_bits(u64::from(entry_count), mean_delta, payload_bits);
    let bits_per_delta_list = bits_per_index / u64::from(list_count);
    bits_per_index += u64::from(list_count) * u64::from(IMMUTABLE_HEADER_BITS);
    let mut bits_per_page = u64::from((bytes_per_page - HEADER_BYTES) * 8);
    bits_per_page -= u64::from(IMMUTABLE_HEADER_BITS) + bits_per_delta_list;
    bits_per_index.div_ceil(bits_per_page) as u32
}

/// Load up to 8 bytes little-endian, zero-padded past the end of the page.
#[inline]
fn load_u64(memory: &[u8], byte_offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    if byte_offset < memory.len() {
        let end = memory.len().min(byte_offset + 8);
        buf[..end - byte_offset].copy_from_slice(&memory[byte_offset..end]);
    }
    u64::from_le_bytes(buf)
}

#[inline]
fn load_u32(memory: &[u8], byte_offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    if byte_offset < memory.len() {
        let end = memory.len().min(byte_offset + 4);
        buf[..end - byte_offset].copy_from_slice(&memory[byte_offset..end]);
    }
    u32::from_le_bytes(buf)
}

/// Read a bit field of up to 25 bits from an arbitrary bit boundary.
#[inline]
pub(crate) fn get_field(memory: &[u8], offset: u64, size: u32) -> u32 {
    (load_u32(memory, (offset / 8) as usize) >> (offset % 8)) & ((1 << size) - 1)
}

/// Read a bit field of up to 57 bits from an arbitrary bit boundary.
#[inline]
pub(crate) fn get_big_field(memory: &[u8], offset: u64, size: u32) -> u64 {
    (load_u64(memory, (offset / 8) as usize) >> (offset % 8)) & ((1u64 << size) - 1)
}

#[inline]
pub(crate) fn immutable_header_offset(list_number: u32) -> u64 {
    u64::from(HEADER_BYTES * 8 + list_number * IMMUTABLE_HEADER_BITS)
}

#[inline]
fn immutable_start(memory: &[u8], list_number: u32) -> u64 {
    u64::from(get_field(
        memory,
        immutable_header_offset(list_number),
        IMMUTABLE_HEADER_BITS,
    ))
}

struct PageHeader {
    nonce: u64,
    virtual_chapter: u64,
    first_list: u32,
    list_count: u32,
}

fn read_header(memory: &[u8], big_endian: bool) -> PageHeader {
    let word = |range: std::ops::Range<usize>| -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&memory[range]);
        if big_endian { u64::from_be_bytes(buf) } else { u64::from_le_bytes(buf) }
    };
    let half = |range: std::ops::Range<usize>| -> u32 {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(&memory[range]);
        u32::from(if big_endian { u16::from_be_bytes(buf) } else { u16::from_le_bytes(buf) })
    };
    PageHeader {
        nonce: word(0..8),
        virtual_chapter: word(8..16),
        first_list: half(16..18),
        list_count: half(18..20),
    }
}

/// The header fields may be byte-swapped, but the offset table and list bit
/// streams are always in the fixed little-endian bit order.
fn verify_page(header: &PageHeader, expected_nonce: u64, memory: &[u8]) -> bool {
    if header.nonce != expected_nonce {
        return false;
    }

    let memory_size = memory.len() as u64;
    let header_capacity =
        (memory_size - u64::from(HEADER_BYTES)) * 8 / u64::from(IMMUTABLE_HEADER_BITS);
    if u64::from(header.list_count) > header_capacity {
        return false;
    }

    // The first list must start immediately after the offset table.
    if immutable_start(memory, 0) != immutable_header_offset(header.list_count + 1) {
        return false;
    }

    for i in 0..header.list_count {
        if immutable_start(memory, i) > immutable_start(memory, i + 1) {
            return false;
        }
    }

    // The last list must end before the guard region.
    if immutable_start(memory, header.list_count) > (memory_size - u64::from(GUARD_BYTES)) * 8 {
        return false;
    }

    memory[memory.len() - GUARD_BYTES as usize..]
        .iter()
        .all(|&b| b == 0xFF)
}

/// Cursor over one delta list. Starts before the first entry; `next_entry`
/// advances it. `key` accumulates the decoded deltas.
#[derive(Debug, Clone, Copy)]
pub struct DeltaEntry {
    pub key: u32,
    pub at_end: bool,
    pub is_collision: bool,
    offset: u32,
    entry_bits: u32,
    delta: u32,
    list_start: u64,
    list_size: u32,
}

/// One immutable chapter-index page, decoded in place over its buffer.
#[derive(Debug, Clone)]
pub struct DeltaIndexPage {
    memory: Bytes,
    pub virtual_chapter: u64,
    pub lowest_list: u32,
    pub highest_list: u32,
    list_count: u32,
    value_bits: u32,
    coding: CodingConstants,
}

impl DeltaIndexPage {
    /// Decode a page, trying the little-endian header first and falling back
    /// to a byte-swapped header so either writer byte order loads here.
    pub fn parse(memory: Bytes, expected_nonce: u64, geometry: &Geometry) -> Result<DeltaIndexPage> {
        if memory.len() < (HEADER_BYTES + GUARD_BYTES) as usize {
            return Err(Error::corrupt(format!(
                "chapter index page of {} bytes is too small",
                memory.len()
            )));
        }

        let mut header = read_header(&memory, false);
        if !verify_page(&header, expected_nonce, &memory) {
            header = read_header(&memory, true);
            if !verify_page(&header, expected_nonce, &memory) {
                // Expected during rebuild of a volume never fully written.
                return Err(Error::corrupt("chapter index page failed verification"));
            }
        }

        Ok(DeltaIndexPage {
            virtual_chapter: header.virtual_chapter,
            lowest_list: header.first_list,
            highest_list: header.first_list + header.list_count - 1,
            list_count: header.list_count,
            value_bits: geometry.chapter_payload_bits,
            coding: compute_coding_constants(crate::core::geometry::CHAPTER_MEAN_DELTA),
            memory,
        })
    }

    pub fn list_count(&self) -> u32 {
        self.list_count
    }

    /// Position a cursor before the first entry of list `sub_list`
    /// (page-relative list number).
    pub fn start_search(&self, sub_list: u32) -> Result<DeltaEntry> {
        if sub_list >= self.list_count {
            return Err(Error::corrupt(format!(
                "delta list number {} out of range {}",
                sub_list, self.list_count
            )));
        }

        let start = immutable_start(&self.memory, sub_list);
        let end = immutable_start(&self.memory, sub_list + 1);
        Ok(DeltaEntry {
            key: 0,
            at_end: false,
            is_collision: false,
            offset: 0,
            entry_bits: 0,
            delta: 0,
            list_start: start,
            list_size: (end - start) as u32,
        })
    }

    /// Advance to the next entry, decoding its delta. Running past the
    /// recorded list end is corruption.
    pub fn next_entry(&self, entry: &mut DeltaEntry) -> Result<()> {
        if entry.at_end {
            return Err(Error::invalid_state("entry is at the end of the delta list"));
        }

        entry.offset += entry.entry_bits;
        if entry.offset >= entry.list_size {
            entry.at_end = true;
            entry.delta = 0;
            entry.is_collision = false;
            if entry.offset == entry.list_size {
                return Ok(());
            }
            return Err(Error::corrupt("next offset past end of delta list"));
        }

        self.decode_delta(entry);
        if entry.offset + entry.entry_bits > entry.list_size {
            tracing::warn!("decoded past the end of the delta list");
            return Err(Error::corrupt("decoded past the end of the delta list"));
        }
        Ok(())
    }

    /// Decode the delta at the cursor's current offset: a fixed-width field,
    /// and when it lands in the upper key range, a unary extension counted
    /// in whole `incr_keys` steps.
    fn decode_delta(&self, entry: &mut DeltaEntry) {
        let memory = &self.memory;
        let delta_offset = self.entry_offset(entry) + u64::from(self.value_bits);
        let mut byte = (delta_offset / 8) as usize;
        let shift = (delta_offset % 8) as u32;
        let mut data = load_u32(memory, byte) >> shift;
        byte += 4;

        let mut key_bits = self.coding.min_bits;
        let mut delta = data & ((1 << key_bits) - 1);
        if delta >= self.coding.min_keys {
            data >>= key_bits;
            if data == 0 {
                key_bits = 32 - shift;
                loop {
                    data = load_u32(memory, byte);
                    if data != 0 {
                        break;
                    }
                    byte += 4;
                    key_bits += 32;
                }
            }
            key_bits += data.trailing_zeros() + 1;
            delta += (key_bits - self.coding.min_bits - 1) * self.coding.incr_keys;
        }
        entry.delta = delta;
        entry.key += delta;

        // A delta of zero after the first entry marks a collision.
        if delta == 0 && entry.offset > 0 {
            entry.is_collision = true;
            entry.entry_bits = self.value_bits + key_bits + COLLISION_BITS;
        } else {
            entry.is_collision = false;
            entry.entry_bits = self.value_bits + key_bits;
        }
    }

    #[inline]
    fn entry_offset(&self, entry: &DeltaEntry) -> u64 {
        entry.list_start + u64::from(entry.offset)
    }

    pub fn entry_value(&self, entry: &DeltaEntry) -> u32 {
        get_field(&self.memory, self.entry_offset(entry), self.value_bits)
    }

    fn collision_name(&self, entry: &DeltaEntry) -> [u8; RECORD_NAME_SIZE] {
        let offset =
            self.entry_offset(entry) + u64::from(entry.entry_bits) - u64::from(COLLISION_BITS);
        let mut byte = (offset / 8) as usize;
        let shift = (offset % 8) as u32;
        let mut name = [0u8; RECORD_NAME_SIZE];
        for slot in name.iter_mut() {
            let lo = self.memory.get(byte).copied().unwrap_or(0);
            let hi = self.memory.get(byte + 1).copied().unwrap_or(0);
            *slot = (u16::from_le_bytes([lo, hi]) >> shift) as u8;
            byte += 1;
        }
        name
    }

    /// Find the entry for `key`, resolving collisions by full-name compare.
    /// The returned cursor is at the first entry with `entry.key >= key`, or
    /// at the list end.
    pub fn get_entry(&self, sub_list: u32, key: u32, name: &RecordName) -> Result<DeltaEntry> {
        let mut entry = self.start_search(sub_list)?;
        loop {
            self.next_entry(&mut entry)?;
            if entry.at_end || key <= entry.key {
                break;
            }
        }

        if !entry.at_end && key == entry.key {
            let mut collision = entry;
            loop {
                self.next_entry(&mut collision)?;
                if collision.at_end || !collision.is_collision {
                    break;
                }
                if self.collision_name(&collision) == name.0 {
                    entry = collision;
                    break;
                }
            }
        }

        Ok(entry)
    }

    /// Point search: the record page holding `name`, if this chapter index
    /// has an entry for it. The name must route to a list this page covers.
    pub fn search(&self, name: &RecordName, geometry: &Geometry) -> Result<Option<u16>> {
        let list = name.chapter_delta_list(geometry);
        if list < self.lowest_list || list > self.highest_list {
            return Err(Error::corrupt(format!(
                "delta list {} not on page covering {}..={}",
                list, self.lowest_list, self.highest_list
            )));
        }

        let address = name.chapter_delta_address(geometry);
        let entry = self.get_entry(list - self.lowest_list, address, name)?;
        if !entry.at_end && entry.key == address {
            Ok(Some(self.entry_value(&entry) as u16))
        } else {
            Ok(None)
        }
    }

    /// Walk every list to its recorded end, surfacing any decode overrun.
    pub fn validate(&self, expected_chapter: Option<u64>) -> Result<()> {
        if let Some(vcn) = expected_chapter {
            if self.virtual_chapter != vcn {
                return Err(Error::corrupt(format!(
                    "chapter index page for chapter {} expected {}",
                    self.virtual_chapter, vcn
                )));
            }
        }
        for sub_list in 0..self.list_count {
            let mut entry = self.start_search(sub_list)?;
            while !entry.at_end {
                self.next_entry(&mut entry)?;
            }
        }
        Ok(())
    }
}
