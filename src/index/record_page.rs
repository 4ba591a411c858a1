use bytes::Bytes;

use crate::core::error::{Error, Result};
use crate::core::geometry::{BYTES_PER_RECORD, Geometry};
use crate::core::name::{RECORD_NAME_SIZE, RecordData, RecordName};

/// Record pages store their records as a binary tree in heap order over the
/// sorted name sequence, so a search is a memcmp descent from element 0.
pub fn search_record_page(
    page: &[u8],
    name: &RecordName,
    geometry: &Geometry,
) -> Option<RecordData> {
    let records_per_page = geometry.records_per_page as usize;
    let mut node = 0usize;
    while node < records_per_page {
        let start = node * BYTES_PER_RECORD as usize;
        let record_name = &page[start..start + RECORD_NAME_SIZE];
        match name.0.as_slice().cmp(record_name) {
            std::cmp::Ordering::Equal => {
                let mut data = [0u8; 16];
                data.copy_from_slice(&page[start + RECORD_NAME_SIZE..start + 32]);
                return Some(RecordData(data));
            }
            // The children of node N are at 2N+1 and 2N+2.
            std::cmp::Ordering::Less => node = 2 * node + 1,
            std::cmp::Ordering::Greater => node = 2 * node + 2,
        }
    }
    None
}

fn encode_tree(
    page: &mut [u8],
    sorted: &[&(RecordName, RecordData)],
    mut next_record: usize,
    node: usize,
) -> usize {
    if node < sorted.len() {
        let child = 2 * node + 1;
        next_record = encode_tree(page, sorted, next_record, child);

        // In-order traversal fills each node with the next sorted record.
        let (name, data) = sorted[next_record];
        let start = node * BYTES_PER_RECORD as usize;
        page[start..start + RECORD_NAME_SIZE].copy_from_slice(&name.0);
        page[start + RECORD_NAME_SIZE..start + 32].copy_from_slice(&data.0);
        next_record += 1;

        next_record = encode_tree(page, sorted, next_record, child + 1);
    }
    next_record
}

/// Build one record page from exactly `records_per_page` records.
pub fn encode_record_page(
    records: &[(RecordName, RecordData)],
    geometry: &Geometry,
) -> Result<Bytes> {
    if records.len() != geometry.records_per_page as usize {
        return Err(Error::invalid_argument(format!(
            "record page needs {} records, got {}",
            geometry.records_per_page,
            records.len()
        )));
    }

    let mut sorted: Vec<&(RecordName, RecordData)> = records.iter().collect();
    sorted.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let mut page = vec![0u8; geometry.bytes_per_page as usize];
    encode_tree(&mut page, &sorted, 0, 0);
    Ok(Bytes::from(page))
}
