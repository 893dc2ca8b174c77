//! Reconciliation: write a dirty leaf's rows to new blocks.

use crate::btree::{MultiBlockEntry, Page, PageRef, RecResult, Tree, IMAGE_HEADER, IMAGE_ROW_HEADER};
use crate::cache::Stat;
use crate::common::{BlockAddr, Result};

/// Write `page` if it is dirty.
///
/// Holds the page lock for the whole write and the rows read lock so no
/// writer slips in between building the image and recording the result.
/// New blocks are written before the previous ones are freed. Returns
/// whether anything was written.
pub(crate) fn reconcile(tree: &Tree, page_ref: &PageRef, page: &Page) -> Result<bool> {
    let Some(rows_lock) = page.rows() else {
        // Internal pages live only in memory.
        return Ok(false);
    };
    let modify = page.modify_or_init();
    let mut state = modify.lock();
    let rows = rows_lock.read();

    if !modify.is_modified() {
        return Ok(false);
    }
    let gen = modify.write_gen();

    let chunks = split_rows(&rows, page_ref.start_key(), tree.config().leaf_page_max);
    let bm = tree.block_manager();
    let mut written: Vec<MultiBlockEntry> = Vec::with_capacity(chunks.len());
    let mut bytes = 0u64;
    for (start_key, image) in &chunks {
        match bm.write(image) {
            Ok(addr) => {
                bytes += u64::from(addr.size);
                written.push(MultiBlockEntry {
                    start_key: *start_key,
                    addr,
                });
            }
            Err(e) => {
                for entry in &written {
                    if let Err(free_err) = bm.free(&entry.addr) {
                        tracing::warn!(
                            tree = tree.name(),
                            error = %free_err,
                            "failed to release block after write error"
                        );
                    }
                }
                return Err(e);
            }
        }
    }

    let result = match written.len() {
        0 => RecResult::Empty,
        1 => RecResult::Replace(written[0].addr),
        _ => RecResult::MultiBlock(written),
    };

    let mut previous: Vec<BlockAddr> = state.rec_result.blocks();
    if state.rec_result == RecResult::None {
        previous.extend(page_ref.addr());
    }
    // The Ref keeps the page's current block while it stays resident.
    page_ref.set_addr(match &result {
        RecResult::Replace(addr) => Some(*addr),
        _ => None,
    });
    state.rec_result = result;
    page.clear_dirty_locked(tree.cache(), gen);

    let stats = tree.cache().stats();
    stats.add(Stat::PagesWritten, chunks.len() as u64);
    stats.add(Stat::BytesWritten, bytes);
    tracing::trace!(
        tree = tree.name(),
        start_key = page_ref.start_key(),
        blocks = chunks.len(),
        freed = previous.len(),
        "page reconciled"
    );

    for addr in &previous {
        bm.free(addr)?;
    }
    Ok(true)
}

/// Split rows into images no larger than `max` (a single oversized row
/// still gets its own image). The first image starts at the page's own
/// start key so the split leaves cover the same key range.
fn split_rows(
    rows: &std::collections::BTreeMap<u64, Vec<u8>>,
    page_start: u64,
    max: usize,
) -> Vec<(u64, Vec<u8>)> {
    let mut chunks = Vec::new();
    let mut current: Vec<(&u64, &Vec<u8>)> = Vec::new();
    let mut current_len = IMAGE_HEADER;
    let mut current_start = page_start;

    for (key, value) in rows {
        let row_len = IMAGE_ROW_HEADER + value.len();
        if !current.is_empty() && current_len + row_len > max {
            chunks.push((current_start, Page::encode_rows(current.drain(..))));
            current_len = IMAGE_HEADER;
            current_start = *key;
        }
        current.push((key, value));
        current_len += row_len;
    }
    if !current.is_empty() {
        chunks.push((current_start, Page::encode_rows(current.into_iter())));
    }
    chunks
}
