// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Dumbdex — the sorted `(timestamp -> block)` index plus free-list that
//! lives in the block-sized region right after a storage file's header
//! (spec §4.2).
//!
//! Layout within the region (all integers little-endian):
//!
//! ```text
//! [0..4)                      index_count: u32
//! [4..8)                      freedex_count: u32
//! [8..8+10N)                  index slots: N * (ts: u64, blk: u16)
//! [8+10N..8+20N)               freedex slots: N * (blk: u16, 8 bytes reserved)
//! ```
//!
//! where `N = max_indexes_within(block_size)`. The freedex slot is padded
//! to the same 10-byte stride as an index slot so the region's total
//! capacity matches the literal formula in spec §4.2 even though a free
//! slot only needs to carry a block number.

use crate::error::{RevereError, Result};
use crate::storage::block_store::BlockStore;
use crate::storage::journal::Journal;

const COUNTS_LEN: usize = 8;
const SLOT_LEN: usize = 10;

/// `(block_size - 2*sizeof(u32)) / (2*(sizeof(u64)+sizeof(u16)))` (spec §4.2).
pub fn max_indexes_within(block_size: u32) -> u64 {
    (block_size as u64).saturating_sub(COUNTS_LEN as u64) / (2 * SLOT_LEN as u64)
}

fn read_u32(region: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(region[off..off + 4].try_into().unwrap())
}

fn write_u32(region: &mut [u8], off: usize, v: u32) {
    region[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn index_slot_offset(slot: usize) -> usize {
    COUNTS_LEN + slot * SLOT_LEN
}

fn freedex_slot_offset(n: usize, slot: usize) -> usize {
    COUNTS_LEN + n * SLOT_LEN + slot * SLOT_LEN
}

fn read_index_slot(region: &[u8], slot: usize) -> (u64, u16) {
    let off = index_slot_offset(slot);
    let ts = u64::from_le_bytes(region[off..off + 8].try_into().unwrap());
    let blk = u16::from_le_bytes(region[off + 8..off + 10].try_into().unwrap());
    (ts, blk)
}

fn write_index_slot(region: &mut [u8], slot: usize, ts: u64, blk: u16) {
    let off = index_slot_offset(slot);
    region[off..off + 8].copy_from_slice(&ts.to_le_bytes());
    region[off + 8..off + 10].copy_from_slice(&blk.to_le_bytes());
}

fn read_freedex_slot(region: &[u8], n: usize, slot: usize) -> u16 {
    let off = freedex_slot_offset(n, slot);
    u16::from_le_bytes(region[off..off + 2].try_into().unwrap())
}

fn write_freedex_slot(region: &mut [u8], n: usize, slot: usize, blk: u16) {
    let off = freedex_slot_offset(n, slot);
    region[off..off + 2].copy_from_slice(&blk.to_le_bytes());
    region[off + 2..off + 10].fill(0);
}

/// One mutation handle over a storage file's dumbdex region. Does not
/// cache anything — every call re-reads the live, lock-guarded region, so
/// a `Dumbdex` is cheap to construct per call.
pub struct Dumbdex<'a> {
    store: &'a BlockStore,
}

impl<'a> Dumbdex<'a> {
    pub fn new(store: &'a BlockStore) -> Self {
        Self { store }
    }

    /// Slot capacity of this store's dumbdex region.
    pub fn capacity(&self) -> usize {
        max_indexes_within(self.store.block_size()) as usize
    }

    pub fn len(&self) -> usize {
        read_u32(&self.store.dumbdex_region(), 0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_len(&self) -> usize {
        read_u32(&self.store.dumbdex_region(), 4) as usize
    }

    /// Peek the block id that would be returned by the next `insert`,
    /// without mutating anything. Lets a single-writer caller reserve its
    /// destination block and start writing into it before the block is
    /// published into the index (storage writer §4.4) — correct only
    /// because the writer is the sole freedex mutator for its own file
    /// (spec §5: "Block bytes are single-writer by construction").
    pub fn peek_free_block(&self) -> Option<u16> {
        let n = self.capacity();
        let region = self.store.dumbdex_region();
        let free_count = read_u32(&region, 4) as usize;
        if free_count == 0 {
            None
        } else {
            Some(read_freedex_slot(&region, n, free_count - 1))
        }
    }

    /// Zero or more entries carry this exact timestamp for out-of-order
    /// arrival edge cases (spec §4.6); this returns the first match.
    pub fn lookup(&self, ts: u64) -> Option<u16> {
        let region = self.store.dumbdex_region();
        let count = read_u32(&region, 0) as usize;
        let pos = lower_bound(&region, count, ts);
        if pos < count && read_index_slot(&region, pos).0 == ts {
            Some(read_index_slot(&region, pos).1)
        } else {
            None
        }
    }

    /// Index of the first entry with timestamp `>= ts` (spec §4.2).
    pub fn lower_bound(&self, ts: u64) -> usize {
        let region = self.store.dumbdex_region();
        let count = read_u32(&region, 0) as usize;
        lower_bound(&region, count, ts)
    }

    /// Snapshot of every `(ts, blk)` pair in ascending timestamp order.
    pub fn iter(&self) -> Vec<(u64, u16)> {
        let region = self.store.dumbdex_region();
        let count = read_u32(&region, 0) as usize;
        (0..count).map(|i| read_index_slot(&region, i)).collect()
    }

    /// Publish a new `(ts, blk)` entry, `blk` drawn from the freedex.
    /// Ties (an existing entry with the same `ts`) are broken by inserting
    /// after the existing run, so repeated timestamps from a stalled
    /// clock stay retrievable in arrival order (spec §4.6).
    pub fn insert(&self, ts: u64) -> Result<u16> {
        let n = self.capacity();
        let main_path = self.store.path().to_path_buf();
        let mut journal = Journal::begin(&main_path)?;
        let mut view = self.store.dumbdex_region();

        let count = read_u32(&view, 0) as usize;
        let free_count = read_u32(&view, 4) as usize;
        if free_count == 0 {
            drop(view);
            // No mutation happened; nothing was journaled yet besides the
            // (empty) journal file itself — remove it so a later open
            // doesn't think a crash occurred.
            drop(journal);
            let _ = std::fs::remove_file(format!("{}.journal", main_path.display()));
            return Err(RevereError::StorageFull);
        }
        if count >= n {
            drop(view);
            drop(journal);
            let _ = std::fs::remove_file(format!("{}.journal", main_path.display()));
            return Err(RevereError::StorageFull);
        }

        let blk = read_freedex_slot(&view, n, free_count - 1);
        let insert_at = upper_bound(&view, count, ts);

        // Journal: the two count words, the freedex slot being consumed,
        // and every index slot this insert is about to overwrite —
        // `[insert_at, count]` covers both the slots `copy_within` shifts
        // right and the newly written slot at `insert_at` itself.
        journal.record(&view, 0, COUNTS_LEN)?;
        let touched_slots = count + 1 - insert_at;
        journal.record(&view, index_slot_offset(insert_at), touched_slots * SLOT_LEN)?;
        let freed_off = freedex_slot_offset(n, free_count - 1);
        journal.record(&view, freed_off, SLOT_LEN)?;

        if insert_at < count {
            let shift_off = index_slot_offset(insert_at);
            let shift_len = (count - insert_at) * SLOT_LEN;
            view.copy_within(shift_off..shift_off + shift_len, shift_off + SLOT_LEN);
        }
        write_index_slot(&mut view, insert_at, ts, blk);
        write_freedex_slot(&mut view, n, free_count - 1, 0);
        write_u32(&mut view, 0, (count + 1) as u32);
        write_u32(&mut view, 4, (free_count - 1) as u32);

        view.commit_journal(journal)?;
        Ok(blk)
    }

    /// Remove the entry at exactly `ts`, returning its block to the
    /// freedex. No-op (returns `Ok(())`) if no entry matches.
    pub fn remove(&self, ts: u64) -> Result<()> {
        let n = self.capacity();
        let main_path = self.store.path().to_path_buf();
        let mut view = self.store.dumbdex_region();

        let count = read_u32(&view, 0) as usize;
        let pos = lower_bound(&view, count, ts);
        if pos >= count || read_index_slot(&view, pos).0 != ts {
            return Ok(());
        }
        let blk = read_index_slot(&view, pos).1;
        let free_count = read_u32(&view, 4) as usize;

        let mut journal = Journal::begin(&main_path)?;
        journal.record(&view, 0, COUNTS_LEN)?;
        // Pre-image of every slot from `pos` to the last used slot: the
        // removed slot itself, plus everything that will shift left.
        let shift_off = index_slot_offset(pos);
        let shift_len = (count - pos) * SLOT_LEN;
        journal.record(&view, shift_off, shift_len)?;
        let new_free_off = freedex_slot_offset(n, free_count);
        journal.record(&view, new_free_off, SLOT_LEN)?;

        if pos + 1 < count {
            let src_off = index_slot_offset(pos + 1);
            let len = (count - pos - 1) * SLOT_LEN;
            view.copy_within(src_off..src_off + len, shift_off);
        }
        // Zero the now-unused last index slot.
        write_index_slot(&mut view, count - 1, 0, 0);
        write_freedex_slot(&mut view, n, free_count, blk);
        write_u32(&mut view, 0, (count - 1) as u32);
        write_u32(&mut view, 4, (free_count + 1) as u32);

        view.commit_journal(journal)?;
        Ok(())
    }
}

fn lower_bound(region: &[u8], count: usize, ts: u64) -> usize {
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if read_index_slot(region, mid).0 < ts {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

fn upper_bound(region: &[u8], count: usize, ts: u64) -> usize {
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if read_index_slot(region, mid).0 <= ts {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Zero every count/index/freedex byte, then push `num_blocks` blocks
/// (`0..num_blocks`) onto the freedex. Called once by
/// [`BlockStore::allocate`] against the freshly zeroed region.
pub fn init(region: &mut [u8], block_size: u32, num_blocks: u32) {
    let n = max_indexes_within(block_size) as usize;
    region[..COUNTS_LEN + n * SLOT_LEN * 2].fill(0);
    write_u32(region, 0, 0);
    write_u32(region, 4, num_blocks);
    for i in 0..num_blocks as usize {
        write_freedex_slot(region, n, i, i as u16);
    }
}
