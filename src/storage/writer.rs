// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage writer — appends frames, rolls to a new block on a key-frame
//! threshold boundary, and publishes index entries atomically (spec
//! §4.4).
//!
//! A block's destination is reserved (peeked off the freedex) before any
//! byte is written into it, and only published into the dumbdex at seal
//! time — so a reader never observes a block that isn't either absent or
//! fully sealed (spec §5). See [`crate::storage::dumbdex::Dumbdex::peek_free_block`].
//!
//! When no block is available, the prune hook runs once before giving up
//! (spec §4.4). If pruning couldn't free anything because every block is
//! still inside its retention window, that's the soft `StorageFull`
//! case: the frame is dropped and the writer keeps accepting samples,
//! retrying on the next key frame. Only a genuinely inconsistent state —
//! pruning freed blocks that still don't show up in the freedex —
//! escalates to the fatal `StorageExhausted` (spec §7).

use std::sync::Arc;

use tracing::warn;

use crate::error::{RevereError, Result};
use crate::storage::block_store::BlockStore;
use crate::storage::dumbdex::Dumbdex;
use crate::storage::framer::{BlockCursor, CodecMeta, KEY_FLAG};
use crate::storage::MediaType;

#[derive(Debug, Default)]
struct TimestampCorrection {
    last_ts: Option<u64>,
    correction: i64,
}

impl TimestampCorrection {
    /// Apply the running correction offset, then, if the result is not
    /// strictly greater than the last emitted timestamp, clip it to
    /// `last + 1` and grow the offset to match (spec §4.4, §9: a
    /// persistent backward jump is clipped rather than dropped, which
    /// keeps every frame on disk instead of silently discarding video).
    fn apply(&mut self, ts: u64) -> u64 {
        let corrected = (ts as i64 + self.correction).max(0) as u64;
        let corrected = match self.last_ts {
            Some(last) if corrected <= last => {
                self.correction += (last as i64 + 1) - corrected as i64;
                last + 1
            }
            _ => corrected,
        };
        self.last_ts = Some(corrected);
        corrected
    }
}

/// Remove every dumbdex entry older than `cutoff_ns`, freeing its block.
/// Returns the number of blocks freed (spec §4.10).
pub fn prune(store: &BlockStore, now_ns: i64, retention_age_ns: i64) -> Result<usize> {
    let cutoff = now_ns - retention_age_ns;
    let dd = Dumbdex::new(store);
    let stale: Vec<u64> = dd.iter().into_iter().map(|(ts, _)| ts).filter(|&ts| (ts as i64) < cutoff).collect();
    let freed = stale.len();
    for ts in stale {
        dd.remove(ts)?;
    }
    Ok(freed)
}

pub struct StorageWriter {
    store: Arc<BlockStore>,
    seal_threshold: f64,
    retention_age_ns: i64,
    meta: CodecMeta,
    video: TimestampCorrection,
    audio: TimestampCorrection,
    current_block: Option<u16>,
    cursor: BlockCursor,
}

impl StorageWriter {
    pub fn new(store: Arc<BlockStore>, seal_threshold: f64, retention_age_ns: i64) -> Self {
        Self {
            store,
            seal_threshold,
            retention_age_ns,
            meta: CodecMeta::default(),
            video: TimestampCorrection::default(),
            audio: TimestampCorrection::default(),
            current_block: None,
            cursor: BlockCursor::default(),
        }
    }

    /// Finalize negotiated video codec metadata from the source (spec
    /// §4.6 step 1). No effect on an already-sealed block's metadata.
    pub fn set_video_codec(&mut self, name: String, parameters: String) {
        self.meta.video_codec_name = name;
        self.meta.video_codec_parameters = parameters;
    }

    pub fn set_audio_codec(&mut self, name: String, parameters: String) {
        self.meta.audio_codec_name = name;
        self.meta.audio_codec_parameters = parameters;
    }

    /// Append one frame. `ts` is the caller's wall-clock timestamp in
    /// nanoseconds before monotonic correction is applied.
    pub fn write_frame(&mut self, media_type: MediaType, payload: &[u8], key: bool, ts: u64, now_ns: i64) -> Result<()> {
        let stream_id = media_type
            .stream_id()
            .ok_or_else(|| RevereError::InvalidArgument("write_frame requires Video or Audio, not All".into()))?;

        let block_size = self.store.block_size() as usize;
        if crate::storage::framer::FRAME_HEADER_LEN + payload.len() + 64 > block_size {
            return Err(RevereError::InvalidArgument(format!(
                "frame of {} bytes cannot fit in a {block_size}-byte block",
                payload.len()
            )));
        }

        let corrected = match media_type {
            MediaType::Video => self.video.apply(ts),
            MediaType::Audio => self.audio.apply(ts),
            MediaType::All => unreachable!("checked above"),
        };

        let is_new_video_key = media_type == MediaType::Video && key;

        if self.current_block.is_none() {
            if !is_new_video_key {
                return Ok(()); // drop frames until a video key frame opens the first block
            }
            if let Err(e) = self.open_block(now_ns) {
                return Self::absorb_storage_full(e);
            }
        } else {
            let used_fraction = self.cursor.data_used() as f64 / block_size as f64;
            let over_threshold = used_fraction > self.seal_threshold;
            let overflow = !self.cursor.fits(block_size, payload.len(), &self.meta);
            if is_new_video_key && (over_threshold || overflow) {
                self.seal_current_block()?;
                if let Err(e) = self.open_block(now_ns) {
                    return Self::absorb_storage_full(e);
                }
            } else if overflow {
                warn!("dropping frame: block full and no key frame available to seal on");
                return Ok(());
            }
        }

        let blk = self.current_block.expect("block opened above");
        let mut view = self.store.block(blk)?;
        self.cursor.push_frame(&mut view, corrected, if key { KEY_FLAG } else { 0 }, stream_id, payload)?;
        Ok(())
    }

    /// Seal whatever block is currently open, if any. Used on graceful
    /// shutdown so in-flight data becomes queryable instead of being
    /// silently dropped.
    pub fn flush(&mut self) -> Result<()> {
        if self.current_block.is_some() {
            self.seal_current_block()?;
        }
        Ok(())
    }

    /// Collapse a soft [`RevereError::StorageFull`] into a dropped frame
    /// instead of a failed write (spec §7: "context emits a warning and
    /// continues accepting frames that are dropped until prune
    /// succeeds"). Any other error still propagates, including
    /// `StorageExhausted`, which is fatal to the caller.
    fn absorb_storage_full(e: RevereError) -> Result<()> {
        match e {
            RevereError::StorageFull => {
                warn!("storage full: dropping frame until prune reclaims a block");
                Ok(())
            }
            other => Err(other),
        }
    }

    fn open_block(&mut self, now_ns: i64) -> Result<()> {
        let blk = self.reserve_block(now_ns)?;
        let mut view = self.store.block(blk)?;
        self.cursor = BlockCursor::new(&mut view);
        self.current_block = Some(blk);
        Ok(())
    }

    /// Reserve the next block to write into. A miss is first handed to
    /// the prune hook, per spec §4.4 ("if `dumbdex.insert` returns `Full`,
    /// the writer invokes the prune hook... and retries"); if pruning
    /// reclaimed something but the freedex still looks empty, that
    /// contradicts the single-writer invariant and is treated as fatal.
    /// If pruning reclaimed nothing, every stored block is still inside
    /// its retention window — not a terminal failure, just no room yet —
    /// so this returns the soft `StorageFull` signal instead.
    fn reserve_block(&self, now_ns: i64) -> Result<u16> {
        let dd = Dumbdex::new(&self.store);
        if let Some(blk) = dd.peek_free_block() {
            return Ok(blk);
        }
        let freed = prune(&self.store, now_ns, self.retention_age_ns)?;
        if let Some(blk) = dd.peek_free_block() {
            return Ok(blk);
        }
        if freed > 0 {
            return Err(RevereError::StorageExhausted);
        }
        Err(RevereError::StorageFull)
    }

    fn seal_current_block(&mut self) -> Result<()> {
        let blk = self.current_block.take().expect("seal called without an open block");
        let first_ts = self.cursor.first_ts().expect("a sealed block always has at least one frame");
        let cursor = std::mem::take(&mut self.cursor);
        {
            let mut view = self.store.block(blk)?;
            cursor.seal(&mut view, &self.meta)?;
            view.flush()?;
        }
        let dd = Dumbdex::new(&self.store);
        let published = dd.insert(first_ts)?;
        debug_assert_eq!(
            published, blk,
            "peeked free block must match the one popped at seal time under the single-writer invariant"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::reader::StorageReader;
    use crate::storage::MediaType;

    #[test]
    fn clips_non_monotonic_timestamps_forward() {
        let mut tc = TimestampCorrection::default();
        assert_eq!(tc.apply(1000), 1000);
        assert_eq!(tc.apply(2000), 2000);
        // Backward jump: clipped to prev + 1, correction absorbs the gap.
        assert_eq!(tc.apply(500), 2001);
        // Subsequent frames keep the corrected offset applied.
        assert_eq!(tc.apply(600), 2101);
    }

    #[test]
    fn storage_full_drops_frames_without_killing_the_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam.rvd");
        // One block, and a retention window long enough that nothing is
        // ever prunable within this test.
        BlockStore::allocate(&path, 512, 1).unwrap();
        let store = Arc::new(BlockStore::open(&path).unwrap());
        let mut w = StorageWriter::new(store.clone(), 0.01, 14 * 24 * 3600 * 1_000_000_000);

        // First key frame opens and immediately fills the only block.
        w.write_frame(MediaType::Video, &vec![0xAAu8; 50], true, 1000, 1000).unwrap();
        // Past the 1% threshold: this key frame seals that block, then
        // finds the freedex empty and nothing prunable yet. Rather than
        // erroring out, the writer drops this frame (and the block
        // stays unopened) and keeps running.
        w.write_frame(MediaType::Video, &vec![0xBBu8; 50], true, 2000, 2000).unwrap();
        // Still no room: dropped the same way.
        w.write_frame(MediaType::Video, &vec![0xCCu8; 50], true, 3000, 3000).unwrap();

        let reader = StorageReader::new(&store);
        assert_eq!(reader.query_blocks(0, u64::MAX).unwrap().len(), 1, "only the first key frame's block was ever sealed");
    }

    #[test]
    fn writer_requires_concrete_media_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam.rvd");
        BlockStore::allocate(&path, 4096, 4).unwrap();
        let store = Arc::new(BlockStore::open(&path).unwrap());
        let mut w = StorageWriter::new(store, 0.75, 14 * 24 * 3600 * 1_000_000_000);
        let err = w.write_frame(MediaType::All, b"x", true, 0, 0).unwrap_err();
        assert!(matches!(err, RevereError::InvalidArgument(_)));
    }
}
