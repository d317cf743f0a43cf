// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Segment framer — packs a GOP-aligned run of frames into one block and
//! unpacks it again (spec §4.3, §6.2).
//!
//! Block layout:
//!
//! ```text
//! [0..4)              tail_offset: u32 (0 while the block is still open)
//! [4..tail_offset)    frame records, growing forward
//! [tail_offset..)     trailing table: frame count, per-frame index, codec metadata
//! ```
//!
//! Each frame record is `ts:u64 | flags:u8 | stream_id:u8 | size:u32 | payload`.
//! The four leading bytes function as the block's own tiny header — "just
//! inside the header of the block is a pointer to the tail-table start"
//! (spec §9) — so frame data itself starts at offset 4, not 0.

use crate::error::{RevereError, Result};

pub const FRAME_AREA_START: usize = 4;
pub const FRAME_HEADER_LEN: usize = 8 + 1 + 1 + 4;
const TAIL_ENTRY_LEN: usize = 4 + 8 + 1 + 1;

pub const KEY_FLAG: u8 = 0x01;

/// One frame as read back out of a sealed block. `payload` borrows
/// directly from the mapped block — no copy.
#[derive(Debug, Clone, Copy)]
pub struct FrameRecord<'a> {
    pub ts: u64,
    pub flags: u8,
    pub stream_id: u8,
    pub payload: &'a [u8],
}

impl<'a> FrameRecord<'a> {
    pub fn is_key(&self) -> bool {
        self.flags & KEY_FLAG != 0
    }
}

/// The four codec-description strings carried at the tail of a block
/// (spec §6.2).
#[derive(Debug, Clone, Default)]
pub struct CodecMeta {
    pub video_codec_name: String,
    pub video_codec_parameters: String,
    pub audio_codec_name: String,
    pub audio_codec_parameters: String,
}

impl CodecMeta {
    fn strings(&self) -> [&str; 4] {
        [
            &self.video_codec_name,
            &self.video_codec_parameters,
            &self.audio_codec_name,
            &self.audio_codec_parameters,
        ]
    }

    fn encoded_len(&self) -> usize {
        self.strings().iter().map(|s| 2 + s.len()).sum()
    }
}

/// Tracks how much of a block has been packed so far, independent of any
/// particular borrow of the block's bytes — a [`crate::storage::block_store::BlockView`]
/// is only held for the duration of a single `push_frame`/`seal` call, so
/// this state has to outlive each individual borrow.
#[derive(Debug, Default)]
pub struct BlockCursor {
    cursor: usize,
    entries: Vec<(u32, u64, u8, u8)>,
}

impl BlockCursor {
    /// Start tracking a fresh (or about-to-be-overwritten) block; zeroes
    /// its tail-offset pointer.
    pub fn new(block: &mut [u8]) -> Self {
        block[0..4].copy_from_slice(&0u32.to_le_bytes());
        Self { cursor: FRAME_AREA_START, entries: Vec::new() }
    }

    /// Bytes of frame data written so far, excluding the 4-byte pointer.
    pub fn data_used(&self) -> usize {
        self.cursor - FRAME_AREA_START
    }

    pub fn frame_count(&self) -> usize {
        self.entries.len()
    }

    pub fn first_ts(&self) -> Option<u64> {
        self.entries.first().map(|e| e.1)
    }

    pub fn last_ts(&self) -> Option<u64> {
        self.entries.last().map(|e| e.1)
    }

    /// Whether a frame of `payload_len` would still fit ahead of the
    /// eventual tail table, assuming `meta`'s strings are final, within a
    /// block of `block_len` bytes.
    pub fn fits(&self, block_len: usize, payload_len: usize, meta: &CodecMeta) -> bool {
        let frame_need = FRAME_HEADER_LEN + payload_len;
        let tail_need = 4 + (self.entries.len() + 1) * TAIL_ENTRY_LEN + meta.encoded_len();
        self.cursor + frame_need + tail_need <= block_len
    }

    /// Append one frame into `block` at the current cursor. Caller must
    /// have checked `fits` first.
    pub fn push_frame(&mut self, block: &mut [u8], ts: u64, flags: u8, stream_id: u8, payload: &[u8]) -> Result<()> {
        let need = FRAME_HEADER_LEN + payload.len();
        if self.cursor + need > block.len() {
            return Err(RevereError::InvalidArgument(format!(
                "frame of {} bytes does not fit in remaining block space",
                payload.len()
            )));
        }
        let off = self.cursor;
        block[off..off + 8].copy_from_slice(&ts.to_le_bytes());
        block[off + 8] = flags;
        block[off + 9] = stream_id;
        block[off + 10..off + 14].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        block[off + 14..off + 14 + payload.len()].copy_from_slice(payload);
        self.entries.push((off as u32, ts, flags, stream_id));
        self.cursor += need;
        Ok(())
    }

    /// Write the trailing frame-index table, codec metadata, and the
    /// tail-offset pointer into `block`. Consumes the cursor: no more
    /// frames may be appended to a sealed block.
    pub fn seal(self, block: &mut [u8], meta: &CodecMeta) -> Result<()> {
        let table_len = 4 + self.entries.len() * TAIL_ENTRY_LEN + meta.encoded_len();
        if self.cursor + table_len > block.len() {
            return Err(RevereError::InvalidArgument(
                "trailing table does not fit after frame data".into(),
            ));
        }
        let tail_offset = block.len() - table_len;

        let mut w = tail_offset;
        block[w..w + 4].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        w += 4;
        for (off, ts, flags, stream_id) in &self.entries {
            block[w..w + 4].copy_from_slice(&off.to_le_bytes());
            block[w + 4..w + 12].copy_from_slice(&ts.to_le_bytes());
            block[w + 12] = *flags;
            block[w + 13] = *stream_id;
            w += TAIL_ENTRY_LEN;
        }
        for s in meta.strings() {
            let bytes = s.as_bytes();
            block[w..w + 2].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
            w += 2;
            block[w..w + bytes.len()].copy_from_slice(bytes);
            w += bytes.len();
        }
        debug_assert_eq!(w, block.len());

        block[0..4].copy_from_slice(&(tail_offset as u32).to_le_bytes());
        Ok(())
    }
}

/// Read back the trailing table and every frame of a sealed block. An
/// unsealed block (`tail_offset == 0`) yields an empty frame list and
/// default metadata.
pub fn frames_in_block(block: &[u8]) -> Result<(CodecMeta, Vec<FrameRecord<'_>>)> {
    let tail_offset = u32::from_le_bytes(block[0..4].try_into().unwrap()) as usize;
    if tail_offset == 0 {
        return Ok((CodecMeta::default(), Vec::new()));
    }
    if tail_offset >= block.len() {
        return Err(RevereError::InvalidArgument("corrupt block: tail_offset out of range".into()));
    }

    let mut r = tail_offset;
    let count = u32::from_le_bytes(block[r..r + 4].try_into().unwrap()) as usize;
    r += 4;

    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let off = u32::from_le_bytes(block[r..r + 4].try_into().unwrap()) as usize;
        let ts = u64::from_le_bytes(block[r + 4..r + 12].try_into().unwrap());
        let flags = block[r + 12];
        let stream_id = block[r + 13];
        r += TAIL_ENTRY_LEN;

        let size = u32::from_le_bytes(block[off + 10..off + 14].try_into().unwrap()) as usize;
        let payload = &block[off + FRAME_HEADER_LEN..off + FRAME_HEADER_LEN + size];
        frames.push(FrameRecord { ts, flags, stream_id, payload });
    }

    let mut strings = [String::new(), String::new(), String::new(), String::new()];
    for slot in strings.iter_mut() {
        let len = u16::from_le_bytes(block[r..r + 2].try_into().unwrap()) as usize;
        r += 2;
        *slot = String::from_utf8_lossy(&block[r..r + len]).into_owned();
        r += len;
    }
    let [video_codec_name, video_codec_parameters, audio_codec_name, audio_codec_parameters] = strings;

    Ok((
        CodecMeta { video_codec_name, video_codec_parameters, audio_codec_name, audio_codec_parameters },
        frames,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_frames_in_timestamp_order() {
        let mut block = vec![0u8; 4096];
        let meta = CodecMeta {
            video_codec_name: "h264".into(),
            video_codec_parameters: "profile=high".into(),
            audio_codec_name: String::new(),
            audio_codec_parameters: String::new(),
        };
        {
            let mut cursor = BlockCursor::new(&mut block);
            cursor.push_frame(&mut block, 1000, KEY_FLAG, 0, b"keyframe-bytes").unwrap();
            cursor.push_frame(&mut block, 2000, 0, 0, b"delta-bytes").unwrap();
            cursor.seal(&mut block, &meta).unwrap();
        }

        let (read_meta, frames) = frames_in_block(&block).unwrap();
        assert_eq!(read_meta.video_codec_name, "h264");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].ts, 1000);
        assert!(frames[0].is_key());
        assert_eq!(frames[0].payload, b"keyframe-bytes");
        assert_eq!(frames[1].ts, 2000);
        assert!(!frames[1].is_key());
        assert_eq!(frames[1].payload, b"delta-bytes");
    }

    #[test]
    fn unsealed_block_yields_no_frames() {
        let block = vec![0u8; 256];
        let (meta, frames) = frames_in_block(&block).unwrap();
        assert!(frames.is_empty());
        assert_eq!(meta.video_codec_name, "");
    }
}
