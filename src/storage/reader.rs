// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage reader — range and point queries over a block store, merging
//! video/audio streams in timestamp order (spec §4.5).

use serde::Serialize;

use crate::error::{RevereError, Result};
use crate::storage::block_store::BlockStore;
use crate::storage::dumbdex::Dumbdex;
use crate::storage::framer::{self, FrameRecord};
use crate::storage::MediaType;

/// One frame as handed back across the query boundary. Owns its payload
/// (unlike [`FrameRecord`], which borrows from the mapped block) since
/// the result outlives the block view it was read from.
#[derive(Debug, Clone, Serialize)]
pub struct QueryFrame {
    pub ts: u64,
    pub stream_id: u8,
    pub key: bool,
    pub data: Vec<u8>,
}

/// A time-ordered, merged result of a [`StorageReader::query`] call.
///
/// The source spec encodes this as an `r_blob_tree`; here it is a plain
/// serializable struct returned as JSON over the HTTP surface — a
/// deliberate, documented deviation (see DESIGN.md) rather than a
/// hand-rolled tree encoder.
#[derive(Debug, Clone, Serialize, Default)]
pub struct QueryResult {
    pub video_codec_name: String,
    pub video_codec_parameters: String,
    pub audio_codec_name: String,
    pub audio_codec_parameters: String,
    pub frames: Vec<QueryFrame>,
}

/// One contiguous run of playable coverage (spec §4.5.3).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Segment {
    pub start_ts: u64,
    pub end_ts: u64,
}

/// `(first_ts, last_ts)` of one indexed block (spec §4.5.3).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BlockSpan {
    pub first_ts: u64,
    pub last_ts: u64,
}

pub struct StorageReader<'a> {
    store: &'a BlockStore,
}

impl<'a> StorageReader<'a> {
    pub fn new(store: &'a BlockStore) -> Self {
        Self { store }
    }

    fn check_range(start_ts: u64, end_ts: u64) -> Result<()> {
        if start_ts > end_ts {
            return Err(RevereError::InvalidArgument(format!(
                "inverted range: start_ts {start_ts} > end_ts {end_ts}"
            )));
        }
        Ok(())
    }

    /// Every indexed block's `(first_ts, last_ts)`, in ascending order.
    fn block_spans(&self) -> Result<Vec<(u16, BlockSpan)>> {
        let dd = Dumbdex::new(self.store);
        let mut spans = Vec::new();
        for (_, blk) in dd.iter() {
            let view = self.store.block(blk)?;
            let (_, frames) = framer::frames_in_block(&view)?;
            if let (Some(first), Some(last)) = (frames.first(), frames.last()) {
                spans.push((blk, BlockSpan { first_ts: first.ts, last_ts: last.ts }));
            }
        }
        Ok(spans)
    }

    /// Largest key-frame timestamp `<= ts`, i.e. the block to start
    /// seeking from for a query beginning at `ts` (spec §4.5.1 step 1).
    fn lower_bound_key_block(&self, ts: u64) -> Option<u16> {
        let dd = Dumbdex::new(self.store);
        let entries = dd.iter();
        let pos = dd.lower_bound(ts);
        // lower_bound gives the first entry with ts' >= ts; the backing
        // block for `ts` is the one just before that, unless `ts` lands
        // exactly on an entry.
        if pos < entries.len() && entries[pos].0 == ts {
            Some(entries[pos].1)
        } else if pos > 0 {
            Some(entries[pos - 1].1)
        } else {
            None
        }
    }

    /// Range query: merged, time-ordered frames across every block whose
    /// coverage intersects `[start_ts, end_ts]` (spec §4.5.1).
    pub fn query(&self, media_type: MediaType, start_ts: u64, end_ts: u64) -> Result<QueryResult> {
        Self::check_range(start_ts, end_ts)?;
        let dd = Dumbdex::new(self.store);
        let entries = dd.iter();

        let start_blk = self.lower_bound_key_block(start_ts);
        let mut result = QueryResult::default();
        let mut seen_video_meta = false;
        let mut seen_audio_meta = false;

        let mut in_range = start_blk.is_none();
        for (ts, blk) in &entries {
            if !in_range {
                if Some(*blk) == start_blk {
                    in_range = true;
                } else {
                    continue;
                }
            }
            if *ts > end_ts {
                break;
            }
            let view = self.store.block(*blk)?;
            let (meta, frames) = framer::frames_in_block(&view)?;
            if !seen_video_meta && !meta.video_codec_name.is_empty() {
                result.video_codec_name = meta.video_codec_name.clone();
                result.video_codec_parameters = meta.video_codec_parameters.clone();
                seen_video_meta = true;
            }
            if !seen_audio_meta && !meta.audio_codec_name.is_empty() {
                result.audio_codec_name = meta.audio_codec_name.clone();
                result.audio_codec_parameters = meta.audio_codec_parameters.clone();
                seen_audio_meta = true;
            }
            for f in frames {
                if f.ts < start_ts || f.ts > end_ts {
                    continue;
                }
                if !media_type.matches(f.stream_id) {
                    continue;
                }
                result.frames.push(to_owned_frame(&f));
            }
        }
        Ok(result)
    }

    /// Single key frame at or before `ts` for `media_type` (spec §4.5.2).
    pub fn query_key(&self, media_type: MediaType, ts: u64) -> Result<QueryFrame> {
        let stream_id = media_type
            .stream_id()
            .ok_or_else(|| RevereError::InvalidArgument("query_key requires Video or Audio, not All".into()))?;

        let blk = self
            .lower_bound_key_block(ts)
            .ok_or_else(|| RevereError::NotFound(format!("no key frame at or before ts={ts}")))?;

        let dd = Dumbdex::new(self.store);
        let entries = dd.iter();
        let start = entries.iter().position(|(_, b)| *b == blk).unwrap_or(0);

        for (_, b) in entries[..=start].iter().rev() {
            let view = self.store.block(*b)?;
            let (_, frames) = framer::frames_in_block(&view)?;
            if let Some(f) = frames
                .into_iter()
                .filter(|f| f.stream_id == stream_id && f.is_key() && f.ts <= ts)
                .max_by_key(|f| f.ts)
            {
                return Ok(to_owned_frame(&f));
            }
        }
        Err(RevereError::NotFound(format!("no key frame at or before ts={ts}")))
    }

    /// Contiguous runs of playable coverage; two adjacent blocks join the
    /// same segment when the gap between them is under `gap_threshold_ns`
    /// (spec §4.5.3).
    pub fn query_segments(&self, start_ts: u64, end_ts: u64, gap_threshold_ns: u64) -> Result<Vec<Segment>> {
        Self::check_range(start_ts, end_ts)?;
        let spans = self.block_spans()?;
        let mut segments: Vec<Segment> = Vec::new();
        for (_, span) in spans {
            if span.last_ts < start_ts || span.first_ts > end_ts {
                continue;
            }
            match segments.last_mut() {
                Some(seg) if span.first_ts.saturating_sub(seg.end_ts) < gap_threshold_ns => {
                    seg.end_ts = span.last_ts.max(seg.end_ts);
                }
                _ => segments.push(Segment { start_ts: span.first_ts, end_ts: span.last_ts }),
            }
        }
        Ok(segments)
    }

    /// Every indexed block's `(first_ts, last_ts)` within `[start_ts, end_ts]`.
    pub fn query_blocks(&self, start_ts: u64, end_ts: u64) -> Result<Vec<BlockSpan>> {
        Self::check_range(start_ts, end_ts)?;
        Ok(self
            .block_spans()?
            .into_iter()
            .map(|(_, s)| s)
            .filter(|s| s.last_ts >= start_ts && s.first_ts <= end_ts)
            .collect())
    }

    /// Timestamps of every key frame of `media_type` within the range.
    pub fn key_frame_start_times(&self, media_type: MediaType, start_ts: u64, end_ts: u64) -> Result<Vec<u64>> {
        Self::check_range(start_ts, end_ts)?;
        let stream_id = media_type
            .stream_id()
            .ok_or_else(|| RevereError::InvalidArgument("key_frame_start_times requires Video or Audio".into()))?;
        let dd = Dumbdex::new(self.store);
        let mut out = Vec::new();
        for (ts, blk) in dd.iter() {
            if ts > end_ts {
                break;
            }
            let view = self.store.block(blk)?;
            let (_, frames) = framer::frames_in_block(&view)?;
            for f in frames {
                if f.stream_id == stream_id && f.is_key() && f.ts >= start_ts && f.ts <= end_ts {
                    out.push(f.ts);
                }
            }
        }
        Ok(out)
    }

    /// First timestamp in the store, or `None` if it holds no indexed
    /// blocks (spec §4.5.4).
    pub fn first_ts(&self) -> Result<Option<u64>> {
        let dd = Dumbdex::new(self.store);
        let Some((_, blk)) = dd.iter().into_iter().next() else { return Ok(None) };
        let view = self.store.block(blk)?;
        let (_, frames) = framer::frames_in_block(&view)?;
        Ok(frames.first().map(|f| f.ts))
    }

    pub fn last_ts(&self) -> Result<Option<u64>> {
        let dd = Dumbdex::new(self.store);
        let Some((_, blk)) = dd.iter().into_iter().next_back() else { return Ok(None) };
        let view = self.store.block(blk)?;
        let (_, frames) = framer::frames_in_block(&view)?;
        Ok(frames.last().map(|f| f.ts))
    }
}

fn to_owned_frame(f: &FrameRecord<'_>) -> QueryFrame {
    QueryFrame { ts: f.ts, stream_id: f.stream_id, key: f.is_key(), data: f.payload.to_vec() }
}
