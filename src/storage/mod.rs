// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage subsystem — block store + dumbdex + framer + writer + reader.
//!
//! A per-camera storage file is a fixed-size, preallocated container
//! (spec §3.1/§6.1): a 128-byte header, one block-sized dumbdex region, and
//! `num_blocks` data blocks. Each block holds one GOP-aligned run of frames
//! from a single camera (spec §3.1/§6.2).

pub mod block_store;
pub mod dumbdex;
pub mod framer;
pub mod journal;
pub mod reader;
pub mod sizing;
pub mod writer;

pub use block_store::HEADER_SIZE;

/// Media kind carried by a frame. `All` is only meaningful as a query
/// filter, never as a frame's own `stream_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Video,
    Audio,
    All,
}

impl MediaType {
    /// Wire `stream_id` value (spec §3.1: `0 = video`, `1 = audio`).
    pub fn stream_id(self) -> Option<u8> {
        match self {
            MediaType::Video => Some(0),
            MediaType::Audio => Some(1),
            MediaType::All => None,
        }
    }

    pub fn from_stream_id(id: u8) -> Self {
        match id {
            0 => MediaType::Video,
            _ => MediaType::Audio,
        }
    }

    pub fn matches(self, stream_id: u8) -> bool {
        match self.stream_id() {
            Some(id) => id == stream_id,
            None => true,
        }
    }
}
