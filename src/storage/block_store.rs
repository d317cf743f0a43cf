// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Block store — opens the fixed-size per-camera storage file, performs
//! bounds-checked offset arithmetic, and hands out scoped, RAII-guarded
//! views over the dumbdex region and individual blocks (spec §4.1).
//!
//! The file never changes length after [`BlockStore::allocate`]. Reading a
//! block with no published dumbdex entry is the caller's mistake — the
//! store itself does not track which blocks are "live"; that's the
//! dumbdex's job (spec §4.2).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use memmap2::MmapMut;
use parking_lot::{Mutex, MutexGuard};
use tracing::info;

use crate::error::{RevereError, Result};
use crate::storage::dumbdex::{self, max_indexes_within};
use crate::storage::journal::{self, Journal};

pub const HEADER_SIZE: usize = 128;
const MAGIC: &[u8; 8] = b"RSTRG\0\0\0";
const VERSION: u32 = 1;

struct Header {
    block_size: u32,
    num_blocks: u32,
}

fn encode_header(block_size: u32, num_blocks: u32) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0..8].copy_from_slice(MAGIC);
    buf[8..12].copy_from_slice(&VERSION.to_le_bytes());
    buf[12..16].copy_from_slice(&block_size.to_le_bytes());
    buf[16..20].copy_from_slice(&num_blocks.to_le_bytes());
    buf
}

fn decode_header(buf: &[u8; HEADER_SIZE]) -> Result<Header> {
    if &buf[0..8] != MAGIC {
        return Err(RevereError::InvalidArgument(
            "storage file header magic mismatch".into(),
        ));
    }
    let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    if version != VERSION {
        return Err(RevereError::InvalidArgument(format!(
            "storage file version {version} unsupported (expected {VERSION})"
        )));
    }
    let block_size = u32::from_le_bytes(buf[12..16].try_into().unwrap());
    let num_blocks = u32::from_le_bytes(buf[16..20].try_into().unwrap());
    Ok(Header { block_size, num_blocks })
}

/// A scoped, bounds-checked view over one block-sized byte range of the
/// storage file's memory map. Released (mutex unlocked) on drop.
pub struct BlockView<'a> {
    guard: MutexGuard<'a, MmapMut>,
    offset: usize,
    len: usize,
}

impl<'a> BlockView<'a> {
    /// `fsync` exactly the bytes this view covers.
    pub fn flush(&self) -> Result<()> {
        self.guard.flush_range(self.offset, self.len)?;
        Ok(())
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Finish a journaled mutation of this view's byte range: `fsync`s the
    /// range this view covers (while still holding the lock) and deletes
    /// the journal, the actual commit point (spec §6.3).
    pub fn commit_journal(&self, journal: Journal) -> Result<()> {
        journal.commit(&self.guard, self.offset, self.len)
    }
}

impl<'a> std::ops::Deref for BlockView<'a> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.guard[self.offset..self.offset + self.len]
    }
}

impl<'a> std::ops::DerefMut for BlockView<'a> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard[self.offset..self.offset + self.len]
    }
}

/// A fixed-size, preallocated per-camera (or per-motion-event-stream)
/// storage file.
pub struct BlockStore {
    path: PathBuf,
    file: File,
    mmap: Mutex<MmapMut>,
    block_size: u32,
    num_blocks: u32,
}

impl BlockStore {
    /// One-shot allocation: writes the header, zeroes the dumbdex region,
    /// and leaves the data blocks untouched (spec §4.1).
    pub fn allocate(path: &Path, block_size: u32, num_blocks: u32) -> Result<()> {
        if path.exists() {
            return Err(RevereError::AlreadyExists(path.to_path_buf()));
        }
        if (num_blocks as u64) > max_indexes_within(block_size) {
            return Err(RevereError::InvalidArgument(format!(
                "num_blocks {num_blocks} exceeds max_indexes_within(block_size={block_size})"
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let total = HEADER_SIZE as u64
            + block_size as u64
            + block_size as u64 * num_blocks as u64;

        let mut file = File::create(path)?;
        file.set_len(total)?;
        file.write_all(&encode_header(block_size, num_blocks))?;
        // The freedex starts holding every block; the dumbdex index
        // starts empty.
        let mut dumbdex_region = vec![0u8; block_size as usize];
        dumbdex::init(&mut dumbdex_region, block_size, num_blocks);
        file.write_all(&dumbdex_region)?;
        file.flush()?;
        file.sync_all()?;

        info!(path = ?path, block_size, num_blocks, "Allocated storage file");
        Ok(())
    }

    /// Open an already-allocated storage file, replaying any crash
    /// journal left by an interrupted dumbdex mutation before handing out
    /// the memory map.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut hdr_buf = [0u8; HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut hdr_buf)?;
        let header = decode_header(&hdr_buf)?;

        let expected_len = HEADER_SIZE as u64
            + header.block_size as u64
            + header.block_size as u64 * header.num_blocks as u64;
        let actual_len = file.metadata()?.len();
        if actual_len != expected_len {
            return Err(RevereError::InvalidArgument(format!(
                "storage file {path:?} length {actual_len} != expected {expected_len}"
            )));
        }

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let recovered = journal::recover(
            path,
            &mut mmap[HEADER_SIZE..HEADER_SIZE + header.block_size as usize],
        )?;
        if recovered {
            mmap.flush_range(HEADER_SIZE, header.block_size as usize)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            mmap: Mutex::new(mmap),
            block_size: header.block_size,
            num_blocks: header.num_blocks,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    /// Scoped view over the dumbdex region (offset `HEADER_SIZE`, length
    /// `block_size`).
    pub fn dumbdex_region(&self) -> BlockView<'_> {
        let guard = self.mmap.lock();
        BlockView { guard, offset: HEADER_SIZE, len: self.block_size as usize }
    }

    fn block_offset(&self, idx: u16) -> usize {
        HEADER_SIZE + self.block_size as usize + idx as usize * self.block_size as usize
    }

    /// Scoped view over data block `idx`. Bounds-checked against
    /// `num_blocks`; does not check whether the block is currently
    /// published in the dumbdex (that is the caller's responsibility).
    pub fn block(&self, idx: u16) -> Result<BlockView<'_>> {
        if idx as u32 >= self.num_blocks {
            return Err(RevereError::InvalidArgument(format!(
                "block index {idx} out of range (num_blocks={})",
                self.num_blocks
            )));
        }
        let offset = self.block_offset(idx);
        let guard = self.mmap.lock();
        Ok(BlockView { guard, offset, len: self.block_size as usize })
    }

    /// Advisory shared lock across processes (spec §5): readers take this.
    pub fn lock_shared(&self) -> Result<()> {
        FileExt::lock_shared(&self.file)?;
        Ok(())
    }

    /// Advisory exclusive lock across processes (spec §5): the writer
    /// takes this.
    pub fn lock_exclusive(&self) -> Result<()> {
        FileExt::lock_exclusive(&self.file)?;
        Ok(())
    }

    pub fn unlock(&self) -> Result<()> {
        FileExt::unlock(&self.file)?;
        Ok(())
    }
}
