// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Crash-safe mutation journal for the dumbdex region (spec §4.2, §6.3).
//!
//! Before any in-place byte range of the dumbdex is overwritten, the
//! pre-image is appended to a sidecar `<name>.journal` file. Once every
//! edit lands and the region is `fsync`ed, the journal is deleted — that
//! deletion, not the edit itself, is the commit point. If the process
//! dies mid-mutation, the journal survives and `recover` rolls the region
//! back to its pre-mutation state on next open. There is no roll-forward:
//! a crash always loses the in-flight mutation, never corrupts the region.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fs2::FileExt;
use memmap2::MmapMut;
use tracing::{info, warn};

use crate::error::Result;

fn journal_path_for(main_path: &Path) -> PathBuf {
    let mut s = main_path.as_os_str().to_os_string();
    s.push(".journal");
    PathBuf::from(s)
}

/// An open, exclusively-locked journal recording pre-images for one
/// dumbdex mutation. Dropped (without `commit`) if the caller bails out
/// early — the journal file is left behind and rolled back on next open.
pub struct Journal {
    file: File,
    path: PathBuf,
}

impl Journal {
    /// Open (create) the sidecar journal file for `main_path`, exclusively
    /// locked so no other writer can interleave mutations.
    pub fn begin(main_path: &Path) -> Result<Self> {
        let path = journal_path_for(main_path);
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self { file, path })
    }

    /// Append the current pre-image of `region[offset..offset+len]` before
    /// the caller overwrites it.
    pub fn record(&mut self, region: &[u8], offset: usize, len: usize) -> Result<()> {
        self.file.write_u32::<LittleEndian>(offset as u32)?;
        self.file.write_u32::<LittleEndian>(len as u32)?;
        self.file.write_all(&region[offset..offset + len])?;
        Ok(())
    }

    /// Finish the mutation: `fsync` the dumbdex range that was touched,
    /// then delete the journal. This is the commit point.
    pub fn commit(self, mmap: &MmapMut, region_offset: usize, region_len: usize) -> Result<()> {
        self.file.flush()?;
        mmap.flush_range(region_offset, region_len)?;
        let _ = FileExt::unlock(&self.file);
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Replay, in reverse, any journal left behind by a crashed mutation,
/// restoring `region` (the mapped dumbdex byte range) to its pre-mutation
/// state. No-op if no journal exists. Returns whether a recovery ran.
pub fn recover(main_path: &Path, region: &mut [u8]) -> Result<bool> {
    let path = journal_path_for(main_path);
    if !path.exists() {
        return Ok(false);
    }

    let mut f = File::open(&path)?;
    let mut records: Vec<(usize, Vec<u8>)> = Vec::new();
    loop {
        let offset = match f.read_u32::<LittleEndian>() {
            Ok(v) => v as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        let len = f.read_u32::<LittleEndian>()? as usize;
        let mut bytes = vec![0u8; len];
        f.read_exact(&mut bytes)?;
        records.push((offset, bytes));
    }

    warn!(path = ?path, records = records.len(), "Rolling back incomplete dumbdex mutation");
    for (offset, bytes) in records.into_iter().rev() {
        region[offset..offset + bytes.len()].copy_from_slice(&bytes);
    }

    std::fs::remove_file(&path)?;
    info!(path = ?main_path, "Dumbdex crash recovery complete");
    Ok(true)
}
