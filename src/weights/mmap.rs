//! Memory-mapped shard access.
//!
//! Shards are mapped read-only; tensor bytes are sliced out of the mapping and
//! copied exactly once, when they are converted to the compute precision.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Qwen2Error, Result};

/// A read-only memory-mapped file.
///
/// The mapped region remains valid for the lifetime of this struct.
pub struct MappedFile {
    mmap: Mmap,
}

impl MappedFile {
    /// Map a file into memory. I/O failures surface as [`Qwen2Error::Io`].
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;

        // Safety: checkpoint shards are treated as read-only and are not
        // modified while a load is in progress.
        let mmap = unsafe { Mmap::map(&file)? };

        Ok(MappedFile { mmap })
    }

    /// The full mapped data.
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// A subslice at the given offset and length.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len).filter(|&end| end <= self.mmap.len());
        match end {
            Some(end) => Ok(&self.mmap[offset..end]),
            None => Err(Qwen2Error::WeightLoad(format!(
                "slice at {offset} (+{len}) exceeds file size {}",
                self.mmap.len()
            ))),
        }
    }

    /// Total file size in bytes.
    pub fn size(&self) -> usize {
        self.mmap.len()
    }
}
